//! Error types for PC/SC transport

use portier_apdu::TransportError;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// No readers available
    #[error("No readers available")]
    NoReadersAvailable,

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Card was removed
    #[error("Card was removed")]
    CardRemoved,
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::NoCard(_)
            | PcscError::Pcsc(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard) => {
                Self::NoCard
            }
            PcscError::CardRemoved | PcscError::Pcsc(pcsc::Error::ResetCard) => Self::CardRemoved,
            PcscError::Pcsc(pcsc::Error::Timeout) => Self::Timeout,
            PcscError::NoReadersAvailable | PcscError::ReaderNotFound(_) => Self::Connection,
            PcscError::Pcsc(e) => Self::device(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            TransportError::from(PcscError::NoCard("r".into())),
            TransportError::NoCard
        ));
        assert!(matches!(
            TransportError::from(PcscError::Pcsc(pcsc::Error::RemovedCard)),
            TransportError::NoCard
        ));
        assert!(matches!(
            TransportError::from(PcscError::CardRemoved),
            TransportError::CardRemoved
        ));
        assert!(matches!(
            TransportError::from(PcscError::Pcsc(pcsc::Error::Timeout)),
            TransportError::Timeout
        ));
        assert!(matches!(
            TransportError::from(PcscError::Pcsc(pcsc::Error::CommError)),
            TransportError::Device(_)
        ));
    }
}
