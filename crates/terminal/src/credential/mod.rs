//! Device credential: reading and validating the card's certificate chain

pub mod cvc;

use std::fmt;

use bytes::Bytes;
use iso7816_tlv::ber::Tlv;
use k256::PublicKey;
use portier_apdu::prelude::*;
use tracing::{debug, trace};

use crate::{
    card::CardHandle,
    error::{ChainReadError, ChainValidationError},
};

pub use cvc::CvcVerifier;

/// SmartCard-HSM application identifier
///
/// The access applet reuses this identifier and the SmartCard-HSM file layout.
/// Stock SmartCard-HSM cards select fine but are denied at the handshake.
pub const SC_HSM_AID: [u8; 11] = [
    0xE8, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x81, 0xC3, 0x1F, 0x02, 0x01,
];

/// Elementary file holding the device authentication certificates
pub const DEVICE_CERTIFICATE_FILE: u16 = 0x2F02;

/// Bytes requested per READ BINARY
pub const DEFAULT_CHUNK_SIZE: u8 = 200;

/// Upper bound on the credential object
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 64 * 1024;

pub(crate) const INS_SELECT: u8 = 0xA4;
pub(crate) const INS_READ_BINARY_ODD: u8 = 0xB1;
/// Offset data object carried in an odd READ BINARY
pub(crate) const TAG_OFFSET: u8 = 0x54;

/// Ordered certificates as stored on the card, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Bytes>,
}

impl CertificateChain {
    /// Split a credential object into its certificates
    ///
    /// The object is a concatenation of BER encoded CV certificates. Trailing
    /// `00` or `FF` filler after the last certificate is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, ChainReadError> {
        let mut certificates = Vec::new();
        let mut rest = raw;

        while !rest.is_empty() && !is_filler(rest) {
            let (tlv, remaining) = Tlv::parse(rest);
            let tlv = tlv.map_err(|_| ChainReadError::Malformed("undecodable TLV"))?;
            if !cvc::is_certificate(&tlv) {
                return Err(ChainReadError::Malformed("unexpected data object"));
            }
            let consumed = rest.len() - remaining.len();
            certificates.push(Bytes::copy_from_slice(&rest[..consumed]));
            rest = remaining;
        }

        if certificates.is_empty() {
            return Err(ChainReadError::Malformed("no certificates"));
        }
        Ok(Self { certificates })
    }

    /// Raw certificates, leaf first
    pub fn certificates(&self) -> &[Bytes] {
        &self.certificates
    }

    /// Number of certificates
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Whether the chain holds no certificates
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

fn is_filler(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0x00 || *b == 0xFF)
}

/// Fixed root of trust the chain must lead to
#[derive(Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    holder: String,
    public_key: PublicKey,
}

impl TrustAnchor {
    /// Create an anchor from its holder reference and public key
    pub fn new(holder: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            holder: holder.into(),
            public_key,
        }
    }

    /// Create an anchor from a SEC1 encoded public key
    pub fn from_sec1(
        holder: impl Into<String>,
        key: &[u8],
    ) -> Result<Self, k256::elliptic_curve::Error> {
        Ok(Self::new(holder, PublicKey::from_sec1_bytes(key)?))
    }

    /// Holder reference of the root certificate
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Root public key
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

/// Public key and identity path proven by a validated chain
///
/// Created only by a [`ChainVerifier`] and consumed by one evaluation.
pub struct VerifiedIdentity {
    public_key: PublicKey,
    path: String,
}

impl VerifiedIdentity {
    pub(crate) const fn new(public_key: PublicKey, path: String) -> Self {
        Self { public_key, path }
    }

    /// Leaf public key of the card
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Holder references from the anchor down to the card, `/root/ca/device`
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Checks a certificate chain against a trust anchor
pub trait ChainVerifier: Send + fmt::Debug {
    /// Validate `chain`, returning the identity it proves
    fn validate(
        &self,
        anchor: &TrustAnchor,
        chain: &CertificateChain,
    ) -> Result<VerifiedIdentity, ChainValidationError>;
}

/// Reads the device credential object from a card
#[derive(Debug, Clone)]
pub struct CredentialReader {
    aid: Option<Bytes>,
    file_id: u16,
    chunk_size: u8,
    max_size: usize,
}

impl Default for CredentialReader {
    fn default() -> Self {
        Self {
            aid: Some(Bytes::from_static(&SC_HSM_AID)),
            file_id: DEVICE_CERTIFICATE_FILE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl CredentialReader {
    /// Reader with SmartCard-HSM defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Select this application before reading, or none
    pub fn with_aid(mut self, aid: Option<Bytes>) -> Self {
        self.aid = aid;
        self
    }

    /// Read from a different file
    pub const fn with_file_id(mut self, file_id: u16) -> Self {
        self.file_id = file_id;
        self
    }

    /// Request `chunk_size` bytes per read; 0 asks for 256
    pub const fn with_chunk_size(mut self, chunk_size: u8) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Refuse objects larger than `max_size`
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Read the certificate chain and validate it against `anchor`
    pub fn read_and_validate(
        &self,
        card: &mut CardHandle,
        verifier: &dyn ChainVerifier,
        anchor: &TrustAnchor,
    ) -> crate::Result<VerifiedIdentity> {
        let chain = self.read(card)?;
        debug!(certificates = chain.len(), "Validating credential chain");
        Ok(verifier.validate(anchor, &chain)?)
    }

    /// Select the application and read the certificate chain
    pub fn read(&self, card: &mut CardHandle) -> Result<CertificateChain, ChainReadError> {
        if let Some(aid) = &self.aid {
            let select = Command::new_with_data(0x00, INS_SELECT, 0x04, 0x0C, aid.clone());
            card.send(&select, &[status::SUCCESS])
                .map_err(|e| match e.get_status_word() {
                    Some(sw) => ChainReadError::SelectRejected(StatusWord::from_u16(sw)),
                    None => ChainReadError::Transport(e),
                })?;
        }

        let object = self.read_object(card)?;
        debug!(len = object.len(), "Read credential object");
        CertificateChain::parse(&object)
    }

    /// Read the whole credential object in chunks
    ///
    /// Either an empty chunk or the end of file status ends the read.
    pub fn read_object(&self, card: &mut CardHandle) -> Result<Vec<u8>, ChainReadError> {
        let [p1, p2] = self.file_id.to_be_bytes();
        let mut object = Vec::new();

        loop {
            let offset = u16::try_from(object.len()).map_err(|_| ChainReadError::TooLarge {
                limit: self.max_size,
            })?;
            let [hi, lo] = offset.to_be_bytes();
            let read = Command::new_with_data_and_le(
                0x00,
                INS_READ_BINARY_ODD,
                p1,
                p2,
                vec![TAG_OFFSET, 0x02, hi, lo],
                self.chunk_size,
            );

            let response = card
                .send(&read, &[status::SUCCESS, status::END_OF_FILE])
                .map_err(|e| match e.get_status_word() {
                    Some(sw) => ChainReadError::UnexpectedStatus {
                        status: StatusWord::from_u16(sw),
                        offset: object.len(),
                    },
                    None => ChainReadError::Transport(e),
                })?;

            let chunk = response.payload();
            if object.len() + chunk.len() > self.max_size {
                return Err(ChainReadError::TooLarge {
                    limit: self.max_size,
                });
            }
            object.extend_from_slice(chunk);
            trace!(offset, len = chunk.len(), status = %response.status(), "Read credential chunk");

            if chunk.is_empty() || response.status().is_end_of_file() {
                break;
            }
        }

        if object.is_empty() {
            return Err(ChainReadError::Empty);
        }
        Ok(object)
    }
}
