//! Secure channel with the card
//!
//! The host opens the channel with an ephemeral key against the card's
//! certified key, then proves possession of the derived keys through a
//! protected mutual authentication. Only an established [`SecureSession`]
//! can carry a PIN.

pub mod crypto;

use k256::{PublicKey, SecretKey, elliptic_curve::sec1::ToEncodedPoint};
use portier_apdu::prelude::*;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

pub use crypto::ChannelState;
use crypto::{BLOCK_SIZE, ChainingValue, Challenge};

use crate::{
    card::CardHandle,
    error::{ChannelError, Error, HandshakeError},
    pin::Pin,
};

pub(crate) const CLA_PROPRIETARY: u8 = 0x80;
pub(crate) const INS_OPEN_CHANNEL: u8 = 0x86;
pub(crate) const INS_MUTUAL_AUTHENTICATE: u8 = 0x11;
pub(crate) const INS_VERIFY: u8 = 0x20;
/// Reference of the user PIN
pub(crate) const P2_USER_PIN: u8 = 0x81;

const CHALLENGE_LEN: usize = 32;

/// Expected card response to the host challenge
pub fn authentication_cryptogram(
    card_challenge: &Challenge,
    host_challenge: &Challenge,
) -> [u8; 32] {
    Sha256::new()
        .chain_update(card_challenge)
        .chain_update(host_challenge)
        .finalize()
        .into()
}

/// Authenticated, encrypted channel bound to the card's verified key
///
/// Borrows the card for its whole life, so the channel state is gone before
/// the handle can be closed.
#[derive(Debug)]
pub struct SecureSession<'a> {
    card: &'a mut CardHandle,
    channel: ChannelState,
}

impl<'a> SecureSession<'a> {
    /// Open a channel with the card holding `card_key`
    ///
    /// Fails unless the card proves it derived the same session keys, which
    /// requires the private key matching its certificate.
    pub fn open(card: &'a mut CardHandle, card_key: &PublicKey) -> Result<Self, HandshakeError> {
        let ephemeral = SecretKey::random(&mut rand_v8::thread_rng());
        let point = ephemeral.public_key().to_encoded_point(false);

        let open = Command::new_with_data_and_le(
            CLA_PROPRIETARY,
            INS_OPEN_CHANNEL,
            0x00,
            0x00,
            point.as_bytes().to_vec(),
            0,
        );
        let response = card.send(&open, &[status::SUCCESS])?;

        let payload = response.payload();
        if payload.len() != CHALLENGE_LEN + BLOCK_SIZE {
            return Err(HandshakeError::MalformedResponse(
                "expected card challenge and chaining value",
            ));
        }
        let (challenge, iv) = payload.split_at(CHALLENGE_LEN);
        let card_challenge: Challenge = challenge
            .try_into()
            .map_err(|_| HandshakeError::MalformedResponse("bad challenge length"))?;
        let iv: ChainingValue = iv
            .try_into()
            .map_err(|_| HandshakeError::MalformedResponse("bad chaining value length"))?;

        let secret = crypto::shared_secret(&ephemeral, card_key);
        let mut session = Self {
            card,
            channel: ChannelState::derive(&secret, &card_challenge, &iv),
        };
        session.authenticate(&card_challenge)?;

        debug!(reader = session.card.reader_name(), "Secure channel established");
        Ok(session)
    }

    fn authenticate(&mut self, card_challenge: &Challenge) -> Result<(), HandshakeError> {
        let mut host_challenge = Challenge::default();
        rand::rng().fill_bytes(&mut host_challenge);

        let command = self.channel.protect_command(
            [CLA_PROPRIETARY, INS_MUTUAL_AUTHENTICATE, 0x00, 0x00],
            &host_challenge,
        );
        let response = self.card.transmit(&command)?;

        // A bare refusal carries no MAC to check
        if response.payload().is_empty() && !response.is_success() {
            return Err(HandshakeError::Rejected(response.status()));
        }

        let (status, cryptogram) = self
            .channel
            .unprotect_response(&response)
            .map_err(HandshakeError::Channel)?;
        if !status.is_success() {
            return Err(HandshakeError::Rejected(status));
        }

        let expected = authentication_cryptogram(card_challenge, &host_challenge);
        if cryptogram.as_slice() != expected.as_slice() {
            return Err(HandshakeError::CryptogramMismatch);
        }

        trace!("Mutual authentication succeeded");
        Ok(())
    }

    /// Verify the user PIN through the channel
    ///
    /// Only a status authenticated by the channel counts. A rejection maps
    /// to [`Error::PinMismatch`]; anything unauthenticated to
    /// [`Error::Channel`].
    pub fn verify_pin(&mut self, pin: &Pin) -> Result<(), Error> {
        let command = self
            .channel
            .protect_command([0x00, INS_VERIFY, 0x00, P2_USER_PIN], pin.as_bytes());
        let response = self.card.transmit(&command).map_err(ChannelError::from)?;

        let (status, _) = self.channel.unprotect_response(&response)?;
        if status.is_success() {
            debug!("PIN verified");
            Ok(())
        } else {
            debug!(%status, "PIN rejected");
            Err(Error::PinMismatch {
                retries: status.retries_remaining(),
            })
        }
    }
}
