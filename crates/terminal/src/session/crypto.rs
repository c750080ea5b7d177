//! Secure messaging primitives
//!
//! Session keys are derived from an ephemeral ECDH exchange and the card's
//! challenge:
//!
//! ```text
//! (K_enc | K_mac) = SHA-512(shared_secret | card_challenge)
//! ```
//!
//! Every protected message carries `MAC || AES-256-CBC(data)`. The MAC is an
//! AES CBC-MAC over a 16 byte header block followed by the ciphertext, and
//! becomes the chaining value used as IV for the next message in either
//! direction. Response headers include the status word, so a status cannot be
//! altered without breaking the MAC.

use std::fmt;

use aes::Aes256;
use cbc_mac::{CbcMac, Mac};
use cipher::{BlockDecryptMut, BlockEncryptMut, Iv, Key, KeyIvInit, block_padding::Iso7816};
use k256::{PublicKey, SecretKey, ecdh::SharedSecret};
use portier_apdu::{Command, Response, StatusWord};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::ChannelError;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;
type ChannelMac = CbcMac<Aes256>;

/// AES block and MAC length
pub const BLOCK_SIZE: usize = 16;

/// Card or host challenge
pub type Challenge = [u8; 32];

/// MAC chaining value
pub type ChainingValue = [u8; BLOCK_SIZE];

type ApduMeta = [u8; BLOCK_SIZE];

const META_COMMAND: u8 = 0x01;
const META_RESPONSE: u8 = 0x02;

/// ECDH shared secret between our key and the peer's
pub fn shared_secret(private: &SecretKey, public: &PublicKey) -> SharedSecret {
    k256::elliptic_curve::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine())
}

fn command_meta(header: [u8; 4], len: usize) -> ApduMeta {
    let mut meta = ApduMeta::default();
    meta[..4].copy_from_slice(&header);
    meta[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    meta[BLOCK_SIZE - 1] = META_COMMAND;
    meta
}

fn response_meta(len: usize, status: StatusWord) -> ApduMeta {
    let mut meta = ApduMeta::default();
    meta[..2].copy_from_slice(&(len as u16).to_be_bytes());
    meta[2..4].copy_from_slice(&status.to_bytes());
    meta[BLOCK_SIZE - 1] = META_RESPONSE;
    meta
}

/// Keys and chaining value of an established channel
///
/// Both ends hold one. The host calls [`protect_command`](Self::protect_command)
/// and [`unprotect_response`](Self::unprotect_response); the card side uses
/// the mirrored pair. Key material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelState {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    chaining: ChainingValue,
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelState([REDACTED])")
    }
}

impl ChannelState {
    /// Derive session keys from the shared secret and the card challenge
    pub fn derive(secret: &SharedSecret, challenge: &Challenge, iv: &ChainingValue) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(secret.raw_secret_bytes());
        hasher.update(challenge);

        let mut digest = Zeroizing::new([0u8; 64]);
        digest.copy_from_slice(&hasher.finalize());

        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        enc_key.copy_from_slice(&digest[..32]);
        mac_key.copy_from_slice(&digest[32..]);

        Self {
            enc_key,
            mac_key,
            chaining: *iv,
        }
    }

    /// Protect a command from the host
    pub fn protect_command(&mut self, header: [u8; 4], plaintext: &[u8]) -> Command {
        let ciphertext = self.encrypt(plaintext);
        let meta = command_meta(header, BLOCK_SIZE + ciphertext.len());
        let data = self.seal(&meta, &ciphertext);

        let [cla, ins, p1, p2] = header;
        Command::new_with_data_and_le(cla, ins, p1, p2, data, 0)
    }

    /// Authenticate and decrypt a response on the host
    ///
    /// The returned status word is covered by the MAC.
    pub fn unprotect_response(
        &mut self,
        response: &Response,
    ) -> Result<(StatusWord, Zeroizing<Vec<u8>>), ChannelError> {
        let status = response.status();
        let data = response.payload();
        let meta = response_meta(data.len(), status);
        let plaintext = self.open(&meta, data)?;
        Ok((status, plaintext))
    }

    /// Authenticate and decrypt a command on the card
    pub fn unprotect_command(
        &mut self,
        command: &Command,
    ) -> Result<Zeroizing<Vec<u8>>, ChannelError> {
        let data = command.data();
        let meta = command_meta(command.header(), data.len());
        self.open(&meta, data)
    }

    /// Protect a response from the card
    pub fn protect_response(&mut self, payload: &[u8], status: StatusWord) -> Response {
        let ciphertext = self.encrypt(payload);
        let meta = response_meta(BLOCK_SIZE + ciphertext.len(), status);
        Response::new(self.seal(&meta, &ciphertext), status)
    }

    fn seal(&mut self, meta: &ApduMeta, ciphertext: &[u8]) -> Vec<u8> {
        let mac = self.mac(meta, ciphertext).finalize().into_bytes();
        self.chaining.copy_from_slice(&mac);

        let mut data = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        data.extend_from_slice(&mac);
        data.extend_from_slice(ciphertext);
        data
    }

    fn open(&mut self, meta: &ApduMeta, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, ChannelError> {
        if data.len() < BLOCK_SIZE {
            return Err(ChannelError::MissingMac);
        }
        let (mac, ciphertext) = data.split_at(BLOCK_SIZE);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(ChannelError::Misaligned);
        }

        self.mac(meta, ciphertext)
            .verify_slice(mac)
            .map_err(|_| ChannelError::MacMismatch)?;

        // Decrypt under the previous chaining value, then advance
        let plaintext = self.decrypt(ciphertext)?;
        self.chaining.copy_from_slice(mac);
        Ok(plaintext)
    }

    fn mac(&self, meta: &ApduMeta, ciphertext: &[u8]) -> ChannelMac {
        let mut mac = <ChannelMac as Mac>::new(Key::<Aes256>::from_slice(&self.mac_key));
        mac.update(meta);
        mac.update(ciphertext);
        mac
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Encryptor::new(
            Key::<Aes256>::from_slice(&self.enc_key),
            Iv::<Encryptor>::from_slice(&self.chaining),
        )
        .encrypt_padded_vec_mut::<Iso7816>(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, ChannelError> {
        Decryptor::new(
            Key::<Aes256>::from_slice(&self.enc_key),
            Iv::<Decryptor>::from_slice(&self.chaining),
        )
        .decrypt_padded_vec_mut::<Iso7816>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ChannelError::Padding)
    }
}
