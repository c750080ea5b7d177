//! Virtual card and reader
//!
//! A software SmartCard-HSM that answers the terminal's commands: SELECT,
//! odd READ BINARY of the device certificate file, and the secure channel
//! with PIN verification. Faults can be switched on to exercise every denial
//! path. Used by the test suites and the `simulate` command.

use std::{fmt, sync::Arc, thread, time::Duration};

use bytes::Bytes;
use k256::{PublicKey, SecretKey};
use parking_lot::Mutex;
use portier_apdu::prelude::*;
use rand::RngCore;
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    credential::{
        DEVICE_CERTIFICATE_FILE, INS_READ_BINARY_ODD, INS_SELECT, SC_HSM_AID, TAG_OFFSET,
        TrustAnchor,
        cvc::{CertificateError, CvCertificate},
    },
    session::{
        CLA_PROPRIETARY, ChannelState, INS_MUTUAL_AUTHENTICATE, INS_OPEN_CHANNEL, INS_VERIFY,
        P2_USER_PIN, authentication_cryptogram,
        crypto::{self, ChainingValue, Challenge},
    },
};

/// PIN attempts before the card blocks
pub const DEFAULT_PIN_RETRIES: u8 = 3;

const ROOT_HOLDER: &str = "PTROOT00001";
const ISSUER_HOLDER: &str = "PTCA000001";

fn random_key() -> SecretKey {
    SecretKey::random(&mut rand_v8::thread_rng())
}

struct Issuer {
    key: SecretKey,
    holder: String,
    certificate: Bytes,
}

/// Throwaway PKI issuing virtual cards
pub struct VirtualPki {
    root: SecretKey,
    root_holder: String,
    issuer: Option<Issuer>,
}

impl fmt::Debug for VirtualPki {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPki")
            .field("root_holder", &self.root_holder)
            .field("issuer", &self.issuer.as_ref().map(|i| &i.holder))
            .finish_non_exhaustive()
    }
}

impl VirtualPki {
    /// Root and intermediate issuer with fresh keys
    pub fn generate() -> Result<Self, CertificateError> {
        let root = random_key();
        let issuer = random_key();
        let certificate =
            CvCertificate::issue(ROOT_HOLDER, ISSUER_HOLDER, &issuer.public_key(), &root)?;

        Ok(Self {
            root,
            root_holder: ROOT_HOLDER.into(),
            issuer: Some(Issuer {
                key: issuer,
                holder: ISSUER_HOLDER.into(),
                certificate,
            }),
        })
    }

    /// Root that signs device certificates itself
    pub fn direct() -> Self {
        Self {
            root: random_key(),
            root_holder: ROOT_HOLDER.into(),
            issuer: None,
        }
    }

    /// Anchor terminals should trust
    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor::new(self.root_holder.clone(), self.root.public_key())
    }

    /// Holder reference of the root
    pub fn root_holder(&self) -> &str {
        &self.root_holder
    }

    /// Holder reference signing device certificates
    pub fn issuer_holder(&self) -> &str {
        self.issuer
            .as_ref()
            .map_or(self.root_holder.as_str(), |issuer| issuer.holder.as_str())
    }

    /// Issue a card for `holder`
    ///
    /// The card stores its device certificate followed by the issuer's.
    pub fn issue_card(&self, holder: &str) -> Result<VirtualCard, CertificateError> {
        let key = random_key();
        let (signer, authority) = match &self.issuer {
            Some(issuer) => (&issuer.key, issuer.holder.as_str()),
            None => (&self.root, self.root_holder.as_str()),
        };

        let mut object =
            CvCertificate::issue(authority, holder, &key.public_key(), signer)?.to_vec();
        if let Some(issuer) = &self.issuer {
            object.extend_from_slice(&issuer.certificate);
        }
        Ok(VirtualCard::new(key, object))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    fail_handshake: bool,
    no_secure_channel: bool,
    tamper_pin_response: bool,
    stall: Option<(u8, Duration)>,
}

struct CardState {
    key: SecretKey,
    object: Vec<u8>,
    aid: Vec<u8>,
    pin: Option<Zeroizing<Vec<u8>>>,
    retries: u8,
    chunk_limit: usize,
    end_of_file_status: bool,
    faults: Faults,
    channel: Option<ChannelState>,
    pending_challenge: Option<Challenge>,
    authenticated: bool,
    commands: Vec<Command>,
}

impl fmt::Debug for CardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardState")
            .field("object_len", &self.object.len())
            .field("retries", &self.retries)
            .field("chunk_limit", &self.chunk_limit)
            .field("faults", &self.faults)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl CardState {
    fn process(&mut self, raw: &[u8]) -> Response {
        let Ok(command) = Command::from_bytes(raw) else {
            return Response::status_only(status::WRONG_LENGTH);
        };
        self.commands.push(command.clone());

        match (command.cla, command.ins) {
            (0x00, INS_SELECT) => self.select(&command),
            (0x00, INS_READ_BINARY_ODD) => self.read_binary(&command),
            (CLA_PROPRIETARY, _) if self.faults.no_secure_channel => {
                Response::status_only(status::INVALID_INSTRUCTION)
            }
            (CLA_PROPRIETARY, INS_OPEN_CHANNEL) => self.open_channel(&command),
            (CLA_PROPRIETARY, INS_MUTUAL_AUTHENTICATE) => self.mutually_authenticate(&command),
            (0x00, INS_VERIFY) => self.verify(&command),
            (0x00 | CLA_PROPRIETARY, _) => Response::status_only(status::INVALID_INSTRUCTION),
            _ => Response::status_only(status::CLASS_NOT_SUPPORTED),
        }
    }

    fn close_channel(&mut self) {
        self.channel = None;
        self.pending_challenge = None;
        self.authenticated = false;
    }

    fn select(&mut self, command: &Command) -> Response {
        self.close_channel();
        if command.p1 != 0x04 {
            return Response::status_only(status::INCORRECT_P1P2);
        }
        if command.data() == self.aid.as_slice() {
            Response::status_only(status::SUCCESS)
        } else {
            Response::status_only(status::FILE_NOT_FOUND)
        }
    }

    fn read_binary(&self, command: &Command) -> Response {
        if u16::from_be_bytes([command.p1, command.p2]) != DEVICE_CERTIFICATE_FILE {
            return Response::status_only(status::FILE_NOT_FOUND);
        }
        let &[TAG_OFFSET, 0x02, hi, lo] = command.data() else {
            return Response::status_only(status::WRONG_LENGTH);
        };

        let offset = usize::from(u16::from_be_bytes([hi, lo]));
        if offset >= self.object.len() {
            return Response::status_only(status::SUCCESS);
        }

        let requested = match command.le {
            None | Some(0) => 256,
            Some(le) => usize::from(le),
        };
        let len = requested
            .min(self.chunk_limit)
            .min(self.object.len() - offset);
        let end = offset + len;

        let status = if end == self.object.len() && self.end_of_file_status {
            status::END_OF_FILE
        } else {
            status::SUCCESS
        };
        Response::new(self.object[offset..end].to_vec(), status)
    }

    fn open_channel(&mut self, command: &Command) -> Response {
        self.close_channel();
        if self.faults.fail_handshake {
            return Response::status_only(status::CONDITIONS_NOT_SATISFIED);
        }
        let Ok(host_key) = PublicKey::from_sec1_bytes(command.data()) else {
            return Response::status_only(status::WRONG_LENGTH);
        };

        let mut challenge = Challenge::default();
        let mut iv = ChainingValue::default();
        rand::rng().fill_bytes(&mut challenge);
        rand::rng().fill_bytes(&mut iv);

        let secret = crypto::shared_secret(&self.key, &host_key);
        self.channel = Some(ChannelState::derive(&secret, &challenge, &iv));
        self.pending_challenge = Some(challenge);

        let mut payload = challenge.to_vec();
        payload.extend_from_slice(&iv);
        Response::success(payload)
    }

    fn mutually_authenticate(&mut self, command: &Command) -> Response {
        let (Some(channel), Some(card_challenge)) =
            (self.channel.as_mut(), self.pending_challenge.take())
        else {
            return Response::status_only(status::CONDITIONS_NOT_SATISFIED);
        };

        let Ok(host_challenge) = channel.unprotect_command(command) else {
            self.close_channel();
            return Response::status_only(status::SM_DATA_INCORRECT);
        };
        let Ok(host_challenge) = Challenge::try_from(host_challenge.as_slice()) else {
            self.close_channel();
            return Response::status_only(status::WRONG_LENGTH);
        };

        let cryptogram = authentication_cryptogram(&card_challenge, &host_challenge);
        let response = channel.protect_response(&cryptogram, status::SUCCESS);
        self.authenticated = true;
        response
    }

    fn verify(&mut self, command: &Command) -> Response {
        if command.p2 != P2_USER_PIN {
            return Response::status_only(status::INCORRECT_P1P2);
        }
        let (Some(channel), true) = (self.channel.as_mut(), self.authenticated) else {
            return Response::status_only(status::CONDITIONS_NOT_SATISFIED);
        };
        let Ok(pin) = channel.unprotect_command(command) else {
            self.close_channel();
            return Response::status_only(status::SM_DATA_INCORRECT);
        };

        let status = match &self.pin {
            None => status::CONDITIONS_NOT_SATISFIED,
            Some(_) if self.retries == 0 => status::AUTH_METHOD_BLOCKED,
            Some(expected) if expected.as_slice() == pin.as_slice() => {
                self.retries = DEFAULT_PIN_RETRIES;
                status::SUCCESS
            }
            Some(_) => {
                self.retries -= 1;
                status::retries(self.retries)
            }
        };

        let mut response = channel.protect_response(&[], status);
        if self.faults.tamper_pin_response {
            let mut data = response.payload().to_vec();
            if let Some(byte) = data.first_mut() {
                *byte ^= 0x01;
            }
            response = Response::new(data, status);
        }
        response
    }
}

/// A virtual SmartCard-HSM
///
/// Clones share the same card, so a test can inspect it while a reader or
/// transport holds another handle.
#[derive(Debug, Clone)]
pub struct VirtualCard {
    state: Arc<Mutex<CardState>>,
}

impl VirtualCard {
    /// Card holding `key` and the credential `object`
    pub fn new(key: SecretKey, object: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                key,
                object,
                aid: SC_HSM_AID.to_vec(),
                pin: None,
                retries: DEFAULT_PIN_RETRIES,
                chunk_limit: 256,
                end_of_file_status: false,
                faults: Faults::default(),
                channel: None,
                pending_challenge: None,
                authenticated: false,
                commands: Vec::new(),
            })),
        }
    }

    /// Card with a random key serving an arbitrary object
    pub fn with_object(object: Vec<u8>) -> Self {
        Self::new(random_key(), object)
    }

    /// Require `pin` for verification
    pub fn with_pin(self, pin: &str) -> Self {
        self.state.lock().pin = Some(Zeroizing::new(pin.as_bytes().to_vec()));
        self
    }

    /// Return at most `limit` bytes per read
    pub fn with_chunk_limit(self, limit: usize) -> Self {
        self.state.lock().chunk_limit = limit;
        self
    }

    /// Answer the read reaching the end of the object with `62 82`
    pub fn with_end_of_file_status(self) -> Self {
        self.state.lock().end_of_file_status = true;
        self
    }

    /// Pad the object with `FF` up to `len` bytes
    pub fn with_padding_to(self, len: usize) -> Self {
        {
            let mut state = self.state.lock();
            if state.object.len() < len {
                state.object.resize(len, 0xFF);
            }
        }
        self
    }

    /// Respond to a different application identifier
    pub fn with_aid(self, aid: &[u8]) -> Self {
        self.state.lock().aid = aid.to_vec();
        self
    }

    /// Swap the private key, as a copied certificate without its key would
    pub fn with_foreign_key(self) -> Self {
        self.state.lock().key = random_key();
        self
    }

    /// Refuse to open the secure channel
    pub fn failing_handshake(self) -> Self {
        self.state.lock().faults.fail_handshake = true;
        self
    }

    /// Answer only the standard file commands, as a stock applet without the
    /// access secure channel would
    pub fn without_secure_channel(self) -> Self {
        self.state.lock().faults.no_secure_channel = true;
        self
    }

    /// Corrupt the MAC of every PIN verification response
    pub fn tampering_pin_response(self) -> Self {
        self.state.lock().faults.tamper_pin_response = true;
        self
    }

    /// Delay the answer to instruction `ins`
    pub fn stalling_on(self, ins: u8, delay: Duration) -> Self {
        self.state.lock().faults.stall = Some((ins, delay));
        self
    }

    /// The credential object as stored
    pub fn object(&self) -> Vec<u8> {
        self.state.lock().object.clone()
    }

    /// Remaining PIN attempts
    pub fn retries(&self) -> u8 {
        self.state.lock().retries
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Forget the received commands
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// A transport talking directly to this card
    pub fn transport(&self) -> VirtualTransport {
        VirtualTransport {
            card: self.clone(),
            slot: None,
            used: false,
        }
    }

    fn process(&self, raw: &[u8]) -> Response {
        let stall = self
            .state
            .lock()
            .faults
            .stall
            .filter(|(ins, _)| raw.get(1) == Some(ins))
            .map(|(_, delay)| delay);
        if let Some(delay) = stall {
            thread::sleep(delay);
        }

        let response = self.state.lock().process(raw);
        trace!(
            status = %response.status(),
            len = response.payload().len(),
            "Virtual card response"
        );
        response
    }

    fn reset(&self) {
        self.state.lock().close_channel();
    }
}

#[derive(Debug, Default)]
struct Slot {
    card: Option<VirtualCard>,
    generation: u64,
    connects: usize,
    failing_connects: usize,
    eject_after_use: bool,
}

/// Virtual reader with a single slot
#[derive(Debug, Clone)]
pub struct VirtualReader {
    name: String,
    slot: Arc<Mutex<Slot>>,
}

impl VirtualReader {
    /// Empty reader
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::default(),
        }
    }

    /// Take the card out as soon as a session that talked to it ends
    pub fn with_eject_after_use(self) -> Self {
        self.slot.lock().eject_after_use = true;
        self
    }

    /// Fail the next `count` connection attempts with a transmission error
    pub fn failing_connects(self, count: usize) -> Self {
        self.slot.lock().failing_connects = count;
        self
    }

    /// Put `card` in the slot, replacing any card there
    pub fn insert(&self, card: VirtualCard) {
        let mut slot = self.slot.lock();
        slot.card = Some(card);
        slot.generation += 1;
    }

    /// Take the card out
    pub fn remove(&self) -> Option<VirtualCard> {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.card.take()
    }

    /// Whether a card is in the slot
    pub fn has_card(&self) -> bool {
        self.slot.lock().card.is_some()
    }

    /// Number of connection attempts so far
    pub fn connect_attempts(&self) -> usize {
        self.slot.lock().connects
    }
}

impl CardReader for VirtualReader {
    type Transport = VirtualTransport;

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<Self::Transport, TransportError> {
        let mut slot = self.slot.lock();
        slot.connects += 1;
        if slot.failing_connects > 0 {
            slot.failing_connects -= 1;
            return Err(TransportError::Transmission);
        }
        let card = slot.card.clone().ok_or(TransportError::NoCard)?;
        Ok(VirtualTransport {
            card,
            slot: Some((self.slot.clone(), slot.generation)),
            used: false,
        })
    }
}

/// Connection to a virtual card
#[derive(Debug)]
pub struct VirtualTransport {
    card: VirtualCard,
    slot: Option<(Arc<Mutex<Slot>>, u64)>,
    used: bool,
}

impl VirtualTransport {
    fn present(&self) -> bool {
        self.slot
            .as_ref()
            .is_none_or(|(slot, generation)| slot.lock().generation == *generation)
    }
}

impl CardTransport for VirtualTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if !self.present() {
            return Err(TransportError::CardRemoved);
        }
        self.used = true;
        Ok(self.card.process(command).to_bytes())
    }

    fn is_connected(&self) -> bool {
        self.present()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if !self.present() {
            return Err(TransportError::CardRemoved);
        }
        self.card.reset();
        Ok(())
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        if !self.used {
            return;
        }
        if let Some((slot, generation)) = &self.slot {
            let mut slot = slot.lock();
            if slot.eject_after_use && slot.generation == *generation {
                slot.card = None;
                slot.generation += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(transport: &mut VirtualTransport, command: &Command) -> Response {
        Response::from_bytes(&transport.transmit_raw(&command.to_bytes()).unwrap()).unwrap()
    }

    fn read(offset: u16, le: u8) -> Command {
        let [hi, lo] = offset.to_be_bytes();
        Command::new_with_data_and_le(0x00, 0xB1, 0x2F, 0x02, vec![0x54, 0x02, hi, lo], le)
    }

    #[test]
    fn test_select() {
        let card = VirtualCard::with_object(vec![0x01; 10]);
        let mut transport = card.transport();

        let select = Command::new_with_data(0x00, 0xA4, 0x04, 0x0C, SC_HSM_AID.to_vec());
        assert_eq!(send(&mut transport, &select).status(), status::SUCCESS);

        let other = Command::new_with_data(0x00, 0xA4, 0x04, 0x0C, vec![0xA0, 0x00]);
        assert_eq!(send(&mut transport, &other).status(), status::FILE_NOT_FOUND);
        assert_eq!(card.commands().len(), 2);
    }

    #[test]
    fn test_read_binary_chunks() {
        let object: Vec<u8> = (0..=255).collect();
        let card = VirtualCard::with_object(object.clone())
            .with_chunk_limit(100)
            .with_end_of_file_status();
        let mut transport = card.transport();

        let first = send(&mut transport, &read(0, 200));
        assert_eq!(first.payload().as_ref(), &object[..100]);
        assert_eq!(first.status(), status::SUCCESS);

        let last = send(&mut transport, &read(200, 200));
        assert_eq!(last.payload().as_ref(), &object[200..]);
        assert_eq!(last.status(), status::END_OF_FILE);

        let past = send(&mut transport, &read(256, 200));
        assert!(past.payload().is_empty());
        assert_eq!(past.status(), status::SUCCESS);
    }

    #[test]
    fn test_verify_requires_channel() {
        let card = VirtualCard::with_object(vec![0x01]).with_pin("1234");
        let mut transport = card.transport();

        let verify = Command::new_with_data(0x00, 0x20, 0x00, 0x81, b"1234".to_vec());
        assert_eq!(
            send(&mut transport, &verify).status(),
            status::CONDITIONS_NOT_SATISFIED
        );
        assert_eq!(card.retries(), DEFAULT_PIN_RETRIES);
    }

    #[test]
    fn test_reader_slot() {
        let mut reader = VirtualReader::new("virtual");
        assert!(matches!(reader.connect(), Err(TransportError::NoCard)));

        let card = VirtualCard::with_object(vec![0x01]);
        reader.insert(card);
        let mut transport = reader.connect().unwrap();
        assert!(transport.is_connected());

        reader.remove();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.transmit_raw(&read(0, 10).to_bytes()),
            Err(TransportError::CardRemoved)
        ));
        assert_eq!(reader.connect_attempts(), 2);
    }

    #[test]
    fn test_eject_after_use() {
        let mut reader = VirtualReader::new("virtual").with_eject_after_use();
        reader.insert(VirtualCard::with_object(vec![0x01]));

        // A probe that sends nothing leaves the card in place
        drop(reader.connect().unwrap());
        assert!(reader.has_card());

        let mut transport = reader.connect().unwrap();
        send(&mut transport, &read(0, 10));
        drop(transport);
        assert!(!reader.has_card());
    }
}
