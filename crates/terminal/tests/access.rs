//! Access decisions against the virtual card

mod common;

use std::time::Duration;

use portier_apdu::{Command, TransportError, response::status::common as status};
use portier_terminal::{
    AccessDecision, CertificateChain, CredentialReader, DenialCause, FixedPin, IndicatorState,
    Pin, RecordingIndicator, Stage,
    emulator::{VirtualCard, VirtualPki},
};

use common::{capture_logs, contains, engine, open, open_with_timeout};

const DENIED: [IndicatorState; 4] = [
    IndicatorState::Off,
    IndicatorState::Red,
    IndicatorState::Off,
    IndicatorState::Red,
];

const INS_READ_BINARY: u8 = 0xB1;
const INS_VERIFY: u8 = 0x20;

fn pin(pin: &str) -> FixedPin {
    FixedPin::new(Pin::try_from(pin).unwrap())
}

#[test]
fn test_malformed_chains_are_denied() {
    let pki = VirtualPki::generate().unwrap();
    let valid = pki.issue_card("PTDEV00001").unwrap().object();

    let objects = vec![
        vec![0xFF; 40],
        vec![0x7F, 0x21, 0x82, 0x10, 0x00],
        vec![0x30, 0x03, 0x01, 0x02, 0x03],
        valid[..valid.len() / 2].to_vec(),
        valid[..valid.len() - 1].to_vec(),
        (0..=255u8).rev().collect(),
    ];

    for object in objects {
        let card = VirtualCard::with_object(object);
        let indicator = RecordingIndicator::new();

        let assessment = engine(&pki, &indicator).assess(&mut open(&card));
        assert_eq!(assessment.decision, AccessDecision::Denied);
        assert_eq!(assessment.reached, Stage::Start);
        assert_eq!(indicator.history(), DENIED.to_vec());
    }
}

#[test]
fn test_correct_pin_is_granted() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00002").unwrap().with_pin("1234");
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin("1234"));

    assert_eq!(engine.evaluate(&mut open(&card)), AccessDecision::Granted);
    assert_eq!(indicator.history(), vec![IndicatorState::Green]);
}

#[test]
fn test_empty_pin_skips_verification() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00003").unwrap().with_pin("1234");
    let indicator = RecordingIndicator::new();
    let mut engine =
        engine(&pki, &indicator).with_pin_source(FixedPin::new(Pin::empty()));

    assert_eq!(engine.evaluate(&mut open(&card)), AccessDecision::Granted);
    assert!(card.commands().iter().all(|command| command.ins != INS_VERIFY));
    assert_eq!(indicator.current(), Some(IndicatorState::Green));
}

#[test]
fn test_wrong_pin_never_leaks() {
    const WRONG_PIN: &str = "5820391746";

    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00004").unwrap().with_pin("9876");
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin(WRONG_PIN));

    let (assessment, logs) = capture_logs(|| engine.assess(&mut open(&card)));

    assert_eq!(assessment.decision, AccessDecision::Denied);
    assert_eq!(assessment.cause, Some(DenialCause::PinMismatch));
    assert_eq!(card.retries(), 2);

    assert!(logs.contains("Access denied"));
    assert!(!logs.contains(WRONG_PIN));
    assert!(!logs.to_lowercase().contains(&hex::encode(WRONG_PIN)));
    for command in card.commands() {
        assert!(
            !contains(&command.to_bytes(), WRONG_PIN.as_bytes()),
            "PIN sent in clear: {command}"
        );
    }
}

#[test]
fn test_repeated_evaluations_are_stable() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00005").unwrap().with_pin("1234");
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin("1234"));

    for _ in 0..5 {
        assert_eq!(engine.evaluate(&mut open(&card)), AccessDecision::Granted);
    }
    assert_eq!(indicator.history(), vec![IndicatorState::Green; 5]);
}

#[test]
fn test_tampered_response_is_a_channel_failure() {
    let pki = VirtualPki::generate().unwrap();

    // Right PIN, but the card's answer does not authenticate
    let tampered = pki.issue_card("PTDEV00006").unwrap().with_pin("1234").tampering_pin_response();
    let tampered_indicator = RecordingIndicator::new();
    let mut tampered_engine =
        engine(&pki, &tampered_indicator).with_pin_source(pin("1234"));

    for _ in 0..3 {
        let (assessment, logs) = capture_logs(|| tampered_engine.assess(&mut open(&tampered)));
        assert_eq!(assessment.decision, AccessDecision::Denied);
        assert_eq!(assessment.cause, Some(DenialCause::Channel));
        assert!(logs.contains("cause=channel"));
    }

    // Wrong PIN over an intact channel
    let mismatch = pki.issue_card("PTDEV00007").unwrap().with_pin("9876");
    let mismatch_indicator = RecordingIndicator::new();
    let mut mismatch_engine =
        engine(&pki, &mismatch_indicator).with_pin_source(pin("1234"));

    let (assessment, logs) = capture_logs(|| mismatch_engine.assess(&mut open(&mismatch)));
    assert_eq!(assessment.cause, Some(DenialCause::PinMismatch));
    assert!(logs.contains("cause=pin-mismatch"));

    // Both look the same from outside
    let per_denial = &tampered_indicator.history()[..DENIED.len()];
    assert_eq!(per_denial, mismatch_indicator.history().as_slice());
    assert_eq!(tampered_indicator.history().len(), 3 * DENIED.len());
}

#[test]
fn test_chunked_reads_reassemble_the_object() {
    let object: Vec<u8> = (0..170).map(|i| i as u8).collect();

    for (chunk_size, chunks) in [(170u8, 1usize), (85, 2), (10, 17)] {
        // Terminated by an empty chunk
        let card = VirtualCard::with_object(object.clone());
        let reader = CredentialReader::new().with_chunk_size(chunk_size);
        assert_eq!(reader.read_object(&mut open(&card)).unwrap(), object);
        assert_eq!(card.commands().len(), chunks + 1);

        // Terminated by the end of file status, without an extra read
        let card = VirtualCard::with_object(object.clone()).with_end_of_file_status();
        assert_eq!(reader.read_object(&mut open(&card)).unwrap(), object);
        assert_eq!(card.commands().len(), chunks);
    }
}

#[test]
fn test_half_and_half_scenario() {
    let pki = VirtualPki::direct();
    let card = pki
        .issue_card("PTDEV00008")
        .unwrap()
        .with_padding_to(256)
        .with_chunk_limit(128)
        .with_pin("1234");
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin("1234"));

    let assessment = engine.assess(&mut open(&card));
    assert_eq!(assessment.decision, AccessDecision::Granted);
    assert_eq!(assessment.identity_path.as_deref(), Some("/PTROOT00001/PTDEV00008"));
    assert_eq!(indicator.history(), vec![IndicatorState::Green]);

    // 128, 128, then an empty chunk
    let reads = card
        .commands()
        .iter()
        .filter(|command| command.ins == INS_READ_BINARY)
        .count();
    assert_eq!(reads, 3);
}

#[test]
fn test_handshake_failure_scenario() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00009").unwrap().with_pin("1234").failing_handshake();
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin("1234"));

    let assessment = engine.assess(&mut open(&card));
    assert_eq!(assessment.decision, AccessDecision::Denied);
    assert_eq!(assessment.cause, Some(DenialCause::Handshake));
    assert_eq!(assessment.reached, Stage::ChainValid);
    assert_eq!(indicator.history(), DENIED.to_vec());
    assert_eq!(indicator.current(), Some(IndicatorState::Red));
}

#[test]
fn test_copied_certificate_fails_handshake() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00010").unwrap().with_foreign_key();
    let indicator = RecordingIndicator::new();

    let assessment = engine(&pki, &indicator).assess(&mut open(&card));
    assert_eq!(assessment.decision, AccessDecision::Denied);
    assert_eq!(assessment.cause, Some(DenialCause::Handshake));
}

#[test]
fn test_card_without_access_applet_is_denied() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00014").unwrap().without_secure_channel();
    let indicator = RecordingIndicator::new();

    let (assessment, logs) = capture_logs(|| engine(&pki, &indicator).assess(&mut open(&card)));
    assert_eq!(assessment.decision, AccessDecision::Denied);
    assert_eq!(assessment.cause, Some(DenialCause::Handshake));
    assert_eq!(assessment.reached, Stage::ChainValid);
    assert_eq!(indicator.history(), DENIED.to_vec());

    // 6D00 is an error status
    assert!(
        logs.lines()
            .any(|line| line.contains("WARN") && line.contains("Unexpected status word"))
    );
}

#[test]
fn test_unexpected_warning_status_logs_at_info() {
    let card = VirtualCard::with_object(vec![0x01; 10]).with_end_of_file_status();
    let mut handle = open(&card);
    let read = Command::new_with_data_and_le(0x00, 0xB1, 0x2F, 0x02, vec![0x54, 0x02, 0, 0], 0);

    let (result, logs) = capture_logs(|| handle.send(&read, &[status::SUCCESS]));
    assert!(matches!(result, Err(TransportError::StatusWord(0x6282))));

    let line = logs
        .lines()
        .find(|line| line.contains("Unexpected status word"))
        .unwrap();
    assert!(line.contains("INFO"));
    assert!(!line.contains("WARN"));
}

#[test]
fn test_forged_signature_is_rejected() {
    let pki = VirtualPki::generate().unwrap();
    let mut object = pki.issue_card("PTDEV00011").unwrap().object();
    let device_len = CertificateChain::parse(&object).unwrap().certificates()[0].len();
    object[device_len - 1] ^= 0x01;

    let card = VirtualCard::with_object(object);
    let indicator = RecordingIndicator::new();
    let assessment = engine(&pki, &indicator).assess(&mut open(&card));
    assert_eq!(assessment.cause, Some(DenialCause::ChainValidation));
    assert_eq!(assessment.reached, Stage::ChainRead);
}

#[test]
fn test_untrusted_anchor_is_rejected() {
    let pki = VirtualPki::generate().unwrap();
    let stranger = VirtualPki::generate().unwrap();
    let card = stranger.issue_card("PTDEV00012").unwrap();
    let indicator = RecordingIndicator::new();

    let assessment = engine(&pki, &indicator).assess(&mut open(&card));
    assert_eq!(assessment.cause, Some(DenialCause::ChainValidation));
}

#[test]
fn test_oversize_object_is_rejected() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00013").unwrap();
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator)
        .with_credential_reader(CredentialReader::new().with_max_size(256));

    let assessment = engine.assess(&mut open(&card));
    assert_eq!(assessment.cause, Some(DenialCause::ChainRead));
}

#[test]
fn test_exchange_timeout_is_denied() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki
        .issue_card("PTDEV00014")
        .unwrap()
        .with_pin("1234")
        .stalling_on(INS_VERIFY, Duration::from_millis(400));
    let indicator = RecordingIndicator::new();
    let mut engine = engine(&pki, &indicator).with_pin_source(pin("1234"));

    let mut handle = open_with_timeout(&card, Duration::from_millis(100));
    let assessment = engine.assess(&mut handle);
    assert_eq!(assessment.decision, AccessDecision::Denied);
    assert_eq!(assessment.cause, Some(DenialCause::Channel));
    assert!(assessment.elapsed < Duration::from_millis(400));
    handle.close();
}

#[test]
fn test_blocked_pin() {
    let pki = VirtualPki::generate().unwrap();
    let card = pki.issue_card("PTDEV00015").unwrap().with_pin("9876");
    let indicator = RecordingIndicator::new();
    let mut wrong = engine(&pki, &indicator).with_pin_source(pin("1234"));

    for _ in 0..3 {
        assert_eq!(wrong.evaluate(&mut open(&card)), AccessDecision::Denied);
    }
    assert_eq!(card.retries(), 0);

    // Even the right PIN is refused once blocked
    let mut right = engine(&pki, &indicator).with_pin_source(pin("9876"));
    let assessment = right.assess(&mut open(&card));
    assert_eq!(assessment.cause, Some(DenialCause::PinMismatch));
}
