//! Hardware tests for the PC/SC reader and transport
//!
//! These skip when no PC/SC service, reader or card is available.

mod common;

use std::time::Duration;

use portier_apdu::prelude::*;
use portier_transport_pcsc::list_readers;

#[test]
fn test_list_readers() {
    match list_readers() {
        Ok(readers) => {
            for reader in readers {
                assert_eq!(reader.has_card(), reader.atr().is_some());
            }
        }
        Err(e) => println!("Skipping test, could not list readers: {e}"),
    }
}

#[test]
fn test_wait_for_change_returns() {
    let Some(mut reader) = common::get_test_reader() else {
        println!("Skipping test, no reader available");
        return;
    };

    // The first wait reports the current state immediately, the second may time out
    reader.wait_for_change(Duration::from_millis(50)).unwrap();
    reader.wait_for_change(Duration::from_millis(50)).unwrap();
}

#[test]
fn test_transport_transmit() {
    let Some(mut reader) = common::get_test_reader() else {
        println!("Skipping test, no reader available");
        return;
    };
    let mut transport = match reader.connect() {
        Ok(transport) => transport,
        Err(e) => {
            println!("Skipping test, no card available: {e}");
            return;
        }
    };
    assert!(transport.is_connected());

    // SELECT with an unlikely AID still yields a status word
    let aid = hex::decode("A0000000DEADBEEF").unwrap();
    let select = Command::new_with_data(0x00, 0xA4, 0x04, 0x00, aid);
    let response = transport.transmit_raw(&select.to_bytes()).unwrap();
    assert!(response.len() >= 2);
}
