#![no_main]

use libfuzzer_sys::fuzz_target;
use wearable_link::protocol::command::Command;
use wearable_link::protocol::message::{HandshakeMessage, AUTH_CATEGORY};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // Fuzz handshake message decoding from an auth command
    let subtype = u16::from_le_bytes([data[0], data[1]]);
    let command = Command::new(AUTH_CATEGORY, subtype, data[2..].to_vec());
    if let Ok(message) = HandshakeMessage::from_command(&command) {
        if let Ok(again) = message.to_command() {
            let _ = HandshakeMessage::from_command(&again);
        }
    }
});
