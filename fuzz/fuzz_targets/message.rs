//! Fuzz target for reliable frame and datagram parsing
//!
//! Tests that the frame parser handles arbitrary input without panicking and
//! never reports a frame longer than the buffer.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peertalk_core::Message;
use peertalk_core::codec::batch::Batch;
use peertalk_core::codec::fragment::FragmentHeader;
use peertalk_core::codec::udp::Datagram;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::parse(data) {
        assert!(message.frame_len() <= data.len());

        // Payload sub-formats must also tolerate garbage
        let payload = message.payload();
        let _ = FragmentHeader::split(payload);
        for entry in Batch::entries(payload) {
            if entry.is_err() {
                break;
            }
        }
    }

    let _ = Datagram::decode(data);
});
