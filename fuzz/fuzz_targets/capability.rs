//! Fuzz target for capability TLV decoding and negotiation

#![no_main]

use libfuzzer_sys::fuzz_target;
use peertalk_core::Negotiated;
use peertalk_core::codec::capability::{CapabilityMessage, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};

fuzz_target!(|data: &[u8]| {
    let Ok(remote) = CapabilityMessage::decode(data) else {
        return;
    };

    let local = CapabilityMessage::default();
    let negotiated = Negotiated::between(&local, &remote);
    assert!(negotiated.max_message_size >= MIN_MESSAGE_SIZE);
    assert!(negotiated.max_message_size <= MAX_MESSAGE_SIZE);
    assert!(negotiated.chunk_size >= 1 && negotiated.chunk_size <= negotiated.max_message_size);
});
