//! Fuzz target for discovery packet decoding
//!
//! Arbitrary bytes must decode to a packet or an error, never a panic, and a
//! packet that decodes must re-encode to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peertalk_core::DiscoveryPacket;
use peertalk_core::codec::PacketKind;

fuzz_target!(|data: &[u8]| {
    let _ = PacketKind::sniff(data);

    if let Ok(packet) = DiscoveryPacket::decode(data) {
        let encoded = packet.to_bytes();
        assert_eq!(&data[..encoded.len()], &encoded[..]);
    }
});
