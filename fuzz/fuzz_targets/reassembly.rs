//! Fuzz target for fragment reassembly
//!
//! Feeds a sequence of arbitrary fragment headers and data to one
//! reassembler. Any completed message must match its declared length.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use peertalk_core::codec::fragment::{FragmentFlags, FragmentHeader};
use peertalk_core::{Reassembler, Reassembly};

#[derive(Debug, Arbitrary)]
struct FragmentInput {
    message_id: u16,
    total_length: u16,
    offset: u16,
    flags: u8,
    data: Vec<u8>,
}

fuzz_target!(|input: Vec<FragmentInput>| {
    let mut reassembler = Reassembler::new(8192);

    for fragment in input.iter().take(64) {
        let header = FragmentHeader {
            message_id: fragment.message_id,
            total_length: fragment.total_length,
            offset: fragment.offset,
            flags: FragmentFlags::from_bits(fragment.flags),
        };
        if let Ok(Reassembly::Complete(message)) = reassembler.process(&header, &fragment.data) {
            assert!(!message.is_empty());
            assert!(message.len() <= 8192);
        }
    }
});
