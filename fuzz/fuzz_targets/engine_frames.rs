//! Fuzz target for the engine's inbound paths
//!
//! A connected engine receives arbitrary frames, datagrams and discovery
//! packets. It must reject bad input with an error and never panic.

#![no_main]

use std::net::SocketAddr;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use peertalk_core::{Engine, EngineConfig};

#[derive(Debug, Arbitrary)]
enum Input {
    Frame(Vec<u8>),
    Datagram(Vec<u8>),
    Discovery(Vec<u8>),
    Drain,
    Poll(u16),
}

fuzz_target!(|inputs: Vec<Input>| {
    let Ok(mut engine) = Engine::new(EngineConfig::default()) else {
        return;
    };
    let remote = SocketAddr::from(([10, 0, 0, 2], 7354));
    let Ok(peer) = engine.on_accepted(remote, None, 1) else {
        return;
    };

    let mut now = 1u64;
    for input in inputs.iter().take(128) {
        match input {
            Input::Frame(bytes) => {
                let _ = engine.handle_frame(peer, bytes, now);
            }
            Input::Datagram(bytes) => {
                let _ = engine.handle_datagram(bytes, remote, now);
            }
            Input::Discovery(bytes) => {
                let _ = engine.handle_discovery(bytes, remote, now);
            }
            Input::Drain => while let Ok(Some(_)) = engine.next_outbound_batch(peer) {},
            Input::Poll(ms) => {
                now += u64::from(*ms);
                let _ = engine.poll(now);
            }
        }
    }
});
