//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must either fail to parse, fail validation, or produce a
//! configuration an engine can be built from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peertalk_core::{Engine, EngineConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<EngineConfig>(s) {
            if config.validate().is_ok() && config.peers.max_peers <= 16 {
                assert!(Engine::new(config).is_ok());
            }
        }
    }
});
