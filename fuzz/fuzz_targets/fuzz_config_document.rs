//! Fuzz target: configuration parsing and topology validation.
//!
//! Arbitrary documents are either rejected with an error or yield a
//! topology; neither step may panic.

#![no_main]

use edge_core::config::EdgeConfig;
use edge_core::Topology;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = EdgeConfig::from_json(text) {
        let _ = Topology::from_config(&config);
    }
});
