//! Fuzz target: structural parsing of bearer tokens.
//!
//! Arbitrary header values must either parse or be rejected as malformed,
//! never panic.

#![no_main]

use edge_auth::bearer::extract_token;
use edge_auth::token::{fingerprint, parse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(header) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(token) = extract_token(header) {
        let _ = parse(token);
        assert_eq!(fingerprint(token).len(), 12, "fingerprint is six hex bytes");
    }
});
