//! Fuzz target: request-signature header parsing.

#![no_main]

use edge_auth::SignatureHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(header) = SignatureHeader::parse(value) {
        assert_eq!(header.service, "execute-api");
        assert!(!header.signed_headers.is_empty());
        assert!(header.signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
});
