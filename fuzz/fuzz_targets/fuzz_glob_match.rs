//! Fuzz target: `*` wildcard matching used by access policies.
//!
//! Adversarial patterns (long runs of `*`) must stay fast and panic free.

#![no_main]

use edge_core::policy::glob_match;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (pattern, subject) = text.split_once('\n').unwrap_or((text, ""));
    let _ = glob_match(pattern, subject);
    assert!(glob_match("*", subject));
    assert!(glob_match(subject, subject) || subject.contains('*'));
});
