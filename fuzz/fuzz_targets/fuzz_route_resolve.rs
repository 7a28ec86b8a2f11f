//! Fuzz target: route classification and prefix rewriting.
//!
//! The default table has a root route, so every path starting with `/`
//! resolves, and every rewrite yields another absolute path.

#![no_main]

use edge_core::config::default_routes;
use edge_core::RouteTable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(path) = std::str::from_utf8(data) else {
        return;
    };
    let table = RouteTable::new(default_routes());
    match table.resolve(path) {
        Some(route) => {
            assert!(route.matches(path));
            assert!(route.rewrite_path(path).starts_with('/'));
        }
        None => assert!(!path.starts_with('/'), "root route must catch {path:?}"),
    }
});
