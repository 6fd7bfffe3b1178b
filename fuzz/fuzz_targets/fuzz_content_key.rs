//! Fuzz target for content key URL parsing.
//!
//! Parsing must never panic, and anything that parses must print back
//! to a form that parses to the same key.

#![no_main]

use hub_reconciler::model::ContentKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some(key) = ContentKey::from_url(data) {
        let url = key.to_url();
        assert_eq!(ContentKey::from_url(&url), Some(key.clone()));

        // The bucket of a parsed key is always well formed.
        let _ = key.minute_path().to_url();
    }
});
