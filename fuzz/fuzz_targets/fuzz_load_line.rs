#![no_main]

use libfuzzer_sys::fuzz_target;
use molsieve::index::build::parse_line;
use molsieve::utils::{parse_hex, to_hex};

fuzz_target!(|data: &[u8]| {
    if let Some(bytes) = parse_hex(data) {
        assert!(to_hex(&bytes).eq_ignore_ascii_case(std::str::from_utf8(data).unwrap_or("")));
    }
    for fp_bytes in [1, 4, 8] {
        if let Some(record) = parse_line(data, fp_bytes) {
            assert_eq!(record.fingerprint.len(), fp_bytes);
        }
    }
});
