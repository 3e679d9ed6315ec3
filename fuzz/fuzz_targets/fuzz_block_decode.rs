#![no_main]

use libfuzzer_sys::fuzz_target;
use molsieve::index::{BlockLayout, ColumnSource, FingerprintBlock};
use molsieve::storage::AddressIndex;

fuzz_target!(|data: &[u8]| {
    // Anything that parses must be readable without going out of bounds
    if let Ok(layout) = BlockLayout::parse(0, data) {
        let view = layout.view(data);
        for column in 0..view.fp_bits() {
            if let Some((start, end)) = view.bit_range(column) {
                assert!(start <= end && (end as usize) < view.used());
            }
            let _ = view.column_ones(column);
        }
        let _ = view.first_row_with_count(1);
    }
    if let Ok(block) = FingerprintBlock::decode(0, data) {
        assert_eq!(block.encode().len(), block.encoded_len());
    }
    let _ = AddressIndex::decode("fuzz", data);
});
