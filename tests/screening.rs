//! End-to-end screening: a writer session loads records, reader sessions
//! attach the shared copy and screen it.

use molsieve::index::build::load_records;
use molsieve::index::{IndexConfig, IndexContext};
use molsieve::storage::{MemoryBlobStore, SharedCacheConfig, StorageConfig};
use molsieve::utils::{contains_all, to_hex};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn config(shm: &TempDir, fp_bytes: usize, block_rows: usize) -> IndexConfig {
    IndexConfig {
        fp_bytes,
        block_rows,
        chunk_words: 1,
        storage: StorageConfig {
            max_block_size: 256,
            shared: SharedCacheConfig {
                shm_dir: Some(shm.path().to_path_buf()),
                ..SharedCacheConfig::default()
            },
        },
        ..IndexConfig::default()
    }
}

fn writer(blob: MemoryBlobStore, config: IndexConfig) -> IndexContext {
    let mut ctx = IndexContext::new(Arc::new(blob), 1, config).unwrap();
    ctx.create().unwrap();
    ctx.validate_for_insert().unwrap();
    ctx
}

fn reader(blob: MemoryBlobStore, config: IndexConfig) -> IndexContext {
    let mut ctx = IndexContext::new(Arc::new(blob), 1, config).unwrap();
    ctx.validate().unwrap();
    ctx
}

fn ids(bitmap: &roaring::RoaringBitmap) -> Vec<u32> {
    bitmap.iter().collect()
}

fn fp_with_bits(bits: &[usize]) -> Vec<u8> {
    let mut fp = vec![0u8; 16];
    for &bit in bits {
        molsieve::utils::set_bit(&mut fp, bit);
    }
    fp
}

#[test]
fn test_query_matching_only_the_sparse_record() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://sparse");
    let other = primary.session();

    // Popcounts 5, 2 and 9
    let mut w = writer(primary, config(&shm, 16, 16));
    w.insert(&fp_with_bits(&[0, 1, 2, 3, 4]), b"five").unwrap();
    w.insert(&fp_with_bits(&[100, 101]), b"two").unwrap();
    w.insert(&fp_with_bits(&[0, 1, 2, 3, 4, 5, 6, 7, 8]), b"nine").unwrap();
    w.flush().unwrap();
    w.finish();

    let r = reader(other, config(&shm, 16, 16));
    let hits = r.search(&fp_with_bits(&[100, 101])).unwrap();
    assert_eq!(ids(&hits), vec![1]);
    assert_eq!(r.fetch(1).unwrap(), Some(&b"two"[..]));
}

#[test]
fn test_reader_screens_committed_records() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://e2e");
    let other = primary.session();

    let mut w = writer(primary, config(&shm, 2, 16));
    w.insert(&[0x1f, 0x00], b"CCCCC").unwrap();
    w.insert(&[0x03, 0x00], b"CC").unwrap();
    w.insert(&[0xff, 0x01], b"c1ccccc1CCC").unwrap();
    w.flush().unwrap();
    w.finish();

    let r = reader(other, config(&shm, 2, 16));
    assert_eq!(r.count(), 3);
    assert_eq!(ids(&r.search(&[0x07, 0x00]).unwrap()), vec![0, 2]);
    assert_eq!(r.fetch(2).unwrap(), Some(&b"c1ccccc1CCC"[..]));
}

#[test]
fn test_reader_reloads_after_more_records() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://reload");
    let other = primary.session();

    let mut w = writer(primary, config(&shm, 1, 4));
    w.insert(&[0x01], b"a").unwrap();
    w.flush().unwrap();

    let mut r = reader(other, config(&shm, 1, 4));
    assert_eq!(ids(&r.search(&[0x01]).unwrap()), vec![0]);

    w.insert(&[0x03], b"b").unwrap();
    w.insert(&[0x02], b"c").unwrap();
    w.flush().unwrap();

    // Still the old copy until the reader validates again
    assert_eq!(r.count(), 1);
    r.validate().unwrap();
    assert_eq!(r.count(), 3);
    assert_eq!(ids(&r.search(&[0x01]).unwrap()), vec![0, 1]);
    assert_eq!(ids(&r.search(&[0x02]).unwrap()), vec![1, 2]);
}

#[test]
fn test_screen_matches_exhaustive_scan_across_blocks() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://exhaustive");
    let other = primary.session();
    let fp_bytes = 4;

    let mut seed = 0x2545_f491_4f6c_dd1du64;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };
    let fps: Vec<Vec<u8>> = (0..150)
        .map(|_| {
            let a = next().to_le_bytes();
            let b = next().to_le_bytes();
            (0..fp_bytes).map(|i| a[i] | b[i]).collect()
        })
        .collect();

    let mut w = writer(primary, config(&shm, fp_bytes, 64));
    for (i, fp) in fps.iter().enumerate() {
        w.insert(fp, format!("{}", i).as_bytes()).unwrap();
    }
    w.flush().unwrap();
    w.finish();

    let r = reader(other, config(&shm, fp_bytes, 64));
    assert_eq!(r.fingerprints().count_blocks(), 3);

    for q in 0..40 {
        let query: Vec<u8> = next().to_le_bytes()[..fp_bytes]
            .iter()
            .map(|&b| if q % 2 == 0 { b & (b >> 1) & (b >> 3) } else { b & (b >> 2) })
            .collect();
        let expected: Vec<u32> = fps
            .iter()
            .enumerate()
            .filter(|(_, fp)| contains_all(fp, &query))
            .map(|(i, _)| i as u32)
            .collect();
        assert_eq!(ids(&r.search(&query).unwrap()), expected, "query {}", to_hex(&query));
    }
}

#[test]
fn test_manual_screening_protocol() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://manual");
    let other = primary.session();

    let mut w = writer(primary, config(&shm, 1, 2));
    for fp in [0x01u8, 0x03, 0x07, 0x0f, 0x1f] {
        w.insert(&[fp], b"x").unwrap();
    }
    w.flush().unwrap();
    w.finish();

    let r = reader(other, config(&shm, 1, 2));
    let index = r.fingerprints();
    let mut screening = index.screen_init(&[0x06]).unwrap();
    index.count_ones(&mut screening).unwrap();
    assert!(screening.is_counted());

    let mut found = Vec::new();
    while index.screen_part_init(&mut screening).unwrap() {
        while index.screen_part_next(&mut screening).unwrap() {}
        if screening.blocks_visited() == 3 {
            // Last block holds only record 4
            assert_eq!(index.get_storage_index(&screening, 0), Some(4));
            assert_eq!(index.get_storage_index(&screening, 1), None);
        }
        found.extend(screening.take_passed());
        index.screen_part_end(&mut screening);
    }
    found.sort_unstable();
    assert_eq!(found, vec![2, 3, 4]);
    assert_eq!(screening.blocks_visited(), 3);
}

#[test]
fn test_load_text_and_remove() {
    let shm = tempdir().unwrap();
    let primary = MemoryBlobStore::new("mem://load");
    let other = primary.session();

    let input = b"# fp\tsmiles\n0f00\tCCCC\nzz00\tbad\n\n0300\tCC\nff01\tCCCCCCCCC\n";
    let mut w = writer(primary, config(&shm, 2, 16));
    let summary = load_records(&mut w, input, true).unwrap();
    assert_eq!((summary.loaded, summary.skipped), (3, 1));

    assert!(w.remove(0).unwrap());
    w.flush().unwrap();
    w.finish();

    let r = reader(other, config(&shm, 2, 16));
    assert_eq!(r.fetch(0).unwrap(), None);
    assert_eq!(r.fetch(1).unwrap(), Some(&b"CC"[..]));
    assert_eq!(ids(&r.search(&[0x03, 0x00]).unwrap()), vec![1, 2]);
}
