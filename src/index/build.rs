//! Bulk load of `HEXFP<TAB>payload` lines into an index context.

use crate::index::context::IndexContext;
use crate::utils::parse_hex;
use crate::utils::progress::{ProgressBar, ProgressStyle};
use anyhow::{Context, Result};
use memchr::memchr;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::warn;

/// Lines parsed in parallel per batch
const BATCH_LINES: usize = 16384;

/// Outcome of a bulk load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

/// One input line decoded (computed in parallel)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub fingerprint: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Decode `HEXFP<TAB>payload`. The payload may be empty; a missing tab means
/// the whole line is the fingerprint.
pub fn parse_line(line: &[u8], fp_bytes: usize) -> Option<ParsedRecord> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let (hex, payload) = match memchr(b'\t', line) {
        Some(tab) => (&line[..tab], &line[tab + 1..]),
        None => (line, &[][..]),
    };
    let fingerprint = parse_hex(hex.trim_ascii())?;
    if fingerprint.len() != fp_bytes {
        return None;
    }
    Some(ParsedRecord {
        fingerprint,
        payload: payload.to_vec(),
    })
}

/// Split input into non-empty, non-comment lines with their 1-based numbers
fn input_lines(input: &[u8]) -> Vec<(usize, &[u8])> {
    input
        .split(|&b| b == b'\n')
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| {
            let trimmed = line.trim_ascii();
            !trimmed.is_empty() && !trimmed.starts_with(b"#")
        })
        .collect()
}

fn progress_bar(len: u64, silent: bool) -> Option<ProgressBar> {
    if silent {
        return None;
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  "),
    );
    pb.set_message("Loading records...");
    Some(pb)
}

/// Insert every record of `input` and flush once at the end
pub fn load_records(ctx: &mut IndexContext, input: &[u8], silent: bool) -> Result<LoadSummary> {
    let started = Instant::now();
    let fp_bytes = ctx.fingerprints().fp_bytes();
    let lines = input_lines(input);
    let pb = progress_bar(lines.len() as u64, silent);

    let mut summary = LoadSummary::default();
    for batch in lines.chunks(BATCH_LINES) {
        // Parse in parallel, insert in input order
        let parsed: Vec<(usize, Option<ParsedRecord>)> = batch
            .par_iter()
            .map(|&(number, line)| (number, parse_line(line, fp_bytes)))
            .collect();

        for (number, record) in parsed {
            match record {
                Some(record) => {
                    ctx.insert(&record.fingerprint, &record.payload)
                        .with_context(|| format!("Failed to insert line {}", number))?;
                    summary.loaded += 1;
                }
                None => {
                    warn!(line = number, "skipping malformed record");
                    summary.skipped += 1;
                }
            }
        }

        if let Some(ref pb) = pb {
            pb.inc(batch.len() as u64);
        }
    }

    ctx.flush().context("Failed to flush index")?;
    summary.elapsed = started.elapsed();

    if let Some(pb) = pb {
        pb.finish_with_message(format!("Loaded {} records", summary.loaded));
    }
    Ok(summary)
}

/// Load a file of records through a read-only mapping
pub fn load_file(ctx: &mut IndexContext, path: &Path, silent: bool) -> Result<LoadSummary> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        return load_records(ctx, &[], silent);
    }
    let input = unsafe { Mmap::map(&file)? };
    load_records(ctx, &input, silent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::IndexConfig;
    use crate::storage::{MemoryBlobStore, SharedCacheConfig, StorageConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_parse_line() {
        let record = parse_line(b"0a0b\tCCO\r", 2).unwrap();
        assert_eq!(record.fingerprint, vec![0x0a, 0x0b]);
        assert_eq!(record.payload, b"CCO");

        let bare = parse_line(b"ffff", 2).unwrap();
        assert!(bare.payload.is_empty());

        assert!(parse_line(b"0a\tCCO", 2).is_none());
        assert!(parse_line(b"zz00\tCCO", 2).is_none());
    }

    #[test]
    fn test_input_lines_skip_blank_and_comments() {
        let lines = input_lines(b"# header\n0a0b\tx\n\n  \n0c0d\ty\n");
        let numbers: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![2, 5]);
    }

    #[test]
    fn test_load_records() {
        let shm = tempdir().unwrap();
        let config = IndexConfig {
            fp_bytes: 2,
            block_rows: 2,
            storage: StorageConfig {
                shared: SharedCacheConfig {
                    shm_dir: Some(shm.path().to_path_buf()),
                    ..SharedCacheConfig::default()
                },
                ..StorageConfig::default()
            },
            ..IndexConfig::default()
        };
        let blob = Arc::new(MemoryBlobStore::new("mem://load"));
        let mut ctx = IndexContext::new(blob, 7, config).unwrap();
        ctx.create().unwrap();
        ctx.validate_for_insert().unwrap();

        let input = b"0300\tCCO\nbad line\n0100\tC\n0700\tCCC\n";
        let summary = load_records(&mut ctx, input, true).unwrap();
        assert_eq!((summary.loaded, summary.skipped), (3, 1));

        ctx.validate().unwrap();
        assert_eq!(ctx.fetch(2).unwrap(), Some(&b"CCC"[..]));
        let hits = ctx.search(&[0x03, 0x00]).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
