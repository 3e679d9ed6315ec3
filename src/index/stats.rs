use crate::index::context::IndexContext;
use crate::utils::list_stores;
use anyhow::Result;
use serde::Serialize;

/// Summary of an index context, printable or serializable as JSON
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub records: usize,
    pub blocks: usize,
    pub fp_bytes: usize,
    pub payload_rows: usize,
    pub payload_bytes: u64,
    pub fingerprint_rows: usize,
    pub fingerprint_bytes: u64,
    /// Fraction of fingerprints with each bit set
    pub bit_density: Vec<f32>,
}

impl IndexStats {
    pub fn collect(ctx: &IndexContext) -> Result<Self> {
        let tables = ctx.analyze()?;
        let fingerprints = ctx.fingerprints();
        let records = fingerprints.get_total_count();
        let counts = fingerprints.bit_counts()?;
        let bit_density = counts
            .iter()
            .map(|&c| if records == 0 { 0.0 } else { c as f32 / records as f32 })
            .collect();

        Ok(Self {
            records,
            blocks: fingerprints.count_blocks(),
            fp_bytes: fingerprints.fp_bytes(),
            payload_rows: tables.payloads.rows,
            payload_bytes: tables.payloads.bytes,
            fingerprint_rows: tables.fingerprints.rows,
            fingerprint_bytes: tables.fingerprints.bytes,
            bit_density,
        })
    }

    /// Bits sorted by density, densest first
    pub fn densest_bits(&self, n: usize) -> Vec<(usize, f32)> {
        let mut bits: Vec<(usize, f32)> = self.bit_density.iter().copied().enumerate().collect();
        bits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        bits.truncate(n);
        bits
    }

    /// Bits never set
    pub fn empty_bits(&self) -> usize {
        self.bit_density.iter().filter(|&&d| d == 0.0).count()
    }
}

/// Display index statistics
pub fn show_stats(ctx: &IndexContext) -> Result<()> {
    let stats = IndexStats::collect(ctx)?;
    let tables = ctx.tables();

    println!("Index Statistics");
    println!("================");
    println!();
    println!("Payload table:     {}", tables.payloads);
    println!("Fingerprint table: {}", tables.fingerprints);
    println!("Records:           {}", stats.records);
    println!("Fingerprint size:  {} bytes", stats.fp_bytes);
    println!("Blocks:            {}", stats.blocks);
    println!();
    println!(
        "Payload storage:   {} rows, {}",
        stats.payload_rows,
        format_size(stats.payload_bytes)
    );
    println!(
        "Block storage:     {} rows, {}",
        stats.fingerprint_rows,
        format_size(stats.fingerprint_bytes)
    );

    if stats.records > 0 {
        println!();
        println!("Densest bits:");
        for (bit, density) in stats.densest_bits(10) {
            println!("  bit {:5} {:6.2}%", bit, density * 100.0);
        }
        println!(
            "Unused bits:       {} of {}",
            stats.empty_bits(),
            stats.bit_density.len()
        );
    }

    Ok(())
}

/// List the stores in the app data directory
pub fn list_store_names() -> Result<()> {
    let stores = list_stores()?;

    if stores.is_empty() {
        println!("No stores found.");
        return Ok(());
    }

    println!("Stores");
    println!("======");
    println!();
    for store in stores {
        println!("  {}", store);
    }

    Ok(())
}

/// Format byte size to human readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
