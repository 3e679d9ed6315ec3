use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use molsieve::index::build::load_file;
use molsieve::index::stats::{list_store_names, show_stats, IndexStats};
use molsieve::index::{IndexConfig, IndexContext, RecordId};
use molsieve::output::{print_hits, print_summary};
use molsieve::storage::FileBlobStore;
use molsieve::utils::{get_store_dir, parse_hex, AppConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STORE_CONFIG: &str = "molsieve.json";

#[derive(Parser)]
#[command(name = "molsieve")]
#[command(about = "Fingerprint screening index over shared-memory block storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory (defaults to a named store in the app data directory)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Named store in the app data directory
    #[arg(short, long, global = true, default_value = "default")]
    name: String,

    /// Index context id
    #[arg(short, long, global = true)]
    context: Option<u32>,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index tables
    Create {
        /// Fingerprint length in bytes
        #[arg(long)]
        fp_bytes: Option<usize>,

        /// Priority byte range, e.g. 0..32
        #[arg(long)]
        priority: Option<String>,
    },
    /// Drop the index tables
    Drop,
    /// Remove every record, keeping the tables
    Truncate,
    /// Load HEXFP<TAB>payload lines from a file
    Load {
        file: PathBuf,

        /// No progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// Screen the index with a hex query fingerprint
    Search {
        query: String,

        /// Print at most this many hits
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only print the number of candidates
        #[arg(long)]
        count: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },
    /// Print the payload of a record
    Fetch { id: RecordId },
    /// Tombstone records
    Remove { ids: Vec<RecordId> },
    /// Show index statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show table sizes
    Analyze,
    /// List the stores in the app data directory
    List,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn parse_priority(text: &str) -> Result<molsieve::index::PriorityRange> {
    let (start, end) = text
        .split_once("..")
        .context("Priority range must look like START..END")?;
    Ok(molsieve::index::PriorityRange {
        start: start.trim().parse().context("Invalid priority range start")?,
        end: end.trim().parse().context("Invalid priority range end")?,
    })
}

/// Index settings saved next to the store, falling back to the app config
fn load_index_config(store_dir: &Path, app: &AppConfig) -> Result<IndexConfig> {
    let path = store_dir.join(STORE_CONFIG);
    if !path.exists() {
        return Ok(app.index.clone());
    }
    let content = fs::read_to_string(&path).context("Failed to read store config")?;
    serde_json::from_str(&content).context("Failed to parse store config")
}

fn save_index_config(store_dir: &Path, config: &IndexConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config).context("Failed to serialize store config")?;
    fs::write(store_dir.join(STORE_CONFIG), content).context("Failed to write store config")?;
    Ok(())
}

fn open_context(store_dir: &Path, context_id: u32, config: IndexConfig) -> Result<IndexContext> {
    let blob = FileBlobStore::open(store_dir)
        .with_context(|| format!("Failed to open store {}", store_dir.display()))?;
    Ok(IndexContext::new(Arc::new(blob), context_id, config)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Commands::List = cli.command {
        return list_store_names();
    }

    let app = AppConfig::load()?;
    let store_dir = match cli.store {
        Some(dir) => dir,
        None => get_store_dir(&cli.name)?,
    };
    fs::create_dir_all(&store_dir)?;
    let context_id = cli.context.unwrap_or(app.context_id);
    let mut config = load_index_config(&store_dir, &app)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(app.effective_parse_threads())
        .build_global()
        .context("Failed to configure thread pool")?;

    match cli.command {
        Commands::Create { fp_bytes, priority } => {
            if let Some(fp_bytes) = fp_bytes {
                config.fp_bytes = fp_bytes;
            }
            if let Some(priority) = priority {
                config.priority = Some(parse_priority(&priority)?);
            }
            config.check()?;

            let mut ctx = open_context(&store_dir, context_id, config.clone())?;
            match ctx.lock() {
                Err(molsieve::Error::TableNotFound(_)) => ctx.create()?,
                Err(e) => return Err(e.into()),
                Ok(_) => bail!(
                    "Index context {} already exists in {}",
                    context_id,
                    store_dir.display()
                ),
            }
            save_index_config(&store_dir, &config)?;
            println!("Created index in {}", store_dir.display());
        }
        Commands::Drop => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            ctx.drop_tables()?;
            println!("Dropped index context {}", context_id);
        }
        Commands::Truncate => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            let _locks = ctx.lock().context("Failed to lock tables")?;
            ctx.truncate()?;
            println!("Truncated index context {}", context_id);
        }
        Commands::Load { file, quiet } => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            let _locks = ctx.lock().context("Another writer holds the tables")?;
            ctx.validate_for_insert()?;
            let summary = load_file(&mut ctx, &file, quiet)?;
            ctx.finish();
            info!(
                loaded = summary.loaded,
                skipped = summary.skipped,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "load complete"
            );
            println!(
                "Loaded {} records ({} skipped) in {:.2?}",
                summary.loaded, summary.skipped, summary.elapsed
            );
        }
        Commands::Search {
            query,
            limit,
            count,
            no_color,
        } => {
            let query = parse_hex(query.trim().as_bytes()).context("Query must be hex")?;
            let mut ctx = open_context(&store_dir, context_id, config)?;
            ctx.validate()?;
            let hits = ctx.search(&query)?;
            if !count {
                print_hits(&ctx, &hits, !no_color, limit)?;
            }
            print_summary(&hits, ctx.count(), !no_color)?;
        }
        Commands::Fetch { id } => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            ctx.validate()?;
            match ctx.fetch(id)? {
                Some(payload) => println!("{}", String::from_utf8_lossy(payload)),
                None => bail!("Record {} not found", id),
            }
        }
        Commands::Remove { ids } => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            let _locks = ctx.lock().context("Another writer holds the tables")?;
            ctx.validate_for_insert()?;
            let mut removed = 0;
            for id in ids {
                if ctx.remove(id)? {
                    removed += 1;
                } else {
                    eprintln!("No record {}", id);
                }
            }
            ctx.flush()?;
            ctx.finish();
            println!("Removed {} records", removed);
        }
        Commands::Stats { json } => {
            let mut ctx = open_context(&store_dir, context_id, config)?;
            ctx.validate()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&IndexStats::collect(&ctx)?)?);
            } else {
                show_stats(&ctx)?;
            }
        }
        Commands::Analyze => {
            let ctx = open_context(&store_dir, context_id, config)?;
            let stats = ctx.analyze()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::List => unreachable!("handled above"),
    }

    Ok(())
}
