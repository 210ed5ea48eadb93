//! Quire - Knowledge-base store and sync CLI
//!
//! This binary opens the local store, replicates the remote database into it
//! and answers lookups against the topic indexes.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use quire_common::QuireConfig;
use quire_common::Topic;
use quire_common::config::InitialSync;
use quire_store::indexes;
use quire_store::{OpenOutcome, OrderedStore, RangeOptions, RedbStore, StoreContext};
use quire_sync::{CouchFeed, ReplicationSync, SyncOptions};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "quire")]
#[command(about = "Quire knowledge-base store and sync")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); missing file means defaults
    #[arg(short, long, env = "QUIRE_CONFIG", default_value = "quire.toml")]
    config: PathBuf,

    /// Database file (overrides storage.path)
    #[arg(long, env = "QUIRE_DB")]
    db: Option<PathBuf>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull changes from the remote database into the local store
    Sync {
        /// Remote database URL (overrides remote.url)
        #[arg(long)]
        url: Option<String>,
        /// Changes per page
        #[arg(long)]
        page_size: Option<usize>,
        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<usize>,
        /// Strategy when no cursor is stored
        #[arg(long, value_enum)]
        initial: Option<InitialArg>,
    },
    /// Show one topic
    Get {
        /// Topic key
        key: String,
    },
    /// List topics linking to a topic
    Backrefs {
        /// Topic key
        key: String,
    },
    /// Find topics containing every given word
    Search {
        /// Words to look up
        #[arg(required = true)]
        words: Vec<String>,
    },
    /// List topic keys in order
    List {
        /// Lowest key (inclusive)
        #[arg(long)]
        from: Option<String>,
        /// Highest key (inclusive)
        #[arg(long)]
        to: Option<String>,
        /// Descending order
        #[arg(long)]
        reverse: bool,
        /// Maximum keys listed
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show store status
    Status,
    /// Recompute an index (all indexes when no name is given)
    RebuildIndex {
        /// Index name (backrefs, terms)
        name: Option<String>,
    },
    /// Forget the sync cursor so the next sync starts over
    ResetCursor,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InitialArg {
    Full,
    Changes,
}

impl From<InitialArg> for InitialSync {
    fn from(arg: InitialArg) -> Self {
        match arg {
            InitialArg::Full => Self::Full,
            InitialArg::Changes => Self::Changes,
        }
    }
}

/// Layer the config file, `QUIRE__*` environment variables and CLI flags
fn load_config(args: &Args) -> Result<QuireConfig> {
    let mut config = read_config(&args.config)?;
    if let Some(db) = &args.db {
        config.storage.path.clone_from(db);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.log_json {
        config.logging.json = true;
    }
    if let Commands::Sync {
        url,
        page_size,
        max_pages,
        initial,
    } = &args.command
    {
        if let Some(url) = url {
            config.remote.url = Some(url.clone());
        }
        if let Some(page_size) = page_size {
            config.remote.page_size = *page_size;
        }
        if max_pages.is_some() {
            config.remote.max_pages = *max_pages;
        }
        if let Some(initial) = initial {
            config.remote.initial = (*initial).into();
        }
    }
    Ok(config)
}

fn read_config(path: &Path) -> Result<QuireConfig> {
    config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("QUIRE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|c| c.try_deserialize::<QuireConfig>())
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn open_store(config: &QuireConfig) -> Result<Arc<StoreContext>> {
    let path = &config.storage.path;
    let store = RedbStore::open(path)
        .with_context(|| format!("opening database {}", path.display()))?
        .with_scan_chunk(config.storage.scan_chunk);
    let store: Arc<dyn OrderedStore> = Arc::new(store);
    let (ctx, outcome) = StoreContext::open(store)?;
    match outcome {
        OpenOutcome::Initialized => info!("Initialized new store at {}", path.display()),
        OpenOutcome::Current => info!("Opened store at {}", path.display()),
        OpenOutcome::Rebuilt { found } => warn!(
            "Store at {} had storage version {} and was wiped; run `quire sync` to repopulate",
            path.display(),
            found
        ),
    }
    Ok(Arc::new(ctx))
}

#[derive(Debug, Serialize)]
struct TopicEntry {
    key: String,
    #[serde(flatten)]
    topic: Topic,
}

fn entries(records: Vec<(String, Topic)>) -> Vec<TopicEntry> {
    records
        .into_iter()
        .map(|(key, topic)| TopicEntry { key, topic })
        .collect()
}

/// Topics containing every indexable word of `words`
fn search(ctx: &StoreContext, words: &[String]) -> Result<Vec<TopicEntry>> {
    let terms: BTreeSet<String> = words
        .iter()
        .flat_map(|word| indexes::tokenize(word).collect::<Vec<_>>())
        .collect();
    if terms.is_empty() {
        bail!(
            "no searchable words in query (words need {}+ letters and must not be stopwords)",
            indexes::MIN_TERM_LEN
        );
    }

    let index = ctx.terms()?;
    let mut matches: Option<BTreeSet<String>> = None;
    for term in &terms {
        let keys: BTreeSet<String> = index.primary_keys(term)?.into_iter().collect();
        matches = Some(match matches {
            Some(found) => found.intersection(&keys).cloned().collect(),
            None => keys,
        });
    }

    let mut found = Vec::new();
    for key in matches.unwrap_or_default() {
        if let Some(topic) = ctx.topics().try_get(&key)? {
            found.push(TopicEntry { key, topic });
        }
    }
    Ok(found)
}

fn list(
    ctx: &StoreContext,
    from: Option<String>,
    to: Option<String>,
    reverse: bool,
    limit: Option<usize>,
) -> Result<Vec<String>> {
    let mut range = RangeOptions::all();
    if let Some(from) = from {
        range = range.gte(from);
    }
    if let Some(to) = to {
        range = range.lte(to);
    }
    if reverse {
        range = range.reverse();
    }
    if let Some(limit) = limit {
        range = range.limit(limit);
    }
    let mut keys = Vec::new();
    for entry in ctx.topics().primary().iterate(&range)? {
        keys.push(entry?.0);
    }
    Ok(keys)
}

#[derive(Debug, Serialize)]
struct Status {
    database: PathBuf,
    storage_version: Option<u32>,
    cursor: Option<String>,
    topics: usize,
    index_entries: Vec<(String, usize)>,
}

fn status(ctx: &StoreContext, database: &Path) -> Result<Status> {
    let mut topics = 0;
    for entry in ctx.topics().primary().iter_all()? {
        entry?;
        topics += 1;
    }
    let mut index_entries = Vec::new();
    for name in ctx.topics().index_names() {
        let count = ctx.topics().index(name)?.all_entries()?.len();
        index_entries.push((name.to_string(), count));
    }
    Ok(Status {
        database: database.to_path_buf(),
        storage_version: ctx.storage_version()?,
        cursor: ctx.cursor()?.map(|c| c.to_string()),
        topics,
        index_entries,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    init_logging(&config.logging.level, config.logging.json);

    let ctx = open_store(&config)?;

    match args.command {
        Commands::Sync { .. } => {
            let feed = CouchFeed::from_config(&config.remote)?;
            let sync = ReplicationSync::new(ctx, feed, SyncOptions::from(&config.remote));
            let report = sync.run().await?;
            println!("{report}");
            for failure in &report.failed {
                println!("  failed {}: {}", failure.id, failure.reason);
            }
            for index in &report.degraded_indexes {
                println!("  index {index} is degraded; run `quire rebuild-index {index}`");
            }
        }
        Commands::Get { key } => {
            let topic = ctx.topics().get(&key)?;
            print_json(&TopicEntry { key, topic })?;
        }
        Commands::Backrefs { key } => {
            print_json(&entries(ctx.backrefs()?.get(&key)?))?;
        }
        Commands::Search { words } => {
            print_json(&search(&ctx, &words)?)?;
        }
        Commands::List {
            from,
            to,
            reverse,
            limit,
        } => {
            for key in list(&ctx, from, to, reverse, limit)? {
                println!("{key}");
            }
        }
        Commands::Status => {
            print_json(&status(&ctx, &config.storage.path)?)?;
        }
        Commands::RebuildIndex { name } => {
            let written = match name {
                Some(name) => ctx.topics().rebuild_index(&name)?,
                None => ctx.topics().rebuild_all()?,
            };
            println!("Rebuilt index entries: {written}");
        }
        Commands::ResetCursor => {
            ctx.reset_cursor()?;
            println!("Sync cursor cleared; next sync starts from scratch");
        }
    }

    Ok(())
}
