//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use animload_service::caching;
use animload_service::config::Config;
use animload_service::context::AnimationContext;
use animload_service::download::{Downloader, FilesystemDownloader};
use animload_service::metrics;
use animload_service::types::{Animation, CacheStrategy, Model, RequestOptions};
use animload_service::{DataSource, LoadError, ResourceCallback, ResourceRef};

use crate::logging;
use crate::output::{self, Attempt, Probe, Summary};

/// The caching layers a load may use.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    None,
    MemoryOnly,
    DiskOnly,
    Both,
}

impl From<Strategy> for CacheStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::None => CacheStrategy::None,
            Strategy::MemoryOnly => CacheStrategy::MemoryOnly,
            Strategy::DiskOnly => CacheStrategy::DiskOnly,
            Strategy::Both => CacheStrategy::Both,
        }
    }
}

#[derive(Debug, clap::Args)]
struct LoadArgs {
    /// Which caching layers to use. Defaults to the configured request defaults.
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Never read or write downloaded artifacts on disk.
    #[arg(long)]
    no_disk_cache: bool,

    /// Never keep loaded animations in memory.
    #[arg(long)]
    skip_memory_cache: bool,

    /// Serve remote URLs from this directory, laid out as `<host>/<path>`.
    #[arg(long, value_name = "DIR")]
    mirror: Option<PathBuf>,

    /// How often to load every source. Animations are released between attempts.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    repeat: u32,

    /// Files, URLs or `file://` URLs to load.
    #[arg(required = true, value_name = "SOURCE")]
    sources: Vec<String>,
}

impl LoadArgs {
    fn options(&self, defaults: &RequestOptions) -> RequestOptions {
        let mut options = defaults.clone();
        if let Some(strategy) = self.strategy {
            options.cache_strategy = strategy.into();
        }
        if self.no_disk_cache {
            options.disk_cache = false;
        }
        if self.skip_memory_cache {
            options.skip_memory_cache = true;
        }
        options
    }
}

/// animload commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load animations through the engine and report where they came from.
    Load(LoadArgs),

    /// Identify animation files and print their headers.
    Probe {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Clean the disk cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "animload", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: no other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    metrics::configure(&config.metrics).context("failed to configure metrics")?;

    match cli.command {
        Command::Load(args) => load(&config, args).context("failed to load animations"),
        Command::Probe { json, files } => probe(&files, json),
        Command::Cleanup { dry_run } => {
            let stats = caching::cleanup(config, dry_run).context("failed to clean up caches")?;
            output::print_cleanup(&stats, dry_run);
            Ok(())
        }
    }
}

type Delivery = (usize, Result<(ResourceRef<Animation>, DataSource, bool), LoadError>);

/// Forwards deliveries for the source at `index` into a channel.
struct ChannelCallback {
    index: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ResourceCallback<Animation> for ChannelCallback {
    fn on_resource_ready(
        &self,
        resource: ResourceRef<Animation>,
        data_source: DataSource,
        from_alternate_key: bool,
    ) {
        let delivery = Ok((resource, data_source, from_alternate_key));
        self.sender.send((self.index, delivery)).ok();
    }

    fn on_load_failed(&self, error: LoadError) {
        self.sender.send((self.index, Err(error))).ok();
    }
}

fn load(config: &Config, args: LoadArgs) -> Result<()> {
    let downloader = args
        .mirror
        .as_ref()
        .map(|root| Arc::new(FilesystemDownloader::new(root)) as Arc<dyn Downloader>);

    let context = AnimationContext::new();
    context.init(config, downloader)?;
    let options = args.options(&config.defaults);
    tracing::debug!(?options, sources = args.sources.len(), "Loading animations");

    let mut attempts = Vec::new();
    for attempt in 1..=args.repeat as usize {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for (index, source) in args.sources.iter().enumerate() {
            let callback = Arc::new(ChannelCallback {
                index,
                sender: sender.clone(),
            });
            context
                .request(Model::parse(source))?
                .options(options.clone())
                .load(&context.engine()?, callback);
        }
        // the channel closes once every callback has been dropped
        drop(sender);

        let mut outcomes: Vec<_> = std::iter::from_fn(|| receiver.blocking_recv()).collect();
        outcomes.sort_by_key(|(index, _)| *index);

        // every reference is released before the next attempt starts
        for (index, delivery) in outcomes {
            let outcome = delivery.map(|(resource, data_source, from_alternate_key)| {
                (Summary::new(&resource), data_source, from_alternate_key)
            });
            attempts.push(Attempt {
                attempt,
                source: args.sources[index].clone(),
                outcome,
            });
        }
    }

    context.teardown()?;
    output::print_attempts(&attempts);
    Ok(())
}

fn probe(files: &[PathBuf], json: bool) -> Result<()> {
    let probes: Vec<_> = files
        .iter()
        .map(|path| {
            let outcome = std::fs::read(path)
                .map_err(Into::into)
                .and_then(|data| Animation::probe(Bytes::from(data)));
            if let Err(ref error) = outcome {
                tracing::debug!(path = %path.display(), %error, "Failed to probe file");
            }
            Probe {
                path: path.clone(),
                outcome,
            }
        })
        .collect();

    if json {
        output::print_probes_json(&probes)
    } else {
        output::print_probes(&probes);
        Ok(())
    }
}
