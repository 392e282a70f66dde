use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use feedmerge::resolution::Strategies;
use feedmerge::store::{import_feed, AgencyDirectory, FeedId, FeedStore, NewFeed};
use feedmerge::tasks::TaskId;
use feedmerge::{
    Configuration, FeedService, MemoryStore, MergeRequest, MergeTarget, SplitRequest, Strategy,
    TaskStatus, TokioScheduler,
};
use gtfs_structures::{EntityType, GtfsReader, GtfsWriter};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(50);

/// Merge GTFS feeds, or split routes out of one
#[derive(Parser)]
#[command(name = "feedmerge")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine settings. A missing file gives the defaults
    #[arg(long, global = true, env = "FEEDMERGE_CONFIG", default_value = "feedmerge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the conflicts and counts of merging feeds, as JSON
    Validate {
        /// GTFS directories or zip archives
        #[arg(required = true, num_args = 2..)]
        feeds: Vec<PathBuf>,
    },

    /// Merge feeds into a new GTFS directory
    Merge(MergeArgs),

    /// Move routes of a feed, and what they need, into a new GTFS directory
    Split(SplitArgs),
}

#[derive(Args)]
struct MergeArgs {
    /// GTFS directories or zip archives
    #[arg(required = true, num_args = 2..)]
    feeds: Vec<PathBuf>,

    /// Directory receiving the merged feed
    #[arg(long)]
    out: PathBuf,

    /// Strategy of one entity type, e.g. `--strategy route=auto_prefix`
    #[arg(long = "strategy", value_parser = parse_strategy)]
    strategies: Vec<(EntityType, Strategy)>,

    /// Strategy of the types without `--strategy`, overrides the configuration
    #[arg(long)]
    default_strategy: Option<Strategy>,

    #[arg(long, default_value = "merged")]
    agency_name: String,

    #[arg(long, default_value = "merged")]
    feed_name: String,
}

#[derive(Args)]
struct SplitArgs {
    /// GTFS directory or zip archive
    feed: PathBuf,

    /// Route ids to move, comma separated
    #[arg(long, required = true, value_delimiter = ',')]
    routes: Vec<String>,

    /// Directory receiving the new feed
    #[arg(long, required_unless_present = "dry_run")]
    out: Option<PathBuf>,

    #[arg(long, default_value = "split")]
    agency_name: String,

    #[arg(long, default_value = "split")]
    feed_name: String,

    /// Remove the moved rows that nothing else uses from the source
    #[arg(long, requires = "retained_out")]
    remove_from_source: bool,

    /// Directory receiving what is left of the source
    #[arg(long)]
    retained_out: Option<PathBuf>,

    /// Only print the dependencies
    #[arg(long)]
    dry_run: bool,
}

fn parse_strategy(s: &str) -> std::result::Result<(EntityType, Strategy), String> {
    let (entity_type, strategy) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <type>=<strategy>, got '{s}'"))?;
    Ok((entity_type.trim().parse()?, strategy.trim().parse()?))
}

/// Reads a feed and stores it under an agency named after the file
fn import(store: &MemoryStore, path: &Path) -> Result<FeedId> {
    let read = GtfsReader::default()
        .read_from_path(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let agency = store.create_agency(&name, None)?;
    let record = import_feed(
        store,
        NewFeed {
            agency_id: agency.id,
            name,
            description: None,
            origin: read.sha256.map(|hash| format!("sha256:{hash}")),
        },
        read.feed,
    )?;
    info!(
        "{} imported as feed {} ({} files)",
        path.display(),
        record.id,
        read.files.len()
    );
    Ok(record.id)
}

/// Writes the rows of a feed; agency.txt is not written, agencies live in the directory
fn write(store: &MemoryStore, feed_id: FeedId, out: &Path) -> Result<()> {
    let feed = store.load(feed_id)?;
    GtfsWriter::default()
        .write_to_directory(&feed, out)
        .with_context(|| format!("cannot write {}", out.display()))?;
    info!("feed {feed_id} written to {}", out.display());
    Ok(())
}

/// Waits for the task, if any, and returns the feed it produced
async fn produced_feed(
    scheduler: &TokioScheduler,
    task_id: Option<TaskId>,
    status: TaskStatus,
    feed_id: Option<FeedId>,
    message: String,
) -> Result<FeedId> {
    let (status, feed_id, message) = match task_id {
        Some(id) => {
            let info = scheduler.wait(id, POLL).await?;
            let feed_id = info.outcome.and_then(|o| o.feed_id);
            (info.status, feed_id, info.message.unwrap_or(message))
        }
        None => (status, feed_id, message),
    };
    match (status, feed_id) {
        (TaskStatus::Completed, Some(feed_id)) => Ok(feed_id),
        _ => bail!("{status}: {message}"),
    }
}

async fn run(command: Commands, mut config: Configuration) -> Result<()> {
    if let Commands::Merge(MergeArgs {
        default_strategy: Some(strategy),
        ..
    }) = &command
    {
        config.default_strategy = *strategy;
    }
    let scheduler = Arc::new(TokioScheduler::current()?);
    let store = Arc::new(MemoryStore::new());
    let service = FeedService::new(store.clone(), scheduler.clone(), config);

    match command {
        Commands::Validate { feeds } => {
            let sources = feeds
                .iter()
                .map(|p| import(&store, p))
                .collect::<Result<Vec<_>>>()?;
            let result = service.validate_merge(&MergeRequest {
                sources,
                target: MergeTarget::NewAgency {
                    name: "merged".to_owned(),
                    description: None,
                },
                feed_name: "merged".to_owned(),
                feed_description: None,
                activate_on_success: None,
                strategies: Strategies::new(),
            })?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Merge(args) => {
            let sources = args
                .feeds
                .iter()
                .map(|p| import(&store, p))
                .collect::<Result<Vec<_>>>()?;
            let request = MergeRequest {
                sources,
                target: MergeTarget::NewAgency {
                    name: args.agency_name,
                    description: None,
                },
                feed_name: args.feed_name,
                feed_description: None,
                activate_on_success: Some(true),
                strategies: args.strategies.into_iter().collect(),
            };
            let response = service.execute_merge(&request)?;
            if response.status == TaskStatus::Failed {
                if let Some(validation) = &response.validation_result {
                    println!("{}", serde_json::to_string_pretty(validation)?);
                }
            }
            let feed_id = produced_feed(
                &scheduler,
                response.task_id,
                response.status,
                response.new_feed_id,
                response.message,
            )
            .await?;
            write(&store, feed_id, &args.out)?;
        }
        Commands::Split(args) => {
            let source = import(&store, &args.feed)?;
            let dependencies = service.compute_split_dependencies(source, &args.routes)?;
            println!("{}", serde_json::to_string_pretty(&dependencies)?);
            if args.dry_run {
                return Ok(());
            }
            let out = args.out.context("--out is required")?;
            let agency_id = store
                .feed(source)?
                .map(|r| r.agency_id)
                .context("the imported feed is gone")?;
            let response = service.execute_split(
                agency_id,
                &SplitRequest {
                    feed_id: source,
                    route_ids: args.routes,
                    new_agency_name: args.agency_name,
                    new_agency_description: None,
                    new_feed_name: args.feed_name,
                    copy_users: false,
                    remove_from_source: args.remove_from_source,
                },
            )?;
            let feed_id = produced_feed(
                &scheduler,
                response.task_id,
                response.status,
                response.new_feed_id,
                response.message,
            )
            .await?;
            write(&store, feed_id, &out)?;
            if let Some(retained) = args.retained_out {
                write(&store, source, &retained)?;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Configuration::load(&cli.config)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let runtime = tokio::runtime::Runtime::new().context("cannot start the tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}
