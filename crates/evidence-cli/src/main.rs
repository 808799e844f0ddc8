use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::B256;
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use evidence_data::fixture::FixtureSource;
use evidence_data::rpc::RpcSource;
use evidence_data::store::{stream_counts, SqliteSink};
use evidence_data::{ChainSource, JsonlShardSink, RecordSink};
use evidence_derive::{Pipeline, PipelineConfig, RunProgress, RunSummary};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

const RPC_URL_ENV: &str = "EVIDENCE_RPC_URL";

#[derive(Parser, Debug)]
#[command(name = "evidence")]
#[command(about = "Derive forensic evidence streams from mined EVM transactions")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch transactions from a JSON-RPC endpoint and derive evidence.
    Derive(DeriveArgs),
    /// Derive evidence from a recorded fixture file, without network access.
    Replay(ReplayArgs),
    /// Summarize the streams of a finished run.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct DeriveArgs {
    /// JSON-RPC endpoint; falls back to the EVIDENCE_RPC_URL environment variable.
    #[arg(long)]
    rpc_url: Option<String>,

    /// File with one transaction hash per line (`#` starts a comment).
    #[arg(long)]
    tx_file: PathBuf,

    /// Seconds to wait for each tracer call before giving up on it.
    #[arg(long, default_value_t = 30)]
    tracer_timeout_secs: u64,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Recorded fixture (`{"transactions": [...]}`).
    #[arg(long)]
    fixture: PathBuf,

    /// Hashes to replay; defaults to every fixture transaction in file order.
    #[arg(long)]
    tx_file: Option<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Parent directory of the per-run output directory.
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Maximum records per JSONL shard file.
    #[arg(long, default_value_t = 1000)]
    shard_size: usize,

    /// Run identifier stamped on every record; generated from the clock if omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Write records to this SQLite database instead of JSONL shards.
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Look up code and final balance for every profiled address.
    #[arg(long)]
    enrich_profiles: bool,
}

/// Arguments for the `inspect` subcommand.
///
/// Reads `manifest.json` from a JSONL run directory, or per-stream counts
/// from a SQLite database.
#[derive(Args, Debug)]
struct InspectArgs {
    /// JSONL run directory (containing manifest.json).
    #[arg(long, conflicts_with = "sqlite")]
    dir: Option<PathBuf>,

    #[arg(long, requires = "run_id")]
    sqlite: Option<PathBuf>,

    #[arg(long)]
    run_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Derive(args) => handle_derive(args, cli.quiet).await,
        Commands::Replay(args) => handle_replay(args, cli.quiet).await,
        Commands::Inspect(args) => handle_inspect(args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn handle_derive(args: DeriveArgs, quiet: bool) -> Result<()> {
    let rpc_url = args
        .rpc_url
        .or_else(|| std::env::var(RPC_URL_ENV).ok())
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| eyre!("--rpc-url or {RPC_URL_ENV} is required for derive"))?;
    let hashes = read_tx_file(&args.tx_file)?;

    let source = RpcSource::new(&rpc_url)
        .await
        .wrap_err("failed to connect to RPC endpoint")?
        .with_tracer_timeout(Duration::from_secs(args.tracer_timeout_secs));

    execute(source, &hashes, &args.output, quiet).await
}

async fn handle_replay(args: ReplayArgs, quiet: bool) -> Result<()> {
    let source = FixtureSource::load(&args.fixture)?;
    let hashes = match &args.tx_file {
        Some(path) => read_tx_file(path)?,
        None => source.hashes(),
    };
    if hashes.is_empty() {
        bail!("fixture {} contains no transactions", args.fixture.display());
    }

    execute(source, &hashes, &args.output, quiet).await
}

async fn execute<S: ChainSource>(
    source: S,
    hashes: &[B256],
    output: &OutputArgs,
    quiet: bool,
) -> Result<()> {
    let run_id = output
        .run_id
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().format("run-%Y%m%dT%H%M%SZ").to_string());
    let config = PipelineConfig::new(run_id.as_str()).with_enrichment(output.enrich_profiles);
    config.validate()?;

    let sink = open_sink(output, &run_id)?;
    let pb = progress_bar(hashes.len() as u64, quiet)?;
    let reporter = pb.clone();

    let mut pipeline = Pipeline::new(source, sink, config).on_progress(move |p: RunProgress| {
        reporter.set_position(p.processed as u64);
        if p.failures > 0 {
            reporter.set_message(format!("{} fetch failures", p.failures));
        }
    });
    let summary = pipeline.run(hashes).await?;
    pb.finish_with_message("derivation complete");

    info!(
        run_id = %summary.run_id,
        processed = summary.processed,
        fetch_failures = summary.fetch_failures,
        "derive command finished"
    );
    print_summary(&summary);
    Ok(())
}

fn open_sink(output: &OutputArgs, run_id: &str) -> Result<Box<dyn RecordSink>> {
    if let Some(path) = &output.sqlite {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let path = path_str(path)?;
        let sink = SqliteSink::new(path, run_id).wrap_err("failed to open SQLite sink")?;
        return Ok(Box::new(sink));
    }

    let root = output.out_dir.join(run_id);
    let sink = JsonlShardSink::new(&root, run_id, output.shard_size)
        .wrap_err("failed to open JSONL sink")?;
    Ok(Box::new(sink))
}

fn progress_bar(len: u64, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Parses one 32-byte hash per line, skipping blanks and `#` comments.
fn read_tx_file(path: &Path) -> Result<Vec<B256>> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let hashes = parse_tx_list(&content)
        .wrap_err_with(|| format!("invalid transaction list {}", path.display()))?;
    if hashes.is_empty() {
        bail!("transaction list {} is empty", path.display());
    }
    Ok(hashes)
}

fn parse_tx_list(content: &str) -> Result<Vec<B256>> {
    content
        .lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.split('#').next().unwrap_or_default().trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(line_number, line)| {
            line.parse::<B256>()
                .map_err(|err| eyre!("line {line_number}: {line:?} is not a transaction hash: {err}"))
        })
        .collect()
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Run", summary.run_id.as_str()]);
    table.add_row(vec!["Sink", summary.sink.backend]);
    table.add_row(vec!["Requested", &summary.requested.to_string()]);
    table.add_row(vec!["Processed", &summary.processed.to_string()]);
    table.add_row(vec!["Fetch failures", &summary.fetch_failures.to_string()]);
    table.add_row(vec!["Traces captured", &summary.traces_captured.to_string()]);
    table.add_row(vec!["Prestates captured", &summary.prestates_captured.to_string()]);
    table.add_row(vec!["Profiles", &summary.profiles.to_string()]);
    println!("{table}\n");

    let mut streams = Table::new();
    streams.load_preset(UTF8_BORDERS_ONLY);
    streams.set_header(vec!["Stream", "Records", "Shards"]);
    for stream in &summary.sink.streams {
        streams.add_row(vec![
            stream.name.clone(),
            stream.records.to_string(),
            stream.shards.len().to_string(),
        ]);
    }
    println!("{streams}");
}

#[derive(Debug, Deserialize)]
struct ManifestView {
    run_id: String,
    shard_capacity: usize,
    streams: Vec<ManifestStreamView>,
}

#[derive(Debug, Deserialize)]
struct ManifestStreamView {
    name: String,
    records: u64,
    shards: Vec<String>,
    when_empty: String,
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);

    match (&args.dir, &args.sqlite, &args.run_id) {
        (Some(dir), _, _) => {
            let path = dir.join("manifest.json");
            let body = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            let manifest: ManifestView = serde_json::from_str(&body)
                .wrap_err_with(|| format!("malformed manifest {}", path.display()))?;

            println!(
                "Run {} (shard capacity {})\n",
                manifest.run_id, manifest.shard_capacity
            );
            table.set_header(vec!["Stream", "Records", "Shards", "If empty"]);
            for stream in manifest.streams {
                let note = if stream.records == 0 {
                    stream.when_empty
                } else {
                    String::new()
                };
                table.add_row(vec![
                    stream.name,
                    stream.records.to_string(),
                    stream.shards.len().to_string(),
                    note,
                ]);
            }
        }
        (None, Some(db), Some(run_id)) => {
            let counts = stream_counts(path_str(db)?, run_id)?;
            if counts.is_empty() {
                bail!("run {run_id} not found in {}", db.display());
            }
            println!("Run {run_id} ({})\n", db.display());
            table.set_header(vec!["Stream", "Records"]);
            for (name, records) in counts {
                table.add_row(vec![name, records.to_string()]);
            }
        }
        _ => bail!("inspect needs --dir, or --sqlite with --run-id"),
    }

    println!("{table}");
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre!("path {} is not valid UTF-8", path.display()))
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create directory {}", path.display()))
}
