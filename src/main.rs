mod config;
mod coordinator;
mod exporter;
mod lines;
mod location;
mod parser;
mod stats;

use clap::Parser;
use config::{ConfigError, ExporterConfig};
use coordinator::{FieldErrorPolicy, RunError, RunSummary};
use exporter::{PrometheusSink, PushTarget};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

/// Extracts rsync statistics from rsnapshot output (read on stdin) and
/// publishes them to a Prometheus Pushgateway.
#[derive(Parser, Debug)]
#[command(name = "rsnap-prom-stats", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "rsnap-prom-stats.toml")]
    config: PathBuf,

    /// Address of the pushgateway to publish to. If set to '-' the metrics
    /// are printed to stdout instead (overrides config)
    #[arg(long)]
    pushgw: Option<String>,

    /// Pushgateway job name (overrides config)
    #[arg(long)]
    job: Option<String>,

    /// Value of the instance label (default: local host name)
    #[arg(long)]
    instance: Option<String>,

    /// Read rsnapshot output from a file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Abort on a malformed statistics field instead of skipping the block
    #[arg(long)]
    strict: bool,

    /// Print the resolved config and exit without reading input
    #[arg(long)]
    dry_run: bool,

    /// Print some information about progress
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, cfg: &mut ExporterConfig) {
        if let Some(gw) = &self.pushgw {
            cfg.push.gateway = gw.clone();
        }
        if let Some(job) = &self.job {
            cfg.push.job = job.clone();
        }
        if let Some(instance) = &self.instance {
            cfg.labels.instance = Some(instance.clone());
        }
        if self.strict {
            cfg.parse.strict = true;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Load the config file, apply CLI overrides, and validate the result.
fn resolve_config(cli: &Cli) -> Result<ExporterConfig, ConfigError> {
    let mut cfg = ExporterConfig::load(&cli.config)?;
    cli.apply_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = resolve_config(&cli)?;

    if cli.dry_run {
        print!("{}", toml::to_string_pretty(&cfg)?);
        return Ok(());
    }

    let local_host = location::local_host();
    let sink = PrometheusSink::new(cfg.default_labels(local_host))?;
    let policy = cfg.field_error_policy();

    let start = stats::wall_clock();
    tracing::info!("Started");

    let input = cli.input.clone();
    let (sink, summary) = tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        let summary = read_input(input, local_host, &mut sink, policy);
        (sink, summary)
    })
    .await?;
    let summary = summary?;

    let end = stats::wall_clock();
    tracing::info!(
        lines = summary.lines,
        published = summary.published,
        failed = summary.failed,
        discarded = summary.discarded,
        rejected = summary.rejected,
        "Finished reading output"
    );
    sink.record_run(start, end)?;

    if cfg.prints_to_stdout() {
        print!("{}", sink.render()?);
    } else {
        let target = PushTarget {
            gateway: cfg.push.gateway.clone(),
            job: cfg.push.job.clone(),
            timeout: Duration::from_secs(cfg.push.timeout_secs),
        };
        sink.push(&target).await?;
    }
    Ok(())
}

/// Run the coordinator over the chosen input, on the current thread.
fn read_input(
    input: Option<PathBuf>,
    local_host: &str,
    sink: &mut PrometheusSink,
    policy: FieldErrorPolicy,
) -> Result<RunSummary, RunError> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => {
            let file = std::fs::File::open(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))
            })?;
            Box::new(std::io::BufReader::new(file))
        }
        None => Box::new(std::io::stdin().lock()),
    };
    coordinator::process_stream(reader, local_host, sink, policy)
}
