//! Cumulus CLI - start, inspect and stop compute clusters

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cumulus::cluster::{DetachPolicy, TeardownOutcome};
use cumulus::provider::{create_gateway, NodeView, ProviderType};
use cumulus::telemetry::{init_logging, LogFormat};
use cumulus::{
    ClusterController, ConfigFile, ControllerOptions, StartOptions, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_FILE,
};

/// Cumulus - lifecycle controller for ad-hoc compute clusters
#[derive(Parser, Debug)]
#[command(name = "cumulus", version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.cumulus/config.yaml)
    #[arg(short = 'c', long = "config", env = CONFIG_PATH_ENV, global = true)]
    config: Option<PathBuf>,

    /// Provider backend
    #[arg(long, env = "CUMULUS_PROVIDER", default_value = "simulated", global = true)]
    provider: ProviderType,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a cluster template against the settings schema and the provider
    Validate(ClusterArgs),

    /// Launch a cluster and wait until every node is up
    Start(StartArgs),

    /// Terminate every node of a cluster
    Stop(StopArgs),

    /// Terminate every node except the master
    StopWorkers(ClusterArgs),

    /// Show whether a cluster is up and list its nodes
    Status(ClusterArgs),

    /// List the cluster templates in the settings file
    List(ListArgs),
}

/// Selects one cluster
#[derive(Args, Debug)]
struct ClusterArgs {
    /// Cluster template name
    cluster: String,

    /// Tag of an existing cluster (overrides the template's tag)
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Wait for an already launched cluster instead of launching
    #[arg(long)]
    no_create: bool,

    /// Give up waiting after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct StopArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// How hard to try detaching the volume before terminating
    #[arg(long, default_value = "best-effort")]
    detach_policy: DetachPolicy,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct TemplateSummary<'a> {
    name: &'a str,
    cluster_size: Option<u32>,
    instance_type: Option<&'a str>,
    node_image_id: Option<&'a str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let file = ConfigFile::load(&config_path)?;

    match cli.command {
        Commands::Validate(args) => {
            let controller = controller(&file, &args, cli.provider, ControllerOptions::default())?;
            let report = controller.validate().await;
            if !report.is_valid() {
                for failure in &report.failures {
                    eprintln!("  {failure}");
                }
                bail!("cluster '{}' is not valid", args.cluster);
            }
            println!("cluster '{}' is valid", args.cluster);
        }
        Commands::Start(args) => {
            let controller =
                controller(&file, &args.cluster, cli.provider, ControllerOptions::default())?;
            let cancel = cancel_on_signal(args.timeout.map(Duration::from_secs));
            let report = controller
                .start(
                    StartOptions {
                        create: !args.no_create,
                    },
                    &cancel,
                )
                .await?;
            println!(
                "cluster {} is up: {} nodes in {:.1}s",
                controller.config().cluster_tag,
                report.nodes.len(),
                report.elapsed.as_secs_f64()
            );
        }
        Commands::Stop(args) => {
            let options = ControllerOptions {
                detach_policy: args.detach_policy,
                ..ControllerOptions::default()
            };
            let controller = controller(&file, &args.cluster, cli.provider, options)?;
            let confirmed = args.yes
                || confirm(">>> This will shutdown all instances. Are you sure (yes/no)? ").await?;
            let outcome = controller.stop(confirmed, &cancel_on_signal(None)).await?;
            report_teardown(&outcome);
        }
        Commands::StopWorkers(args) => {
            let controller = controller(&file, &args, cli.provider, ControllerOptions::default())?;
            let outcome = controller.stop_workers(&cancel_on_signal(None)).await?;
            report_teardown(&outcome);
        }
        Commands::Status(args) => {
            let controller = controller(&file, &args, cli.provider, ControllerOptions::default())?;
            let up = controller.is_up().await?;
            let nodes = controller.nodes().await?;
            println!(
                "cluster {}: {}",
                controller.config().cluster_tag,
                if up { "up" } else { "not up" }
            );
            print_nodes(&nodes);
        }
        Commands::List(args) => {
            let templates: Vec<TemplateSummary<'_>> = file
                .clusters
                .iter()
                .map(|(name, t)| TemplateSummary {
                    name,
                    cluster_size: t.cluster_size,
                    instance_type: t.instance_type.as_deref(),
                    node_image_id: t.node_image_id.as_deref(),
                })
                .collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&templates)?);
            } else {
                for t in &templates {
                    println!(
                        "{:<20} size={:<4} type={:<12} image={}",
                        t.name,
                        t.cluster_size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                        t.instance_type.unwrap_or("-"),
                        t.node_image_id.unwrap_or("-"),
                    );
                }
            }
        }
    }

    Ok(())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .context("HOME is not set; pass --config or set CUMULUS_CONFIG")?;
    Ok(PathBuf::from(home).join(DEFAULT_CONFIG_FILE))
}

fn controller(
    file: &ConfigFile,
    args: &ClusterArgs,
    provider: ProviderType,
    options: ControllerOptions,
) -> anyhow::Result<ClusterController> {
    let mut config = file.cluster(&args.cluster)?;
    if let Some(tag) = &args.tag {
        config.cluster_tag = tag.clone();
    }
    let gateway = create_gateway(provider, &config)?;
    info!(cluster = %config.cluster_tag, provider = %provider, "using cluster");
    Ok(ClusterController::builder(config, gateway)
        .options(options)
        .build())
}

/// Token cancelled on ctrl-c or after `timeout`
fn cancel_on_signal(timeout: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });
    if let Some(timeout) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(timeout_secs = timeout.as_secs(), "timed out, cancelling");
            on_timeout.cancel();
        });
    }
    cancel
}

async fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;

    let mut answer = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    reader.read_line(&mut answer).await?;
    Ok(answer.trim() == "yes")
}

fn report_teardown(outcome: &TeardownOutcome) {
    match outcome {
        TeardownOutcome::Aborted => println!("exiting without shutting down instances"),
        TeardownOutcome::NothingToDo => println!("no running instances found"),
        TeardownOutcome::Terminated {
            terminated,
            remaining,
        } => {
            println!("terminated {} instances", terminated.len());
            if let Some(nodes) = remaining {
                print_nodes(nodes);
            }
        }
    }
}

fn print_nodes(nodes: &[NodeView]) {
    for node in nodes {
        println!(
            "  {:<20} {:<14} {}",
            node.instance_id,
            node.state.to_string(),
            node.hostname.as_deref().unwrap_or("-")
        );
    }
}
