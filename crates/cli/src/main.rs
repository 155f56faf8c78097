use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kiln_core::{config, synthesize_domain, DefaultSource, FlagSource, InteractiveSource, OptionOrigin, OptionSet, OptionSource, Timeouts};
use kiln_deploy::{default_options, standard_units, DirManifests, InstallContext, Orchestrator, Unit, SYSTEM_DOMAIN};
use kiln_kubehub::{wait, ClusterOps, KubeCluster};
use kiln_stage::{AppRef, StageConfig, Stager};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln platform installer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig to use instead of KUBECONFIG / ~/.kube/config
    #[arg(long = "kubeconfig", global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(clap::Args, Debug, Default)]
struct OptionArgs {
    /// System domain; derived from the ingress address when omitted
    #[arg(long = "system-domain")]
    system_domain: Option<String>,
    /// Installation option as name=value, e.g. workloads.warmup=false (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,
    /// Prompt for options not given on the command line
    #[arg(long = "interactive", action = ArgAction::SetTrue)]
    interactive: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install every platform unit
    Install(OptionArgs),
    /// Remove every Kiln-owned unit, newest first
    Uninstall,
    /// Re-apply upgradable units
    Upgrade(OptionArgs),
    /// Cluster version, platform and unit versions
    Info,
    /// Write unit backups into a directory
    Backup {
        #[arg(long = "dir")]
        dir: PathBuf,
    },
    /// Restore unit backups from a directory
    Restore {
        #[arg(long = "dir")]
        dir: PathBuf,
    },
    /// Start a build of an application
    Stage {
        #[arg(long = "org")]
        org: String,
        #[arg(long = "name")]
        name: String,
        #[arg(long = "revision", default_value = "main")]
        revision: String,
        /// System domain; read from the ingress address when omitted
        #[arg(long = "system-domain")]
        system_domain: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Flags, then prompts (when asked for), then defaults.
fn populate(args: &OptionArgs) -> Result<OptionSet> {
    let mut flags = FlagSource::from_assignments(args.set.iter().map(String::as_str))?;
    if let Some(d) = &args.system_domain {
        flags = flags.with(SYSTEM_DOMAIN, d.clone());
    }
    let mut defaults = DefaultSource::new();
    let set = default_options()?;
    let set = if args.interactive {
        let mut prompts = InteractiveSource::new(BufReader::new(io::stdin()), io::stderr());
        set.populate([&mut flags as &mut dyn OptionSource, &mut prompts, &mut defaults])?
    } else {
        set.populate([&mut flags as &mut dyn OptionSource, &mut defaults])?
    };
    Ok(set)
}

fn orchestrator(cluster: &KubeCluster) -> Orchestrator<'_, Unit> {
    let manifests = DirManifests::new(config::manifest_dir());
    let ctx = InstallContext::new(Arc::new(manifests), Timeouts::from_env());
    Orchestrator::new(cluster, standard_units(), ctx)
}

fn print_options(set: &OptionSet) {
    eprintln!("{:<32} {:<36} ORIGIN", "OPTION", "VALUE");
    for (name, value, origin) in set.describe() {
        let shown = if name.ends_with("password") && !value.is_empty() { "********".to_string() } else { value };
        eprintln!("{:<32} {:<36} {}", name, shown, origin);
    }
}

#[derive(Serialize)]
struct InfoReport {
    server_version: String,
    platform: kiln_kubehub::PlatformInfo,
    units: Vec<kiln_deploy::UnitSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cluster = KubeCluster::connect(cli.kubeconfig.as_deref()).await.context("connecting to cluster")?;

    match cli.command {
        Commands::Install(args) => {
            let mut set = populate(&args)?;
            if cli.output == Output::Human {
                print_options(&set);
            }
            let mut orch = orchestrator(&cluster);
            orch.install(&mut set).await?;
            let domain = orch.system_domain().unwrap_or_default().to_string();
            match cli.output {
                Output::Human => println!("Kiln installed. System domain: {}", if domain.is_empty() { "<none>" } else { domain.as_str() }),
                Output::Json => println!("{}", serde_json::json!({ "installed": true, "system_domain": domain })),
            }
        }
        Commands::Uninstall => {
            orchestrator(&cluster).uninstall().await?;
            match cli.output {
                Output::Human => println!("Kiln uninstalled."),
                Output::Json => println!("{}", serde_json::json!({ "uninstalled": true })),
            }
        }
        Commands::Upgrade(args) => {
            let mut set = populate(&args)?;
            orchestrator(&cluster).upgrade(&mut set).await?;
            match cli.output {
                Output::Human => println!("Kiln upgraded."),
                Output::Json => println!("{}", serde_json::json!({ "upgraded": true })),
            }
        }
        Commands::Info => {
            let report = InfoReport {
                server_version: cluster.server_version().await?,
                platform: cluster.platform().await?,
                units: orchestrator(&cluster).describe(),
            };
            match cli.output {
                Output::Human => {
                    println!("Kubernetes: {}", report.server_version);
                    println!("Platform:   {}", report.platform.platform);
                    println!("Addresses:  {}", report.platform.external_ips.join(", "));
                    println!();
                    println!("{:<16} {:<10} DESCRIPTION", "UNIT", "VERSION");
                    for u in &report.units {
                        println!("{:<16} {:<10} {}", u.id, u.version, u.description);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Backup { dir } => {
            orchestrator(&cluster).backup(&dir).await?;
            println!("backup written to {}", dir.display());
        }
        Commands::Restore { dir } => {
            orchestrator(&cluster).restore(&dir).await?;
            println!("restored from {}", dir.display());
        }
        Commands::Stage { org, name, revision, system_domain } => {
            let cfg = match system_domain {
                Some(d) => StageConfig::new(d),
                None => {
                    let ip = wait::external_ip(&cluster, "metadata.name=traefik")
                        .await?
                        .context("no system domain given and the ingress has no external address")?;
                    StageConfig::new(synthesize_domain(&ip)).with_domain_origin(OptionOrigin::Computed)
                }
            };
            let stager = Stager::new(&cluster, cfg);
            let outcome = stager.stage(&AppRef::new(org, name, revision)).await?;
            match cli.output {
                Output::Human => println!("pipeline run {} created (certificate {:?})", outcome.pipeline_run, outcome.certificate),
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
        }
    }
    Ok(())
}
