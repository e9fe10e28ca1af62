use campaign_runner::{
    campaign::{order_benchmarks, resolve_workpackages, run_campaign, CampaignReport},
    config::CampaignConfig,
    database,
    executors::Executors,
    ingest::Ingestors,
    parameters::nodes::{translate_custom_nodes, NodeRequest, SlurmNodeSet},
};
use clap::{Parser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Run parameterized benchmark campaigns on a batch scheduler
#[derive(Parser, Debug)]
#[command(name = "campaign", version, about)]
struct Cli {
    /// raise the log level, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch all benchmarks and poll them until they are done
    Run {
        config: PathBuf,
        /// write the final report as YAML to this file instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
        /// use the mock executor regardless of the config
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the resolved parameters of every workpackage
    Resolve {
        config: PathBuf,
        #[arg(long)]
        benchmark: Option<String>,
    },
    /// Print the parameters generated for custom node requests, e.g. `6 1:cn184`
    Nodes {
        #[arg(required = true, value_parser = parse_node_request)]
        requests: Vec<NodeRequest>,
    },
}

fn parse_node_request(text: &str) -> Result<NodeRequest, String> {
    let (nodes, label) = match text.split_once(':') {
        Some((nodes, label)) => (nodes, Some(label)),
        None => (text, None),
    };

    match nodes.parse::<u32>() {
        Ok(0) => Err(String::from("at least one node has to be requested")),
        Ok(nodes) => Ok(NodeRequest::new(nodes, label.filter(|label| !label.is_empty()))),
        Err(error) => Err(format!("invalid node count {nodes:?}: {error}")),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Option<CampaignConfig> {
    let mut config = match CampaignConfig::load(path) {
        Ok(config) => config,
        Err(error) => {
            error!(path = ?path, "{error}");

            return None;
        }
    };

    if config.preflight_checks() {
        error!("Config contains errors, refusing to continue");

        return None;
    }

    Some(config)
}

fn run(config: PathBuf, report_path: Option<PathBuf>, dry_run: bool) -> ExitCode {
    let Some(mut config) = load_config(&config) else {
        return ExitCode::FAILURE;
    };

    if dry_run {
        info!("Dry run, nothing is submitted");
        config.executor.name = String::from("mock");
    }

    let loaded = Executors::load(&config).and_then(|executor| {
        let ingestor = Ingestors::load(&config.ingest, config.campaign.outpath.clone())?;

        Ok((
            executor,
            ingestor,
            config.benchmarks()?,
            config.settings()?,
        ))
    });
    let (executor, ingestor, benchmarks, settings) = match loaded {
        Ok(loaded) => loaded,
        Err(error) => {
            error!("{error}");

            return ExitCode::FAILURE;
        }
    };

    let gateway = executor.gateway();
    let report = run_campaign(
        benchmarks,
        &executor,
        &gateway,
        &ingestor,
        &settings,
        |view| info!("\n{view}"),
    );

    if let Some(database) = &config.database {
        match database::store_report(&database.path, &report, config.campaign.comment.as_deref())
        {
            Ok(id) => info!(id, path = ?database.path, "Stored campaign"),
            Err(error) => warn!(error = %error, "Failed to store campaign"),
        }
    }

    if let Err(error) = write_report(&report, report_path) {
        error!("{error}");

        return ExitCode::FAILURE;
    }

    let failed = report.failed().count();

    if failed > 0 {
        error!("{failed} benchmark(s) failed");

        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn write_report(report: &CampaignReport, path: Option<PathBuf>) -> Result<(), String> {
    let yaml = serde_yaml::to_string(report).map_err(|error| error.to_string())?;

    match path {
        Some(path) => fs::write(&path, yaml)
            .map_err(|error| format!("Failed to write report to {path:?}: {error}")),
        None => {
            print!("{yaml}");

            Ok(())
        }
    }
}

fn resolve(config: PathBuf, only: Option<String>) -> ExitCode {
    let Some(config) = load_config(&config) else {
        return ExitCode::FAILURE;
    };

    let (benchmarks, settings) = match config.benchmarks().and_then(|benchmarks| {
        config.settings().map(|settings| (benchmarks, settings))
    }) {
        Ok(loaded) => loaded,
        Err(error) => {
            error!("{error}");

            return ExitCode::FAILURE;
        }
    };

    let mut code = ExitCode::SUCCESS;

    for benchmark in order_benchmarks(benchmarks)
        .into_iter()
        .filter(|benchmark| only.as_ref().map_or(true, |name| *name == benchmark.name))
    {
        match resolve_workpackages(&benchmark, &settings.platform, settings.node_syntax.as_ref())
        {
            Ok(workpackages) => {
                for workpackage in workpackages {
                    println!("{}/{:06}", benchmark.name, workpackage.index);

                    for (name, value) in workpackage.parameters.iter() {
                        println!("  {name} = {value}");
                    }
                }
            }
            Err(error) => {
                error!(benchmark = %benchmark.name, "{error}");
                code = ExitCode::FAILURE;
            }
        }
    }

    code
}

fn nodes(requests: Vec<NodeRequest>) -> ExitCode {
    let fragment = translate_custom_nodes(&requests, &SlurmNodeSet);

    for (name, raw) in fragment.table().iter() {
        println!("{name}: {raw}");
    }

    println!("result columns: {}", fragment.result_columns().join(", "));

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run {
            config,
            report,
            dry_run,
        } => run(config, report, dry_run),
        Command::Resolve { config, benchmark } => resolve(config, benchmark),
        Command::Nodes { requests } => nodes(requests),
    }
}
