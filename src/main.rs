use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod combos;
mod config;
mod driver;
mod exec;
mod generate;
mod load_gen;
mod loadcfg;
mod measure;
mod run_gen;
mod serve_gen;
mod servecfg;

use config::{ClientProtocol, LaunchMode, ProfileConfig};
use driver::Profiler;
use exec::{LoadTool, ProcessServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Model-serving auto-tuner CLI")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search serving and load configurations, measuring each candidate
    Profile(ProfileArgs),
    /// Print the candidate runs the search would execute, without
    /// touching the serving runtime or the load tool
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// YAML file declaring the models to profile
    #[arg(long, short = 'f')]
    config_file: PathBuf,

    /// Repository holding the stored serving config of each model
    #[arg(long)]
    model_repository: PathBuf,

    /// Where candidate serving variants are staged
    #[arg(long, default_value = "output_models")]
    output_repository: PathBuf,

    /// Load-tool batch sizes to sweep
    #[arg(long, short = 'b', value_delimiter = ',', default_values_t = [1u64])]
    batch_sizes: Vec<u64>,

    /// Explicit load-tool concurrency list; overrides the ladder
    #[arg(long, short = 'c', value_delimiter = ',')]
    concurrency: Vec<u64>,

    /// Disable the automatic serving sweep and the concurrency ladder
    #[arg(long)]
    run_config_search_disable: bool,

    /// Floor for the automatic instance-count sweep
    #[arg(long, value_parser = value_parser!(u32).range(1..), default_value_t = 1)]
    run_config_search_min_instance_count: u32,

    /// Ceiling for the automatic instance-count sweep
    #[arg(long, value_parser = value_parser!(u32).range(1..), default_value_t = 5)]
    run_config_search_max_instance_count: u32,

    /// Start of the automatic max-batch-size ladder
    #[arg(long, value_parser = value_parser!(u64).range(1..), default_value_t = 1)]
    run_config_search_min_model_batch_size: u64,

    /// Cap of the automatic max-batch-size ladder
    #[arg(long, value_parser = value_parser!(u64).range(1..), default_value_t = 128)]
    run_config_search_max_model_batch_size: u64,

    /// Cap for the load concurrency ladder
    #[arg(long, value_parser = value_parser!(u64).range(1..), default_value_t = 1024)]
    run_config_search_max_concurrency: u64,

    /// How the serving runtime is operated
    #[arg(long, value_enum, default_value_t = LaunchMode::Local)]
    launch_mode: LaunchMode,

    /// Client protocol the load tool talks to the runtime with
    #[arg(long, value_enum, default_value_t = ClientProtocol::Grpc)]
    client_protocol: ClientProtocol,

    /// HTTP endpoint of the serving runtime
    #[arg(long, default_value = "localhost:8000")]
    http_endpoint: String,

    /// gRPC endpoint of the serving runtime
    #[arg(long, default_value = "localhost:8001")]
    grpc_endpoint: String,

    /// Output JSON file for the summary
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProfileArgs {
    #[command(flatten)]
    search: SearchArgs,

    /// Serving runtime binary to spawn per candidate run
    #[arg(long, default_value = "model-server")]
    server_path: PathBuf,

    /// Load-generator binary
    #[arg(long, default_value = "loadgen")]
    loadgen_path: PathBuf,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    search: SearchArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Profile(args) => {
            let mut config = build_config(&args.search)?;
            config.server_path = args.server_path;
            config.loadgen_path = args.loadgen_path;

            let server = ProcessServer::new(&config);
            let load_tool = LoadTool::new(&config);
            let mut profiler = Profiler::new(&config, server, load_tool);
            let summary = profiler.profile()?;

            let json = serde_json::to_string_pretty(&summary)?;
            println!("{}", json);
            if let Some(path) = &args.search.output {
                tokio::fs::write(path, json).await?;
                tracing::info!("profile summary written to {:?}", path);
            }
        }
        Command::Plan(args) => {
            let config = build_config(&args.search)?;
            let entries = driver::plan(&config)?;
            tracing::info!("search would execute {} runs", entries.len());

            let json = serde_json::to_string_pretty(&entries)?;
            println!("{}", json);
            if let Some(path) = &args.search.output {
                tokio::fs::write(path, json).await?;
                tracing::info!("plan written to {:?}", path);
            }
        }
    }

    Ok(())
}

fn build_config(args: &SearchArgs) -> Result<ProfileConfig> {
    let (profile_models, constraints) = config::load_model_file(&args.config_file)?;
    let config = ProfileConfig {
        model_repository: args.model_repository.clone(),
        output_repository: args.output_repository.clone(),
        batch_sizes: args.batch_sizes.clone(),
        concurrency: args.concurrency.clone(),
        search_disable: args.run_config_search_disable,
        min_instance_count: args.run_config_search_min_instance_count,
        max_instance_count: args.run_config_search_max_instance_count,
        min_model_batch_size: args.run_config_search_min_model_batch_size,
        max_model_batch_size: args.run_config_search_max_model_batch_size,
        max_concurrency: args.run_config_search_max_concurrency,
        launch_mode: args.launch_mode,
        client_protocol: args.client_protocol,
        http_endpoint: args.http_endpoint.clone(),
        grpc_endpoint: args.grpc_endpoint.clone(),
        profile_models,
        constraints,
        ..ProfileConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
