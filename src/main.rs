mod config;
mod error;
mod llm;
mod orchestrator;
mod pipeline;
mod sandbox;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::{Orchestrator, RunSettings};
use crate::pipeline::{AnalysisRequest, ArtifactReference, PipelineStages};
use crate::sandbox::{ContainerRuntime, DockerCli};

const RESULT_HEADER: &str = "--- Analysis Result ---";
const RESULT_FOOTER: &str = "-----------------------";

const AFTER_HELP: &str = "\
ENVIRONMENT VARIABLES:
    OPENAI_API_KEY        API key for OpenAI models (default provider)
    ANTHROPIC_API_KEY     API key when [llm] provider = \"anthropic\"
    RUST_LOG              Log level filter for tracing
                          (e.g. debug, secure_analyzer=debug,warn)

EXAMPLES:
    analyze -f traffic.csv -q \"Which column correlates most with accidents?\"
    analyze -f traffic.csv -c accidents,traffic_density -q \"...\" --verbose
    analyze --config /etc/analyzer.toml -f data.csv -q \"...\"";

/// Answer a question about a CSV file by running model-written Python in an
/// isolated container.
#[derive(Parser, Debug)]
#[command(name = "analyze", version, about, after_help = AFTER_HELP)]
struct Cli {
    /// Data file to analyze
    #[arg(short, long)]
    file: PathBuf,

    /// Question to answer about the data
    #[arg(short, long)]
    question: String,

    /// Column names, comma separated (read from the header row when omitted)
    #[arg(short, long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Path to TOML configuration file [default: config/analyzer.toml if present]
    #[arg(long, env = "ANALYZER_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let default_filter = if cli.verbose {
        "secure_analyzer=debug"
    } else {
        "secure_analyzer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = run(cli).await;
    std::process::exit(code);
}

/// Returns the process exit code.
async fn run(cli: Cli) -> i32 {
    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    info!(
        "LLM: {} (context {}, code {})",
        config.llm.provider, config.llm.context_model, config.llm.code_model
    );

    let settings = RunSettings {
        credential: config.llm.resolve_credential(|var| std::env::var(var).ok()),
        credential_env_var: config.llm.credential_env_var(),
        sandbox: config.sandbox_spec(),
        build_timeout: config.limits.build_timeout(),
    };
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerCli::new(config.sandbox.docker_binary.clone())
            .with_command_timeout(config.limits.command_timeout()),
    );

    let orchestrator = match Orchestrator::new(settings, runtime, |credential| {
        PipelineStages::from_config(&config, credential)
    }) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let request = AnalysisRequest {
        artifact: ArtifactReference::new(cli.file, cli.columns),
        question: cli.question,
    };
    match orchestrator.run(&request, shutdown_signal()).await {
        Ok(result) => {
            println!("{}", result_block(&result.text));
            0
        }
        Err(e) => e.exit_code(),
    }
}

fn result_block(text: &str) -> String {
    format!("{RESULT_HEADER}\n{}\n{RESULT_FOOTER}", text.trim_end())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received, shutting down"),
        _ = terminate => info!("Termination signal received, shutting down"),
    }
}
