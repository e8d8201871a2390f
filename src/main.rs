use kyrk_qa::config::{AppConfig, DEFAULT_MAX_REQUEST_BYTES, DEFAULT_PORT, DEFAULT_SECRETS_FILE};
use kyrk_qa::loader::load_dataset;
use kyrk_qa::locator::{locate_csv, CsvSource};
use kyrk_qa::prompt::{Variant, SAMPLE_ROWS};
use kyrk_qa::render::{format_grid, Rendered};
use kyrk_qa::server;
use kyrk_qa::session::{AppSession, Answer, DatasetSummary};

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kyrk")]
#[command(about = "Ask natural-language questions about race results")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Clone)]
struct Common {
    /// Directory searched for KYRK_RESULTS.csv, then any *.csv
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Use this CSV file instead of searching the directory
    #[arg(long)]
    csv: Option<PathBuf>,

    /// classic (bare question) or guided (race-results preamble)
    #[arg(long, default_value = "guided")]
    variant: Variant,

    /// Chat model (or set OPENAI_MODEL env var)
    #[arg(long)]
    model: Option<String>,

    /// OpenAI-compatible API base URL (or set OPENAI_BASE_URL env var)
    #[arg(long)]
    base_url: Option<String>,

    /// Env-format file consulted when OPENAI_API_KEY is not set
    #[arg(long, default_value = DEFAULT_SECRETS_FILE)]
    secrets_file: PathBuf,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,
}

impl Common {
    fn config(&self) -> AppConfig {
        let mut config = AppConfig::from_env();
        config.data_dir = self.dir.clone();
        config.csv_override = self.csv.clone();
        config.variant = self.variant;
        config.secrets_file = self.secrets_file.clone();
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the question page and JSON API
    Serve {
        #[command(flatten)]
        common: Common,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Largest accepted request (uploads included), in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
        max_request_bytes: usize,
    },
    /// Ask one question and print the answer
    Ask {
        /// The question in natural language
        question: String,

        #[command(flatten)]
        common: Common,

        /// Also write a tabular answer to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Show the columns and first rows of the located dataset
    Inspect {
        #[command(flatten)]
        common: Common,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kyrk_qa=info,kyrk=info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            common,
            bind,
            port,
            max_request_bytes,
        } => {
            let mut config = common.config();
            config.bind = bind;
            config.port = port;
            config.max_request_bytes = max_request_bytes;
            run_server(config, common.api_key).await
        }
        Commands::Ask {
            question,
            common,
            export,
        } => run_ask(common.config(), common.api_key, &question, export).await,
        Commands::Inspect { common } => run_inspect(common.config()),
    }
}

async fn run_server(config: AppConfig, api_key: Option<String>) -> Result<()> {
    let session = AppSession::bootstrap(config, api_key)?;

    match session.summary().await {
        Ok(summary) => info!(
            "Dataset {} ready ({} rows, {} columns)",
            summary.source,
            summary.rows,
            summary.columns.len()
        ),
        Err(e) if e.is_startup_fatal() => warn!("{} Waiting for an upload.", e),
        Err(e) => return Err(e.into()),
    }

    server::serve(Arc::new(session)).await?;
    Ok(())
}

async fn run_ask(
    config: AppConfig,
    api_key: Option<String>,
    question: &str,
    export: Option<PathBuf>,
) -> Result<()> {
    let session = AppSession::bootstrap(config, api_key)?;

    match session.ask(question).await? {
        Answer::Ok { rendered } => {
            print!("{}", rendered.to_terminal());
            if let Some(path) = export {
                match &rendered {
                    Rendered::Table { csv, .. } => {
                        std::fs::write(&path, csv)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        info!("Answer written to {}", path.display());
                    }
                    Rendered::Text { .. } => warn!("Answer is not a table; nothing exported"),
                }
            }
            Ok(())
        }
        Answer::Error { error } => bail!(error),
    }
}

fn run_inspect(config: AppConfig) -> Result<()> {
    let source = match &config.csv_override {
        Some(path) => CsvSource::File(path.clone()),
        None => locate_csv(&config.data_dir, None)?,
    };
    let dataset = load_dataset(&source, config.variant)?;
    let summary = DatasetSummary::new(&source, &dataset);

    println!("{} ({} rows)", summary.source, summary.rows);
    for column in &summary.columns {
        println!("  {:<24} {}", column.name, column.kind);
    }
    println!();

    let columns: Vec<String> = dataset.column_names().iter().map(|s| s.to_string()).collect();
    let rows: Vec<Vec<String>> = (0..dataset.row_count().min(SAMPLE_ROWS))
        .map(|idx| dataset.row_text(idx))
        .collect();
    print!("{}", format_grid(&columns, &rows));
    Ok(())
}
