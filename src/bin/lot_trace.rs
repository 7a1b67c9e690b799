//! Lot Trace Command Line Interface
//!
//! Back-office access to the lot pipeline: register lots, record stages,
//! inspect and search aggregates, and (with the `server` feature) serve the
//! REST surface.
//!
//! # Usage
//!
//! ```bash
//! # Describe the secado schema
//! lot-trace schema secado
//!
//! # Register a lot
//! lot-trace create --field producto="Café Gourmet Lumora" --field caficultor="Pedro Perez" ...
//!
//! # Record a stage
//! lot-trace submit LOT2502417 secado --field metodoSecado=sol --field humedadFinal=11% \
//!     --field fechaSecado=2025-02-20
//!
//! # Inspect
//! lot-trace show LOT2502417
//! lot-trace list --search "pedro"
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use coffee_trace::{
    get_schema_by_name, ConfigLoader, FieldMap, HttpLotStore, InMemoryLotStore, LotId, LotStore,
    LotTrace, StageKind, SubmitOutcome, TraceConfig, TraceError, LOT_SCHEMA,
};

#[derive(Parser)]
#[command(name = "lot-trace")]
#[command(version)]
#[command(about = "Append-once traceability for coffee lots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file (overrides LOT_TRACE_CONFIG)
    #[arg(long, short, global = true, env = "LOT_TRACE_CONFIG")]
    config: Option<String>,

    /// Use a throwaway in-memory ledger instead of the configured gateway;
    /// its state lasts one invocation, or as long as `serve` runs
    #[arg(long, global = true)]
    memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the field schema of a stage, or of the base lot
    Schema {
        /// Stage key (cosecha, despulpado, ...); omit for the base lot
        stage: Option<String>,
    },

    #[command(flatten)]
    Ledger(LedgerCommand),
}

/// Commands that need a connected ledger.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Register a new lot
    Create {
        /// Base field as KEY=VALUE (repeatable)
        #[arg(long = "field", short = 'f', value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
    },

    /// Record one stage of a lot
    Submit {
        lot_id: String,
        stage: String,
        /// Stage field as KEY=VALUE (repeatable)
        #[arg(long = "field", short = 'f', value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
    },

    /// Show the aggregate record of a lot
    Show { lot_id: String },

    /// List every lot, optionally filtered
    List {
        #[arg(long, short)]
        search: Option<String>,
    },

    /// Serve the REST API
    #[cfg(feature = "server")]
    Serve {
        /// Bind address (defaults to listen_addr from config)
        #[arg(long)]
        addr: Option<String>,
    },
}

/// Parse a KEY=VALUE pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].trim().to_string(), s[pos + 1..].to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lot_id(raw: &str) -> Result<LotId> {
    LotId::new(raw).ok_or_else(|| anyhow!("lot id must not be blank"))
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // Caller-facing errors are reported as JSON; everything else as text.
            match e.downcast_ref::<TraceError>() {
                Some(trace_error) => {
                    let body = serde_json::json!({
                        "error": trace_error.code(),
                        "message": trace_error.to_string(),
                        "uncertain": trace_error.is_uncertain(),
                    });
                    println!("{body:#}");
                }
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Schema { stage } => {
            let schema = match stage {
                Some(name) => get_schema_by_name(&name)?,
                None => &LOT_SCHEMA,
            };
            print_json(&schema.describe())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ledger(command) => run_ledger(command, cli.config, cli.memory).await,
    }
}

async fn run_ledger(
    command: LedgerCommand,
    config_path: Option<String>,
    memory: bool,
) -> Result<ExitCode> {
    let config = match config_path {
        Some(path) => ConfigLoader::new(Some(path)).load()?,
        None => ConfigLoader::from_env().load()?,
    };
    let trace = Arc::new(connect(&config, memory).await?);

    match command {
        LedgerCommand::Create { fields } => {
            let fields: FieldMap = fields.into_iter().collect();
            let created = trace.create_lot(&fields).await?;
            print_json(&created)?;
        }

        LedgerCommand::Submit {
            lot_id: raw,
            stage,
            fields,
        } => {
            let stage: StageKind = stage.parse().map_err(TraceError::from)?;
            let fields: FieldMap = fields.into_iter().collect();
            let outcome = trace.submit_stage(&lot_id(&raw)?, stage, &fields).await?;
            print_json(&outcome)?;
            if let SubmitOutcome::StageSealed { .. } = outcome {
                return Ok(ExitCode::from(3));
            }
        }

        LedgerCommand::Show { lot_id: raw } => {
            print_json(&trace.get_aggregate(&lot_id(&raw)?).await?)?;
        }

        LedgerCommand::List { search } => {
            let lots = match search {
                Some(text) => trace.search(&text).await?,
                None => trace.list_aggregates().await?,
            };
            print_json(&lots)?;
        }

        #[cfg(feature = "server")]
        LedgerCommand::Serve { addr } => {
            serve(trace, addr.unwrap_or_else(|| config.listen_addr.clone())).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn connect(config: &TraceConfig, memory: bool) -> Result<LotTrace> {
    let backend: Arc<dyn LotStore> = if memory {
        Arc::new(InMemoryLotStore::new())
    } else {
        Arc::new(
            HttpLotStore::new(config.store_url.clone(), config.confirm_poll_interval())
                .context("Failed to create ledger gateway client")?,
        )
    };
    let trace = LotTrace::new(backend, config.clone());
    trace.connect().await?;
    Ok(trace)
}

#[cfg(feature = "server")]
async fn serve(trace: Arc<LotTrace>, addr: String) -> Result<()> {
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    let app = coffee_trace::api::create_lot_router(trace)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Lot trace API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
