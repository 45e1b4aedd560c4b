use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

mod admission;
mod config;
mod curve;
mod db;
mod entry_codes;
mod error;
mod http;
mod memory;
mod models;
mod rate_limit;
mod report;
mod sampler;
mod store;
mod telemetry;

use admission::AdmissionController;
use config::{DatabaseArgs, SamplerArgs, ServerArgs};
use curve::SampleSet;
use entry_codes::EntryCodeService;
use error::SamplerError;
use rate_limit::AttemptLimiter;
use store::{CurveStore, EntryCodeStore, ReservationLedger};

#[derive(Parser)]
#[command(name = "enrollment-sampler")]
#[command(about = "Paces study enrollment against a weekly slot curve", long_about = None)]
struct Cli {
    #[command(flatten)]
    database: DatabaseArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Run the HTTP service
    Serve {
        #[command(flatten)]
        sampler: SamplerArgs,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Build a new slot curve for the current week
    RefreshCurve {
        #[command(flatten)]
        sampler: SamplerArgs,
    },
    /// Show target, used and available slots right now
    Status {
        #[command(flatten)]
        sampler: SamplerArgs,
    },
    /// Remove reservations that were never confirmed or cancelled
    Expire {
        #[command(flatten)]
        sampler: SamplerArgs,
    },
    /// Generate a markdown report of the active curve
    Report {
        #[command(flatten)]
        sampler: SamplerArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Import entry codes from a CSV file with a `code` column
    ImportCodes {
        #[arg(long, env = "INSTANCE_ID")]
        instance_id: String,
        #[arg(long)]
        csv: PathBuf,
    },
}

/// Store handles shared by the admission core and the entry-code service.
struct Backend {
    curves: Arc<dyn CurveStore>,
    ledger: Arc<dyn ReservationLedger>,
    codes: Arc<dyn EntryCodeStore>,
}

impl Backend {
    fn new<S>(store: Arc<S>) -> Self
    where
        S: CurveStore + ReservationLedger + EntryCodeStore + 'static,
    {
        Self {
            curves: store.clone(),
            ledger: store.clone(),
            codes: store,
        }
    }

    async fn open(database: &DatabaseArgs, in_memory: bool) -> anyhow::Result<Self> {
        if in_memory {
            info!("using in-memory store, state will not survive a restart");
            return Ok(Self::new(Arc::new(memory::MemoryStore::new())));
        }
        let pool = db::connect(database).await?;
        Ok(Self::new(Arc::new(db::PgStore::new(pool, database.timeout()))))
    }
}

/// Validates sampler configuration and loads the stored curve. Any problem
/// with the sample file or the counts is fatal here.
async fn build_admission(
    args: &SamplerArgs,
    backend: &Backend,
) -> anyhow::Result<AdmissionController> {
    let policy = args.policy()?;
    let sample = SampleSet::load_csv(&args.sample_file_path)?;
    if sample.is_empty() && policy.plan.target > policy.plan.floor {
        return Err(SamplerError::configuration(format!(
            "sample file {} has no rows",
            args.sample_file_path.display()
        ))
        .into());
    }
    info!(
        instance_id = %args.instance_id,
        samples = sample.len(),
        target = policy.plan.target,
        floor = policy.plan.floor,
        "sampler configured"
    );

    let admission = AdmissionController::new(
        args.instance_id.clone(),
        backend.curves.clone(),
        backend.ledger.clone(),
        sample,
        policy,
    );
    admission.load().await;
    Ok(admission)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn serve(
    sampler: SamplerArgs,
    server: ServerArgs,
    database: &DatabaseArgs,
) -> anyhow::Result<()> {
    let backend = Backend::open(database, server.in_memory).await?;
    let admission = build_admission(&sampler, &backend).await?;
    let entry_codes = EntryCodeService::new(
        sampler.instance_id.clone(),
        backend.codes.clone(),
        AttemptLimiter::new(
            server.wrong_code_attempt_limit,
            Duration::from_secs(server.wrong_code_window_secs),
        ),
        Duration::from_secs(server.failure_delay_max_secs),
    );

    let state = http::AppState {
        admission: Arc::new(admission),
        entry_codes: Arc::new(entry_codes),
        allow_entry_code_upload: server.allow_entry_code_upload,
    };

    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, instance_id = %sampler.instance_id, "enrollment sampler is listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = db::connect(&cli.database).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Serve { sampler, server } => {
            serve(sampler, server, &cli.database).await?;
        }
        Commands::RefreshCurve { sampler } => {
            let backend = Backend::open(&cli.database, false).await?;
            let admission = build_admission(&sampler, &backend).await?;
            let curve = admission.force_refresh().await?;
            println!(
                "New slot curve for {} with {} steps reaching {} slots.",
                sampler.instance_id,
                curve.open_slots.len(),
                curve.final_target()
            );
        }
        Commands::Status { sampler } => {
            let backend = Backend::open(&cli.database, false).await?;
            let admission = build_admission(&sampler, &backend).await?;
            if admission.needs_refresh().await {
                info!(instance_id = %sampler.instance_id, "stored curve is stale, building this week's curve");
            }
            let status = admission.status().await?;
            println!(
                "{}: target {} used {} available {}",
                sampler.instance_id, status.target, status.used, status.available
            );
        }
        Commands::Expire { sampler } => {
            let backend = Backend::open(&cli.database, false).await?;
            let retention = sampler.policy()?.retention;
            let removed = backend
                .ledger
                .expire_older_than(&sampler.instance_id, retention, Utc::now())
                .await?;
            println!("Removed {removed} expired reservations.");
        }
        Commands::Report { sampler, out } => {
            let backend = Backend::open(&cli.database, false).await?;
            let admission = build_admission(&sampler, &backend).await?;
            let status = admission.status().await?;
            let curve = admission.current_curve().await;
            let report =
                report::build_report(&sampler.instance_id, curve.as_ref(), &status, Local::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::ImportCodes { instance_id, csv } => {
            let backend = Backend::open(&cli.database, false).await?;
            let inserted = db::import_codes_csv(backend.codes.as_ref(), &instance_id, &csv).await?;
            println!("Inserted {inserted} entry codes from {}.", csv.display());
        }
    }

    Ok(())
}
