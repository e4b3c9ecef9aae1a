use std::sync::Arc;

use anyhow::{Context, Result};
use delaywatch_durable::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkflowEventStore,
};
use delaywatch_notifier::sim::{LoggingChannel, SimulatedTrafficSource, TemplateComposer};
use delaywatch_notifier::telemetry::{init_telemetry, TelemetryConfig};
use delaywatch_notifier::{Collaborators, NotifierConfig, NotifierService, Route};

/// Demo submission, read from `DELAYWATCH_DEMO_*`
struct DemoRequest {
    route: Route,
    contact: String,
    simulated_delay_minutes: u32,
}

impl DemoRequest {
    fn from_env() -> Result<Self> {
        let var =
            |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
        let simulated_delay_minutes = var("DELAYWATCH_DEMO_SIM_DELAY_MINUTES", "45")
            .parse()
            .context("DELAYWATCH_DEMO_SIM_DELAY_MINUTES must be a whole number of minutes")?;

        Ok(Self {
            route: Route::new(
                var("DELAYWATCH_DEMO_ORIGIN", "New York, NY"),
                var("DELAYWATCH_DEMO_DESTINATION", "Philadelphia, PA"),
            ),
            contact: var("DELAYWATCH_DEMO_CONTACT", "customer@example.com"),
            simulated_delay_minutes,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - LOG_FORMAT: pretty or compact
    init_telemetry(TelemetryConfig::from_env()).context("Failed to initialize telemetry")?;

    tracing::info!("delaywatch starting...");

    let config = NotifierConfig::from_env().context("Invalid configuration")?;
    let demo = DemoRequest::from_env()?;

    tracing::info!(
        worker_id = %config.worker_id,
        task_queue = %config.qualified_task_queue(),
        max_concurrent = config.max_concurrent_activities,
        "Starting delay notifier"
    );

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresWorkflowEventStore::connect(&url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to run migrations")?;
            run(Arc::new(store), &config, demo).await
        }
        None => {
            tracing::info!("DATABASE_URL not set, history is kept in memory");
            run(Arc::new(InMemoryWorkflowEventStore::new()), &config, demo).await
        }
    }
}

async fn run<S: WorkflowEventStore>(
    store: Arc<S>,
    config: &NotifierConfig,
    demo: DemoRequest,
) -> Result<()> {
    let collaborators = Collaborators {
        traffic: Arc::new(SimulatedTrafficSource::new(95, demo.simulated_delay_minutes)),
        composer: Arc::new(TemplateComposer),
        primary: Arc::new(LoggingChannel::new("email")),
        fallback: Arc::new(LoggingChannel::new("sms")),
    };

    let service = NotifierService::new(store, config, collaborators);
    let report = service
        .start()
        .await
        .context("Failed to start delay notifier")?;
    if report.recovered > 0 {
        tracing::info!(recovered = report.recovered, "resumed unfinished delay checks");
    }

    let handle = service
        .client()
        .submit(demo.route, demo.contact, config.default_delay_threshold_minutes)
        .await
        .context("Failed to submit delay check")?;
    tracing::info!(instance_id = %handle.id(), "delay check submitted");

    let outcome = tokio::select! {
        result = handle.await_result() => Some(result.context("Failed to await delay check")?),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            None
        }
    };

    if let Some(result) = outcome {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    service
        .shutdown()
        .await
        .context("Failed to shut down worker pool")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
