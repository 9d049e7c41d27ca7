use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use vigil::api::{self, AppState};
use vigil::config::Settings;
use vigil::database::Database;
use vigil::pipeline::PipelineService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,vigil=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting video event detection service");
    let settings = Arc::new(Settings::from_env());

    let db = match settings.database_url.as_deref() {
        Some(url) => match Database::connect(url).await {
            Ok(db) => {
                if let Err(e) = db.run_migrations().await {
                    error!("database migration failed: {e:#}");
                }
                Some(Arc::new(db))
            }
            Err(e) => {
                error!("failed to connect to the database: {e:#}");
                None
            }
        },
        None => {
            warn!("DATABASE_URL not set; the pipeline cannot start until it is configured");
            None
        }
    };

    let state = AppState {
        pipeline: Arc::new(PipelineService::new()),
        db,
        settings: Arc::clone(&settings),
    };

    api::serve(state, &settings.api_host, settings.api_port).await
}
