//! Postgres persistence for detected events.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::pipeline::NewEvent;

/// One persisted row of `event_logs`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EventRecord {
    pub event_id: i32,
    pub event_timestamp: DateTime<Utc>,
    pub event_code: String,
    pub event_description: String,
    pub event_video_url: String,
    pub event_detection_explanation_by_ai: String,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("connecting to the event database");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to the database")?;
        info!("database connection established");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    /// Insert one event. Each call checks out its own pooled connection, so
    /// nothing is ever shared across worker threads.
    pub async fn insert_event(&self, event: &NewEvent) -> Result<i32> {
        sqlx::query_scalar(
            r#"
            INSERT INTO event_logs (
                event_timestamp, event_code, event_description,
                event_video_url, event_detection_explanation_by_ai
            ) VALUES ($1, $2, $3, $4, $5)
            RETURNING event_id
            "#,
        )
        .bind(event.event_timestamp)
        .bind(&event.event_code)
        .bind(&event.event_description)
        .bind(&event.event_video_url)
        .bind(&event.event_detection_explanation_by_ai)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert event")
    }

    /// Most recent events first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<EventRecord>> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT event_id, event_timestamp, event_code, event_description,
                   event_video_url, event_detection_explanation_by_ai
            FROM event_logs
            ORDER BY event_timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch events")
    }

    pub async fn event_by_id(&self, event_id: i32) -> Result<Option<EventRecord>> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT event_id, event_timestamp, event_code, event_description,
                   event_video_url, event_detection_explanation_by_ai
            FROM event_logs
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch event")
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("database health check failed")?;
        Ok(())
    }
}
