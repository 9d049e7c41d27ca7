//! Pipeline orchestration: bounded queues, the two worker loops, and the
//! start/stop/status lifecycle.
//!
//! One `PipelineService` exists per process. A run owns two capacity-100
//! queues (clip paths, detections), the chunker thread, and two tokio worker
//! tasks; everything is torn down by `stop` with a 10-second grace period.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::bus::{DetectedEvent, EventBus, EventSubscription};
use crate::chunker::VideoStreamChunker;
use crate::config::{AppConfig, EventConfig};
use crate::detector::{DetectionResult, VideoEventDetector};
use crate::error::PipelineError;

const QUEUE_CAPACITY: usize = 100;
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const UNKNOWN_CODE: &str = "unknown-code";
const UNKNOWN_DESCRIPTION: &str = "Unknown event description";

/// Event record ready for persistence (no identifier yet).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_timestamp: DateTime<Utc>,
    pub event_code: String,
    pub event_description: String,
    pub event_video_url: String,
    pub event_detection_explanation_by_ai: String,
}

/// Storage callback injected by the control plane; resolves to the id the
/// store assigned.
pub type PersistFuture = Pin<Box<dyn Future<Output = Result<i32>> + Send>>;
pub type PersistFn = Arc<dyn Fn(NewEvent) -> PersistFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueInfo {
    pub video_paths: usize,
    pub detections: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub active: bool,
    pub queues: QueueInfo,
    pub stream_url: Option<String>,
}

enum PipelineState {
    Idle,
    Running(Box<ActivePipeline>),
    Stopping,
}

struct ActivePipeline {
    config: AppConfig,
    shutdown: Arc<AtomicBool>,
    chunker: Arc<VideoStreamChunker>,
    workers: Vec<JoinHandle<()>>,
    video_tx: mpsc::Sender<PathBuf>,
    detection_tx: mpsc::Sender<DetectionResult>,
}

/// Owns the detection pipeline lifecycle; at most one run at a time.
pub struct PipelineService {
    state: Mutex<PipelineState>,
    bus: EventBus,
}

impl Default for PipelineService {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            bus: EventBus::new(),
        }
    }

    /// Start a pipeline run.
    ///
    /// `persist` is `None` when no event store is configured, which rejects
    /// the start. The state lock is held for the whole call, so concurrent
    /// starts serialize and exactly one of them wins.
    pub fn start(
        &self,
        config: AppConfig,
        chunks_dir: &Path,
        api_key: String,
        persist: Option<PersistFn>,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, PipelineState::Idle) {
            return Err(PipelineError::ServiceAlreadyRunning);
        }
        let Some(persist) = persist else {
            return Err(PipelineError::DatabaseNotConfigured);
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let (video_tx, video_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (detection_tx, detection_rx) = mpsc::channel(QUEUE_CAPACITY);

        let chunker = Arc::new(VideoStreamChunker::new(
            &config.rtsp_url,
            chunks_dir,
            config.chunk_duration,
            video_tx.clone(),
        )?);

        let detector =
            VideoEventDetector::new(config.model.clone(), api_key, detection_tx.clone());
        let workers = vec![
            tokio::spawn(video_processing_worker(
                video_rx,
                detector,
                config.events.clone(),
                config.context.clone(),
                Arc::clone(&shutdown),
            )),
            tokio::spawn(event_collection_worker(
                detection_rx,
                persist,
                self.bus.clone(),
                Arc::clone(&shutdown),
            )),
        ];
        Arc::clone(&chunker).start();

        info!(
            stream = %config.rtsp_url,
            chunk_duration = config.chunk_duration,
            events = ?config.events.iter().map(|e| e.event_code.as_str()).collect::<Vec<_>>(),
            "pipeline started"
        );
        *state = PipelineState::Running(Box::new(ActivePipeline {
            config,
            shutdown,
            chunker,
            workers,
            video_tx,
            detection_tx,
        }));
        Ok(())
    }

    /// Stop the active run, joining its tasks with a bounded grace period.
    /// The next run gets a fresh shutdown signal.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let active = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, PipelineState::Stopping) {
                PipelineState::Running(active) => active,
                other => {
                    *state = other;
                    return Err(PipelineError::ServiceNotRunning);
                }
            }
        };

        info!("stopping pipeline");
        let ActivePipeline {
            config: _,
            shutdown,
            chunker,
            workers,
            video_tx,
            detection_tx,
        } = *active;

        shutdown.store(true, Ordering::SeqCst);
        chunker.stop();
        {
            let chunker = Arc::clone(&chunker);
            if tokio::task::spawn_blocking(move || chunker.join(SHUTDOWN_TIMEOUT))
                .await
                .is_err()
            {
                warn!("chunker join task panicked");
            }
        }

        // Dropping the senders lets a drained worker observe channel closure.
        drop(chunker);
        drop(video_tx);
        drop(detection_tx);

        for worker in workers {
            match timeout(SHUTDOWN_TIMEOUT, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("worker exited abnormally: {e}"),
                Err(_) => warn!("worker did not exit within {SHUTDOWN_TIMEOUT:?}"),
            }
        }

        *self.state.lock().unwrap() = PipelineState::Idle;
        info!("pipeline stopped");
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.state.lock().unwrap();
        match &*state {
            PipelineState::Running(active) => PipelineStatus {
                active: true,
                queues: QueueInfo {
                    video_paths: queue_depth(&active.video_tx),
                    detections: queue_depth(&active.detection_tx),
                },
                stream_url: Some(active.config.rtsp_url.clone()),
            },
            _ => PipelineStatus::default(),
        }
    }

    /// Register a live event subscriber. Subscriptions outlive pipeline runs.
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

fn queue_depth<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

/// Dequeues clip paths and runs the detector on each. Adapter failures are
/// logged and the clip counts as consumed either way.
async fn video_processing_worker(
    mut rx: mpsc::Receiver<PathBuf>,
    detector: VideoEventDetector,
    events: Vec<EventConfig>,
    context: String,
    shutdown: Arc<AtomicBool>,
) {
    info!("video processing worker started");
    while !shutdown.load(Ordering::Relaxed) {
        match timeout(RECV_TIMEOUT, rx.recv()).await {
            Ok(Some(path)) => {
                info!("processing video chunk: {}", path.display());
                if let Err(e) = detector.detect_events(&path, &events, &context).await {
                    error!("event detection failed for {}: {e:#}", path.display());
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    info!("video processing worker stopped");
}

/// Dequeues raw detections, normalizes them, persists, and publishes.
async fn event_collection_worker(
    mut rx: mpsc::Receiver<DetectionResult>,
    persist: PersistFn,
    bus: EventBus,
    shutdown: Arc<AtomicBool>,
) {
    info!("event collection worker started");
    while !shutdown.load(Ordering::Relaxed) {
        match timeout(RECV_TIMEOUT, rx.recv()).await {
            Ok(Some(result)) => collect_event(result, &persist, &bus).await,
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    info!("event collection worker stopped");
}

async fn collect_event(result: DetectionResult, persist: &PersistFn, bus: &EventBus) {
    let event = normalize(result);
    info!("received event: {}", event.event_code);

    let event_id = match persist(event.clone()).await {
        Ok(id) => {
            info!("event written to database with id {id}");
            Some(id)
        }
        Err(e) => {
            warn!("event write to database failed: {e:#}");
            None
        }
    };

    // Live delivery is best effort and must never fail the worker.
    bus.publish(&DetectedEvent {
        event_id,
        event_timestamp: event.event_timestamp,
        event_code: event.event_code,
        event_description: event.event_description,
        event_video_url: event.event_video_url,
        event_detection_explanation_by_ai: event.event_detection_explanation_by_ai,
    });
}

/// Apply the documented defaults for everything the model left out. The
/// timestamp always ends up timezone-aware UTC.
fn normalize(result: DetectionResult) -> NewEvent {
    NewEvent {
        event_timestamp: result.event_timestamp.unwrap_or_else(Utc::now),
        event_code: result.event_code.unwrap_or_else(|| UNKNOWN_CODE.to_string()),
        event_description: result
            .event_description
            .unwrap_or_else(|| UNKNOWN_DESCRIPTION.to_string()),
        event_video_url: result.event_video_url.unwrap_or_default(),
        event_detection_explanation_by_ai: result
            .event_detection_explanation_by_ai
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    fn empty_detection() -> DetectionResult {
        DetectionResult {
            event_timestamp: None,
            event_code: None,
            event_description: None,
            event_detection_explanation_by_ai: None,
            event_video_url: None,
        }
    }

    fn recording_persist(id: i32) -> (PersistFn, Arc<StdMutex<Vec<NewEvent>>>) {
        let written: Arc<StdMutex<Vec<NewEvent>>> = Arc::default();
        let sink = Arc::clone(&written);
        let persist: PersistFn = Arc::new(move |event| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(event);
                Ok(id)
            })
        });
        (persist, written)
    }

    fn failing_persist() -> PersistFn {
        Arc::new(|_event| Box::pin(async { anyhow::bail!("database unavailable") }))
    }

    fn test_config() -> AppConfig {
        AppConfig {
            model: "gemini-2.0-flash".to_string(),
            rtsp_url: "rtsp://127.0.0.1:1/unreachable".to_string(),
            chunk_duration: 1,
            context: String::new(),
            events: vec![EventConfig {
                event_code: "A".to_string(),
                event_description: "test event".to_string(),
                detection_guidelines: "always".to_string(),
            }],
        }
    }

    #[test]
    fn normalize_fills_every_default() {
        let event = normalize(empty_detection());
        assert_eq!(event.event_code, "unknown-code");
        assert_eq!(event.event_description, "Unknown event description");
        assert_eq!(event.event_video_url, "");
        assert_eq!(event.event_detection_explanation_by_ai, "");
        // Freshly substituted timestamps are current UTC.
        assert!((Utc::now() - event.event_timestamp).num_seconds() < 5);
    }

    #[test]
    fn normalize_keeps_provided_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap();
        let event = normalize(DetectionResult {
            event_timestamp: Some(ts),
            event_code: Some("intrusion".to_string()),
            event_description: Some("Person enters restricted area".to_string()),
            event_detection_explanation_by_ai: Some("crossed the line".to_string()),
            event_video_url: Some("/tmp/clip.mp4".to_string()),
        });
        assert_eq!(event.event_timestamp, ts);
        assert_eq!(event.event_code, "intrusion");
        assert_eq!(event.event_video_url, "/tmp/clip.mp4");
    }

    #[tokio::test]
    async fn collect_event_attaches_the_persisted_id() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let (persist, written) = recording_persist(7);

        collect_event(empty_detection(), &persist, &bus).await;

        assert_eq!(written.lock().unwrap().len(), 1);
        let published = sub.next().await.unwrap();
        assert_eq!(published.event_id, Some(7));
        assert_eq!(published.event_code, "unknown-code");
    }

    #[tokio::test]
    async fn persistence_failure_still_publishes() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let persist = failing_persist();

        collect_event(empty_detection(), &persist, &bus).await;

        let published = sub.next().await.unwrap();
        assert_eq!(published.event_id, None);
    }

    #[tokio::test]
    async fn collection_worker_drains_the_queue_and_stops_on_shutdown() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let (persist, written) = recording_persist(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let worker = tokio::spawn(event_collection_worker(
            rx,
            persist,
            bus.clone(),
            Arc::clone(&shutdown),
        ));

        tx.send(empty_detection()).await.unwrap();
        tx.send(empty_detection()).await.unwrap();

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_some());
        assert_eq!(written.lock().unwrap().len(), 2);

        shutdown.store(true, Ordering::SeqCst);
        timeout(Duration::from_secs(3), worker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_rejects_invalid_chunk_duration_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let service = PipelineService::new();
        let (persist, _) = recording_persist(1);

        let mut config = test_config();
        config.chunk_duration = 0;
        let err = service
            .start(config, dir.path(), String::new(), Some(persist))
            .err()
            .unwrap();
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(!service.status().active);
    }

    #[tokio::test]
    async fn start_rejects_missing_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let service = PipelineService::new();

        let err = service
            .start(test_config(), dir.path(), String::new(), None)
            .err()
            .unwrap();
        assert_eq!(err.code(), "DATABASE_NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn lifecycle_start_stop_restart() {
        let dir = tempfile::tempdir().unwrap();
        let service = PipelineService::new();
        let (persist, _) = recording_persist(1);

        service
            .start(test_config(), dir.path(), String::new(), Some(persist.clone()))
            .unwrap();

        let status = service.status();
        assert!(status.active);
        assert_eq!(status.queues.video_paths, 0);
        assert_eq!(status.queues.detections, 0);
        assert_eq!(
            status.stream_url.as_deref(),
            Some("rtsp://127.0.0.1:1/unreachable")
        );

        // Second start loses while the first run is active.
        let err = service
            .start(test_config(), dir.path(), String::new(), Some(persist.clone()))
            .err()
            .unwrap();
        assert_eq!(err.code(), "SERVICE_ALREADY_RUNNING");

        service.stop().await.unwrap();
        assert!(!service.status().active);

        let err = service.stop().await.err().unwrap();
        assert_eq!(err.code(), "SERVICE_NOT_RUNNING");

        // A clean restart works and starts from empty queues.
        service
            .start(test_config(), dir.path(), String::new(), Some(persist))
            .unwrap();
        let status = service.status();
        assert!(status.active);
        assert_eq!(status.queues.video_paths, 0);
        service.stop().await.unwrap();
    }
}
