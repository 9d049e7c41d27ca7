//! Video stream chunker: slices a live stream into fixed-duration clip files.
//!
//! Reader: `rtspsrc`/`souphttpsrc` → decode → RGB `appsink`, pulled from a
//! dedicated thread so a stalling camera can never block the async runtime.
//! Writer (one pipeline per clip): `appsrc` → `x264enc` → `mp4mux` →
//! `filesink`, writing to a `_ongoing` file that is renamed to its final
//! `{start}_{end}` name only once the muxer has flushed. Consumers therefore
//! never see a partially written clip.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;

pub const DEFAULT_CONTAINER: &str = "mp4";

const DEFAULT_MAX_READ_TIMEOUTS: u32 = 30;
const DEFAULT_MAX_CONNECT_FAILURES: u32 = 10;
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const RETRY_DELAY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_DELAY_MAX: Duration = Duration::from_secs(60);
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const MUX_FLUSH_DELAY: Duration = Duration::from_millis(200);
const EOS_WAIT: Duration = Duration::from_secs(5);
const FPS_FALLBACK: u32 = 30;
const FPS_MIN: u32 = 1;
const FPS_MAX: u32 = 120;
const TS_FORMAT: &str = "%Y%m%d%H%M%S";

/// Read-only snapshot of the chunker counters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerStats {
    pub chunk_count: u64,
    pub reconnect_count: u64,
    pub total_frames: u64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct Counters {
    chunk_count: AtomicU64,
    reconnect_count: AtomicU64,
    total_frames: AtomicU64,
}

/// Reads a live stream and emits finalized clip paths on `out_tx`.
pub struct VideoStreamChunker {
    stream_url: String,
    output_dir: PathBuf,
    chunk_duration: Duration,
    container: String,
    max_read_timeouts: u32,
    max_connect_failures: u32,
    out_tx: mpsc::Sender<PathBuf>,
    stop_flag: AtomicBool,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    counters: Counters,
}

impl VideoStreamChunker {
    /// Validates the configuration and prepares the output directory. No
    /// stream I/O happens until [`start`](Self::start).
    pub fn new(
        stream_url: &str,
        output_dir: &Path,
        chunk_duration_seconds: u32,
        out_tx: mpsc::Sender<PathBuf>,
    ) -> Result<Self, PipelineError> {
        if chunk_duration_seconds == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk duration must be positive".to_string(),
            ));
        }
        if !["rtsp://", "http://", "https://"]
            .iter()
            .any(|scheme| stream_url.starts_with(scheme))
        {
            return Err(PipelineError::InvalidConfig(
                "stream URL must be rtsp:// or http(s)://".to_string(),
            ));
        }
        fs::create_dir_all(output_dir).map_err(|e| {
            PipelineError::InvalidConfig(format!(
                "cannot create output directory {}: {e}",
                output_dir.display()
            ))
        })?;

        Ok(Self {
            stream_url: stream_url.to_string(),
            output_dir: output_dir.to_path_buf(),
            chunk_duration: Duration::from_secs(u64::from(chunk_duration_seconds)),
            container: DEFAULT_CONTAINER.to_string(),
            max_read_timeouts: DEFAULT_MAX_READ_TIMEOUTS,
            max_connect_failures: DEFAULT_MAX_CONNECT_FAILURES,
            out_tx,
            stop_flag: AtomicBool::new(false),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            handle: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Launch the reader loop on its own thread. No-op when already running.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("chunker is already running");
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        *self.started_at.lock().unwrap() = Some(Instant::now());

        let chunker = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("video-chunker".to_string())
            .spawn(move || {
                chunker.reader_loop();
                chunker.running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                *self.handle.lock().unwrap() = Some(handle);
                info!("started video stream chunker: {}", self.stream_url);
            }
            Err(e) => {
                error!("failed to spawn chunker thread: {e}");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Request a graceful shutdown; safe from any thread.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("chunker is not running");
            return;
        }
        info!("stopping video stream chunker");
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Wait for the reader thread to exit, up to `timeout`.
    pub fn join(&self, timeout: Duration) {
        let taken = self.handle.lock().unwrap().take();
        let Some(handle) = taken else { return };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("chunker thread did not exit within {timeout:?}");
            *self.handle.lock().unwrap() = Some(handle);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChunkerStats {
        let uptime_seconds = self
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        ChunkerStats {
            chunk_count: self.counters.chunk_count.load(Ordering::Relaxed),
            reconnect_count: self.counters.reconnect_count.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    fn reader_loop(&self) {
        if let Err(e) = gst::init() {
            error!("gstreamer initialization failed: {e}");
            return;
        }

        let mut reader: Option<StreamReader> = None;
        let mut writer: Option<ClipWriter> = None;
        let mut stream_props = (FPS_FALLBACK, 0u32, 0u32);
        let mut retry_delay = RETRY_DELAY_INITIAL;
        let mut connect_failures = 0u32;
        let mut read_timeouts = 0u32;

        while !self.stop_flag.load(Ordering::Relaxed) {
            if reader.is_none() {
                info!("connecting to stream: {}", self.stream_url);
                match StreamReader::open(&self.stream_url, &self.stop_flag) {
                    Ok(stream) => {
                        info!(
                            "stream opened: {}x{} @ {} fps",
                            stream.width, stream.height, stream.fps
                        );
                        self.counters.reconnect_count.fetch_add(1, Ordering::Relaxed);
                        connect_failures = 0;
                        retry_delay = RETRY_DELAY_INITIAL;
                        read_timeouts = 0;
                        stream_props = (stream.fps, stream.width, stream.height);
                        // A reconnect always cuts the clip that was being written.
                        if let Some(w) = writer.take() {
                            self.finish_clip(w);
                        }
                        reader = Some(stream);
                    }
                    Err(e) => {
                        connect_failures += 1;
                        warn!(
                            "failed to open stream ({connect_failures}/{}): {e:#}",
                            self.max_connect_failures
                        );
                        if connect_failures >= self.max_connect_failures {
                            error!(
                                "giving up on {} after {connect_failures} consecutive connect failures",
                                self.stream_url
                            );
                            break;
                        }
                        self.sleep_interruptible(retry_delay);
                        retry_delay = (retry_delay * 2).min(RETRY_DELAY_MAX);
                        continue;
                    }
                }
            }

            let read = match reader.as_mut() {
                Some(stream) => stream.poll_frame(READ_TIMEOUT),
                None => continue,
            };

            match read {
                FrameRead::Frame(frame) => {
                    read_timeouts = 0;
                    self.counters.total_frames.fetch_add(1, Ordering::Relaxed);

                    if writer
                        .as_ref()
                        .is_some_and(|w| w.should_roll(self.chunk_duration))
                    {
                        if let Some(w) = writer.take() {
                            self.finish_clip(w);
                        }
                    }
                    if writer.is_none() {
                        let (fps, width, height) = stream_props;
                        match ClipWriter::open(
                            &self.output_dir,
                            &self.container,
                            fps,
                            width,
                            height,
                            self.chunk_duration,
                        ) {
                            Ok(w) => {
                                debug!("new clip: {}", w.ongoing_path.display());
                                writer = Some(w);
                            }
                            Err(e) => {
                                error!("failed to open clip writer: {e:#}");
                                self.sleep_interruptible(Duration::from_secs(1));
                                continue;
                            }
                        }
                    }
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = w.push(frame) {
                            error!("failed to write frame: {e:#}");
                            if let Some(w) = writer.take() {
                                self.finish_clip(w);
                            }
                        }
                    }
                }
                FrameRead::Timeout => {
                    read_timeouts += 1;
                    if read_timeouts >= self.max_read_timeouts {
                        warn!("no frames after {read_timeouts} consecutive reads, reconnecting");
                        if let Some(w) = writer.take() {
                            self.finish_clip(w);
                        }
                        if let Some(stream) = reader.take() {
                            stream.close();
                        }
                        read_timeouts = 0;
                        self.sleep_interruptible(retry_delay);
                        retry_delay = (retry_delay * 2).min(RETRY_DELAY_MAX);
                    }
                }
                FrameRead::Ended(reason) => {
                    warn!("stream ended ({reason}), reconnecting");
                    if let Some(w) = writer.take() {
                        self.finish_clip(w);
                    }
                    if let Some(stream) = reader.take() {
                        stream.close();
                    }
                    read_timeouts = 0;
                    self.sleep_interruptible(retry_delay);
                    retry_delay = (retry_delay * 2).min(RETRY_DELAY_MAX);
                }
            }
        }

        if let Some(w) = writer.take() {
            self.finish_clip(w);
        }
        if let Some(stream) = reader.take() {
            stream.close();
        }

        let stats = self.stats();
        info!(
            "chunker stopped: uptime {:.1}s, {} chunks, {} frames, {} reconnects",
            stats.uptime_seconds, stats.chunk_count, stats.total_frames, stats.reconnect_count
        );
    }

    fn finish_clip(&self, writer: ClipWriter) {
        let frames = writer.frames;
        match writer.finalize(&self.output_dir, &self.container) {
            Ok(Some(path)) => {
                let n = self.counters.chunk_count.fetch_add(1, Ordering::Relaxed) + 1;
                info!("chunk #{n}: {} ({frames} frames)", path.display());
                self.enqueue_path(path);
            }
            Ok(None) => {}
            Err(e) => error!("failed to finalize clip: {e:#}"),
        }
    }

    /// Hand a finalized clip to the processing queue, waiting at most one
    /// second. A full queue drops the path; the file stays on disk.
    fn enqueue_path(&self, path: PathBuf) {
        let deadline = Instant::now() + ENQUEUE_TIMEOUT;
        let mut item = path;
        loop {
            match self.out_tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(p)) => {
                    if Instant::now() >= deadline {
                        error!("output queue full, dropped chunk path {}", p.display());
                        return;
                    }
                    item = p;
                    thread::sleep(Duration::from_millis(50));
                }
                Err(TrySendError::Closed(p)) => {
                    warn!("output queue closed, dropped chunk path {}", p.display());
                    return;
                }
            }
        }
    }

    /// Backoff sleep that reacts to the stop flag within ~100 ms.
    fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.stop_flag.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
        }
    }
}

enum FrameRead {
    Frame(Vec<u8>),
    Timeout,
    Ended(String),
}

/// Live source half: demux/decode pipeline ending in an RGB appsink.
struct StreamReader {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    width: u32,
    height: u32,
    fps: u32,
    pending: Option<Vec<u8>>,
}

impl StreamReader {
    /// One connection attempt: build the pipeline, start it, and probe
    /// dimensions and frame rate from the first decoded sample. Aborts early
    /// when `stop` is raised mid-attempt.
    fn open(url: &str, stop: &AtomicBool) -> Result<Self> {
        let pipeline = gst::parse::launch(&reader_pipeline(url))
            .context("failed to build reader pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("reader description is not a pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .context("appsink missing from reader pipeline")?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("sink element is not an appsink"))?;

        if pipeline.set_state(gst::State::Playing).is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            bail!("failed to start reader pipeline");
        }

        // The first sample doubles as the dimension and rate probe. Poll in
        // slices so connection errors surface without burning the timeout.
        let deadline = Instant::now() + OPEN_TIMEOUT;
        let sample = loop {
            if let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(500)) {
                break sample;
            }
            if let Some(reason) = pipeline_error(&pipeline) {
                let _ = pipeline.set_state(gst::State::Null);
                bail!("{reason}");
            }
            if stop.load(Ordering::Relaxed) {
                let _ = pipeline.set_state(gst::State::Null);
                bail!("shutdown requested");
            }
            if Instant::now() >= deadline {
                let _ = pipeline.set_state(gst::State::Null);
                bail!("timed out waiting for the first frame");
            }
        };

        let (width, height, fps) = {
            let caps = sample.caps().context("first sample carries no caps")?;
            let structure = caps.structure(0).context("first sample caps are empty")?;
            let width = structure.get::<i32>("width").unwrap_or(0);
            let height = structure.get::<i32>("height").unwrap_or(0);
            let fps = structure
                .get::<gst::Fraction>("framerate")
                .map(probe_fps)
                .unwrap_or(FPS_FALLBACK);
            (width, height, fps)
        };
        if width <= 0 || height <= 0 {
            let _ = pipeline.set_state(gst::State::Null);
            bail!("invalid stream dimensions: {width}x{height}");
        }

        let pending = sample
            .buffer()
            .and_then(|b| b.map_readable().ok())
            .map(|map| map.as_slice().to_vec());

        Ok(Self {
            pipeline,
            appsink,
            width: width as u32,
            height: height as u32,
            fps,
            pending,
        })
    }

    fn poll_frame(&mut self, timeout: Duration) -> FrameRead {
        if let Some(frame) = self.pending.take() {
            return FrameRead::Frame(frame);
        }
        if let Some(reason) = pipeline_error(&self.pipeline) {
            return FrameRead::Ended(reason);
        }
        match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(timeout.as_millis() as u64))
        {
            Some(sample) => match sample.buffer().and_then(|b| b.map_readable().ok()) {
                Some(map) => FrameRead::Frame(map.as_slice().to_vec()),
                None => FrameRead::Timeout,
            },
            None if self.appsink.is_eos() => FrameRead::Ended("end of stream".to_string()),
            None => FrameRead::Timeout,
        }
    }

    fn close(self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Writer half for one clip.
struct ClipWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    ongoing_path: PathBuf,
    started_utc: DateTime<Utc>,
    started_mono: Instant,
    frames: u64,
    fps: u32,
    frame_budget: u64,
}

impl ClipWriter {
    fn open(
        output_dir: &Path,
        container: &str,
        fps: u32,
        width: u32,
        height: u32,
        chunk_duration: Duration,
    ) -> Result<Self> {
        let started_utc = Utc::now();
        let ongoing_path = ongoing_path(output_dir, started_utc, container);
        let desc = format!(
            "appsrc name=src is-live=true format=time \
             caps=video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 ! \
             videoconvert ! x264enc speed-preset=ultrafast tune=zerolatency ! \
             h264parse ! mp4mux ! filesink location=\"{}\"",
            ongoing_path.display()
        );

        let pipeline = gst::parse::launch(&desc)
            .context("failed to build writer pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("writer description is not a pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .context("appsrc missing from writer pipeline")?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| anyhow::anyhow!("src element is not an appsrc"))?;
        pipeline
            .set_state(gst::State::Playing)
            .context("failed to start writer pipeline")?;

        Ok(Self {
            pipeline,
            appsrc,
            ongoing_path,
            started_utc,
            started_mono: Instant::now(),
            frames: 0,
            fps,
            frame_budget: (u64::from(fps) * chunk_duration.as_secs()).max(1),
        })
    }

    /// Rollover is due once the monotonic clock or the frame budget says so.
    fn should_roll(&self, chunk_duration: Duration) -> bool {
        self.started_mono.elapsed() >= chunk_duration || self.frames >= self.frame_budget
    }

    fn push(&mut self, frame: Vec<u8>) -> Result<()> {
        let frame_duration_ns = 1_000_000_000 / u64::from(self.fps);
        let mut buffer = gst::Buffer::from_mut_slice(frame);
        {
            let buffer = buffer.get_mut().unwrap();
            buffer.set_pts(gst::ClockTime::from_nseconds(self.frames * frame_duration_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(frame_duration_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow::anyhow!("appsrc rejected frame: {e:?}"))?;
        self.frames += 1;
        Ok(())
    }

    /// Flush the muxer and promote the ongoing file to its final name.
    ///
    /// Empty clips are removed instead of renamed. Returns the final path
    /// when a clip was produced.
    fn finalize(self, output_dir: &Path, container: &str) -> Result<Option<PathBuf>> {
        let end_utc = Utc::now();

        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("failed to signal end of stream to the muxer: {e:?}");
        }
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(EOS_WAIT.as_secs()),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }
        let _ = self.pipeline.set_state(gst::State::Null);
        // Give the container muxer a moment to hit the disk.
        thread::sleep(MUX_FLUSH_DELAY);

        let size = fs::metadata(&self.ongoing_path).map(|m| m.len()).unwrap_or(0);
        if self.frames == 0 || size == 0 {
            debug!("discarding empty clip {}", self.ongoing_path.display());
            let _ = fs::remove_file(&self.ongoing_path);
            return Ok(None);
        }

        let final_path = clip_path(output_dir, self.started_utc, end_utc, container);
        fs::rename(&self.ongoing_path, &final_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                self.ongoing_path.display(),
                final_path.display()
            )
        })?;
        Ok(Some(final_path))
    }
}

fn reader_pipeline(url: &str) -> String {
    if url.starts_with("rtsp://") {
        // TCP transport; a single-buffer sink keeps us on the live edge.
        format!(
            "rtspsrc location=\"{url}\" protocols=tcp latency=200 ! \
             decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink max-buffers=1 drop=true sync=false"
        )
    } else {
        format!(
            "souphttpsrc location=\"{url}\" is-live=true ! decodebin ! \
             videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink max-buffers=1 drop=true sync=false"
        )
    }
}

/// Drain the pipeline bus down to a fatal error message, if one is queued.
fn pipeline_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
        if let gst::MessageView::Error(err) = msg.view() {
            return Some(err.error().to_string());
        }
    }
    None
}

/// Frame rate from caps, clamped to a sane range.
fn probe_fps(rate: gst::Fraction) -> u32 {
    if rate.numer() <= 0 || rate.denom() <= 0 {
        return FPS_FALLBACK;
    }
    let fps = (f64::from(rate.numer()) / f64::from(rate.denom())).round() as u32;
    fps.clamp(FPS_MIN, FPS_MAX)
}

fn ongoing_path(dir: &Path, start: DateTime<Utc>, container: &str) -> PathBuf {
    dir.join(format!("{}_ongoing.{container}", start.format(TS_FORMAT)))
}

/// Final clip name: `{startUTC}_{endUTC}.{container}`, second precision.
fn clip_path(dir: &Path, start: DateTime<Utc>, end: DateTime<Utc>, container: &str) -> PathBuf {
    dir.join(format!(
        "{}_{}.{container}",
        start.format(TS_FORMAT),
        end.format(TS_FORMAT)
    ))
}
