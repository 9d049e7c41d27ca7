//! Vision-model adapter: classifies one clip against the event catalog.
//!
//! Each call submits the clip inline (base64) together with a structured
//! prompt to the Generative Language API and parses the JSON detection list
//! out of the response. The adapter keeps no state between calls beyond the
//! shared HTTP client.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::EventConfig;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 120;
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// One classified occurrence for a clip, straight from the model.
///
/// Fields the model omitted stay `None`; the collection worker owns the
/// defaults.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub event_timestamp: Option<DateTime<Utc>>,
    pub event_code: Option<String>,
    pub event_description: Option<String>,
    pub event_detection_explanation_by_ai: Option<String>,
    pub event_video_url: Option<String>,
}

/// Detection record shape the model is instructed to emit.
#[derive(Debug, Deserialize)]
struct RawDetection {
    event_code: Option<String>,
    event_timestamp: Option<String>,
    event_detection_explanation_by_ai: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

pub struct VideoEventDetector {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: String,
    out_tx: mpsc::Sender<DetectionResult>,
}

impl VideoEventDetector {
    pub fn new(model: String, api_key: String, out_tx: mpsc::Sender<DetectionResult>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            model,
            api_key,
            out_tx,
        }
    }

    /// Classify one clip and enqueue a [`DetectionResult`] per detection.
    ///
    /// Returns how many detections reached the queue. Failures leave the clip
    /// file untouched; the caller decides what to log.
    pub async fn detect_events(
        &self,
        video_path: &Path,
        events: &[EventConfig],
        context: &str,
    ) -> Result<usize> {
        let bytes = tokio::fs::read(video_path)
            .await
            .with_context(|| format!("failed to read clip {}", video_path.display()))?;

        let body = json!({
            "contents": [{
                "parts": [
                    { "inline_data": { "mime_type": "video/mp4", "data": BASE64.encode(&bytes) } },
                    { "text": build_prompt(events, context) },
                ]
            }],
            "generation_config": { "response_mime_type": "application/json" }
        });

        let url = format!("{}/models/{}:generateContent", self.api_base, self.model);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("failed to reach the vision model")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("vision model returned {status}: {detail}");
        }

        let response: GenerateContentResponse = response
            .json()
            .await
            .context("failed to decode the vision model response")?;
        let raw = parse_detections(&response_text(&response))?;

        let clip = video_path.to_string_lossy().into_owned();
        let mut enqueued = 0usize;
        for detection in raw {
            let description = detection.event_code.as_deref().and_then(|code| {
                events
                    .iter()
                    .find(|e| e.event_code == code)
                    .map(|e| e.event_description.clone())
            });
            let result = DetectionResult {
                event_timestamp: detection.event_timestamp.as_deref().and_then(parse_timestamp),
                event_code: detection.event_code,
                event_description: description,
                event_detection_explanation_by_ai: detection.event_detection_explanation_by_ai,
                event_video_url: Some(clip.clone()),
            };
            if self.enqueue(result).await {
                enqueued += 1;
            }
        }

        debug!(clip = %clip, enqueued, "clip classified");
        Ok(enqueued)
    }

    /// Bounded-wait handoff to the detection queue; drops on saturation so a
    /// stalled collector can never wedge the processing worker.
    async fn enqueue(&self, result: DetectionResult) -> bool {
        match tokio::time::timeout(ENQUEUE_TIMEOUT, self.out_tx.send(result)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                warn!("detection queue closed, dropping detection");
                false
            }
            Err(_) => {
                error!("detection queue full, dropped a detection");
                false
            }
        }
    }
}

fn build_prompt(events: &[EventConfig], context: &str) -> String {
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "Watch the attached surveillance clip and report every occurrence of the events defined below.\n\n",
    );
    for event in events {
        prompt.push_str(&format!(
            "Event code: {}\nDescription: {}\nDetection guidelines: {}\n\n",
            event.event_code, event.event_description, event.detection_guidelines
        ));
    }
    prompt.push_str(
        "Answer with a JSON array, one object per detected occurrence, using exactly these keys: \
         \"event_code\" (one of the codes above), \"event_timestamp\" (UTC, RFC 3339), \
         \"event_detection_explanation_by_ai\" (short justification). \
         Answer with an empty array when nothing matches.",
    );
    prompt
}

fn response_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Parse the model's detection list, tolerating Markdown code fences.
fn parse_detections(text: &str) -> Result<Vec<RawDetection>> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).context("vision model did not return a JSON detection array")
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start();
    rest.strip_suffix("```").map(str::trim_end).unwrap_or(rest)
}

/// The model is asked for RFC 3339, but naive `Y-m-d H:M:S` answers are
/// common; those are taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn catalog() -> Vec<EventConfig> {
        vec![
            EventConfig {
                event_code: "intrusion".to_string(),
                event_description: "Person enters restricted area".to_string(),
                detection_guidelines: "Flag anyone crossing the yellow line".to_string(),
            },
            EventConfig {
                event_code: "loitering".to_string(),
                event_description: "Person idles near the entrance".to_string(),
                detection_guidelines: "More than thirty seconds in frame".to_string(),
            },
        ]
    }

    #[test]
    fn prompt_embeds_context_and_catalog() {
        let prompt = build_prompt(&catalog(), "Night shift at the depot.");

        assert!(prompt.starts_with("Night shift at the depot."));
        assert!(prompt.contains("Event code: intrusion"));
        assert!(prompt.contains("Flag anyone crossing the yellow line"));
        assert!(prompt.contains("Event code: loitering"));
        assert!(prompt.contains("\"event_code\""));
    }

    #[test]
    fn parses_plain_json_array() {
        let raw = parse_detections(
            r#"[{"event_code": "intrusion", "event_timestamp": "2026-08-01T12:00:00Z",
                "event_detection_explanation_by_ai": "person crossed the line"}]"#,
        )
        .unwrap();

        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].event_code.as_deref(), Some("intrusion"));
    }

    #[test]
    fn parses_fenced_json_and_missing_fields() {
        let raw = parse_detections("```json\n[{\"event_code\": \"loitering\"}]\n```").unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw[0].event_timestamp.is_none());
        assert!(raw[0].event_detection_explanation_by_ai.is_none());
    }

    #[test]
    fn empty_response_means_no_detections() {
        assert!(parse_detections("").unwrap().is_empty());
        assert!(parse_detections("```json\n[]\n```").unwrap().is_empty());
    }

    #[test]
    fn rejects_non_json_response() {
        assert!(parse_detections("no events were observed").is_err());
    }

    #[test]
    fn timestamp_parsing_accepts_rfc3339_and_naive_utc() {
        let ts = parse_timestamp("2026-08-01T12:30:00+02:00").unwrap();
        assert_eq!(ts.hour(), 10);

        let ts = parse_timestamp("2026-08-01 12:30:00").unwrap();
        assert_eq!(ts.hour(), 12);

        assert!(parse_timestamp("around noon").is_none());
    }

    #[tokio::test]
    async fn enqueue_drops_when_the_queue_stays_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let detector = VideoEventDetector::new("m".to_string(), String::new(), tx);

        let result = DetectionResult {
            event_timestamp: None,
            event_code: Some("intrusion".to_string()),
            event_description: None,
            event_detection_explanation_by_ai: None,
            event_video_url: None,
        };

        assert!(detector.enqueue(result.clone()).await);
        // Queue is now full and nobody drains it: the second enqueue times out.
        assert!(!detector.enqueue(result).await);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
