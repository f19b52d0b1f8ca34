//! The HTTP front-end's own per-request bookkeeping. Never persisted —
//! `RequestState` lives only as long as the process, mutated exclusively by
//! the bus-subscription handlers in `http::mod`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Which client entry point created this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Process,
    Rss,
}

/// Overall request status, matching spec.md §3's `RequestState.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Processing,
    Completed,
    Failed,
}

/// One entry in `RequestState.steps`: a pipeline stage's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StepState {
    pub name: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl StepState {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "completed".to_string(),
            timestamp: Utc::now(),
            error: None,
            download_url: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "failed".to_string(),
            timestamp: Utc::now(),
            error: Some(error.into()),
            download_url: None,
        }
    }

    pub fn in_progress(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "in_progress".to_string(),
            timestamp: Utc::now(),
            error: None,
            download_url: None,
        }
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }
}

/// Tracks one in-flight (or finished) client request end-to-end across every
/// asynchronous pipeline stage, keyed by correlation id in `AppState`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestState {
    pub request_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub url: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepState>,
}

impl RequestState {
    /// A freshly created request starts with one "submitted" step, already
    /// completed, as the original's `RequestHandler` does when it first
    /// records a request.
    pub fn new(request_id: Uuid, request_type: RequestType, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            request_type,
            url: url.into(),
            status: RequestStatus::Processing,
            created_at: now,
            updated_at: now,
            steps: vec![StepState::ok("submitted")],
        }
    }

    pub fn push_step(&mut self, step: StepState) {
        self.updated_at = Utc::now();
        if step.status == "failed" {
            self.status = RequestStatus::Failed;
        }
        self.steps.push(step);
    }

    pub fn mark_completed(&mut self) {
        self.updated_at = Utc::now();
        self.status = RequestStatus::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_starts_with_a_completed_submitted_step() {
        let state = RequestState::new(Uuid::new_v4(), RequestType::Process, "https://ex.com/a.mp3");

        assert_eq!(state.status, RequestStatus::Processing);
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].name, "submitted");
        assert_eq!(state.steps[0].status, "completed");
    }

    #[test]
    fn a_failed_step_flips_overall_status_to_failed() {
        let mut state = RequestState::new(Uuid::new_v4(), RequestType::Process, "https://ex.com/a.mp3");

        state.push_step(StepState::ok("download"));
        assert_eq!(state.status, RequestStatus::Processing);

        state.push_step(StepState::failed("transcription", "boom"));
        assert_eq!(state.status, RequestStatus::Failed);
        assert_eq!(state.steps.len(), 3);
    }
}
