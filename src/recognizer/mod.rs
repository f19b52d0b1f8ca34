//! Speech-to-text collaborator. The pipeline treats transcription as an
//! opaque external capability — [`Recognizer`] is the seam, [`CommandRecognizer`]
//! the concrete adapter that shells out to a configured transcription binary.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::model::Segment;

#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("failed to launch recognizer command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("recognizer command {command} exited with status {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("recognizer output was not the expected segment array: {source}")]
    InvalidOutput {
        #[source]
        source: serde_json::Error,
    },
}

/// Converts an audio file into an ordered sequence of timestamped segments.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<Vec<Segment>, RecognizerError>;
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    text: String,
    start: f64,
    end: f64,
}

/// Runs an external command (e.g. a whisper.cpp or faster-whisper wrapper
/// script) with the audio path as its sole argument, expecting a JSON array
/// of `{text, start, end}` objects on stdout.
pub struct CommandRecognizer {
    command: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self { command: command.into(), args }
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn transcribe(&self, audio_path: &Path) -> Result<Vec<Segment>, RecognizerError> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(audio_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RecognizerError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RecognizerError::NonZeroExit {
                command: self.command.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let raw: Vec<RawSegment> = serde_json::from_slice(&output.stdout)
            .map_err(|source| RecognizerError::InvalidOutput { source })?;

        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(id, seg)| Segment::new(id as u32, seg.text.trim().to_string(), seg.start, seg.end))
            .collect())
    }
}
