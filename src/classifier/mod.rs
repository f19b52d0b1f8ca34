//! Ad-detection collaborator and the pure coalescing logic layered on top of
//! whatever an LLM returns per transcript chunk.
//!
//! [`Classifier`] is the seam to an opaque "does this segment sound like an
//! ad" capability; [`OpenAiClassifier`] is the concrete adapter. Everything
//! else in this module — chunking, retrying, merging per-chunk results back
//! into one ordered transcript, and the transition-phrase/promotional-content
//! coalescing sweep — is deterministic and fully covered by unit tests, since
//! it is the part of the pipeline most prone to silent regressions.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{ProcessingResult, Segment, Transcript, TranscriptChunk};

const RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Segments within this many seconds of the current ad block are folded into
/// it even without their own transition/promotional marker.
const COALESCE_GAP_TOLERANCE: f64 = 5.0;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("classifier response was not the expected shape: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// Per-segment ad/not-ad verdicts for one chunk, keyed by segment id.
pub type ChunkVerdicts = BTreeMap<u32, bool>;

/// Classifies whether each segment in a chunk is part of an advertisement.
/// Implementations are not expected to apply any coalescing themselves —
/// that happens uniformly afterward in [`merge_adjacent_ads`].
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_chunk(&self, chunk: &TranscriptChunk) -> Result<ChunkVerdicts, ClassifierError>;
}

/// Phrase lists driving the heuristic coalescing pass. Defaults mirror the
/// reference German-language podcast corpus this pipeline was built against;
/// deployments in other languages supply their own via configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdPhraseConfig {
    pub transition_phrases: Vec<String>,
    pub promotional_indicators: Vec<String>,
}

impl Default for AdPhraseConfig {
    fn default() -> Self {
        Self {
            transition_phrases: vec![
                "nach einer kurzen unterbrechung".to_string(),
                "bleiben sie dran".to_string(),
                "wir sind gleich wieder da".to_string(),
                "gleich geht es weiter".to_string(),
            ],
            promotional_indicators: vec![
                "tickets".to_string(),
                "infos".to_string(),
                "anmeldung".to_string(),
                "weitere informationen".to_string(),
                "sparen sie".to_string(),
                "rabatt".to_string(),
                "vorteilscode".to_string(),
                "jetzt buchen".to_string(),
                "besuchen sie".to_string(),
                "mehr erfahren".to_string(),
            ],
        }
    }
}

/// Split a transcript into fixed-size, order-preserving chunks.
pub fn create_chunks(segments: &[Segment], chunk_size: usize) -> Vec<TranscriptChunk> {
    segments
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(chunk_id, segs)| TranscriptChunk {
            chunk_id: chunk_id as u32,
            segments: segs.to_vec(),
        })
        .collect()
}

fn build_prompt(chunk: &TranscriptChunk) -> serde_json::Value {
    let segments_text = chunk
        .segments
        .iter()
        .map(|seg| format!("ID: {} Text: {}", seg.id, seg.text))
        .collect::<Vec<_>>()
        .join("\n");

    json!([
        {
            "role": "system",
            "content": "You are an AI trained to detect advertisements and sponsored content in podcast transcripts. \
Consider the following patterns for ads:\n\
1. Transition phrases like 'We'll be right back', 'After this break', etc.\n\
2. Promotional content for events, products, or services\n\
3. Call to action phrases like 'Visit our website', 'Use code X for discount'\n\
4. Sponsor mentions and sponsored content\n\
5. Advertisement blocks that start with a transition and end with a return phrase\n\n\
You must respond with ONLY a JSON object containing segment classifications. \
The response must be a valid JSON object with a 'segments' array containing \
'id' (integer) and 'ad' (boolean) fields for each segment. \
Do not include any explanations or additional text in your response."
        },
        {
            "role": "user",
            "content": format!(
                "Review the transcript as a continuous text and identify complete advertisement blocks.\n\
Important rules:\n\
1. If you find a transition to ads (like 'We'll be back after this'), mark it AND the following segments as ads\n\
2. If segments are part of the same ad block, they should ALL be marked as ads\n\
3. Look for return phrases (like 'Welcome back') to identify where ad blocks end\n\
4. Consider promotional content (event announcements, product placements) as ads\n\n\
Segments to analyze:\n{segments_text}\n\n\
Return ONLY a JSON object with this structure:\n\
{{\n    \"segments\": [\n        {{\"id\": <segment_id>, \"ad\": true/false}},\n        ...\n    ]\n}}\n"
            )
        }
    ])
}

/// Run `chunk` through `classifier`, retrying on error up to `max_attempts`
/// times with a fixed backoff. Exhausting all attempts returns the chunk's
/// original (unclassified) segments plus the last error, matching the
/// original's "degrade, don't lose segments" contract.
pub async fn process_chunk(
    classifier: &dyn Classifier,
    chunk: &TranscriptChunk,
    max_attempts: u32,
) -> ProcessingResult {
    let mut attempts = 0u32;
    let mut last_error = None;

    while attempts < max_attempts {
        match classifier.classify_chunk(chunk).await {
            Ok(verdicts) => {
                let mut segments = chunk.segments.clone();
                for segment in &mut segments {
                    if let Some(&is_ad) = verdicts.get(&segment.id) {
                        segment.is_ad = is_ad;
                    }
                }
                debug!(
                    chunk_id = chunk.chunk_id,
                    segment_count = segments.len(),
                    "chunk classified"
                );
                return ProcessingResult { segments, error: None };
            }
            Err(err) => {
                warn!(
                    chunk_id = chunk.chunk_id,
                    attempt = attempts + 1,
                    error = %err,
                    "chunk classification failed"
                );
                last_error = Some(err.to_string());
                attempts += 1;
                if attempts < max_attempts {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    ProcessingResult {
        segments: chunk.segments.clone(),
        error: last_error,
    }
}

fn is_promotional_content(text: &str, phrases: &AdPhraseConfig) -> bool {
    let lower = text.to_lowercase();
    phrases.promotional_indicators.iter().any(|indicator| lower.contains(indicator.as_str()))
}

/// Walk-forward coalescing sweep: a segment carrying a transition phrase
/// becomes the start of an ad block even if the classifier missed it, and
/// the block is extended forward through any segment that is already
/// ad-flagged, shows promotional content, or sits within
/// [`COALESCE_GAP_TOLERANCE`] seconds of the next already-ad segment.
pub fn merge_adjacent_ads(segments: &mut [Segment], phrases: &AdPhraseConfig) {
    let mut ad_flags: Vec<bool> = segments.iter().map(|s| s.is_ad).collect();
    if !ad_flags.iter().any(|&is_ad| is_ad) {
        return;
    }

    for i in 0..segments.len() {
        if ad_flags[i] {
            continue;
        }

        let lower = segments[i].text.to_lowercase();
        if !phrases.transition_phrases.iter().any(|phrase| lower.contains(phrase.as_str())) {
            continue;
        }

        ad_flags[i] = true;

        let mut j = i + 1;
        while j < segments.len() {
            if ad_flags[j] || is_promotional_content(&segments[j].text, phrases) {
                ad_flags[j] = true;
                j += 1;
            } else if j + 1 < segments.len() && ad_flags[j + 1] {
                let time_gap = segments[j + 1].start - segments[j].end;
                if time_gap <= COALESCE_GAP_TOLERANCE {
                    ad_flags[j] = true;
                    j += 1;
                } else {
                    break;
                }
            } else {
                break;
            }
        }
    }

    for (segment, is_ad) in segments.iter_mut().zip(ad_flags) {
        segment.is_ad = is_ad;
    }
}

/// Group consecutive ad-flagged segments into blocks, treating gaps of up to
/// `max_gap` seconds between the end of one ad segment and the start of the
/// next as still part of the same block.
pub fn get_ad_blocks(segments: &[Segment], max_gap: f64) -> Vec<Vec<Segment>> {
    let mut blocks: Vec<Vec<Segment>> = Vec::new();
    let mut current: Vec<Segment> = Vec::new();

    for seg in segments {
        if seg.is_ad {
            if current.is_empty() {
                current.push(seg.clone());
            } else if seg.start - current.last().unwrap().end <= max_gap {
                current.push(seg.clone());
            } else {
                blocks.push(std::mem::take(&mut current));
                current.push(seg.clone());
            }
        } else if !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

/// Full ad-detection pass: chunk, classify each chunk (with retry), merge
/// per-chunk results back into one ordered transcript by segment id, then
/// run the coalescing sweep.
pub async fn detect_ads(
    classifier: &dyn Classifier,
    transcript: &Transcript,
    chunk_size: usize,
    max_attempts: u32,
    phrases: &AdPhraseConfig,
) -> Transcript {
    let chunks = create_chunks(&transcript.segments, chunk_size);
    info!(
        total_chunks = chunks.len(),
        total_segments = transcript.segments.len(),
        "starting ad detection"
    );

    let mut processed: BTreeMap<u32, Segment> = BTreeMap::new();
    let mut errors = Vec::new();

    for chunk in &chunks {
        let result = process_chunk(classifier, chunk, max_attempts).await;
        for segment in result.segments {
            processed.insert(segment.id, segment);
        }
        if let Some(error) = result.error {
            errors.push(format!("chunk {}: {error}", chunk.chunk_id));
        }
    }

    let mut all_segments: Vec<Segment> = processed.into_values().collect();
    merge_adjacent_ads(&mut all_segments, phrases);

    let ad_blocks = get_ad_blocks(&all_segments, COALESCE_GAP_TOLERANCE);
    for (i, block) in ad_blocks.iter().enumerate() {
        info!(
            block_number = i + 1,
            start_segment = block.first().map(|s| s.id),
            end_segment = block.last().map(|s| s.id),
            segment_count = block.len(),
            "ad block detected"
        );
    }

    if !errors.is_empty() {
        warn!(error_count = errors.len(), ?errors, "ad detection completed with errors");
    }

    Transcript {
        segments: all_segments,
        processed_at: transcript.processed_at,
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageContent,
}

#[derive(Debug, Deserialize)]
struct ChatMessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SegmentVerdict {
    id: u32,
    ad: bool,
}

#[derive(Debug, Deserialize)]
struct SegmentVerdicts {
    segments: Vec<SegmentVerdict>,
}

/// Talks to any OpenAI-chat-completions-compatible endpoint (OpenAI itself,
/// or a local/self-hosted gateway exposing the same API shape).
pub struct OpenAiClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_name: String,
    temperature: f64,
}

impl OpenAiClassifier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model_name: impl Into<String>, temperature: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client configuration should always be valid");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model_name: model_name.into(),
            temperature,
        }
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify_chunk(&self, chunk: &TranscriptChunk) -> Result<ChunkVerdicts, ClassifierError> {
        let body = json!({
            "model": self.model_name,
            "messages": build_prompt(chunk),
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http { status: status.as_u16(), body: text });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .unwrap_or("{}");

        let verdicts: SegmentVerdicts = serde_json::from_str(content)?;
        Ok(verdicts.segments.into_iter().map(|v| (v.id, v.ad)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u32, text: &str, start: f64, end: f64) -> Segment {
        Segment::new(id, text, start, end)
    }

    #[test]
    fn create_chunks_splits_on_the_configured_size_without_dropping_segments() {
        let segments: Vec<Segment> = (0..7).map(|i| segment(i, "x", i as f64, i as f64 + 1.0)).collect();
        let chunks = create_chunks(&segments, 3);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].segments.len(), 3);
        assert_eq!(chunks[2].segments.len(), 1);
        assert_eq!(chunks[2].segments[0].id, 6);
    }

    /// Mirrors the literal fixture: 12 segments ids 147-158 (contiguous),
    /// the LLM marks 154-157 as ads, and segments 148-149 contain a
    /// transition phrase. After coalescing, the ad set must be exactly
    /// {148, 149, 154, 155, 156, 157}.
    #[test]
    fn coalescing_extends_a_transition_phrase_forward_to_the_llm_marked_block() {
        let mut segments: Vec<Segment> = (147..159)
            .map(|id| {
                let text = if id == 148 || id == 149 {
                    "Wir sind nach einer kurzen Unterbrechung wieder da".to_string()
                } else {
                    format!("segment {id}")
                };
                segment(id, &text, id as f64, id as f64 + 1.0)
            })
            .collect();

        for seg in segments.iter_mut() {
            if (154..=157).contains(&seg.id) {
                seg.is_ad = true;
            }
        }

        merge_adjacent_ads(&mut segments, &AdPhraseConfig::default());

        let ad_ids: Vec<u32> = segments.iter().filter(|s| s.is_ad).map(|s| s.id).collect();
        assert_eq!(ad_ids, vec![148, 149, 154, 155, 156, 157]);
    }

    #[test]
    fn get_ad_blocks_returns_one_block_when_every_segment_is_marked() {
        let mut segments: Vec<Segment> = (148..158)
            .map(|id| segment(id, "ad", id as f64, id as f64 + 1.0))
            .collect();
        for seg in segments.iter_mut() {
            seg.is_ad = true;
        }

        let blocks = get_ad_blocks(&segments, COALESCE_GAP_TOLERANCE);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 10);
    }

    #[test]
    fn get_ad_blocks_splits_on_gaps_larger_than_the_tolerance() {
        let segments = vec![
            { let mut s = segment(0, "ad", 0.0, 1.0); s.is_ad = true; s },
            { let mut s = segment(1, "ad", 1.0, 2.0); s.is_ad = true; s },
            { let mut s = segment(2, "ad", 20.0, 21.0); s.is_ad = true; s },
        ];

        let blocks = get_ad_blocks(&segments, 5.0);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), 2);
        assert_eq!(blocks[1].len(), 1);
    }

    #[test]
    fn merge_adjacent_ads_is_a_no_op_when_nothing_is_flagged() {
        let mut segments: Vec<Segment> = (0..5).map(|i| segment(i, "plain text", i as f64, i as f64 + 1.0)).collect();
        let before = segments.clone();

        merge_adjacent_ads(&mut segments, &AdPhraseConfig::default());

        assert_eq!(segments, before);
    }

    struct FixedClassifier {
        verdicts: ChunkVerdicts,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify_chunk(&self, _chunk: &TranscriptChunk) -> Result<ChunkVerdicts, ClassifierError> {
            Ok(self.verdicts.clone())
        }
    }

    struct AlwaysFailsClassifier;

    #[async_trait]
    impl Classifier for AlwaysFailsClassifier {
        async fn classify_chunk(&self, _chunk: &TranscriptChunk) -> Result<ChunkVerdicts, ClassifierError> {
            Err(ClassifierError::Http { status: 500, body: "boom".to_string() })
        }
    }

    #[tokio::test]
    async fn process_chunk_applies_verdicts_to_matching_segment_ids() {
        let chunk = TranscriptChunk {
            chunk_id: 0,
            segments: vec![segment(0, "a", 0.0, 1.0), segment(1, "b", 1.0, 2.0)],
        };
        let mut verdicts = ChunkVerdicts::new();
        verdicts.insert(1, true);
        let classifier = FixedClassifier { verdicts };

        let result = process_chunk(&classifier, &chunk, 3).await;

        assert!(result.error.is_none());
        assert!(!result.segments[0].is_ad);
        assert!(result.segments[1].is_ad);
    }

    #[tokio::test]
    async fn process_chunk_exhausts_retries_and_returns_original_segments_with_error() {
        let chunk = TranscriptChunk {
            chunk_id: 0,
            segments: vec![segment(0, "a", 0.0, 1.0)],
        };
        let classifier = AlwaysFailsClassifier;

        let result = process_chunk(&classifier, &chunk, 1).await;

        assert!(result.error.is_some());
        assert_eq!(result.segments, chunk.segments);
    }
}
