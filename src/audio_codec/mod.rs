//! Audio decode/edit/export collaborator.
//!
//! [`AudioEditor`] is the seam to an opaque "cut these intervals out of this
//! audio file" capability; [`SymphoniaAudioEditor`] is the concrete adapter,
//! decoding via `symphonia` and re-encoding via `hound` (WAV) or `lame`
//! (MP3), matching whatever the input's extension calls for. The interval
//! merge sweep ([`merge_cut_segments`]) that turns raw ad timestamps into a
//! minimal, pairwise-disjoint cut set is pure and unit-tested on its own.

use std::path::Path;

use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio::task;

use crate::model::Segment;

#[derive(Debug, Error)]
pub enum AudioEditorError {
    #[error("failed to open audio file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no supported audio track found in {path}")]
    NoAudioTrack { path: String },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unsupported output extension {extension} for {path}")]
    UnsupportedFormat { path: String, extension: String },
    #[error("failed to write output {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Decodes `input_path`, removes the audio in every `(start, end)` second
/// pair of `cuts`, and writes the remainder to `output_path` in the same
/// container/codec implied by its extension.
#[async_trait]
pub trait AudioEditor: Send + Sync {
    async fn remove_segments(
        &self,
        input_path: &Path,
        output_path: &Path,
        cuts: &[(f64, f64)],
    ) -> Result<(), AudioEditorError>;
}

/// Collect every segment marked as an ad into `(start, end)` pairs, in the
/// order the transcript already keeps them (ascending by `start`).
pub fn ad_segment_intervals(segments: &[Segment]) -> Vec<(f64, f64)> {
    segments.iter().filter(|s| s.is_ad).map(|s| (s.start, s.end)).collect()
}

/// Merge overlapping or near-adjacent intervals, dropping any merged
/// interval shorter than `min_duration`. Mirrors the original's
/// `_merge_segments`: sort by start, walk forward extending the current run
/// while the next interval starts within `max_gap` of the current run's end.
pub fn merge_cut_segments(
    intervals: &[(f64, f64)],
    max_gap: f64,
    min_duration: f64,
) -> Vec<(f64, f64)> {
    if intervals.is_empty() {
        return Vec::new();
    }

    let mut sorted = intervals.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let mut merged = Vec::new();
    let (mut current_start, mut current_end) = sorted[0];

    for &(start, end) in &sorted[1..] {
        if start <= current_end + max_gap {
            current_end = current_end.max(end);
        } else {
            if current_end - current_start >= min_duration {
                merged.push((current_start, current_end));
            }
            current_start = start;
            current_end = end;
        }
    }

    if current_end - current_start >= min_duration {
        merged.push((current_start, current_end));
    }

    merged
}

struct DecodedAudio {
    sample_rate: u32,
    channels: usize,
    /// Interleaved samples, one `f32` per channel per frame.
    samples: Vec<f32>,
}

fn decode_file(path: &Path) -> Result<DecodedAudio, AudioEditorError> {
    let path_str = path.display().to_string();

    let file = std::fs::File::open(path).map_err(|source| AudioEditorError::Open {
        path: path_str.clone(),
        source,
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|source| AudioEditorError::Decode {
            path: path_str.clone(),
            source: anyhow::Error::new(source),
        })?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioEditorError::NoAudioTrack { path: path_str.clone() })?
        .clone();

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|source| AudioEditorError::Decode {
            path: path_str.clone(),
            source: anyhow::Error::new(source),
        })?;

    let mut samples = Vec::new();
    let mut channels = 1usize;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(source) => {
                return Err(AudioEditorError::Decode {
                    path: path_str.clone(),
                    source: anyhow::Error::new(source),
                })
            }
        };

        if packet.track_id() != track.id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    let spec = *decoded.spec();
                    channels = spec.channels.count();
                    sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                }

                if let Some(buf) = &mut sample_buf {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(source) => {
                return Err(AudioEditorError::Decode {
                    path: path_str.clone(),
                    source: anyhow::Error::new(source),
                })
            }
        }
    }

    Ok(DecodedAudio { sample_rate, channels, samples })
}

/// Drop every frame that falls inside a cut interval, keeping everything
/// else in original order — the audio analogue of the transcript's
/// ad-segment removal.
fn remove_cuts(audio: &DecodedAudio, cuts: &[(f64, f64)]) -> Vec<f32> {
    if cuts.is_empty() {
        return audio.samples.clone();
    }

    let channels = audio.channels.max(1);
    let total_frames = audio.samples.len() / channels;
    let mut kept = Vec::with_capacity(audio.samples.len());

    let mut cut_idx = 0;
    for frame in 0..total_frames {
        let t = frame as f64 / audio.sample_rate as f64;
        while cut_idx < cuts.len() && t >= cuts[cut_idx].1 {
            cut_idx += 1;
        }
        let in_cut = cut_idx < cuts.len() && t >= cuts[cut_idx].0 && t < cuts[cut_idx].1;
        if !in_cut {
            let base = frame * channels;
            kept.extend_from_slice(&audio.samples[base..base + channels]);
        }
    }

    kept
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: usize) -> Result<(), AudioEditorError> {
    let spec = hound::WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(|source| AudioEditorError::Write {
        path: path.display().to_string(),
        source: anyhow::Error::new(source),
    })?;

    for &sample in samples {
        writer.write_sample(sample).map_err(|source| AudioEditorError::Write {
            path: path.display().to_string(),
            source: anyhow::Error::new(source),
        })?;
    }

    writer.finalize().map_err(|source| AudioEditorError::Write {
        path: path.display().to_string(),
        source: anyhow::Error::new(source),
    })
}

fn write_mp3(path: &Path, samples: &[f32], sample_rate: u32, channels: usize) -> Result<(), AudioEditorError> {
    use lame::Lame;

    let mut lame = Lame::new().ok_or_else(|| AudioEditorError::Write {
        path: path.display().to_string(),
        source: anyhow::anyhow!("failed to initialize lame encoder"),
    })?;
    lame.set_channels(channels as u8).ok();
    lame.set_sample_rate(sample_rate).ok();
    lame.init_params().map_err(|_| AudioEditorError::Write {
        path: path.display().to_string(),
        source: anyhow::anyhow!("failed to initialize lame encoder parameters"),
    })?;

    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();

    let (left, right): (Vec<i16>, Vec<i16>) = if channels >= 2 {
        let mut left = Vec::with_capacity(pcm.len() / 2);
        let mut right = Vec::with_capacity(pcm.len() / 2);
        for chunk in pcm.chunks(channels) {
            left.push(chunk[0]);
            right.push(chunk.get(1).copied().unwrap_or(chunk[0]));
        }
        (left, right)
    } else {
        (pcm.clone(), pcm)
    };

    let mut output = vec![0u8; left.len() * 5 / 4 + 7200];
    let written = lame
        .encode(&left, &right, &mut output)
        .map_err(|_| AudioEditorError::Write {
            path: path.display().to_string(),
            source: anyhow::anyhow!("lame encoding failed"),
        })?;
    output.truncate(written);

    std::fs::write(path, output).map_err(|source| AudioEditorError::Write {
        path: path.display().to_string(),
        source: anyhow::Error::new(source),
    })
}

/// Decodes via `symphonia`, drops cut intervals, and re-exports in the
/// format implied by the output path's extension (`.wav` via `hound`,
/// `.mp3` via `lame`).
pub struct SymphoniaAudioEditor;

impl SymphoniaAudioEditor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SymphoniaAudioEditor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioEditor for SymphoniaAudioEditor {
    async fn remove_segments(
        &self,
        input_path: &Path,
        output_path: &Path,
        cuts: &[(f64, f64)],
    ) -> Result<(), AudioEditorError> {
        let input_path = input_path.to_path_buf();
        let output_path = output_path.to_path_buf();
        let cuts = cuts.to_vec();

        task::spawn_blocking(move || {
            let audio = decode_file(&input_path)?;
            let kept = remove_cuts(&audio, &cuts);

            let extension = output_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();

            match extension.as_str() {
                "wav" => write_wav(&output_path, &kept, audio.sample_rate, audio.channels),
                "mp3" => write_mp3(&output_path, &kept, audio.sample_rate, audio.channels),
                other => Err(AudioEditorError::UnsupportedFormat {
                    path: output_path.display().to_string(),
                    extension: other.to_string(),
                }),
            }
        })
        .await
        .map_err(|source| AudioEditorError::Decode {
            path: output_path.display().to_string(),
            source: anyhow::Error::new(source),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_cut_segments_joins_runs_within_the_gap_tolerance() {
        let intervals = vec![(10.0, 20.0), (25.0, 30.0), (60.0, 65.0)];

        let merged = merge_cut_segments(&intervals, 20.0, 5.0);

        assert_eq!(merged, vec![(10.0, 30.0), (60.0, 65.0)]);
    }

    #[test]
    fn merge_cut_segments_drops_runs_shorter_than_min_duration() {
        let intervals = vec![(0.0, 2.0), (100.0, 101.0)];

        let merged = merge_cut_segments(&intervals, 20.0, 5.0);

        assert!(merged.is_empty());
    }

    #[test]
    fn merge_cut_segments_result_is_pairwise_disjoint_and_sorted() {
        let intervals = vec![(50.0, 60.0), (0.0, 10.0), (15.0, 45.0)];

        let merged = merge_cut_segments(&intervals, 20.0, 5.0);

        for window in merged.windows(2) {
            assert!(window[0].1 <= window[1].0);
            assert!(window[0].0 < window[0].1);
        }
        assert!(merged.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn merge_cut_segments_on_empty_input_is_empty() {
        assert!(merge_cut_segments(&[], 20.0, 5.0).is_empty());
    }

    #[test]
    fn ad_segment_intervals_extracts_only_ad_marked_segments() {
        let segments = vec![
            Segment::new(0, "a", 0.0, 1.0),
            { let mut s = Segment::new(1, "b", 1.0, 2.0); s.is_ad = true; s },
        ];

        let intervals = ad_segment_intervals(&segments);

        assert_eq!(intervals, vec![(1.0, 2.0)]);
    }
}
