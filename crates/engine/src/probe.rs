//! Media metadata extraction.
//!
//! Defines the [`Prober`] collaborator contract the pipeline consumes and
//! the ffprobe-backed implementation. Probing runs
//! `ffprobe -v quiet -print_format json -show_format -show_streams` and
//! parses the JSON output.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Stream index within the container.
    pub index: usize,
    /// Codec name (e.g., "h264", "hevc", "mpeg2video").
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second, parsed from fractional rates like `24000/1001`.
    pub fps: f64,
    /// Stream duration in seconds (format duration when absent).
    pub duration_secs: f64,
    /// Bitrate in bits per second, when the container reports one.
    pub bitrate: Option<u64>,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub index: usize,
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub bitrate: Option<u64>,
    /// ISO 639 language tag, empty when untagged.
    pub language: String,
}

/// Information about a subtitle stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleStream {
    /// Subtitle-relative index (what ffmpeg's `si=` filter option expects).
    pub index: usize,
    pub codec: String,
    pub language: String,
    /// Marked as a forced track in the container.
    pub forced: bool,
}

/// Complete probed metadata for one media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    /// Container format name (first of ffprobe's comma-separated list).
    pub format: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    /// Overall bitrate in bits per second.
    pub bitrate: u64,
    pub video: Vec<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitles: Vec<SubtitleStream>,
}

impl MediaInfo {
    /// The primary (first) video stream.
    pub fn primary_video(&self) -> Option<&VideoStream> {
        self.video.first()
    }

    /// The primary (first) audio stream.
    pub fn primary_audio(&self) -> Option<&AudioStream> {
        self.audio.first()
    }

    /// The forced subtitle track, if the container carries one.
    pub fn forced_subtitle(&self) -> Option<&SubtitleStream> {
        self.subtitles.iter().find(|s| s.forced)
    }

    /// Pick the best audio stream for a preferred language.
    ///
    /// Tracks matching the language win, and among those the one with the
    /// most channels (5.1 over stereo). Without a language match, the
    /// track with the most channels wins.
    pub fn audio_by_language(&self, preferred: &str) -> Option<&AudioStream> {
        let lang_match = self
            .audio
            .iter()
            .filter(|s| s.language.eq_ignore_ascii_case(preferred))
            .max_by_key(|s| s.channels);

        lang_match.or_else(|| self.audio.iter().max_by_key(|s| s.channels))
    }
}

/// Collaborator contract: extract metadata for one media file.
pub trait Prober {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<usize>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
        pub sample_rate: Option<String>,
        pub tags: Option<Tags>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Tags {
        pub language: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub forced: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Parse a frame rate string such as `24000/1001` or `25`.
pub fn parse_fps(fps_str: &str) -> f64 {
    if let Some((num, den)) = fps_str.split_once('/') {
        let num: f64 = num.parse().unwrap_or(0.0);
        let den: f64 = den.parse().unwrap_or(0.0);
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    } else {
        fps_str.parse().unwrap_or(0.0)
    }
}

/// Parse ffprobe JSON output into a [`MediaInfo`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let raw: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = raw.streams.unwrap_or_default();
    let format = raw
        .format
        .ok_or_else(|| ProbeError::ParseError("missing format section".to_string()))?;

    let format_name = format
        .format_name
        .unwrap_or_default()
        .split(',')
        .next()
        .unwrap_or_default()
        .to_string();
    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let bitrate = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .unwrap_or(0);

    let mut video = Vec::new();
    let mut audio = Vec::new();
    let mut subtitles = Vec::new();

    for stream in streams {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec = stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let index = stream.index.unwrap_or(0);
        let stream_bitrate = stream.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok());
        let language = stream
            .tags
            .as_ref()
            .and_then(|t| t.language.clone())
            .unwrap_or_default();

        match codec_type {
            "video" => {
                let fps = stream
                    .r_frame_rate
                    .as_deref()
                    .map(parse_fps)
                    .unwrap_or(0.0);
                let stream_duration = stream
                    .duration
                    .as_deref()
                    .and_then(|d| d.parse::<f64>().ok())
                    .unwrap_or(duration_secs);

                video.push(VideoStream {
                    index,
                    codec,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    fps,
                    duration_secs: stream_duration,
                    bitrate: stream_bitrate,
                });
            }
            "audio" => {
                audio.push(AudioStream {
                    index,
                    codec,
                    channels: stream.channels.unwrap_or(0),
                    sample_rate: stream
                        .sample_rate
                        .as_deref()
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0),
                    bitrate: stream_bitrate,
                    language,
                });
            }
            "subtitle" => {
                let forced = stream
                    .disposition
                    .as_ref()
                    .and_then(|d| d.forced)
                    .unwrap_or(0)
                    == 1;
                subtitles.push(SubtitleStream {
                    // Subtitle-relative index for the si= filter option
                    index: subtitles.len(),
                    codec,
                    language,
                    forced,
                });
            }
            _ => {}
        }
    }

    Ok(MediaInfo {
        format: format_name,
        duration_secs,
        size_bytes,
        bitrate,
        video,
        audio,
        subtitles,
    })
}

/// ffprobe-backed [`Prober`].
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: String,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        tracing::debug!(path = %path.display(), "probing");

        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}
