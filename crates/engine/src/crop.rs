//! Black-border detection.
//!
//! A single measurement window can misjudge a dark scene, so detection
//! samples several short windows spread across the middle of the file and
//! takes the most frequent candidate rectangle as the consensus. The
//! [`CropMeasurer`] collaborator performs one measurement; this module
//! drives the sampling and the vote.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Number of measurement windows spread across the file.
pub const DEFAULT_SAMPLES: u32 = 10;

/// Length of each measurement window in seconds.
pub const DEFAULT_WINDOW_SECS: f64 = 2.0;

/// Error type for crop detection.
#[derive(Debug, Error)]
pub enum CropError {
    /// ffmpeg measurement run failed to start.
    #[error("crop measurement failed: {0}")]
    MeasureFailed(String),

    /// IO error during measurement.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A crop rectangle: the region to keep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl std::fmt::Display for CropRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

/// Collaborator contract: measure crop candidates over one short window.
///
/// A window may report several candidates (one per analyzed frame batch);
/// all of them feed the consensus vote.
pub trait CropMeasurer {
    fn measure(
        &self,
        path: &Path,
        start_secs: f64,
        window_secs: f64,
    ) -> Result<Vec<CropRect>, CropError>;
}

/// Detect the consensus crop rectangle for a file.
///
/// Sample timestamps are evenly spaced across the middle 80% of the
/// duration (the first and last 10% are skipped; credits and studio logos
/// are unrepresentative). The most frequent candidate wins, ties broken by
/// first observation. No candidates at all means no crop is needed, which
/// is a normal outcome, not an error.
pub fn detect_crop(
    measurer: &dyn CropMeasurer,
    path: &Path,
    duration_secs: f64,
    samples: u32,
    window_secs: f64,
) -> Result<Option<CropRect>, CropError> {
    let usable = duration_secs * 0.8;
    let interval = if samples > 1 {
        usable / samples as f64
    } else {
        usable
    };

    let mut candidates: Vec<CropRect> = Vec::new();

    for i in 0..samples {
        let start = duration_secs * 0.1 + i as f64 * interval;
        tracing::debug!(
            sample = i + 1,
            samples,
            start_secs = start,
            "measuring crop window"
        );
        let mut measured = measurer.measure(path, start, window_secs)?;
        candidates.append(&mut measured);
    }

    Ok(consensus(&candidates))
}

/// The most frequent rectangle, ties broken by first observation.
fn consensus(candidates: &[CropRect]) -> Option<CropRect> {
    let mut counts: HashMap<CropRect, u32> = HashMap::new();
    for rect in candidates {
        *counts.entry(*rect).or_insert(0) += 1;
    }

    let mut best: Option<(CropRect, u32)> = None;
    for rect in candidates {
        let count = counts[rect];
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((*rect, count)),
        }
    }
    best.map(|(rect, _)| rect)
}

/// ffmpeg-backed [`CropMeasurer`] using the `cropdetect` filter.
#[derive(Debug, Clone)]
pub struct FfmpegCropMeasurer {
    ffmpeg: String,
}

impl FfmpegCropMeasurer {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Default for FfmpegCropMeasurer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl CropMeasurer for FfmpegCropMeasurer {
    fn measure(
        &self,
        path: &Path,
        start_secs: f64,
        window_secs: f64,
    ) -> Result<Vec<CropRect>, CropError> {
        let output = Command::new(&self.ffmpeg)
            .arg("-ss")
            .arg(start_secs.to_string())
            .arg("-i")
            .arg(path)
            .arg("-t")
            .arg(window_secs.to_string())
            .args(["-vf", "cropdetect=24:16:0", "-f", "null", "-"])
            .output()?;

        // cropdetect reports on stderr; a non-zero exit here usually means
        // the seek ran past the end, which simply yields no candidates.
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_cropdetect_output(&stderr))
    }
}

/// Extract `crop=W:H:X:Y` candidates from ffmpeg cropdetect stderr.
pub fn parse_cropdetect_output(stderr: &str) -> Vec<CropRect> {
    let mut rects = Vec::new();

    for line in stderr.lines() {
        let Some(pos) = line.find("crop=") else {
            continue;
        };
        let field = line[pos + "crop=".len()..]
            .split_whitespace()
            .next()
            .unwrap_or("");
        let parts: Vec<&str> = field.split(':').collect();
        if parts.len() != 4 {
            continue;
        }
        let parsed: Option<Vec<u32>> = parts.iter().map(|p| p.parse().ok()).collect();
        if let Some(v) = parsed {
            rects.push(CropRect {
                width: v[0],
                height: v[1],
                x: v[2],
                y: v[3],
            });
        }
    }

    rects
}
