//! Output sizing calculations: scaling, bitrate, and SMART targeting.
//!
//! Everything in this module is pure and deterministic; the pipeline feeds
//! it probe metadata and profile settings and persists the results.
//!
//! The SMART sizing formula scales the target bits-per-pixel down as
//! resolution rises, because higher resolutions carry more spatial
//! redundancy for the encoder to exploit:
//!
//! ```text
//! target_bpp = ref_bpp - ((pixels - ref_pixels) * factor / 1000)
//! ```
//!
//! Defaults: `ref_bpp` 0.225 at `ref_pixels` 345600 (720x480) with
//! `factor` 0.000061.

use crate::crop::CropRect;
use crate::probe::MediaInfo;
use thiserror::Error;
use transize_config::Profile;

/// Fallback bits-per-pixel when neither an MB/s target nor SMART sizing
/// supplies one.
const DEFAULT_BPP: f64 = 0.15;

/// Absolute floor for any computed bits-per-pixel target.
const BPP_FLOOR: f64 = 0.05;

/// Error type for sizing calculations.
#[derive(Debug, Error)]
pub enum CalcError {
    /// The input has no video stream to size against.
    #[error("no video stream found")]
    NoVideoStream,
}

/// Result of the scale calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleResult {
    pub width: u32,
    pub height: u32,
    /// True when the output dimensions differ from the (cropped) input.
    pub scaled: bool,
}

/// Result of the bitrate calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateResult {
    /// Video bitrate in kbps; 0 means the encoder picks (CRF mode).
    pub video_kbps: u32,
    /// Audio bitrate in kbps.
    pub audio_kbps: u32,
    /// Combined bitrate in kbps.
    pub total_kbps: u32,
    /// Final bits per pixel, rounded to three decimals.
    pub bpp: f64,
}

/// Inputs to [`calculate_bitrate`].
#[derive(Debug, Clone)]
pub struct BitrateParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
    pub max_size_mb: Option<u64>,
    pub max_bitrate: Option<u32>,
    pub min_bitrate: Option<u32>,
    pub audio_kbps: u32,
    /// Constant-quality value; when set without SMART sizing, no bitrate
    /// target is produced.
    pub crf: Option<u32>,
    /// Target MB per second of content.
    pub mbps: Option<f64>,
    pub max_bpp: Option<f64>,
    pub min_bpp: Option<f64>,
    /// Input file size in bytes; bounds the output unless `can_grow`.
    pub input_size: Option<u64>,
    pub can_grow: bool,
    pub ref_bpp: f64,
    pub ref_pixels: u64,
    pub factor: f64,
    pub inflate: bool,
    pub deflate: bool,
    pub smart_enabled: bool,
}

impl Default for BitrateParams {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: 0.0,
            duration_secs: 0.0,
            max_size_mb: None,
            max_bitrate: None,
            min_bitrate: None,
            audio_kbps: 384,
            crf: None,
            mbps: None,
            max_bpp: None,
            min_bpp: None,
            input_size: None,
            can_grow: false,
            ref_bpp: 0.225,
            ref_pixels: 345_600,
            factor: 0.000_061,
            inflate: true,
            deflate: true,
            smart_enabled: false,
        }
    }
}

/// Round a value to the nearest even integer (codecs want even dimensions).
pub fn round_to_even(value: u32) -> u32 {
    ((value + 1) / 2) * 2
}

/// Compute the SMART target bits-per-pixel for a resolution.
///
/// Clamps to `[min_bpp, max_bpp]` when given, then applies the hard 0.05
/// floor so the target never collapses to a useless value.
pub fn calculate_smart_bpp(
    pixels: u64,
    ref_bpp: f64,
    ref_pixels: u64,
    factor: f64,
    min_bpp: Option<f64>,
    max_bpp: Option<f64>,
) -> f64 {
    let diff = pixels as f64 - ref_pixels as f64;
    let mut target_bpp = ref_bpp - (diff * factor / 1000.0);

    if let Some(min) = min_bpp {
        if target_bpp < min {
            target_bpp = min;
        }
    }
    if let Some(max) = max_bpp {
        if target_bpp > max {
            target_bpp = max;
        }
    }

    if target_bpp < BPP_FLOOR {
        target_bpp = BPP_FLOOR;
    }

    target_bpp
}

/// Compute output dimensions under width/height constraints.
///
/// Base dimensions are the crop dimensions when supplied, else the input
/// dimensions. The width constraint is applied first, then the height
/// constraint against the resulting height, so both may fire in sequence
/// and the final aspect ratio is only approximately preserved in that case.
/// Final dimensions are always rounded to even.
pub fn calculate_scale(
    input_width: u32,
    input_height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
    crop_width: Option<u32>,
    crop_height: Option<u32>,
) -> ScaleResult {
    let base_width = crop_width.unwrap_or(input_width);
    let base_height = crop_height.unwrap_or(input_height);

    let aspect = if base_height > 0 {
        base_width as f64 / base_height as f64
    } else {
        1.0
    };

    let mut width = base_width;
    let mut height = base_height;

    if let Some(max_w) = max_width {
        if width > max_w {
            width = max_w;
            height = round_to_even((width as f64 / aspect) as u32);
        }
    }

    if let Some(max_h) = max_height {
        if height > max_h {
            height = max_h;
            width = round_to_even((height as f64 * aspect) as u32);
        }
    }

    width = round_to_even(width);
    height = round_to_even(height);

    ScaleResult {
        width,
        height,
        scaled: width != base_width || height != base_height,
    }
}

/// Truncated kbps from a byte count over a duration.
fn kbps_from_bytes(bytes: f64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        ((bytes * 8.0) / duration_secs / 1000.0).trunc()
    } else {
        0.0
    }
}

/// Compute the target video bitrate under all profile constraints.
///
/// Ordered refinement:
/// 1. CRF without SMART sizing short-circuits to "encoder decides".
/// 2. Initial target size from the MB/s rate, else a default-BPP estimate.
/// 3. Clamp to `max_size_mb`.
/// 4. Clamp to the input size unless growth is permitted.
/// 5. Subtract audio; if audio alone exceeds the target, video gets 90%.
/// 6. SMART adjustment: inflate toward the target BPP only while the size
///    bounds still hold; deflate unconditionally.
/// 7. Hard min/max BPP limits override the SMART result.
/// 8. Re-clamp against `max_size_mb` and the input size, recomputing the
///    bitrate from the bound each time.
/// 9. Absolute max/min bitrate limits.
pub fn calculate_bitrate(params: &BitrateParams) -> BitrateResult {
    let pixels = params.width as u64 * params.height as u64;
    let pixels_per_second = pixels as f64 * params.fps;
    let duration = params.duration_secs;

    // CRF mode without SMART sizing: the encoder is free to pick.
    if params.crf.is_some() && !params.smart_enabled {
        return BitrateResult {
            video_kbps: 0,
            audio_kbps: params.audio_kbps,
            total_kbps: 0,
            bpp: 0.0,
        };
    }

    let audio_size_bytes = (params.audio_kbps as f64 * 1000.0 * duration) / 8.0;

    // Initial target size from the MB/s rate, else a default-BPP estimate.
    let mut target_size_bytes = match params.mbps {
        Some(mbps) if duration > 0.0 => duration * mbps * 1024.0 * 1024.0,
        _ => {
            let video_size = (pixels_per_second * DEFAULT_BPP * duration) / 8.0;
            video_size + audio_size_bytes
        }
    };

    if let Some(max_mb) = params.max_size_mb {
        if duration > 0.0 {
            let max_bytes = max_mb as f64 * 1024.0 * 1024.0;
            if target_size_bytes > max_bytes {
                target_size_bytes = max_bytes;
            }
        }
    }

    if let Some(input_size) = params.input_size {
        if !params.can_grow && target_size_bytes > input_size as f64 {
            target_size_bytes = input_size as f64;
        }
    }

    let mut video_size_bytes = target_size_bytes - audio_size_bytes;
    if video_size_bytes < 0.0 {
        video_size_bytes = target_size_bytes * 0.9;
    }

    let mut video_kbps = kbps_from_bytes(video_size_bytes, duration);

    let initial_bpp = if pixels_per_second > 0.0 {
        (video_kbps * 1000.0) / pixels_per_second
    } else {
        0.0
    };

    // SMART adjustment toward the resolution-derived target BPP.
    if params.smart_enabled && pixels_per_second > 0.0 {
        let target_bpp = calculate_smart_bpp(
            pixels,
            params.ref_bpp,
            params.ref_pixels,
            params.factor,
            params.min_bpp,
            params.max_bpp,
        );

        if initial_bpp < target_bpp && params.inflate {
            let new_video_kbps = (pixels_per_second * target_bpp / 1000.0).trunc();
            let new_video_size = (new_video_kbps * 1000.0 * duration) / 8.0;
            let new_total_size = new_video_size + audio_size_bytes;

            let mut can_inflate = true;
            if let Some(max_mb) = params.max_size_mb {
                if new_total_size > max_mb as f64 * 1024.0 * 1024.0 {
                    can_inflate = false;
                }
            }
            if let Some(input_size) = params.input_size {
                if !params.can_grow && new_total_size > input_size as f64 {
                    can_inflate = false;
                }
            }

            if can_inflate {
                video_kbps = new_video_kbps;
            }
        } else if initial_bpp > target_bpp && params.deflate {
            video_kbps = (pixels_per_second * target_bpp / 1000.0).trunc();
        }
    }

    // Hard BPP limits override the SMART result.
    if pixels_per_second > 0.0 {
        let current_bpp = (video_kbps * 1000.0) / pixels_per_second;

        if let Some(max_bpp) = params.max_bpp {
            if current_bpp > max_bpp {
                video_kbps = (pixels_per_second * max_bpp / 1000.0).trunc();
            }
        }
        if let Some(min_bpp) = params.min_bpp {
            if current_bpp < min_bpp {
                video_kbps = (pixels_per_second * min_bpp / 1000.0).trunc();
            }
        }
    }

    // Re-check the size bounds after the BPP adjustments, deriving the
    // bitrate back from the bound when it fires.
    if let Some(max_mb) = params.max_size_mb {
        if duration > 0.0 {
            let video_size = (video_kbps * 1000.0 * duration) / 8.0;
            let max_bytes = max_mb as f64 * 1024.0 * 1024.0;

            if video_size + audio_size_bytes > max_bytes {
                let mut bounded_video = max_bytes - audio_size_bytes;
                if bounded_video < 0.0 {
                    bounded_video = max_bytes * 0.9;
                }
                video_kbps = kbps_from_bytes(bounded_video, duration);
            }
        }
    }

    if let Some(input_size) = params.input_size {
        if !params.can_grow && duration > 0.0 {
            let video_size = (video_kbps * 1000.0 * duration) / 8.0;

            if video_size + audio_size_bytes > input_size as f64 {
                let mut bounded_video = input_size as f64 - audio_size_bytes;
                if bounded_video < 0.0 {
                    bounded_video = input_size as f64 * 0.9;
                }
                video_kbps = kbps_from_bytes(bounded_video, duration);
            }
        }
    }

    if let Some(max_bitrate) = params.max_bitrate {
        if video_kbps > max_bitrate as f64 {
            video_kbps = max_bitrate as f64;
        }
    }
    if let Some(min_bitrate) = params.min_bitrate {
        if video_kbps < min_bitrate as f64 {
            video_kbps = min_bitrate as f64;
        }
    }

    let final_bpp = if pixels_per_second > 0.0 {
        (video_kbps * 1000.0) / pixels_per_second
    } else {
        0.0
    };

    let video_kbps = video_kbps.max(0.0) as u32;

    BitrateResult {
        video_kbps,
        audio_kbps: params.audio_kbps,
        total_kbps: video_kbps + params.audio_kbps,
        bpp: (final_bpp * 1000.0).round() / 1000.0,
    }
}

/// Estimate the output file size in bytes for a bitrate pair.
pub fn calculate_output_size(video_kbps: u32, audio_kbps: u32, duration_secs: f64) -> u64 {
    let total_kbps = (video_kbps + audio_kbps) as f64;
    let total_bits = total_kbps * 1000.0 * duration_secs;
    (total_bits / 8.0) as u64
}

/// Compute scale and bitrate for a probed input under a profile.
pub fn calculate_for_profile(
    info: &MediaInfo,
    profile: &Profile,
    crop: Option<&CropRect>,
) -> Result<(ScaleResult, BitrateResult), CalcError> {
    let video = info.primary_video().ok_or(CalcError::NoVideoStream)?;

    let scale = calculate_scale(
        video.width,
        video.height,
        profile.limits.max_width.or(profile.video.max_width),
        profile.limits.max_height.or(profile.video.max_height),
        crop.map(|c| c.width),
        crop.map(|c| c.height),
    );

    let bitrate = calculate_bitrate(&BitrateParams {
        width: scale.width,
        height: scale.height,
        fps: video.fps,
        duration_secs: info.duration_secs,
        max_size_mb: profile.limits.max_size_mb,
        max_bitrate: profile.limits.max_bitrate,
        min_bitrate: profile.limits.min_bitrate,
        audio_kbps: profile.audio.bitrate,
        crf: profile.video.crf,
        mbps: if profile.smart.enabled {
            Some(profile.smart.mbps)
        } else {
            None
        },
        max_bpp: profile.smart.max_bpp,
        min_bpp: profile.smart.min_bpp,
        input_size: Some(info.size_bytes),
        can_grow: profile.smart.can_grow,
        ref_bpp: profile.smart.ref_bpp,
        ref_pixels: profile.smart.ref_pixels,
        factor: profile.smart.factor,
        inflate: profile.smart.inflate,
        deflate: profile.smart.deflate,
        smart_enabled: profile.smart.enabled,
    });

    Ok((scale, bitrate))
}
