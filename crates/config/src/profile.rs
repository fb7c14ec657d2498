//! Encoding profile structures and loading.
//!
//! A profile describes how one class of content should be encoded: codecs,
//! quality or bitrate targets, processing toggles, hard output limits, and
//! the SMART sizing parameters. Profiles live as TOML files in the
//! configured profiles directory; a subdirectory of the input tree named
//! after a profile acts as a queue for that profile.

use crate::config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;

/// Video encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoProfile {
    /// Encoder name passed to ffmpeg (`libx264`, `libx265`, `copy`, ...).
    #[serde(default = "default_video_codec")]
    pub codec: String,
    /// Constant-quality value; when set, no target bitrate is enforced.
    #[serde(default)]
    pub crf: Option<u32>,
    /// Fixed video bitrate in kbps (rarely used; sizing usually computes it).
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            crf: None,
            bitrate: None,
            max_width: None,
            max_height: None,
        }
    }
}

/// Audio encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioProfile {
    #[serde(default = "default_audio_codec")]
    pub codec: String,
    /// Bitrate in kbps for the surround track.
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_audio_channels")]
    pub channels: u32,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> u32 {
    384
}

fn default_audio_channels() -> u32 {
    6
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            codec: default_audio_codec(),
            bitrate: default_audio_bitrate(),
            channels: default_audio_channels(),
            sample_rate: None,
        }
    }
}

/// Processing step toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingProfile {
    #[serde(default = "default_true")]
    pub crop: bool,
    #[serde(default = "default_true")]
    pub scale: bool,
    #[serde(default)]
    pub denoise: bool,
    #[serde(default)]
    pub deinterlace: bool,
    /// Burn in forced or external subtitles.
    #[serde(default = "default_true")]
    pub subtitles: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProcessingProfile {
    fn default() -> Self {
        Self {
            crop: true,
            scale: true,
            denoise: false,
            deinterlace: false,
            subtitles: true,
        }
    }
}

/// Hard output constraints. All optional; unset means unconstrained.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LimitsProfile {
    pub max_size_mb: Option<u64>,
    pub max_bitrate: Option<u32>,
    pub min_bitrate: Option<u32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

/// SMART sizing configuration.
///
/// The sizing formula lowers the target bits-per-pixel as resolution rises:
/// `target_bpp = ref_bpp - ((pixels - ref_pixels) * factor / 1000)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartProfile {
    #[serde(default)]
    pub enabled: bool,
    /// Target output rate in MB per second of content.
    #[serde(default = "default_mbps")]
    pub mbps: f64,
    #[serde(default)]
    pub max_bpp: Option<f64>,
    #[serde(default)]
    pub min_bpp: Option<f64>,
    /// Reference BPP at `ref_pixels` resolution.
    #[serde(default = "default_ref_bpp")]
    pub ref_bpp: f64,
    /// Reference resolution in pixels (720x480).
    #[serde(default = "default_ref_pixels")]
    pub ref_pixels: u64,
    /// BPP reduction per pixel above the reference, scaled by 1/1000.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Allow the output to be larger than the input.
    #[serde(default)]
    pub can_grow: bool,
    /// Allow raising the bitrate to reach the target BPP.
    #[serde(default = "default_true_smart")]
    pub inflate: bool,
    /// Allow lowering the bitrate to reach the target BPP.
    #[serde(default = "default_true_smart")]
    pub deflate: bool,
}

fn default_mbps() -> f64 {
    1.0
}

fn default_ref_bpp() -> f64 {
    0.225
}

fn default_ref_pixels() -> u64 {
    345_600
}

fn default_factor() -> f64 {
    0.000_061
}

fn default_true_smart() -> bool {
    true
}

impl Default for SmartProfile {
    fn default() -> Self {
        Self {
            enabled: false,
            mbps: default_mbps(),
            max_bpp: None,
            min_bpp: None,
            ref_bpp: default_ref_bpp(),
            ref_pixels: default_ref_pixels(),
            factor: default_factor(),
            can_grow: false,
            inflate: true,
            deflate: true,
        }
    }
}

/// A resolution-keyed profile override.
///
/// Tiers let one profile serve mixed libraries: the executor selects the
/// tier with the highest `min_pixels` not exceeding the input pixel count
/// and applies its overrides before sizing. Thresholds are configuration,
/// not code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tier {
    pub name: String,
    /// Input pixel count (width x height) at which this tier activates.
    pub min_pixels: u64,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub mbps: Option<f64>,
    #[serde(default)]
    pub max_bpp: Option<f64>,
    #[serde(default)]
    pub min_bpp: Option<f64>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
}

/// Complete encoding profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Profile {
    #[serde(skip)]
    pub name: String,
    /// Output container; `None` falls back to the config default.
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub video: VideoProfile,
    #[serde(default)]
    pub audio: AudioProfile,
    #[serde(default)]
    pub processing: ProcessingProfile,
    #[serde(default)]
    pub limits: LimitsProfile,
    #[serde(default)]
    pub smart: SmartProfile,
    #[serde(default, rename = "tier")]
    pub tiers: Vec<Tier>,
}

/// Select the tier matching an input pixel count.
///
/// Returns the tier with the highest `min_pixels` that does not exceed
/// `pixels`, or `None` when no tier matches.
pub fn select_tier(profile: &Profile, pixels: u64) -> Option<&Tier> {
    profile
        .tiers
        .iter()
        .filter(|t| t.min_pixels <= pixels)
        .max_by_key(|t| t.min_pixels)
}

/// Apply a tier's overrides onto the profile.
pub fn apply_tier(profile: &mut Profile, tier: &Tier) {
    if tier.crf.is_some() {
        profile.video.crf = tier.crf;
    }
    if let Some(mbps) = tier.mbps {
        profile.smart.mbps = mbps;
    }
    if tier.max_bpp.is_some() {
        profile.smart.max_bpp = tier.max_bpp;
    }
    if tier.min_bpp.is_some() {
        profile.smart.min_bpp = tier.min_bpp;
    }
    if tier.max_width.is_some() {
        profile.limits.max_width = tier.max_width;
    }
    if tier.max_height.is_some() {
        profile.limits.max_height = tier.max_height;
    }
}

/// Check whether a profile file exists for the given name.
pub fn profile_exists(config: &Config, name: &str) -> bool {
    config.dirs.profiles.join(format!("{}.toml", name)).exists()
}

/// Load a profile by name from the profiles directory.
///
/// A missing profile file yields the default profile under the requested
/// name, so a bare installation still processes files.
pub fn load_profile(config: &Config, name: &str) -> Result<Profile, ConfigError> {
    let path = config.dirs.profiles.join(format!("{}.toml", name));

    if !path.exists() {
        return Ok(Profile {
            name: name.to_string(),
            ..Profile::default()
        });
    }

    let content = fs::read_to_string(&path)?;
    let mut profile: Profile = toml::from_str(&content)?;
    profile.name = name.to_string();
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn config_with_profiles(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.dirs.profiles = dir.to_path_buf();
        config
    }

    #[test]
    fn test_profile_defaults() {
        let profile = Profile::default();

        assert_eq!(profile.video.codec, "libx264");
        assert_eq!(profile.video.crf, None);
        assert_eq!(profile.audio.codec, "aac");
        assert_eq!(profile.audio.bitrate, 384);
        assert_eq!(profile.audio.channels, 6);
        assert!(profile.processing.crop);
        assert!(profile.processing.scale);
        assert!(!profile.processing.denoise);
        assert!(!profile.smart.enabled);
        assert!((profile.smart.ref_bpp - 0.225).abs() < 1e-9);
        assert_eq!(profile.smart.ref_pixels, 345_600);
        assert!(profile.smart.inflate);
        assert!(profile.smart.deflate);
        assert!(!profile.smart.can_grow);
        assert!(profile.tiers.is_empty());
    }

    #[test]
    fn test_load_missing_profile_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_with_profiles(temp_dir.path());

        let profile = load_profile(&config, "tv").unwrap();
        assert_eq!(profile.name, "tv");
        assert_eq!(profile.video.codec, "libx264");
    }

    #[test]
    fn test_load_profile_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("film.toml"),
            r#"
container = "mkv"

[video]
codec = "libx265"
crf = 22

[audio]
bitrate = 448

[processing]
denoise = true

[limits]
max_size_mb = 4096
max_width = 1920

[smart]
enabled = true
mbps = 1.2
min_bpp = 0.08

[[tier]]
name = "uhd"
min_pixels = 8294400
max_width = 3840
mbps = 2.5
"#,
        )
        .unwrap();
        let config = config_with_profiles(temp_dir.path());

        let profile = load_profile(&config, "film").unwrap();
        assert_eq!(profile.name, "film");
        assert_eq!(profile.container.as_deref(), Some("mkv"));
        assert_eq!(profile.video.codec, "libx265");
        assert_eq!(profile.video.crf, Some(22));
        assert_eq!(profile.audio.bitrate, 448);
        assert!(profile.processing.denoise);
        assert_eq!(profile.limits.max_size_mb, Some(4096));
        assert_eq!(profile.limits.max_width, Some(1920));
        assert!(profile.smart.enabled);
        assert!((profile.smart.mbps - 1.2).abs() < 1e-9);
        assert_eq!(profile.smart.min_bpp, Some(0.08));
        assert_eq!(profile.tiers.len(), 1);
        assert_eq!(profile.tiers[0].name, "uhd");
    }

    #[test]
    fn test_profile_exists() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("tv.toml"), "").unwrap();
        let config = config_with_profiles(temp_dir.path());

        assert!(profile_exists(&config, "tv"));
        assert!(!profile_exists(&config, "film"));
    }

    #[test]
    fn test_select_tier_picks_highest_matching_threshold() {
        let mut profile = Profile::default();
        profile.tiers = vec![
            Tier {
                name: "sd".to_string(),
                min_pixels: 0,
                crf: None,
                mbps: Some(0.5),
                max_bpp: None,
                min_bpp: None,
                max_width: None,
                max_height: None,
            },
            Tier {
                name: "hd".to_string(),
                min_pixels: 921_600,
                crf: None,
                mbps: Some(1.0),
                max_bpp: None,
                min_bpp: None,
                max_width: None,
                max_height: None,
            },
            Tier {
                name: "fhd".to_string(),
                min_pixels: 2_073_600,
                crf: None,
                mbps: Some(1.5),
                max_bpp: None,
                min_bpp: None,
                max_width: None,
                max_height: None,
            },
        ];

        assert_eq!(select_tier(&profile, 345_600).unwrap().name, "sd");
        assert_eq!(select_tier(&profile, 921_600).unwrap().name, "hd");
        assert_eq!(select_tier(&profile, 1_536_000).unwrap().name, "hd");
        assert_eq!(select_tier(&profile, 3_840 * 2_160).unwrap().name, "fhd");
    }

    #[test]
    fn test_select_tier_none_when_no_threshold_matches() {
        let mut profile = Profile::default();
        profile.tiers = vec![Tier {
            name: "hd".to_string(),
            min_pixels: 921_600,
            crf: None,
            mbps: None,
            max_bpp: None,
            min_bpp: None,
            max_width: None,
            max_height: None,
        }];

        assert!(select_tier(&profile, 100_000).is_none());
    }

    #[test]
    fn test_apply_tier_merges_only_set_fields() {
        let mut profile = Profile::default();
        profile.video.crf = Some(20);
        profile.limits.max_width = Some(1280);

        let tier = Tier {
            name: "uhd".to_string(),
            min_pixels: 8_294_400,
            crf: None,
            mbps: Some(2.5),
            max_bpp: None,
            min_bpp: Some(0.06),
            max_width: Some(3840),
            max_height: None,
        };
        apply_tier(&mut profile, &tier);

        // Unset tier fields leave the profile alone
        assert_eq!(profile.video.crf, Some(20));
        // Set tier fields override
        assert!((profile.smart.mbps - 2.5).abs() < 1e-9);
        assert_eq!(profile.smart.min_bpp, Some(0.06));
        assert_eq!(profile.limits.max_width, Some(3840));
        assert_eq!(profile.limits.max_height, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // *For any* set of tiers with distinct thresholds, the selected tier
        // threshold never exceeds the input pixel count, and no unselected
        // tier lies between the selected threshold and the input.
        #[test]
        fn prop_select_tier_is_highest_lower_bound(
            thresholds in proptest::collection::btree_set(0u64..50_000_000, 1..6),
            pixels in 0u64..50_000_000,
        ) {
            let mut profile = Profile::default();
            profile.tiers = thresholds
                .iter()
                .map(|&min_pixels| Tier {
                    name: format!("t{}", min_pixels),
                    min_pixels,
                    crf: None,
                    mbps: None,
                    max_bpp: None,
                    min_bpp: None,
                    max_width: None,
                    max_height: None,
                })
                .collect();

            match select_tier(&profile, pixels) {
                Some(tier) => {
                    prop_assert!(tier.min_pixels <= pixels);
                    for &t in &thresholds {
                        prop_assert!(!(t <= pixels && t > tier.min_pixels));
                    }
                }
                None => {
                    for &t in &thresholds {
                        prop_assert!(t > pixels);
                    }
                }
            }
        }
    }

}
