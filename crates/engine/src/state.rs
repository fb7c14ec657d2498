//! Persistent job state.
//!
//! Every job directory carries a `state.json` record describing what has
//! been done so far, so any worker can resume the job after a crash or a
//! handoff. The record is always rewritten in full and swapped into place
//! atomically, so readers see exactly one of two complete versions.
//!
//! Jobs created by the previous generation of the system carry a
//! section-keyed `<name>.cfg` text record instead; loading migrates it to
//! the canonical format once and then works from the canonical record.

use crate::crop::CropRect;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Current state record schema version.
pub const STATE_VERSION: &str = "2.0.0";

/// Error type for state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    /// IO error reading or writing the record.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The record exists but cannot be parsed.
    #[error("Failed to parse state record: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A pipeline stage flag.
///
/// Fixed enumeration rather than string keys so a typo in a stage name is
/// a compile error, not a silently-false flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Crop,
    Scale,
    Encode,
    Mux,
    Move,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Probe,
        Stage::Crop,
        Stage::Scale,
        Stage::Encode,
        Stage::Mux,
        Stage::Move,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Probe => "probe",
            Stage::Crop => "crop",
            Stage::Scale => "scale",
            Stage::Encode => "encode",
            Stage::Mux => "mux",
            Stage::Move => "move",
        };
        write!(f, "{}", name)
    }
}

/// One flag per pipeline stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSet {
    #[serde(default)]
    pub probe: bool,
    #[serde(default)]
    pub crop: bool,
    #[serde(default)]
    pub scale: bool,
    #[serde(default)]
    pub encode: bool,
    #[serde(default)]
    pub mux: bool,
    #[serde(default, rename = "move")]
    pub relocate: bool,
}

impl StageSet {
    /// A set with every stage flagged.
    pub fn all() -> Self {
        Self {
            probe: true,
            crop: true,
            scale: true,
            encode: true,
            mux: true,
            relocate: true,
        }
    }

    pub fn get(&self, stage: Stage) -> bool {
        match stage {
            Stage::Probe => self.probe,
            Stage::Crop => self.crop,
            Stage::Scale => self.scale,
            Stage::Encode => self.encode,
            Stage::Mux => self.mux,
            Stage::Move => self.relocate,
        }
    }

    pub fn set(&mut self, stage: Stage, value: bool) {
        match stage {
            Stage::Probe => self.probe = value,
            Stage::Crop => self.crop = value,
            Stage::Scale => self.scale = value,
            Stage::Encode => self.encode = value,
            Stage::Mux => self.mux = value,
            Stage::Move => self.relocate = value,
        }
    }
}

/// Input metadata captured once during the probe stage.
///
/// Diagnostic record only: resuming re-probes the source rather than
/// trusting this snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputSnapshot {
    pub path: String,
    pub size: u64,
    pub format: String,
    pub duration: f64,
    pub video_codec: String,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: f64,
    pub audio_codec: String,
    pub audio_channels: u32,
    pub audio_bitrate: u32,
}

/// The planned (and progressively realized) output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPlan {
    pub path: String,
    pub container: String,
    pub video_codec: String,
    pub video_width: u32,
    pub video_height: u32,
    pub video_bitrate: u32,
    pub video_crf: Option<u32>,
    pub audio_codec: String,
    pub audio_channels: u32,
    pub audio_bitrate: u32,
    pub crop: Option<CropRect>,
    /// Pass currently being attempted (0 = encoding not started).
    /// Persisted before each pass runs, so a resume redoes the attempted
    /// pass in full rather than assuming partial completion.
    #[serde(default)]
    pub current_pass: u32,
    #[serde(default = "default_total_passes")]
    pub total_passes: u32,
}

fn default_total_passes() -> u32 {
    2
}

impl Default for OutputPlan {
    fn default() -> Self {
        Self {
            path: String::new(),
            container: String::new(),
            video_codec: String::new(),
            video_width: 0,
            video_height: 0,
            video_bitrate: 0,
            video_crf: None,
            audio_codec: String::new(),
            audio_channels: 0,
            audio_bitrate: 0,
            crop: None,
            current_pass: 0,
            total_passes: default_total_passes(),
        }
    }
}

/// The complete durable record for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub version: String,
    pub profile_name: String,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created: i64,
    /// Unix timestamp (milliseconds) of the last save.
    pub updated: i64,
    /// Stages this job should run.
    pub enabled: StageSet,
    /// Stages already completed.
    pub done: StageSet,
    pub input: InputSnapshot,
    pub output: OutputPlan,
    /// Failure message; empty while the job is healthy.
    #[serde(default)]
    pub error: String,
}

impl Default for JobState {
    fn default() -> Self {
        let now = current_timestamp_ms();
        Self {
            version: STATE_VERSION.to_string(),
            profile_name: String::new(),
            created: now,
            updated: now,
            enabled: StageSet::default(),
            done: StageSet::default(),
            input: InputSnapshot::default(),
            output: OutputPlan::default(),
            error: String::new(),
        }
    }
}

impl JobState {
    /// Mark a stage as completed.
    pub fn mark_done(&mut self, stage: Stage) {
        self.done.set(stage, true);
        self.updated = current_timestamp_ms();
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.done.get(stage)
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.enabled.get(stage)
    }
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The canonical state file path for a job directory.
pub fn state_path(job_dir: &Path) -> PathBuf {
    job_dir.join("state.json")
}

/// The legacy record path for a job directory: `<dirname>.cfg` inside it.
fn legacy_record_path(job_dir: &Path) -> Option<PathBuf> {
    let name = job_dir.file_name()?;
    let mut file_name = name.to_owned();
    file_name.push(".cfg");
    Some(job_dir.join(file_name))
}

/// Create a new job state for an input file.
///
/// Captures the input path and size immediately; all done-flags start
/// false.
pub fn create_state(profile_name: &str, input_path: &Path, enabled: StageSet) -> JobState {
    let mut state = JobState {
        profile_name: profile_name.to_string(),
        enabled,
        ..JobState::default()
    };

    state.input.path = input_path.to_string_lossy().into_owned();
    if let Ok(metadata) = fs::metadata(input_path) {
        state.input.size = metadata.len();
    }

    state
}

/// Persist a job state record.
///
/// Stamps `updated`, serializes the full record, and swaps it into place
/// via a temporary file and rename so a crash mid-write never leaves a
/// half-written record behind.
pub fn save_state(job_dir: &Path, state: &mut JobState) -> Result<(), StateError> {
    state.updated = current_timestamp_ms();

    let json = serde_json::to_string_pretty(state)?;
    let path = state_path(job_dir);
    let tmp_path = job_dir.join("state.json.tmp");

    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load the job state for a directory.
///
/// Reads the canonical record; when it is absent, attempts migration from
/// the legacy text record and persists the migrated state as canonical
/// before returning it. Returns `None` when neither record exists.
pub fn load_state(job_dir: &Path) -> Result<Option<JobState>, StateError> {
    let path = state_path(job_dir);

    if !path.exists() {
        if let Some(legacy_path) = legacy_record_path(job_dir) {
            if legacy_path.exists() {
                let content = fs::read_to_string(&legacy_path)?;
                let mut state = parse_legacy_record(&content);
                tracing::info!(path = %legacy_path.display(), "migrated legacy state record");
                save_state(job_dir, &mut state)?;
                return Ok(Some(state));
            }
        }
        return Ok(None);
    }

    let content = fs::read_to_string(&path)?;
    let state: JobState = serde_json::from_str(&content)?;
    Ok(Some(state))
}

/// Parse a boolean the way the legacy records wrote them.
fn parse_legacy_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "on"
    )
}

/// Parse the legacy section-keyed text record into a job state.
///
/// The legacy system treated every stage as enabled unless the record said
/// otherwise, so that is the starting point here too.
pub fn parse_legacy_record(content: &str) -> JobState {
    let mut state = JobState {
        enabled: StageSet::all(),
        ..JobState::default()
    };

    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_ascii_uppercase();
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match section.as_str() {
            "SETTINGS" => match key.as_str() {
                "profile_name" | "profile_loaded" => {
                    if state.profile_name.is_empty() || key == "profile_name" {
                        state.profile_name = value.to_string();
                    }
                }
                "pass" => state.output.current_pass = value.parse().unwrap_or(0),
                "passes" => state.output.total_passes = value.parse().unwrap_or(2),
                _ => {}
            },
            "STEPS" | "DONE" => {
                let stage = match key.as_str() {
                    // The legacy system called the probe step "info"
                    "info" => Some(Stage::Probe),
                    "crop" => Some(Stage::Crop),
                    "scale" => Some(Stage::Scale),
                    "encode" => Some(Stage::Encode),
                    "mux" => Some(Stage::Mux),
                    "move" => Some(Stage::Move),
                    _ => None,
                };
                if let Some(stage) = stage {
                    let flag = parse_legacy_bool(value);
                    if section == "STEPS" {
                        state.enabled.set(stage, flag);
                    } else {
                        state.done.set(stage, flag);
                    }
                }
            }
            "INPUT" => match key.as_str() {
                "name" => state.input.path = value.to_string(),
                "size" => state.input.size = value.parse().unwrap_or(0),
                "length" => state.input.duration = value.parse().unwrap_or(0.0),
                "vcodec" => state.input.video_codec = value.to_string(),
                "width" => state.input.video_width = value.parse().unwrap_or(0),
                "height" => state.input.video_height = value.parse().unwrap_or(0),
                "fps" => state.input.video_fps = value.parse().unwrap_or(0.0),
                "acodec" => state.input.audio_codec = value.to_string(),
                "ac" => state.input.audio_channels = value.parse().unwrap_or(0),
                "abr" => state.input.audio_bitrate = value.parse().unwrap_or(0),
                _ => {}
            },
            "OUTPUT" => match key.as_str() {
                "type" => state.output.container = value.to_string(),
                "width" => state.output.video_width = value.parse().unwrap_or(0),
                "height" => state.output.video_height = value.parse().unwrap_or(0),
                "crop" => {
                    let parts: Vec<&str> = value.split(':').collect();
                    if parts.len() == 4 {
                        let parsed: Option<Vec<u32>> =
                            parts.iter().map(|p| p.trim().parse().ok()).collect();
                        if let Some(v) = parsed {
                            state.output.crop = Some(CropRect {
                                width: v[0],
                                height: v[1],
                                x: v[2],
                                y: v[3],
                            });
                        }
                    }
                }
                _ => {}
            },
            "VIDEO" => match key.as_str() {
                "codec" => state.output.video_codec = value.to_string(),
                "bitrate" => state.output.video_bitrate = value.parse().unwrap_or(0),
                _ => {}
            },
            "AUDIO" => match key.as_str() {
                "codec" => state.output.audio_codec = value.to_string(),
                "bitrate" => state.output.audio_bitrate = value.parse().unwrap_or(0),
                "channels" => state.output.audio_channels = value.parse().unwrap_or(0),
                _ => {}
            },
            _ => {}
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_set_get_set() {
        let mut set = StageSet::default();
        for stage in Stage::ALL {
            assert!(!set.get(stage));
            set.set(stage, true);
            assert!(set.get(stage));
        }
    }

    #[test]
    fn test_stage_set_move_serde_name() {
        let set = StageSet {
            relocate: true,
            ..StageSet::default()
        };
        let json = serde_json::to_string(&set).unwrap();
        assert!(json.contains("\"move\":true"));
        assert!(!json.contains("relocate"));
    }

    #[test]
    fn test_mark_done_touches_updated() {
        let mut state = JobState::default();
        let before = state.updated;
        std::thread::sleep(std::time::Duration::from_millis(5));

        state.mark_done(Stage::Probe);
        assert!(state.is_done(Stage::Probe));
        assert!(state.updated >= before);
    }

    #[test]
    fn test_create_state_captures_input() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("film.mkv");
        std::fs::write(&input, vec![0u8; 1234]).unwrap();

        let mut enabled = StageSet::all();
        enabled.crop = false;
        let state = create_state("tv", &input, enabled);

        assert_eq!(state.profile_name, "tv");
        assert_eq!(state.input.size, 1234);
        assert_eq!(state.input.path, input.to_string_lossy());
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.is_enabled(Stage::Probe));
        assert!(!state.is_enabled(Stage::Crop));
        for stage in Stage::ALL {
            assert!(!state.is_done(stage));
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let job_dir = temp_dir.path();

        let mut state = create_state("film", Path::new("/work/film.mkv/film.mkv"), StageSet::all());
        state.output.video_width = 1280;
        state.output.video_height = 534;
        state.output.video_bitrate = 4213;
        state.output.crop = Some(CropRect {
            width: 1920,
            height: 800,
            x: 0,
            y: 140,
        });
        state.output.current_pass = 1;
        state.mark_done(Stage::Probe);
        state.mark_done(Stage::Crop);

        save_state(job_dir, &mut state).unwrap();

        let loaded = load_state(job_dir).unwrap().expect("state should exist");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = JobState::default();

        save_state(temp_dir.path(), &mut state).unwrap();

        assert!(state_path(temp_dir.path()).exists());
        assert!(!temp_dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = JobState::default();
        save_state(temp_dir.path(), &mut state).unwrap();

        state.error = "encode failed".to_string();
        save_state(temp_dir.path(), &mut state).unwrap();

        let loaded = load_state(temp_dir.path()).unwrap().unwrap();
        assert_eq!(loaded.error, "encode failed");
    }

    #[test]
    fn test_load_state_none_when_absent() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_state(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_state_corrupt_record_is_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(state_path(temp_dir.path()), "{not json").unwrap();
        assert!(matches!(
            load_state(temp_dir.path()),
            Err(StateError::Parse(_))
        ));
    }

    const LEGACY_RECORD: &str = "\
[SETTINGS]
profile_loaded = dvd
pass = 1
passes = 2

[STEPS]
info = yes
crop = yes
scale = yes
encode = yes
mux = no
move = yes

[DONE]
info = yes
crop = yes
scale = no
encode = no

[INPUT]
name = film.mkv
size = 4700000000
length = 7123.5
vcodec = mpeg2video
width = 720
height = 576
fps = 25
acodec = ac3
ac = 6
abr = 448

[OUTPUT]
type = mp4
width = 720
height = 432
crop = 720:432:0:72

[VIDEO]
codec = libx264
bitrate = 1800

[AUDIO]
codec = aac
bitrate = 384
channels = 6
";

    #[test]
    fn test_parse_legacy_record() {
        let state = parse_legacy_record(LEGACY_RECORD);

        assert_eq!(state.profile_name, "dvd");
        assert_eq!(state.output.current_pass, 1);
        assert_eq!(state.output.total_passes, 2);

        assert!(state.is_enabled(Stage::Probe));
        assert!(!state.is_enabled(Stage::Mux));
        assert!(state.is_enabled(Stage::Move));

        assert!(state.is_done(Stage::Probe));
        assert!(state.is_done(Stage::Crop));
        assert!(!state.is_done(Stage::Encode));
        // Stages the record does not mention stay unfinished
        assert!(!state.is_done(Stage::Move));

        assert_eq!(state.input.path, "film.mkv");
        assert_eq!(state.input.size, 4_700_000_000);
        assert!((state.input.duration - 7123.5).abs() < 1e-9);
        assert_eq!(state.input.video_codec, "mpeg2video");
        assert_eq!(state.input.audio_channels, 6);
        assert_eq!(state.input.audio_bitrate, 448);

        assert_eq!(state.output.container, "mp4");
        assert_eq!(state.output.video_width, 720);
        assert_eq!(state.output.video_height, 432);
        assert_eq!(
            state.output.crop,
            Some(CropRect {
                width: 720,
                height: 432,
                x: 0,
                y: 72
            })
        );
        assert_eq!(state.output.video_codec, "libx264");
        assert_eq!(state.output.video_bitrate, 1800);
        assert_eq!(state.output.audio_codec, "aac");
    }

    #[test]
    fn test_parse_legacy_record_defaults_all_enabled() {
        let state = parse_legacy_record("[SETTINGS]\nprofile_name = tv\n");
        for stage in Stage::ALL {
            assert!(state.is_enabled(stage));
            assert!(!state.is_done(stage));
        }
        assert_eq!(state.profile_name, "tv");
    }

    #[test]
    fn test_parse_legacy_bool_forms() {
        for truthy in ["yes", "YES", "true", "True", "1", "on"] {
            assert!(parse_legacy_bool(truthy), "{} should be true", truthy);
        }
        for falsy in ["no", "false", "0", "off", "garbage"] {
            assert!(!parse_legacy_bool(falsy), "{} should be false", falsy);
        }
    }

    #[test]
    fn test_parse_legacy_sections_case_insensitive() {
        let state = parse_legacy_record("[settings]\nprofile_name = tv\n[done]\ninfo = yes\n");
        assert_eq!(state.profile_name, "tv");
        assert!(state.is_done(Stage::Probe));
    }

    #[test]
    fn test_load_state_migrates_legacy_record() {
        let temp_dir = TempDir::new().unwrap();
        let job_dir = temp_dir.path().join("film.mkv");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("film.mkv.cfg"), LEGACY_RECORD).unwrap();

        let state = load_state(&job_dir).unwrap().expect("migrated state");
        assert_eq!(state.profile_name, "dvd");
        assert!(state.is_done(Stage::Crop));

        // The migrated record is now canonical...
        assert!(state_path(&job_dir).exists());
        // ...and the legacy record is left in place, merely superseded.
        assert!(job_dir.join("film.mkv.cfg").exists());

        // A second load reads the canonical record directly.
        let again = load_state(&job_dir).unwrap().unwrap();
        assert_eq!(again, state);
    }

    #[test]
    fn test_canonical_record_wins_over_legacy() {
        let temp_dir = TempDir::new().unwrap();
        let job_dir = temp_dir.path().join("film.mkv");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("film.mkv.cfg"), LEGACY_RECORD).unwrap();

        let mut canonical = JobState {
            profile_name: "newer".to_string(),
            ..JobState::default()
        };
        save_state(&job_dir, &mut canonical).unwrap();

        let loaded = load_state(&job_dir).unwrap().unwrap();
        assert_eq!(loaded.profile_name, "newer");
    }

    fn stage_set_strategy() -> impl Strategy<Value = StageSet> {
        (
            proptest::bool::ANY,
            proptest::bool::ANY,
            proptest::bool::ANY,
            proptest::bool::ANY,
            proptest::bool::ANY,
            proptest::bool::ANY,
        )
            .prop_map(|(probe, crop, scale, encode, mux, relocate)| StageSet {
                probe,
                crop,
                scale,
                encode,
                mux,
                relocate,
            })
    }

    fn job_state_strategy() -> impl Strategy<Value = JobState> {
        (
            "[a-z0-9_]{1,20}",
            0i64..2_000_000_000_000i64,
            stage_set_strategy(),
            stage_set_strategy(),
            (0u32..4000, 0u32..3000, 0u32..50_000),
            proptest::option::of((0u32..4000u32, 0u32..3000u32, 0u32..200u32, 0u32..200u32)),
            0u32..3,
            "[a-zA-Z0-9 ]{0,40}",
        )
            .prop_map(
                |(profile, created, enabled, done, (width, height, bitrate), crop, pass, error)| {
                    let mut state = JobState {
                        profile_name: profile,
                        created,
                        updated: created,
                        enabled,
                        done,
                        error,
                        ..JobState::default()
                    };
                    state.output.video_width = width;
                    state.output.video_height = height;
                    state.output.video_bitrate = bitrate;
                    state.output.crop = crop.map(|(w, h, x, y)| CropRect {
                        width: w,
                        height: h,
                        x,
                        y,
                    });
                    state.output.current_pass = pass;
                    state
                },
            )
    }

    // *For any* job state, the persisted record round-trips losslessly
    // through save and load (modulo the `updated` stamp save applies).
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_state_round_trip(state in job_state_strategy()) {
            let temp_dir = TempDir::new().unwrap();
            let mut saved = state.clone();
            save_state(temp_dir.path(), &mut saved).unwrap();

            let loaded = load_state(temp_dir.path()).unwrap().unwrap();
            prop_assert_eq!(loaded, saved);
        }
    }
}
