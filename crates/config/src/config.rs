//! Core application configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration is structurally valid but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Directory tree configuration.
///
/// All paths except `base` may be relative; `resolve` anchors them under
/// `base`. The five working directories form the job lifecycle: files enter
/// through `input`, are processed inside `work`, and their job directories
/// end up in `done` or `error` while the finished artifact lands in `out`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirsConfig {
    /// Base directory everything else resolves against. Required.
    pub base: Option<PathBuf>,
    /// Incoming files to process.
    #[serde(default = "default_input_dir", rename = "in")]
    pub input: PathBuf,
    /// Finished output artifacts.
    #[serde(default = "default_out_dir")]
    pub out: PathBuf,
    /// In-progress job directories.
    #[serde(default = "default_work_dir")]
    pub work: PathBuf,
    /// Job directories that completed successfully.
    #[serde(default = "default_done_dir")]
    pub done: PathBuf,
    /// Job directories that failed.
    #[serde(default = "default_error_dir")]
    pub error: PathBuf,
    /// Scratch space.
    #[serde(default = "default_temp_dir")]
    pub temp: PathBuf,
    /// Encoding profile files.
    #[serde(default = "default_profiles_dir")]
    pub profiles: PathBuf,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("in")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_done_dir() -> PathBuf {
    PathBuf::from("done")
}

fn default_error_dir() -> PathBuf {
    PathBuf::from("error")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("profiles")
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            base: None,
            input: default_input_dir(),
            out: default_out_dir(),
            work: default_work_dir(),
            done: default_done_dir(),
            error: default_error_dir(),
            temp: default_temp_dir(),
            profiles: default_profiles_dir(),
        }
    }
}

impl DirsConfig {
    /// Resolve relative directories against the base directory.
    ///
    /// Fails when `base` is unset: every deployment must pick its tree root
    /// explicitly.
    pub fn resolve(&mut self) -> Result<(), ConfigError> {
        let base = self
            .base
            .clone()
            .ok_or_else(|| ConfigError::Invalid("dirs.base must be set".to_string()))?;

        for dir in [
            &mut self.input,
            &mut self.out,
            &mut self.work,
            &mut self.done,
            &mut self.error,
            &mut self.temp,
            &mut self.profiles,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(())
    }
}

/// External tool paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Path to the ffmpeg executable.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// Path to the ffprobe executable.
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Default encoding settings applied when a profile leaves them open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    /// Profile used for files with no profile queue.
    #[serde(default = "default_profile_name")]
    pub profile: String,
    /// Output container when the profile does not choose one.
    #[serde(default = "default_container")]
    pub container: String,
    /// Preferred audio language (ISO 639 code) for stream selection.
    #[serde(default = "default_audio_language")]
    pub audio_language: String,
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_audio_language() -> String {
    "eng".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            container: default_container(),
            audio_language: default_audio_language(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl Config {
    /// Load configuration from a TOML file and resolve directories.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse_toml(&content)?;
        config.dirs.resolve()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without resolving directories.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
