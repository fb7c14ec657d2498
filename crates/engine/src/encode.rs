//! Encode planning and the one-pass encoder collaborator.
//!
//! The pipeline turns probe metadata, profile settings, and sizing results
//! into an [`EncodePlan`], then drives the [`Encoder`] collaborator one
//! pass at a time so pass progress can be persisted between passes. The
//! ffmpeg-backed implementation captures each pass's output into a log
//! file inside the job directory.

use crate::calc::{BitrateResult, ScaleResult};
use crate::crop::CropRect;
use crate::filters::{build_video_filters, FilterChain, VideoFilterOptions};
use crate::probe::MediaInfo;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use transize_config::Profile;

/// Error type for encoding operations.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// An encoder pass exited non-zero.
    #[error("encode pass {pass} failed: {detail}")]
    PassFailed { pass: u32, detail: String },

    /// The encoder process was terminated by a signal.
    #[error("encode pass {pass} terminated by signal")]
    PassTerminated { pass: u32 },

    /// IO error during encoding.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The single output audio track.
///
/// Channel layout follows the source: 5.1 and wider sources keep 5.1 at the
/// profile bitrate, narrower sources get stereo at 128k.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrack {
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// Everything one encode needs, fully resolved.
#[derive(Debug, Clone)]
pub struct EncodePlan {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    /// Target video bitrate in kbps; `None` in CRF or copy mode.
    pub video_bitrate: Option<u32>,
    pub crf: Option<u32>,
    pub filters: FilterChain,
    /// 1 for single-pass, 2 for analysis + final.
    pub passes: u32,
    pub container: String,
    /// Container stream index of the selected audio source.
    pub audio_stream_index: Option<usize>,
    pub audio_track: Option<AudioTrack>,
    /// Title metadata written to the output.
    pub title: Option<String>,
    /// Prefix for the encoder's pass statistics files.
    pub pass_log_prefix: PathBuf,
}

/// Build an encode plan from the profile and the sizing results.
///
/// Pass-count rule: stream copy and CRF mode are single-pass; a concrete
/// bitrate target gets the two-pass treatment; a zero bitrate (nothing to
/// target) stays single-pass.
///
/// Subtitle burn-in source priority: an external `.srt` next to the input
/// wins over an embedded forced track.
#[allow(clippy::too_many_arguments)]
pub fn build_encode_plan(
    input_path: &Path,
    output_path: &Path,
    info: &MediaInfo,
    profile: &Profile,
    scale: &ScaleResult,
    bitrate: &BitrateResult,
    crop: Option<&CropRect>,
    audio_language: &str,
    external_subtitle: Option<&Path>,
    container: &str,
    pass_log_prefix: &Path,
) -> EncodePlan {
    let mut subtitle_path: Option<String> = None;
    let mut subtitle_stream_index: Option<usize> = None;

    if profile.processing.subtitles {
        if let Some(srt) = external_subtitle {
            subtitle_path = Some(srt.to_string_lossy().into_owned());
            tracing::info!(subtitle = %srt.display(), "using external subtitle");
        } else if let Some(forced) = info.forced_subtitle() {
            subtitle_path = Some(input_path.to_string_lossy().into_owned());
            subtitle_stream_index = Some(forced.index);
            tracing::info!(
                track = forced.index,
                codec = %forced.codec,
                "burning in forced subtitle track"
            );
        }
    }

    let filters = build_video_filters(&VideoFilterOptions {
        crop,
        scale: if scale.scaled {
            Some((scale.width, scale.height))
        } else {
            None
        },
        deinterlace: profile.processing.deinterlace,
        denoise: profile.processing.denoise,
        subtitle_path: subtitle_path.as_deref(),
        subtitle_stream_index,
    });

    let selected_audio = info.audio_by_language(audio_language);
    let audio_stream_index = selected_audio.map(|s| s.index);
    let audio_track = selected_audio.map(|s| {
        if s.channels >= 6 {
            AudioTrack {
                channels: 6,
                bitrate_kbps: profile.audio.bitrate,
            }
        } else {
            AudioTrack {
                channels: 2,
                bitrate_kbps: 128,
            }
        }
    });

    let passes = if profile.video.codec == "copy" {
        1
    } else if profile.video.crf.is_some() {
        1
    } else if bitrate.video_kbps > 0 {
        2
    } else {
        1
    };

    let title = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());

    EncodePlan {
        input_path: input_path.to_path_buf(),
        output_path: output_path.to_path_buf(),
        video_codec: profile.video.codec.clone(),
        audio_codec: profile.audio.codec.clone(),
        video_bitrate: if bitrate.video_kbps > 0 {
            Some(bitrate.video_kbps)
        } else {
            None
        },
        crf: profile.video.crf,
        filters,
        passes,
        container: container.to_string(),
        audio_stream_index,
        audio_track,
        title,
        pass_log_prefix: pass_log_prefix.to_path_buf(),
    }
}

/// Build the ffmpeg argv for one pass.
///
/// `pass_num` 0 runs a single pass; 1 and 2 are the legs of a two-pass
/// encode (pass 1 writes its statistics and discards the video output).
pub fn build_ffmpeg_command(plan: &EncodePlan, pass_num: u32, ffmpeg: &str) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y");

    cmd.arg("-i").arg(&plan.input_path);

    // Constant frame rate avoids a pass 1/2 frame count mismatch
    cmd.args(["-vsync", "cfr"]);

    cmd.args(["-map", "0:v:0"]);

    // The analysis pass carries no audio
    if pass_num != 1 && plan.audio_track.is_some() {
        let audio_src = match plan.audio_stream_index {
            Some(index) => format!("0:{}", index),
            None => "0:a:0".to_string(),
        };
        cmd.arg("-map").arg(audio_src);
    }

    if plan.video_codec == "copy" {
        cmd.args(["-c:v", "copy"]);
    } else {
        cmd.arg("-c:v").arg(&plan.video_codec);

        // 8-bit output for broad player compatibility
        cmd.args(["-pix_fmt", "yuv420p"]);

        // hvc1 tag for HEVC, required by QuickTime
        if plan.video_codec == "libx265" {
            cmd.args(["-tag:v", "hvc1"]);
        }

        if !plan.filters.is_empty() {
            cmd.arg("-vf").arg(plan.filters.build());
        }

        if let Some(crf) = plan.crf {
            cmd.arg("-crf").arg(crf.to_string());
        } else if let Some(bitrate) = plan.video_bitrate {
            cmd.arg("-b:v").arg(format!("{}k", bitrate));
        }

        if pass_num > 0 {
            cmd.arg("-pass").arg(pass_num.to_string());
            cmd.arg("-passlogfile").arg(&plan.pass_log_prefix);

            if pass_num == 1 {
                cmd.args(["-f", "null"]);
            }
        }
    }

    if pass_num != 1 {
        if let Some(track) = &plan.audio_track {
            cmd.arg("-c:a").arg(&plan.audio_codec);
            cmd.arg("-ac").arg(track.channels.to_string());
            cmd.arg("-b:a").arg(format!("{}k", track.bitrate_kbps));

            // QuickTime needs the standard 5.1 layout spelled out
            if track.channels == 6 {
                cmd.args(["-af", "channelmap=channel_layout=5.1"]);
            }

            if plan.container == "mp4" {
                cmd.args(["-movflags", "+faststart"]);
            }
        }

        if let Some(title) = &plan.title {
            cmd.arg("-metadata").arg(format!("title={}", title));
        }
    }

    if pass_num == 1 {
        cmd.arg("-");
    } else {
        cmd.arg(&plan.output_path);
    }

    cmd
}

/// Render a command as a loggable line.
fn command_line(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Collaborator contract: run one encode pass, capturing output to a log.
pub trait Encoder {
    fn run_pass(&self, plan: &EncodePlan, pass_num: u32, log_path: &Path)
        -> Result<(), EncodeError>;
}

/// ffmpeg-backed [`Encoder`].
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: String,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Last lines of a pass log, for error reporting.
fn log_tail(log_path: &Path, max_lines: usize) -> String {
    let Ok(mut file) = File::open(log_path) else {
        return String::new();
    };
    // Pass logs can be large; only the end matters for diagnostics.
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let window: u64 = 16 * 1024;
    if len > window {
        let _ = file.seek(SeekFrom::End(-(window as i64)));
    }
    let mut content = String::new();
    let _ = file.read_to_string(&mut content);

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

impl Encoder for FfmpegEncoder {
    fn run_pass(
        &self,
        plan: &EncodePlan,
        pass_num: u32,
        log_path: &Path,
    ) -> Result<(), EncodeError> {
        let mut cmd = build_ffmpeg_command(plan, pass_num, &self.ffmpeg);

        let mut log_file = File::create(log_path)?;
        writeln!(log_file, "Command: {}\n", command_line(&cmd))?;

        let stdout_log = log_file.try_clone()?;
        let stderr_log = log_file.try_clone()?;
        let status = cmd.stdout(stdout_log).stderr(stderr_log).status()?;

        if status.success() {
            return Ok(());
        }

        let detail = log_tail(log_path, 20);
        match status.code() {
            Some(_) => Err(EncodeError::PassFailed {
                pass: pass_num,
                detail,
            }),
            None => Err(EncodeError::PassTerminated { pass: pass_num }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::parse_ffprobe_output;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing.
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value.
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn sample_info() -> MediaInfo {
        parse_ffprobe_output(
            r#"{
                "streams": [
                    {
                        "index": 0,
                        "codec_type": "video",
                        "codec_name": "h264",
                        "width": 1920,
                        "height": 1080,
                        "r_frame_rate": "24/1"
                    },
                    {
                        "index": 1,
                        "codec_type": "audio",
                        "codec_name": "dts",
                        "channels": 6,
                        "sample_rate": "48000",
                        "tags": { "language": "eng" }
                    }
                ],
                "format": {
                    "format_name": "matroska",
                    "duration": "3600",
                    "size": "4000000000",
                    "bit_rate": "8000000"
                }
            }"#,
        )
        .unwrap()
    }

    fn bitrate_result(video_kbps: u32) -> BitrateResult {
        BitrateResult {
            video_kbps,
            audio_kbps: 384,
            total_kbps: video_kbps + 384,
            bpp: 0.1,
        }
    }

    fn unscaled(width: u32, height: u32) -> ScaleResult {
        ScaleResult {
            width,
            height,
            scaled: false,
        }
    }

    fn make_plan(video_kbps: u32, profile: &Profile) -> EncodePlan {
        build_encode_plan(
            Path::new("/work/film.mkv/film.mkv"),
            Path::new("/work/film.mkv/temp_output.mp4"),
            &sample_info(),
            profile,
            &unscaled(1920, 1080),
            &bitrate_result(video_kbps),
            None,
            "eng",
            None,
            "mp4",
            Path::new("/work/film.mkv/ffmpeg2pass"),
        )
    }

    #[test]
    fn test_plan_two_pass_for_bitrate_target() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);
        assert_eq!(plan.passes, 2);
        assert_eq!(plan.video_bitrate, Some(4000));
    }

    #[test]
    fn test_plan_single_pass_for_crf() {
        let mut profile = Profile::default();
        profile.video.crf = Some(22);
        let plan = make_plan(0, &profile);
        assert_eq!(plan.passes, 1);
        assert_eq!(plan.crf, Some(22));
        assert_eq!(plan.video_bitrate, None);
    }

    #[test]
    fn test_plan_single_pass_for_copy() {
        let mut profile = Profile::default();
        profile.video.codec = "copy".to_string();
        let plan = make_plan(4000, &profile);
        assert_eq!(plan.passes, 1);
    }

    #[test]
    fn test_plan_single_pass_for_zero_bitrate() {
        let profile = Profile::default();
        let plan = make_plan(0, &profile);
        assert_eq!(plan.passes, 1);
    }

    #[test]
    fn test_plan_surround_audio_track() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);
        assert_eq!(
            plan.audio_track,
            Some(AudioTrack {
                channels: 6,
                bitrate_kbps: 384
            })
        );
        assert_eq!(plan.audio_stream_index, Some(1));
    }

    #[test]
    fn test_plan_stereo_source_gets_stereo_track() {
        let mut info = sample_info();
        info.audio[0].channels = 2;

        let profile = Profile::default();
        let plan = build_encode_plan(
            Path::new("/work/film.mkv/film.mkv"),
            Path::new("/work/film.mkv/temp_output.mp4"),
            &info,
            &profile,
            &unscaled(1920, 1080),
            &bitrate_result(4000),
            None,
            "eng",
            None,
            "mp4",
            Path::new("/work/film.mkv/ffmpeg2pass"),
        );
        assert_eq!(
            plan.audio_track,
            Some(AudioTrack {
                channels: 2,
                bitrate_kbps: 128
            })
        );
    }

    #[test]
    fn test_plan_external_subtitle_beats_embedded() {
        let mut info = sample_info();
        info.subtitles.push(crate::probe::SubtitleStream {
            index: 0,
            codec: "subrip".to_string(),
            language: "eng".to_string(),
            forced: true,
        });

        let profile = Profile::default();
        let plan = build_encode_plan(
            Path::new("/work/film.mkv/film.mkv"),
            Path::new("/work/film.mkv/temp_output.mp4"),
            &info,
            &profile,
            &unscaled(1920, 1080),
            &bitrate_result(4000),
            None,
            "eng",
            Some(Path::new("/work/film.mkv/film.srt")),
            "mp4",
            Path::new("/work/film.mkv/ffmpeg2pass"),
        );

        let vf = plan.filters.build();
        assert!(vf.contains("film.srt"));
        assert!(!vf.contains("si="));
    }

    #[test]
    fn test_plan_title_from_input_stem() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);
        assert_eq!(plan.title.as_deref(), Some("film"));
    }

    #[test]
    fn test_single_pass_command() {
        let mut profile = Profile::default();
        profile.video.crf = Some(22);
        let plan = make_plan(0, &profile);

        let cmd = build_ffmpeg_command(&plan, 0, "ffmpeg");
        let args = get_command_args(&cmd);

        assert!(has_flag(&args, "-y"));
        assert!(has_flag_with_value(&args, "-map", "0:v:0"));
        assert!(has_flag_with_value(&args, "-map", "0:1"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-crf", "22"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert!(has_flag_with_value(&args, "-ac", "6"));
        assert!(has_flag_with_value(&args, "-b:a", "384k"));
        assert!(has_flag_with_value(&args, "-af", "channelmap=channel_layout=5.1"));
        assert!(has_flag_with_value(&args, "-movflags", "+faststart"));
        assert!(!has_flag(&args, "-pass"));
        assert_eq!(args.last().unwrap(), "/work/film.mkv/temp_output.mp4");
    }

    #[test]
    fn test_first_pass_command_discards_output() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);

        let cmd = build_ffmpeg_command(&plan, 1, "ffmpeg");
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-pass", "1"));
        assert!(has_flag_with_value(&args, "-passlogfile", "/work/film.mkv/ffmpeg2pass"));
        assert!(has_flag_with_value(&args, "-f", "null"));
        assert_eq!(args.last().unwrap(), "-");

        // No audio on the analysis pass
        assert!(!has_flag(&args, "-c:a"));
        assert!(!has_flag_with_value(&args, "-map", "0:1"));
        assert!(!has_flag(&args, "-metadata"));
    }

    #[test]
    fn test_second_pass_command_writes_output() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);

        let cmd = build_ffmpeg_command(&plan, 2, "ffmpeg");
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-pass", "2"));
        assert!(has_flag_with_value(&args, "-b:v", "4000k"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert_eq!(args.last().unwrap(), "/work/film.mkv/temp_output.mp4");
    }

    #[test]
    fn test_copy_codec_skips_encoding_flags() {
        let mut profile = Profile::default();
        profile.video.codec = "copy".to_string();
        let plan = make_plan(4000, &profile);

        let cmd = build_ffmpeg_command(&plan, 0, "ffmpeg");
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-c:v", "copy"));
        assert!(!has_flag(&args, "-pix_fmt"));
        assert!(!has_flag(&args, "-vf"));
        assert!(!has_flag(&args, "-b:v"));
    }

    #[test]
    fn test_hevc_gets_hvc1_tag() {
        let mut profile = Profile::default();
        profile.video.codec = "libx265".to_string();
        let plan = make_plan(4000, &profile);

        let cmd = build_ffmpeg_command(&plan, 2, "ffmpeg");
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-tag:v", "hvc1"));
    }

    #[test]
    fn test_title_metadata() {
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);

        let cmd = build_ffmpeg_command(&plan, 2, "ffmpeg");
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-metadata", "title=film"));
    }

    // *For any* bitrate and pass number, the built command always maps the
    // primary video stream, pins the frame rate mode, and routes the
    // output to the right sink for the pass.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_shape(
            video_kbps in 100u32..50_000,
            pass_num in 0u32..3,
        ) {
            let profile = Profile::default();
            let plan = make_plan(video_kbps, &profile);
            let cmd = build_ffmpeg_command(&plan, pass_num, "ffmpeg");
            let args = get_command_args(&cmd);

            prop_assert!(has_flag(&args, "-y"));
            prop_assert!(has_flag_with_value(&args, "-vsync", "cfr"));
            prop_assert!(has_flag_with_value(&args, "-map", "0:v:0"));
            let expected_bv = format!("{}k", video_kbps);
            prop_assert!(has_flag_with_value(&args, "-b:v", &expected_bv));

            if pass_num == 1 {
                prop_assert_eq!(args.last().unwrap(), "-");
            } else {
                prop_assert_eq!(args.last().unwrap(), "/work/film.mkv/temp_output.mp4");
            }
        }
    }

    #[test]
    fn test_run_pass_failure_captures_log_tail() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("pass1.log");

        // `false` exits 1 without reading its arguments
        let encoder = FfmpegEncoder::new("false");
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);

        let result = encoder.run_pass(&plan, 1, &log_path);
        assert!(matches!(result, Err(EncodeError::PassFailed { pass: 1, .. })));
        assert!(log_path.exists());

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.starts_with("Command: false"));
    }

    #[test]
    fn test_run_pass_success() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("pass0.log");

        // `true` exits 0 regardless of arguments
        let encoder = FfmpegEncoder::new("true");
        let profile = Profile::default();
        let plan = make_plan(4000, &profile);

        assert!(encoder.run_pass(&plan, 0, &log_path).is_ok());
    }
}
