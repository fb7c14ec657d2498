//! The staged pipeline executor.
//!
//! Drives one job through Probe -> CropDetect -> Calculate -> Encode ->
//! Finalize -> Relocate. Stages gated by their enabled/done flags persist
//! state after every transition, so a worker can die at any point and a
//! later claim resumes from the last durable step. Calculate is the
//! exception: it always re-runs, because it is cheap and must reflect any
//! tier override applied to the profile after probing.

use crate::calc::{calculate_for_profile, CalcError};
use crate::crop::{
    detect_crop, CropError, CropMeasurer, CropRect, DEFAULT_SAMPLES, DEFAULT_WINDOW_SECS,
};
use crate::encode::{build_encode_plan, EncodeError, EncodePlan, Encoder};
use crate::probe::{ProbeError, Prober};
use crate::state::{save_state, JobState, Stage, StateError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use transize_config::{apply_tier, select_tier, Config, Profile};

/// Error type for pipeline execution.
///
/// Lock contention is deliberately absent: failing to claim a job is a
/// routine "try the next one" signal handled by the scanner, not a
/// pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Probing the source failed.
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// Crop detection failed.
    #[error("crop detection failed: {0}")]
    CropDetect(#[from] CropError),

    /// Sizing calculation failed (e.g. no video stream).
    #[error("calculation failed: {0}")]
    Calculation(#[from] CalcError),

    /// An encode pass failed.
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// Installing the final artifact inside the job directory failed.
    #[error("finalize failed: {0}")]
    Finalize(std::io::Error),

    /// Moving the final artifact to the output directory failed.
    #[error("relocate failed: {0}")]
    Relocate(std::io::Error),

    /// Persisting job state failed.
    #[error("state persistence failed: {0}")]
    State(#[from] StateError),
}

/// The pipeline executor, wired to its three collaborators.
pub struct Pipeline<'a> {
    pub prober: &'a dyn Prober,
    pub crop_measurer: &'a dyn CropMeasurer,
    pub encoder: &'a dyn Encoder,
    pub config: &'a Config,
}

impl Pipeline<'_> {
    /// Run all stages for one job.
    ///
    /// On failure the error message is recorded in the state record and
    /// persisted before the error is returned; the caller decides the
    /// job directory's fate.
    pub fn run(
        &self,
        input_path: &Path,
        job_dir: &Path,
        profile: &Profile,
        state: &mut JobState,
        dry_run: bool,
    ) -> Result<(), PipelineError> {
        match self.run_stages(input_path, job_dir, profile, state, dry_run) {
            Ok(()) => {
                tracing::info!(input = %input_path.display(), "processing complete");
                Ok(())
            }
            Err(err) => {
                tracing::error!(input = %input_path.display(), error = %err, "stage failed");
                state.error = err.to_string();
                if let Err(save_err) = save_state(job_dir, state) {
                    tracing::error!(error = %save_err, "failed to persist error state");
                }
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        input_path: &Path,
        job_dir: &Path,
        profile: &Profile,
        state: &mut JobState,
        dry_run: bool,
    ) -> Result<(), PipelineError> {
        // Probe: the source is always physically re-probed; the done flag
        // only marks whether the snapshot was recorded.
        tracing::info!(input = %input_path.display(), "probing");
        let info = self.prober.probe(input_path)?;

        if state.is_enabled(Stage::Probe) && !state.is_done(Stage::Probe) {
            state.input.format = info.format.clone();
            state.input.duration = info.duration_secs;

            if let Some(video) = info.primary_video() {
                state.input.video_codec = video.codec.clone();
                state.input.video_width = video.width;
                state.input.video_height = video.height;
                state.input.video_fps = video.fps;
            }
            if let Some(audio) = info.primary_audio() {
                state.input.audio_codec = audio.codec.clone();
                state.input.audio_channels = audio.channels;
                state.input.audio_bitrate =
                    audio.bitrate.map(|b| (b / 1000) as u32).unwrap_or(0);
            }

            state.mark_done(Stage::Probe);
            save_state(job_dir, state)?;
        }

        // Resolution tier override, applied to a working copy of the
        // profile before any sizing happens.
        let mut profile = profile.clone();
        if let Some(video) = info.primary_video() {
            if !profile.tiers.is_empty() {
                let pixels = video.width as u64 * video.height as u64;
                if let Some(tier) = select_tier(&profile, pixels).cloned() {
                    tracing::info!(tier = %tier.name, pixels, "applying resolution tier");
                    apply_tier(&mut profile, &tier);
                }
            }
        }

        // Crop detection
        let mut crop: Option<CropRect> = None;
        if state.is_enabled(Stage::Crop) && !state.is_done(Stage::Crop) {
            tracing::info!(input = %input_path.display(), "detecting crop");
            crop = detect_crop(
                self.crop_measurer,
                input_path,
                info.duration_secs,
                DEFAULT_SAMPLES,
                DEFAULT_WINDOW_SECS,
            )?;
            match &crop {
                Some(rect) => tracing::info!(crop = %rect, "crop detected"),
                None => tracing::info!("no crop needed"),
            }
            state.output.crop = crop;
            state.mark_done(Stage::Crop);
            save_state(job_dir, state)?;
        } else if state.output.crop.is_some() {
            crop = state.output.crop;
        }

        // Sizing: always recalculated
        let (scale, bitrate) = calculate_for_profile(&info, &profile, crop.as_ref())?;
        let container = profile
            .container
            .clone()
            .unwrap_or_else(|| self.config.defaults.container.clone());

        state.output.video_width = scale.width;
        state.output.video_height = scale.height;
        state.output.video_bitrate = bitrate.video_kbps;
        state.output.video_crf = profile.video.crf;
        state.output.video_codec = profile.video.codec.clone();
        state.output.audio_bitrate = bitrate.audio_kbps;
        state.output.audio_channels = profile.audio.channels;
        state.output.audio_codec = profile.audio.codec.clone();
        state.output.container = container.clone();
        save_state(job_dir, state)?;

        tracing::info!(
            width = scale.width,
            height = scale.height,
            video_kbps = bitrate.video_kbps,
            bpp = bitrate.bpp,
            "calculated output plan"
        );

        let temp_output = job_dir.join(format!("temp_output.{}", container));

        // Encode
        if state.is_enabled(Stage::Encode) && !state.is_done(Stage::Encode) {
            let external_srt = external_subtitle_path(input_path, job_dir);

            let plan = build_encode_plan(
                input_path,
                &temp_output,
                &info,
                &profile,
                &scale,
                &bitrate,
                crop.as_ref(),
                &self.config.defaults.audio_language,
                external_srt.as_deref(),
                &container,
                &job_dir.join("ffmpeg2pass"),
            );

            self.run_encode(&plan, job_dir, state, dry_run)?;

            state.mark_done(Stage::Encode);
            save_state(job_dir, state)?;
        }

        // Finalize: install the temp artifact under its final name
        let final_name = format!(
            "{}.{}",
            input_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            container
        );
        let final_output = job_dir.join(&final_name);

        if state.is_enabled(Stage::Mux) && !state.is_done(Stage::Mux) {
            if temp_output.exists() {
                if !dry_run {
                    // Nothing is ever deleted here. An occupant of the
                    // final name is preserved once as <name>.source; if
                    // that backup already exists the occupant is a stale
                    // artifact from an interrupted run and is overwritten.
                    if final_output.exists() {
                        let preserved = job_dir.join(format!("{}.source", final_name));
                        if !preserved.exists() {
                            fs::rename(&final_output, &preserved)
                                .map_err(PipelineError::Finalize)?;
                            tracing::info!(preserved = %preserved.display(), "preserved existing file");
                        }
                    }
                    fs::rename(&temp_output, &final_output).map_err(PipelineError::Finalize)?;
                }
                tracing::info!(output = %final_output.display(), "finalized output");
            }

            state.output.path = final_output.to_string_lossy().into_owned();
            state.mark_done(Stage::Mux);
            save_state(job_dir, state)?;
        }

        // Relocate: move the artifact to the output tree
        if state.is_enabled(Stage::Move) && !state.is_done(Stage::Move) {
            if final_output.exists() {
                let dest = self.config.dirs.out.join(&final_name);
                tracing::info!(dest = %dest.display(), "moving to output");

                if !dry_run {
                    fs::create_dir_all(&self.config.dirs.out).map_err(PipelineError::Relocate)?;

                    // An existing destination is set aside, never deleted
                    if dest.exists() {
                        let backup = self.config.dirs.out.join(format!("{}.old", final_name));
                        fs::rename(&dest, &backup).map_err(PipelineError::Relocate)?;
                        tracing::info!(backup = %backup.display(), "existing output set aside");
                    }

                    move_file(&final_output, &dest).map_err(PipelineError::Relocate)?;
                }

                state.output.path = dest.to_string_lossy().into_owned();
                state.mark_done(Stage::Move);
                save_state(job_dir, state)?;
            }
        }

        Ok(())
    }

    /// Run the encode passes with durable pass bookkeeping.
    ///
    /// `current_pass` is persisted before each pass starts. A resumed run
    /// restarts at the persisted value, fully redoing the last attempted
    /// pass: an interrupted pass leaves artifacts that cannot be trusted,
    /// so redoing it is the only safe option.
    fn run_encode(
        &self,
        plan: &EncodePlan,
        job_dir: &Path,
        state: &mut JobState,
        dry_run: bool,
    ) -> Result<(), PipelineError> {
        if plan.passes == 1 {
            state.output.total_passes = 1;
            state.output.current_pass = 1;
            save_state(job_dir, state)?;

            tracing::info!(input = %plan.input_path.display(), "encoding (single pass)");
            if dry_run {
                tracing::info!("dry run: skipping encode");
                return Ok(());
            }

            let log_path = job_dir.join("pass1.log");
            self.encoder.run_pass(plan, 0, &log_path)?;
            return Ok(());
        }

        state.output.total_passes = plan.passes;
        save_state(job_dir, state)?;

        let start_pass = if state.output.current_pass > 0 {
            state.output.current_pass
        } else {
            1
        };

        for pass_num in start_pass..=plan.passes {
            state.output.current_pass = pass_num;
            save_state(job_dir, state)?;

            tracing::info!(
                pass = pass_num,
                passes = plan.passes,
                input = %plan.input_path.display(),
                "encoding pass"
            );
            if dry_run {
                tracing::info!(pass = pass_num, "dry run: skipping pass");
                continue;
            }

            let log_path = job_dir.join(format!("pass{}.log", pass_num));
            self.encoder.run_pass(plan, pass_num, &log_path)?;
        }

        Ok(())
    }
}

/// A sibling `.srt` file for the input, if one was staged into the job
/// directory.
fn external_subtitle_path(input_path: &Path, job_dir: &Path) -> Option<PathBuf> {
    let stem = input_path.file_stem()?;
    let mut name = stem.to_owned();
    name.push(".srt");
    let candidate = job_dir.join(name);
    candidate.exists().then_some(candidate)
}

/// Move a file, falling back to copy-and-remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}
