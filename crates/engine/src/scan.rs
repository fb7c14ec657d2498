//! Batch discovery and the one-job-per-invocation driver.
//!
//! Each invocation handles at most one job and exits, which lets any
//! number of workers run the scanner concurrently against the same tree:
//! the claim lock is the only coordination. Resumable jobs already in the
//! work tree take priority over fresh input files, so an interrupted job
//! is never starved by new arrivals.

use crate::claim;
use crate::crop::FfmpegCropMeasurer;
use crate::encode::FfmpegEncoder;
use crate::fname::normalize_filename;
use crate::pipeline::Pipeline;
use crate::probe::FfprobeProber;
use crate::state::{create_state, load_state, save_state, StageSet};
use std::fs;
use std::path::{Path, PathBuf};
use transize_config::{load_profile, profile_exists, Config};
use walkdir::WalkDir;

/// Video file extensions accepted by the scanner (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".m4v", ".mov", ".wmv", ".flv", ".webm", ".mpeg", ".mpg",
];

/// Check whether a path has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Outcome of one claim-and-process attempt.
enum JobOutcome {
    /// The job ran to completion.
    Processed,
    /// The job ran and failed.
    Failed,
    /// Another worker holds the claim; try the next job.
    Locked,
}

/// Find resumable job directories in the work tree.
///
/// A job directory is resumable when it still contains its source file:
/// the file whose name equals the directory name (the source is moved in
/// under the normalized name and never renamed while work is pending).
pub fn find_work_jobs(work_dir: &Path) -> Vec<PathBuf> {
    let mut jobs = Vec::new();

    let Ok(entries) = fs::read_dir(work_dir) else {
        return jobs;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.join(name).is_file() {
            jobs.push(path);
        }
    }

    jobs.sort();
    jobs
}

/// Find new input files: loose video files in the input directory plus
/// files one level down in subdirectories that name an existing profile
/// (profile queues).
pub fn find_input_files(config: &Config) -> Vec<PathBuf> {
    let input_dir = &config.dirs.input;
    let mut files = Vec::new();

    if !input_dir.exists() {
        return files;
    }

    for entry in WalkDir::new(input_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if entry.file_type().is_file() && is_video_file(path) {
            files.push(path.to_path_buf());
        }
    }

    for entry in WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if !profile_exists(config, name) {
            tracing::debug!(subdir = name, "skipping subdir with no matching profile");
            continue;
        }

        for file_entry in WalkDir::new(entry.path())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = file_entry.path();
            if file_entry.file_type().is_file() && is_video_file(path) {
                files.push(path.to_path_buf());
            }
        }
    }

    files.sort();
    files
}

/// Determine the profile for an input file from its location.
///
/// A file inside a subdirectory of the input tree uses that subdirectory's
/// name; loose files use the configured default.
pub fn determine_profile_name(file_path: &Path, config: &Config) -> String {
    if let Some(parent) = file_path.parent() {
        if let Ok(relative) = parent.strip_prefix(&config.dirs.input) {
            if let Some(first) = relative.components().next() {
                return first.as_os_str().to_string_lossy().into_owned();
            }
        }
    }
    config.defaults.profile.clone()
}

/// Create the directory tree a run needs.
fn ensure_dirs(config: &Config) -> std::io::Result<()> {
    for dir in [
        &config.dirs.input,
        &config.dirs.work,
        &config.dirs.done,
        &config.dirs.out,
        &config.dirs.error,
    ] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Move a finished job directory into the done or error tree.
///
/// The relocation is the externally visible completion signal, so a
/// destination collision is a hard failure rather than something to merge
/// or overwrite.
fn relocate_job_dir(job_dir: &Path, dest_root: &Path) -> bool {
    let Some(name) = job_dir.file_name() else {
        return false;
    };
    let dest = dest_root.join(name);
    if dest.exists() {
        tracing::error!(dest = %dest.display(), "cannot relocate job, destination exists");
        return false;
    }
    match fs::rename(job_dir, &dest) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(dest = %dest.display(), error = %err, "failed to relocate job");
            false
        }
    }
}

/// Resume one existing work job, if it can be claimed.
fn process_work_job(pipeline: &Pipeline<'_>, job_dir: &Path, dry_run: bool) -> JobOutcome {
    let config = pipeline.config;

    let Ok(Some(token)) = claim::acquire(job_dir) else {
        tracing::debug!(job = %job_dir.display(), "skipping, already claimed");
        return JobOutcome::Locked;
    };

    let outcome = (|| {
        let Some(name) = job_dir.file_name().and_then(|n| n.to_str()) else {
            return JobOutcome::Failed;
        };
        let work_file = job_dir.join(name);
        if !work_file.is_file() {
            tracing::warn!(file = %work_file.display(), "source file missing");
            return JobOutcome::Failed;
        }

        let mut state = match load_state(job_dir) {
            Ok(Some(state)) => state,
            Ok(None) => {
                // No record at all: adopt the job under the default profile
                tracing::info!(job = name, "creating new state for orphaned job");
                let profile_name = config.defaults.profile.clone();
                let Ok(profile) = load_profile(config, &profile_name) else {
                    return JobOutcome::Failed;
                };
                let mut enabled = StageSet::all();
                enabled.crop = profile.processing.crop;
                let mut state = create_state(&profile_name, &work_file, enabled);
                if save_state(job_dir, &mut state).is_err() {
                    return JobOutcome::Failed;
                }
                state
            }
            Err(err) => {
                tracing::error!(job = name, error = %err, "unreadable state record");
                return JobOutcome::Failed;
            }
        };

        let profile_name = if state.profile_name.is_empty() {
            config.defaults.profile.clone()
        } else {
            state.profile_name.clone()
        };
        tracing::info!(job = name, profile = %profile_name, "resuming");

        let profile = match load_profile(config, &profile_name) {
            Ok(profile) => profile,
            Err(err) => {
                tracing::error!(profile = %profile_name, error = %err, "failed to load profile");
                return JobOutcome::Failed;
            }
        };

        match pipeline.run(&work_file, job_dir, &profile, &mut state, dry_run) {
            Ok(()) => {
                if dry_run || relocate_job_dir(job_dir, &config.dirs.done) {
                    JobOutcome::Processed
                } else {
                    JobOutcome::Failed
                }
            }
            Err(_) => {
                if !dry_run {
                    relocate_job_dir(job_dir, &config.dirs.error);
                }
                JobOutcome::Failed
            }
        }
    })();

    claim::release(token, job_dir);
    outcome
}

/// Take one new input file into the work tree and process it.
fn process_input_file(pipeline: &Pipeline<'_>, file_path: &Path, dry_run: bool) -> JobOutcome {
    let config = pipeline.config;

    let profile_name = determine_profile_name(file_path, config);

    let Some(original_name) = file_path.file_name().and_then(|n| n.to_str()) else {
        return JobOutcome::Failed;
    };
    let fixed_name = normalize_filename(original_name);

    let job_dir = config.dirs.work.join(&fixed_name);
    if fs::create_dir_all(&job_dir).is_err() {
        return JobOutcome::Failed;
    }

    let Ok(Some(token)) = claim::acquire(&job_dir) else {
        tracing::debug!(job = %fixed_name, "skipping, already claimed");
        return JobOutcome::Locked;
    };

    let outcome = (|| {
        if fixed_name != original_name {
            tracing::info!(from = original_name, to = %fixed_name, "normalized filename");
        }
        tracing::info!(job = %fixed_name, profile = %profile_name, "processing");

        let work_file = if dry_run {
            file_path.to_path_buf()
        } else {
            let work_file = job_dir.join(&fixed_name);
            if let Err(err) = fs::rename(file_path, &work_file) {
                tracing::error!(error = %err, "failed to move input into work tree");
                return JobOutcome::Failed;
            }

            // Bring a sibling subtitle file along under its own
            // normalized name, so the stems still match.
            let srt_path = file_path.with_extension("srt");
            if srt_path.is_file() {
                if let Some(srt_name) = srt_path.file_name().and_then(|n| n.to_str()) {
                    let fixed_srt = normalize_filename(srt_name);
                    if fs::rename(&srt_path, job_dir.join(&fixed_srt)).is_ok() {
                        tracing::info!(subtitle = srt_name, "found external subtitle");
                    }
                }
            }

            work_file
        };

        let profile = match load_profile(config, &profile_name) {
            Ok(profile) => profile,
            Err(err) => {
                tracing::error!(profile = %profile_name, error = %err, "failed to load profile");
                return JobOutcome::Failed;
            }
        };

        let mut enabled = StageSet::all();
        enabled.crop = profile.processing.crop;
        let mut state = create_state(&profile_name, &work_file, enabled);
        if save_state(&job_dir, &mut state).is_err() {
            return JobOutcome::Failed;
        }

        match pipeline.run(&work_file, &job_dir, &profile, &mut state, dry_run) {
            Ok(()) => {
                if dry_run || relocate_job_dir(&job_dir, &config.dirs.done) {
                    JobOutcome::Processed
                } else {
                    JobOutcome::Failed
                }
            }
            Err(_) => {
                if !dry_run {
                    relocate_job_dir(&job_dir, &config.dirs.error);
                }
                JobOutcome::Failed
            }
        }
    })();

    claim::release(token, &job_dir);
    outcome
}

/// Run one batch invocation with an explicit pipeline (collaborators
/// injected).
///
/// Phase 1 tries to resume existing work jobs; only if none was handled
/// does phase 2 take a new input file. Exactly one job is processed per
/// invocation. Returns the process exit code: 0 when there was nothing to
/// do or the handled job succeeded, 1 when it failed.
pub fn run_batch_with(pipeline: &Pipeline<'_>, dry_run: bool) -> i32 {
    let config = pipeline.config;

    if let Err(err) = ensure_dirs(config) {
        tracing::error!(error = %err, "failed to create directory tree");
        return 1;
    }

    let mut processed = 0;
    let mut errors = 0;

    let work_jobs = find_work_jobs(&config.dirs.work);
    if !work_jobs.is_empty() {
        tracing::info!(count = work_jobs.len(), "found resumable jobs");

        for job_dir in &work_jobs {
            match process_work_job(pipeline, job_dir, dry_run) {
                JobOutcome::Processed => {
                    processed += 1;
                    break;
                }
                JobOutcome::Failed => {
                    errors += 1;
                    break;
                }
                JobOutcome::Locked => continue,
            }
        }
    }

    if processed == 0 && errors == 0 {
        let input_files = find_input_files(config);
        if !input_files.is_empty() {
            tracing::info!(count = input_files.len(), "found input files");

            for file_path in &input_files {
                match process_input_file(pipeline, file_path, dry_run) {
                    JobOutcome::Processed => {
                        processed += 1;
                        break;
                    }
                    JobOutcome::Failed => {
                        errors += 1;
                        break;
                    }
                    JobOutcome::Locked => continue,
                }
            }
        }
    }

    if processed == 0 && errors == 0 {
        tracing::info!("nothing to process");
    }

    if errors > 0 {
        tracing::warn!(errors, "completed with errors");
        return 1;
    }
    if processed > 0 {
        tracing::info!("batch invocation complete");
    }
    0
}

/// Run one batch invocation with the standard ffmpeg-backed collaborators.
pub fn run_batch(config: &Config, dry_run: bool) -> i32 {
    let prober = FfprobeProber::new(&config.tools.ffprobe);
    let crop_measurer = FfmpegCropMeasurer::new(&config.tools.ffmpeg);
    let encoder = FfmpegEncoder::new(&config.tools.ffmpeg);
    let pipeline = Pipeline {
        prober: &prober,
        crop_measurer: &crop_measurer,
        encoder: &encoder,
        config,
    };
    run_batch_with(&pipeline, dry_run)
}

/// Process a single named file, bypassing discovery.
///
/// The file is processed in place: a job directory is created for its
/// state and artifacts, but the source itself is not moved into the work
/// tree.
pub fn run_single_with(
    pipeline: &Pipeline<'_>,
    file_path: &Path,
    profile_name: Option<&str>,
    dry_run: bool,
) -> i32 {
    let config = pipeline.config;

    if !file_path.exists() {
        tracing::error!(file = %file_path.display(), "file not found");
        return 1;
    }
    if let Err(err) = ensure_dirs(config) {
        tracing::error!(error = %err, "failed to create directory tree");
        return 1;
    }

    let profile_name = profile_name
        .map(|p| p.to_string())
        .unwrap_or_else(|| config.defaults.profile.clone());
    tracing::info!(file = %file_path.display(), profile = %profile_name, "processing single file");

    let profile = match load_profile(config, &profile_name) {
        Ok(profile) => profile,
        Err(err) => {
            tracing::error!(profile = %profile_name, error = %err, "failed to load profile");
            return 1;
        }
    };

    let Some(name) = file_path.file_name() else {
        return 1;
    };
    let job_dir = config.dirs.work.join(name);
    if fs::create_dir_all(&job_dir).is_err() {
        return 1;
    }

    let mut enabled = StageSet::all();
    enabled.crop = profile.processing.crop;
    let mut state = create_state(&profile_name, file_path, enabled);
    if save_state(&job_dir, &mut state).is_err() {
        return 1;
    }

    match pipeline.run(file_path, &job_dir, &profile, &mut state, dry_run) {
        Ok(()) => {
            if dry_run || relocate_job_dir(&job_dir, &config.dirs.done) {
                0
            } else {
                1
            }
        }
        Err(_) => {
            if !dry_run {
                relocate_job_dir(&job_dir, &config.dirs.error);
            }
            1
        }
    }
}

/// Process a single named file with the standard collaborators.
pub fn run_single(
    config: &Config,
    file_path: &Path,
    profile_name: Option<&str>,
    dry_run: bool,
) -> i32 {
    let prober = FfprobeProber::new(&config.tools.ffprobe);
    let crop_measurer = FfmpegCropMeasurer::new(&config.tools.ffmpeg);
    let encoder = FfmpegEncoder::new(&config.tools.ffmpeg);
    let pipeline = Pipeline {
        prober: &prober,
        crop_measurer: &crop_measurer,
        encoder: &encoder,
        config,
    };
    run_single_with(&pipeline, file_path, profile_name, dry_run)
}
