//! Filename normalization.
//!
//! Jobs are identified by their normalized source filename: the work
//! directory carries the normalized name and the source file inside it
//! matches the directory name exactly. Normalization keeps names friendly
//! to both Unix and Windows filesystems and makes repeated submissions of
//! the same release collapse onto one job identity.

/// Normalize a filename for use as a job identity.
///
/// Transformations:
/// - lowercase everything
/// - replace non-alphanumeric characters with underscores
/// - replace dots inside the stem with underscores (the extension keeps
///   its separating dot)
/// - trim leading/trailing underscores, collapse runs of underscores
///
/// `"My Movie (2023) [1080p].MKV"` becomes `"my_movie_2023_1080p.mkv"`.
pub fn normalize_filename(filename: &str) -> String {
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) => (&filename[..idx], &filename[idx + 1..]),
        None => (filename, ""),
    };

    let stem = sanitize_component(stem);
    let ext = sanitize_component(ext);

    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

/// Lowercase, map every non-alphanumeric to `_`, trim and collapse.
fn sanitize_component(component: &str) -> String {
    let mapped: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let mut out = String::with_capacity(mapped.len());
    let mut last_was_underscore = false;
    for c in mapped.trim_matches('_').chars() {
        if c == '_' {
            if !last_was_underscore {
                out.push(c);
            }
            last_was_underscore = true;
        } else {
            out.push(c);
            last_was_underscore = false;
        }
    }
    out
}
