//! Directory and file path derivation
//!
//! A subject key such as `components-forms-button--primary` maps to the
//! relative directory `components/forms/button`. Baselines and results use
//! the same derivation so a subject's files live in parallel trees:
//!
//! ```text
//! snapshots/components/forms/button/<id>.png
//! results/components/forms/button/<id>.png
//! results/components/forms/button/<id>.diff.png
//! ```

use crate::index::types::FileKind;
use std::path::{Path, PathBuf};

/// Separator between the story path and its variant name
pub const VARIANT_SEPARATOR: &str = "--";

/// Directory used when a key sanitizes to nothing
const FALLBACK_DIR: &str = "_unnamed";

/// Characters that are unsafe in a path segment on at least one platform
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Derive the relative directory for a subject key
pub fn subject_dir(subject_key: &str) -> PathBuf {
    let story_path = subject_key
        .split_once(VARIANT_SEPARATOR)
        .map(|(path, _)| path)
        .unwrap_or(subject_key);

    let segments: Vec<String> = story_path
        .split('-')
        .map(sanitize_segment)
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .collect();

    if segments.is_empty() {
        return PathBuf::from(FALLBACK_DIR);
    }

    segments.iter().collect()
}

/// Strip filesystem-unsafe characters and collapse whitespace/dashes
pub fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last_dash = false;

    for c in segment.chars() {
        if UNSAFE_CHARS.contains(&c) || c.is_control() {
            continue;
        }

        if c.is_whitespace() || c == '-' {
            if !last_dash {
                out.push('-');
                last_dash = true;
            }
            continue;
        }

        out.push(c);
        last_dash = false;
    }

    out.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Full path to an entry's file.
///
/// Without a subject key the file sits directly under `base`.
pub fn entry_path(base: &Path, kind: FileKind, generated_id: &str, subject_key: Option<&str>) -> PathBuf {
    let dir = match subject_key {
        Some(key) => base.join(subject_dir(key)),
        None => base.to_path_buf(),
    };
    dir.join(kind.file_name(generated_id))
}

/// Extract the generated id from an image file name (`<id>.png`, `<id>.diff.png`)
pub fn generated_id_from_file_name(file_name: &str) -> Option<&str> {
    if !file_name.ends_with(".png") {
        return None;
    }
    file_name.split('.').next().filter(|id| !id.is_empty())
}
