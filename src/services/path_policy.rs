//! Destination naming and partitioning.
//!
//! Everything here is a pure function of its inputs: no filesystem access,
//! no clock reads. Callers pass `now` explicitly and it is used as given,
//! without timezone normalization.

use crate::models::{OperationKind, OutputConfig};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Datelike, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;

/// Name used when the original name is not preserved or is unusable.
pub const PLACEHOLDER_NAME: &str = "document";

/// Capture-time format embedded in file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Extension of every generated artifact.
pub const OUTPUT_EXTENSION: &str = "pdf";

/// Highest numeric suffix tried when a destination is already taken.
pub const MAX_COLLISION_SUFFIX: u32 = 1000;

/// Characters that are illegal in a file name on at least one supported platform.
static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("Invalid file name regex"));

/// Reduce an arbitrary source descriptor to a safe file name.
///
/// Directory components (either separator style) are dropped and illegal
/// characters are replaced with `_`. Returns [`PLACEHOLDER_NAME`] when
/// nothing usable remains.
pub fn sanitize_file_name(source_name: &str) -> String {
    let last = source_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if last.is_empty() || last == "." || last == ".." {
        return PLACEHOLDER_NAME.to_string();
    }

    ILLEGAL_CHARS.replace_all(last, "_").into_owned()
}

/// Stem of the sanitized source name, or the placeholder.
///
/// A name that is only a dotted extension (`.pdf`) has no stem, and leading
/// dots are dropped so artifacts are never hidden files.
fn name_stem(source_name: &str) -> String {
    let sanitized = sanitize_file_name(source_name);
    let stem = match Utf8Path::new(&sanitized).file_stem() {
        Some(stem) if stem == sanitized && stem.starts_with('.') => "",
        Some(stem) => stem.trim_start_matches('.'),
        None => "",
    };
    if stem.is_empty() {
        PLACEHOLDER_NAME.to_string()
    } else {
        stem.to_string()
    }
}

/// File name (without directory) for an artifact.
pub fn file_name(
    kind: OperationKind,
    source_name: &str,
    config: &OutputConfig,
    now: NaiveDateTime,
) -> String {
    let stem = if config.preserve_original_names {
        name_stem(source_name)
    } else {
        PLACEHOLDER_NAME.to_string()
    };

    let mut name = format!("{}_{}", stem, kind.suffix());
    if config.add_timestamp {
        name.push('_');
        name.push_str(&now.format(TIMESTAMP_FORMAT).to_string());
    }
    name.push('.');
    name.push_str(OUTPUT_EXTENSION);
    name
}

/// Directory an artifact of `kind` produced at `now` belongs in.
pub fn output_directory(kind: OperationKind, config: &OutputConfig, now: NaiveDateTime) -> Utf8PathBuf {
    if config.create_subdirectories {
        config
            .base_output_dir
            .join(kind.folder())
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
    } else {
        config.base_output_dir.clone()
    }
}

/// Canonical destination for an artifact.
///
/// Deterministic for identical inputs. With timestamps enabled, two calls
/// whose `now` differ by at least one second never collide; without them a
/// collision is possible and is resolved on disk by the output store.
pub fn resolve(
    kind: OperationKind,
    source_name: &str,
    config: &OutputConfig,
    now: NaiveDateTime,
) -> Utf8PathBuf {
    output_directory(kind, config, now).join(file_name(kind, source_name, config, now))
}

/// Destination inside an explicit directory, keeping the naming policy.
pub fn resolve_in(
    directory: &Utf8Path,
    kind: OperationKind,
    source_name: &str,
    config: &OutputConfig,
    now: NaiveDateTime,
) -> Utf8PathBuf {
    directory.join(file_name(kind, source_name, config, now))
}

/// Directory grouping the outputs of one batch run.
pub fn batch_directory(kind: OperationKind, config: &OutputConfig, now: NaiveDateTime) -> Utf8PathBuf {
    output_directory(kind, config, now).join(format!("batch_{}", now.format(TIMESTAMP_FORMAT)))
}

/// `n`-th alternative for a taken destination: `name_(n).pdf`.
pub fn collision_candidate(path: &Utf8Path, n: u32) -> Utf8PathBuf {
    let stem = path.file_stem().unwrap_or(PLACEHOLDER_NAME);
    let name = match path.extension() {
        Some(ext) => format!("{}_({}).{}", stem, n, ext),
        None => format!("{}_({})", stem, n),
    };
    path.with_file_name(name)
}
