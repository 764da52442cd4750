// THEORY:
// Every failure the engine can hit falls into one of a handful of concerns:
// reading the profile, reading or writing the progress ledger, walking the
// sample folders, decoding a single photograph, or rewriting a sample tree.
// Each concern gets its own error enum so the caller can tell an
// operator-intervention problem (a ledger that no longer matches the requested
// layout) from a per-image problem that the next run will simply retry.
//
// `BatchError` is the umbrella the orchestrator returns. Anything that reaches
// it is fatal for the run; per-image failures never do.

use std::path::PathBuf;
use thiserror::Error;

/// Problems found while loading or validating a spot profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read profile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("profile is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("the color table is empty")]
    EmptyPalette,
    #[error("the color table has {0} entries, more than a label image can index")]
    PaletteTooLarge(usize),
    #[error("a palette needs a background and at least one more shade, got {0}")]
    TooFewShades(usize),
    #[error("color table value ({row}, {column}) = {value} is outside 0..=255")]
    ChannelOutOfRange { row: usize, column: usize, value: u16 },
    #[error("color table row {row} uses category {category} but only {names} names are declared")]
    CategoryOutOfRange { row: usize, category: u16, names: usize },
    #[error("{names} category names are declared but {settings} detection settings are given")]
    SettingsCountMismatch { names: usize, settings: usize },
    #[error("{category}: {field} maximum {max} must be greater than minimum {min}")]
    InvalidRange {
        category: String,
        field: &'static str,
        min: f64,
        max: f64,
    },
}

/// Problems with the progress ledger.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("progress file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(
        "progress file {path} does not match the requested layout: expected \
         {expected_rows} rows of {expected_cols} columns, found {found_rows} rows{}",
        offending_row
            .map(|(row, cols)| format!(" (row {row} has {cols} columns)"))
            .unwrap_or_default()
    )]
    ShapeMismatch {
        path: PathBuf,
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        offending_row: Option<(usize, usize)>,
    },
    #[error("sample folder `{0}` has no row in the progress file")]
    UnknownSample(String),
    #[error("cell ({row}, {column}) holds `{value}`, which is not a count")]
    InvalidCell {
        row: usize,
        column: usize,
        value: String,
    },
    #[error("result for sample {sample} depth {depth} carries {found} counts, expected {expected}")]
    CountMismatch {
        sample: usize,
        depth: usize,
        expected: usize,
        found: usize,
    },
    #[error("result addresses sample {sample} depth {depth}, outside the table")]
    OutOfBounds { sample: usize, depth: usize },
}

/// Problems while walking the image folders.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid filename pattern `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("filename pattern for depth `{depth}` does not compile: {source}")]
    Regex {
        depth: String,
        #[source]
        source: regex::Error,
    },
}

/// Problems with a single photograph.
#[derive(Debug, Error)]
pub enum SpotError {
    #[error("could not decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("could not write {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Problems while rewriting a whole sample tree.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("destination {0} already exists")]
    DestinationExists(PathBuf),
    #[error("every `{stem}` destination name under {parent} is taken, give one explicitly")]
    NoFreeDestination { parent: PathBuf, stem: String },
    #[error("could not create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Image(#[from] SpotError),
    #[error("image is {found:?} but the reference is {expected:?}")]
    SizeMismatch { expected: (u32, u32), found: (u32, u32) },
}

/// Fatal conditions of a batch run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("at least one depth is required")]
    NoDepths,
    #[error("could not start worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}
