// THEORY:
// This file is the main entry point for the `spot_counter` library crate. It
// exposes two levels of API:
//
// - `pipeline::SpotCounter` turns one photograph into one count per category.
// - `parallel_pipeline::BatchEngine` walks a folder tree of samples, farms the
//   photographs that still lack a result out to a pool of worker threads, and
//   records every result in a CSV ledger the moment it arrives, so a run can be
//   stopped and resumed at any point.
//
// The `core_modules` hold the individual stages (container search, palette
// classification, blob counting, the ledger itself, folder discovery). They are
// public for tools and tests that need a single stage on its own.
//
// `preprocess` rewrites whole sample trees (background band-pass, dark-frame
// subtraction) before a run, and `core_modules::palette_seed` clusters a
// reference photograph into a starting palette.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod preprocess;

pub use config::{BatchSettings, SpotConfig, SpotProfile};
pub use error::{
    BatchError, ConfigError, DiscoveryError, PreprocessError, SpotError, TableError,
};
pub use parallel_pipeline::{BatchEngine, BatchReport, ImageElement, JobResult};
pub use pipeline::SpotCounter;
