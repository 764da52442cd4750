// THEORY:
// The building blocks of the per-image pipeline and the batch ledger. Each
// module is usable on its own; `pipeline` and `parallel_pipeline` wire them
// together.

pub mod blob_detector;
pub mod circle_locator;
pub mod color_table;
pub mod detection_settings;
pub mod discovery;
pub mod hough;
pub mod palette_classifier;
pub mod palette_seed;
pub mod progress_table;
