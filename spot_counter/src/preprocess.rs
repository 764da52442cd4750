// THEORY:
// Preprocessing rewrites a whole sample tree into a sibling tree with the same
// layout: one folder per sample, one output photograph per input photograph,
// same file names. Two rewrites exist:
//
// - `band_pass` removes slowly varying background (uneven lighting, the dish
//   itself) with the same difference-of-Gaussians the container search uses,
//   applied to every channel.
// - `subtract_reference` removes fixed-pattern noise such as hot pixels by
//   subtracting a dark reference frame, clipped at zero.
//
// A photograph that cannot be read, has the wrong size, or cannot be written
// is logged and listed in the report. It never stops the rest of the tree.
// The destination must not exist beforehand, so an earlier result is never
// overwritten.

use crate::core_modules::circle_locator::{diff_of_gaussian, extract_channel};
use crate::core_modules::discovery::{is_image_file, sample_directories};
use crate::error::{PreprocessError, SpotError};
use crate::pipeline::decode;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Highest numeric suffix tried by `unused_destination`.
pub const MAX_DESTINATION_SUFFIX: usize = 99;

/// Outcome of rewriting one tree.
#[derive(Debug, Default)]
pub struct TreeReport {
    pub destination: PathBuf,
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Difference of Gaussians on each channel, negative values clipped to zero.
pub fn band_pass(image: &RgbImage, inner_sigma: f32, outer_sigma: f32) -> RgbImage {
    let channels: Vec<_> = (0..3)
        .map(|c| diff_of_gaussian(&extract_channel(image, c), inner_sigma, outer_sigma))
        .collect();
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        Rgb([
            channels[0].get_pixel(x, y)[0],
            channels[1].get_pixel(x, y)[0],
            channels[2].get_pixel(x, y)[0],
        ])
    })
}

/// `image - reference` per channel, clipped at zero.
pub fn subtract_reference(
    image: &RgbImage,
    reference: &RgbImage,
) -> Result<RgbImage, PreprocessError> {
    if image.dimensions() != reference.dimensions() {
        return Err(PreprocessError::SizeMismatch {
            expected: reference.dimensions(),
            found: image.dimensions(),
        });
    }
    let mut out = image.clone();
    for (pixel, dark) in out.pixels_mut().zip(reference.pixels()) {
        for (value, offset) in pixel.0.iter_mut().zip(dark.0) {
            *value = value.saturating_sub(offset);
        }
    }
    Ok(out)
}

/// `parent/stem` if it is free, otherwise the first free `parent/stem_<n>`.
pub fn unused_destination(parent: &Path, stem: &str) -> Result<PathBuf, PreprocessError> {
    std::iter::once(parent.join(stem))
        .chain((0..=MAX_DESTINATION_SUFFIX).map(|n| parent.join(format!("{stem}_{n}"))))
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| PreprocessError::NoFreeDestination {
            parent: parent.to_path_buf(),
            stem: stem.to_string(),
        })
}

fn create_dir(path: &Path) -> Result<(), PreprocessError> {
    std::fs::create_dir(path).map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Applies `rewrite` to every photograph of every sample folder under `source`
/// and writes the results under `destination`, which is created.
pub fn transform_tree<F>(
    source: &Path,
    destination: &Path,
    rewrite: F,
) -> Result<TreeReport, PreprocessError>
where
    F: Fn(&RgbImage) -> Result<RgbImage, PreprocessError>,
{
    if destination.exists() {
        return Err(PreprocessError::DestinationExists(destination.to_path_buf()));
    }
    let folders = sample_directories(source)?;
    create_dir(destination)?;

    let mut report = TreeReport {
        destination: destination.to_path_buf(),
        ..TreeReport::default()
    };
    for folder in &folders {
        let target_dir = destination.join(&folder.name);
        create_dir(&target_dir)?;
        for name in folder.files().iter().filter(|f| is_image_file(f)) {
            let input = folder.path.join(name);
            let output = target_dir.join(name);
            let result = decode(&input)
                .map_err(PreprocessError::from)
                .and_then(|image| rewrite(&image))
                .and_then(|image| {
                    image.save(&output).map_err(|source| {
                        PreprocessError::from(SpotError::Encode {
                            path: output.clone(),
                            source,
                        })
                    })
                });
            match result {
                Ok(()) => report.written.push(output),
                Err(error) => {
                    warn!(image = %input.display(), %error, "photograph skipped");
                    report.failed.push((input, error.to_string()));
                }
            }
        }
    }

    info!(
        destination = %destination.display(),
        written = report.written.len(),
        failed = report.failed.len(),
        "tree rewritten"
    );
    Ok(report)
}
