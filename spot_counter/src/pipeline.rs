// THEORY:
// The `pipeline` module is the per-image API of the engine. `SpotCounter` takes
// one photograph through every stage and returns one count per category:
//
//   container crop -> palette labels -> per-category rendering -> blob count
//
// The photograph is labelled once; every category then gets its own grayscale
// rendering of the same label image. Category ids are 1-based in the color
// table (0 is background and never counted) while the returned counts are
// 0-based, in the order the categories are declared.
//
// A `SpotCounter` owns an immutable profile and a shared, stateless detector, so
// each worker thread can hold its own copy without coordination.

use crate::config::SpotProfile;
use crate::core_modules::blob_detector::{BlobDetector, ThresholdSweepDetector};
use crate::core_modules::circle_locator::locate_and_crop;
use crate::core_modules::palette_classifier::{
    LabelImage, category_rendering, classify, evenly_spaced_gray_palette, render,
};
use crate::error::SpotError;
use image::{GrayImage, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Every intermediate image of one run through the pipeline.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub cropped: RgbImage,
    pub labels: LabelImage,
    /// One rendering per category, in declared order.
    pub renderings: Vec<GrayImage>,
    pub counts: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct SpotCounter {
    profile: SpotProfile,
    detector: Arc<dyn BlobDetector>,
}

impl SpotCounter {
    pub fn new(profile: SpotProfile) -> Self {
        Self::with_detector(profile, Arc::new(ThresholdSweepDetector))
    }

    pub fn with_detector(profile: SpotProfile, detector: Arc<dyn BlobDetector>) -> Self {
        Self { profile, detector }
    }

    pub fn profile(&self) -> &SpotProfile {
        &self.profile
    }

    /// Counts the spots of every category in `image`.
    pub fn count(&self, image: &RgbImage) -> Vec<u64> {
        let cropped = locate_and_crop(image, &self.profile.circle_search);
        let labels = classify(&cropped, &self.profile.color_table);
        (0..self.profile.category_count())
            .map(|index| self.count_category(&labels, index).1)
            .collect()
    }

    pub fn count_file(&self, path: &Path) -> Result<Vec<u64>, SpotError> {
        let image = decode(path)?;
        Ok(self.count(&image))
    }

    fn count_category(&self, labels: &LabelImage, index: usize) -> (GrayImage, u64) {
        let table = &self.profile.color_table;
        let category = (index + 1) as u16;
        let rendering = category_rendering(labels, table, category);
        let params = self.profile.settings[index].blob_params(table.len());
        let count = self.detector.count_blobs(&rendering, &params) as u64;
        debug!(category = %self.profile.names[index], count, "category counted");
        (rendering, count)
    }

    /// Like `count`, but keeps the intermediate images.
    pub fn inspect(&self, image: &RgbImage) -> Inspection {
        let cropped = locate_and_crop(image, &self.profile.circle_search);
        let labels = classify(&cropped, &self.profile.color_table);
        let (renderings, counts) = (0..self.profile.category_count())
            .map(|index| self.count_category(&labels, index))
            .unzip();
        Inspection {
            cropped,
            labels,
            renderings,
            counts,
        }
    }
}

pub fn decode(path: &Path) -> Result<RgbImage, SpotError> {
    image::open(path)
        .map(|image| image.to_rgb8())
        .map_err(|source| SpotError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

impl Inspection {
    /// The label image with every palette entry drawn as a distinct gray.
    pub fn label_preview(&self, profile: &SpotProfile) -> GrayImage {
        let gray = evenly_spaced_gray_palette(&profile.color_table.colors());
        render(&self.labels, &gray)
    }

    /// Writes `crop.png`, `labels.png` and one `category_<n>_<name>.png` per
    /// category into `dir`. Returns the written paths.
    pub fn save_to(&self, dir: &Path, profile: &SpotProfile) -> Result<Vec<PathBuf>, SpotError> {
        let encode = |path: PathBuf, result: image::ImageResult<()>| match result {
            Ok(()) => Ok(path),
            Err(source) => Err(SpotError::Encode { path, source }),
        };

        let mut written = Vec::new();
        let path = dir.join("crop.png");
        written.push(encode(path.clone(), self.cropped.save(&path))?);
        let path = dir.join("labels.png");
        written.push(encode(path.clone(), self.label_preview(profile).save(&path))?);
        for (index, rendering) in self.renderings.iter().enumerate() {
            let name = profile.names.get(index).map(String::as_str).unwrap_or("unnamed");
            let path = dir.join(format!("category_{}_{}.png", index + 1, sanitize(name)));
            written.push(encode(path.clone(), rendering.save(&path))?);
        }
        Ok(written)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpotConfig;
    use crate::core_modules::blob_detector::{Blob, BlobParams};
    use crate::core_modules::detection_settings::DetectionSettings;
    use image::Rgb;

    const ORANGE: Rgb<u8> = Rgb([255, 128, 0]);
    const GREEN: Rgb<u8> = Rgb([0, 200, 40]);

    fn profile() -> SpotProfile {
        let mut config = SpotConfig::prepopulated(&["orange".to_string(), "green".to_string()]);
        config.color_data.table = vec![[0, 0, 0, 0], [255, 128, 0, 1], [0, 200, 40, 2]];
        config.det_params = vec![DetectionSettings::new("orange"), DetectionSettings::new("green")];
        // The default radius range exceeds every test image, so no container is
        // found and the images are counted whole.
        config.circle_search.inner_sigma = 2.0;
        config.circle_search.outer_sigma = 4.0;
        config.validate().unwrap()
    }

    fn spotted_image() -> RgbImage {
        let spots = [
            (20, 20, ORANGE),
            (60, 20, ORANGE),
            (20, 70, ORANGE),
            (70, 60, GREEN),
            (45, 45, GREEN),
        ];
        RgbImage::from_fn(100, 100, |x, y| {
            for (cx, cy, color) in spots {
                let (dx, dy) = (x as i32 - cx, y as i32 - cy);
                if dx * dx + dy * dy <= 36 {
                    return color;
                }
            }
            Rgb([0, 0, 0])
        })
    }

    #[test]
    fn counts_each_category_in_declared_order() {
        let counter = SpotCounter::new(profile());
        assert_eq!(counter.count(&spotted_image()), vec![3, 2]);
    }

    #[test]
    fn blank_image_counts_zero_everywhere() {
        let counter = SpotCounter::new(profile());
        let blank = RgbImage::new(60, 60);
        assert_eq!(counter.count(&blank), vec![0, 0]);
    }

    #[derive(Debug)]
    struct BrightPixels;

    impl BlobDetector for BrightPixels {
        fn detect(&self, image: &GrayImage, _: &BlobParams) -> Vec<Blob> {
            image
                .enumerate_pixels()
                .filter(|(_, _, p)| p[0] > 0)
                .map(|(x, y, _)| Blob {
                    x: f64::from(x),
                    y: f64::from(y),
                    radius: 0.5,
                    support: 1,
                })
                .collect()
        }
    }

    #[test]
    fn each_category_sees_only_its_own_pixels() {
        let counter = SpotCounter::with_detector(profile(), Arc::new(BrightPixels));
        let image = RgbImage::from_fn(8, 8, |x, _| match x {
            0 => ORANGE,
            1 | 2 => GREEN,
            _ => Rgb([0, 0, 0]),
        });
        assert_eq!(counter.count(&image), vec![8, 16]);
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        let counter = SpotCounter::new(profile());
        assert!(matches!(counter.count_file(&path), Err(SpotError::Decode { .. })));
    }

    #[test]
    fn inspection_writes_every_stage() {
        let counter = SpotCounter::new(profile());
        let inspection = counter.inspect(&spotted_image());
        assert_eq!(inspection.counts, vec![3, 2]);
        assert_eq!(inspection.renderings.len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let written = inspection.save_to(dir.path(), counter.profile()).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["crop.png", "labels.png", "category_1_orange.png", "category_2_green.png"]
        );
        assert!(written.iter().all(|p| p.exists()));
    }
}
