// THEORY:
// The `CircleLocator` isolates the sample container from the rest of the
// photograph. The containers are round dishes filling most of the frame, and
// anything outside the rim (labels, reflections, the bench) would otherwise be
// counted as spots.
//
// Key architectural principles & algorithm steps:
// 1.  **Band-Pass First**: One channel is passed through a difference of
//     Gaussians. Fine texture (the spots themselves) and the slow illumination
//     gradient are both suppressed, leaving the rim as the dominant structure.
// 2.  **Relaxing Schedule**: The Hough search starts strict and relaxes. The
//     outer loop lowers the edge threshold; for each edge map the inner loop
//     lowers the accumulator threshold. The first circle found wins.
// 3.  **Fail-Soft**: If the whole schedule finds nothing the photograph is
//     returned untouched. A missed crop only lets a few artefacts through; an
//     error would lose the image.
// 4.  **Crop and Mask**: The found radius is widened by a small margin, the
//     bounding square is clipped to the image, and every pixel outside the
//     circle is zeroed.

use crate::core_modules::hough::{Circle, EdgeField, HoughGeometry};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tunables of the container search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleSearch {
    /// Channel fed to the search: 0 red, 1 green, 2 blue.
    pub channel: usize,
    pub inner_sigma: f32,
    pub outer_sigma: f32,
    /// Outer loop, strictest first.
    pub edge_thresholds: Vec<f32>,
    /// Inner loop, strictest first.
    pub accumulator_thresholds: Vec<u32>,
    pub min_radius: u32,
    pub max_radius: u32,
    pub resolution: u32,
    pub min_center_distance: f32,
    /// Fraction added to the found radius before cropping.
    pub margin: f32,
}

impl Default for CircleSearch {
    fn default() -> Self {
        Self {
            channel: 2,
            inner_sigma: 10.0,
            outer_sigma: 50.0,
            edge_thresholds: vec![100.0, 90.0, 80.0, 70.0, 60.0, 50.0],
            accumulator_thresholds: vec![300, 250, 200, 150],
            min_radius: 1000,
            max_radius: 1500,
            resolution: 4,
            min_center_distance: 100.0,
            margin: 0.05,
        }
    }
}

impl CircleSearch {
    fn geometry(&self) -> HoughGeometry {
        HoughGeometry {
            min_radius: self.min_radius,
            max_radius: self.max_radius,
            resolution: self.resolution,
            min_center_distance: self.min_center_distance,
        }
    }

    /// Channel index clamped to the three available.
    fn channel_index(&self) -> usize {
        self.channel.min(2)
    }
}

/// Band-pass of one channel: the positive part of `blur(inner) - blur(outer)`.
/// A non-positive sigma leaves that side unblurred.
pub fn diff_of_gaussian(channel: &GrayImage, inner_sigma: f32, outer_sigma: f32) -> GrayImage {
    let blur = |sigma: f32| {
        if sigma > 0.0 {
            gaussian_blur_f32(channel, sigma)
        } else {
            channel.clone()
        }
    };
    let inner = blur(inner_sigma);
    let outer = blur(outer_sigma);

    GrayImage::from_fn(channel.width(), channel.height(), |x, y| {
        Luma([inner.get_pixel(x, y)[0].saturating_sub(outer.get_pixel(x, y)[0])])
    })
}

pub fn extract_channel(image: &RgbImage, channel: usize) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[channel]])
    })
}

/// Runs the relaxing schedule on an already band-passed image.
pub fn find_circle(edges: &GrayImage, search: &CircleSearch) -> Option<Circle> {
    let geometry = search.geometry();
    for &edge_threshold in &search.edge_thresholds {
        let field = EdgeField::build(edges, edge_threshold, geometry);
        debug!(edge_threshold, edge_points = field.edge_count(), "edge map built");
        if field.edge_count() == 0 {
            continue;
        }
        for &accumulator_threshold in &search.accumulator_thresholds {
            if let Some(circle) = field.circles(accumulator_threshold).into_iter().next() {
                info!(
                    x = circle.x,
                    y = circle.y,
                    radius = circle.radius,
                    edge_threshold,
                    accumulator_threshold,
                    "container found"
                );
                return Some(circle);
            }
        }
    }
    None
}

/// Crops to the circle's bounding square, widened by `margin`, and blacks out
/// everything outside the disk. Returns `None` when the clipped square is empty.
pub fn crop_to_circle(image: &RgbImage, circle: Circle, margin: f32) -> Option<RgbImage> {
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    let radius = (f64::from(circle.radius) * (1.0 + f64::from(margin))).round() as i64;
    let x = f64::from(circle.x).round() as i64;
    let y = f64::from(circle.y).round() as i64;

    let left = (x - radius).max(0);
    let right = (x + radius).min(width - 1);
    let top = (y - radius).max(0);
    let bottom = (y + radius).min(height - 1);
    if right <= left || bottom <= top {
        return None;
    }

    // Centre of the disk in crop coordinates.
    let offset_y = radius.min(y);
    let offset_x = radius.min(x);
    let limit = radius * radius;

    let cropped = RgbImage::from_fn((right - left) as u32, (bottom - top) as u32, |cx, cy| {
        let dx = i64::from(cx) - offset_x;
        let dy = i64::from(cy) - offset_y;
        if dx * dx + dy * dy <= limit {
            *image.get_pixel((left + i64::from(cx)) as u32, (top + i64::from(cy)) as u32)
        } else {
            Rgb([0, 0, 0])
        }
    });
    Some(cropped)
}

/// Isolates the container. Returns a copy of the input when no circle is found.
pub fn locate_and_crop(image: &RgbImage, search: &CircleSearch) -> RgbImage {
    let channel = extract_channel(image, search.channel_index());
    let band = diff_of_gaussian(&channel, search.inner_sigma, search.outer_sigma);

    match find_circle(&band, search) {
        Some(circle) => crop_to_circle(image, circle, search.margin).unwrap_or_else(|| {
            debug!(?circle, "circle does not overlap the image, keeping it whole");
            image.clone()
        }),
        None => {
            info!("no container found, keeping the whole image");
            image.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_without_a_container_comes_back_unchanged() {
        let image = RgbImage::from_fn(160, 120, |x, y| Rgb([(x % 7) as u8, 90, (y % 5) as u8 * 3]));
        let search = CircleSearch {
            min_radius: 30,
            max_radius: 50,
            resolution: 2,
            inner_sigma: 2.0,
            outer_sigma: 6.0,
            ..CircleSearch::default()
        };
        assert_eq!(locate_and_crop(&image, &search), image);
    }

    #[test]
    fn crop_masks_outside_the_disk() {
        let image = RgbImage::from_pixel(30, 30, Rgb([200, 100, 50]));
        let circle = Circle {
            x: 10.0,
            y: 10.0,
            radius: 5.0,
        };
        // round(5 * 1.05) = 5
        let cropped = crop_to_circle(&image, circle, 0.05).unwrap();
        assert_eq!(cropped.dimensions(), (10, 10));
        assert_eq!(*cropped.get_pixel(5, 5), Rgb([200, 100, 50]));
        assert_eq!(*cropped.get_pixel(5, 0), Rgb([200, 100, 50]));
        assert_eq!(*cropped.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*cropped.get_pixel(9, 9), Rgb([0, 0, 0]));
    }

    #[test]
    fn crop_clips_at_the_image_border() {
        let image = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let circle = Circle {
            x: 2.0,
            y: 3.0,
            radius: 8.0,
        };
        // radius 8 (8.4 rounded); left 0, right 10, top 0, bottom 11.
        let cropped = crop_to_circle(&image, circle, 0.05).unwrap();
        assert_eq!(cropped.dimensions(), (10, 11));
        // The disk centre sits at (2, 3) in the crop.
        assert_eq!(*cropped.get_pixel(2, 3), Rgb([255, 255, 255]));
        assert_eq!(*cropped.get_pixel(9, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn crop_outside_the_image_is_rejected() {
        let image = RgbImage::new(20, 20);
        let circle = Circle {
            x: 100.0,
            y: 100.0,
            radius: 5.0,
        };
        assert!(crop_to_circle(&image, circle, 0.05).is_none());
    }

    #[test]
    fn finds_and_crops_a_bright_dish() {
        let image = RgbImage::from_fn(200, 200, |x, y| {
            let (dx, dy) = (x as i32 - 100, y as i32 - 100);
            if dx * dx + dy * dy <= 50 * 50 {
                Rgb([40, 40, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let search = CircleSearch {
            min_radius: 40,
            max_radius: 60,
            resolution: 2,
            edge_thresholds: vec![100.0],
            accumulator_thresholds: vec![25],
            ..CircleSearch::default()
        };
        let channel = extract_channel(&image, 2);
        let circle = find_circle(&channel, &search).unwrap();
        assert!((circle.radius - 50.0).abs() <= 3.0);

        let cropped = crop_to_circle(&image, circle, search.margin).unwrap();
        let (w, h) = cropped.dimensions();
        assert!((100..=112).contains(&w) && (100..=112).contains(&h), "{w}x{h}");
        assert_eq!(*cropped.get_pixel(w / 2, h / 2), Rgb([40, 40, 255]));
        assert_eq!(*cropped.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn diff_of_gaussian_keeps_small_bright_detail() {
        let channel = GrayImage::from_fn(60, 60, |x, y| {
            if (29..=31).contains(&x) && (29..=31).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let band = diff_of_gaussian(&channel, 1.0, 4.0);
        assert!(band.get_pixel(30, 30)[0] > 50);
        assert_eq!(band.get_pixel(0, 0)[0], 0);
        assert_eq!(band.get_pixel(59, 5)[0], 0);
    }
}
