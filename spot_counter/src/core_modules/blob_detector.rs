// THEORY:
// The `BlobDetector` is the last stage of the per-image pipeline. It receives one
// category's grayscale rendering and answers a single question: how many spots
// are in it? Everything upstream exists to make that rendering clean enough for
// a simple, well-understood algorithm to be reliable.
//
// Key architectural principles & algorithm steps (`ThresholdSweepDetector`):
// 1.  **Threshold Sweep**: The rendering is binarized at every threshold from
//     `min_threshold` (inclusive) to `max_threshold` (exclusive) in steps of
//     `threshold_step`. Because the gray palette spreads a category's shades
//     evenly over `0..=255`, each shade boundary is crossed by some threshold.
// 2.  **Contour Extraction**: At each threshold the borders of the binary regions
//     are traced. A border's polygon yields its moments, from which the area,
//     centroid, circularity, inertia ratio and convexity are measured. Enabled
//     shape filters drop candidates outside their `[min, max)` window, and the
//     binary value under the centroid must equal `blob_color`.
// 3.  **Cross-Threshold Grouping**: Candidates from successive thresholds whose
//     centers are close (closer than `min_dist_between_blobs` or than either
//     radius) are the same physical spot seen at different cut levels and are
//     grouped. Only groups seen at `min_repeatability` thresholds or more survive.
// 4.  **Stateless Utility**: The detector holds no state between calls. A single
//     instance is shared read-only by every worker.
//
// The `BlobDetector` trait is the seam for swapping in another implementation.

use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::point::Point;
use std::fmt::Debug;
use tracing::warn;

/// A `[min, max)` window on one measured blob property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeFilter {
    pub enabled: bool,
    pub min: f64,
    pub max: f64,
}

impl ShapeFilter {
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            min: 0.0,
            max: f64::INFINITY,
        }
    }

    pub const fn between(min: f64, max: f64) -> Self {
        Self {
            enabled: true,
            min,
            max,
        }
    }

    fn rejects(&self, value: f64) -> bool {
        self.enabled && (value < self.min || value >= self.max)
    }
}

/// Configuration record handed to a `BlobDetector` for one rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobParams {
    pub min_threshold: f32,
    pub max_threshold: f32,
    pub threshold_step: f32,
    /// Binary value a blob's centroid must sit on: 255 for bright spots.
    pub blob_color: u8,
    pub min_dist_between_blobs: f32,
    /// Number of thresholds a spot must be seen at.
    pub min_repeatability: usize,
    pub area: ShapeFilter,
    pub circularity: ShapeFilter,
    pub convexity: ShapeFilter,
    pub inertia: ShapeFilter,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            min_threshold: 10.0,
            max_threshold: 220.0,
            threshold_step: 10.0,
            blob_color: 255,
            min_dist_between_blobs: 10.0,
            min_repeatability: 2,
            area: ShapeFilter::disabled(),
            circularity: ShapeFilter::disabled(),
            convexity: ShapeFilter::disabled(),
            inertia: ShapeFilter::disabled(),
        }
    }
}

/// A detected spot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    /// Number of thresholds the spot was seen at.
    pub support: usize,
}

pub trait BlobDetector: Send + Sync + Debug {
    fn detect(&self, image: &GrayImage, params: &BlobParams) -> Vec<Blob>;

    fn count_blobs(&self, image: &GrayImage, params: &BlobParams) -> usize {
        self.detect(image, params).len()
    }
}

/// Multi-threshold connected-region detector with shape filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdSweepDetector;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: f64,
    y: f64,
    radius: f64,
}

impl BlobDetector for ThresholdSweepDetector {
    fn detect(&self, image: &GrayImage, params: &BlobParams) -> Vec<Blob> {
        if image.width() == 0 || image.height() == 0 {
            return Vec::new();
        }
        if !(params.threshold_step > 0.0) {
            warn!(
                step = params.threshold_step,
                "threshold step must be positive, no blobs searched"
            );
            return Vec::new();
        }

        let mut groups: Vec<Vec<Candidate>> = Vec::new();
        let mut threshold = params.min_threshold;
        while threshold < params.max_threshold {
            let binary = binarize(image, threshold);
            let candidates = find_candidates(&binary, params);

            let mut fresh: Vec<Vec<Candidate>> = Vec::new();
            for candidate in candidates {
                let mut is_new = true;
                for group in groups.iter_mut() {
                    let anchor = group[group.len() / 2];
                    let distance = (anchor.x - candidate.x).hypot(anchor.y - candidate.y);
                    is_new = distance >= f64::from(params.min_dist_between_blobs)
                        && distance >= anchor.radius
                        && distance >= candidate.radius;
                    if !is_new {
                        let position = group.partition_point(|c| c.radius <= candidate.radius);
                        group.insert(position, candidate);
                        break;
                    }
                }
                if is_new {
                    fresh.push(vec![candidate]);
                }
            }
            groups.extend(fresh);

            threshold += params.threshold_step;
        }

        groups
            .into_iter()
            .filter(|group| group.len() >= params.min_repeatability)
            .map(|group| {
                let support = group.len();
                let x = group.iter().map(|c| c.x).sum::<f64>() / support as f64;
                let y = group.iter().map(|c| c.y).sum::<f64>() / support as f64;
                Blob {
                    x,
                    y,
                    radius: group[support / 2].radius,
                    support,
                }
            })
            .collect()
    }
}

/// Pixels strictly above the (floored) threshold become 255.
fn binarize(image: &GrayImage, threshold: f32) -> GrayImage {
    let cut = threshold.floor();
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if f32::from(image.get_pixel(x, y)[0]) > cut {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    })
}

fn find_candidates(binary: &GrayImage, params: &BlobParams) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for contour in find_contours::<i32>(binary) {
        let points = &contour.points;
        let moments = shape::Moments::of_polygon(points);
        if moments.m00 == 0.0 {
            continue;
        }
        let area = moments.m00;
        if params.area.rejects(area) {
            continue;
        }

        if params.circularity.enabled {
            let perimeter = shape::closed_arc_length(points);
            let ratio = 4.0 * std::f64::consts::PI * area / (perimeter * perimeter);
            if params.circularity.rejects(ratio) {
                continue;
            }
        }

        if params.inertia.enabled && params.inertia.rejects(moments.inertia_ratio()) {
            continue;
        }

        if params.convexity.enabled {
            let hull_area = shape::polygon_area(&shape::convex_hull(points));
            if hull_area.abs() < f64::EPSILON {
                continue;
            }
            if params.convexity.rejects(area / hull_area) {
                continue;
            }
        }

        let (x, y) = moments.centroid();
        let (px, py) = (x.round(), y.round());
        let inside = px >= 0.0
            && py >= 0.0
            && (px as u32) < binary.width()
            && (py as u32) < binary.height();
        if !inside || binary.get_pixel(px as u32, py as u32)[0] != params.blob_color {
            continue;
        }

        candidates.push(Candidate {
            x,
            y,
            radius: shape::median_distance(points, x, y),
        });
    }

    candidates
}

mod shape {
    use super::Point;

    /// Raw and central moments of a closed polygon, up to second order.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Moments {
        pub m00: f64,
        pub m10: f64,
        pub m01: f64,
        pub m20: f64,
        pub m11: f64,
        pub m02: f64,
    }

    impl Moments {
        /// Green's theorem over the polygon edges. The result is independent of
        /// the winding direction.
        pub fn of_polygon(points: &[Point<i32>]) -> Self {
            let Some(last) = points.last() else {
                return Self::default();
            };
            let (mut a00, mut a10, mut a01, mut a20, mut a11, mut a02) =
                (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
            let (mut xp, mut yp) = (f64::from(last.x), f64::from(last.y));

            for point in points {
                let (xi, yi) = (f64::from(point.x), f64::from(point.y));
                let dxy = xp * yi - xi * yp;
                let xii = xp + xi;
                let yii = yp + yi;

                a00 += dxy;
                a10 += dxy * xii;
                a01 += dxy * yii;
                a20 += dxy * (xp * xii + xi * xi);
                a11 += dxy * (xp * (yii + yp) + xi * (yii + yi));
                a02 += dxy * (yp * yii + yi * yi);

                xp = xi;
                yp = yi;
            }

            if a00.abs() <= f64::EPSILON {
                return Self::default();
            }
            let sign = a00.signum();
            Self {
                m00: sign * a00 / 2.0,
                m10: sign * a10 / 6.0,
                m01: sign * a01 / 6.0,
                m20: sign * a20 / 12.0,
                m11: sign * a11 / 24.0,
                m02: sign * a02 / 12.0,
            }
        }

        pub fn centroid(&self) -> (f64, f64) {
            (self.m10 / self.m00, self.m01 / self.m00)
        }

        /// Ratio of the smallest to the largest principal second moment:
        /// 1 for a circle, close to 0 for a line.
        pub fn inertia_ratio(&self) -> f64 {
            let (cx, cy) = self.centroid();
            let mu20 = self.m20 - self.m10 * cx;
            let mu11 = self.m11 - self.m10 * cy;
            let mu02 = self.m02 - self.m01 * cy;

            let denominator = (2.0 * mu11).hypot(mu20 - mu02);
            if denominator <= 1e-2 {
                return 1.0;
            }
            let cos_min = (mu20 - mu02) / denominator;
            let sin_min = 2.0 * mu11 / denominator;
            let mean = 0.5 * (mu20 + mu02);
            let i_min = mean - 0.5 * (mu20 - mu02) * cos_min - mu11 * sin_min;
            let i_max = mean + 0.5 * (mu20 - mu02) * cos_min + mu11 * sin_min;
            i_min / i_max
        }
    }

    pub fn closed_arc_length(points: &[Point<i32>]) -> f64 {
        let Some(last) = points.last() else {
            return 0.0;
        };
        let mut previous = last;
        let mut length = 0.0;
        for point in points {
            length += f64::from(point.x - previous.x).hypot(f64::from(point.y - previous.y));
            previous = point;
        }
        length
    }

    /// Andrew's monotone chain. Returns the hull counter-clockwise.
    pub fn convex_hull(points: &[Point<i32>]) -> Vec<Point<i32>> {
        let mut sorted: Vec<Point<i32>> = points.to_vec();
        sorted.sort_by_key(|p| (p.x, p.y));
        sorted.dedup();
        if sorted.len() < 3 {
            return sorted;
        }

        let cross = |o: &Point<i32>, a: &Point<i32>, b: &Point<i32>| -> i64 {
            i64::from(a.x - o.x) * i64::from(b.y - o.y)
                - i64::from(a.y - o.y) * i64::from(b.x - o.x)
        };

        let mut hull: Vec<Point<i32>> = Vec::with_capacity(sorted.len() * 2);
        for point in sorted.iter() {
            while hull.len() >= 2
                && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], point) <= 0
            {
                hull.pop();
            }
            hull.push(*point);
        }
        let lower_len = hull.len() + 1;
        for point in sorted.iter().rev().skip(1) {
            while hull.len() >= lower_len
                && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], point) <= 0
            {
                hull.pop();
            }
            hull.push(*point);
        }
        hull.pop();
        hull
    }

    /// Unsigned shoelace area.
    pub fn polygon_area(points: &[Point<i32>]) -> f64 {
        let Some(last) = points.last() else {
            return 0.0;
        };
        let mut previous = last;
        let mut twice = 0i64;
        for point in points {
            twice += i64::from(previous.x) * i64::from(point.y)
                - i64::from(point.x) * i64::from(previous.y);
            previous = point;
        }
        (twice as f64 / 2.0).abs()
    }

    pub fn median_distance(points: &[Point<i32>], x: f64, y: f64) -> f64 {
        let mut distances: Vec<f64> = points
            .iter()
            .map(|p| (f64::from(p.x) - x).hypot(f64::from(p.y) - y))
            .collect();
        if distances.is_empty() {
            return 0.0;
        }
        distances.sort_by(f64::total_cmp);
        let n = distances.len();
        (distances[(n - 1) / 2] + distances[n / 2]) / 2.0
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn square() -> Vec<Point<i32>> {
            vec![
                Point::new(0, 0),
                Point::new(10, 0),
                Point::new(10, 10),
                Point::new(0, 10),
            ]
        }

        #[test]
        fn square_moments_do_not_depend_on_winding() {
            let forward = Moments::of_polygon(&square());
            let mut reversed = square();
            reversed.reverse();
            let backward = Moments::of_polygon(&reversed);

            assert!((forward.m00 - 100.0).abs() < 1e-9);
            assert!((backward.m00 - 100.0).abs() < 1e-9);
            let (cx, cy) = forward.centroid();
            assert!((cx - 5.0).abs() < 1e-9 && (cy - 5.0).abs() < 1e-9);
            assert!((forward.inertia_ratio() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn hull_of_concave_shape_covers_notch() {
            let notched = vec![
                Point::new(0, 0),
                Point::new(10, 0),
                Point::new(10, 10),
                Point::new(5, 5),
                Point::new(0, 10),
            ];
            let hull = convex_hull(&notched);
            assert_eq!(hull.len(), 4);
            assert!((polygon_area(&hull) - 100.0).abs() < 1e-9);
            assert!((polygon_area(&notched) - 75.0).abs() < 1e-9);
        }

        #[test]
        fn arc_length_closes_the_loop() {
            assert!((closed_arc_length(&square()) - 40.0).abs() < 1e-9);
            assert_eq!(closed_arc_length(&[]), 0.0);
        }
    }
}
