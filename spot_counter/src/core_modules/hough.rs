// THEORY:
// A gradient Hough transform for circles of a bounded radius range. Only the
// pieces the circle locator needs are implemented: edge extraction, the centre
// accumulator, and a radius estimate per centre.
//
// Key architectural principles & algorithm steps:
// 1.  **Edge Map**: Canny with `(edge_threshold / 2, edge_threshold)` hysteresis.
//     Sobel gradients of a lightly smoothed copy give each edge point a direction.
// 2.  **Centre Votes**: Every edge point casts votes along its gradient line, in
//     both directions, between `min_radius` and `max_radius`. The accumulator has
//     one cell per `resolution x resolution` pixels, and a ray never votes twice
//     for the same cell.
// 3.  **Centre Candidates**: Cells above `accumulator_threshold` that are local
//     maxima of their 4-neighbourhood, strongest first.
// 4.  **Radius Support**: For each candidate the edge-point distances within the
//     radius range are sorted, and the densest window of width `resolution`
//     gives the radius. A circle is accepted when that window holds at least
//     `accumulator_threshold` edge points.
//
// `EdgeField` caches steps 1 and 2 so the caller can try several accumulator
// thresholds against one edge threshold without recomputing anything.

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// Smoothing applied before taking gradient directions.
const GRADIENT_SIGMA: f32 = 1.4;

/// A circle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

/// Geometry of the search, independent of thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoughGeometry {
    pub min_radius: u32,
    pub max_radius: u32,
    /// Accumulator cell size in pixels.
    pub resolution: u32,
    pub min_center_distance: f32,
}

/// Edge points and centre votes for one edge threshold.
#[derive(Debug)]
pub struct EdgeField {
    geometry: HoughGeometry,
    edges: Vec<(f32, f32)>,
    votes: Vec<u32>,
    cols: usize,
    rows: usize,
}

impl EdgeField {
    pub fn build(image: &GrayImage, edge_threshold: f32, geometry: HoughGeometry) -> Self {
        let resolution = geometry.resolution.max(1);
        let geometry = HoughGeometry {
            resolution,
            ..geometry
        };
        let (width, height) = image.dimensions();
        let cols = width.div_ceil(resolution) as usize;
        let rows = height.div_ceil(resolution) as usize;
        let mut field = Self {
            geometry,
            edges: Vec::new(),
            votes: vec![0; cols * rows],
            cols,
            rows,
        };
        if width == 0 || height == 0 || geometry.max_radius < geometry.min_radius {
            return field;
        }

        let edge_map = canny(image, edge_threshold / 2.0, edge_threshold);
        let smoothed = gaussian_blur_f32(image, GRADIENT_SIGMA);
        let dx = horizontal_sobel(&smoothed);
        let dy = vertical_sobel(&smoothed);

        for (x, y, pixel) in edge_map.enumerate_pixels() {
            if pixel[0] == 0 {
                continue;
            }
            field.edges.push((x as f32, y as f32));

            let gx = f32::from(dx.get_pixel(x, y)[0]);
            let gy = f32::from(dy.get_pixel(x, y)[0]);
            let magnitude = gx.hypot(gy);
            if magnitude == 0.0 {
                continue;
            }
            let (ux, uy) = (gx / magnitude, gy / magnitude);
            for direction in [1.0f32, -1.0] {
                field.cast_ray(x as f32, y as f32, ux * direction, uy * direction);
            }
        }

        field
    }

    fn cast_ray(&mut self, x: f32, y: f32, ux: f32, uy: f32) {
        let scale = self.geometry.resolution as f32;
        let mut previous: Option<usize> = None;
        for r in self.geometry.min_radius..=self.geometry.max_radius {
            let r = r as f32;
            let cx = (x + ux * r) / scale;
            let cy = (y + uy * r) / scale;
            if cx < 0.0 || cy < 0.0 {
                break;
            }
            let (col, row) = (cx as usize, cy as usize);
            if col >= self.cols || row >= self.rows {
                break;
            }
            let cell = row * self.cols + col;
            if previous == Some(cell) {
                continue;
            }
            self.votes[cell] += 1;
            previous = Some(cell);
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Circles supported by at least `accumulator_threshold` votes and edge
    /// points, strongest centre first.
    pub fn circles(&self, accumulator_threshold: u32) -> Vec<Circle> {
        let scale = self.geometry.resolution as f32;
        let mut found: Vec<Circle> = Vec::new();

        for cell in self.centre_candidates(accumulator_threshold) {
            let cx = ((cell % self.cols) as f32 + 0.5) * scale;
            let cy = ((cell / self.cols) as f32 + 0.5) * scale;
            let too_close = found.iter().any(|circle| {
                (circle.x - cx).hypot(circle.y - cy) < self.geometry.min_center_distance
            });
            if too_close {
                continue;
            }
            if let Some((radius, support)) = self.best_radius(cx, cy) {
                if support >= accumulator_threshold as usize {
                    found.push(Circle { x: cx, y: cy, radius });
                }
            }
        }

        found
    }

    fn centre_candidates(&self, threshold: u32) -> Vec<usize> {
        let mut candidates = Vec::new();
        if self.cols < 3 || self.rows < 3 {
            return candidates;
        }
        for row in 1..self.rows - 1 {
            for col in 1..self.cols - 1 {
                let cell = row * self.cols + col;
                let v = self.votes[cell];
                if v > threshold
                    && v > self.votes[cell - 1]
                    && v >= self.votes[cell + 1]
                    && v > self.votes[cell - self.cols]
                    && v >= self.votes[cell + self.cols]
                {
                    candidates.push(cell);
                }
            }
        }
        candidates.sort_by(|a, b| self.votes[*b].cmp(&self.votes[*a]));
        candidates
    }

    /// Densest window of edge distances, as `(mean distance, points in window)`.
    fn best_radius(&self, cx: f32, cy: f32) -> Option<(f32, usize)> {
        let (min, max) = (
            self.geometry.min_radius as f32,
            self.geometry.max_radius as f32,
        );
        let mut distances: Vec<f32> = self
            .edges
            .iter()
            .map(|&(x, y)| (x - cx).hypot(y - cy))
            .filter(|d| *d >= min && *d <= max)
            .collect();
        if distances.is_empty() {
            return None;
        }
        distances.sort_by(f32::total_cmp);

        let width = self.geometry.resolution as f32;
        let (mut best_start, mut best_end) = (0, 0);
        let mut end = 0;
        for start in 0..distances.len() {
            while end < distances.len() && distances[end] < distances[start] + width {
                end += 1;
            }
            if end - start > best_end - best_start {
                best_start = start;
                best_end = end;
            }
        }

        let window = &distances[best_start..best_end];
        let mean = window.iter().sum::<f32>() / window.len() as f32;
        Some((mean, window.len()))
    }
}
