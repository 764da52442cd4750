// THEORY:
// A profile's palette is normally sampled from one reference photograph: the
// photograph is clustered into `k` representative shades, and the operator
// then decides which shades belong to which category. This module does the
// clustering half.
//
// Key architectural principles:
// 1.  **Deterministic Seeding**: The first centre is the middle sample; every
//     further centre is the sample farthest from all centres chosen so far. The
//     same photograph and `k` always give the same palette.
// 2.  **Bounded Work**: Large photographs are sampled on a regular stride, so
//     the cost of one iteration does not grow with the sensor size.
// 3.  **Ordered Output**: Shades come back deduplicated and sorted from darkest
//     to brightest, which is the order the profile scaffolding assigns
//     categories in.

use crate::core_modules::palette_classifier::luminance;
use image::RgbImage;

/// Upper bound on the pixels clustered per photograph.
pub const MAX_SAMPLES: usize = 1 << 16;
pub const DEFAULT_ITERATIONS: usize = 20;

type Centre = [f32; 3];

fn distance_sq(a: &Centre, b: &Centre) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(sample: &Centre, centres: &[Centre]) -> usize {
    let mut best = (0, f32::INFINITY);
    for (index, centre) in centres.iter().enumerate() {
        let distance = distance_sq(sample, centre);
        if distance < best.1 {
            best = (index, distance);
        }
    }
    best.0
}

fn samples(image: &RgbImage) -> Vec<Centre> {
    let total = image.width() as usize * image.height() as usize;
    let stride = total.div_ceil(MAX_SAMPLES).max(1);
    image
        .pixels()
        .step_by(stride)
        .map(|p| [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
        .collect()
}

fn seed(samples: &[Centre], k: usize) -> Vec<Centre> {
    let mut centres = vec![samples[samples.len() / 2]];
    while centres.len() < k {
        let mut farthest = (0, 0.0f32);
        for (index, sample) in samples.iter().enumerate() {
            let distance = centres
                .iter()
                .map(|c| distance_sq(sample, c))
                .fold(f32::INFINITY, f32::min);
            if distance > farthest.1 {
                farthest = (index, distance);
            }
        }
        if farthest.1 == 0.0 {
            // Fewer distinct colors than requested shades.
            break;
        }
        centres.push(samples[farthest.0]);
    }
    centres
}

/// Clusters `image` into at most `k` shades, darkest first.
pub fn kmeans_palette(image: &RgbImage, k: usize, iterations: usize) -> Vec<[u8; 3]> {
    let samples = samples(image);
    if samples.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut centres = seed(&samples, k);
    let mut sums = vec![[0f64; 3]; centres.len()];
    let mut counts = vec![0usize; centres.len()];
    for _ in 0..iterations {
        sums.fill([0.0; 3]);
        counts.fill(0);
        for sample in &samples {
            let cluster = nearest(sample, &centres);
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(sample) {
                *sum += f64::from(*value);
            }
        }

        let mut moved = false;
        for ((centre, sum), &count) in centres.iter_mut().zip(&sums).zip(&counts) {
            if count == 0 {
                continue;
            }
            let mean = sum.map(|s| (s / count as f64) as f32);
            moved |= mean != *centre;
            *centre = mean;
        }
        if !moved {
            break;
        }
    }

    let mut palette: Vec<[u8; 3]> = centres
        .iter()
        .map(|c| c.map(|v| v.round().clamp(0.0, 255.0) as u8))
        .collect();
    palette.sort_by(|a, b| luminance(a).total_cmp(&luminance(b)).then(a.cmp(b)));
    palette.dedup();
    palette
}
