// THEORY:
// The `PaletteClassifier` reduces a full-color photograph to a handful of known
// shades. It is the dominant cost of the per-image pipeline: every pixel is
// compared against every palette entry, so it is written as a broadcast over
// whole arrays rather than a per-pixel loop with branches.
//
// Key architectural principles & algorithm steps:
// 1.  **Broadcast Distance**: The image is lifted into an `H x W x 3` array. For
//     each palette entry the squared Euclidean distance of *all* pixels is
//     computed at once (`(pixels - color)^2` summed over the channel axis).
// 2.  **Running Arg-Min**: A parallel `Zip` keeps, per pixel, the smallest
//     distance seen so far and the entry that produced it. Entries are visited in
//     table order and only a strictly smaller distance replaces the current
//     label, so ties always resolve to the lowest index.
// 3.  **Per-Category Renderings**: A category is isolated by blacking out every
//     entry that does not belong to it. The isolated palette is turned into
//     evenly spaced gray levels so that neighbouring shades of the same category
//     end up as far apart in intensity as possible. The threshold-sweeping blob
//     detector downstream depends on that separation.

use crate::core_modules::color_table::ColorTable;
use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array1, Array2, Array3, Axis, Zip};

/// Per-pixel index into the color table.
pub type LabelImage = Array2<u16>;

/// Perceptual weights for red, green, blue.
const LUMINANCE_WEIGHTS: [f64; 3] = [0.2126, 0.7152, 0.0722];

/// Labels every pixel with the index of its nearest palette entry.
pub fn classify(image: &RgbImage, table: &ColorTable) -> LabelImage {
    let (width, height) = image.dimensions();
    let shape = (height as usize, width as usize);

    let pixels = Array3::from_shape_fn((shape.0, shape.1, 3), |(y, x, channel)| {
        f32::from(image.get_pixel(x as u32, y as u32)[channel])
    });
    let mut labels = LabelImage::zeros(shape);
    let mut nearest = Array2::<f32>::from_elem(shape, f32::INFINITY);

    for (index, entry) in table.entries().iter().enumerate() {
        let Ok(index) = u16::try_from(index) else {
            break;
        };
        let reference: Array1<f32> = entry.color.iter().map(|&v| f32::from(v)).collect();
        let delta = &pixels - &reference;
        let distance = (&delta * &delta).sum_axis(Axis(2));

        Zip::from(&mut labels)
            .and(&mut nearest)
            .and(&distance)
            .par_for_each(|label, best, &candidate| {
                if candidate < *best {
                    *best = candidate;
                    *label = index;
                }
            });
    }

    labels
}

/// Copy of the palette colors where every entry outside `categories` is black.
pub fn isolate(table: &ColorTable, categories: &[u16]) -> Vec<[u8; 3]> {
    table
        .entries()
        .iter()
        .map(|entry| {
            if categories.contains(&entry.category) {
                entry.color
            } else {
                [0, 0, 0]
            }
        })
        .collect()
}

pub fn luminance(color: &[u8; 3]) -> f64 {
    color
        .iter()
        .zip(LUMINANCE_WEIGHTS)
        .map(|(&channel, weight)| f64::from(channel) * weight)
        .sum()
}

/// Maps each palette entry to a gray level so that the `k` distinct luminances
/// present land on `round(i * 255 / (k - 1))`, or on `0` when `k == 1`.
pub fn evenly_spaced_gray_palette(palette: &[[u8; 3]]) -> Vec<u8> {
    let luminances: Vec<f64> = palette.iter().map(luminance).collect();

    let mut distinct = luminances.clone();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    let span = distinct.len().saturating_sub(1);

    luminances
        .iter()
        .map(|value| {
            if span == 0 {
                return 0;
            }
            let rank = distinct.partition_point(|shade| shade < value);
            (rank as f64 * 255.0 / span as f64).round_ties_even() as u8
        })
        .collect()
}

/// Paints a label image with one gray level per palette index.
pub fn render(labels: &LabelImage, gray_palette: &[u8]) -> GrayImage {
    let (height, width) = labels.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let label = labels[[y as usize, x as usize]] as usize;
        Luma([gray_palette.get(label).copied().unwrap_or(0)])
    })
}

/// The grayscale view of one category: isolate, spread, paint.
pub fn category_rendering(labels: &LabelImage, table: &ColorTable, category: u16) -> GrayImage {
    let isolated = isolate(table, &[category]);
    let gray_palette = evenly_spaced_gray_palette(&isolated);
    render(labels, &gray_palette)
}
