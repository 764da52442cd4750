// THEORY:
// `DetectionSettings` is the per-category tuning an operator edits in the
// profile: how to sweep the binarization threshold and which shape filters to
// apply. It is deliberately a plain, serializable value. The blob detector never
// sees it directly; it is lowered into a `BlobParams` record once the size of
// the palette is known, because the automatic threshold schedule is derived from
// how many shades the gray rendering can contain.

use crate::core_modules::blob_detector::{BlobParams, ShapeFilter};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Minimum center distance used when a category does not specify one.
pub const DEFAULT_MIN_DISTANCE: f32 = 10.0;

const fn default_blob_color() -> u8 {
    255
}

const fn default_max_threshold() -> u8 {
    255
}

/// How the binarization threshold is swept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdScan {
    /// Derived from the palette size.
    Automatic,
    /// Explicit `[mini, maxi)` range visited every `step`.
    Explicit {
        #[serde(default)]
        mini: u8,
        #[serde(default = "default_max_threshold")]
        maxi: u8,
        step: u8,
    },
}

/// An optional `[mini, maxi)` filter on one blob property.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeFilter {
    pub enabled: bool,
    #[serde(default)]
    pub mini: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxi: Option<f64>,
}

impl RangeFilter {
    pub const fn new(enabled: bool, mini: f64, maxi: Option<f64>) -> Self {
        Self { enabled, mini, maxi }
    }

    fn lower(filter: Option<&Self>) -> ShapeFilter {
        match filter {
            Some(filter) if filter.enabled => ShapeFilter {
                enabled: true,
                min: filter.mini,
                max: filter.maxi.unwrap_or(f64::INFINITY),
            },
            _ => ShapeFilter::disabled(),
        }
    }
}

/// Blob detection tuning for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub color_name: String,
    pub thresh: ThresholdScan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_dist: Option<f32>,
    #[serde(default = "default_blob_color")]
    pub blob_color: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<RangeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circ: Option<RangeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convex: Option<RangeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inertia: Option<RangeFilter>,
}

impl DetectionSettings {
    /// Automatic thresholds and no shape filters.
    pub fn new(color_name: impl Into<String>) -> Self {
        Self {
            color_name: color_name.into(),
            thresh: ThresholdScan::Automatic,
            min_dist: None,
            blob_color: default_blob_color(),
            area: None,
            circ: None,
            convex: None,
            inertia: None,
        }
    }

    /// The starting point offered to operators for a fresh category.
    pub fn prepopulated(color_name: impl Into<String>) -> Self {
        Self {
            min_dist: Some(1.0),
            area: Some(RangeFilter::new(true, 1.0, Some(800.0))),
            circ: Some(RangeFilter::new(true, 0.5, Some(1.0))),
            convex: Some(RangeFilter::new(true, 0.5, Some(1.0))),
            inertia: Some(RangeFilter::new(false, 0.0, Some(1.0))),
            ..Self::new(color_name)
        }
    }

    /// Checks that every supplied maximum exceeds its minimum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ThresholdScan::Explicit { mini, maxi, .. } = self.thresh {
            if maxi <= mini {
                return Err(self.invalid("threshold", f64::from(mini), f64::from(maxi)));
            }
        }
        let filters = [
            ("area", &self.area),
            ("circularity", &self.circ),
            ("convexity", &self.convex),
            ("inertia", &self.inertia),
        ];
        for (field, filter) in filters {
            if let Some(RangeFilter {
                enabled: true,
                mini,
                maxi: Some(maxi),
            }) = filter
            {
                if maxi <= mini {
                    return Err(self.invalid(field, *mini, *maxi));
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, field: &'static str, min: f64, max: f64) -> ConfigError {
        ConfigError::InvalidRange {
            category: self.color_name.clone(),
            field,
            min,
            max,
        }
    }

    /// Lowers these settings into the detector's configuration record.
    /// `shade_count` is the number of entries in the color table.
    pub fn blob_params(&self, shade_count: usize) -> BlobParams {
        let (min_threshold, max_threshold, threshold_step) = match self.thresh {
            ThresholdScan::Automatic => {
                let step = if shade_count == 0 {
                    1
                } else {
                    (255 / shade_count).max(1)
                };
                let margin = (step / 4) as f32;
                (margin, 255.0 - margin, step as f32)
            }
            ThresholdScan::Explicit { mini, maxi, step } => {
                (f32::from(mini), f32::from(maxi), f32::from(step.max(1)))
            }
        };

        BlobParams {
            min_threshold,
            max_threshold,
            threshold_step,
            blob_color: self.blob_color,
            min_dist_between_blobs: self
                .min_dist
                .filter(|distance| *distance > 0.0)
                .unwrap_or(DEFAULT_MIN_DISTANCE),
            area: RangeFilter::lower(self.area.as_ref()),
            circularity: RangeFilter::lower(self.circ.as_ref()),
            convexity: RangeFilter::lower(self.convex.as_ref()),
            inertia: RangeFilter::lower(self.inertia.as_ref()),
            ..BlobParams::default()
        }
    }
}
