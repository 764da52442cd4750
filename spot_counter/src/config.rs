// THEORY:
// Configuration comes in two shapes. `SpotConfig` is what the operator edits: a
// JSON document mirroring the profile files produced by the palette tooling,
// permissive about optional sections. `SpotProfile` is what the engine runs on:
// validated once, immutable, and cheap to clone into every worker. Nothing in
// the engine ever looks a setting up by name at run time.
//
// `BatchSettings` describes one run (where the photographs are, which depths to
// expect, where the ledger lives, how many workers to start). It is built by the
// front end, usually from command-line flags layered over the profile's
// `defaults` section.

use crate::core_modules::circle_locator::CircleSearch;
use crate::core_modules::color_table::{ColorTable, MAX_PALETTE_LEN, PaletteEntry};
use crate::core_modules::detection_settings::DetectionSettings;
use crate::core_modules::discovery::FilenamePattern;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the ledger written into the image root when no path is given.
pub const DEFAULT_PROGRESS_FILE: &str = "results.csv";
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(2500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Channel order of the colors in a profile's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

impl ChannelOrder {
    fn to_rgb(self, channels: [u8; 3]) -> [u8; 3] {
        match self {
            Self::Rgb => channels,
            Self::Bgr => [channels[2], channels[1], channels[0]],
        }
    }
}

/// Category names and the raw color table, `[c0, c1, c2, category]` per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryData {
    pub names: Vec<String>,
    #[serde(default)]
    pub channel_order: ChannelOrder,
    pub table: Vec<[u16; 4]>,
}

/// Fallbacks for run parameters not given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// The on-disk profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotConfig {
    /// Photograph the palette was sampled from. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<PathBuf>,
    pub color_data: CategoryData,
    pub det_params: Vec<DetectionSettings>,
    #[serde(default)]
    pub circle_search: CircleSearch,
    #[serde(default)]
    pub defaults: BatchDefaults,
}

/// Validated, immutable inputs of the per-image pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotProfile {
    pub color_table: ColorTable,
    pub names: Vec<String>,
    pub settings: Vec<DetectionSettings>,
    pub circle_search: CircleSearch,
}

impl SpotProfile {
    pub fn category_count(&self) -> usize {
        self.names.len()
    }
}

impl SpotConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let mut text = self.to_json()?;
        text.push('\n');
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A starting profile: black background plus one placeholder gray per
    /// category, automatic thresholds and lenient shape filters.
    pub fn prepopulated(names: &[String]) -> Self {
        let mut table = vec![[0, 0, 0, 0]];
        for (index, _) in names.iter().enumerate() {
            let level = (255 * (index + 1) / names.len()) as u16;
            table.push([level, level, level, index as u16 + 1]);
        }
        Self {
            reference_image: None,
            color_data: CategoryData {
                names: names.to_vec(),
                channel_order: ChannelOrder::Rgb,
                table,
            },
            det_params: names.iter().map(DetectionSettings::prepopulated).collect(),
            circle_search: CircleSearch::default(),
            defaults: BatchDefaults::default(),
        }
    }

    /// A starting profile built on a clustered palette, darkest shade first.
    /// The darkest shade becomes background and every other shade its own
    /// category. Names beyond the supplied ones are `color_<n>`; surplus names
    /// are dropped.
    pub fn from_palette(names: &[String], palette: &[[u8; 3]]) -> Result<Self, ConfigError> {
        if palette.len() < 2 {
            return Err(ConfigError::TooFewShades(palette.len()));
        }
        let categories = palette.len() - 1;
        let names: Vec<String> = (0..categories)
            .map(|index| {
                names
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("color_{}", index + 1))
            })
            .collect();

        let mut config = Self::prepopulated(&names);
        config.color_data.table = palette
            .iter()
            .enumerate()
            .map(|(index, c)| [u16::from(c[0]), u16::from(c[1]), u16::from(c[2]), index as u16])
            .collect();
        Ok(config)
    }

    pub fn validate(&self) -> Result<SpotProfile, ConfigError> {
        let data = &self.color_data;
        if data.table.is_empty() {
            return Err(ConfigError::EmptyPalette);
        }
        if data.table.len() > MAX_PALETTE_LEN {
            return Err(ConfigError::PaletteTooLarge(data.table.len()));
        }

        let mut entries = Vec::with_capacity(data.table.len());
        for (row, raw) in data.table.iter().enumerate() {
            let mut channels = [0u8; 3];
            for (column, channel) in channels.iter_mut().enumerate() {
                *channel = u8::try_from(raw[column]).map_err(|_| ConfigError::ChannelOutOfRange {
                    row,
                    column,
                    value: raw[column],
                })?;
            }
            let category = raw[3];
            if usize::from(category) > data.names.len() {
                return Err(ConfigError::CategoryOutOfRange {
                    row,
                    category,
                    names: data.names.len(),
                });
            }
            entries.push(PaletteEntry::new(data.channel_order.to_rgb(channels), category));
        }

        if self.det_params.len() != data.names.len() {
            return Err(ConfigError::SettingsCountMismatch {
                names: data.names.len(),
                settings: self.det_params.len(),
            });
        }
        for settings in &self.det_params {
            settings.validate()?;
        }

        let search = &self.circle_search;
        if search.max_radius < search.min_radius {
            return Err(ConfigError::InvalidRange {
                category: "circle_search".to_string(),
                field: "radius",
                min: f64::from(search.min_radius),
                max: f64::from(search.max_radius),
            });
        }

        Ok(SpotProfile {
            color_table: ColorTable::new(entries),
            names: data.names.clone(),
            settings: self.det_params.clone(),
            circle_search: self.circle_search.clone(),
        })
    }
}

/// Parameters of one batch run.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub image_root: PathBuf,
    pub depths: Vec<String>,
    pub pattern: FilenamePattern,
    pub progress_path: PathBuf,
    pub workers: usize,
    /// Pause between worker starts.
    pub stagger: Duration,
    pub poll_interval: Duration,
}

impl BatchSettings {
    pub fn new(
        image_root: impl Into<PathBuf>,
        depths: Vec<String>,
        pattern: FilenamePattern,
    ) -> Self {
        let image_root = image_root.into();
        Self {
            progress_path: image_root.join(DEFAULT_PROGRESS_FILE),
            image_root,
            depths,
            pattern,
            workers: num_cpus::get(),
            stagger: DEFAULT_STAGGER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_progress_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_path = path.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection_settings::ThresholdScan;

    const PROFILE: &str = r#"{
        "reference_image": "ref.png",
        "color_data": {
            "names": ["orange", "green"],
            "channel_order": "bgr",
            "table": [[0, 0, 0, 0], [0, 128, 255, 1], [40, 200, 0, 2], [10, 140, 250, 1]]
        },
        "det_params": [
            {"color_name": "orange", "thresh": "automatic", "min_dist": 1.0,
             "area": {"enabled": true, "mini": 1.0, "maxi": 800.0}},
            {"color_name": "green", "thresh": {"explicit": {"mini": 10, "maxi": 200, "step": 5}}}
        ],
        "circle_search": {"min_radius": 500},
        "defaults": {"depths": ["10", "20"], "regex": "img_$value\\.jpg"}
    }"#;

    fn config() -> SpotConfig {
        serde_json::from_str(PROFILE).unwrap()
    }

    #[test]
    fn profile_is_normalised_to_rgb() {
        let profile = config().validate().unwrap();
        assert_eq!(profile.category_count(), 2);
        assert_eq!(profile.color_table.len(), 4);
        assert_eq!(profile.color_table.entries()[1], PaletteEntry::new([255, 128, 0], 1));
        assert_eq!(profile.color_table.entries()[2].color, [0, 200, 40]);
        assert_eq!(profile.circle_search.min_radius, 500);
        assert_eq!(profile.circle_search.max_radius, 1500);
        assert!(matches!(profile.settings[1].thresh, ThresholdScan::Explicit { step: 5, .. }));
    }

    #[test]
    fn defaults_section_is_optional() {
        let config = config();
        assert_eq!(config.defaults.depths, vec!["10", "20"]);
        assert_eq!(config.defaults.regex.as_deref(), Some("img_$value\\.jpg"));
        assert!(config.defaults.image_dir.is_none());

        let mut value: serde_json::Value = serde_json::from_str(PROFILE).unwrap();
        value.as_object_mut().unwrap().remove("defaults");
        value.as_object_mut().unwrap().remove("circle_search");
        let bare: SpotConfig = serde_json::from_value(value).unwrap();
        assert_eq!(bare.defaults, BatchDefaults::default());
        assert_eq!(bare.circle_search, CircleSearch::default());
    }

    #[test]
    fn invalid_tables_are_rejected() {
        let mut config = config();
        config.color_data.table[2][1] = 256;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChannelOutOfRange { row: 2, column: 1, value: 256 })
        ));

        let mut config = self::config();
        config.color_data.table[3][3] = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CategoryOutOfRange { row: 3, category: 3, names: 2 })
        ));

        let mut config = self::config();
        config.color_data.table.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPalette)));

        let mut config = self::config();
        config.det_params.pop();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SettingsCountMismatch { names: 2, settings: 1 })
        ));

        let mut config = self::config();
        config.circle_search.max_radius = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRange { field: "radius", .. })
        ));
    }

    #[test]
    fn prepopulated_profile_validates_and_survives_json() {
        let names = vec!["red".to_string(), "blue".to_string()];
        let config = SpotConfig::prepopulated(&names);
        let profile = config.validate().unwrap();
        assert_eq!(profile.color_table.category_count(), 2);
        assert_eq!(config.color_data.table[1], [127, 127, 127, 1]);
        assert_eq!(config.color_data.table[2], [255, 255, 255, 2]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        config.write_to(&path).unwrap();
        assert_eq!(SpotConfig::from_path(&path).unwrap(), config);
    }

    #[test]
    fn clustered_palette_seeds_one_category_per_shade() {
        let palette = [[0, 0, 0], [220, 30, 30], [40, 220, 220], [250, 250, 250]];
        let config = SpotConfig::from_palette(&["spots".to_string()], &palette).unwrap();
        assert_eq!(config.color_data.names, vec!["spots", "color_2", "color_3"]);
        assert_eq!(config.color_data.table[0], [0, 0, 0, 0]);
        assert_eq!(config.color_data.table[2], [40, 220, 220, 2]);
        assert_eq!(config.det_params.len(), 3);
        assert_eq!(config.det_params[2].color_name, "color_3");

        let profile = config.validate().unwrap();
        assert_eq!(profile.color_table.category_count(), 3);

        let surplus = ["a".to_string(), "b".to_string(), "c".to_string()];
        let config = SpotConfig::from_palette(&surplus, &palette[..2]).unwrap();
        assert_eq!(config.color_data.names, vec!["a"]);

        assert!(matches!(
            SpotConfig::from_palette(&surplus, &palette[..1]),
            Err(ConfigError::TooFewShades(1))
        ));
    }

    #[test]
    fn unreadable_profile_reports_its_path() {
        let error = SpotConfig::from_path(Path::new("/no/such/profile.json")).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
        assert!(error.to_string().contains("/no/such/profile.json"));
    }

    #[test]
    fn batch_settings_default_to_the_image_root() {
        let pattern = FilenamePattern::new("img_$value").unwrap();
        let settings = BatchSettings::new("/data/run", vec!["1".into()], pattern).with_workers(0);
        assert_eq!(settings.progress_path, PathBuf::from("/data/run/results.csv"));
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.stagger, DEFAULT_STAGGER);
    }
}
