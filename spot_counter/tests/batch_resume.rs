use image::{Rgb, RgbImage};
use spot_counter::core_modules::detection_settings::DetectionSettings;
use spot_counter::core_modules::discovery::{FilenamePattern, ResolveIssue};
use spot_counter::core_modules::progress_table::{ProgressTable, TableLayout};
use spot_counter::{BatchEngine, BatchError, BatchSettings, SpotConfig, SpotProfile, TableError};
use std::fs;
use std::path::Path;
use std::time::Duration;

const ORANGE: Rgb<u8> = Rgb([255, 128, 0]);
const GREEN: Rgb<u8> = Rgb([0, 200, 40]);

fn names() -> Vec<String> {
    vec!["orange".to_string(), "green".to_string()]
}

fn profile() -> SpotProfile {
    let mut config = SpotConfig::prepopulated(&names());
    config.color_data.table = vec![[0, 0, 0, 0], [255, 128, 0, 1], [0, 200, 40, 2]];
    config.det_params = vec![DetectionSettings::new("orange"), DetectionSettings::new("green")];
    config.circle_search.inner_sigma = 2.0;
    config.circle_search.outer_sigma = 4.0;
    config.validate().unwrap()
}

/// Three orange and two green spots on black.
fn write_photo(path: &Path) {
    let spots = [
        (15, 15, ORANGE),
        (55, 15, ORANGE),
        (15, 60, ORANGE),
        (60, 55, GREEN),
        (35, 35, GREEN),
    ];
    let image = RgbImage::from_fn(80, 80, |x, y| {
        for (cx, cy, color) in spots {
            let (dx, dy) = (x as i32 - cx, y as i32 - cy);
            if dx * dx + dy * dy <= 25 {
                return color;
            }
        }
        Rgb([0, 0, 0])
    });
    image.save(path).unwrap();
}

fn sample_tree(root: &Path, samples: &[&str], depths: &[&str]) {
    for sample in samples {
        fs::create_dir_all(root.join(sample)).unwrap();
        for depth in depths {
            write_photo(&root.join(sample).join(format!("img_{depth}.png")));
        }
    }
}

fn engine(root: &Path, depths: &[&str]) -> BatchEngine {
    let pattern = FilenamePattern::new(r"img_$value(_v\d)?\.png").unwrap();
    let settings = BatchSettings::new(root, depths.iter().map(|d| d.to_string()).collect(), pattern)
        .with_workers(2)
        .with_stagger(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(20));
    BatchEngine::new(profile(), settings)
}

fn load(root: &Path, samples: &[&str], depths: &[&str]) -> ProgressTable {
    let layout = TableLayout::new(names(), depths.iter().map(|d| d.to_string()).collect());
    let samples: Vec<String> = samples.iter().map(|s| s.to_string()).collect();
    ProgressTable::load(root.join("results.csv"), layout, &samples).unwrap()
}

#[test]
fn second_run_dispatches_nothing_and_leaves_the_file_untouched() {
    let root = tempfile::tempdir().unwrap();
    sample_tree(root.path(), &["s1", "s2"], &["10", "20"]);

    let report = engine(root.path(), &["10", "20"]).run().unwrap();
    assert_eq!(report.dispatched, 4);
    assert_eq!(report.recorded, 4);
    assert!(report.failed.is_empty());
    assert!(report.issues.is_empty());

    let table = load(root.path(), &["s1", "s2"], &["10", "20"]);
    let layout = table.layout().clone();
    for row in 2..4 {
        assert_eq!(table.cell(row, layout.count_column(0, 0)), Some("3"));
        assert_eq!(table.cell(row, layout.count_column(1, 1)), Some("2"));
        assert_eq!(table.cell(row, layout.count_column(2, 1)), Some("5"));
        assert_eq!(table.cell(row, layout.percent_column(0, 0)), Some("50"));
        assert_eq!(table.cell(row, layout.percent_column(2, 1)), Some("50"));
    }

    let before = fs::read(root.path().join("results.csv")).unwrap();
    let report = engine(root.path(), &["10", "20"]).run().unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.already_done, 4);
    assert_eq!(fs::read(root.path().join("results.csv")).unwrap(), before);
}

#[test]
fn unreadable_photo_leaves_its_cell_empty_for_the_next_run() {
    let root = tempfile::tempdir().unwrap();
    sample_tree(root.path(), &["s1", "s2"], &["10", "20"]);
    fs::write(root.path().join("s1").join("img_20.png"), b"truncated").unwrap();

    let report = engine(root.path(), &["10", "20"]).run().unwrap();
    assert_eq!(report.recorded, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.sample, 0);
    assert_eq!(report.failed[0].0.depth, 1);

    let table = load(root.path(), &["s1", "s2"], &["10", "20"]);
    assert!(!table.is_processed(0, 1));
    assert!(table.is_processed(0, 0));
    assert_eq!(table.cell(2, table.layout().percent_column(0, 0)), Some(""));

    let report = engine(root.path(), &["10", "20"]).run().unwrap();
    assert_eq!(report.dispatched, 1);
}

#[test]
fn missing_and_ambiguous_files_are_reported() {
    let root = tempfile::tempdir().unwrap();
    sample_tree(root.path(), &["s1", "s2"], &["10", "20"]);
    fs::remove_file(root.path().join("s2").join("img_20.png")).unwrap();
    write_photo(&root.path().join("s1").join("img_10_v2.png"));

    let plan = engine(root.path(), &["10", "20"]).plan().unwrap();
    assert_eq!(plan.jobs.len(), 3);
    assert_eq!(plan.jobs[0].path, root.path().join("s1").join("img_10.png"));
    assert_eq!(
        plan.issues,
        vec![
            ResolveIssue::Ambiguous {
                sample: "s1".into(),
                depth: "10".into(),
                candidates: vec!["img_10.png".into(), "img_10_v2.png".into()],
            },
            ResolveIssue::Missing {
                sample: "s2".into(),
                depth: "20".into(),
            },
        ]
    );

    let report = engine(root.path(), &["10", "20"]).run().unwrap();
    assert_eq!(report.recorded, 3);
    let table = load(root.path(), &["s1", "s2"], &["10", "20"]);
    assert!(!table.is_processed(1, 1));
    assert_eq!(table.cell(3, table.layout().count_column(0, 1)), Some(""));
}

#[test]
fn layout_change_aborts_before_any_work() {
    let root = tempfile::tempdir().unwrap();
    sample_tree(root.path(), &["s1"], &["10", "20", "30"]);
    engine(root.path(), &["10", "20"]).run().unwrap();
    let before = fs::read(root.path().join("results.csv")).unwrap();

    let error = engine(root.path(), &["10", "20", "30"]).run().unwrap_err();
    assert!(matches!(
        error,
        BatchError::Table(TableError::ShapeMismatch { expected_cols: 19, .. })
    ));
    assert_eq!(fs::read(root.path().join("results.csv")).unwrap(), before);
}

#[test]
fn new_sample_folder_is_rejected_against_an_existing_ledger() {
    let root = tempfile::tempdir().unwrap();
    sample_tree(root.path(), &["s1"], &["10"]);
    engine(root.path(), &["10"]).run().unwrap();

    fs::rename(root.path().join("s1"), root.path().join("s9")).unwrap();
    let error = engine(root.path(), &["10"]).run().unwrap_err();
    assert!(matches!(error, BatchError::Table(TableError::UnknownSample(name)) if name == "s9"));
}

#[test]
fn a_run_without_depths_is_refused() {
    let root = tempfile::tempdir().unwrap();
    assert!(matches!(engine(root.path(), &[]).run(), Err(BatchError::NoDepths)));
}
