// THEORY:
// The `ProgressTable` is both the deliverable and the checkpoint. Operators open
// it in a spreadsheet; the batch engine reads it back to learn which photographs
// still need counting. A cell is either a number or empty, and empty means "not
// computed yet". A real count of zero is never written as empty, and an empty
// cell is never read as zero.
//
// Key architectural principles:
// 1.  **Deterministic Layout**: The column of every value is a pure function of
//     the category count `C` and depth count `D`. There are `C + 1` count blocks
//     (one per category, then "all categories") followed by the same number of
//     percentage blocks, each `D` columns wide, after the sample-name column.
// 2.  **Strict Shape**: A file that does not have exactly the expected number of
//     rows and columns is rejected before anything else happens. The layout is
//     positional, so guessing would silently shift results into the wrong
//     columns.
// 3.  **Gated Percentages**: A block's percentages are written only once every
//     depth of that block holds a count for the sample. Until then they stay
//     empty. A block whose counts sum to zero gets `NaN`.
// 4.  **Whole-File Atomic Saves**: Every save rewrites the entire table into a
//     temporary sibling file and renames it over the original, so the file on
//     disk is always a complete, earlier-or-current state.

use crate::error::TableError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Rows above the first sample: block labels, then depth values.
pub const HEADER_ROWS: usize = 2;

const EMPTY: &str = "";
const CORNER_LABEL: &str = "sample\\depth";
const ALL_CATEGORIES: &str = "all categories";

/// Column arithmetic for a given set of category names and depths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    names: Vec<String>,
    depths: Vec<String>,
}

impl TableLayout {
    pub fn new(names: Vec<String>, depths: Vec<String>) -> Self {
        Self { names, depths }
    }

    pub fn category_count(&self) -> usize {
        self.names.len()
    }

    pub fn depth_count(&self) -> usize {
        self.depths.len()
    }

    pub fn depths(&self) -> &[String] {
        &self.depths
    }

    /// Category blocks plus the "all categories" block.
    pub fn block_count(&self) -> usize {
        self.names.len() + 1
    }

    /// Index of the "all categories" block.
    pub fn sum_block(&self) -> usize {
        self.names.len()
    }

    pub fn columns(&self) -> usize {
        1 + 2 * self.block_count() * self.depth_count()
    }

    pub fn rows(&self, samples: usize) -> usize {
        samples + HEADER_ROWS
    }

    pub fn count_column(&self, block: usize, depth: usize) -> usize {
        1 + block * self.depth_count() + depth
    }

    pub fn percent_column(&self, block: usize, depth: usize) -> usize {
        1 + (self.block_count() + block) * self.depth_count() + depth
    }

    fn block_label(&self, block: usize) -> &str {
        self.names
            .get(block)
            .map(String::as_str)
            .unwrap_or(ALL_CATEGORIES)
    }

    fn header_rows(&self) -> [Vec<String>; HEADER_ROWS] {
        let columns = self.columns();
        let mut labels = vec![EMPTY.to_string(); columns];
        let mut depths = vec![EMPTY.to_string(); columns];
        depths[0] = CORNER_LABEL.to_string();

        for block in 0..self.block_count() {
            labels[self.count_column(block, 0)] = format!("Count {}", self.block_label(block));
            labels[self.percent_column(block, 0)] = format!("Percent {}", self.block_label(block));
            for (d, depth) in self.depths.iter().enumerate() {
                depths[self.count_column(block, d)] = depth.clone();
                depths[self.percent_column(block, d)] = depth.clone();
            }
        }
        [labels, depths]
    }
}

/// The file-backed ledger of per-sample, per-depth results.
#[derive(Debug, Clone)]
pub struct ProgressTable {
    path: PathBuf,
    layout: TableLayout,
    rows: Vec<Vec<String>>,
}

impl ProgressTable {
    /// A fresh table with one empty row per sample. Nothing is written yet.
    pub fn create(path: impl Into<PathBuf>, layout: TableLayout, samples: &[String]) -> Self {
        let columns = layout.columns();
        let mut rows: Vec<Vec<String>> = layout.header_rows().into_iter().collect();
        for sample in samples {
            let mut row = vec![EMPTY.to_string(); columns];
            row[0] = sample.clone();
            rows.push(row);
        }
        Self {
            path: path.into(),
            layout,
            rows,
        }
    }

    /// Reads an existing table and checks it against `layout` and `samples`.
    pub fn load(
        path: impl Into<PathBuf>,
        layout: TableLayout,
        samples: &[String],
    ) -> Result<Self, TableError> {
        let path = path.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .map_err(|source| TableError::Csv {
                path: path.clone(),
                source,
            })?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| TableError::Csv {
                path: path.clone(),
                source,
            })?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let table = Self { path, layout, rows };
        table.check_shape(samples.len())?;
        table.check_samples(samples)?;
        table.check_cells()?;
        debug!(
            path = %table.path.display(),
            samples = table.sample_count(),
            "progress table loaded"
        );
        Ok(table)
    }

    /// Loads `path` if it exists, otherwise creates a fresh table for it.
    pub fn open_or_create(
        path: impl Into<PathBuf>,
        layout: TableLayout,
        samples: &[String],
    ) -> Result<Self, TableError> {
        let path = path.into();
        if path.exists() {
            Self::load(path, layout, samples)
        } else {
            Ok(Self::create(path, layout, samples))
        }
    }

    fn check_shape(&self, samples: usize) -> Result<(), TableError> {
        let expected_rows = self.layout.rows(samples);
        let expected_cols = self.layout.columns();
        let offending_row = self
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != expected_cols)
            .map(|(index, row)| (index, row.len()));

        if self.rows.len() != expected_rows || offending_row.is_some() {
            return Err(TableError::ShapeMismatch {
                path: self.path.clone(),
                expected_rows,
                expected_cols,
                found_rows: self.rows.len(),
                offending_row,
            });
        }
        Ok(())
    }

    fn check_samples(&self, samples: &[String]) -> Result<(), TableError> {
        match samples.iter().find(|name| self.sample_row(name).is_none()) {
            Some(name) => Err(TableError::UnknownSample(name.clone())),
            None => Ok(()),
        }
    }

    fn check_cells(&self) -> Result<(), TableError> {
        let count_columns = 1..self.layout.percent_column(0, 0);
        for (r, row) in self.rows.iter().enumerate().skip(HEADER_ROWS) {
            for (c, value) in row.iter().enumerate().skip(1) {
                if value.is_empty() {
                    continue;
                }
                let valid = if count_columns.contains(&c) {
                    value.parse::<u64>().is_ok()
                } else {
                    value.parse::<f64>().is_ok()
                };
                if !valid {
                    return Err(TableError::InvalidCell {
                        row: r,
                        column: c,
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Rewrites the whole table atomically.
    pub fn save(&self) -> Result<(), TableError> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let io_error = |source: std::io::Error| TableError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = tempfile::NamedTempFile::new_in(directory).map_err(io_error)?;
        {
            let mut writer = csv::Writer::from_writer(&mut file);
            for row in &self.rows {
                writer.write_record(row).map_err(|source| TableError::Csv {
                    path: self.path.clone(),
                    source,
                })?;
            }
            writer.flush().map_err(io_error)?;
        }
        file.flush().map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(&self.path)
            .map_err(|error| io_error(error.error))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn sample_count(&self) -> usize {
        self.rows.len().saturating_sub(HEADER_ROWS)
    }

    pub fn sample_names(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .skip(HEADER_ROWS)
            .map(|row| row.first().map(String::as_str).unwrap_or(EMPTY))
    }

    /// 0-based sample index of the row named `name`.
    pub fn sample_row(&self, name: &str) -> Option<usize> {
        self.sample_names().position(|sample| sample == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    pub fn set_cell(&mut self, row: usize, column: usize, value: impl Into<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = value.into();
        }
    }

    fn sample_cell(&self, sample: usize, column: usize) -> &str {
        self.cell(sample + HEADER_ROWS, column).unwrap_or(EMPTY)
    }

    /// True when every category count and the sum are present.
    pub fn is_processed(&self, sample: usize, depth: usize) -> bool {
        (0..self.layout.block_count()).all(|block| {
            let column = self.layout.count_column(block, depth);
            !self.sample_cell(sample, column).is_empty()
        })
    }

    /// Every `(sample, depth)` not yet processed, row-major.
    pub fn pending(&self) -> Vec<(usize, usize)> {
        let mut pending = Vec::new();
        for sample in 0..self.sample_count() {
            for depth in 0..self.layout.depth_count() {
                if !self.is_processed(sample, depth) {
                    pending.push((sample, depth));
                }
            }
        }
        pending
    }

    /// Writes one image's counts, their sum, and any percentages now unlocked.
    pub fn record(
        &mut self,
        sample: usize,
        depth: usize,
        counts: &[u64],
    ) -> Result<(), TableError> {
        if sample >= self.sample_count() || depth >= self.layout.depth_count() {
            return Err(TableError::OutOfBounds { sample, depth });
        }
        if counts.len() != self.layout.category_count() {
            return Err(TableError::CountMismatch {
                sample,
                depth,
                expected: self.layout.category_count(),
                found: counts.len(),
            });
        }

        let row = sample + HEADER_ROWS;
        for (block, count) in counts.iter().enumerate() {
            let column = self.layout.count_column(block, depth);
            self.set_cell(row, column, count.to_string());
        }
        let total: u64 = counts.iter().sum();
        let column = self.layout.count_column(self.layout.sum_block(), depth);
        self.set_cell(row, column, total.to_string());

        self.refresh_percentages(sample);
        Ok(())
    }

    /// Computes the percentages of every block of `sample` whose counts are
    /// complete across all depths. Incomplete blocks are left untouched.
    pub fn refresh_percentages(&mut self, sample: usize) {
        let row = sample + HEADER_ROWS;
        for block in 0..self.layout.block_count() {
            let values: Option<Vec<f64>> = (0..self.layout.depth_count())
                .map(|depth| {
                    self.sample_cell(sample, self.layout.count_column(block, depth))
                        .parse::<f64>()
                        .ok()
                })
                .collect();
            let Some(values) = values else {
                continue;
            };

            let total: f64 = values.iter().sum();
            for (depth, value) in values.iter().enumerate() {
                let percent = if total == 0.0 {
                    f64::NAN
                } else {
                    100.0 * value / total
                };
                let column = self.layout.percent_column(block, depth);
                self.set_cell(row, column, percent.to_string());
            }
        }
    }
}
