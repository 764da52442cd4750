// THEORY:
// The `ColorTable` is the reference palette every photograph is reduced to. Each
// entry pairs a representative color with the category it stands for. Many
// shades may point at the same category (a stain rarely has a single hue), and
// category `0` is reserved for "nothing to count", typically the background and
// the container walls.
//
// Key architectural principles:
// 1.  **Ordered, Index-Addressed**: The position of an entry is its identity. The
//     classifier writes entry indices into the label image, so the table order
//     must never change once an image has been labelled.
// 2.  **Immutable Value**: A table is built once from a validated profile and then
//     only read. Workers receive their own copy; nothing mutates it afterwards.
// 3.  **RGB Internally**: Colors are stored in RGB order regardless of the order
//     used in the profile file. The profile loader does the swap.

use serde::{Deserialize, Serialize};

/// Category id reserved for pixels that never count as a spot.
pub const BACKGROUND_CATEGORY: u16 = 0;

/// Largest palette a `u16` label image can index.
pub const MAX_PALETTE_LEN: usize = u16::MAX as usize + 1;

/// One representative color and the category it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteEntry {
    /// Red, green, blue.
    pub color: [u8; 3],
    /// `0` for background, otherwise a 1-based index into the category names.
    pub category: u16,
}

impl PaletteEntry {
    pub const fn new(color: [u8; 3], category: u16) -> Self {
        Self { color, category }
    }
}

/// The ordered reference palette.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorTable {
    entries: Vec<PaletteEntry>,
}

impl ColorTable {
    pub fn new(entries: Vec<PaletteEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PaletteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The leading color channels of every entry, in table order.
    pub fn colors(&self) -> Vec<[u8; 3]> {
        self.entries.iter().map(|entry| entry.color).collect()
    }

    /// Highest category id referenced by the table.
    pub fn max_category(&self) -> u16 {
        self.entries
            .iter()
            .map(|entry| entry.category)
            .max()
            .unwrap_or(BACKGROUND_CATEGORY)
    }

    /// Number of distinct non-background categories actually used.
    pub fn category_count(&self) -> usize {
        let mut ids: Vec<u16> = self
            .entries
            .iter()
            .map(|entry| entry.category)
            .filter(|&id| id != BACKGROUND_CATEGORY)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Number of entries mapped to `category`.
    pub fn shades_of(&self, category: u16) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.category == category)
            .count()
    }
}
