//! Merged-cell resolution.
//!
//! Vendor headers are full of merged ranges: a date spanning four price
//! columns, a region label spanning two header rows. `MergedCellMap` makes
//! every coordinate inside a merge read as its top-left master cell.

use crate::workbook::{CellValue, Sheet, SheetKey};
use std::collections::HashMap;
use std::sync::Arc;

/// Coordinate -> master coordinate for every non-master cell of every merge.
#[derive(Debug, Default)]
pub struct MergedCellMap {
    masters: HashMap<(u32, u32), (u32, u32)>,
}

impl MergedCellMap {
    /// O(regions x area) construction.
    pub fn build(sheet: &Sheet) -> Self {
        let mut masters = HashMap::new();
        for region in &sheet.merges {
            let master = (region.first_row, region.first_col);
            for row in region.first_row..=region.last_row {
                for col in region.first_col..=region.last_col {
                    if (row, col) != master {
                        masters.insert((row, col), master);
                    }
                }
            }
        }
        Self { masters }
    }

    pub fn master_of(&self, row: u32, col: u32) -> (u32, u32) {
        self.masters.get(&(row, col)).copied().unwrap_or((row, col))
    }

    /// Value at (row, col) with merges applied.
    pub fn resolve<'a>(&self, sheet: &'a Sheet, row: u32, col: u32) -> &'a CellValue {
        let (r, c) = self.master_of(row, col);
        sheet.cell(r, c)
    }

    pub fn is_merged(&self, row: u32, col: u32) -> bool {
        self.masters.contains_key(&(row, col))
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }
}

/// Per-batch cache of merge maps keyed by sheet identity.
///
/// Lives inside the import context rather than in process-global state and is
/// cleared when the batch finishes.
#[derive(Debug, Default)]
pub struct MergeCache {
    maps: HashMap<SheetKey, Arc<MergedCellMap>>,
    builds: usize,
}

impl MergeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&mut self, sheet: &Sheet) -> Arc<MergedCellMap> {
        if let Some(map) = self.maps.get(&sheet.key) {
            return Arc::clone(map);
        }
        self.builds += 1;
        let map = Arc::new(MergedCellMap::build(sheet));
        self.maps.insert(sheet.key, Arc::clone(&map));
        map
    }

    pub fn invalidate(&mut self, key: &SheetKey) {
        self.maps.remove(key);
    }

    pub fn clear(&mut self) {
        self.maps.clear();
    }

    /// How many maps were constructed, as opposed to served from cache.
    pub fn builds(&self) -> usize {
        self.builds
    }
}
