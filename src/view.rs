use tracing::{debug, warn};

use crate::aggregator::{self, FileHighlight};
use crate::cluster::{Cluster, ClusterState};
use crate::error::Result;
use crate::extent::{FileId, FileRecord};
use crate::selection::{SelectionController, SelectionState};
use crate::store::{SharedFileModel, SharedStore};
use crate::viewport::{zoom_step, DisplayArea, Viewport, ViewportCalculator, ZoomDirection};

/// Totals for the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridSummary {
    pub clusters: u64,
    pub cluster_size: u64,
    pub free: usize,
    pub fragmented: usize,
    pub nonfragmented: usize,
}

/// Consumer side of the map: owns the grid, the viewport and the selection,
/// and answers the renderer and the input handler.
pub struct FragmapView {
    store: SharedStore,
    calculator: ViewportCalculator,
    area: DisplayArea,
    desired_cluster_size: u64,
    viewport: Option<Viewport>,
    top_row: u64,
    built_cluster_count: Option<u64>,
    regrid_pending: bool,
    selection: SelectionController,
}

impl FragmapView {
    pub fn new(files: SharedFileModel, calculator: ViewportCalculator, desired_cluster_size: u64) -> Self {
        Self {
            store: SharedStore::new(files),
            calculator,
            area: DisplayArea::default(),
            desired_cluster_size: desired_cluster_size.max(1),
            viewport: None,
            top_row: 0,
            built_cluster_count: None,
            regrid_pending: true,
            selection: SelectionController::new(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn calculator(&self) -> &ViewportCalculator {
        &self.calculator
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn desired_cluster_size(&self) -> u64 {
        self.desired_cluster_size
    }

    /// True when the file model changed or the geometry/zoom moved since the last refresh.
    pub fn needs_rebuild(&self) -> bool {
        self.regrid_pending || self.store.files().is_dirty()
    }

    pub fn set_area(&mut self, area: DisplayArea) -> bool {
        if self.area == area {
            return false;
        }
        self.area = area;
        self.regrid_pending = true;
        true
    }

    /// Recompute viewport and grid if anything invalidated them.
    /// Returns whether a repaint is needed.
    pub fn refresh(&mut self) -> Result<bool> {
        if !self.needs_rebuild() {
            return Ok(false);
        }

        let mut guard = self.store.lock_both();
        let device_blocks = guard.files.device_blocks();
        let viewport = match self
            .calculator
            .compute(self.area, device_blocks, self.desired_cluster_size)
        {
            Ok(viewport) => viewport,
            Err(err) => {
                // Nothing to show until the producer reports a device size.
                self.regrid_pending = false;
                self.store.files().take_dirty();
                return Err(err);
            }
        };

        let dirty = self.store.files().take_dirty();
        let regrid = self.built_cluster_count != Some(viewport.cluster_count);
        if dirty || regrid {
            let previous_size = guard.grid.cluster_size();
            match aggregator::rebuild(guard.files.files(), device_blocks, viewport.cluster_count) {
                Ok(grid) => *guard.grid = grid,
                Err(err) => {
                    self.store.files().mark_dirty();
                    return Err(err);
                }
            }
            self.built_cluster_count = Some(viewport.cluster_count);

            let new_size = guard.grid.cluster_size();
            if regrid || new_size != previous_size {
                self.selection.grid_rebuilt(new_size);
            } else {
                self.selection.refresh_drill_down(&guard.grid, &guard.files);
            }
            debug!(
                clusters = guard.grid.len(),
                cluster_size = new_size,
                dirty,
                regrid,
                "grid rebuilt"
            );
        }
        drop(guard);

        let viewport = viewport.with_top_row(self.top_row);
        self.top_row = viewport.top_row;
        self.viewport = Some(viewport);
        self.regrid_pending = false;
        Ok(true)
    }

    /// Clusters inside the viewport, in row-major order.
    pub fn visible_slice(&self) -> Vec<Cluster> {
        let Some(viewport) = self.viewport else {
            return Vec::new();
        };
        self.store
            .lock_grid()
            .slice(viewport.first_visible_cluster(), viewport.visible_cluster_count())
            .to_vec()
    }

    pub fn selection_state(&self) -> &SelectionState {
        self.selection.state()
    }

    /// Files of the selected cluster, sorted by name.
    pub fn drill_down_list(&self) -> Vec<FileRecord> {
        let files = self.store.files().lock();
        self.selection
            .drill_down()
            .iter()
            .filter_map(|id| files.get(*id).cloned())
            .collect()
    }

    /// Visible clusters of each highlighted file. Empty unless files are highlighted.
    pub fn highlight(&self) -> Vec<FileHighlight> {
        let (SelectionState::FilesHighlighted(ids), Some(viewport)) = (self.selection.state(), self.viewport) else {
            return Vec::new();
        };
        let guard = self.store.lock_both();
        let mut highlights =
            aggregator::highlighted_clusters(&guard.files, ids, guard.grid.cluster_size(), guard.grid.len());
        for hl in &mut highlights {
            hl.clusters.retain(|&index| viewport.cell_of(index).is_some());
        }
        highlights
    }

    pub fn on_pointer_interaction(&mut self, x: u32, y: u32) -> bool {
        let Some(viewport) = self.viewport else {
            return false;
        };
        let guard = self.store.lock_both();
        self.selection
            .pointer_interaction(&self.calculator, &viewport, x, y, &guard.grid, &guard.files)
    }

    /// Select a cluster directly by index (keyboard navigation).
    pub fn select_cluster(&mut self, index: u64) -> bool {
        let guard = self.store.lock_both();
        self.selection.select_index(index, &guard.grid, &guard.files)
    }

    pub fn on_file_set_requested(&mut self, ids: Vec<FileId>) -> bool {
        self.selection.file_set_requested(ids)
    }

    pub fn on_zoom_step(&mut self, direction: ZoomDirection) -> bool {
        let cluster_count = match self.viewport {
            Some(viewport) => viewport.cluster_count,
            None => {
                let device_blocks = self.store.files().lock().device_blocks();
                device_blocks.div_ceil(self.desired_cluster_size)
            }
        };
        let next = zoom_step(self.desired_cluster_size, direction, cluster_count);
        if next == self.desired_cluster_size {
            return false;
        }
        debug!(from = self.desired_cluster_size, to = next, "zoom");
        self.desired_cluster_size = next;
        self.regrid_pending = true;
        true
    }

    pub fn on_scroll_offset_changed(&mut self, top_row: u64) -> bool {
        let Some(viewport) = self.viewport else {
            return false;
        };
        let scrolled = viewport.with_top_row(top_row);
        self.apply_scroll(scrolled)
    }

    pub fn scroll_by(&mut self, rows: i64) -> bool {
        let Some(viewport) = self.viewport else {
            return false;
        };
        self.apply_scroll(viewport.scrolled_by(rows))
    }

    fn apply_scroll(&mut self, scrolled: Viewport) -> bool {
        let changed = Some(scrolled) != self.viewport;
        self.top_row = scrolled.top_row;
        self.viewport = Some(scrolled);
        changed
    }

    pub fn reset(&mut self) -> bool {
        self.selection.reset()
    }

    pub fn summary(&self) -> GridSummary {
        let grid = self.store.lock_grid();
        GridSummary {
            clusters: grid.len(),
            cluster_size: grid.cluster_size(),
            free: grid.count_by_state(ClusterState::Free),
            fragmented: grid.count_by_state(ClusterState::Fragmented),
            nonfragmented: grid.count_by_state(ClusterState::NonFragmented),
        }
    }

    /// Refresh, logging instead of returning errors. For draw loops.
    pub fn refresh_logged(&mut self) -> bool {
        match self.refresh() {
            Ok(changed) => changed,
            Err(err) => {
                warn!(%err, "map refresh failed");
                false
            }
        }
    }
}
