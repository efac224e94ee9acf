use tracing::debug;

use crate::cluster::ClusterGrid;
use crate::extent::{FileId, FileModel};
use crate::viewport::{Viewport, ViewportCalculator};

/// What the map is currently focused on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectionState {
    #[default]
    Overview,
    ClusterSelected(u64),
    FilesHighlighted(Vec<FileId>),
}

/// Drill-down state machine: grid cell -> occupying files -> highlighted extents.
#[derive(Debug, Default)]
pub struct SelectionController {
    state: SelectionState,
    /// Files of the selected cluster, sorted by name.
    drill_down: Vec<FileId>,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn drill_down(&self) -> &[FileId] {
        &self.drill_down
    }

    /// Map a display coordinate to a cluster and select it.
    /// Returns whether a repaint is needed.
    pub fn pointer_interaction(
        &mut self,
        calculator: &ViewportCalculator,
        viewport: &Viewport,
        x: u32,
        y: u32,
        grid: &ClusterGrid,
        files: &FileModel,
    ) -> bool {
        let index = calculator.index_at(viewport, x, y);
        self.select_index(index, grid, files)
    }

    /// Select a cluster by index, clamped to the grid. No-op when it is
    /// already the selected cluster.
    pub fn select_index(&mut self, index: u64, grid: &ClusterGrid, files: &FileModel) -> bool {
        let Some(index) = grid.clamp_index(index) else {
            return false;
        };
        if self.state == SelectionState::ClusterSelected(index) {
            return false;
        }
        self.state = SelectionState::ClusterSelected(index);
        self.drill_down = Self::occupants_by_name(index, grid, files);
        true
    }

    /// The user picked specific files from the drill-down list. The ids are a
    /// set: order and repeats do not matter.
    pub fn file_set_requested(&mut self, mut ids: Vec<FileId>) -> bool {
        ids.sort_unstable();
        ids.dedup();
        let next = SelectionState::FilesHighlighted(ids);
        if self.state == next {
            return false;
        }
        self.state = next;
        true
    }

    /// The grid was rebuilt with a new cluster size; earlier indices mean nothing now.
    pub fn grid_rebuilt(&mut self, new_cluster_size: u64) -> bool {
        debug!(new_cluster_size, "selection reset after regrid");
        self.reset()
    }

    pub fn reset(&mut self) -> bool {
        let changed = self.state != SelectionState::Overview;
        self.state = SelectionState::Overview;
        self.drill_down.clear();
        changed
    }

    /// Recompute the drill-down list after a rebuild with unchanged cluster size.
    pub fn refresh_drill_down(&mut self, grid: &ClusterGrid, files: &FileModel) {
        match std::mem::take(&mut self.state) {
            SelectionState::ClusterSelected(index) => {
                if let Some(clamped) = grid.clamp_index(index) {
                    self.state = SelectionState::ClusterSelected(clamped);
                    self.drill_down = Self::occupants_by_name(clamped, grid, files);
                } else {
                    self.drill_down.clear();
                }
            }
            SelectionState::FilesHighlighted(mut ids) => {
                ids.retain(|id| files.get(*id).is_some());
                self.drill_down.retain(|id| files.get(*id).is_some());
                self.state = SelectionState::FilesHighlighted(ids);
            }
            SelectionState::Overview => {}
        }
    }

    fn occupants_by_name(index: u64, grid: &ClusterGrid, files: &FileModel) -> Vec<FileId> {
        let Some(cluster) = grid.get(index) else {
            return Vec::new();
        };
        let mut occupants: Vec<_> = cluster.files.iter().filter_map(|id| files.get(*id)).collect();
        occupants.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        occupants.into_iter().map(|f| f.id).collect()
    }
}
