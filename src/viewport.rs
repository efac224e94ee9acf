use crate::error::{FragmapError, Result};

/// Multiplicative zoom step applied per discrete input event.
pub const ZOOM_FACTOR: f64 = 1.15;

/// Desired cluster size used before any zoom input.
pub const DEFAULT_CLUSTER_SIZE: u64 = 3500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    /// Smaller clusters, more detail.
    In,
    /// Larger clusters, less detail.
    Out,
}

/// Space available to the map, in display units (pixels, terminal cells).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayArea {
    pub width: u32,
    pub height: u32,
}

impl DisplayArea {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Visible sub-rectangle of the full cluster grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub columns: u64,
    pub rows_visible: u64,
    pub total_rows: u64,
    pub cluster_count: u64,
    pub cluster_size: u64,
    pub top_row: u64,
    pub scrollbar_visible: bool,
}

impl Viewport {
    pub fn max_top_row(&self) -> u64 {
        self.total_rows.saturating_sub(self.rows_visible)
    }

    /// Same viewport scrolled to `top_row`, clamped to `[0, total_rows - rows_visible]`.
    pub fn with_top_row(mut self, top_row: u64) -> Self {
        self.top_row = top_row.min(self.max_top_row());
        self
    }

    pub fn scrolled_by(self, delta: i64) -> Self {
        let top = if delta < 0 {
            self.top_row.saturating_sub(delta.unsigned_abs())
        } else {
            self.top_row.saturating_add(delta as u64)
        };
        self.with_top_row(top)
    }

    pub fn first_visible_cluster(&self) -> u64 {
        self.top_row.saturating_mul(self.columns)
    }

    pub fn visible_cluster_count(&self) -> u64 {
        self.rows_visible.saturating_mul(self.columns)
    }

    /// Screen cell (column, row) of a cluster, `None` when scrolled out of view.
    pub fn cell_of(&self, index: u64) -> Option<(u64, u64)> {
        if self.columns == 0 {
            return None;
        }
        let row = index / self.columns;
        if row < self.top_row || row >= self.top_row + self.rows_visible {
            return None;
        }
        Some((index % self.columns, row - self.top_row))
    }
}

/// Lays the cluster grid out in rows of cells, reserving room for a scroll
/// affordance only when the grid does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportCalculator {
    cell_size: u32,
    scrollbar_width: u32,
}

impl ViewportCalculator {
    pub fn new(cell_size: u32, scrollbar_width: u32) -> Result<Self> {
        if cell_size == 0 {
            return Err(FragmapError::Configuration(
                "cell size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            cell_size,
            scrollbar_width,
        })
    }

    pub fn cell_size(&self) -> u32 {
        self.cell_size
    }

    pub fn scrollbar_width(&self) -> u32 {
        self.scrollbar_width
    }

    fn columns_for(&self, width: u32) -> u64 {
        u64::from((width / self.cell_size).max(1))
    }

    pub fn compute(&self, area: DisplayArea, device_blocks: u64, desired_cluster_size: u64) -> Result<Viewport> {
        if device_blocks == 0 {
            return Err(FragmapError::Configuration(
                "device size must be at least one block".to_string(),
            ));
        }
        if desired_cluster_size == 0 {
            return Err(FragmapError::Configuration(
                "cluster size must be at least 1".to_string(),
            ));
        }

        let rows_visible = u64::from(area.height / self.cell_size);
        let cluster_count = device_blocks.div_ceil(desired_cluster_size);

        // First pass assumes no scrollbar.
        let mut columns = self.columns_for(area.width);
        let mut total_rows = cluster_count.div_ceil(columns);
        let scrollbar_visible = total_rows > rows_visible;

        if scrollbar_visible {
            columns = self.columns_for(area.width.saturating_sub(self.scrollbar_width));
            total_rows = cluster_count.div_ceil(columns);
        }

        Ok(Viewport {
            columns,
            rows_visible,
            total_rows,
            cluster_count,
            cluster_size: desired_cluster_size,
            top_row: 0,
            scrollbar_visible,
        })
    }

    /// Cluster index under a display coordinate, clamped to the last cluster.
    pub fn index_at(&self, viewport: &Viewport, x: u32, y: u32) -> u64 {
        let column = u64::from(x / self.cell_size).min(viewport.columns.saturating_sub(1));
        let row = u64::from(y / self.cell_size).saturating_add(viewport.top_row);
        let index = row.saturating_mul(viewport.columns).saturating_add(column);
        index.min(viewport.cluster_count.saturating_sub(1))
    }
}

/// Next desired cluster size after one zoom event.
///
/// Zooming out always changes the size by at least one block; the result is
/// kept within `[1, max_cluster_size]`. The view passes its current cluster count.
pub fn zoom_step(current: u64, direction: ZoomDirection, max_cluster_size: u64) -> u64 {
    let current = current.max(1);
    let next = match direction {
        ZoomDirection::In => (current as f64 / ZOOM_FACTOR) as u64,
        ZoomDirection::Out => {
            let grown = (current as f64 * ZOOM_FACTOR) as u64;
            if grown == current {
                grown + 1
            } else {
                grown
            }
        }
    };
    next.clamp(1, max_cluster_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> ViewportCalculator {
        ViewportCalculator::new(7, 15).expect("non-zero cell size")
    }

    #[test]
    fn test_fits_without_scrollbar() {
        // 10 clusters in a 20x10 cell area
        let vp = calc().compute(DisplayArea::new(140, 70), 10_000, 1000).expect("valid");
        assert_eq!(vp.columns, 20);
        assert_eq!(vp.rows_visible, 10);
        assert_eq!(vp.total_rows, 1);
        assert_eq!(vp.cluster_count, 10);
        assert!(!vp.scrollbar_visible);
    }

    #[test]
    fn test_scrollbar_reduces_columns() {
        // 100 clusters, 10 columns x 5 rows without scrollbar -> does not fit
        let vp = calc().compute(DisplayArea::new(70, 35), 100, 1).expect("valid");
        assert!(vp.scrollbar_visible);
        assert_eq!(vp.columns, (70 - 15) / 7);
        assert_eq!(vp.total_rows, 100u64.div_ceil(vp.columns));
        assert!(vp.total_rows > vp.rows_visible);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(ViewportCalculator::new(0, 1).is_err());
        assert!(calc().compute(DisplayArea::new(70, 70), 0, 10).is_err());
        assert!(calc().compute(DisplayArea::new(70, 70), 10, 0).is_err());
    }

    #[test]
    fn test_tiny_area_keeps_one_column() {
        let vp = calc().compute(DisplayArea::new(3, 3), 50, 1).expect("valid");
        assert_eq!(vp.columns, 1);
        assert_eq!(vp.total_rows, 50);
    }

    #[test]
    fn test_top_row_clamped() {
        let vp = calc().compute(DisplayArea::new(70, 35), 100, 1).expect("valid");
        let scrolled = vp.with_top_row(1_000);
        assert_eq!(scrolled.top_row, vp.total_rows - vp.rows_visible);
        assert_eq!(scrolled.scrolled_by(-1_000).top_row, 0);
        assert_eq!(vp.scrolled_by(2).top_row, 2);
    }

    #[test]
    fn test_index_at_clamps_past_last_cluster() {
        let c = calc();
        let vp = c.compute(DisplayArea::new(140, 70), 10_000, 1000).expect("valid");
        assert_eq!(c.index_at(&vp, 0, 0), 0);
        assert_eq!(c.index_at(&vp, 7 * 3 + 2, 0), 3);
        assert_eq!(c.index_at(&vp, 139, 69), 9);
    }

    #[test]
    fn test_index_at_uses_top_row() {
        let c = ViewportCalculator::new(1, 1).expect("non-zero cell size");
        let vp = c
            .compute(DisplayArea::new(11, 4), 1000, 1)
            .expect("valid")
            .with_top_row(5);
        assert_eq!(vp.columns, 10);
        assert_eq!(c.index_at(&vp, 2, 1), (5 + 1) * 10 + 2);
    }

    #[test]
    fn test_index_at_right_margin_stays_on_row() {
        let c = ViewportCalculator::new(1, 1).expect("non-zero cell size");
        let vp = Viewport {
            columns: 10,
            rows_visible: 5,
            total_rows: 100,
            cluster_count: 1000,
            cluster_size: 1,
            top_row: 0,
            scrollbar_visible: true,
        };
        // x = 12 lies past column 9, over the scrollbar.
        assert_eq!(c.index_at(&vp, 12, 2), 29);
        assert_eq!(c.index_at(&vp, 10, 0), 9);
    }

    #[test]
    fn test_cell_of() {
        let c = ViewportCalculator::new(1, 1).expect("non-zero cell size");
        let vp = c.compute(DisplayArea::new(11, 4), 1000, 1).expect("valid").with_top_row(2);
        assert_eq!(vp.cell_of(25), Some((5, 0)));
        assert_eq!(vp.cell_of(5), None);
        assert_eq!(vp.cell_of(60), None);
    }

    #[test]
    fn test_zoom_out_from_default() {
        let next = zoom_step(DEFAULT_CLUSTER_SIZE, ZoomDirection::Out, u64::MAX);
        // 3500 * 1.15 truncates to 4024 in f64.
        assert_eq!(next, 4024);
        assert_ne!(next, DEFAULT_CLUSTER_SIZE);
    }

    #[test]
    fn test_zoom_out_never_stalls() {
        for size in 1..=20 {
            let next = zoom_step(size, ZoomDirection::Out, u64::MAX);
            assert!(next > size, "zoom out from {} stalled", size);
        }
    }

    #[test]
    fn test_zoom_bounds() {
        assert_eq!(zoom_step(1, ZoomDirection::In, 100), 1);
        assert_eq!(zoom_step(3043, ZoomDirection::In, 10_000), 2646);
        assert_eq!(zoom_step(95, ZoomDirection::Out, 100), 100);
        assert_eq!(zoom_step(100, ZoomDirection::Out, 100), 100);
        // 3500 blocks per cluster on a 10,000 block device is 3 clusters.
        assert_eq!(zoom_step(DEFAULT_CLUSTER_SIZE, ZoomDirection::Out, 3), 3);
        assert_eq!(zoom_step(DEFAULT_CLUSTER_SIZE, ZoomDirection::In, 3), 3);
    }
}
