use std::ops::RangeInclusive;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::cluster::{Cluster, ClusterGrid};
use crate::error::{FragmapError, Result};
use crate::extent::{Extent, FileId, FileModel, FileRecord};

/// Blocks per cluster when `device_blocks` is split into `cluster_count` clusters.
pub fn cluster_size_for(device_blocks: u64, cluster_count: u64) -> Result<u64> {
    if cluster_count == 0 {
        return Err(FragmapError::Configuration(
            "cluster count must be at least 1".to_string(),
        ));
    }
    if device_blocks == 0 {
        return Err(FragmapError::Configuration(
            "device size must be at least one block".to_string(),
        ));
    }
    Ok(device_blocks.div_ceil(cluster_count))
}

/// Inclusive range of cluster indices an extent overlaps. `None` for empty extents.
pub fn extent_cluster_range(extent: &Extent, cluster_size: u64) -> Option<RangeInclusive<u64>> {
    if cluster_size == 0 {
        return None;
    }
    let last_block = extent.last_block()?;
    Some(extent.start / cluster_size..=last_block / cluster_size)
}

fn check_extent(file: &FileRecord, extent: &Extent, device_blocks: u64) -> Result<()> {
    let past_end = match extent.last_block() {
        Some(last) => last >= device_blocks,
        None => extent.start >= device_blocks,
    };
    if past_end {
        return Err(FragmapError::InconsistentExtent {
            file: file.name.clone(),
            start: extent.start,
            length: extent.length,
            device_blocks,
        });
    }
    Ok(())
}

/// Aggregate per-file extents into a grid of `cluster_count` equal spans.
///
/// The grid holds `ceil(device_blocks / cluster_size)` clusters, which can be
/// fewer than `cluster_count` when the division leaves trailing clusters
/// with no blocks. Extents outside the device are logged and skipped.
pub fn rebuild(files: &[FileRecord], device_blocks: u64, cluster_count: u64) -> Result<ClusterGrid> {
    let started = Instant::now();
    let cluster_size = cluster_size_for(device_blocks, cluster_count)?;
    let len = device_blocks.div_ceil(cluster_size);
    let mut clusters: Vec<Cluster> = (0..len).map(Cluster::new).collect();
    let mut skipped = 0usize;

    for file in files {
        let fragmented = file.fragmented();
        for extent in &file.extents {
            if let Err(err) = check_extent(file, extent, device_blocks) {
                warn!(%err, "skipping extent");
                skipped += 1;
                continue;
            }
            let Some(range) = extent_cluster_range(extent, cluster_size) else {
                trace!(file = %file.name, start = extent.start, "empty extent");
                continue;
            };

            for index in range {
                let cluster = &mut clusters[index as usize];
                cluster.free = false;
                // All extents of one file are visited back to back, so a
                // repeat of this file can only be the last entry.
                if cluster.files.last() != Some(&file.id) {
                    cluster.files.push(file.id);
                }
                if fragmented {
                    cluster.fragmented = true;
                }
            }
        }
    }

    debug!(
        clusters = len,
        cluster_size,
        files = files.len(),
        skipped,
        elapsed_us = started.elapsed().as_micros() as u64,
        "fill clusters"
    );

    Ok(ClusterGrid::from_parts(cluster_size, device_blocks, clusters))
}

/// Clusters touched by one highlighted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHighlight {
    pub id: FileId,
    pub fragmented: bool,
    pub clusters: Vec<u64>,
}

/// Expand the extents of each requested file into the sorted cluster indices
/// it occupies. Unknown ids are dropped, and extents `rebuild` would skip are
/// skipped here too; indices at or beyond `cluster_count` are not reported.
pub fn highlighted_clusters(
    model: &FileModel,
    ids: &[FileId],
    cluster_size: u64,
    cluster_count: u64,
) -> Vec<FileHighlight> {
    let device_blocks = model.device_blocks();
    ids.iter()
        .filter_map(|id| model.get(*id))
        .map(|file| {
            let mut clusters: Vec<u64> = file
                .extents
                .iter()
                .filter(|extent| check_extent(file, extent, device_blocks).is_ok())
                .filter_map(|extent| extent_cluster_range(extent, cluster_size))
                .flat_map(|range| {
                    let end = (*range.end()).min(cluster_count.saturating_sub(1));
                    *range.start()..=end
                })
                .filter(|&index| index < cluster_count)
                .collect();
            clusters.sort_unstable();
            clusters.dedup();
            FileHighlight {
                id: file.id,
                fragmented: file.fragmented(),
                clusters,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterState;

    fn file(id: u64, extents: &[(u64, u64)]) -> FileRecord {
        FileRecord::new(
            FileId(id),
            format!("/f{}", id),
            extents.iter().map(|&(s, l)| Extent::new(s, l)).collect(),
        )
    }

    #[test]
    fn test_reference_scenario() {
        let files = vec![file(1, &[(0, 500)]), file(2, &[(500, 200), (5000, 200)])];
        let grid = rebuild(&files, 10_000, 10).expect("valid configuration");

        assert_eq!(grid.cluster_size(), 1000);
        assert_eq!(grid.len(), 10);
        // File 1 alone would leave cluster 0 non-fragmented; file 2 shares it.
        assert_eq!(grid.clusters()[0].state(), ClusterState::Fragmented);
        assert_eq!(grid.clusters()[0].files, vec![FileId(1), FileId(2)]);
        assert_eq!(grid.clusters()[5].state(), ClusterState::Fragmented);
        assert_eq!(grid.clusters()[9].state(), ClusterState::Free);

        let alone = rebuild(&files[..1], 10_000, 10).expect("valid configuration");
        assert_eq!(alone.clusters()[0].state(), ClusterState::NonFragmented);
    }

    #[test]
    fn test_zero_cluster_count_is_configuration_error() {
        let result = rebuild(&[], 100, 0);
        assert!(matches!(result, Err(FragmapError::Configuration(_))));
        let result = rebuild(&[], 0, 10);
        assert!(matches!(result, Err(FragmapError::Configuration(_))));
    }

    #[test]
    fn test_extent_spanning_clusters() {
        let files = vec![file(1, &[(150, 300)])];
        let grid = rebuild(&files, 1000, 10).expect("valid configuration");
        let occupied: Vec<u64> = grid
            .clusters()
            .iter()
            .filter(|c| !c.free)
            .map(|c| c.index)
            .collect();
        assert_eq!(occupied, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_file_listed_once_per_cluster() {
        let files = vec![file(1, &[(0, 10), (50, 10), (20, 10)])];
        let grid = rebuild(&files, 1000, 10).expect("valid configuration");
        assert_eq!(grid.clusters()[0].files, vec![FileId(1)]);
    }

    #[test]
    fn test_out_of_device_extents_are_skipped() {
        let files = vec![
            file(1, &[(2000, 10)]),
            file(2, &[(990, 20)]),
            file(3, &[(10, 5)]),
        ];
        let grid = rebuild(&files, 1000, 10).expect("skips, does not fail");
        assert_eq!(grid.clusters()[9].state(), ClusterState::Free);
        assert_eq!(grid.clusters()[0].files, vec![FileId(3)]);
    }

    #[test]
    fn test_empty_extent_ignored() {
        let files = vec![file(1, &[(10, 0)])];
        let grid = rebuild(&files, 1000, 10).expect("valid configuration");
        assert_eq!(grid.count_by_state(ClusterState::Free), 10);
    }

    #[test]
    fn test_grid_shorter_than_requested_count() {
        // 10 blocks in 6 clusters: size 2, so only 5 clusters carry blocks.
        let grid = rebuild(&[], 10, 6).expect("valid configuration");
        assert_eq!(grid.cluster_size(), 2);
        assert_eq!(grid.len(), 5);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let files = vec![file(1, &[(0, 700), (900, 3)]), file(2, &[(650, 100)])];
        let a = rebuild(&files, 5000, 17).expect("valid configuration");
        let b = rebuild(&files, 5000, 17).expect("valid configuration");
        assert_eq!(a, b);
    }

    #[test]
    fn test_highlighted_clusters() {
        let model = FileModel::from_files(
            10_000,
            vec![file(1, &[(500, 200), (5000, 200), (5100, 50)]), file(2, &[(0, 10)])],
        );
        let hl = highlighted_clusters(&model, &[FileId(1), FileId(99)], 1000, 10);
        assert_eq!(hl.len(), 1);
        assert_eq!(hl[0].clusters, vec![0, 5]);
        assert!(hl[0].fragmented);
    }

    #[test]
    fn test_highlight_skips_out_of_device_extents() {
        let files = vec![file(1, &[(10, 5), (990, 20)])];
        let grid = rebuild(&files, 1000, 10).expect("valid configuration");
        assert_eq!(grid.clusters()[9].state(), ClusterState::Free);

        let model = FileModel::from_files(1000, files);
        let hl = highlighted_clusters(&model, &[FileId(1)], 100, 10);
        assert_eq!(hl[0].clusters, vec![0]);
    }
}
