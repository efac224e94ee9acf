use std::ops::Range;

use crate::extent::FileId;

/// Occupancy classification of one cluster. Exactly one holds per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Free,
    Fragmented,
    NonFragmented,
}

/// Aggregated, fixed-size span of device blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub index: u64,
    pub free: bool,
    pub fragmented: bool,
    /// Files touching this cluster, each listed once, in file model order.
    pub files: Vec<FileId>,
}

impl Cluster {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            free: true,
            fragmented: false,
            files: Vec::new(),
        }
    }

    pub fn state(&self) -> ClusterState {
        if self.free {
            ClusterState::Free
        } else if self.fragmented {
            ClusterState::Fragmented
        } else {
            ClusterState::NonFragmented
        }
    }
}

/// Ordered sequence of clusters covering the whole device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterGrid {
    cluster_size: u64,
    device_blocks: u64,
    clusters: Vec<Cluster>,
}

impl ClusterGrid {
    pub(crate) fn from_parts(cluster_size: u64, device_blocks: u64, clusters: Vec<Cluster>) -> Self {
        Self {
            cluster_size,
            device_blocks,
            clusters,
        }
    }

    /// Blocks per cluster; zero for a grid that was never built.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn device_blocks(&self) -> u64 {
        self.device_blocks
    }

    pub fn len(&self) -> u64 {
        self.clusters.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn get(&self, index: u64) -> Option<&Cluster> {
        usize::try_from(index).ok().and_then(|i| self.clusters.get(i))
    }

    /// Device blocks covered by a cluster, clipped at the device end.
    pub fn span(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.cluster_size).min(self.device_blocks);
        let end = start.saturating_add(self.cluster_size).min(self.device_blocks);
        start..end
    }

    /// Clamp an arbitrary index to the last valid cluster.
    pub fn clamp_index(&self, index: u64) -> Option<u64> {
        if self.clusters.is_empty() {
            None
        } else {
            Some(index.min(self.len() - 1))
        }
    }

    /// Up to `count` clusters starting at `first`; empty when `first` is past the end.
    pub fn slice(&self, first: u64, count: u64) -> &[Cluster] {
        let len = self.clusters.len();
        let start = usize::try_from(first).unwrap_or(len).min(len);
        let end = usize::try_from(first.saturating_add(count))
            .unwrap_or(len)
            .min(len);
        &self.clusters[start..end]
    }

    pub fn count_by_state(&self, state: ClusterState) -> usize {
        self.clusters.iter().filter(|c| c.state() == state).count()
    }
}
