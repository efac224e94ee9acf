use dashmap::DashMap;
use jwalk::WalkDir;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::hash_map::DefaultHasher;
use std::fs::Metadata;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::extent::{Extent, FileId, FileRecord};
use crate::store::SharedFileModel;

const PROGRESS_EMIT_INTERVAL_MS: u64 = 100;

/// Files probed per published batch. Each batch marks the model dirty.
const PUBLISH_BATCH: usize = 512;

const BLOCKS_PER_MIB_FALLBACK: f64 = 256.0;

/// Where extents come from. The map never talks to the filesystem directly.
pub trait ExtentSource: Send + Sync {
    fn device_blocks(&self, root: &Path) -> Result<u64>;
    fn file_extents(&self, path: &Path) -> Result<Vec<Extent>>;

    /// Size of one block in bytes, used to derive severity.
    fn block_size(&self) -> u64 {
        4096
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub total_files: u64,
    pub fragmented_files: u64,
    pub skipped_files: u64,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Discovering,
    Probing,
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub discovered_entries: u64,
    pub processed_entries: u64,
    pub total_entries: Option<u64>,
    pub total_files: u64,
    pub fragmented_files: u64,
}

impl ScanProgress {
    pub fn fraction(&self) -> Option<f32> {
        match self.phase {
            ScanPhase::Discovering => None,
            ScanPhase::Probing => {
                let total = self.total_entries?;
                if total == 0 {
                    Some(1.0)
                } else {
                    Some((self.processed_entries as f32 / total as f32).clamp(0.0, 1.0))
                }
            }
        }
    }
}

pub type ProgressReporter = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Fragmentation per MiB of allocated space; zero for a contiguous file.
pub fn severity(extents: &[Extent], block_size: u64) -> f64 {
    if extents.len() <= 1 {
        return 0.0;
    }
    let blocks: u64 = extents.iter().map(|e| e.length).sum();
    let blocks_per_mib = if block_size == 0 {
        BLOCKS_PER_MIB_FALLBACK
    } else {
        (1024.0 * 1024.0) / block_size as f64
    };
    let mib = (blocks as f64 / blocks_per_mib).max(1.0);
    (extents.len() - 1) as f64 / mib
}

fn path_hash(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// (device, inode) on unix; the path hash stands in elsewhere.
#[cfg(unix)]
pub(crate) fn file_key(path: &Path, metadata: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    let _ = path;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
pub(crate) fn file_key(path: &Path, _metadata: &Metadata) -> (u64, u64) {
    (0, path_hash(path))
}

/// Probe one file into a record, or `None` when the file is unusable.
pub fn probe_file(source: &dyn ExtentSource, path: &Path, id: FileId) -> Option<FileRecord> {
    match source.file_extents(path) {
        Ok(extents) => {
            let severity = severity(&extents, source.block_size());
            Some(FileRecord::new(id, path.to_string_lossy(), extents).with_severity(severity))
        }
        Err(err) => {
            debug!(path = %path.display(), %err, "probe failed");
            None
        }
    }
}

/// Id of a file as the scanner and the watcher assign it.
pub fn file_id(path: &Path, metadata: &Metadata) -> FileId {
    let (_, ino) = file_key(path, metadata);
    if ino == 0 {
        FileId(path_hash(path))
    } else {
        FileId(ino)
    }
}

/// Parallel walker that feeds the shared file model.
pub struct FragScanner {
    file_count: Arc<AtomicU64>,
    fragmented_count: Arc<AtomicU64>,
    skipped_count: Arc<AtomicU64>,
}

impl FragScanner {
    pub fn new() -> Self {
        Self {
            file_count: Arc::new(AtomicU64::new(0)),
            fragmented_count: Arc::new(AtomicU64::new(0)),
            skipped_count: Arc::new(AtomicU64::new(0)),
        }
    }

    fn emit_progress(reporter: &Option<ProgressReporter>, progress: ScanProgress) {
        if let Some(cb) = reporter {
            cb(progress);
        }
    }

    fn processing_parallelism() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cores * 2).clamp(4, 64)
    }

    fn progress(
        &self,
        phase: ScanPhase,
        discovered_entries: u64,
        processed_entries: u64,
        total_entries: Option<u64>,
    ) -> ScanProgress {
        ScanProgress {
            phase,
            discovered_entries,
            processed_entries,
            total_entries,
            total_files: self.file_count.load(Ordering::Relaxed),
            fragmented_files: self.fragmented_count.load(Ordering::Relaxed),
        }
    }

    /// Walk `root`, probe every regular file on the same device, and publish
    /// the results into `shared` batch by batch.
    pub fn scan_with_progress<P: AsRef<Path>>(
        &mut self,
        root: P,
        source: &dyn ExtentSource,
        shared: &SharedFileModel,
        reporter: Option<ProgressReporter>,
    ) -> Result<ScanStats> {
        let root = root.as_ref();
        let start = Instant::now();

        self.file_count.store(0, Ordering::Relaxed);
        self.fragmented_count.store(0, Ordering::Relaxed);
        self.skipped_count.store(0, Ordering::Relaxed);

        let device_blocks = source.device_blocks(root)?;
        let root_device = std::fs::metadata(root).map(|m| file_key(root, &m).0)?;
        shared.update(|model| {
            model.clear();
            model.set_device_blocks(device_blocks);
        });
        info!(root = %root.display(), device_blocks, "scan started");

        let scan_threads = Self::processing_parallelism();
        let walker = WalkDir::new(root)
            .skip_hidden(false)
            .follow_links(false)
            .parallelism(jwalk::Parallelism::RayonNewPool(scan_threads))
            .into_iter();

        let mut entries = Vec::new();
        let mut discovered_entries = 0u64;
        let mut discovery_last_emit = Instant::now();

        for entry in walker.flatten() {
            discovered_entries = discovered_entries.saturating_add(1);
            if entry.file_type().is_file() {
                entries.push(entry.path());
            }
            if discovery_last_emit.elapsed().as_millis() as u64 >= PROGRESS_EMIT_INTERVAL_MS {
                discovery_last_emit = Instant::now();
                Self::emit_progress(
                    &reporter,
                    self.progress(ScanPhase::Discovering, discovered_entries, 0, None),
                );
            }
        }

        let total_entries = entries.len() as u64;
        Self::emit_progress(
            &reporter,
            self.progress(ScanPhase::Probing, discovered_entries, 0, Some(total_entries)),
        );

        let seen: DashMap<(u64, u64), ()> = DashMap::new();
        let processed = AtomicU64::new(0);

        let probe_batch = |batch: &[std::path::PathBuf]| -> Vec<FileRecord> {
            batch
                .par_iter()
                .filter_map(|path| {
                    processed.fetch_add(1, Ordering::Relaxed);
                    let metadata = std::fs::symlink_metadata(path).ok()?;
                    let key = file_key(path, &metadata);
                    if key.0 != root_device || seen.insert(key, ()).is_some() {
                        // Other filesystem, or a hard link we already counted.
                        return None;
                    }
                    let Some(record) = probe_file(source, path, file_id(path, &metadata)) else {
                        self.skipped_count.fetch_add(1, Ordering::Relaxed);
                        return None;
                    };
                    self.file_count.fetch_add(1, Ordering::Relaxed);
                    if record.fragmented() {
                        self.fragmented_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(record)
                })
                .collect()
        };

        let pool = ThreadPoolBuilder::new().num_threads(scan_threads).build().ok();
        for batch in entries.chunks(PUBLISH_BATCH) {
            let records = match pool.as_ref() {
                Some(pool) => pool.install(|| probe_batch(batch)),
                None => probe_batch(batch),
            };
            shared.update(|model| {
                for record in records {
                    model.upsert(record);
                }
            });
            Self::emit_progress(
                &reporter,
                self.progress(
                    ScanPhase::Probing,
                    discovered_entries,
                    processed.load(Ordering::Relaxed),
                    Some(total_entries),
                ),
            );
        }

        let stats = ScanStats {
            total_files: self.file_count.load(Ordering::Relaxed),
            fragmented_files: self.fragmented_count.load(Ordering::Relaxed),
            skipped_files: self.skipped_count.load(Ordering::Relaxed),
            duration_ms: start.elapsed().as_millis(),
        };
        info!(
            files = stats.total_files,
            fragmented = stats.fragmented_files,
            skipped = stats.skipped_files,
            duration_ms = stats.duration_ms as u64,
            "scan finished"
        );
        Ok(stats)
    }
}

impl Default for FragScanner {
    fn default() -> Self {
        Self::new()
    }
}
