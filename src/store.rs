//! Concurrency boundary between the scanner and the map.
//!
//! Two independently lockable resources live here: the cluster grid, owned by
//! the store, and the file model, shared with the producer. Whenever both are
//! needed the grid lock is taken first, then the file lock. [`SharedStore::lock_both`]
//! is the only place that acquires the pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cluster::ClusterGrid;
use crate::extent::FileModel;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FileModelCell {
    model: Mutex<FileModel>,
    dirty: AtomicBool,
}

/// Handle to the scanner-owned file model plus its dirty flag.
#[derive(Clone)]
pub struct SharedFileModel {
    inner: Arc<FileModelCell>,
}

impl SharedFileModel {
    /// A fresh handle starts dirty so the first read builds a grid.
    pub fn new(model: FileModel) -> Self {
        Self {
            inner: Arc::new(FileModelCell {
                model: Mutex::new(model),
                dirty: AtomicBool::new(true),
            }),
        }
    }

    /// Read access. Callers that also need the grid must go through
    /// [`SharedStore::lock_both`] instead.
    pub fn lock(&self) -> MutexGuard<'_, FileModel> {
        lock(&self.inner.model)
    }

    /// Mutate the model and flag it for re-aggregation.
    pub fn update<R>(&self, f: impl FnOnce(&mut FileModel) -> R) -> R {
        let mut model = lock(&self.inner.model);
        let result = f(&mut model);
        // Set while still holding the lock so a concurrent rebuild either
        // sees this change or sees the flag.
        self.inner.dirty.store(true, Ordering::Release);
        result
    }

    pub fn replace(&self, model: FileModel) {
        self.update(|current| *current = model);
    }

    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.inner.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Both locks, acquired grid first. Fields drop in declaration order.
pub struct StoreGuard<'a> {
    pub grid: MutexGuard<'a, ClusterGrid>,
    pub files: MutexGuard<'a, FileModel>,
}

pub struct SharedStore {
    grid: Mutex<ClusterGrid>,
    files: SharedFileModel,
}

impl SharedStore {
    pub fn new(files: SharedFileModel) -> Self {
        Self {
            grid: Mutex::new(ClusterGrid::default()),
            files,
        }
    }

    pub fn files(&self) -> &SharedFileModel {
        &self.files
    }

    pub fn lock_grid(&self) -> MutexGuard<'_, ClusterGrid> {
        lock(&self.grid)
    }

    pub fn lock_both(&self) -> StoreGuard<'_> {
        let grid = lock(&self.grid);
        let files = self.files.lock();
        StoreGuard { grid, files }
    }
}
