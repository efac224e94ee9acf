use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::extent::{FileId, FileRecord};
use crate::scanner::{file_id, file_key, probe_file, ExtentSource};
use crate::store::SharedFileModel;

enum Change {
    Upsert(FileRecord),
    Remove(String),
}

/// Files a watch may publish: regular files on the watched root's device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchScope {
    root_device: u64,
}

impl WatchScope {
    pub fn for_root(root: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(root)?;
        Ok(Self {
            root_device: file_key(root, &metadata).0,
        })
    }

    pub fn root_device(&self) -> u64 {
        self.root_device
    }
}

/// Keeps the shared file model in step with changes under a directory.
/// Watching stops when the value is dropped.
pub struct ModelWatcher {
    scope: WatchScope,
    _watcher: RecommendedWatcher,
}

impl ModelWatcher {
    pub fn spawn(root: &Path, source: Arc<dyn ExtentSource>, shared: SharedFileModel) -> Result<Self> {
        let scope = WatchScope::for_root(root)?;
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                apply_event(&event, source.as_ref(), &shared, scope);
            }
            Err(err) => warn!(%err, "watch error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(root = %root.display(), device = scope.root_device, "watching");
        Ok(Self {
            scope,
            _watcher: watcher,
        })
    }

    pub fn scope(&self) -> WatchScope {
        self.scope
    }
}

/// Name of another live hard link to `id` already in the model, if any.
fn linked_name(shared: &SharedFileModel, id: FileId, path: &Path) -> Option<String> {
    let existing = shared.lock().get(id)?.name.clone();
    if Path::new(&existing) == path {
        return None;
    }
    let metadata = std::fs::symlink_metadata(&existing).ok()?;
    (file_id(Path::new(&existing), &metadata) == id).then_some(existing)
}

fn change_for(
    path: &Path,
    removed: bool,
    source: &dyn ExtentSource,
    shared: &SharedFileModel,
    scope: WatchScope,
) -> Option<Change> {
    let name = path.to_string_lossy().into_owned();
    if removed {
        return Some(Change::Remove(name));
    }
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() => {
            if file_key(path, &metadata).0 != scope.root_device {
                trace!(path = %path.display(), "other filesystem");
                return None;
            }
            let id = file_id(path, &metadata);
            let mut record = probe_file(source, path, id)?;
            // One record per inode, under the first name seen.
            if let Some(existing) = linked_name(shared, id, path) {
                record.name = existing;
            }
            Some(Change::Upsert(record))
        }
        Ok(_) => None,
        Err(err) if err.kind() == ErrorKind::NotFound => Some(Change::Remove(name)),
        Err(err) => {
            debug!(path = %path.display(), %err, "stat failed");
            None
        }
    }
}

/// Apply one filesystem event to the model. Returns the number of files changed;
/// the model is only marked dirty when that is non-zero.
pub fn apply_event(
    event: &Event,
    source: &dyn ExtentSource,
    shared: &SharedFileModel,
    scope: WatchScope,
) -> usize {
    let removed = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => return 0,
    };

    let changes: Vec<Change> = event
        .paths
        .iter()
        .filter_map(|path| change_for(path, removed, source, shared, scope))
        .collect();
    if changes.is_empty() {
        return 0;
    }

    shared.update(|model| {
        let mut applied = 0;
        for change in changes {
            match change {
                Change::Upsert(record) => {
                    // A replaced file keeps its name but may get a new inode.
                    if let Some(old) = model.id_for_path(&record.name) {
                        if old != record.id {
                            model.remove(old);
                        }
                    }
                    model.upsert(record);
                    applied += 1;
                }
                Change::Remove(name) => {
                    if model.remove_path(&name).is_some() {
                        applied += 1;
                    }
                }
            }
        }
        applied
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, FileModel};
    use notify::event::{CreateKind, RemoveKind};

    struct OneBlockSource;

    impl ExtentSource for OneBlockSource {
        fn device_blocks(&self, _root: &Path) -> Result<u64> {
            Ok(1000)
        }

        fn file_extents(&self, _path: &Path) -> Result<Vec<Extent>> {
            Ok(vec![Extent::new(7, 1)])
        }
    }

    #[test]
    fn test_create_then_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("new.bin");
        std::fs::write(&path, b"data").expect("write");
        let scope = WatchScope::for_root(dir.path()).expect("scope");

        let shared = SharedFileModel::new(FileModel::new(1000));
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        assert_eq!(apply_event(&create, &OneBlockSource, &shared, scope), 1);
        assert_eq!(shared.lock().len(), 1);

        shared.take_dirty();
        std::fs::remove_file(&path).expect("remove");
        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path);
        assert_eq!(apply_event(&remove, &OneBlockSource, &shared, scope), 1);
        assert!(shared.lock().is_empty());
        assert!(shared.is_dirty());
    }

    #[test]
    fn test_directories_and_access_events_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scope = WatchScope::for_root(dir.path()).expect("scope");
        let shared = SharedFileModel::new(FileModel::new(1000));
        shared.take_dirty();

        let create = Event::new(EventKind::Create(CreateKind::Folder)).add_path(dir.path().to_path_buf());
        assert_eq!(apply_event(&create, &OneBlockSource, &shared, scope), 0);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(dir.path().to_path_buf());
        assert_eq!(apply_event(&access, &OneBlockSource, &shared, scope), 0);
        assert!(!shared.is_dirty());
    }

    #[test]
    fn test_files_on_other_device_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mounted.bin");
        std::fs::write(&path, b"data").expect("write");
        let local = WatchScope::for_root(dir.path()).expect("scope");
        let elsewhere = WatchScope {
            root_device: local.root_device().wrapping_add(1),
        };

        let shared = SharedFileModel::new(FileModel::new(1000));
        shared.take_dirty();
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path);
        assert_eq!(apply_event(&create, &OneBlockSource, &shared, elsewhere), 0);
        assert!(shared.lock().is_empty());
        assert!(!shared.is_dirty());
    }

    #[cfg(unix)]
    #[test]
    fn test_hard_link_kept_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.bin");
        let second = dir.path().join("b.bin");
        std::fs::write(&first, b"data").expect("write");
        std::fs::hard_link(&first, &second).expect("hard link");
        let scope = WatchScope::for_root(dir.path()).expect("scope");

        let shared = SharedFileModel::new(FileModel::new(1000));
        for path in [&first, &second] {
            let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.to_path_buf());
            apply_event(&create, &OneBlockSource, &shared, scope);
        }
        let modify = Event::new(EventKind::Modify(notify::event::ModifyKind::Any)).add_path(second);

        apply_event(&modify, &OneBlockSource, &shared, scope);
        let model = shared.lock();
        assert_eq!(model.len(), 1);
        assert_eq!(model.files()[0].name, first.to_string_lossy());
    }
}
