use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Contiguous run of device blocks belonging to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Last block covered by the extent, `None` for an empty extent.
    pub fn last_block(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.start.saturating_add(self.length - 1))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

/// A file as reported by the scanner: identity, name and its extents in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub severity: f64,
    pub extents: Vec<Extent>,
}

impl FileRecord {
    pub fn new(id: FileId, name: impl Into<String>, extents: Vec<Extent>) -> Self {
        Self {
            id,
            name: name.into(),
            severity: 0.0,
            extents,
        }
    }

    pub fn with_severity(mut self, severity: f64) -> Self {
        self.severity = severity;
        self
    }

    pub fn fragmented(&self) -> bool {
        self.extents.len() > 1
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// Split the name at the last `/` into (directory, file name).
    pub fn dir_and_base(&self) -> (&str, &str) {
        match self.name.rfind('/') {
            Some(pos) => (&self.name[..pos], &self.name[pos + 1..]),
            None => ("", self.name.as_str()),
        }
    }
}

/// The scanner-owned collection of files on one device.
#[derive(Debug, Clone, Default)]
pub struct FileModel {
    device_blocks: u64,
    files: Vec<FileRecord>,
    by_id: HashMap<FileId, usize>,
}

impl FileModel {
    pub fn new(device_blocks: u64) -> Self {
        Self {
            device_blocks,
            files: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn from_files(device_blocks: u64, files: Vec<FileRecord>) -> Self {
        let mut model = Self::new(device_blocks);
        for file in files {
            model.upsert(file);
        }
        model
    }

    pub fn device_blocks(&self) -> u64 {
        self.device_blocks
    }

    pub fn set_device_blocks(&mut self, device_blocks: u64) {
        self.device_blocks = device_blocks;
    }

    /// Insert a file, replacing any previous record with the same id.
    pub fn upsert(&mut self, file: FileRecord) {
        match self.by_id.get(&file.id) {
            Some(&slot) => self.files[slot] = file,
            None => {
                self.by_id.insert(file.id, self.files.len());
                self.files.push(file);
            }
        }
    }

    pub fn remove(&mut self, id: FileId) -> Option<FileRecord> {
        let slot = self.by_id.remove(&id)?;
        let removed = self.files.swap_remove(slot);
        // The former last element now lives in `slot`.
        if let Some(moved) = self.files.get(slot) {
            self.by_id.insert(moved.id, slot);
        }
        Some(removed)
    }

    pub fn remove_path(&mut self, name: &str) -> Option<FileRecord> {
        let id = self.files.iter().find(|f| f.name == name)?.id;
        self.remove(id)
    }

    pub fn id_for_path(&self, name: &str) -> Option<FileId> {
        self.files.iter().find(|f| f.name == name).map(|f| f.id)
    }

    pub fn get(&self, id: FileId) -> Option<&FileRecord> {
        self.by_id.get(&id).map(|&slot| &self.files[slot])
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn fragmented_count(&self) -> usize {
        self.files.iter().filter(|f| f.fragmented()).count()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: u64, name: &str, extents: &[(u64, u64)]) -> FileRecord {
        FileRecord::new(
            FileId(id),
            name,
            extents.iter().map(|&(s, l)| Extent::new(s, l)).collect(),
        )
    }

    #[test]
    fn test_fragmented_flag() {
        assert!(!file(1, "/a", &[(0, 10)]).fragmented());
        assert!(file(2, "/b", &[(0, 10), (20, 5)]).fragmented());
        assert!(!file(3, "/c", &[]).fragmented());
    }

    #[test]
    fn test_last_block() {
        assert_eq!(Extent::new(10, 5).last_block(), Some(14));
        assert_eq!(Extent::new(10, 0).last_block(), None);
        assert_eq!(Extent::new(u64::MAX, 3).last_block(), Some(u64::MAX));
    }

    #[test]
    fn test_dir_and_base() {
        let f = file(1, "/home/user/notes.txt", &[]);
        assert_eq!(f.dir_and_base(), ("/home/user", "notes.txt"));

        let bare = file(2, "notes.txt", &[]);
        assert_eq!(bare.dir_and_base(), ("", "notes.txt"));
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut model = FileModel::new(100);
        model.upsert(file(7, "/x", &[(0, 1)]));
        model.upsert(file(7, "/x", &[(0, 1), (5, 1)]));

        assert_eq!(model.len(), 1);
        assert!(model.get(FileId(7)).map(FileRecord::fragmented).unwrap_or(false));
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut model = FileModel::from_files(
            100,
            vec![file(1, "/a", &[]), file(2, "/b", &[]), file(3, "/c", &[])],
        );

        let removed = model.remove(FileId(1));
        assert_eq!(removed.map(|f| f.name), Some("/a".to_string()));
        assert_eq!(model.len(), 2);
        assert_eq!(model.get(FileId(3)).map(|f| f.name.as_str()), Some("/c"));
        assert_eq!(model.get(FileId(2)).map(|f| f.name.as_str()), Some("/b"));
        assert!(model.get(FileId(1)).is_none());

        assert!(model.remove_path("/c").is_some());
        assert_eq!(model.id_for_path("/b"), Some(FileId(2)));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_fragmented_count() {
        let model = FileModel::from_files(
            100,
            vec![file(1, "/a", &[(0, 1)]), file(2, "/b", &[(2, 1), (9, 1)])],
        );
        assert_eq!(model.fragmented_count(), 1);
    }
}
