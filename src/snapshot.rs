use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{FragmapError, Result};
use crate::extent::{FileModel, FileRecord};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of a scanned extent model.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    device_blocks: u64,
    files: Vec<FileRecord>,
}

pub fn read_from<R: Read>(reader: R) -> Result<FileModel> {
    let snapshot: Snapshot = serde_json::from_reader(reader)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(FragmapError::Configuration(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    if snapshot.device_blocks == 0 {
        return Err(FragmapError::Configuration(
            "snapshot has a zero-block device".to_string(),
        ));
    }
    Ok(FileModel::from_files(snapshot.device_blocks, snapshot.files))
}

pub fn write_to<W: Write>(writer: W, model: &FileModel) -> Result<()> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        device_blocks: model.device_blocks(),
        files: model.files().to_vec(),
    };
    serde_json::to_writer(writer, &snapshot)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<FileModel> {
    read_from(BufReader::new(File::open(path)?))
}

pub fn save(path: &Path, model: &FileModel) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_to(&mut writer, model)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, FileId};

    #[test]
    fn test_reads_hand_written_snapshot() {
        let json = r#"{
            "version": 1,
            "device_blocks": 10000,
            "files": [
                {"id": 1, "name": "/a", "severity": 0.0, "extents": [{"start": 0, "length": 500}]},
                {"id": 2, "name": "/b", "severity": 2.5,
                 "extents": [{"start": 500, "length": 200}, {"start": 5000, "length": 200}]}
            ]
        }"#;
        let model = read_from(json.as_bytes()).expect("valid snapshot");
        assert_eq!(model.device_blocks(), 10_000);
        assert_eq!(model.len(), 2);
        let b = model.get(FileId(2)).expect("file 2");
        assert!(b.fragmented());
        assert_eq!(b.extents[1], Extent::new(5000, 200));
    }

    #[test]
    fn test_rejects_zero_device() {
        let json = r#"{"version": 1, "device_blocks": 0, "files": []}"#;
        assert!(matches!(read_from(json.as_bytes()), Err(FragmapError::Configuration(_))));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let json = r#"{"version": 9, "device_blocks": 10, "files": []}"#;
        assert!(read_from(json.as_bytes()).is_err());
    }

    #[test]
    fn test_save_then_load_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("extents.json");
        let model = FileModel::from_files(
            64,
            vec![FileRecord::new(FileId(5), "/x/y", vec![Extent::new(3, 4)]).with_severity(0.5)],
        );

        save(&path, &model).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.files(), model.files());
        assert_eq!(loaded.device_blocks(), 64);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(read_from(&b"{not json"[..]), Err(FragmapError::Json(_))));
    }
}
