use std::path::Path;

use crate::error::Result;
use crate::extent::Extent;
use crate::scanner::ExtentSource;

/// Physical extents from the kernel's FIEMAP interface, in units of the
/// filesystem fragment size reported by `statvfs`.
#[derive(Debug, Clone, Copy)]
pub struct FiemapSource {
    block_size: u64,
    device_blocks: u64,
}

impl FiemapSource {
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

/// Merge physically adjacent runs the kernel reported separately.
fn push_merged(extents: &mut Vec<Extent>, next: Extent) {
    if let Some(last) = extents.last_mut() {
        if last.start.saturating_add(last.length) == next.start {
            last.length += next.length;
            return;
        }
    }
    extents.push(next);
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use crate::error::FragmapError;
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::AsRawFd;

    const FS_IOC_FIEMAP: u64 = 0xC020_660B;
    const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
    const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
    const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;
    const FIEMAP_EXTENT_DELALLOC: u32 = 0x0000_0004;
    const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0000_0200;
    const SKIP_FLAGS: u32 = FIEMAP_EXTENT_UNKNOWN | FIEMAP_EXTENT_DELALLOC | FIEMAP_EXTENT_DATA_INLINE;
    const BATCH: usize = 256;

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct FiemapExtent {
        fe_logical: u64,
        fe_physical: u64,
        fe_length: u64,
        fe_reserved64: [u64; 2],
        fe_flags: u32,
        fe_reserved: [u32; 3],
    }

    #[repr(C)]
    struct FiemapRequest {
        fm_start: u64,
        fm_length: u64,
        fm_flags: u32,
        fm_mapped_extents: u32,
        fm_extent_count: u32,
        fm_reserved: u32,
        fm_extents: [FiemapExtent; BATCH],
    }

    fn statvfs(path: &Path) -> Result<libc::statvfs> {
        let c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| FragmapError::Configuration(format!("path contains NUL: {}", path.display())))?;
        // SAFETY: statvfs is plain old data; all-zero is a valid bit pattern.
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c` is a valid NUL-terminated string and `vfs` is writable.
        let rc = unsafe { libc::statvfs(c.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(vfs)
    }

    impl FiemapSource {
        pub fn new(root: &Path) -> Result<Self> {
            let vfs = statvfs(root)?;
            let block_size = (vfs.f_frsize as u64).max(1);
            Ok(Self {
                block_size,
                device_blocks: vfs.f_blocks as u64,
            })
        }
    }

    impl ExtentSource for FiemapSource {
        fn device_blocks(&self, _root: &Path) -> Result<u64> {
            Ok(self.device_blocks)
        }

        fn block_size(&self) -> u64 {
            self.block_size
        }

        fn file_extents(&self, path: &Path) -> Result<Vec<Extent>> {
            let file = File::open(path)?;
            let fd = file.as_raw_fd();
            let mut request = Box::new(FiemapRequest {
                fm_start: 0,
                fm_length: 0,
                fm_flags: 0,
                fm_mapped_extents: 0,
                fm_extent_count: 0,
                fm_reserved: 0,
                fm_extents: [FiemapExtent::default(); BATCH],
            });
            let mut extents = Vec::new();
            let mut logical = 0u64;

            loop {
                request.fm_start = logical;
                request.fm_length = u64::MAX - logical;
                request.fm_flags = FIEMAP_FLAG_SYNC;
                request.fm_mapped_extents = 0;
                request.fm_extent_count = BATCH as u32;

                // SAFETY: `request` is a correctly laid out fiemap header followed
                // by `fm_extent_count` extent slots, and outlives the call.
                let rc = unsafe { libc::ioctl(fd, FS_IOC_FIEMAP as _, &mut *request as *mut FiemapRequest) };
                if rc < 0 {
                    return Err(io::Error::last_os_error().into());
                }

                let mapped = (request.fm_mapped_extents as usize).min(BATCH);
                if mapped == 0 {
                    break;
                }

                let mut done = false;
                for fe in &request.fm_extents[..mapped] {
                    if fe.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                        done = true;
                    }
                    if fe.fe_flags & SKIP_FLAGS != 0 || fe.fe_length == 0 {
                        continue;
                    }
                    let start = fe.fe_physical / self.block_size;
                    let length = fe.fe_length.div_ceil(self.block_size);
                    push_merged(&mut extents, Extent::new(start, length));
                }

                let last = request.fm_extents[mapped - 1];
                logical = last.fe_logical.saturating_add(last.fe_length);
                if done || logical == u64::MAX {
                    break;
                }
            }

            Ok(extents)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use crate::error::FragmapError;

    impl FiemapSource {
        pub fn new(_root: &Path) -> Result<Self> {
            Err(FragmapError::Unsupported(
                "extent mapping needs the Linux FIEMAP ioctl; load a snapshot instead".to_string(),
            ))
        }
    }

    impl ExtentSource for FiemapSource {
        fn device_blocks(&self, _root: &Path) -> Result<u64> {
            Ok(self.device_blocks)
        }

        fn file_extents(&self, _path: &Path) -> Result<Vec<Extent>> {
            Err(FragmapError::Unsupported("FIEMAP".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_merged_joins_adjacent_runs() {
        let mut extents = Vec::new();
        push_merged(&mut extents, Extent::new(10, 5));
        push_merged(&mut extents, Extent::new(15, 5));
        push_merged(&mut extents, Extent::new(40, 1));
        assert_eq!(extents, vec![Extent::new(10, 10), Extent::new(40, 1)]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_statvfs_reports_blocks() {
        let source = FiemapSource::new(Path::new("/")).expect("statvfs on /");
        assert!(source.block_size() > 0);
        assert!(source.device_blocks(Path::new("/")).expect("cached") > 0);
    }

    #[cfg(target_os = "linux")]
    mod linux {
        use crate::error::FragmapError;
        use crate::extent::Extent;
        use crate::fiemap::FiemapSource;
        use crate::scanner::ExtentSource;
        use std::path::Path;
        use std::fs::File;
        use std::io::Write;
        use std::os::unix::fs::FileExt;

        // Kept inside the crate directory: /tmp is often tmpfs, which has no FIEMAP.
        fn scratch_dir() -> tempfile::TempDir {
            tempfile::Builder::new()
                .prefix("fiemap-test")
                .tempdir_in(env!("CARGO_MANIFEST_DIR"))
                .expect("tempdir")
        }

        fn noise(len: usize) -> Vec<u8> {
            let mut state = 0x2545_f491_u32;
            (0..len)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect()
        }

        /// `None` when the filesystem does not implement FIEMAP.
        fn extents_or_skip(source: &FiemapSource, path: &Path) -> Option<Vec<Extent>> {
            match source.file_extents(path) {
                Ok(extents) => Some(extents),
                Err(FragmapError::Io(err))
                    if matches!(err.raw_os_error(), Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY)) =>
                {
                    None
                }
                Err(err) => panic!("FIEMAP failed: {}", err),
            }
        }

        #[test]
        fn test_dense_file_covers_its_length() {
            let dir = scratch_dir();
            let source = FiemapSource::new(dir.path()).expect("statvfs");
            let block = source.block_size();
            let len = block * 32;

            let path = dir.path().join("dense.bin");
            let mut file = File::create(&path).expect("create");
            file.write_all(&noise(len as usize)).expect("write");
            file.sync_all().expect("sync");

            let Some(extents) = extents_or_skip(&source, &path) else {
                return;
            };
            assert!(!extents.is_empty());
            assert!(extents.iter().all(|e| e.length > 0));
            let blocks: u64 = extents.iter().map(|e| e.length).sum();
            assert!(blocks >= len / block, "{} blocks for {} bytes", blocks, len);
        }

        #[test]
        fn test_sparse_file_needs_several_requests() {
            let dir = scratch_dir();
            let source = FiemapSource::new(dir.path()).expect("statvfs");
            let block = source.block_size();
            // More data runs than one request can return; holes keep them apart.
            let runs = 300u64;

            let path = dir.path().join("sparse.bin");
            let file = File::create(&path).expect("create");
            let chunk = noise(block as usize);
            for i in 0..runs {
                file.write_all_at(&chunk, i * 2 * block).expect("write");
            }
            file.sync_all().expect("sync");

            let Some(extents) = extents_or_skip(&source, &path) else {
                return;
            };
            let blocks: u64 = extents.iter().map(|e| e.length).sum();
            assert!(blocks >= runs, "only {} of {} blocks mapped", blocks, runs);
        }
    }
}
