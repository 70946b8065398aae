//! A scratch file holding the bytes of evicted blocks.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static SWAP_FILES: AtomicUsize = AtomicUsize::new(0);

/// Where an evicted block's bytes live in the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    offset: u64,
    len: u64,
}

/// A file of extents, reused first-fit once released. Deleted on drop.
pub(crate) struct SwapFile {
    file: File,
    path: PathBuf,
    end: u64,
    /// Released extents, ordered by offset.
    holes: Vec<Extent>,
}

impl SwapFile {
    /// Creates a fresh swap file in `dir`.
    pub(crate) fn create(dir: &Path) -> std::io::Result<Self> {
        let index = SWAP_FILES.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("sluice-swap-{}-{}", std::process::id(), index));
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        Ok(SwapFile { file, path, end: 0, holes: Vec::new() })
    }

    /// Stores `bytes`, returning where they went.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> std::io::Result<Extent> {
        let len = bytes.len() as u64;
        let extent = match self.holes.iter().position(|hole| hole.len >= len) {
            Some(index) => {
                let hole = &mut self.holes[index];
                let extent = Extent { offset: hole.offset, len };
                hole.offset += len;
                hole.len -= len;
                if hole.len == 0 {
                    self.holes.remove(index);
                }
                extent
            },
            None => {
                let extent = Extent { offset: self.end, len };
                self.end += len;
                extent
            },
        };
        self.file.seek(SeekFrom::Start(extent.offset))?;
        self.file.write_all(bytes)?;
        Ok(extent)
    }

    /// Reads back the bytes stored at `extent`.
    pub(crate) fn read(&mut self, extent: Extent) -> std::io::Result<Vec<u8>> {
        let mut bytes = vec![0u8; extent.len as usize];
        self.file.seek(SeekFrom::Start(extent.offset))?;
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Makes `extent` available for reuse, merging it with adjacent holes.
    pub(crate) fn release(&mut self, extent: Extent) {
        if extent.len == 0 {
            return;
        }
        let index = self.holes.partition_point(|hole| hole.offset < extent.offset);
        self.holes.insert(index, extent);
        if index + 1 < self.holes.len() && self.holes[index].offset + self.holes[index].len == self.holes[index + 1].offset {
            self.holes[index].len += self.holes[index + 1].len;
            self.holes.remove(index + 1);
        }
        if index > 0 && self.holes[index - 1].offset + self.holes[index - 1].len == self.holes[index].offset {
            self.holes[index - 1].len += self.holes[index].len;
            self.holes.remove(index);
        }
        if let Some(last) = self.holes.last() {
            if last.offset + last.len == self.end {
                self.end = last.offset;
                self.holes.pop();
            }
        }
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents_are_reused_and_merged() {
        let mut swap = SwapFile::create(&std::env::temp_dir()).unwrap();
        let a = swap.write(&[1u8; 10]).unwrap();
        let b = swap.write(&[2u8; 20]).unwrap();
        let c = swap.write(&[3u8; 5]).unwrap();
        assert_eq!(swap.read(b).unwrap(), vec![2u8; 20]);

        swap.release(a);
        swap.release(b);
        assert_eq!(swap.holes, vec![Extent { offset: 0, len: 30 }]);

        let d = swap.write(&[4u8; 25]).unwrap();
        assert_eq!(d.offset, 0);
        assert_eq!(swap.read(c).unwrap(), vec![3u8; 5]);
        assert_eq!(swap.read(d).unwrap(), vec![4u8; 25]);

        swap.release(c);
        swap.release(d);
        assert_eq!(swap.end, 0);
        assert!(swap.holes.is_empty());

        let path = swap.path.clone();
        drop(swap);
        assert!(!path.exists());
    }
}
