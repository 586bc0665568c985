/// Read-only access to a source device or image
use memmap2::MmapOptions;
use std::fs::File;
use std::path::Path;

use crate::error::{IoContext, MetadumpError, Result};

/// A memory-mapped file for efficient large file access
pub struct BlockDevice {
    _file: File,
    mmap: memmap2::Mmap,
}

impl BlockDevice {
    /// Open a block device or image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).context_io(|| format!("opening {}", path.display()))?;

        // The source is only ever read; callers must not resize it during a dump.
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .context_io(|| format!("mapping {}", path.display()))?;

        Ok(BlockDevice { _file: file, mmap })
    }

    /// Read a slice of bytes from the device
    pub fn read_bytes(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(length).unwrap_or(usize::MAX);

        if end > self.mmap.len() {
            return Err(MetadumpError::io(
                format!("reading {} bytes at {}", length, offset),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read beyond end of device: {} > {}", end, self.mmap.len()),
                ),
            ));
        }

        Ok(&self.mmap[start..end])
    }
}

/// Positional write of the whole buffer; the file cursor is not used
#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
