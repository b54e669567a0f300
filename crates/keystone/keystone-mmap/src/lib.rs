use memmap2::{Mmap, MmapMut};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::Path,
};

/// File mode for a published segment: owner may write, everyone may map it read-only.
pub const PUBLIC_SEGMENT_MODE: u32 = 0o644;

pub struct MmapFileMut {
    _file: File,
    mmap: MmapMut,
}

pub struct MmapFile {
    file: File,
    mmap: Mmap,
}

impl MmapFileMut {
    /// Create a new file to `size_bytes` and map it read-write
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let file = create_truncated(path)?;
        Self::map_sized(file, size_bytes)
    }

    /// Size an already opened file to `size_bytes` and map it read-write.
    ///
    /// Split out from `create_rw` so callers can tell a failure to open the
    /// backing file apart from a failure to size or map it.
    pub fn map_sized(file: File, size_bytes: u64) -> io::Result<Self> {
        file.set_len(size_bytes)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Synchronously write `len` bytes starting at `offset` back to the
    /// backing file (`msync(MS_SYNC)`).
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.mmap.flush_range(offset, len)
    }

    /// Synchronously write the whole mapping back to the backing file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

impl MmapFile {
    /// Open an existing file and map it read-only (`PROT_READ`, shared).
    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;

        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self { file, mmap })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Metadata of the file backing this mapping, which may since have been
    /// unlinked or replaced at its original path.
    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        self.file.metadata()
    }
}

/// Open `path` for read-write, creating it or truncating an existing file.
pub fn create_truncated<P: AsRef<Path>>(path: P) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Atomically move a fully initialised file onto its well-known path.
///
/// `rename(2)` replaces any stale file at `to`; processes that already mapped
/// the old file keep their (now unlinked) mapping.
pub fn publish_path<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> io::Result<()> {
    fs::rename(from, to)
}

/// Give the file at `path` the public segment mode.
#[cfg(unix)]
pub fn set_public_mode<P: AsRef<Path>>(path: P) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(PUBLIC_SEGMENT_MODE))
}

#[cfg(not(unix))]
pub fn set_public_mode<P: AsRef<Path>>(_path: P) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_through_rw_map_are_visible_to_ro_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut rw = MmapFileMut::create_rw(&path, 4096).unwrap();
        assert_eq!(rw.len(), 4096);
        unsafe { rw.as_mut_ptr().add(10).write(0xAB) };
        rw.flush_range(0, 64).unwrap();

        let ro = MmapFile::open_ro(&path).unwrap();
        assert_eq!(ro.len(), 4096);
        assert_eq!(unsafe { ro.as_ptr().add(10).read() }, 0xAB);
    }

    #[test]
    fn open_ro_on_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = MmapFile::open_ro(dir.path().join("nope")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn publish_path_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("segment.tmp");
        let public = dir.path().join("segment");
        fs::write(&public, b"stale").unwrap();

        let mut rw = MmapFileMut::create_rw(&staged, 16).unwrap();
        unsafe { rw.as_mut_ptr().write(7) };
        rw.flush().unwrap();
        publish_path(&staged, &public).unwrap();

        assert!(!staged.exists());
        let ro = MmapFile::open_ro(&public).unwrap();
        assert_eq!(ro.len(), 16);
        assert_eq!(unsafe { ro.as_ptr().read() }, 7);
    }

    #[cfg(unix)]
    #[test]
    fn metadata_describes_the_mapped_file_after_unlink() {
        use std::os::unix::fs::MetadataExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");
        fs::write(&path, [0u8; 32]).unwrap();

        let ro = MmapFile::open_ro(&path).unwrap();
        let before = ro.metadata().unwrap();
        assert_eq!(before.ino(), fs::metadata(&path).unwrap().ino());

        fs::remove_file(&path).unwrap();
        let after = ro.metadata().unwrap();
        assert_eq!(after.ino(), before.ino());
        assert_eq!(after.nlink(), 0);
        assert_eq!(after.len(), 32);
    }

    #[cfg(unix)]
    #[test]
    fn public_mode_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");
        fs::write(&path, b"x").unwrap();
        set_public_mode(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, PUBLIC_SEGMENT_MODE);
    }
}
