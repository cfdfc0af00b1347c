//! Named memory segments backed by files in a shared-memory directory.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, trace};

/// A file-backed mapping visible to every process that opens the same path.
///
/// The mapping stays valid for as long as the `Segment` lives, independent of
/// whether the backing file has been unlinked.
pub(crate) struct Segment {
    map: MmapRaw,
    path: PathBuf,
}

impl Segment {
    /// Create a new segment of `len` zeroed bytes. Fails if the name is taken.
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty segment",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;

        let map = MmapOptions::new().len(len).map_raw(&file)?;
        debug!("Created segment {} ({} bytes)", path.display(), len);

        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing segment created by another process.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapRaw::map_raw(&file)?;
        trace!("Opened segment {} ({} bytes)", path.display(), map.len());

        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Remove the backing file. Existing mappings stay valid.
    pub fn unlink(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Unlinked segment {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to unlink segment {}: {}", self.path.display(), e),
        }
    }
}
