//! Cache files accessed with positional I/O.
//!
//! A [`DiskHandle`] owns the path of one cache file and opens its descriptor
//! lazily. The descriptor may be closed at any time by the registry's eviction
//! scan; the next access reopens it transparently.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{TempFileGuard, Tier, TierKind};
use crate::error::{CacheError, Result};
use crate::morphology::CacheMode;
use crate::registry::{self, StoreId};
use crate::resource::{ResourceGovernor, ResourceGrant};

/// Monotonic access stamps; strictly ordered unlike wall-clock instants.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

fn next_stamp() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
struct OpenFile {
    file: Arc<File>,
    _grant: ResourceGrant,
}

#[derive(Debug, Default)]
struct DiskState {
    open: Option<OpenFile>,
    last_access: u64,
}

/// Lazily opened descriptor of one cache file.
#[derive(Debug)]
pub(crate) struct DiskHandle {
    store: StoreId,
    path: PathBuf,
    mode: CacheMode,
    governor: Arc<dyn ResourceGovernor>,
    state: Mutex<DiskState>,
    // Without pread/pwrite the seek and the transfer must not interleave.
    #[cfg(not(unix))]
    seek: Mutex<()>,
}

impl DiskHandle {
    pub(crate) fn new(
        store: StoreId,
        path: PathBuf,
        mode: CacheMode,
        governor: Arc<dyn ResourceGovernor>,
    ) -> Self {
        Self {
            store,
            path,
            mode,
            governor,
            state: Mutex::new(DiskState::default()),
            #[cfg(not(unix))]
            seek: Mutex::new(()),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn store(&self) -> StoreId {
        self.store
    }

    pub(crate) fn governor(&self) -> &Arc<dyn ResourceGovernor> {
        &self.governor
    }

    /// The open descriptor, opening it first if needed.
    ///
    /// Opening reserves a `File` budget through the registry, which may evict
    /// another store's descriptor. The state lock is not held meanwhile.
    pub(crate) fn file(&self) -> Result<Arc<File>> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(open) = &state.open {
                state.last_access = next_stamp();
                return Ok(Arc::clone(&open.file));
            }
        }

        let grant = registry::reserve_descriptor(&self.governor, self.store)?;
        let file = Arc::new(self.open_file()?);

        let mut state = self.state.lock();
        state.last_access = next_stamp();
        if let Some(open) = &state.open {
            // Lost a race with another worker; our grant is released on return.
            return Ok(Arc::clone(&open.file));
        }
        log::trace!("opened cache file {} for {}", self.path.display(), self.store);
        state.open = Some(OpenFile {
            file: Arc::clone(&file),
            _grant: grant,
        });
        Ok(file)
    }

    fn open_file(&self) -> Result<File> {
        let opened = if self.mode.is_writable() {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&self.path)
                .or_else(|err| {
                    if err.kind() == ErrorKind::AlreadyExists {
                        OpenOptions::new().read(true).write(true).open(&self.path)
                    } else {
                        Err(err)
                    }
                })
        } else {
            File::open(&self.path)
        };
        opened.map_err(|source| CacheError::FileOpenFailed {
            path: self.path.clone(),
            source,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }

    /// Access stamp of an open, currently idle descriptor.
    pub(crate) fn idle_stamp(&self) -> Option<u64> {
        let state = self.state.try_lock()?;
        state.open.as_ref().map(|_| state.last_access)
    }

    /// Close the descriptor unless another thread is using the handle.
    pub(crate) fn try_close(&self) -> bool {
        match self.state.try_lock() {
            Some(mut state) => state.open.take().is_some(),
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        if self.state.lock().open.take().is_some() {
            log::trace!("closed cache file {}", self.path.display());
        }
    }

    /// Grow the file to at least `end` bytes by writing its last byte.
    pub(crate) fn extend(&self, end: u64) -> Result<()> {
        if end == 0 {
            return Ok(());
        }
        let file = self.file()?;
        let current = file
            .metadata()
            .map_err(|err| CacheError::io(&self.path, err))?
            .len();
        if current < end {
            self.write_at(end - 1, &[0])?;
        }
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file()?;
        #[cfg(not(unix))]
        let _seek = self.seek.lock();
        let mut done = 0;
        while done < buf.len() {
            match positional_read(&file, &mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CacheError::io(&self.path, err)),
            }
        }
        if done < buf.len() {
            return Err(CacheError::ShortRead {
                path: self.path.clone(),
                offset,
                expected: buf.len(),
                actual: done,
            });
        }
        Ok(())
    }

    pub(crate) fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.file()?;
        #[cfg(not(unix))]
        let _seek = self.seek.lock();
        let mut done = 0;
        while done < buf.len() {
            match positional_write(&file, &buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CacheError::io(&self.path, err)),
            }
        }
        if done < buf.len() {
            return Err(CacheError::ShortWrite {
                path: self.path.clone(),
                offset,
                expected: buf.len(),
                actual: done,
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(not(unix))]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(not(unix))]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write(buf)
}

/// Pixels in a cache file, read and written one range at a time.
#[derive(Debug)]
pub(crate) struct DiskTier {
    handle: Arc<DiskHandle>,
    offset: u64,
    len: u64,
    temp: TempFileGuard,
}

impl DiskTier {
    pub(crate) fn new(
        handle: Arc<DiskHandle>,
        offset: u64,
        len: u64,
        temp: TempFileGuard,
    ) -> Self {
        registry::attach(handle.store(), &handle);
        Self {
            handle,
            offset,
            len,
            temp,
        }
    }

    fn check(&self, offset: u64, count: usize) -> Result<u64> {
        match offset.checked_add(count as u64) {
            Some(end) if end <= self.len => Ok(self.offset + offset),
            _ => Err(CacheError::AllocationFailed(format!(
                "range {}+{} exceeds tier length {}",
                offset, count, self.len
            ))),
        }
    }
}

impl Tier for DiskTier {
    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    fn label(&self) -> &'static str {
        "Disk"
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let position = self.check(offset, buf.len())?;
        self.handle.read_at(position, buf)
    }

    fn write_range(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let position = self.check(offset, buf.len())?;
        self.handle.write_at(position, buf)
    }

    fn path(&self) -> Option<&Path> {
        Some(self.handle.path())
    }

    fn keep_file(&mut self) {
        self.temp.disarm();
    }
}
