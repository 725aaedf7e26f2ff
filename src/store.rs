//! The object store: a flat PTP handle space backed by one directory.
//!
//! Handles 1 and 2 are the synthetic `/DCIM` and `/DCIM/<model>`
//! directories; every regular file directly inside the backing directory
//! gets a dynamic handle from 3 upwards. Handles are assigned in
//! directory-iteration order at startup and grow strictly monotonically
//! for the lifetime of the process; a deleted handle is never reused.
//!
//! Uploads are staged crash-safely: a `<name>.lock` sidecar records the
//! declared size while the target file is being filled, so an
//! interrupted upload can be recognized and discarded at the next
//! startup.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::proto::{self, format, ObjectInfo};

/// Sidecar suffix marking an in-progress upload.
pub const LOCK_SUFFIX: &str = ".lock";

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing directory is missing, not a directory, or not
    /// readable and writable.
    #[error("invalid backing directory: {0}")]
    InvalidRoot(PathBuf),

    /// `statfs` on the backing directory failed.
    #[error("filesystem statistics unavailable: {0}")]
    Statfs(io::Error),

    /// No upload slot is active.
    #[error("no upload in progress")]
    NoPending,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while staging an upload.
#[derive(Error, Debug)]
pub enum UploadError {
    /// The target file or its lock file already exists.
    #[error("target or lock file already exists")]
    Collision,

    /// The declared filename cannot name a file in the backing directory.
    #[error("invalid upload filename {0:?}")]
    BadName(String),

    /// Creating the lock or target file failed.
    #[error("creating upload files failed: {0}")]
    Create(#[source] io::Error),

    /// Recording or reserving the declared size failed; the staged
    /// files have been removed.
    #[error("reserving space failed: {0}")]
    Reserve(#[source] io::Error),
}

/// Outcome of deleting a single backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// File removed and entry dropped.
    Deleted,
    /// The file's permission bits deny writing for this process.
    WriteProtected,
    /// stat or unlink failed.
    Failed,
}

/// One real object: a regular file plus its PTP metadata.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub handle: u32,
    pub name: String,
    pub info: ObjectInfo,
}

/// An upload announced by SendObjectInfo but not yet completed by
/// SendObject. At most one exists at any time.
struct PendingUpload {
    handle: u32,
    name: String,
    info: ObjectInfo,
    writer: Option<fs::File>,
}

/// The handle space and its persistent backing directory.
pub struct ObjectStore {
    root: PathBuf,
    entries: Vec<ObjectEntry>,
    last_handle: u32,
    pending: Option<PendingUpload>,
    capacity: u64,
    free_space: u64,
}

impl ObjectStore {
    /// Open the backing directory: validate it, clean up stale lock
    /// files, prime the free-space figures and enumerate the objects.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRoot`] when `root` is not a
    /// read-write directory, or an I/O error from enumeration.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let accessible = fs::metadata(&root).map(|m| m.is_dir()).unwrap_or(false)
            && dir_accessible(&root);
        if !accessible {
            return Err(StoreError::InvalidRoot(root));
        }

        let mut store = Self {
            root,
            entries: Vec::new(),
            last_handle: proto::MODEL_DIR_HANDLE,
            pending: None,
            capacity: 0,
            free_space: 0,
        };
        store.clean_stale_locks();
        // Prime the free-space figures now: some hosts never ask for
        // storage info, and the upload path checks against them.
        store.refresh_free_space()?;
        store.enumerate()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a named object inside the backing directory.
    pub fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn entries(&self) -> &[ObjectEntry] {
        &self.entries
    }

    pub fn object_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn lookup(&self, handle: u32) -> Option<&ObjectEntry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    /// Whether `handle` names a synthetic directory or a real object.
    pub fn handle_valid(&self, handle: u32) -> bool {
        handle == proto::DCIM_HANDLE
            || handle == proto::MODEL_DIR_HANDLE
            || self.lookup(handle).is_some()
    }

    /// All real-object handles in enumeration order.
    pub fn real_handles(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.handle).collect()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_space(&self) -> u64 {
        self.free_space
    }

    /// Re-read capacity and free space from the backing filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Statfs`] when the filesystem cannot be
    /// queried.
    pub fn refresh_free_space(&mut self) -> Result<(), StoreError> {
        let (capacity, free) = filesystem_stats(&self.root).map_err(StoreError::Statfs)?;
        log::trace!("storage: capacity {capacity}, free {free}");
        self.capacity = capacity;
        self.free_space = free;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_free_space(&mut self, bytes: u64) {
        self.free_space = bytes;
    }

    /// Delete one real object, honoring the file's write-permission
    /// bits. Returns `None` for an unknown handle.
    pub fn delete_one(&mut self, handle: u32) -> Option<DeleteStatus> {
        let idx = self.entries.iter().position(|e| e.handle == handle)?;
        let status = delete_file(&self.root, &self.entries[idx].name);
        if status == DeleteStatus::Deleted {
            let _entry = self.entries.remove(idx);
            #[cfg(feature = "thumbnails")]
            crate::thumbs::remove(&_entry.name);
        }
        Some(status)
    }

    /// Delete every real object. Returns `true` when at least one file
    /// could not be removed (partial deletion).
    pub fn delete_all(&mut self) -> bool {
        let mut partial = false;
        let mut kept = Vec::new();
        for entry in std::mem::take(&mut self.entries) {
            match delete_file(&self.root, &entry.name) {
                DeleteStatus::Deleted => {
                    #[cfg(feature = "thumbnails")]
                    crate::thumbs::remove(&entry.name);
                }
                _ => {
                    partial = true;
                    kept.push(entry);
                }
            }
        }
        self.entries = kept;
        partial
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Declared byte size of the active upload slot.
    pub fn pending_size(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.info.object_compressed_size)
    }

    /// Stage a new upload: discard any previous slot, create the lock
    /// file holding the declared size, create the target file and
    /// reserve its length. Returns the tentative handle; the slot only
    /// becomes a real object on [`ObjectStore::commit_upload`].
    ///
    /// # Errors
    ///
    /// See [`UploadError`]; on any error no staged files remain except
    /// for [`UploadError::Collision`] where the colliding files were
    /// not ours to remove.
    pub fn begin_upload(&mut self, mut info: ObjectInfo) -> Result<u32, UploadError> {
        if let Some(prev) = self.pending.take() {
            log::info!("replacing pending upload {}", prev.name);
            self.remove_upload_files(&prev.name);
        }

        let name = info.filename.clone();
        if name.is_empty() || name.contains(['/', '\0']) || name == "." || name == ".." {
            return Err(UploadError::BadName(name));
        }

        let mode = if info.protection_status & 0x0001 != 0 {
            0o444
        } else {
            0o644
        };

        let lock_path = self.lock_path(&name);
        let mut lock = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UploadError::Collision)
            }
            Err(e) => return Err(UploadError::Create(e)),
        };
        if let Err(e) = lock.write_all(info.object_compressed_size.to_string().as_bytes()) {
            self.remove_upload_files(&name);
            return Err(UploadError::Reserve(e));
        }

        let target = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.object_path(&name))
        {
            Ok(f) => f,
            Err(e) => {
                if let Err(err) = fs::remove_file(&lock_path) {
                    log::warn!("cannot remove {}: {err}", lock_path.display());
                }
                return Err(if e.kind() == io::ErrorKind::AlreadyExists {
                    UploadError::Collision
                } else {
                    UploadError::Create(e)
                });
            }
        };
        if let Err(e) = target.set_len(u64::from(info.object_compressed_size)) {
            self.remove_upload_files(&name);
            return Err(UploadError::Reserve(e));
        }

        // A replaced or aborted slot still burns its handle; the space
        // stays strictly monotonic.
        self.last_handle += 1;
        let handle = self.last_handle;

        info.storage_id = proto::STORE_ID;
        info.parent_object = proto::MODEL_DIR_HANDLE;
        info.association_type = 0;
        info.association_desc = 0;
        info.sequence_number = 0;

        log::debug!(
            "staged upload {name} as tentative handle {handle} ({} bytes)",
            info.object_compressed_size
        );
        self.pending = Some(PendingUpload {
            handle,
            name,
            info,
            writer: None,
        });
        Ok(handle)
    }

    /// Append data-phase bytes to the staged target file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoPending`] without a slot, or the
    /// underlying I/O error.
    pub fn write_upload(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let Self { root, pending, .. } = self;
        let Some(pending) = pending.as_mut() else {
            return Err(StoreError::NoPending);
        };
        if pending.writer.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(root.join(&pending.name))?;
            pending.writer = Some(file);
        }
        if let Some(writer) = pending.writer.as_mut() {
            writer.write_all(data)?;
        }
        Ok(())
    }

    /// Turn the staged slot into a real object: close the writer,
    /// remove the lock file and link the entry into the handle space.
    /// Returns the now-permanent handle, or `None` without a slot.
    pub fn commit_upload(&mut self) -> Option<u32> {
        let mut pending = self.pending.take()?;
        pending.writer = None;

        #[cfg(feature = "thumbnails")]
        if pending.info.object_format != format::UNDEFINED
            && pending.info.object_format != format::TEXT
        {
            if let Some(size) = crate::thumbs::generate(&self.root, &pending.name) {
                pending.info.thumb_format = format::JFIF;
                pending.info.thumb_compressed_size = size as u32;
                pending.info.thumb_pix_width = crate::thumbs::THUMB_WIDTH;
                pending.info.thumb_pix_height = crate::thumbs::THUMB_HEIGHT;
            }
        }

        let lock_path = self.lock_path(&pending.name);
        if let Err(err) = fs::remove_file(&lock_path) {
            log::warn!("cannot remove {}: {err}", lock_path.display());
        }

        let handle = pending.handle;
        log::info!("committed upload {} as handle {handle}", pending.name);
        self.entries.push(ObjectEntry {
            handle,
            name: pending.name,
            info: pending.info,
        });
        Some(handle)
    }

    /// Drop the staged slot and remove its on-disk artifacts.
    pub fn abort_upload(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.writer = None;
            log::info!("aborting upload {}", pending.name);
            self.remove_upload_files(&pending.name);
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{LOCK_SUFFIX}"))
    }

    fn remove_upload_files(&self, name: &str) {
        for path in [self.object_path(name), self.lock_path(name)] {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("cannot remove {}: {err}", path.display());
            }
        }
    }

    /// Remove leftovers of uploads interrupted by a crash or power
    /// loss. A lock file whose target has exactly the recorded length
    /// marks an upload that reserved space but never finished: both
    /// files go. Otherwise only the lock file goes. Lock files with
    /// unparsable contents were not written by us and are left alone.
    fn clean_stale_locks(&self) {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) => {
                log::warn!("cannot scan {}: {err}", self.root.display());
                return;
            }
        };

        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            if stem.is_empty() || !ext.eq_ignore_ascii_case("lock") {
                continue;
            }

            let lock_path = self.root.join(name);
            let contents = match fs::read_to_string(&lock_path) {
                Ok(c) => c,
                Err(err) => {
                    log::warn!("cannot read {}: {err}", lock_path.display());
                    continue;
                }
            };
            if contents.is_empty() {
                remove_logged(&lock_path);
                continue;
            }
            let Ok(recorded) = contents.parse::<u64>() else {
                log::warn!("ignoring foreign lock file {}", lock_path.display());
                continue;
            };

            let target_path = self.root.join(stem);
            match fs::metadata(&target_path) {
                Ok(meta) if meta.len() == recorded => {
                    // Space was reserved but the data never arrived.
                    log::info!("removing interrupted upload {stem}");
                    remove_logged(&lock_path);
                    remove_logged(&target_path);
                }
                Ok(_) | Err(_) => remove_logged(&lock_path),
            }
        }
    }

    /// Walk the backing directory's immediate entries and build the
    /// handle space. Only regular files whose name carries an extension
    /// (a dot not at position zero) are listed.
    fn enumerate(&mut self) -> Result<(), StoreError> {
        let mut handle = proto::MODEL_DIR_HANDLE;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("cannot stat {:?}: {err}", entry.file_name());
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                log::warn!("skipping non-unicode filename {:?}", entry.file_name());
                continue;
            };
            if name.starts_with("..") || !matches!(name.rfind('.'), Some(pos) if pos > 0) {
                continue;
            }

            handle += 1;
            #[allow(unused_mut)]
            let mut info = ObjectInfo::for_file(
                format_for_name(&name),
                if meta.mode() & 0o200 != 0 { 0 } else { 1 },
                meta.len() as u32,
                name.clone(),
                capture_date(&meta),
            );

            #[cfg(feature = "thumbnails")]
            if info.object_format != format::UNDEFINED && info.object_format != format::TEXT {
                if let Some(size) = crate::thumbs::generate(&self.root, &name) {
                    info.thumb_format = format::JFIF;
                    info.thumb_compressed_size = size as u32;
                    info.thumb_pix_width = crate::thumbs::THUMB_WIDTH;
                    info.thumb_pix_height = crate::thumbs::THUMB_HEIGHT;
                }
            }

            log::debug!("listing {name} as handle {handle} ({} bytes)", meta.len());
            self.entries.push(ObjectEntry { handle, name, info });
        }

        self.last_handle = handle;
        Ok(())
    }
}

/// Map a filename extension to its PIMA object format.
pub fn format_for_name(name: &str) -> u16 {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if ext.eq_ignore_ascii_case("txt") {
        format::TEXT
    } else if ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff") {
        format::TIFF
    } else if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") {
        format::EXIF_JPEG
    } else {
        format::UNDEFINED
    }
}

/// The file's modification time as a PTP date-time string
/// (`YYYYMMDDThhmmss.0Z`), used as the capture date.
fn capture_date(meta: &fs::Metadata) -> String {
    match meta.modified() {
        Ok(mtime) => DateTime::<Utc>::from(mtime)
            .format("%Y%m%dT%H%M%S.0Z")
            .to_string(),
        Err(_) => String::new(),
    }
}

/// Unlink one file, honoring POSIX write-permission semantics against
/// the process's effective uid/gid. stat is used rather than access(2),
/// which is unreliable on NFS.
fn delete_file(root: &Path, name: &str) -> DeleteStatus {
    let path = root.join(name);
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) => {
            log::warn!("cannot stat {}: {err}", path.display());
            return DeleteStatus::Failed;
        }
    };

    let mode = meta.mode();
    let writable = if unsafe { libc::geteuid() } == meta.uid() {
        mode & 0o200 != 0
    } else if unsafe { libc::getegid() } == meta.gid() {
        mode & 0o020 != 0
    } else {
        mode & 0o002 != 0
    };
    if !writable {
        return DeleteStatus::WriteProtected;
    }

    match fs::remove_file(&path) {
        Ok(()) => DeleteStatus::Deleted,
        Err(err) => {
            log::warn!("cannot delete {}: {err}", path.display());
            DeleteStatus::Failed
        }
    }
}

fn remove_logged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::warn!("cannot remove {}: {err}", path.display());
    }
}

fn dir_accessible(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

/// Capacity and free space of the filesystem holding `path`, in bytes.
fn filesystem_stats(path: &Path) -> io::Result<(u64, u64)> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut fs = unsafe { std::mem::zeroed::<libc::statfs>() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut fs) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let bsize = fs.f_bsize as u64;
    Ok((
        bsize.saturating_mul(fs.f_blocks as u64),
        bsize.saturating_mul(fs.f_bfree as u64),
    ))
}
