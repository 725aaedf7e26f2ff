//! Thumbnail cache backed by the external `convert` tool.
//!
//! Thumbnails live outside the backing directory so they never show up
//! as objects. They are content-addressed by source filename:
//! `IMG.JPG` caches as `IMG.thumb.jpeg`.

use std::path::{Path, PathBuf};
use std::process::Command;

pub const THUMB_DIR: &str = "/var/cache/ptp/thumb";
pub const THUMB_WIDTH: u32 = 160;
pub const THUMB_HEIGHT: u32 = 120;

/// Cache path for a source filename, or `None` when the name has no
/// extension to strip.
pub fn cache_path(name: &str) -> Option<PathBuf> {
    let (stem, _) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(Path::new(THUMB_DIR).join(format!("{stem}.thumb.jpeg")))
}

/// Generate the thumbnail for `name` if it is missing or older than
/// the source, and return its byte size.
pub fn generate(root: &Path, name: &str) -> Option<u64> {
    let source = root.join(name);
    let thumb = cache_path(name)?;

    let source_mtime = std::fs::metadata(&source).and_then(|m| m.modified()).ok()?;
    let fresh = std::fs::metadata(&thumb)
        .and_then(|m| m.modified())
        .map(|mtime| mtime >= source_mtime)
        .unwrap_or(false);

    if !fresh {
        log::debug!("generating thumbnail for {name}");
        match Command::new("convert")
            .arg("-thumbnail")
            .arg(format!("{THUMB_WIDTH}x{THUMB_HEIGHT}"))
            .arg(&source)
            .arg(&thumb)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => {
                log::warn!("convert exited with {status} for {name}");
                return None;
            }
            Err(err) => {
                log::warn!("cannot run convert: {err}");
                return None;
            }
        }
    }

    std::fs::metadata(&thumb).map(|m| m.len()).ok()
}

/// Drop the cached thumbnail for a deleted object, if any.
pub fn remove(name: &str) {
    let Some(thumb) = cache_path(name) else {
        return;
    };
    if let Err(err) = std::fs::remove_file(&thumb) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("cannot delete {}: {err}", thumb.display());
        }
    }
}
