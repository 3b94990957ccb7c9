//! Session archive bundling.
//!
//! Bundles every regular file under a session's output directory into one
//! zip, preserving relative paths. Publication is atomic: bytes go to a
//! `.partial` sibling first and the final name only appears after the zip
//! stream has been finished and synced, so a download handler can never
//! observe a half-written archive.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip write error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Timestamped file name for a freshly built archive.
pub fn archive_file_name() -> String {
    format!("export-{}.zip", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Compress `source_dir` into a zip at `dest`, returning the archive size.
///
/// On any failure the partial file is removed and `dest` is left untouched.
pub fn build_archive(source_dir: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let temp = partial_path(dest);

    match write_zip(source_dir, &temp).and_then(|_| publish(&temp, dest)) {
        Ok(size) => Ok(size),
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Sibling path the archive is staged at while being written.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", uuid::Uuid::new_v4()));
    dest.with_file_name(name)
}

fn write_zip(source_dir: &Path, out_path: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::create(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(9));

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry.map_err(|e| ArchiveError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(source_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        // Zip entry names always use forward slashes.
        let name = rel.to_string_lossy().replace('\\', "/");

        zip.start_file(name, options)?;
        let mut src = std::fs::File::open(entry.path())?;
        std::io::copy(&mut src, &mut zip)?;
    }

    let mut file = zip.finish()?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn publish(temp: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let size = std::fs::metadata(temp)?.len();
    std::fs::rename(temp, dest)?;
    Ok(size)
}
