//! Zip packing and unpacking of working trees.
//!
//! Every archive in the store is a zip whose entry names are paths relative
//! to the packed directory, using `/` separators.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PipelineError, PipelineResult};

/// Summary of a packed archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Number of file entries written.
    pub entries: usize,
    /// Size of the archive file in bytes.
    pub bytes: u64,
}

/// Pack the contents of `src` into a zip at `dest`.
///
/// Directories whose name appears in `exclude` are skipped at any depth.
/// Symlinks are skipped.
pub async fn pack_directory(
    src: &Path,
    dest: &Path,
    exclude: &[String],
) -> PipelineResult<ArchiveSummary> {
    let src = src.to_owned();
    let dest = dest.to_owned();
    let exclude = exclude.to_vec();
    spawn_blocking(move || pack_directory_sync(&src, &dest, &exclude))
        .await
        .map_err(|e| PipelineError::Internal(format!("archive task failed: {e}")))?
}

/// Unpack the zip at `archive` into `dest`, creating it if needed.
///
/// Entries whose names would resolve outside `dest` abort the extraction.
pub async fn unpack_archive(archive: &Path, dest: &Path) -> PipelineResult<usize> {
    let archive = archive.to_owned();
    let dest = dest.to_owned();
    spawn_blocking(move || unpack_archive_sync(&archive, &dest))
        .await
        .map_err(|e| PipelineError::Internal(format!("archive task failed: {e}")))?
}

fn pack_directory_sync(
    src: &Path,
    dest: &Path,
    exclude: &[String],
) -> PipelineResult<ArchiveSummary> {
    if !src.is_dir() {
        return Err(PipelineError::Archive(format!(
            "{} is not a directory",
            src.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut files = Vec::new();
    collect_files(src, exclude, &mut files)?;
    files.sort();

    let mut writer = ZipWriter::new(BufWriter::new(File::create(dest)?));

    for path in &files {
        let relative = path
            .strip_prefix(src)
            .map_err(|e| PipelineError::Archive(e.to_string()))?;
        let name = entry_name(relative)?;
        let mut options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if let Some(mode) = file_mode(path)? {
            options = options.unix_permissions(mode);
        }

        writer.start_file(name.as_str(), options)?;
        let mut file = BufReader::new(File::open(path)?);
        std::io::copy(&mut file, &mut writer)?;
        debug!(entry = %name, "archived file");
    }

    writer.finish()?.flush()?;
    let bytes = std::fs::metadata(dest)?.len();
    debug!(entries = files.len(), bytes, "created zip archive");

    Ok(ArchiveSummary {
        entries: files.len(),
        bytes,
    })
}

fn unpack_archive_sync(archive: &Path, dest: &Path) -> PipelineResult<usize> {
    std::fs::create_dir_all(dest)?;
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let mut written = 0;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            PipelineError::Archive(format!("entry {:?} escapes the destination", entry.name()))
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = BufWriter::new(File::create(&target)?);
        std::io::copy(&mut entry, &mut out)?;
        drop(out);

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
        written += 1;
    }

    debug!(entries = written, dest = %dest.display(), "extracted zip archive");
    Ok(written)
}

fn collect_files(dir: &Path, exclude: &[String], out: &mut Vec<PathBuf>) -> PipelineResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_symlink() {
            debug!(path = %path.display(), "skipping symlink");
            continue;
        }
        if file_type.is_dir() {
            let name = entry.file_name();
            if exclude.iter().any(|e| name.to_str() == Some(e.as_str())) {
                continue;
            }
            collect_files(&path, exclude, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn entry_name(relative: &Path) -> PipelineResult<String> {
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| match c {
            std::path::Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    parts
        .map(|p| p.join("/"))
        .ok_or_else(|| PipelineError::Archive(format!("unsupported path {}", relative.display())))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> PipelineResult<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    Ok(Some(std::fs::metadata(path)?.permissions().mode() & 0o777))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> PipelineResult<Option<u32>> {
    Ok(None)
}
