// dbbackup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tar::Builder;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::CompressionMode;

pub const TAR_EXTENSION: &str = "tar";
pub const GZIP_EXTENSION: &str = "gz";

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// `<date>-<name>`; the archive extensions are added by [`artifact_path`].
pub fn artifact_base_name(date: &str, name: &str) -> String {
    format!("{}-{}", date, name)
}

/// Final location of the artifact: `<output_dir>/<base_name>.tar[.gz]`.
pub fn artifact_path(output_dir: &Path, base_name: &str, compression: CompressionMode) -> PathBuf {
    let file_name = match compression {
        CompressionMode::Gzip => format!("{}.{}.{}", base_name, TAR_EXTENSION, GZIP_EXTENSION),
        CompressionMode::None => format!("{}.{}", base_name, TAR_EXTENSION),
    };
    output_dir.join(file_name)
}

/// Packages `staging_dir` into `<output_dir>/<base_name>.tar`, gzipping it at
/// the highest level when requested. Everything in the archive sits under a
/// single top-level entry named after the staging directory.
///
/// Setting `cancel` stops the work between entries and chunks. On any error
/// the files this call wrote are removed, so no partial artifact remains.
pub fn package(
    staging_dir: &Path,
    output_dir: &Path,
    base_name: &str,
    compression: CompressionMode,
    cancel: &AtomicBool,
) -> Result<PathBuf> {
    let tar_path = artifact_path(output_dir, base_name, CompressionMode::None);
    let final_path = artifact_path(output_dir, base_name, compression);

    let result = create_tar_archive(staging_dir, &tar_path, cancel).and_then(|_| {
        if compression == CompressionMode::Gzip {
            gzip_in_place(&tar_path, &final_path, cancel)?;
        }
        Ok(final_path.clone())
    });

    if result.is_err() {
        discard_partial(&tar_path);
        if final_path != tar_path {
            discard_partial(&final_path);
        }
    }
    result
}

fn ensure_not_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        anyhow::bail!("Packaging cancelled");
    }
    Ok(())
}

fn discard_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed incomplete archive {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove incomplete archive {}: {}", path.display(), e),
    }
}

/// Creates an uncompressed TAR archive of `source_dir`.
pub fn create_tar_archive(
    source_dir: &Path,
    archive_dest_path: &Path,
    cancel: &AtomicBool,
) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }
    let entry_root = source_dir
        .file_name()
        .with_context(|| format!("Staging directory has no name: {}", source_dir.display()))?;
    if let Some(parent) = archive_dest_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create parent directory for archive: {}", parent.display())
        })?;
    }

    info!(
        "Creating tar archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!("Failed to create archive file: {}", archive_dest_path.display())
    })?;
    let mut tar_builder = Builder::new(BufWriter::new(archive_file));
    tar_builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        ensure_not_cancelled(cancel)?;
        let entry = entry
            .with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).with_context(|| {
            format!("Failed to strip prefix {} from {}", source_dir.display(), path.display())
        })?;
        let name = if relative.as_os_str().is_empty() {
            PathBuf::from(entry_root)
        } else {
            Path::new(entry_root).join(relative)
        };

        if entry.file_type().is_dir() {
            tar_builder.append_dir(&name, path).with_context(|| {
                format!("Failed to append directory {} to archive", path.display())
            })?;
        } else {
            tar_builder.append_path_with_name(path, &name).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), name.display())
            })?;
        }
    }

    let writer = tar_builder.into_inner().with_context(|| {
        format!("Failed to finish tar archive: {}", archive_dest_path.display())
    })?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|file| file.sync_all())
        .with_context(|| format!("Failed to flush tar archive: {}", archive_dest_path.display()))?;

    info!("✓ Tar archive created at {}", archive_dest_path.display());
    Ok(archive_dest_path.to_path_buf())
}

/// Compresses `tar_path` into `gz_path` and removes the uncompressed file.
fn gzip_in_place(tar_path: &Path, gz_path: &Path, cancel: &AtomicBool) -> Result<()> {
    info!("Compressing {} (gzip, best)", tar_path.display());

    let mut input = BufReader::new(
        File::open(tar_path)
            .with_context(|| format!("Failed to open archive: {}", tar_path.display()))?,
    );
    let output = File::create(gz_path)
        .with_context(|| format!("Failed to create compressed archive: {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::best());

    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        ensure_not_cancelled(cancel)?;
        let read = input
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", tar_path.display()))?;
        if read == 0 {
            break;
        }
        encoder
            .write_all(&buffer[..read])
            .with_context(|| format!("Failed to compress {}", tar_path.display()))?;
    }
    encoder
        .finish()
        .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
        .and_then(|file| file.sync_all())
        .with_context(|| {
            format!("Failed to finish Gzip encoding for archive: {}", gz_path.display())
        })?;

    fs::remove_file(tar_path)
        .with_context(|| format!("Failed to remove uncompressed archive: {}", tar_path.display()))?;
    info!("✓ Compressed archive written to {}", gz_path.display());
    Ok(())
}
