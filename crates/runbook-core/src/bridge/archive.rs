//! Zip archive operations

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::{Array, Engine};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::HostBridge;
use super::fs::{files_below, normalize};
use crate::error::RunError;

/// Zip every regular file below `folder` into `zip_path`
///
/// Entry names are relative to `folder`. Returns the files added.
pub(crate) fn zip_folder(zip_path: &Path, folder: &Path) -> Result<Vec<PathBuf>, RunError> {
    let zip_abs = normalize(zip_path);
    let files: Vec<PathBuf> = files_below(folder)?
        .into_iter()
        .filter(|f| normalize(f) != zip_abs)
        .collect();

    let mut writer = ZipWriter::new(File::create(zip_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in &files {
        let name = file
            .strip_prefix(folder)
            .unwrap_or(file)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(name, options)?;
        io::copy(&mut File::open(file)?, &mut writer)?;
    }
    writer.finish()?;

    info!(archive = %zip_path.display(), files = files.len(), "archive created");
    Ok(files)
}

/// Extract `zip_path` into `dest`, returning the files written
///
/// Entries whose names would escape `dest` are rejected.
pub(crate) fn unzip(zip_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, RunError> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    let mut extracted = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(RunError::Execution(format!(
                "{}: entry {:?} escapes the destination",
                zip_path.display(),
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&target)?)?;
        extracted.push(target);
    }

    info!(archive = %zip_path.display(), files = extracted.len(), "archive extracted");
    Ok(extracted)
}

fn paths(files: &[PathBuf]) -> Array {
    files
        .iter()
        .map(|p| p.display().to_string().into())
        .collect()
}

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    let b = Arc::clone(bridge);
    engine.register_fn("ar_zip", move |zip: &str, folder: &str| {
        b.invoke("ar_zip", || {
            let folder = if folder.trim().is_empty() {
                b.cwd()
            } else {
                b.resolve_path(folder)
            };
            Ok(paths(&zip_folder(&b.resolve_path(zip), &folder)?))
        })
    });

    let b = Arc::clone(bridge);
    engine.register_fn("ar_unzip", move |zip: &str, dest: &str| {
        b.invoke("ar_unzip", || {
            let dest = if dest.trim().is_empty() {
                b.cwd()
            } else {
                b.resolve_path(dest)
            };
            Ok(paths(&unzip(&b.resolve_path(zip), &dest)?))
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "alpha").unwrap();
        fs::write(src.join("nested/b.bin"), [0u8, 159, 146, 150]).unwrap();

        let archive = dir.path().join("out.zip");
        let zipped = zip_folder(&archive, &src).unwrap();
        assert_eq!(zipped.len(), 2);

        let dest = dir.path().join("dest");
        let mut extracted = unzip(&archive, &dest).unwrap();
        extracted.sort();
        assert_eq!(extracted, vec![dest.join("a.txt"), dest.join("nested/b.bin")]);
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read(dest.join("nested/b.bin")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn test_archive_inside_folder_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let archive = dir.path().join("self.zip");
        fs::write(&archive, "stale").unwrap();

        let zipped = zip_folder(&archive, dir.path()).unwrap();
        assert_eq!(zipped, vec![dir.path().join("a.txt")]);
    }

    #[test]
    fn test_missing_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = unzip(&dir.path().join("nope.zip"), dir.path()).unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }
}
