//! Content-addressed storage for committed DICOM series.
//!
//! Storage locations are derived from the series identifier by a one-way
//! fixed-length hash, so identifiers of arbitrary length and content never
//! leak into filesystem paths and repeated operations on one series always
//! address the same location. Series directories are therefore disjoint and
//! can be processed without cross-series locking.

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("slice file {0:?} has no file name")]
    UnnamedSlice(PathBuf),
}

/// Stable, filesystem-safe directory name for a series identifier.
pub fn series_dirname(series_id: &str) -> String {
    let hash = Sha256::digest(series_id.as_bytes());
    format!("{hash:x}")
}

/// Move a validated slice set from the staging area into the permanent
/// per-series directory, returning the directory path.
///
/// Re-running for the same series identifier addresses the same directory,
/// so a retried upload overwrites its own earlier partial move and never
/// touches another series' files. If a move fails mid-way the partially
/// populated directory is removed.
pub fn move_slices(
    dicom_root: &Path,
    series_id: &str,
    slice_paths: &[PathBuf],
) -> Result<PathBuf, StoreError> {
    let series_dir = dicom_root.join(series_dirname(series_id));
    fs::create_dir_all(&series_dir)?;

    for slice_path in slice_paths {
        let name = slice_path
            .file_name()
            .ok_or_else(|| StoreError::UnnamedSlice(slice_path.clone()))?;
        if let Err(err) = fs::rename(slice_path, series_dir.join(name)) {
            let _ = fs::remove_dir_all(&series_dir);
            return Err(err.into());
        }
    }

    Ok(series_dir)
}

/// Compress a series directory into a sibling `<name>.tgz` archive and
/// delete the uncompressed copy. Raw slices are rarely revisited after
/// conversion, so restore-time cost is traded for storage savings.
///
/// On failure the partial archive is removed and the directory is left
/// intact.
pub fn archive_series(series_dir: &Path) -> Result<PathBuf, StoreError> {
    let archive_path = series_dir.with_extension("tgz");
    let dir_name = series_dir
        .file_name()
        .ok_or_else(|| StoreError::UnnamedSlice(series_dir.to_path_buf()))?;

    let result = (|| -> Result<(), StoreError> {
        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(dir_name, series_dir)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&archive_path);
        return Err(err);
    }

    fs::remove_dir_all(series_dir)?;
    Ok(archive_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn dirname_is_stable_hex_and_filesystem_safe() {
        let id = "1.2.840.113619.2.408/../unsafe id";
        let name = series_dirname(id);

        assert_eq!(name, series_dirname(id));
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, series_dirname("1.2.840.113619.2.409"));
    }

    #[test]
    fn move_slices_relocates_into_addressed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("staged");
        fs::create_dir_all(&staged).unwrap();
        let a = staged.join("00001.dcm");
        let b = staged.join("00002.dcm");
        fs::write(&a, b"one").unwrap();
        fs::write(&b, b"two").unwrap();

        let dicom_root = tmp.path().join("dicom");
        let series_dir = move_slices(&dicom_root, "1.2.3", &[a.clone(), b]).unwrap();

        assert_eq!(series_dir, dicom_root.join(series_dirname("1.2.3")));
        assert!(!a.exists());
        assert_eq!(fs::read(series_dir.join("00001.dcm")).unwrap(), b"one");
        assert_eq!(fs::read(series_dir.join("00002.dcm")).unwrap(), b"two");
    }

    #[test]
    fn archive_replaces_directory_with_tgz() {
        let tmp = tempfile::tempdir().unwrap();
        let series_dir = tmp.path().join("ab12");
        fs::create_dir_all(&series_dir).unwrap();
        fs::write(series_dir.join("00001.dcm"), b"slice").unwrap();

        let archive = archive_series(&series_dir).unwrap();

        assert_eq!(archive, tmp.path().join("ab12.tgz"));
        assert!(!series_dir.exists());

        let mut entries = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let names: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"ab12/00001.dcm".to_owned()));
    }
}
