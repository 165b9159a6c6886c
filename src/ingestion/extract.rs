//! ZIP extraction for downloaded archives

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::IngestError;

const DATA_EXTENSIONS: [&str; 2] = ["txt", "csv"];

fn archive_error(path: &Path, err: zip::result::ZipError) -> IngestError {
    IngestError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Unpacks `archive` into `dest` and returns the extracted data files.
///
/// Entries whose names would land outside `dest` are skipped.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let file = fs::File::open(archive).map_err(|e| IngestError::io(archive, &e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_error(archive, e))?;
    fs::create_dir_all(dest).map_err(|e| IngestError::io(dest, &e))?;

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| archive_error(archive, e))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "Skipping archive entry outside destination");
            continue;
        };

        let out_path = dest.join(&relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, &e))?;
        }
        let mut out = fs::File::create(&out_path).map_err(|e| IngestError::io(&out_path, &e))?;
        io::copy(&mut entry, &mut out).map_err(|e| IngestError::io(&out_path, &e))?;

        let is_data = out_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| DATA_EXTENSIONS.iter().any(|d| ext.eq_ignore_ascii_case(d)))
            .unwrap_or(false);
        if is_data {
            extracted.push(out_path);
        }
    }

    debug!(archive = %archive.display(), files = extracted.len(), "Extracted archive");
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extracts_data_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("COTAHIST_20240115.ZIP");
        write_zip(
            &archive,
            &[
                ("COTAHIST_20240115.TXT", b"header\nrow\n"),
                ("layout.pdf", b"%PDF"),
                ("../escape.txt", b"nope"),
            ],
        );

        let dest = dir.path().join("out");
        let files = extract_archive(&archive, &dest).expect("extract");

        assert_eq!(files, vec![dest.join("COTAHIST_20240115.TXT")]);
        assert_eq!(fs::read(&files[0]).unwrap(), b"header\nrow\n");
        assert!(dest.join("layout.pdf").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_not_a_zip_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.ZIP");
        fs::write(&bogus, b"not a zip").unwrap();

        let err = extract_archive(&bogus, dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }
}
