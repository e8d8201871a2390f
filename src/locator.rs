//! CSV Locator - decides which spreadsheet feeds the session

use crate::error::{KyrkError, Result};
use globset::Glob;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File picked ahead of any other CSV in the working directory
pub const CANONICAL_CSV: &str = "KYRK_RESULTS.csv";

/// A readable source of tabular data
#[derive(Clone, PartialEq, Eq)]
pub enum CsvSource {
    File(PathBuf),
    Upload { name: String, bytes: Vec<u8> },
}

impl CsvSource {
    pub fn display_name(&self) -> String {
        match self {
            CsvSource::File(path) => path.display().to_string(),
            CsvSource::Upload { name, .. } => format!("upload:{}", name),
        }
    }
}

impl fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvSource::File(path) => f.debug_tuple("File").field(path).finish(),
            CsvSource::Upload { name, bytes } => f
                .debug_struct("Upload")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// Pick the data source: the canonical file, else the first `*.csv` in the
/// directory listing, else the upload.
pub fn locate_csv(dir: &Path, upload: Option<&CsvSource>) -> Result<CsvSource> {
    let canonical = dir.join(CANONICAL_CSV);
    if canonical.is_file() {
        info!("Using {}", canonical.display());
        return Ok(CsvSource::File(canonical));
    }

    if let Some(found) = first_csv(dir)? {
        info!("{} not found, using {}", CANONICAL_CSV, found.display());
        return Ok(CsvSource::File(found));
    }

    if let Some(upload) = upload {
        debug!("No CSV on disk, using {}", upload.display_name());
        return Ok(upload.clone());
    }

    Err(KyrkError::NoDataSource(dir.display().to_string()))
}

/// First non-hidden directory entry matching `*.csv`, in listing order.
fn first_csv(dir: &Path) -> Result<Option<PathBuf>> {
    let matcher = Glob::new("*.csv")
        .map_err(|e| KyrkError::Query(format!("invalid glob: {}", e)))?
        .compile_matcher();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        // `*` in globset also matches a leading dot
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if matcher.is_match(Path::new(&name)) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_hidden_csv_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".backup.csv"), "A\n1\n").unwrap();

        let err = locate_csv(dir.path(), None).unwrap_err();
        assert!(matches!(err, KyrkError::NoDataSource(_)));

        fs::write(dir.path().join("results.csv"), "A\n1\n").unwrap();
        let source = locate_csv(dir.path(), None).unwrap();
        assert_eq!(source, CsvSource::File(dir.path().join("results.csv")));
    }

    #[test]
    fn test_canonical_name_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("aaa.csv"), "A\n1\n").unwrap();
        fs::write(dir.path().join("zzz.csv"), "A\n1\n").unwrap();
        fs::write(dir.path().join(CANONICAL_CSV), "A\n1\n").unwrap();

        let source = locate_csv(dir.path(), None).unwrap();
        assert_eq!(source, CsvSource::File(dir.path().join(CANONICAL_CSV)));
    }

    #[test]
    fn test_falls_back_to_any_csv() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("results_2024.csv"), "A\n1\n").unwrap();

        let upload = CsvSource::Upload {
            name: "u.csv".into(),
            bytes: b"A\n2\n".to_vec(),
        };
        let source = locate_csv(dir.path(), Some(&upload)).unwrap();
        assert_eq!(source, CsvSource::File(dir.path().join("results_2024.csv")));
    }

    #[test]
    fn test_upload_used_when_directory_has_no_csv() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("folder.csv")).unwrap();

        let upload = CsvSource::Upload {
            name: "u.csv".into(),
            bytes: b"A\n2\n".to_vec(),
        };
        let source = locate_csv(dir.path(), Some(&upload)).unwrap();
        assert_eq!(source, upload);
    }

    #[test]
    fn test_nothing_available_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate_csv(dir.path(), None).unwrap_err();
        assert!(matches!(err, KyrkError::NoDataSource(_)));
        assert!(err.to_string().contains(CANONICAL_CSV));
    }

    #[test]
    fn test_upload_debug_hides_bytes() {
        let upload = CsvSource::Upload {
            name: "u.csv".into(),
            bytes: vec![b'x'; 64],
        };
        assert_eq!(format!("{:?}", upload), r#"Upload { name: "u.csv", len: 64 }"#);
    }
}
