//! Data Loader - parses a located CSV source and applies the two
//! normalization passes, memoized per source.

use crate::dataset::{Column, Dataset, Value};
use crate::error::Result;
use crate::locator::CsvSource;
use crate::prompt::Variant;
use dashmap::DashMap;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Derived column holding the trimmed, lowercased runner name
pub const NAME_CLEAN: &str = "NAME_CLEAN";

/// Name columns, in priority order
pub const NAME_COLUMNS: [&str; 4] = ["NAME", "Name", "Runner", "Athlete"];

/// Parse and normalize a source. No caching.
pub fn load_dataset(source: &CsvSource, variant: Variant) -> Result<Dataset> {
    let mut dataset = match source {
        CsvSource::File(path) => Dataset::from_csv_reader(std::fs::File::open(path)?)?,
        CsvSource::Upload { bytes, .. } => Dataset::from_csv_reader(Cursor::new(bytes.as_slice()))?,
    };

    if let Some(source_col) = normalize_names(&mut dataset)? {
        debug!("Derived {} from column {}", NAME_CLEAN, source_col);
    }
    let coerced = coerce_numeric(&mut dataset, variant.coercion_pattern());
    if !coerced.is_empty() {
        debug!("Numeric coercion applied to {:?}", coerced);
    }

    info!(
        "Loaded {} ({} rows, {} columns)",
        source.display_name(),
        dataset.row_count(),
        dataset.width()
    );
    Ok(dataset)
}

/// Add `NAME_CLEAN` from the first name column present. Returns the source
/// column name, or `None` when no name column exists.
pub fn normalize_names(dataset: &mut Dataset) -> Result<Option<String>> {
    let Some(source) = NAME_COLUMNS
        .iter()
        .find_map(|name| dataset.column(name))
    else {
        return Ok(None);
    };

    let source_name = source.name.clone();
    let cleaned: Vec<Value> = source
        .values
        .iter()
        .map(|v| match v {
            // Missing names stay missing rather than becoming the text "nan"
            Value::Null => Value::Null,
            other => Value::Text(other.to_string().trim().to_lowercase()),
        })
        .collect();

    dataset.upsert_column(Column::new(NAME_CLEAN, cleaned))?;
    Ok(Some(source_name))
}

/// Coerce text cells to numbers in every column whose name matches
/// `pattern`. Cells that don't parse keep their original text. Returns the
/// names of the matched columns.
pub fn coerce_numeric(dataset: &mut Dataset, pattern: &Regex) -> Vec<String> {
    let mut matched = Vec::new();
    for column in dataset.columns_mut() {
        if !pattern.is_match(&column.name) {
            continue;
        }
        for value in column.values.iter_mut() {
            if let Value::Text(raw) = value {
                if let Some(number) = Value::parse_number(raw) {
                    *value = number;
                }
            }
        }
        matched.push(column.name.clone());
    }
    matched
}

/// Identity of a CSV source for memoization
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    File {
        path: PathBuf,
        modified: Option<SystemTime>,
        len: u64,
    },
    Upload {
        sha256: String,
    },
}

impl SourceKey {
    pub fn for_source(source: &CsvSource) -> Result<Self> {
        match source {
            CsvSource::File(path) => {
                let meta = std::fs::metadata(path)?;
                Ok(SourceKey::File {
                    path: std::fs::canonicalize(path)?,
                    modified: meta.modified().ok(),
                    len: meta.len(),
                })
            }
            CsvSource::Upload { bytes, .. } => {
                let digest = Sha256::digest(bytes);
                Ok(SourceKey::Upload {
                    sha256: hex::encode(digest),
                })
            }
        }
    }

    /// Two keys share a slot when one would supersede the other: the same
    /// file at another version, or any two uploads.
    fn same_slot(&self, other: &SourceKey) -> bool {
        match (self, other) {
            (SourceKey::File { path: a, .. }, SourceKey::File { path: b, .. }) => a == b,
            (SourceKey::Upload { .. }, SourceKey::Upload { .. }) => true,
            _ => false,
        }
    }
}

/// Loaded datasets keyed by source identity and variant. Holds at most one
/// version per file and one upload per variant.
#[derive(Default)]
pub struct DatasetCache {
    entries: DashMap<(SourceKey, Variant), Arc<Dataset>>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, source: &CsvSource, variant: Variant) -> Result<Arc<Dataset>> {
        let key = (SourceKey::for_source(source)?, variant);
        if let Some(hit) = self.entries.get(&key) {
            debug!("Dataset cache hit for {}", source.display_name());
            return Ok(Arc::clone(hit.value()));
        }

        let dataset = Arc::new(load_dataset(source, variant)?);
        self.entries.retain(|(cached, cached_variant), _| {
            !(*cached_variant == variant && cached.same_slot(&key.0))
        });
        self.entries.insert(key, Arc::clone(&dataset));
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ColumnKind;

    fn upload(text: &str) -> CsvSource {
        CsvSource::Upload {
            name: "results.csv".to_string(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_race_results_scenario() {
        let source = upload("YEAR,Gender,NAME,POSITION\n2024,m,John Doe,1\n2024,f,Jane Roe,1\n");
        let ds = load_dataset(&source, Variant::Guided).unwrap();

        assert_eq!(ds.width(), 5);
        assert_eq!(ds.column_names().last(), Some(&NAME_CLEAN));
        let clean = ds.column(NAME_CLEAN).unwrap();
        assert_eq!(clean.values[0], Value::Text("john doe".into()));
        assert_eq!(clean.values[1], Value::Text("jane roe".into()));
    }

    #[test]
    fn test_name_priority_order() {
        let mut ds =
            Dataset::from_csv_reader("Athlete,Name\n  ALPHA ,  Beta Gamma  \n".as_bytes()).unwrap();
        assert_eq!(normalize_names(&mut ds).unwrap().as_deref(), Some("Name"));
        assert_eq!(
            ds.column(NAME_CLEAN).unwrap().values[0],
            Value::Text("beta gamma".into())
        );
    }

    #[test]
    fn test_runner_and_athlete_columns() {
        let mut ds = Dataset::from_csv_reader("Runner\n Émile ZOLA \n".as_bytes()).unwrap();
        normalize_names(&mut ds).unwrap();
        assert_eq!(
            ds.column(NAME_CLEAN).unwrap().values[0],
            Value::Text("émile zola".into())
        );

        let mut ds = Dataset::from_csv_reader("Athlete\nX\n".as_bytes()).unwrap();
        assert_eq!(normalize_names(&mut ds).unwrap().as_deref(), Some("Athlete"));
    }

    #[test]
    fn test_no_name_column_adds_nothing() {
        let mut ds = Dataset::from_csv_reader("name,runner_id\nx,1\n".as_bytes()).unwrap();
        assert_eq!(normalize_names(&mut ds).unwrap(), None);
        assert_eq!(ds.width(), 2);
        assert!(ds.column(NAME_CLEAN).is_none());
    }

    #[test]
    fn test_existing_name_clean_is_replaced() {
        let mut ds = Dataset::from_csv_reader("NAME_CLEAN,NAME\nold,New Name\n".as_bytes()).unwrap();
        normalize_names(&mut ds).unwrap();
        assert_eq!(ds.width(), 2);
        assert_eq!(ds.columns()[0].values[0], Value::Text("new name".into()));
    }

    #[test]
    fn test_numeric_names_are_stringified() {
        let mut ds = Dataset::from_csv_reader("NAME\n42\n\"\"\n".as_bytes()).unwrap();
        normalize_names(&mut ds).unwrap();
        let clean = ds.column(NAME_CLEAN).unwrap();
        assert_eq!(clean.values[0], Value::Text("42".into()));
        assert_eq!(clean.values[1], Value::Null);
    }

    #[test]
    fn test_soft_coercion_keeps_unparseable_text() {
        let mut ds = Dataset::from_csv_reader(
            "FINISH_TIME,LAPS_COMPLETED,Gender\n12.5,10,m\n10:02:03,DNF,f\n".as_bytes(),
        )
        .unwrap();
        let matched = coerce_numeric(&mut ds, Variant::Guided.coercion_pattern());
        assert_eq!(matched, vec!["FINISH_TIME", "LAPS_COMPLETED"]);

        let time = ds.column("FINISH_TIME").unwrap();
        assert_eq!(time.values[0], Value::Float(12.5));
        assert_eq!(time.values[1], Value::Text("10:02:03".into()));
        assert_eq!(time.kind(), ColumnKind::Mixed);

        let laps = ds.column("LAPS_COMPLETED").unwrap();
        assert_eq!(laps.values[0], Value::Int(10));
        assert_eq!(laps.values[1], Value::Text("DNF".into()));

        assert_eq!(ds.column("Gender").unwrap().values[0], Value::Text("m".into()));
    }

    #[test]
    fn test_keyword_sets_differ_by_variant() {
        let text = "Lap,Min Split,Seconds,Distance\n1,2,3,4\n";

        let mut classic = Dataset::from_csv_reader(text.as_bytes()).unwrap();
        let matched = coerce_numeric(&mut classic, Variant::Classic.coercion_pattern());
        assert_eq!(matched, vec!["Lap", "Min Split", "Seconds", "Distance"]);

        let mut guided = Dataset::from_csv_reader(text.as_bytes()).unwrap();
        let matched = coerce_numeric(&mut guided, Variant::Guided.coercion_pattern());
        assert_eq!(matched, vec!["Seconds", "Distance"]);
    }

    #[test]
    fn test_cache_reuses_parsed_dataset() {
        let cache = DatasetCache::new();
        let source = upload("NAME,LAPS\nA,1\n");
        let first = cache.get_or_load(&source, Variant::Guided).unwrap();
        let second = cache.get_or_load(&source, Variant::Guided).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let other = upload("NAME,LAPS\nB,2\n");
        let third = cache.get_or_load(&other, Variant::Guided).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(cache.len(), 1);

        cache.get_or_load(&other, Variant::Classic).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_keeps_only_latest_upload() {
        let cache = DatasetCache::new();
        for i in 0..50 {
            cache
                .get_or_load(&upload(&format!("NAME,LAPS\nA,{}\n", i)), Variant::Guided)
                .unwrap();
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_drops_stale_file_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KYRK_RESULTS.csv");
        let source = CsvSource::File(path.clone());
        let cache = DatasetCache::new();

        std::fs::write(&path, "NAME\nA\n").unwrap();
        cache.get_or_load(&source, Variant::Guided).unwrap();
        std::fs::write(&path, "NAME\nA\nB\n").unwrap();
        cache.get_or_load(&source, Variant::Guided).unwrap();
        std::fs::write(&path, "NAME\nA\nB\nC\n").unwrap();
        let latest = cache.get_or_load(&source, Variant::Guided).unwrap();

        assert_eq!(latest.row_count(), 3);
        assert_eq!(cache.len(), 1);

        cache.get_or_load(&upload("NAME\nZ\n"), Variant::Guided).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_keys_files_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KYRK_RESULTS.csv");
        std::fs::write(&path, "NAME\nA\n").unwrap();

        let cache = DatasetCache::new();
        let source = CsvSource::File(path);
        let first = cache.get_or_load(&source, Variant::Classic).unwrap();
        let second = cache.get_or_load(&source, Variant::Classic).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_malformed_csv_is_fatal() {
        let err = load_dataset(&upload("A,B\n1\n"), Variant::Guided).unwrap_err();
        assert!(err.to_string().starts_with("CSV error"));
    }
}
