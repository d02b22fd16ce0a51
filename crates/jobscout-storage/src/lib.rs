//! Catalog persistence for jobscout.
//!
//! The catalog is a single YAML document holding every tracked listing. Two
//! document shapes exist in the wild: a bare top-level list, and a mapping
//! that wraps the list under a named key (historically `internships`) next to
//! other bookkeeping keys. Both are detected on load and reproduced on save,
//! including the wrapper's unrelated keys and their order.
//!
//! Persistence is snapshot-replace: the whole document is loaded, mutated in
//! memory, and rewritten atomically. Callers must drain all in-flight work
//! that mutates records before saving, or concurrent updates get discarded.

use std::fs;
use std::path::{Path, PathBuf};

use jobscout_core::JobRecord;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobscout-storage";

/// Wrapper key used when a brand-new wrapped catalog has to be written.
pub const DEFAULT_LIST_KEY: &str = "internships";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog not found: {0}")]
    NotFound(PathBuf),
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog is structurally invalid: {0}")]
    Parse(String),
    #[error("duplicate url in catalog: {0}")]
    DuplicateUrl(String),
}

#[derive(Debug, Clone)]
enum DocumentShape {
    BareList,
    /// The original top-level mapping, kept whole so non-list keys and their
    /// order survive a save. `key` names the entry holding the record list.
    Wrapped { key: String, doc: Mapping },
}

/// In-memory catalog plus enough of the source document to save it back in
/// the same shape.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub records: Vec<JobRecord>,
    shape: DocumentShape,
}

impl Catalog {
    /// A fresh bare-list catalog, mainly for tests and bootstrap.
    pub fn from_records(records: Vec<JobRecord>) -> Self {
        Self {
            records,
            shape: DocumentShape::BareList,
        }
    }

    /// The wrapper key when the source document was a mapping.
    pub fn wrapper_key(&self) -> Option<&str> {
        match &self.shape {
            DocumentShape::BareList => None,
            DocumentShape::Wrapped { key, .. } => Some(key),
        }
    }

    pub fn index_by_url(&self, url: &str) -> Option<usize> {
        self.records.iter().position(|r| r.url == url)
    }
}

/// Loads and saves the catalog document at a fixed path.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Catalog, CatalogError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    context: "reading",
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let doc: Value = serde_yaml::from_str(&text)
            .map_err(|e| CatalogError::Parse(format!("{}: {e}", self.path.display())))?;

        let (list, shape) = match doc {
            Value::Null => (Value::Sequence(Vec::new()), DocumentShape::BareList),
            Value::Sequence(seq) => (Value::Sequence(seq), DocumentShape::BareList),
            Value::Mapping(map) => {
                let key = detect_list_key(&map).ok_or_else(|| {
                    CatalogError::Parse(format!(
                        "{}: top-level mapping has no list-valued key",
                        self.path.display()
                    ))
                })?;
                let list = map
                    .get(key.as_str())
                    .cloned()
                    .unwrap_or(Value::Sequence(Vec::new()));
                (list, DocumentShape::Wrapped { key, doc: map })
            }
            other => {
                return Err(CatalogError::Parse(format!(
                    "{}: expected a list or mapping, got {other:?}",
                    self.path.display()
                )));
            }
        };

        let records: Vec<JobRecord> = serde_yaml::from_value(list)
            .map_err(|e| CatalogError::Parse(format!("{}: {e}", self.path.display())))?;
        validate_urls(&records)?;

        debug!(
            path = %self.path.display(),
            records = records.len(),
            wrapped = matches!(shape, DocumentShape::Wrapped { .. }),
            "catalog loaded"
        );
        Ok(Catalog { records, shape })
    }

    /// Rewrite the whole document, preserving the loaded shape. The write
    /// goes through a sibling temp file and an atomic rename.
    pub fn save(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        validate_urls(&catalog.records)?;

        let list = serde_yaml::to_value(&catalog.records)
            .map_err(|e| CatalogError::Parse(format!("serializing records: {e}")))?;
        let doc = match &catalog.shape {
            DocumentShape::BareList => list,
            DocumentShape::Wrapped { key, doc } => {
                let mut map = doc.clone();
                map.insert(Value::String(key.clone()), list);
                Value::Mapping(map)
            }
        };

        let text = serde_yaml::to_string(&doc)
            .map_err(|e| CatalogError::Parse(format!("serializing catalog: {e}")))?;

        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text).map_err(|source| CatalogError::Io {
            context: "writing",
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| CatalogError::Io {
            context: "renaming temp catalog into",
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), records = catalog.records.len(), "catalog saved");
        Ok(())
    }
}

/// Prefer the historical `internships` key, otherwise the first key whose
/// value is a sequence.
fn detect_list_key(map: &Mapping) -> Option<String> {
    if matches!(map.get(DEFAULT_LIST_KEY), Some(Value::Sequence(_))) {
        return Some(DEFAULT_LIST_KEY.to_string());
    }
    map.iter().find_map(|(k, v)| match (k, v) {
        (Value::String(key), Value::Sequence(_)) => Some(key.clone()),
        _ => None,
    })
}

/// `url` is the identity key: it must be present and unique.
fn validate_urls(records: &[JobRecord]) -> Result<(), CatalogError> {
    let mut seen = std::collections::HashSet::new();
    for (i, record) in records.iter().enumerate() {
        if record.url.trim().is_empty() {
            return Err(CatalogError::Parse(format!("record {i} has no url")));
        }
        if !seen.insert(record.url.as_str()) {
            return Err(CatalogError::DuplicateUrl(record.url.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(url: &str) -> JobRecord {
        JobRecord {
            company: "ACME".to_string(),
            title: "AI Engineer".to_string(),
            url: url.to_string(),
            ..JobRecord::default()
        }
    }

    #[test]
    fn missing_file_is_distinguishable_from_empty_catalog() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("absent.yaml"));
        assert!(matches!(store.load(), Err(CatalogError::NotFound(_))));

        let empty = dir.path().join("empty.yaml");
        fs::write(&empty, "[]\n").expect("write");
        let catalog = CatalogStore::new(&empty).load().expect("load");
        assert!(catalog.records.is_empty());
    }

    #[test]
    fn bare_list_roundtrip_keeps_shape_and_field_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        let store = CatalogStore::new(&path);

        store
            .save(&Catalog::from_records(vec![record("https://e.com/1")]))
            .expect("save");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.trim_start().starts_with('-'), "expected bare list: {text}");
        let company_at = text.find("company:").expect("company");
        let url_at = text.find("url:").expect("url");
        let status_at = text.find("status:").expect("status");
        assert!(company_at < url_at && url_at < status_at);

        let loaded = store.load().expect("load");
        assert_eq!(loaded.wrapper_key(), None);
        assert_eq!(loaded.records.len(), 1);
    }

    #[test]
    fn wrapped_document_preserves_wrapper_and_extra_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        fs::write(
            &path,
            concat!(
                "version: 2\n",
                "internships:\n",
                "- company: ACME\n",
                "  title: AI Engineer\n",
                "  url: https://e.com/1\n",
                "notes: keep me\n",
            ),
        )
        .expect("write");

        let store = CatalogStore::new(&path);
        let mut catalog = store.load().expect("load");
        assert_eq!(catalog.wrapper_key(), Some("internships"));
        catalog.records.push(record("https://e.com/2"));
        store.save(&catalog).expect("save");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("version: 2"));
        assert!(text.contains("notes: keep me"));
        assert!(text.find("version").expect("v") < text.find("internships").expect("i"));

        let reloaded = store.load().expect("reload");
        assert_eq!(reloaded.records.len(), 2);
    }

    #[test]
    fn wrapped_document_with_custom_list_key() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        fs::write(&path, "jobs:\n- url: https://e.com/1\n").expect("write");
        let catalog = CatalogStore::new(&path).load().expect("load");
        assert_eq!(catalog.wrapper_key(), Some("jobs"));
    }

    #[test]
    fn duplicate_url_is_rejected_at_the_boundary() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        fs::write(
            &path,
            "- url: https://e.com/1\n- url: https://e.com/1\n",
        )
        .expect("write");
        assert!(matches!(
            CatalogStore::new(&path).load(),
            Err(CatalogError::DuplicateUrl(_))
        ));
    }

    #[test]
    fn structurally_invalid_document_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        fs::write(&path, "just a scalar\n").expect("write");
        assert!(matches!(
            CatalogStore::new(&path).load(),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn mapping_without_list_key_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        fs::write(&path, "name: nothing here\n").expect("write");
        assert!(matches!(
            CatalogStore::new(&path).load(),
            Err(CatalogError::Parse(_))
        ));
    }
}
