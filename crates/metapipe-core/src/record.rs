//! Record loading: bounded reads and schema validation of side-car YAML.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::RunConfig;
use crate::domain::record::Record;
use crate::domain::stage::StageKind;
use crate::locator::{normalize_locator, LocatorError, LocatorPolicy};

/// Why a record file could not become a [`Record`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read file: {0}")]
    Unreadable(String),

    #[error("record exceeds limits.max_record_bytes={limit}")]
    TooLarge { limit: u64 },

    #[error("malformed YAML: {0}")]
    Malformed(String),

    #[error("invalid record: {0}")]
    Schema(String),

    #[error(transparent)]
    Locator(#[from] LocatorError),
}

impl LoadError {
    /// Stage the failure is reported under.
    pub fn stage(&self) -> StageKind {
        match self {
            LoadError::Unreadable(_) => StageKind::Discovery,
            LoadError::Locator(_) => StageKind::Locator,
            _ => StageKind::Parse,
        }
    }
}

/// Read at most `limit` bytes of `path`, failing if the file is longer.
pub fn read_limited(path: &Path, limit: u64) -> Result<Vec<u8>, LoadError> {
    let file = File::open(path).map_err(|e| LoadError::Unreadable(e.to_string()))?;
    let mut buf = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| LoadError::Unreadable(e.to_string()))?;
    if buf.len() as u64 > limit {
        return Err(LoadError::TooLarge { limit });
    }
    Ok(buf)
}

/// Parse and validate one record document.
pub fn parse_record(
    bytes: &[u8],
    allow_unknown_keys: bool,
    policy: &LocatorPolicy,
) -> Result<Record, LoadError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_slice(bytes).map_err(|e| LoadError::Malformed(e.to_string()))?;
    let serde_yaml::Value::Mapping(mapping) = doc else {
        return Err(LoadError::Schema(
            "top level must be a mapping with `locator` and `meta`".to_string(),
        ));
    };

    let mut locator = None;
    let mut meta = None;
    for (key, value) in mapping {
        let serde_yaml::Value::String(key) = key else {
            return Err(LoadError::Schema("top-level keys must be strings".to_string()));
        };
        match key.as_str() {
            "locator" => locator = Some(value),
            "meta" => meta = Some(value),
            other if !allow_unknown_keys => {
                return Err(LoadError::Schema(format!("unknown top-level key `{other}`")));
            }
            _ => {}
        }
    }

    let locator = match locator {
        Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s,
        Some(_) => {
            return Err(LoadError::Schema(
                "`locator` must be a non-empty string".to_string(),
            ))
        }
        None => return Err(LoadError::Schema("missing `locator`".to_string())),
    };
    let meta = match meta {
        Some(value) => serde_json::to_value(&value)
            .map_err(|e| LoadError::Schema(format!("`meta` is not JSON-compatible: {e}")))?,
        None => return Err(LoadError::Schema("missing `meta`".to_string())),
    };
    if !meta.is_object() {
        return Err(LoadError::Schema("`meta` must be a mapping".to_string()));
    }

    let locator = normalize_locator(&locator, policy)?;
    Ok(Record::new(locator, meta))
}

/// Read and parse the record file at `path` under `config`'s limits.
pub fn load_record(path: &Path, config: &RunConfig) -> Result<Record, LoadError> {
    let bytes = read_limited(path, config.limits.max_record_bytes)?;
    parse_record(&bytes, config.records.allow_unknown_keys, &config.locator_policy)
}
