use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

use arrow::array::{Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use thiserror::Error;
use tracing::{info, warn};

use vault_core::config::CatalogConfig;
use vault_core::{Classify, EntityId, FailureKind, FilingReference, LogicalPath};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Invalid JSON on line {line}: {message}")]
    Json { line: usize, message: String },

    #[error("Catalog has no column {0:?}")]
    MissingColumn(String),

    #[error("Unsupported catalog format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid filing {path:?} for entity {entity}: {reason}")]
    InvalidRow {
        entity: EntityId,
        path: String,
        reason: String,
    },

    #[error("Entity {entity} has filings under both {first} and {other}")]
    InconsistentPaths {
        entity: EntityId,
        first: LogicalPath,
        other: LogicalPath,
    },
}

impl Classify for CatalogError {
    fn kind(&self) -> FailureKind {
        match self {
            CatalogError::InvalidRow { .. } | CatalogError::InconsistentPaths { .. } => FailureKind::Unexpected,
            _ => FailureKind::Config,
        }
    }
}

/// Every filing of one entity, in catalog order, under one logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFilings {
    pub entity_id: EntityId,
    pub logical_path: LogicalPath,
    pub filings: Vec<FilingReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The catalog lists nothing for this entity.
    NoFilings,
    Filings(EntityFilings),
}

/// Read-only lookup from entity id to the remote paths of its filings.
#[derive(Debug, Default)]
pub struct FilingsCatalog {
    rows: HashMap<EntityId, Vec<String>>,
}

impl FilingsCatalog {
    pub fn from_rows<I, E, P>(rows: I) -> Self
    where
        I: IntoIterator<Item = (E, P)>,
        E: Into<EntityId>,
        P: Into<String>,
    {
        let mut catalog = Self::default();
        for (entity, path) in rows {
            catalog.insert(entity.into(), path.into());
        }
        catalog
    }

    fn insert(&mut self, entity: EntityId, path: String) {
        let path = path.trim().to_string();
        if entity.is_empty() || path.is_empty() {
            return;
        }
        self.rows.entry(entity).or_default().push(path);
    }

    /// Load a parquet (`.parquet`) or JSON-lines (`.jsonl`, `.json`) catalog.
    pub fn load(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let ext = config
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let catalog = match ext.as_str() {
            "parquet" => Self::load_parquet(&config.path, &config.entity_column, &config.path_column)?,
            "jsonl" | "json" => Self::load_jsonl(&config.path, &config.entity_column, &config.path_column)?,
            other => return Err(CatalogError::UnsupportedFormat(other.to_string())),
        };
        info!(
            path = %config.path.display(),
            entities = catalog.len(),
            filings = catalog.filing_count(),
            "Loaded filings catalog"
        );
        Ok(catalog)
    }

    fn load_parquet(path: &Path, entity_column: &str, path_column: &str) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| CatalogError::Parquet(e.to_string()))?;
        let reader = builder.build().map_err(|e| CatalogError::Parquet(e.to_string()))?;

        let mut catalog = Self::default();
        for batch_result in reader {
            let batch = batch_result.map_err(|e| CatalogError::Parquet(e.to_string()))?;

            // Ids are often stored as integers or floats; compare them as text.
            let as_text = |name: &str| -> Result<StringArray, CatalogError> {
                let column = batch
                    .column_by_name(name)
                    .ok_or_else(|| CatalogError::MissingColumn(name.to_string()))?;
                let casted = cast(column, &DataType::Utf8).map_err(|e| CatalogError::Parquet(e.to_string()))?;
                casted
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .cloned()
                    .ok_or_else(|| CatalogError::Parquet(format!("column {name:?} is not text")))
            };
            let entities = as_text(entity_column)?;
            let paths = as_text(path_column)?;

            for row_idx in 0..batch.num_rows() {
                if entities.is_null(row_idx) || paths.is_null(row_idx) {
                    continue;
                }
                catalog.insert(
                    entity_from_text(entities.value(row_idx)),
                    paths.value(row_idx).to_string(),
                );
            }
        }
        Ok(catalog)
    }

    fn load_jsonl(path: &Path, entity_column: &str, path_column: &str) -> Result<Self, CatalogError> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut catalog = Self::default();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line).map_err(|e| CatalogError::Json {
                line: idx + 1,
                message: e.to_string(),
            })?;

            let field = |name: &str| match value.get(name) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            match (field(entity_column), field(path_column)) {
                (Some(entity), Some(path)) => catalog.insert(entity_from_text(&entity), path),
                _ => warn!(line = idx + 1, "Catalog row missing entity or path, skipping"),
            }
        }
        Ok(catalog)
    }

    /// All filings for `entity`, de-duplicated in catalog order.
    pub fn resolve(&self, entity: &EntityId) -> Result<Resolution, CatalogError> {
        let Some(paths) = self.rows.get(entity) else {
            return Ok(Resolution::NoFilings);
        };

        let mut seen = HashSet::new();
        let mut filings: Vec<FilingReference> = Vec::with_capacity(paths.len());
        for path in paths {
            if !seen.insert(path.as_str()) {
                continue;
            }
            let reference =
                FilingReference::from_remote_path(entity.clone(), path).map_err(|e| CatalogError::InvalidRow {
                    entity: entity.clone(),
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            if let Some(first) = filings.first() {
                if first.logical_path != reference.logical_path {
                    return Err(CatalogError::InconsistentPaths {
                        entity: entity.clone(),
                        first: first.logical_path.clone(),
                        other: reference.logical_path,
                    });
                }
            }
            filings.push(reference);
        }

        match filings.first() {
            None => Ok(Resolution::NoFilings),
            Some(first) => Ok(Resolution::Filings(EntityFilings {
                entity_id: entity.clone(),
                logical_path: first.logical_path.clone(),
                filings,
            })),
        }
    }

    /// Number of entities with at least one row.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn filing_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

/// `"1001.0"` from a float column names the same entity as `"1001"`.
fn entity_from_text(raw: &str) -> EntityId {
    let trimmed = raw.trim();
    EntityId::new(trimmed.strip_suffix(".0").unwrap_or(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;

    fn config(path: &Path) -> CatalogConfig {
        CatalogConfig {
            path: path.to_path_buf(),
            entity_column: "cik".into(),
            path_column: "SECFNAME".into(),
        }
    }

    fn filings(resolution: Resolution) -> EntityFilings {
        match resolution {
            Resolution::Filings(f) => f,
            Resolution::NoFilings => panic!("expected filings"),
        }
    }

    #[test]
    fn resolve_groups_and_dedupes_in_order() {
        let catalog = FilingsCatalog::from_rows([
            ("1001", "edgar/data/1001/b.txt"),
            ("2002", "edgar/data/2002/x.txt"),
            ("1001", "edgar/data/1001/a.txt"),
            ("0001001", "edgar/data/1001/b.txt"),
        ]);

        let resolved = filings(catalog.resolve(&EntityId::new("1001")).unwrap());
        assert_eq!(resolved.logical_path.as_str(), "edgar/data/1001");
        let names: Vec<_> = resolved.filings.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["b.txt", "a.txt"]);
    }

    #[test]
    fn unknown_entity_has_no_filings() {
        let catalog = FilingsCatalog::from_rows([("1001", "edgar/data/1001/a.txt")]);
        assert_eq!(catalog.resolve(&EntityId::new("9")).unwrap(), Resolution::NoFilings);
    }

    #[test]
    fn mixed_directories_are_rejected() {
        let catalog = FilingsCatalog::from_rows([
            ("1001", "edgar/data/1001/a.txt"),
            ("1001", "edgar/data/9999/b.txt"),
        ]);
        let err = catalog.resolve(&EntityId::new("1001")).unwrap_err();
        assert!(matches!(err, CatalogError::InconsistentPaths { .. }));
        assert_eq!(err.kind(), FailureKind::Unexpected);
    }

    #[test]
    fn malformed_path_is_an_invalid_row() {
        let catalog = FilingsCatalog::from_rows([("1001", "no-directory.txt")]);
        let err = catalog.resolve(&EntityId::new("1001")).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidRow { .. }));
    }

    #[test]
    fn loads_parquet_with_integer_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.parquet");

        let schema = Arc::new(Schema::new(vec![
            Field::new("cik", DataType::Int64, false),
            Field::new("SECFNAME", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1001, 1001, 2002])),
                Arc::new(StringArray::from(vec![
                    Some("edgar/data/1001/a.txt"),
                    Some("edgar/data/1001/b.txt"),
                    None,
                ])),
            ],
        )
        .unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let catalog = FilingsCatalog::load(&config(&path)).unwrap();
        assert_eq!(catalog.len(), 1);
        let resolved = filings(catalog.resolve(&EntityId::new("1001")).unwrap());
        assert_eq!(resolved.filings.len(), 2);
    }

    #[test]
    fn loads_jsonl_with_float_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        std::fs::write(
            &path,
            "{\"cik\": 1001.0, \"SECFNAME\": \"edgar/data/1001/a.txt\"}\n\
             \n\
             {\"cik\": \"1001\", \"SECFNAME\": \"edgar/data/1001/b.txt\"}\n\
             {\"cik\": \"3\"}\n",
        )
        .unwrap();

        let catalog = FilingsCatalog::load(&config(&path)).unwrap();
        let resolved = filings(catalog.resolve(&EntityId::new("1001")).unwrap());
        assert_eq!(resolved.filings.len(), 2);
        assert_eq!(catalog.resolve(&EntityId::new("3")).unwrap(), Resolution::NoFilings);
    }

    #[test]
    fn missing_column_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("other", DataType::Utf8, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let err = FilingsCatalog::load(&config(&path)).unwrap_err();
        assert!(matches!(err, CatalogError::MissingColumn(ref c) if c == "cik"));
        assert_eq!(err.kind(), FailureKind::Config);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = FilingsCatalog::load(&config(Path::new("catalog.csv"))).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedFormat(_)));
    }
}
