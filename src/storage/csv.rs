// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Flat-file (csv) backend implementation
//
// A delimited file has no ALTER TABLE: on schema drift the whole file is
// read, concatenated with the new batch and rewritten through a temporary
// sibling that is renamed over the original.

use super::backend::StorageBackend;
use super::reconcile::{plan, prepare_rows, SavePlan};
use super::registry::BackendTarget;
use crate::error::{Result, StatsError};
use crate::record::{is_base_column, ColumnSchema, ColumnType, Record};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Marker written for a missing value
pub const NULL_MARKER: &str = "\\N";

/// Csv backend writing one file per stream
pub struct CsvBackend {
    path: PathBuf,
    table_name: String,
}

/// Parsed content of the csv file
struct CsvTable {
    header: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl CsvTable {
    /// Stored schema; cell types widened with `hint` where it knows the column
    fn schema(&self, hint: &ColumnSchema) -> ColumnSchema {
        let columns = self
            .header
            .iter()
            .enumerate()
            .filter(|(_, name)| !is_base_column(name))
            .map(|(idx, name)| {
                let column_type = match (self.infer_column(idx), hint.get(name)) {
                    (Some(stored), Some(known)) => stored.widen(known),
                    (stored, known) => stored.or(known).unwrap_or(ColumnType::String),
                };
                (name.clone(), column_type)
            });
        ColumnSchema::from_columns(columns)
    }

    /// `None` when the column holds only nulls
    fn infer_column(&self, idx: usize) -> Option<ColumnType> {
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(infer_cell))
            .reduce(ColumnType::widen)
    }

    fn records(&self, schema: &ColumnSchema) -> Result<Vec<Record>> {
        self.rows
            .iter()
            .map(|row| {
                let mut values = Map::new();
                for (name, cell) in self.header.iter().zip(row.iter()) {
                    let column_type = schema.get(name).unwrap_or(ColumnType::String);
                    values.insert(name.clone(), decode_cell(name, cell, column_type)?);
                }
                Record::from_row(&values, schema)
            })
            .collect()
    }
}

/// Type of a cell, only if decoding it gives back the exact same text
fn infer_cell(cell: &str) -> Option<ColumnType> {
    if cell == NULL_MARKER {
        return None;
    }
    if let Ok(n) = cell.parse::<i64>() {
        return Some(lossless(n.to_string() == cell, ColumnType::Integer));
    }
    if cell.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(f) = cell.parse::<f64>() {
            return Some(lossless(Value::from(f).to_string() == cell, ColumnType::Float));
        }
    }
    if cell == "true" || cell == "false" {
        return Some(ColumnType::Boolean);
    }
    if cell.starts_with('{') || cell.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(cell) {
            return Some(lossless(parsed.to_string() == cell, ColumnType::Json));
        }
    }
    Some(ColumnType::String)
}

fn lossless(round_trips: bool, column_type: ColumnType) -> ColumnType {
    if round_trips {
        column_type
    } else {
        ColumnType::String
    }
}

fn decode_cell(column: &str, cell: &str, column_type: ColumnType) -> Result<Value> {
    if cell == NULL_MARKER {
        return Ok(Value::Null);
    }
    column_type.coerce(column, &Value::String(cell.to_string()))
}

fn encode_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => NULL_MARKER.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn encode_rows(
    header: &[String],
    rows: &[Map<String, Value>],
    with_header: bool,
) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(header.iter().map(|name| encode_cell(row.get(name))))?;
    }
    writer
        .into_inner()
        .map_err(|e| StatsError::Io(e.into_error()))
}

impl CsvBackend {
    pub fn new(target: BackendTarget) -> Result<Self> {
        if target.rest.trim().is_empty() {
            return Err(StatsError::InvalidConnectionString(format!(
                "{}://{}",
                target.scheme, target.rest
            )));
        }

        let path = PathBuf::from(&target.rest);
        debug!("Csv backend for table '{}' at {}", target.table_name, path.display());

        Ok(Self {
            path,
            table_name: target.table_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file, `None` if it does not exist or is empty
    async fn read_table(&self) -> Result<Option<CsvTable>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        let header = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(CsvTable { header, rows }))
    }

    async fn ensure_parent_directory(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating directory: {}", parent.display());
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Replace the file with `header` + `rows`, readers see old or new content only
    async fn rewrite(&self, header: &[String], rows: &[Map<String, Value>]) -> Result<()> {
        self.ensure_parent_directory().await?;
        let bytes = encode_rows(header, rows, true)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.table_name.clone());
        let tmp_path = self.path.with_file_name(format!(
            ".{}.{}.tmp",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn append(&self, header: &[String], rows: &[Map<String, Value>]) -> Result<()> {
        let bytes = encode_rows(header, rows, false)?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for CsvBackend {
    async fn save(&self, records: &[Record], schema: &ColumnSchema) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let table = self.read_table().await?;
        let existing = table.as_ref().map(|t| t.schema(schema));

        match plan(existing.as_ref(), schema) {
            SavePlan::Create(target) => {
                let rows = prepare_rows(records, &target)?;
                let header: Vec<String> = target.names().map(str::to_string).collect();
                self.rewrite(&header, &rows).await?;
                info!(
                    "Created {} with {} records",
                    self.path.display(),
                    records.len()
                );
            }
            SavePlan::Append(target) => {
                let rows = prepare_rows(records, &target)?;
                // Append follows the file's own column order
                let header = table.map(|t| t.header).unwrap_or_default();
                self.append(&header, &rows).await?;
                debug!(
                    "Appended {} records to {}",
                    records.len(),
                    self.path.display()
                );
            }
            SavePlan::Migrate { previous, target } => {
                let stored = match &table {
                    Some(table) => table.records(&previous)?,
                    None => Vec::new(),
                };
                let rows = prepare_rows(stored.iter().chain(records.iter()), &target)?;
                let header: Vec<String> = target.names().map(str::to_string).collect();
                self.rewrite(&header, &rows).await?;
                info!(
                    "Rewrote {} with {} stored and {} new records ({} columns)",
                    self.path.display(),
                    stored.len(),
                    records.len(),
                    target.len()
                );
            }
        }

        Ok(())
    }

    async fn load(&self, schema: &ColumnSchema) -> Result<Vec<Record>> {
        match self.read_table().await? {
            Some(table) => {
                let effective = table.schema(schema).merge(schema);
                table.records(&effective)
            }
            None => {
                debug!("{} holds no records yet", self.path.display());
                Ok(Vec::new())
            }
        }
    }

    async fn stored_schema(&self) -> Result<Option<ColumnSchema>> {
        Ok(self
            .read_table()
            .await?
            .map(|table| table.schema(&ColumnSchema::new())))
    }

    async fn health_check(&self) -> Result<bool> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() && !metadata.permissions().readonly() => Ok(true),
            Ok(_) => {
                warn!("Health check failed - {} is not writable", dir.display());
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access {}: {}",
                    dir.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "csv"
    }
}
