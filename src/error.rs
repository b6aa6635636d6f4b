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

// Error kinds surfaced by the registry, the buffers and the storage drivers

use thiserror::Error;

/// Errors that can occur while resolving, saving or loading stats records.
#[derive(Error, Debug)]
pub enum StatsError {
    /// Connection string is not of the form `scheme://rest`
    #[error("invalid connection string '{0}': expected <scheme>://<address>")]
    InvalidConnectionString(String),

    /// No driver registered for the scheme
    #[error("unknown storage backend '{scheme}'. Known backends: {}", .known.join(", "))]
    UnknownBackend { scheme: String, known: Vec<String> },

    /// Connection to the storage medium could not be established
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend reachable but the statement was rejected
    #[error("backend rejected query: {0}")]
    Query(String),

    /// A value cannot be represented by the stored column type
    #[error("schema conflict on column '{column}': {reason}")]
    SchemaConflict { column: String, reason: String },

    /// Backend holds no table/file yet and the caller asked for one
    #[error("backend '{0}' holds no data")]
    EmptyBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StatsError {
    pub fn schema_conflict(column: impl Into<String>, reason: impl Into<String>) -> Self {
        StatsError::SchemaConflict {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatsError::BackendUnavailable(_) | StatsError::Io(_) | StatsError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
