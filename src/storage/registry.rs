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

// Backend registry mapping connection-string schemes to driver constructors

use super::backend::StorageBackend;
use super::clickhouse::ClickHouseBackend;
use super::csv::CsvBackend;
use super::mysql::MySqlBackend;
use super::postgres::PostgresBackend;
use crate::error::{Result, StatsError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options shared by every driver the registry builds
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Connect/operation timeout enforced by the driver
    pub timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a driver constructor receives
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub scheme: String,
    /// Connection string with the `scheme://` prefix removed
    pub rest: String,
    pub table_name: String,
    pub options: DriverOptions,
}

pub type BackendConstructor =
    Arc<dyn Fn(BackendTarget) -> Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// Split `scheme://rest` at the first `://`
pub fn split_connection_string(connection_string: &str) -> Result<(&str, &str)> {
    match connection_string.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => Ok((scheme, rest)),
        _ => Err(StatsError::InvalidConnectionString(
            connection_string.to_string(),
        )),
    }
}

/// Explicit registry of storage drivers, built once at startup and handed to
/// whatever constructs buffers.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
    options: DriverOptions,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.known_schemes())
            .field("options", &self.options)
            .finish()
    }
}

impl BackendRegistry {
    /// Registry with no drivers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled csv, PostgreSQL, MySQL and ClickHouse drivers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("csv", |target| Ok(Arc::new(CsvBackend::new(target)?)));
        registry.register("postgresql", |target| {
            Ok(Arc::new(PostgresBackend::new(target)?))
        });
        registry.register("postgres", |target| {
            Ok(Arc::new(PostgresBackend::new(target)?))
        });
        registry.register("mysql", |target| Ok(Arc::new(MySqlBackend::new(target)?)));
        registry.register("clickhouse", |target| {
            Ok(Arc::new(ClickHouseBackend::new(target)?))
        });
        registry
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Register (or replace) the constructor for `scheme`
    pub fn register<F>(&mut self, scheme: &str, constructor: F)
    where
        F: Fn(BackendTarget) -> Result<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(scheme.to_string(), Arc::new(constructor));
    }

    pub fn known_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.constructors.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Build the driver for `connection_string`. No I/O happens here.
    pub fn resolve(
        &self,
        connection_string: &str,
        table_name: &str,
    ) -> Result<Arc<dyn StorageBackend>> {
        self.resolve_with(connection_string, table_name, self.options.clone())
    }

    /// Like `resolve`, with per-stream driver options
    pub fn resolve_with(
        &self,
        connection_string: &str,
        table_name: &str,
        options: DriverOptions,
    ) -> Result<Arc<dyn StorageBackend>> {
        let (scheme, rest) = split_connection_string(connection_string)?;
        let constructor =
            self.constructors
                .get(scheme)
                .ok_or_else(|| StatsError::UnknownBackend {
                    scheme: scheme.to_string(),
                    known: self.known_schemes(),
                })?;

        debug!("Resolving '{}' backend for table '{}'", scheme, table_name);
        constructor(BackendTarget {
            scheme: scheme.to_string(),
            rest: rest.to_string(),
            table_name: table_name.to_string(),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_connection_string() {
        assert_eq!(
            split_connection_string("csv:///tmp/x.csv").unwrap(),
            ("csv", "/tmp/x.csv")
        );
        assert_eq!(
            split_connection_string("postgresql://u:p@h:5432/d").unwrap(),
            ("postgresql", "u:p@h:5432/d")
        );
        assert!(matches!(
            split_connection_string("no-scheme-here"),
            Err(StatsError::InvalidConnectionString(_))
        ));
        assert!(matches!(
            split_connection_string("://rest"),
            Err(StatsError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_resolve_csv_backend() {
        let registry = BackendRegistry::with_defaults();
        let backend = registry.resolve("csv:///tmp/x.csv", "t").unwrap();
        assert_eq!(backend.backend_type(), "csv");
    }

    #[test]
    fn test_resolve_postgres_backend() {
        let registry = BackendRegistry::with_defaults();
        let backend = registry.resolve("postgresql://u:p@h:5432/d", "t").unwrap();
        assert_eq!(backend.backend_type(), "postgresql");
    }

    #[test]
    fn test_resolve_clickhouse_backend() {
        let registry = BackendRegistry::with_defaults();
        let backend = registry
            .resolve("clickhouse://u:p@localhost:8123/default", "t")
            .unwrap();
        assert_eq!(backend.backend_type(), "clickhouse");
    }

    #[test]
    fn test_resolve_unknown_backend() {
        let registry = BackendRegistry::with_defaults();
        match registry.resolve("ftp://x", "t") {
            Err(StatsError::UnknownBackend { scheme, known }) => {
                assert_eq!(scheme, "ftp");
                assert_eq!(
                    known,
                    vec!["clickhouse", "csv", "mysql", "postgres", "postgresql"]
                );
            }
            other => panic!("expected UnknownBackend, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_register_additional_backend() {
        let mut registry = BackendRegistry::new();
        registry.register("file", |target| Ok(Arc::new(CsvBackend::new(target)?)));
        assert_eq!(registry.known_schemes(), vec!["file"]);
        assert!(registry.resolve("file:///tmp/y.csv", "t").is_ok());
        assert!(registry.resolve("csv:///tmp/y.csv", "t").is_err());
    }
}
