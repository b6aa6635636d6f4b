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

// PostgreSQL (row-store) backend implementation
//
// Every operation opens its own connection and closes it before returning.
// Create, append and migrate all run inside one transaction: PostgreSQL DDL
// is transactional, so a concurrent reader sees either the old table or the
// migrated one, never a missing table.

use super::backend::StorageBackend;
use super::reconcile::{plan, prepare_rows, SavePlan};
use super::registry::BackendTarget;
use crate::error::{Result, StatsError};
use crate::record::{is_base_column, ColumnSchema, ColumnType, Record};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::types::Json;
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows bound per INSERT statement
const INSERT_CHUNK: usize = 1000;

pub struct PostgresBackend {
    options: PgConnectOptions,
    table_name: String,
    timeout: Duration,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn pg_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::DateTime => "TIMESTAMPTZ",
        ColumnType::Json => "JSONB",
    }
}

fn column_type_from_pg(column: &str, data_type: &str) -> Result<ColumnType> {
    match data_type {
        "text" | "character varying" | "character" | "uuid" => Ok(ColumnType::String),
        "bigint" | "integer" | "smallint" => Ok(ColumnType::Integer),
        "double precision" | "real" | "numeric" => Ok(ColumnType::Float),
        "boolean" => Ok(ColumnType::Boolean),
        "timestamp with time zone" | "timestamp without time zone" | "date" => {
            Ok(ColumnType::DateTime)
        }
        "jsonb" | "json" => Ok(ColumnType::Json),
        other => Err(StatsError::schema_conflict(
            column,
            format!("unsupported PostgreSQL type '{}'", other),
        )),
    }
}

/// CREATE TABLE statement for `schema`; payload columns are nullable
fn create_table_sql(table: &str, schema: &ColumnSchema) -> String {
    let columns: Vec<String> = schema
        .iter()
        .map(|column| {
            let nullability = if is_base_column(&column.name) {
                " NOT NULL"
            } else {
                ""
            };
            format!(
                "{} {}{}",
                quote_ident(&column.name),
                pg_type(column.column_type),
                nullability
            )
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

impl PostgresBackend {
    pub fn new(target: BackendTarget) -> Result<Self> {
        let url = format!("postgres://{}", target.rest);
        let statement_timeout = target.options.timeout.as_millis().to_string();
        let options = PgConnectOptions::from_str(&url)
            .map_err(|e| {
                StatsError::InvalidConnectionString(format!("{}://{}: {}", target.scheme, target.rest, e))
            })?
            .options([("statement_timeout", statement_timeout)]);

        Ok(Self {
            options,
            table_name: target.table_name,
            timeout: target.options.timeout,
        })
    }

    async fn connect(&self) -> Result<PgConnection> {
        match tokio::time::timeout(self.timeout, PgConnection::connect_with(&self.options)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StatsError::BackendUnavailable(format!(
                "cannot connect to PostgreSQL: {}",
                e
            ))),
            Err(_) => Err(StatsError::BackendUnavailable(format!(
                "timed out after {:?} connecting to PostgreSQL",
                self.timeout
            ))),
        }
    }

    async fn release(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!("Closing PostgreSQL connection failed: {}", e);
        }
    }

    async fn introspect(&self, conn: &mut PgConnection) -> Result<Option<ColumnSchema>> {
        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(&self.table_name)
        .fetch_all(&mut *conn)
        .await?;

        if columns.is_empty() {
            return Ok(None);
        }

        let typed = columns
            .iter()
            .map(|(name, data_type)| Ok((name.clone(), column_type_from_pg(name, data_type)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(ColumnSchema::from_columns(typed)))
    }

    async fn select_records(
        &self,
        conn: &mut PgConnection,
        schema: &ColumnSchema,
    ) -> Result<Vec<Record>> {
        let sql = format!("SELECT to_jsonb(t) FROM {} AS t", quote_ident(&self.table_name));
        let rows: Vec<Value> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;

        rows.iter()
            .map(|row| match row {
                Value::Object(map) => Record::from_row(map, schema),
                other => Err(StatsError::schema_conflict(
                    self.table_name.as_str(),
                    format!("unexpected row shape {}", other),
                )),
            })
            .collect()
    }

    async fn insert_rows(&self, conn: &mut PgConnection, rows: &[Map<String, Value>]) -> Result<()> {
        let table = quote_ident(&self.table_name);
        let sql = format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)"
        );
        for chunk in rows.chunks(INSERT_CHUNK) {
            sqlx::query(&sql).bind(Json(chunk)).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn save_on(
        &self,
        conn: &mut PgConnection,
        records: &[Record],
        schema: &ColumnSchema,
    ) -> Result<()> {
        let mut tx = conn.begin().await?;
        let existing = self.introspect(&mut tx).await?;

        match plan(existing.as_ref(), schema) {
            SavePlan::Create(target) => {
                let rows = prepare_rows(records, &target)?;
                sqlx::query(&create_table_sql(&self.table_name, &target))
                    .execute(&mut *tx)
                    .await?;
                self.insert_rows(&mut tx, &rows).await?;
                info!(
                    "Created table '{}' with {} records",
                    self.table_name,
                    rows.len()
                );
            }
            SavePlan::Append(target) => {
                let rows = prepare_rows(records, &target)?;
                self.insert_rows(&mut tx, &rows).await?;
                debug!("Appended {} records to '{}'", rows.len(), self.table_name);
            }
            SavePlan::Migrate { previous, target } => {
                let stored = self.select_records(&mut tx, &previous).await?;
                let rows = prepare_rows(stored.iter().chain(records.iter()), &target)?;

                sqlx::query(&format!("DROP TABLE {}", quote_ident(&self.table_name)))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&create_table_sql(&self.table_name, &target))
                    .execute(&mut *tx)
                    .await?;
                self.insert_rows(&mut tx, &rows).await?;
                info!(
                    "Migrated table '{}' to {} columns: {} stored + {} new records",
                    self.table_name,
                    target.len(),
                    stored.len(),
                    records.len()
                );
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_on(&self, conn: &mut PgConnection, schema: &ColumnSchema) -> Result<Vec<Record>> {
        match self.introspect(conn).await? {
            Some(existing) => {
                let effective = existing.merge(schema);
                self.select_records(conn, &effective).await
            }
            None => {
                debug!("Table '{}' does not exist yet", self.table_name);
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn save(&self, records: &[Record], schema: &ColumnSchema) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect().await?;
        let result = self.save_on(&mut conn, records, schema).await;
        self.release(conn).await;
        result
    }

    async fn load(&self, schema: &ColumnSchema) -> Result<Vec<Record>> {
        let mut conn = self.connect().await?;
        let result = self.load_on(&mut conn, schema).await;
        self.release(conn).await;
        result
    }

    async fn stored_schema(&self) -> Result<Option<ColumnSchema>> {
        let mut conn = self.connect().await?;
        let result = self.introspect(&mut conn).await;
        self.release(conn).await;
        result
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Health check failed: {}", e);
                return Ok(false);
            }
        };
        let result = sqlx::query("SELECT 1").execute(&mut conn).await;
        self.release(conn).await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Health check query failed: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "postgresql"
    }
}
