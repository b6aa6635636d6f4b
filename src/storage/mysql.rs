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

// MySQL (row-store) backend implementation
//
// MySQL DDL commits implicitly, so a migration builds the new table under a
// shadow name and swaps it in with a single multi-table RENAME.

use super::backend::StorageBackend;
use super::reconcile::{plan, prepare_rows, SavePlan};
use super::registry::BackendTarget;
use crate::error::{Result, StatsError};
use crate::record::{is_base_column, parse_datetime, Column, ColumnSchema, ColumnType, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlConnection};
use sqlx::types::Json;
use sqlx::{Connection, QueryBuilder};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on placeholders per INSERT statement
const MAX_PLACEHOLDERS: usize = 60_000;

pub struct MySqlBackend {
    options: MySqlConnectOptions,
    table_name: String,
    timeout: Duration,
}

/// One bound value, typed for its column
enum Cell {
    Text(Option<String>),
    Integer(Option<i64>),
    Float(Option<f64>),
    Boolean(Option<bool>),
    DateTime(Option<DateTime<Utc>>),
    Json(Option<Json<Value>>),
}

impl Cell {
    fn from_value(column: &Column, value: Option<&Value>) -> Result<Self> {
        let value = value.filter(|v| !v.is_null());
        let conflict = |v: &Value| {
            StatsError::schema_conflict(
                column.name.as_str(),
                format!("cannot bind {} as {}", v, column.column_type),
            )
        };

        Ok(match column.column_type {
            ColumnType::String => Cell::Text(value.map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            ColumnType::Integer => Cell::Integer(match value {
                Some(v) => Some(v.as_i64().ok_or_else(|| conflict(v))?),
                None => None,
            }),
            ColumnType::Float => Cell::Float(match value {
                Some(v) => Some(v.as_f64().ok_or_else(|| conflict(v))?),
                None => None,
            }),
            ColumnType::Boolean => Cell::Boolean(match value {
                Some(v) => Some(v.as_bool().ok_or_else(|| conflict(v))?),
                None => None,
            }),
            ColumnType::DateTime => Cell::DateTime(match value {
                Some(v) => Some(
                    v.as_str()
                        .and_then(parse_datetime)
                        .ok_or_else(|| conflict(v))?,
                ),
                None => None,
            }),
            ColumnType::Json => Cell::Json(value.cloned().map(Json)),
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn mysql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "LONGTEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::DateTime => "DATETIME(6)",
        ColumnType::Json => "JSON",
    }
}

/// Map `information_schema.columns.COLUMN_TYPE` back to a semantic type
fn column_type_from_mysql(column: &str, column_type: &str) -> Result<ColumnType> {
    let lowered = column_type.to_lowercase();
    if lowered.starts_with("tinyint(1)") || lowered == "boolean" {
        return Ok(ColumnType::Boolean);
    }
    let base = lowered
        .split(|c: char| c == '(' || c == ' ')
        .next()
        .unwrap_or_default();
    match base {
        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum" => {
            Ok(ColumnType::String)
        }
        "tinyint" | "smallint" | "mediumint" | "int" | "bigint" => Ok(ColumnType::Integer),
        "float" | "double" | "decimal" => Ok(ColumnType::Float),
        "datetime" | "timestamp" | "date" => Ok(ColumnType::DateTime),
        "json" => Ok(ColumnType::Json),
        _ => Err(StatsError::schema_conflict(
            column,
            format!("unsupported MySQL type '{}'", column_type),
        )),
    }
}

fn create_table_sql(table: &str, schema: &ColumnSchema) -> String {
    let columns: Vec<String> = schema
        .iter()
        .map(|column| {
            let nullability = if is_base_column(&column.name) {
                " NOT NULL"
            } else {
                " NULL"
            };
            format!(
                "{} {}{}",
                quote_ident(&column.name),
                mysql_type(column.column_type),
                nullability
            )
        })
        .collect();
    format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "))
}

/// SELECT returning each row as one JSON object keyed by column name
fn select_sql(table: &str, schema: &ColumnSchema) -> String {
    let pairs: Vec<String> = schema
        .iter()
        .map(|column| format!("{}, {}", quote_literal(&column.name), quote_ident(&column.name)))
        .collect();
    format!("SELECT JSON_OBJECT({}) FROM {}", pairs.join(", "), quote_ident(table))
}

impl MySqlBackend {
    pub fn new(target: BackendTarget) -> Result<Self> {
        let url = format!("mysql://{}", target.rest);
        let options = MySqlConnectOptions::from_str(&url).map_err(|e| {
            StatsError::InvalidConnectionString(format!("{}://{}: {}", target.scheme, target.rest, e))
        })?;

        Ok(Self {
            options,
            table_name: target.table_name,
            timeout: target.options.timeout,
        })
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        let mut conn =
            match tokio::time::timeout(self.timeout, MySqlConnection::connect_with(&self.options))
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    return Err(StatsError::BackendUnavailable(format!(
                        "cannot connect to MySQL: {}",
                        e
                    )))
                }
                Err(_) => {
                    return Err(StatsError::BackendUnavailable(format!(
                        "timed out after {:?} connecting to MySQL",
                        self.timeout
                    )))
                }
            };

        // Bounds SELECTs only; MariaDB does not know the variable
        let limit = format!("SET SESSION max_execution_time = {}", self.timeout.as_millis());
        if let Err(e) = sqlx::query(&limit).execute(&mut conn).await {
            debug!("Statement timeout not applied: {}", e);
        }
        Ok(conn)
    }

    async fn release(&self, conn: MySqlConnection) {
        if let Err(e) = conn.close().await {
            debug!("Closing MySQL connection failed: {}", e);
        }
    }

    async fn introspect_table(
        &self,
        conn: &mut MySqlConnection,
        table: &str,
    ) -> Result<Option<ColumnSchema>> {
        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR) \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        if columns.is_empty() {
            return Ok(None);
        }

        let typed = columns
            .iter()
            .map(|(name, column_type)| {
                Ok((name.clone(), column_type_from_mysql(name, column_type)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(ColumnSchema::from_columns(typed)))
    }

    async fn select_records(
        &self,
        conn: &mut MySqlConnection,
        schema: &ColumnSchema,
    ) -> Result<Vec<Record>> {
        let stored = match self.introspect_table(conn, &self.table_name).await? {
            Some(stored) => stored,
            None => return Ok(Vec::new()),
        };
        // Only columns the table actually has can be selected
        let selectable = ColumnSchema::from_columns(
            stored
                .payload_columns()
                .map(|c| (c.name.clone(), schema.get(&c.name).unwrap_or(c.column_type))),
        );

        let rows: Vec<Json<Value>> = sqlx::query_scalar(&select_sql(&self.table_name, &selectable))
            .fetch_all(&mut *conn)
            .await?;

        rows.iter()
            .map(|Json(row)| match row {
                Value::Object(map) => Record::from_row(map, schema),
                other => Err(StatsError::schema_conflict(
                    self.table_name.as_str(),
                    format!("unexpected row shape {}", other),
                )),
            })
            .collect()
    }

    async fn insert_rows(
        &self,
        conn: &mut MySqlConnection,
        table: &str,
        rows: &[Map<String, Value>],
        schema: &ColumnSchema,
    ) -> Result<()> {
        let columns: Vec<&Column> = schema.iter().collect();
        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let chunk_size = (MAX_PLACEHOLDERS / columns.len().max(1)).max(1);

        for chunk in rows.chunks(chunk_size) {
            let cells = chunk
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|column| Cell::from_value(column, row.get(&column.name)))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?;

            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                names.join(", ")
            ));
            builder.push_values(cells, |mut values, row| {
                for cell in row {
                    match cell {
                        Cell::Text(v) => values.push_bind(v),
                        Cell::Integer(v) => values.push_bind(v),
                        Cell::Float(v) => values.push_bind(v),
                        Cell::Boolean(v) => values.push_bind(v),
                        Cell::DateTime(v) => values.push_bind(v),
                        Cell::Json(v) => values.push_bind(v),
                    };
                }
            });
            builder.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn migrate(
        &self,
        conn: &mut MySqlConnection,
        target: &ColumnSchema,
        rows: &[Map<String, Value>],
    ) -> Result<()> {
        let shadow = format!("{}__migrate", self.table_name);
        let retired = format!("{}__previous", self.table_name);

        // Leftovers of an interrupted migration
        for table in [&shadow, &retired] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query(&create_table_sql(&shadow, target))
            .execute(&mut *conn)
            .await?;
        if let Err(e) = self.insert_rows(conn, &shadow, rows, target).await {
            let _ = sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&shadow)))
                .execute(&mut *conn)
                .await;
            return Err(e);
        }

        sqlx::query(&format!(
            "RENAME TABLE {live} TO {retired}, {shadow} TO {live}",
            live = quote_ident(&self.table_name),
            retired = quote_ident(&retired),
            shadow = quote_ident(&shadow),
        ))
        .execute(&mut *conn)
        .await?;

        // The migrated table is live; a leftover is dropped by the next migration
        if let Err(e) = sqlx::query(&format!("DROP TABLE {}", quote_ident(&retired)))
            .execute(&mut *conn)
            .await
        {
            warn!("Could not drop '{}': {}", retired, e);
        }
        Ok(())
    }

    async fn save_on(
        &self,
        conn: &mut MySqlConnection,
        records: &[Record],
        schema: &ColumnSchema,
    ) -> Result<()> {
        let existing = self.introspect_table(conn, &self.table_name).await?;

        match plan(existing.as_ref(), schema) {
            SavePlan::Create(target) => {
                let rows = prepare_rows(records, &target)?;
                sqlx::query(&create_table_sql(&self.table_name, &target))
                    .execute(&mut *conn)
                    .await?;
                self.insert_rows(conn, &self.table_name, &rows, &target)
                    .await?;
                info!(
                    "Created table '{}' with {} records",
                    self.table_name,
                    rows.len()
                );
            }
            SavePlan::Append(target) => {
                let rows = prepare_rows(records, &target)?;
                let mut tx = conn.begin().await?;
                self.insert_rows(&mut tx, &self.table_name, &rows, &target)
                    .await?;
                tx.commit().await?;
                debug!("Appended {} records to '{}'", rows.len(), self.table_name);
            }
            SavePlan::Migrate { previous, target } => {
                let stored = self.select_records(conn, &previous).await?;
                let rows = prepare_rows(stored.iter().chain(records.iter()), &target)?;
                self.migrate(conn, &target, &rows).await?;
                info!(
                    "Migrated table '{}' to {} columns: {} stored + {} new records",
                    self.table_name,
                    target.len(),
                    stored.len(),
                    records.len()
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MySqlBackend {
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
        let result = match self.introspect_table(&mut conn, &self.table_name).await {
            Ok(Some(existing)) => {
                let effective = existing.merge(schema);
                self.select_records(&mut conn, &effective).await
            }
            Ok(None) => {
                debug!("Table '{}' does not exist yet", self.table_name);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        };
        self.release(conn).await;
        result
    }

    async fn stored_schema(&self) -> Result<Option<ColumnSchema>> {
        let mut conn = self.connect().await?;
        let result = self.introspect_table(&mut conn, &self.table_name).await;
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
        "mysql"
    }
}
