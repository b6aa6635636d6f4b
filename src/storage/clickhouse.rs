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

// ClickHouse (column-store) backend implementation
//
// Talks to the ClickHouse HTTP interface and exchanges rows as JSONEachRow.
// Every semantic type is mapped to a native column type; the table model is
// regenerated from the target schema on every migration.

use super::backend::StorageBackend;
use super::reconcile::{plan, prepare_rows, SavePlan};
use super::registry::BackendTarget;
use crate::error::{Result, StatsError};
use crate::record::{is_base_column, ColumnSchema, ColumnType, Record};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Column comment marking a String column that holds JSON text
const JSON_COMMENT: &str = "json";

/// Per-request settings passed as URL parameters
const SETTINGS: [(&str, &str); 3] = [
    ("date_time_input_format", "best_effort"),
    ("date_time_output_format", "iso"),
    ("output_format_json_quote_64bit_integers", "0"),
];

/// ClickHouse backend using the HTTP interface
pub struct ClickHouseBackend {
    endpoint: Url,
    database: String,
    user: String,
    password: String,
    table_name: String,
    timeout: Duration,
}

/// Native column of the generated table model
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChColumn {
    name: String,
    ch_type: String,
    comment: Option<&'static str>,
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn native_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String | ColumnType::Json => "String",
        ColumnType::Integer => "Int64",
        ColumnType::Float => "Float64",
        ColumnType::Boolean => "Bool",
        ColumnType::DateTime => "DateTime64(6, 'UTC')",
    }
}

/// Map a native type (as reported by DESCRIBE) back to a semantic type
fn column_type_from_native(column: &str, ch_type: &str, comment: &str) -> Result<ColumnType> {
    let mut inner = ch_type.trim();
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(stripped) = inner.strip_prefix(wrapper) {
            inner = stripped.strip_suffix(')').unwrap_or(stripped);
        }
    }
    // LowCardinality(Nullable(String)) puts Nullable second
    if let Some(stripped) = inner.strip_prefix("Nullable(") {
        inner = stripped.strip_suffix(')').unwrap_or(stripped);
    }

    let column_type = match inner {
        "String" | "UUID" if comment == JSON_COMMENT => ColumnType::Json,
        "String" | "UUID" => ColumnType::String,
        t if t.starts_with("FixedString(") => ColumnType::String,
        "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
            ColumnType::Integer
        }
        "Float32" | "Float64" => ColumnType::Float,
        t if t.starts_with("Decimal") => ColumnType::Float,
        "Bool" => ColumnType::Boolean,
        t if t.starts_with("DateTime") || t.starts_with("Date") => ColumnType::DateTime,
        other => {
            return Err(StatsError::schema_conflict(
                column,
                format!("unsupported ClickHouse type '{}'", other),
            ))
        }
    };
    Ok(column_type)
}

/// Regenerate the full table model for `schema`.
///
/// Base columns stay non-nullable; every payload column is Nullable since
/// rows written before the column existed have no value for it.
fn table_model(schema: &ColumnSchema) -> Vec<ChColumn> {
    schema
        .iter()
        .map(|column| {
            let native = native_type(column.column_type);
            let ch_type = if is_base_column(&column.name) {
                native.to_string()
            } else {
                format!("Nullable({})", native)
            };
            ChColumn {
                name: column.name.clone(),
                ch_type,
                comment: (column.column_type == ColumnType::Json).then_some(JSON_COMMENT),
            }
        })
        .collect()
}

fn create_table_sql(qualified_table: &str, schema: &ColumnSchema) -> String {
    let columns: Vec<String> = table_model(schema)
        .iter()
        .map(|column| match column.comment {
            Some(comment) => format!(
                "{} {} COMMENT '{}'",
                quote_ident(&column.name),
                column.ch_type,
                comment
            ),
            None => format!("{} {}", quote_ident(&column.name), column.ch_type),
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree ORDER BY tuple()",
        qualified_table,
        columns.join(", ")
    )
}

/// JSONEachRow body; Json columns travel as JSON text
fn encode_rows(rows: &[Map<String, Value>], schema: &ColumnSchema) -> Result<String> {
    let mut body = String::new();
    for row in rows {
        let mut row = row.clone();
        for column in schema.iter().filter(|c| c.column_type == ColumnType::Json) {
            if let Some(value) = row.get_mut(&column.name) {
                if !value.is_null() {
                    *value = Value::String(value.to_string());
                }
            }
        }
        body.push_str(&serde_json::to_string(&row)?);
        body.push('\n');
    }
    Ok(body)
}

impl ClickHouseBackend {
    pub fn new(target: BackendTarget) -> Result<Self> {
        let invalid = |reason: &str| {
            StatsError::InvalidConnectionString(format!(
                "{}://{}: {}",
                target.scheme, target.rest, reason
            ))
        };

        let parsed = Url::parse(&format!("http://{}", target.rest))
            .map_err(|e| invalid(&e.to_string()))?;
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port().unwrap_or(8123);
        let database = parsed.path().trim_matches('/').to_string();
        let user = parsed.username().to_string();
        let password = parsed.password().unwrap_or_default().to_string();

        if database.is_empty() || user.is_empty() || password.is_empty() {
            return Err(invalid("database, user and password are required"));
        }

        let endpoint = Url::parse(&format!("http://{}:{}/", host, port))
            .map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            endpoint,
            database,
            user,
            password,
            table_name: target.table_name,
            timeout: target.options.timeout,
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.database), quote_ident(table))
    }

    /// HTTP client for one operation; dropped (with its sockets) afterwards
    fn session(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| StatsError::BackendUnavailable(format!("cannot build HTTP client: {}", e)))
    }

    /// Run `sql`; with `data` the statement goes in the URL and the rows in the body
    async fn execute(&self, client: &Client, sql: &str, data: Option<String>) -> Result<String> {
        let mut request = client
            .post(self.endpoint.clone())
            .query(&[("database", self.database.as_str())])
            .query(&SETTINGS)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password);

        request = match data {
            Some(body) => request.query(&[("query", sql)]).body(body),
            None => request.body(sql.to_string()),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StatsError::BackendUnavailable(format!("ClickHouse at {}: {}", self.endpoint, e))
            } else {
                StatsError::Http(e)
            }
        })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StatsError::Query(format!("{} ({}): {}", sql, status, text.trim())));
        }
        Ok(text)
    }

    async fn introspect(&self, client: &Client) -> Result<Option<ColumnSchema>> {
        let exists = self
            .execute(client, &format!("EXISTS TABLE {}", self.qualified(&self.table_name)), None)
            .await?;
        if exists.trim() != "1" {
            return Ok(None);
        }

        let described = self
            .execute(
                client,
                &format!(
                    "DESCRIBE TABLE {} FORMAT JSONEachRow",
                    self.qualified(&self.table_name)
                ),
                None,
            )
            .await?;

        let mut columns = Vec::new();
        for line in described.lines().filter(|l| !l.trim().is_empty()) {
            let row: Value = serde_json::from_str(line)?;
            let name = row.get("name").and_then(Value::as_str).unwrap_or_default();
            let ch_type = row.get("type").and_then(Value::as_str).unwrap_or_default();
            let comment = row.get("comment").and_then(Value::as_str).unwrap_or_default();
            columns.push((
                name.to_string(),
                column_type_from_native(name, ch_type, comment)?,
            ));
        }
        Ok(Some(ColumnSchema::from_columns(columns)))
    }

    async fn select_records(&self, client: &Client, schema: &ColumnSchema) -> Result<Vec<Record>> {
        let text = self
            .execute(
                client,
                &format!("SELECT * FROM {} FORMAT JSONEachRow", self.qualified(&self.table_name)),
                None,
            )
            .await?;

        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let row: Map<String, Value> = serde_json::from_str(line)?;
                Record::from_row(&row, schema)
            })
            .collect()
    }

    async fn insert_rows(
        &self,
        client: &Client,
        table: &str,
        rows: &[Map<String, Value>],
        schema: &ColumnSchema,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = encode_rows(rows, schema)?;
        self.execute(
            client,
            &format!("INSERT INTO {} FORMAT JSONEachRow", self.qualified(table)),
            Some(body),
        )
        .await?;
        Ok(())
    }

    /// Build the migrated table next to the live one and swap them
    async fn migrate(
        &self,
        client: &Client,
        target: &ColumnSchema,
        rows: &[Map<String, Value>],
    ) -> Result<()> {
        let shadow = format!("{}__migrate_{}", self.table_name, uuid::Uuid::new_v4().simple());

        self.execute(client, &create_table_sql(&self.qualified(&shadow), target), None)
            .await?;
        if let Err(e) = self.insert_rows(client, &shadow, rows, target).await {
            self.discard(client, &shadow).await;
            return Err(e);
        }

        let exchange = format!(
            "EXCHANGE TABLES {} AND {}",
            self.qualified(&self.table_name),
            self.qualified(&shadow)
        );
        match self.execute(client, &exchange, None).await {
            Ok(_) => {
                // The migrated table is live; the shadow now holds the old rows
                self.discard(client, &shadow).await;
                Ok(())
            }
            Err(StatsError::Query(reason)) => {
                // Ordinary databases cannot EXCHANGE
                warn!("EXCHANGE TABLES unavailable ({}), falling back to rename", reason);
                self.swap_by_rename(client, &shadow).await
            }
            Err(e) => Err(e),
        }
    }

    /// Park the live table under `<table>__previous`, then move `shadow` in.
    ///
    /// The stored rows are never dropped before the new table is in place.
    async fn swap_by_rename(&self, client: &Client, shadow: &str) -> Result<()> {
        let retired = format!("{}__previous", self.table_name);
        let live = self.qualified(&self.table_name);
        let parked = self.qualified(&retired);

        let park = format!("RENAME TABLE {} TO {}", live, parked);
        let swap_in = format!("RENAME TABLE {} TO {}", self.qualified(shadow), live);
        let restore = format!("RENAME TABLE {} TO {}", parked, live);

        self.discard(client, &retired).await;
        if let Err(e) = self.execute(client, &park, None).await {
            self.discard(client, shadow).await;
            return Err(e);
        }
        if let Err(e) = self.execute(client, &swap_in, None).await {
            if let Err(restore_err) = self.execute(client, &restore, None).await {
                return Err(StatsError::Query(format!(
                    "{}; stored rows remain in '{}' ({})",
                    e, retired, restore_err
                )));
            }
            self.discard(client, shadow).await;
            return Err(e);
        }

        self.discard(client, &retired).await;
        Ok(())
    }

    /// Drop a helper table, logging instead of failing
    async fn discard(&self, client: &Client, table: &str) {
        let drop = format!("DROP TABLE IF EXISTS {}", self.qualified(table));
        if let Err(e) = self.execute(client, &drop, None).await {
            warn!("Could not drop '{}': {}", table, e);
        }
    }
}

#[async_trait]
impl StorageBackend for ClickHouseBackend {
    async fn save(&self, records: &[Record], schema: &ColumnSchema) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let client = self.session()?;
        let existing = self.introspect(&client).await?;

        match plan(existing.as_ref(), schema) {
            SavePlan::Create(target) => {
                let rows = prepare_rows(records, &target)?;
                self.execute(
                    &client,
                    &create_table_sql(&self.qualified(&self.table_name), &target),
                    None,
                )
                .await?;
                self.insert_rows(&client, &self.table_name, &rows, &target)
                    .await?;
                info!(
                    "Created table '{}' with {} records",
                    self.table_name,
                    rows.len()
                );
            }
            SavePlan::Append(target) => {
                let rows = prepare_rows(records, &target)?;
                self.insert_rows(&client, &self.table_name, &rows, &target)
                    .await?;
                debug!("Appended {} records to '{}'", rows.len(), self.table_name);
            }
            SavePlan::Migrate { previous, target } => {
                let stored = self.select_records(&client, &previous).await?;
                let rows = prepare_rows(stored.iter().chain(records.iter()), &target)?;
                self.migrate(&client, &target, &rows).await?;
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

    async fn load(&self, schema: &ColumnSchema) -> Result<Vec<Record>> {
        let client = self.session()?;
        match self.introspect(&client).await? {
            Some(existing) => {
                let effective = existing.merge(schema);
                self.select_records(&client, &effective).await
            }
            None => {
                debug!("Table '{}' does not exist yet", self.table_name);
                Ok(Vec::new())
            }
        }
    }

    async fn stored_schema(&self) -> Result<Option<ColumnSchema>> {
        let client = self.session()?;
        self.introspect(&client).await
    }

    async fn health_check(&self) -> Result<bool> {
        let client = self.session()?;
        let url = self.endpoint.join("ping").map_err(|e| {
            StatsError::InvalidConnectionString(format!("{}: {}", self.endpoint, e))
        })?;
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!("Health check failed with status {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "clickhouse"
    }
}
