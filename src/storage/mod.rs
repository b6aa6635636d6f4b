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

// Storage backend module
//
// Provides a trait-based abstraction for storage drivers, allowing a stream
// of stats records to be persisted to different storage systems
// (csv files, PostgreSQL, MySQL, ClickHouse), selected by the scheme of a
// connection string.
//
// Every driver implements the same schema drift reconciliation: when a
// batch brings columns the stored data does not have, the stored rows are
// migrated to the union schema before the batch is appended.

pub mod backend;
pub mod clickhouse;
pub mod csv;
pub mod mysql;
pub mod postgres;
pub mod reconcile;
pub mod registry;

pub use backend::StorageBackend;
pub use clickhouse::ClickHouseBackend;
pub use self::csv::CsvBackend;
pub use mysql::MySqlBackend;
pub use postgres::PostgresBackend;
pub use reconcile::{plan, SavePlan};
pub use registry::{split_connection_string, BackendRegistry, BackendTarget, DriverOptions};
