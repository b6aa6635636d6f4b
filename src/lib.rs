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

// Stats Recorder: batched, schema-evolving persistence of pipeline telemetry
//
// - Producers turn pipeline events into records (context, request, key, payload)
// - A publisher pool fans records out to per-stream buffers
// - Buffers flush once their batch size is reached
// - Storage drivers (csv, PostgreSQL, MySQL, ClickHouse) are picked by
//   connection string scheme and migrate stored data when new payload columns appear

pub mod buffer;
pub mod config;
pub mod error;
pub mod pool;
pub mod record;
pub mod storage;

// Re-export main types
pub use buffer::{BufferStats, StatsBuffer};
pub use config::{load_config, load_config_with_env, StatsConfig, StreamConfig};
pub use error::{Result, StatsError};
pub use pool::{Extractor, ExtractorPool, FnExtractor, RecordSink};
pub use record::{ColumnSchema, ColumnType, Record};
pub use storage::{BackendRegistry, StorageBackend};
