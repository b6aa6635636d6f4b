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

// Storage backend trait for append-and-reload persistence

use crate::error::Result;
use crate::record::{ColumnSchema, Record};
use async_trait::async_trait;

/// Storage driver for one kind of storage medium
///
/// A driver owns no records: after a successful `save` everything it was
/// handed lives in the backend. Drivers open their connection at the start
/// of each operation and release it before returning, on success and on
/// error alike, so no state survives between calls.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Append `records` to the stream's table/file.
    ///
    /// Afterwards the stored schema is a superset of `schema`. When new
    /// columns appear (or a stored column has to widen) the stored rows are
    /// migrated to the union schema before the new rows are written.
    ///
    /// # Arguments
    /// * `records` - Batch to persist, in append order
    /// * `schema` - Union schema observed by the caller so far
    async fn save(&self, records: &[Record], schema: &ColumnSchema) -> Result<()>;

    /// Read back every stored record.
    ///
    /// An empty list is a valid answer for a backend that holds nothing yet.
    async fn load(&self, schema: &ColumnSchema) -> Result<Vec<Record>>;

    /// Introspect the stored column set, `None` if no table/file exists
    async fn stored_schema(&self) -> Result<Option<ColumnSchema>>;

    /// Save with retry logic (optional, has default implementation)
    ///
    /// Only retryable errors (connection, I/O) are retried; a schema
    /// conflict fails immediately.
    async fn save_with_retry(
        &self,
        records: &[Record],
        schema: &ColumnSchema,
        max_retries: u32,
    ) -> Result<()> {
        use tokio::time::{sleep, Duration};
        use tracing::{info, warn};

        let mut attempt = 0;
        let mut delay = Duration::from_millis(100);

        loop {
            match self.save(records, schema).await {
                Ok(_) => {
                    if attempt > 0 {
                        info!(
                            "Saved {} records to '{}' after {} retries",
                            records.len(),
                            self.backend_type(),
                            attempt
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    warn!(
                        "Save to '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.backend_type(),
                        attempt + 1,
                        max_retries,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2; // Exponential backoff
                    delay = delay.min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Save to '{}' failed after {} attempts: {}",
                        self.backend_type(),
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}
