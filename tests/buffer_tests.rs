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

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stats_recorder::record::{ColumnSchema, ColumnType, Record};
use stats_recorder::storage::StorageBackend;
use stats_recorder::{Result, StatsBuffer, StatsError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Backend keeping every saved batch in memory
#[derive(Default)]
struct MemoryBackend {
    batches: Mutex<Vec<Vec<Record>>>,
    schema: Mutex<Option<ColumnSchema>>,
    fail: AtomicBool,
    failures_left: AtomicU32,
    save_calls: AtomicU32,
    // When set, `save` signals `entered` and waits for `release`
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl MemoryBackend {
    fn saved_batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap().clone()
    }

    fn saved_records(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save(&self, records: &[Record], schema: &ColumnSchema) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);

        if let Some((entered, release)) = &self.hold {
            entered.notify_one();
            release.notified().await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(StatsError::BackendUnavailable("memory backend down".into()));
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StatsError::BackendUnavailable("transient failure".into()));
        }

        self.batches.lock().unwrap().push(records.to_vec());
        let mut stored = self.schema.lock().unwrap();
        *stored = Some(match stored.take() {
            Some(existing) => existing.merge(schema),
            None => schema.clone(),
        });
        Ok(())
    }

    async fn load(&self, _schema: &ColumnSchema) -> Result<Vec<Record>> {
        Ok(self.batches.lock().unwrap().concat())
    }

    async fn stored_schema(&self) -> Result<Option<ColumnSchema>> {
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.fail.load(Ordering::SeqCst))
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}

fn record(request_id: i64, data: Value) -> Record {
    let data = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Record::new("ctx-1", request_id, "turn", data)
}

#[tokio::test]
async fn test_flush_at_batch_size() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("test", backend.clone(), 3);

    buffer.append(record(1, json!({"a": 1}))).await.unwrap();
    buffer.append(record(2, json!({"a": 2}))).await.unwrap();
    assert_eq!(backend.save_calls.load(Ordering::SeqCst), 0);
    assert_eq!(buffer.pending_len().await, 2);

    buffer.append(record(3, json!({"a": 3}))).await.unwrap();

    let batches = backend.saved_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert_eq!(buffer.pending_len().await, 0);

    let stats = buffer.stats().await;
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.flushed_records, 3);
}

#[tokio::test]
async fn test_batch_size_one_writes_every_record() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("test", backend.clone(), 1);

    for i in 0..4 {
        buffer.append(record(i, json!({"step": i}))).await.unwrap();
        assert_eq!(buffer.pending_len().await, 0);
        assert_eq!(backend.saved_records(), (i + 1) as usize);
    }
    assert_eq!(backend.saved_batches().len(), 4);
}

#[tokio::test]
async fn test_concurrent_appends_flush_once() {
    const N: usize = 16;
    let backend = Arc::new(MemoryBackend::default());
    let buffer = Arc::new(StatsBuffer::new("test", backend.clone(), N));

    let mut handles = Vec::new();
    for i in 0..N {
        let buffer = buffer.clone();
        handles.push(tokio::spawn(async move {
            buffer
                .append(record(i as i64, json!({"worker": i})))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let batches = backend.saved_batches();
    assert_eq!(batches.len(), 1, "exactly one flush per threshold crossing");
    assert_eq!(batches[0].len(), N);
    assert_eq!(buffer.pending_len().await, 0);
}

#[tokio::test]
async fn test_failed_save_keeps_records() {
    let backend = Arc::new(MemoryBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let buffer = StatsBuffer::new("test", backend.clone(), 1);

    let err = buffer.append(record(1, json!({"a": 1}))).await.unwrap_err();
    assert!(matches!(err, StatsError::BackendUnavailable(_)));
    assert_eq!(buffer.pending_len().await, 1);
    assert_eq!(buffer.stats().await.failed_flushes, 1);

    backend.fail.store(false, Ordering::SeqCst);
    buffer.flush().await.unwrap();

    assert_eq!(buffer.pending_len().await, 0);
    assert_eq!(backend.saved_records(), 1);
}

#[tokio::test]
async fn test_records_appended_during_save_stay_pending() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let backend = Arc::new(MemoryBackend {
        hold: Some((entered.clone(), release.clone())),
        ..Default::default()
    });
    let buffer = Arc::new(StatsBuffer::new("test", backend.clone(), 2));

    let first = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            buffer.append(record(1, json!({"a": 1}))).await?;
            buffer.append(record(2, json!({"a": 2}))).await
        })
    };
    entered.notified().await;

    // The late appender queues behind the in-flight flush
    let late = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.append(record(3, json!({"a": 3}))).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while buffer.pending_len().await < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("late record appended");

    release.notify_one();
    first.await.unwrap().unwrap();
    late.await.unwrap().unwrap();

    let batches = backend.saved_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].iter().map(|r| r.request_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(buffer.pending_len().await, 1);
}

#[tokio::test]
async fn test_schema_widening_is_idempotent() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("test", backend, 100);

    buffer.append(record(1, json!({"score": 1}))).await.unwrap();
    assert_eq!(buffer.schema().await.get("score"), Some(ColumnType::Integer));

    buffer.append(record(2, json!({"score": 0.5}))).await.unwrap();
    let widened = buffer.schema().await;
    assert_eq!(widened.get("score"), Some(ColumnType::Float));

    buffer.append(record(3, json!({"score": 2}))).await.unwrap();
    buffer.append(record(4, json!({"score": 0.25}))).await.unwrap();
    assert_eq!(buffer.schema().await, widened);
}

#[tokio::test]
async fn test_null_payload_adds_no_column() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("test", backend, 100);

    buffer.append(record(1, json!({"label": null}))).await.unwrap();
    assert!(!buffer.schema().await.contains("label"));

    buffer.append(record(2, json!({"label": "greeting"}))).await.unwrap();
    assert_eq!(buffer.schema().await.get("label"), Some(ColumnType::String));
}

#[tokio::test]
async fn test_base_column_collision_is_rejected() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("test", backend, 1);

    let err = buffer
        .append(record(1, json!({"request_id": 7})))
        .await
        .unwrap_err();
    assert!(matches!(err, StatsError::SchemaConflict { .. }));
    assert_eq!(buffer.pending_len().await, 0);
}

#[tokio::test]
async fn test_drain_retries_transient_failures() {
    let backend = Arc::new(MemoryBackend::default());
    backend.failures_left.store(2, Ordering::SeqCst);
    let buffer = StatsBuffer::new("test", backend.clone(), 10);

    buffer.append(record(1, json!({"a": 1}))).await.unwrap();
    buffer.append(record(2, json!({"a": 2}))).await.unwrap();
    buffer.drain(3).await.unwrap();

    assert_eq!(backend.save_calls.load(Ordering::SeqCst), 3);
    assert_eq!(backend.saved_records(), 2);
    assert_eq!(buffer.pending_len().await, 0);
}

#[tokio::test]
async fn test_drain_gives_up_after_max_retries() {
    let backend = Arc::new(MemoryBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let buffer = StatsBuffer::new("test", backend.clone(), 10);

    buffer.append(record(1, json!({"a": 1}))).await.unwrap();
    assert!(buffer.drain(1).await.is_err());

    assert_eq!(backend.save_calls.load(Ordering::SeqCst), 2);
    assert_eq!(buffer.pending_len().await, 1);
}

#[tokio::test]
async fn test_load_required_on_empty_backend() {
    let backend = Arc::new(MemoryBackend::default());
    let buffer = StatsBuffer::new("empty", backend, 1);

    assert!(buffer.load().await.unwrap().is_empty());
    let err = buffer.load_required().await.unwrap_err();
    assert!(matches!(err, StatsError::EmptyBackend(ref name) if name == "empty"));
}
