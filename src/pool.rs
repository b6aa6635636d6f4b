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

// Publisher/subscriber pool between record producers and buffers
//
// Extractors turn a pipeline event into (at most) one record; every record
// is handed to each subscribed sink in registration order.

use crate::buffer::StatsBuffer;
use crate::error::Result;
use crate::record::Record;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Consumer of published records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept(&self, record: Record) -> Result<()>;

    fn name(&self) -> &str;
}

#[async_trait]
impl RecordSink for StatsBuffer {
    async fn accept(&self, record: Record) -> Result<()> {
        self.append(record).await
    }

    fn name(&self) -> &str {
        StatsBuffer::name(self)
    }
}

/// Producer computing a record from a pipeline event of type `E`.
/// `None` means no telemetry for this event.
#[async_trait]
pub trait Extractor<E: Sync>: Send + Sync {
    async fn extract(&self, event: &E) -> Option<Record>;
}

/// Adapter turning a plain closure into an [`Extractor`]
pub struct FnExtractor<E, F> {
    func: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> FnExtractor<E, F>
where
    F: Fn(&E) -> Option<Record> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F> Extractor<E> for FnExtractor<E, F>
where
    E: Sync,
    F: Fn(&E) -> Option<Record> + Send + Sync,
{
    async fn extract(&self, event: &E) -> Option<Record> {
        (self.func)(event)
    }
}

/// Fans records from registered extractors out to subscribed sinks
pub struct ExtractorPool<E: Sync> {
    extractors: RwLock<Vec<Arc<dyn Extractor<E>>>>,
    subscribers: RwLock<Vec<Arc<dyn RecordSink>>>,
}

impl<E: Sync> Default for ExtractorPool<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Sync> ExtractorPool<E> {
    pub fn new() -> Self {
        Self {
            extractors: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_extractor(&self, extractor: Arc<dyn Extractor<E>>) {
        self.extractors.write().await.push(extractor);
    }

    pub async fn subscribe(&self, sink: Arc<dyn RecordSink>) {
        debug!("Sink '{}' subscribed", sink.name());
        self.subscribers.write().await.push(sink);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Hand `record` to every subscriber in order.
    ///
    /// A failing sink does not stop delivery to the others; the first error
    /// is returned once every sink has been tried.
    pub async fn publish(&self, record: Record) -> Result<()> {
        let subscribers = self.subscribers.read().await.clone();
        let mut first_error = None;

        for sink in &subscribers {
            if let Err(e) = sink.accept(record.clone()).await {
                warn!("Sink '{}' rejected record: {}", sink.name(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every extractor on `event` and publish what they produce.
    ///
    /// Returns the number of records published.
    pub async fn dispatch(&self, event: &E) -> Result<usize> {
        let extractors = self.extractors.read().await.clone();
        let mut published = 0;

        for extractor in &extractors {
            if let Some(record) = extractor.extract(event).await {
                self.publish(record).await?;
                published += 1;
            }
        }
        Ok(published)
    }
}
