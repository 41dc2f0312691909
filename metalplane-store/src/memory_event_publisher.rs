// Copyright 2025 The Metalplane Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use async_trait::async_trait;
use metalplane_error::Error;
use metalplane_util::event_publisher::EventPublisher;
use parking_lot::Mutex;
use tracing::{Level, event};

/// Keeps every published payload per topic. Publishing on a topic that was
/// never created creates it.
#[derive(Debug, Default)]
pub struct MemoryEventPublisher {
    topics: Mutex<BTreeMap<String, Vec<serde_json::Value>>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All payloads published on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.topics.lock().get(topic).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn create_topic(&self, name: &str) -> Result<(), Error> {
        self.topics.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), Error> {
        event!(Level::TRACE, topic, "Publishing event");
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }
}
