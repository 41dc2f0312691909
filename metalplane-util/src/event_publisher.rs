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

use async_trait::async_trait;
use metalplane_error::{Error, ResultExt};
use serde::Serialize;

/// Topic machine lifecycle events are published on.
pub const MACHINE_TOPIC: &str = "machine";
/// Topic switch port configuration changes are published on.
pub const SWITCH_TOPIC: &str = "switch";

/// Fire-and-forget side of the message bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn create_topic(&self, name: &str) -> Result<(), Error>;

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), Error>;
}

/// Serializes `event` and publishes it on `topic`.
pub async fn publish_event<T: Serialize + Sync>(
    publisher: &dyn EventPublisher,
    topic: &str,
    event: &T,
) -> Result<(), Error> {
    let payload = serde_json::to_value(event).err_tip(|| format!("Serializing {topic} event"))?;
    publisher
        .publish(topic, payload)
        .await
        .err_tip(|| format!("Publishing {topic} event"))
}
