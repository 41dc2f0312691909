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

pub mod catalog;
pub mod event_publisher;
pub mod job_queue;
pub mod machine;
pub mod network;
pub mod provisioning;
pub mod retry;
pub mod store_trait;
pub mod switch;
pub mod task;

use core::sync::atomic::{AtomicBool, Ordering};

// Re-export tracing mostly for use in macros.
pub use tracing as __tracing;

/// Initialize tracing.
pub fn init_tracing() -> Result<(), metalplane_error::Error> {
    static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(metalplane_error::make_err!(
            metalplane_error::Code::Internal,
            "Logging already initialized"
        ));
    }
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| {
            metalplane_error::make_err!(
                metalplane_error::Code::Internal,
                "Could not install tracing subscriber: {e}"
            )
        })
}
