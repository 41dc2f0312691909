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

use std::sync::Arc;
use std::time::SystemTime;

use clap::Parser;
use metalplane_config::control_plane::ControlPlaneConfig;
use metalplane_error::{Error, ResultExt, make_input_err};
use metalplane_orchestrator::control_plane::ControlPlane;
use metalplane_orchestrator::datastore::DataStore;
use metalplane_store::ipam::MemoryIpam;
use metalplane_store::memory_event_publisher::MemoryEventPublisher;
use metalplane_util::init_tracing;
use mimalloc::MiMalloc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Instrument, Level, event, trace_span};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Control plane of the bare metal provisioning platform.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

fn get_config() -> Result<ControlPlaneConfig, Error> {
    let args = Args::parse();
    let json_contents = String::from_utf8(
        std::fs::read(&args.config_file)
            .err_tip(|| format!("Could not open config file {}", args.config_file))?,
    )
    .map_err(|e| make_input_err!("Config file is not utf8: {e}"))?;
    Ok(serde_json5::from_str(&json_contents)?)
}

async fn inner_main(config: ControlPlaneConfig) -> Result<(), Error> {
    let control_plane = ControlPlane::new(
        config,
        DataStore::new_in_memory(),
        Arc::new(MemoryIpam::new()),
        Arc::new(MemoryEventPublisher::new()),
        SystemTime::now,
    )
    .await
    .err_tip(|| "Building control plane")?;
    control_plane.seed().await.err_tip(|| "Seeding catalog")?;
    let _background = control_plane.start_background();
    event!(Level::INFO, "Control plane started");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            event!(Level::WARN, "User terminated process via SIGINT");
        }
        _ = sigterm.recv() => {
            event!(Level::WARN, "Process terminated via SIGTERM");
        }
    }
    // Dropping the guards stops the release workers and the sweep.
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = get_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(inner_main(config).instrument(trace_span!("main")))
        .err_tip(|| "main() function failed")?;
    Ok(())
}
