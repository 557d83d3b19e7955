// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! IP manager binary.

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use ipam_observability::{metrics::MetricsRegistry, setup_tracing};
use ipmanager::{
    cli::{Commands, Opts, describe_pools},
    config::Config,
    runtime::IpManagerRuntimeBuilder,
    tasks::TaskSet,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let _guards = setup_tracing(opts.logging.log_dir.as_ref(), opts.logging.stderr)?;

    match opts.command {
        Commands::Run {
            config,
            state_file,
            status_addr,
        } => run(config, state_file, status_addr).await,
        Commands::Validate { config } => {
            let config = Config::load(config)?;
            print!("{}", describe_pools(&config));
            Ok(())
        }
    }
}

async fn run(
    config: PathBuf,
    state_file: Option<PathBuf>,
    status_addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let config = Config::load(config)?;

    let mut builder =
        IpManagerRuntimeBuilder::new(config).with_metrics_registry(MetricsRegistry::new_global());
    if let Some(state_file) = state_file {
        builder = builder.with_state_file(state_file);
    }
    if let Some(status_addr) = status_addr {
        builder = builder.with_status_addr(status_addr);
    }

    let mut runtime = builder
        .start_with_task_set(TaskSet::with_signal_handler())
        .await?;
    runtime.join().await?;
    tracing::info!("IP manager stopped");
    Ok(())
}
