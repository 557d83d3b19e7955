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
//! IP manager CLI options.

use std::{fmt::Write, net::SocketAddr, path::PathBuf};

use address_manager::allocator;
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::Config;

/// IPv4 address manager
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Opts {
    /// Top-level subcommand
    #[command(subcommand)]
    pub command: Commands,

    /// Logging options
    #[command(flatten)]
    pub logging: LoggingOptions,
}

/// Logging options.
#[derive(Debug, Args)]
pub struct LoggingOptions {
    /// Log to stderr.
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    pub stderr: bool,

    /// Directory for the log file.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the IP manager.
    Run {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,

        /// File the stores are loaded from and saved to on shutdown.
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Address of the status API (e.g. 127.0.0.1:9100).
        #[arg(long)]
        status_addr: Option<SocketAddr>,
    },
    /// Validate a configuration file and print the pool capacities.
    Validate {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

/// One line per subnet pool: location, range and number of usable addresses.
pub fn describe_pools(config: &Config) -> String {
    let mut out = String::new();
    for (namespace, networks) in &config.namespaces {
        for (network, definition) in networks {
            for pool in &definition.subnets {
                let free = allocator::available(pool, &pool.exclusions());
                let _ = writeln!(
                    out,
                    "{namespace}/{network}/{}: {} range {}-{} free {free} reserved {}",
                    pool.name,
                    pool.cidr,
                    pool.range.start,
                    pool.range.end,
                    pool.reservations().len(),
                );
            }
        }
    }
    out
}
