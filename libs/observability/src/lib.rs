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
//! Logging and metrics shared by the IP manager binaries.
//!
//! Logs go to stderr, to a file, or both. The stderr output honours [LOG_LEVEL_ENV]; the
//! file always receives debug output.

use std::{
    io::IsTerminal,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use http::Request;
use tower_http::{
    LatencyUnit,
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultOnFailure, DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span, Subscriber, level_filters::LevelFilter};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt::time::UtcTime, prelude::*, registry::LookupSpan,
};

pub mod metrics;

/// Environment variable to define the log level.
pub const LOG_LEVEL_ENV: &str = "RUST_LOG";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Installs the global tracing subscriber.
///
/// With `log_dir`, debug logs are written to `<log_dir>/<executable>.log`. With
/// `log_to_stderr`, logs at the level given by [LOG_LEVEL_ENV] (default `info`) are printed
/// to stderr.
///
/// Logs are written by background threads; they are flushed as long as the returned guards
/// are alive.
pub fn setup_tracing<P: AsRef<Path>>(
    log_dir: Option<P>,
    log_to_stderr: bool,
) -> anyhow::Result<Vec<WorkerGuard>> {
    let mut outputs = Vec::new();
    if let Some(log_dir) = log_dir {
        outputs.push(file_output(log_dir.as_ref())?);
    }
    if log_to_stderr {
        outputs.push(stderr_output());
    }
    let (layers, guards): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();

    tracing::subscriber::set_global_default(Registry::default().with(layers))
        .context("global tracing subscriber already set")?;
    tracing::debug!(outputs = guards.len(), "Logging initialized");
    Ok(guards)
}

fn file_output<S>(log_dir: &Path) -> anyhow::Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let file_name = format!("{}.log", exec_name()?);
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG)
        .boxed();
    Ok((layer, guard))
}

fn stderr_output<S>() -> (BoxedLayer<S>, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let colored = std::io::stderr().is_terminal();
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(colored)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer)
        .with_filter(filter)
        .boxed();
    (layer, guard)
}

/// File stem of the running executable.
fn exec_name() -> anyhow::Result<String> {
    let path = std::env::current_exe().context("failed to get the executable path")?;
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
        .with_context(|| format!("no usable file name in {}", path.display()))
}

/// HTTP trace layer logging one span per request, and responses and failures at info level.
pub fn info_trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, NumberedSpans> {
    TraceLayer::new_for_http()
        .make_span_with(NumberedSpans::default())
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(
            DefaultOnFailure::new()
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Micros),
        )
}

/// Makes `request` spans carrying a request number that increases per process.
#[derive(Debug, Clone, Default)]
pub struct NumberedSpans {
    next: Arc<AtomicU64>,
}

impl<B> MakeSpan<B> for NumberedSpans {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            request_id = self.next.fetch_add(1, Ordering::Relaxed),
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
        )
    }
}
