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
//! Background tasks of a running IP manager.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A [JoinSet] whose tasks stop when its [CancellationToken] is cancelled.
///
/// The token is cancelled when the set is dropped, and whenever a task fails.
pub struct TaskSet {
    join_set: JoinSet<anyhow::Result<()>>,
    cancellation_token: CancellationToken,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    /// Creates an empty task set.
    pub fn new() -> Self {
        Self {
            join_set: JoinSet::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Creates a task set that is cancelled on `SIGINT` or `SIGTERM`.
    pub fn with_signal_handler() -> Self {
        let mut set = Self::new();
        let token = set.cancellation_token();
        set.join_set.spawn(async move {
            tokio::select! {
                result = shutdown_signal() => {
                    result?;
                    debug!("Received shutdown signal, cancelling tasks");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
            Ok(())
        });
        set
    }

    /// Returns a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns a task that runs until it completes or the set is cancelled.
    pub fn spawn_cancellable<Fut>(&mut self, task: Fut)
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.cancellation_token();
        self.join_set.spawn(async move {
            token.run_until_cancelled(task).await.unwrap_or(Ok(()))
        });
    }

    /// Waits for all tasks. The first failure cancels the remaining tasks.
    pub async fn join_all(&mut self) {
        while let Some(joined) = self.join_set.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => e.to_string(),
            };
            error!(
                error = %failure,
                remaining = self.join_set.len(),
                "Background task failed, shutting down"
            );
            self.cancellation_token.cancel();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
