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

// Shared tokio runtime for sink workers
//
// Sinks with asynchronous consumption (live server, cloud relay) run their
// workers on the ambient tokio runtime when one exists. Applications that
// are not async get a lazily started background runtime instead, so logging
// stays a plain synchronous call everywhere.

use std::sync::OnceLock;

use tokio::runtime::Handle;
use tracing::debug;

static FALLBACK: OnceLock<Handle> = OnceLock::new();

/// Completion handle for a stopped sink worker.
///
/// Returned by the non-blocking `stop()` of worker-backed sinks; waiting on
/// it completes only after the worker has drained and no further callbacks
/// will be invoked.
#[must_use]
pub struct ShutdownHandle {
    join: Option<tokio::task::JoinHandle<()>>,
}

impl ShutdownHandle {
    pub(crate) fn new(join: Option<tokio::task::JoinHandle<()>>) -> Self {
        Self { join }
    }

    /// Waits for the worker to finish.
    pub async fn wait(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Blocking variant of [`ShutdownHandle::wait`] for synchronous callers.
    ///
    /// Must not be called from a runtime thread (e.g. inside a sink
    /// callback); use `wait().await` there instead.
    pub fn wait_blocking(mut self) {
        if let Some(join) = self.join.take() {
            let handle = get_runtime_handle();
            let _ = handle.block_on(async { join.await });
        }
    }
}

/// Returns a handle to a usable tokio runtime.
pub(crate) fn get_runtime_handle() -> Handle {
    if let Ok(handle) = Handle::try_current() {
        return handle;
    }

    FALLBACK
        .get_or_init(|| {
            debug!("starting background runtime for sink workers");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .thread_name("robolog-worker")
                .build()
                .expect("failed to build background runtime");
            let handle = runtime.handle().clone();
            // The runtime lives for the rest of the process.
            std::thread::Builder::new()
                .name("robolog-runtime".to_string())
                .spawn(move || {
                    runtime.block_on(std::future::pending::<()>());
                })
                .expect("failed to spawn runtime thread");
            handle
        })
        .clone()
}
