//! Mock generators and fixtures shared by the Stepwise test suites.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{Barrier, Notify, Semaphore};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Generator;
use stepwise_core::types::{Generation, GenerationRequest};

/// Plays back a fixed script of generation results and records every
/// request it receives. Fails once the script runs out.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generation>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<Generation>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script made only of successful generations.
    pub fn replies(generations: Vec<Generation>) -> Self {
        Self::new(generations.into_iter().map(Ok).collect())
    }

    pub fn push(&self, result: Result<Generation>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| Err(StepwiseError::Generation("script exhausted".into())))
        })
    }
}

/// Always fails with a retryable generation error.
pub struct FailingGenerator {
    message: String,
}

impl FailingGenerator {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Generator for FailingGenerator {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        let message = self.message.clone();
        Box::pin(async move { Err(StepwiseError::Generation(message)) })
    }
}

/// Never returns. Drives timeout and cancellation tests.
pub struct StallingGenerator;

impl Generator for StallingGenerator {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(futures::future::pending())
    }
}

/// Blocks inside `generate` until released, so a test can observe a turn
/// that is mid-flight.
pub struct HoldGenerator {
    reply: Generation,
    entered: Notify,
    gate: Semaphore,
    calls: Mutex<usize>,
}

impl HoldGenerator {
    pub fn new(reply: Generation) -> Self {
        Self {
            reply,
            entered: Notify::new(),
            gate: Semaphore::new(0),
            calls: Mutex::new(0),
        }
    }

    /// Wait until some call has entered `generate`.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one held call return.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Generator for HoldGenerator {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        *self.calls.lock().unwrap() += 1;
        Box::pin(async move {
            self.entered.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StepwiseError::Generation(e.to_string()))?;
            permit.forget();
            Ok(self.reply.clone())
        })
    }
}

/// Returns only once `n` calls are in flight at the same time. A test that
/// finishes proves those calls ran concurrently.
pub struct BarrierGenerator {
    barrier: Arc<Barrier>,
    reply: Generation,
}

impl BarrierGenerator {
    pub fn new(n: usize, reply: Generation) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(n)),
            reply,
        }
    }
}

impl Generator for BarrierGenerator {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        let barrier = self.barrier.clone();
        let reply = self.reply.clone();
        Box::pin(async move {
            barrier.wait().await;
            Ok(reply)
        })
    }
}

/// Write `contents` to a temporary `.toml` file.
pub fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
