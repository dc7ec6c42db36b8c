//! Background scheduler driving message processing on two cadences.
//!
//! One loop processes new messages, the other retries failed ones. Both run
//! as tokio tasks sharing a single [`CancellationToken`]. `stop` cancels the
//! token and waits for both tasks; a batch that is already running is allowed
//! to finish, but no new batch starts once cancellation is observed.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// The work the scheduler drives. Each call handles one batch and reports how
/// many messages ended up sent.
pub trait Processor: Send + Sync + 'static {
    fn process_pending(&self) -> BoxFuture<'_, Result<usize, Error>>;

    fn retry_failed(&self) -> BoxFuture<'_, Result<usize, Error>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub processing_interval: Duration,
    pub retry_interval: Duration,
    /// Upper bound for one processor call.
    pub invocation_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(120),
            retry_interval: Duration::from_secs(300),
            invocation_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub processing_interval_secs: u64,
    pub retry_interval_secs: u64,
}

enum SchedulerState {
    Stopped,
    Running {
        token: CancellationToken,
        handles: Vec<JoinHandle<()>>,
    },
}

pub struct Scheduler {
    processor: Arc<dyn Processor>,
    config: SchedulerConfig,
    // Held across the join in `stop`, so a concurrent `start` cannot slip in
    // before both loops have exited.
    state: Mutex<SchedulerState>,
    // Lock-free view of `state` for introspection while a stop is draining.
    running: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Pending,
    Retry,
}

impl Pass {
    fn name(&self) -> &'static str {
        match self {
            Pass::Pending => "process_pending",
            Pass::Retry => "retry_failed",
        }
    }
}

impl Scheduler {
    pub fn new(processor: Arc<dyn Processor>, config: SchedulerConfig) -> Self {
        Self {
            processor,
            config,
            state: Mutex::new(SchedulerState::Stopped),
            running: watch::channel(false).0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawns both loops. Fails with [`Error::AlreadyRunning`] if they are
    /// already up.
    pub async fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        if let SchedulerState::Running { .. } = *state {
            return Err(Error::AlreadyRunning);
        }

        tracing::info!(
            processing_interval_secs = self.config.processing_interval.as_secs(),
            retry_interval_secs = self.config.retry_interval.as_secs(),
            "starting scheduler"
        );

        let token = CancellationToken::new();

        let handles = vec![
            tokio::spawn(run_loop(
                self.processor.clone(),
                Pass::Pending,
                self.config.processing_interval,
                self.config.invocation_timeout,
                token.clone(),
            )),
            tokio::spawn(run_loop(
                self.processor.clone(),
                Pass::Retry,
                self.config.retry_interval,
                self.config.invocation_timeout,
                token.clone(),
            )),
        ];

        *state = SchedulerState::Running { token, handles };
        self.running.send_replace(true);

        Ok(())
    }

    /// Cancels both loops and waits until they have exited. Fails with
    /// [`Error::NotRunning`] if the scheduler is stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        let SchedulerState::Running { token, handles } =
            std::mem::replace(&mut *state, SchedulerState::Stopped)
        else {
            return Err(Error::NotRunning);
        };

        tracing::info!("stopping scheduler");

        token.cancel();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler loop panicked");
            }
        }

        self.running.send_replace(false);

        tracing::info!("scheduler stopped");

        Ok(())
    }

    /// Stays `true` until a pending `stop` has joined both loops. Never waits
    /// on the state lock.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            processing_interval_secs: self.config.processing_interval.as_secs(),
            retry_interval_secs: self.config.retry_interval.as_secs(),
        }
    }
}

async fn run_loop(
    processor: Arc<dyn Processor>,
    pass: Pass,
    period: Duration,
    invocation_timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(pass = pass.name(), "scheduler loop started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Cancellation may have raced the tick; never start a batch after it.
        if token.is_cancelled() {
            break;
        }

        run_once(processor.as_ref(), pass, invocation_timeout).await;
    }

    tracing::info!(pass = pass.name(), "scheduler loop stopped");
}

async fn run_once(processor: &dyn Processor, pass: Pass, invocation_timeout: Duration) {
    let call = match pass {
        Pass::Pending => processor.process_pending(),
        Pass::Retry => processor.retry_failed(),
    };

    match tokio::time::timeout(invocation_timeout, call).await {
        Ok(Ok(count)) => {
            tracing::debug!(pass = pass.name(), count, "scheduler pass finished")
        }
        Ok(Err(e)) => tracing::error!(pass = pass.name(), error = %e, "scheduler pass failed"),
        Err(_) => tracing::error!(
            pass = pass.name(),
            timeout_secs = invocation_timeout.as_secs(),
            "scheduler pass timed out"
        ),
    }
}
