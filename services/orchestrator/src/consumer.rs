//! Durable queue consumption loop.
//!
//! A single logical loop long-polls the lifecycle queue, parses each
//! message, hands it to the registered handler, and deletes the message
//! only after the handler succeeds. Delivery is therefore at-least-once:
//! anything that fails before the delete reappears once its visibility
//! window elapses.
//!
//! Iterations never overlap; the loop re-arms only after the previous
//! iteration's full resolution. Cancellation is cooperative:
//! [`QueueConsumer::stop`] flips a token checked between iterations and
//! resolves only once the in-flight iteration has completed, so callers
//! get a real drain guarantee. Per-message failures and receive-call
//! failures are logged and never terminate the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flotilla_events::{EventError, LifecycleNotification};

use crate::provider::{MessagingProvider, RawMessage};

/// What to do with a message that cannot be parsed.
///
/// An unparseable message is never acknowledged by normal processing, so
/// without a policy it redelivers forever. The choice is explicit here
/// rather than an accident of non-acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Leave the message unacknowledged; it redelivers after every
    /// visibility window.
    RetryForever,

    /// Delete the message without processing once its delivery count
    /// exceeds the limit.
    DropAfter(u32),
}

/// Consumer loop configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Long-poll wait per receive.
    pub wait_time: Duration,

    /// Visibility window requested for received messages.
    pub visibility_timeout: Duration,

    /// Poison message policy.
    pub poison_policy: PoisonPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(40),
            poison_policy: PoisonPolicy::RetryForever,
        }
    }
}

/// Handles one parsed lifecycle notification.
///
/// An `Err` withholds acknowledgment; the message redelivers after its
/// visibility window.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, notification: LifecycleNotification) -> anyhow::Result<()>;
}

/// Resolution of a single consumer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The wait elapsed with no message.
    Empty,

    /// A message was dispatched and acknowledged.
    Acknowledged,

    /// A message failed parse, dispatch, or acknowledgment and stays on
    /// the queue.
    Retained,

    /// An unparseable message was deleted by the poison policy.
    Dropped,

    /// The receive call itself failed.
    ReceiveFailed,
}

struct RunningLoop {
    cancel: watch::Sender<bool>,
    done: JoinHandle<()>,
}

struct ConsumerInner {
    messaging: Arc<dyn MessagingProvider>,
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    running: Mutex<Option<RunningLoop>>,
}

/// Long-running receive/ack loop against the lifecycle queue.
#[derive(Clone)]
pub struct QueueConsumer {
    inner: Arc<ConsumerInner>,
}

impl QueueConsumer {
    pub fn new(
        messaging: Arc<dyn MessagingProvider>,
        queue_url: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                messaging,
                queue_url: queue_url.into(),
                handler,
                config,
                running: Mutex::new(None),
            }),
        }
    }

    /// Start the loop if it is not already running. Idempotent; returns
    /// the resulting running state. Never blocks on queue traffic: the
    /// loop runs as a spawned task.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running.lock().expect("consumer lock poisoned");

        if let Some(current) = running.as_ref() {
            if !current.done.is_finished() {
                debug!(queue = %self.inner.queue_url, "consumer already running");
                return true;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let done = tokio::spawn(async move {
            inner.run_loop(cancel_rx).await;
        });

        *running = Some(RunningLoop {
            cancel: cancel_tx,
            done,
        });
        true
    }

    /// Signal the loop to stop and wait for the in-flight iteration to
    /// complete. Idempotent; returns the resulting stopped state. Only the
    /// next iteration is skipped; a receive or handler call already in
    /// flight runs to completion first.
    pub async fn stop(&self) -> bool {
        let current = self
            .inner
            .running
            .lock()
            .expect("consumer lock poisoned")
            .take();

        match current {
            None => true,
            Some(current) => {
                let _ = current.cancel.send(true);
                if let Err(e) = current.done.await {
                    error!(error = %e, "consumer loop task failed");
                }
                true
            }
        }
    }

    /// True while the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .expect("consumer lock poisoned")
            .as_ref()
            .map(|r| !r.done.is_finished())
            .unwrap_or(false)
    }

    /// Run one receive/parse/dispatch/ack iteration.
    pub async fn process_one(&self) -> IterationOutcome {
        self.inner.process_one().await
    }
}

impl ConsumerInner {
    async fn run_loop(self: Arc<Self>, cancel: watch::Receiver<bool>) {
        info!(queue = %self.queue_url, "queue consumer started");

        while !*cancel.borrow() {
            self.process_one().await;
        }

        info!(queue = %self.queue_url, "queue consumer stopped");
    }

    async fn process_one(&self) -> IterationOutcome {
        let received = self
            .messaging
            .receive_message(
                &self.queue_url,
                self.config.wait_time,
                self.config.visibility_timeout,
            )
            .await;

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(queue = %self.queue_url, "queue empty");
                return IterationOutcome::Empty;
            }
            Err(e) => {
                error!(queue = %self.queue_url, error = %e, "receive failed");
                return IterationOutcome::ReceiveFailed;
            }
        };

        let notification = match LifecycleNotification::from_json(&message.body) {
            Ok(notification) => notification,
            Err(e) => {
                return self.apply_poison_policy(&message, &e).await;
            }
        };

        if let Err(e) = self.handler.handle(notification).await {
            warn!(
                message_id = %message.message_id,
                error = %e,
                "handler failed, message not acknowledged"
            );
            return IterationOutcome::Retained;
        }

        match self
            .messaging
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
        {
            Ok(()) => IterationOutcome::Acknowledged,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "failed to acknowledge handled message, it will redeliver"
                );
                IterationOutcome::Retained
            }
        }
    }

    async fn apply_poison_policy(
        &self,
        message: &RawMessage,
        cause: &EventError,
    ) -> IterationOutcome {
        match self.config.poison_policy {
            PoisonPolicy::DropAfter(limit) if message.receive_count > limit => {
                error!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    limit,
                    error = %cause,
                    "dropping poison message"
                );
                if let Err(e) = self
                    .messaging
                    .delete_message(&self.queue_url, &message.receipt_handle)
                    .await
                {
                    warn!(error = %e, "failed to drop poison message");
                    return IterationOutcome::Retained;
                }
                IterationOutcome::Dropped
            }
            _ => {
                error!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %cause,
                    "unparseable message, leaving for redelivery"
                );
                IterationOutcome::Retained
            }
        }
    }
}
