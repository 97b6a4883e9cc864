//! Lifecycle event routing.
//!
//! The dispatcher sits behind the queue consumer and decides what each
//! recognized lifecycle event means for the system: a launch means the
//! fleet changed shape and the owning system must be reconciled; the other
//! kinds are recorded and acknowledged. Because the event kind is a closed
//! enum, adding a kind forces this routing to be extended at compile time.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use flotilla_events::{LifecycleEventKind, LifecycleNotification};

use crate::consumer::MessageHandler;

/// Actor recorded on reconciliations triggered by lifecycle events.
const EVENT_ACTOR: &str = "lifecycle-event";

/// Re-applies desired state to a running system.
///
/// Implemented by the provisioning pipeline itself (a full re-run, safe
/// because infrastructure creation is idempotent) and by log-only sinks in
/// tooling.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, actor: &str, system: &str, target: &str) -> anyhow::Result<()>;
}

/// Routes parsed lifecycle notifications.
pub struct LifecycleEventDispatcher {
    reconciler: Arc<dyn Reconciler>,

    /// System the watched queue belongs to.
    system: String,

    /// Deployment target (topology name) within the system.
    target: String,
}

impl LifecycleEventDispatcher {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        system: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            reconciler,
            system: system.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for LifecycleEventDispatcher {
    async fn handle(&self, notification: LifecycleNotification) -> anyhow::Result<()> {
        match notification.kind {
            LifecycleEventKind::InstanceLaunch => {
                info!(
                    system = %self.system,
                    target = %self.target,
                    instance_id = ?notification.instance_id,
                    group = ?notification.group_name,
                    "instance launched, reconciling system"
                );
                self.reconciler
                    .reconcile(EVENT_ACTOR, &self.system, &self.target)
                    .await
            }
            LifecycleEventKind::InstanceLaunchError => {
                warn!(
                    group = ?notification.group_name,
                    payload = %notification.payload,
                    "instance launch failed"
                );
                Ok(())
            }
            LifecycleEventKind::InstanceTerminate => {
                info!(
                    instance_id = ?notification.instance_id,
                    group = ?notification.group_name,
                    "instance terminated"
                );
                Ok(())
            }
            LifecycleEventKind::InstanceTerminateError => {
                warn!(
                    group = ?notification.group_name,
                    payload = %notification.payload,
                    "instance terminate failed"
                );
                Ok(())
            }
            LifecycleEventKind::TestNotification => {
                debug!(group = ?notification.group_name, "channel test ping");
                Ok(())
            }
        }
    }
}

/// Log-only reconciler used by watch tooling: records the request and
/// succeeds without touching infrastructure.
pub struct LoggingReconciler;

#[async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, actor: &str, system: &str, target: &str) -> anyhow::Result<()> {
        info!(actor, system, target, "reconcile requested (log only)");
        Ok(())
    }
}
