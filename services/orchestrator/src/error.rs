//! Error types for the provisioning flow.

use thiserror::Error;

use crate::provider::ProviderError;
use flotilla_topology::TopologyError;

/// Errors that abort a provisioning run.
///
/// The first error unwinds the whole run; already-created provider
/// resources are not rolled back. Idempotent creation reuses them on the
/// next run, while the notification channel steps will duplicate.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Ancestor attribute resolution failed, or the topology is malformed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A required launch attribute is on neither the node nor the defaults.
    #[error("no {0} on node or in defaults")]
    MissingAttribute(&'static str),

    /// The scaling group vanished (or was never created) while waiting for
    /// its first instance.
    #[error("the scaling group was not created")]
    GroupMissing { group: String },

    /// The group readiness budget ran out with no in-service instance.
    #[error("no instance created")]
    GroupTimeout { group: String, attempts: u32 },

    /// The instance readiness budget ran out before the instance ran.
    #[error("unable to start machine")]
    InstanceTimeout { instance_id: String, polls: u32 },

    /// Provisioning succeeded but the target node declares no child to
    /// receive the discovered instance attributes.
    #[error("no child to update")]
    NoChildToUpdate { node: String },
}
