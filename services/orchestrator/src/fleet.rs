//! Idempotent fleet infrastructure convergence.
//!
//! [`FleetProvisioner`] ensures a launch template and a scaling group exist,
//! following the same check-then-create-then-reread pattern for both so a
//! re-run after a partial failure converges instead of erroring:
//!
//! 1. Describe by name; if found, return the canonical record unchanged.
//! 2. Create with the requested parameters; a concurrent creator's
//!    "already exists" is tolerated.
//! 3. Re-describe and return the canonical record.
//!
//! No local state is retained; the provider's description is the only truth.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::provider::{FleetProvider, GroupTag, LaunchTemplate, ProviderError, ScalingGroup};

/// Health check kind for a scaling group.
///
/// `Elb` when the group sits behind a load balancer (an ancestor
/// load-balancer node exists), `Ec2` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckKind {
    Ec2,
    Elb,
}

impl HealthCheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ec2 => "EC2",
            Self::Elb => "ELB",
        }
    }
}

/// Where a scaling group places its instances.
///
/// A group is placed either in a subnet or across explicit availability
/// zones. The provider accepts exactly one of the two, so the variants are
/// mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Subnet(String),
    Zones(Vec<String>),
}

/// Resolved launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
}

/// Resolved scaling group parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingGroupSpec {
    pub name: String,
    pub health_check: HealthCheckKind,
    pub health_check_grace_secs: u32,
    pub launch_template: String,
    pub load_balancers: Vec<String>,
    pub placement: Placement,
    pub tags: Vec<GroupTag>,
    pub min_size: u32,
    pub max_size: u32,
}

/// Identity tags attached to every scaling group, appended after any
/// user-supplied tags. The merge never deduplicates; the provider sees
/// user tags first.
pub fn identity_tags(system_id: &str, node_id: &str, user_tags: &[GroupTag]) -> Vec<GroupTag> {
    let mut tags = user_tags.to_vec();
    tags.push(GroupTag::group_only("Name", node_id));
    tags.push(GroupTag::group_only(
        "flotilla-id",
        format!("{system_id}-{node_id}"),
    ));
    // Instances launched into the group inherit the system tag.
    tags.push(GroupTag::propagated("flotilla-system", system_id));
    tags
}

/// Idempotent ensure-operations against the fleet provider.
pub struct FleetProvisioner {
    fleet: Arc<dyn FleetProvider>,
}

impl FleetProvisioner {
    pub fn new(fleet: Arc<dyn FleetProvider>) -> Self {
        Self { fleet }
    }

    /// Ensure a launch template exists, returning its canonical record.
    ///
    /// Calling twice with identical parameters after the first success is a
    /// no-op returning the same record. A true race that loses both the
    /// create and the follow-up describe surfaces as a provider error.
    pub async fn ensure_launch_template(
        &self,
        spec: &LaunchSpec,
    ) -> Result<LaunchTemplate, ProvisionError> {
        if let Some(existing) = self.fleet.describe_launch_template(&spec.name).await? {
            debug!(name = %spec.name, "launch template already exists");
            return Ok(existing);
        }

        match self.fleet.create_launch_template(spec).await {
            Ok(()) => info!(
                name = %spec.name,
                image_id = %spec.image_id,
                instance_type = %spec.instance_type,
                "created launch template"
            ),
            Err(ProviderError::AlreadyExists(_)) => {
                debug!(name = %spec.name, "launch template created concurrently")
            }
            Err(e) => return Err(e.into()),
        }

        self.fleet
            .describe_launch_template(&spec.name)
            .await?
            .ok_or_else(|| {
                ProviderError::Call(format!(
                    "launch template {} not visible after creation",
                    spec.name
                ))
                .into()
            })
    }

    /// Ensure a scaling group exists, returning its canonical record.
    pub async fn ensure_scaling_group(
        &self,
        spec: &ScalingGroupSpec,
    ) -> Result<ScalingGroup, ProvisionError> {
        if let Some(existing) = self.fleet.describe_scaling_group(&spec.name).await? {
            debug!(name = %spec.name, "scaling group already exists");
            return Ok(existing);
        }

        match self.fleet.create_scaling_group(spec).await {
            Ok(()) => info!(
                name = %spec.name,
                health_check = spec.health_check.as_str(),
                min_size = spec.min_size,
                max_size = spec.max_size,
                "created scaling group"
            ),
            Err(ProviderError::AlreadyExists(_)) => {
                debug!(name = %spec.name, "scaling group created concurrently")
            }
            Err(e) => return Err(e.into()),
        }

        self.fleet
            .describe_scaling_group(&spec.name)
            .await?
            .ok_or_else(|| {
                ProviderError::Call(format!(
                    "scaling group {} not visible after creation",
                    spec.name
                ))
                .into()
            })
    }
}
