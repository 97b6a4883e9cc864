//! The provisioning pipeline.
//!
//! One provisioning run converges fleet infrastructure for a topology node
//! in strict sequence: ensure the launch template, ensure the scaling
//! group, wire the notification channel, wait for the first instance, then
//! write the discovered instance attributes into the node's first child.
//! Each step's output is required input to the next; the first error
//! unwinds the run with no compensation. Already-created resources are
//! reused on the next run by the idempotent ensure steps, while the
//! notification channel steps will duplicate (accepted, see DESIGN.md).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use flotilla_topology::{Topology, TopologyError, TopologyNode};

use crate::config::Config;
use crate::dispatcher::Reconciler;
use crate::error::ProvisionError;
use crate::fleet::{
    identity_tags, FleetProvisioner, HealthCheckKind, LaunchSpec, Placement, ScalingGroupSpec,
};
use crate::notifications::{NotificationChannel, NotificationChannelSetup};
use crate::provider::{
    FleetProvider, GroupTag, LaunchTemplate, MessagingProvider, ScalingGroup,
};
use crate::readiness::{InstanceReadinessPoller, PollConfig, ReadinessResult};

/// Node kind that marks a load balancer in the topology.
const LOAD_BALANCER_KIND: &str = "load-balancer";

/// Grace period before health checks count against a fresh instance.
const HEALTH_CHECK_GRACE_SECS: u32 = 180;

/// Which deployed system a provisioning run belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    /// System name, e.g. "checkout".
    pub system: String,

    /// Deployment target (topology name), e.g. "prod".
    pub topology: String,
}

impl SystemIdentity {
    pub fn new(system: impl Into<String>, topology: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            topology: topology.into(),
        }
    }

    /// `{system}-{topology}`, the qualifier embedded in every derived name.
    pub fn qualified(&self) -> String {
        format!("{}-{}", self.system, self.topology)
    }

    pub fn launch_template_name(&self) -> String {
        format!("lc-{}", self.qualified())
    }

    pub fn group_name(&self) -> String {
        format!("ag-{}", self.qualified())
    }

    /// Deterministic name shared by the notification topic and queue.
    pub fn channel_name(&self) -> String {
        format!("flotilla-{}", self.qualified())
    }
}

/// Immutable input to one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub identity: SystemIdentity,

    /// The scaling-group topology node to provision.
    pub node_id: String,
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub launch_template: LaunchTemplate,
    pub scaling_group: ScalingGroup,
    pub channel: NotificationChannel,
    pub readiness: ReadinessResult,

    /// The child node that received the instance attributes.
    pub updated_child: String,
}

/// Drives provisioning runs against the configured providers.
pub struct Orchestrator {
    fleet: Arc<dyn FleetProvider>,
    messaging: Arc<dyn MessagingProvider>,
    config: Config,
    poll: PollConfig,
}

impl Orchestrator {
    pub fn new(
        fleet: Arc<dyn FleetProvider>,
        messaging: Arc<dyn MessagingProvider>,
        config: Config,
    ) -> Self {
        Self {
            fleet,
            messaging,
            config,
            poll: PollConfig::default(),
        }
    }

    /// Override poll intervals and budgets.
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Run the full pipeline for `request`, updating `topology` with the
    /// discovered instance attributes on success.
    pub async fn provision(
        &self,
        topology: &mut Topology,
        request: &ProvisioningRequest,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let node = topology
            .node(&request.node_id)
            .ok_or_else(|| TopologyError::UnknownNode(request.node_id.clone()))?
            .clone();

        info!(
            system = %request.identity.qualified(),
            node = %node.id,
            "provisioning fleet"
        );

        let launch_spec = self.launch_spec(topology, &node, &request.identity)?;
        let group_spec = self.group_spec(topology, &node, &request.identity, &launch_spec.name)?;

        let provisioner = FleetProvisioner::new(Arc::clone(&self.fleet));
        let launch_template = provisioner.ensure_launch_template(&launch_spec).await?;
        let scaling_group = provisioner.ensure_scaling_group(&group_spec).await?;

        let channel = NotificationChannelSetup::new(
            Arc::clone(&self.messaging),
            Arc::clone(&self.fleet),
        )
        .setup(&request.identity.channel_name(), &group_spec.name)
        .await?;

        let poller = InstanceReadinessPoller::new(Arc::clone(&self.fleet), self.poll.clone());
        let readiness = poller.wait_for_instance(&group_spec.name).await?;

        let updated_child = topology
            .first_child(&request.node_id)
            .map(|child| child.id.clone())
            .ok_or_else(|| ProvisionError::NoChildToUpdate {
                node: request.node_id.clone(),
            })?;

        info!(
            child = %updated_child,
            instance_id = %readiness.instance_id,
            "updating child node with instance attributes"
        );
        topology.set_specific(&updated_child, readiness.to_specific())?;

        Ok(ProvisionOutcome {
            launch_template,
            scaling_group,
            channel,
            readiness,
            updated_child,
        })
    }

    /// Resolve launch parameters for a node: image, type, and key fall
    /// back to the defaults; the security group comes from the ancestors.
    fn launch_spec(
        &self,
        topology: &Topology,
        node: &TopologyNode,
        identity: &SystemIdentity,
    ) -> Result<LaunchSpec, ProvisionError> {
        let group_id = topology
            .resolve_ancestor_param(&node.id, "GroupId")?
            .as_str()
            .ok_or(ProvisionError::MissingAttribute("GroupId"))?
            .to_string();

        let image_id = node
            .attr_str("ImageId")
            .map(str::to_string)
            .or_else(|| self.config.default_image_id.clone())
            .ok_or(ProvisionError::MissingAttribute("ImageId"))?;

        let instance_type = node
            .attr_str("InstanceType")
            .map(str::to_string)
            .or_else(|| self.config.default_instance_type.clone())
            .ok_or(ProvisionError::MissingAttribute("InstanceType"))?;

        let key_name = node
            .attr_str("KeyName")
            .map(str::to_string)
            .or_else(|| self.config.default_key_name.clone());

        let name = self
            .config
            .default_launch_name
            .clone()
            .unwrap_or_else(|| identity.launch_template_name());

        Ok(LaunchSpec {
            name,
            image_id,
            instance_type,
            security_groups: vec![group_id],
            key_name,
        })
    }

    /// Resolve scaling group parameters: health check kind from the
    /// presence of an ancestor load balancer, placement from zones or
    /// subnet, sizes and tags from node attributes with defaults.
    fn group_spec(
        &self,
        topology: &Topology,
        node: &TopologyNode,
        identity: &SystemIdentity,
        launch_template: &str,
    ) -> Result<ScalingGroupSpec, ProvisionError> {
        let load_balancer = topology.ancestor_of_kind(&node.id, LOAD_BALANCER_KIND);
        let health_check = if load_balancer.is_some() {
            HealthCheckKind::Elb
        } else {
            HealthCheckKind::Ec2
        };
        let load_balancers = load_balancer
            .map(|lb| vec![lb.id.clone()])
            .unwrap_or_default();

        // Explicit zones win over any subnet; the provider accepts only
        // one of the two.
        let placement = match node.attr("AvailabilityZones") {
            Some(Value::Array(zones)) => Placement::Zones(
                zones
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => {
                let subnet = node
                    .attr_str("SubnetId")
                    .map(str::to_string)
                    .or_else(|| self.config.default_subnet_id.clone())
                    .ok_or(ProvisionError::MissingAttribute("SubnetId"))?;
                Placement::Subnet(subnet)
            }
        };

        let min_size = node
            .attr("MinSize")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(self.config.default_min_size);

        let max_size = node
            .attr("MaxSize")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(self.config.default_max_size);

        let user_tags: Vec<GroupTag> = node
            .attr("tags")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| ProvisionError::MissingAttribute("tags"))?
            .unwrap_or_default();

        let name = self
            .config
            .default_group_name
            .clone()
            .unwrap_or_else(|| identity.group_name());

        Ok(ScalingGroupSpec {
            name,
            health_check,
            health_check_grace_secs: HEALTH_CHECK_GRACE_SECS,
            launch_template: launch_template.to_string(),
            load_balancers,
            placement,
            tags: identity_tags(&identity.qualified(), &node.id, &user_tags),
            min_size,
            max_size,
        })
    }
}

/// [`Reconciler`] that re-runs the provisioning pipeline.
///
/// Lifecycle launch events land here from the dispatcher; the re-run
/// converges on the existing infrastructure through the idempotent ensure
/// steps. Runs are serialized on the topology lock, so one process never
/// races itself.
pub struct ProvisioningReconciler {
    orchestrator: Arc<Orchestrator>,
    topology: tokio::sync::Mutex<Topology>,
    request: ProvisioningRequest,
}

impl ProvisioningReconciler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        topology: Topology,
        request: ProvisioningRequest,
    ) -> Self {
        Self {
            orchestrator,
            topology: tokio::sync::Mutex::new(topology),
            request,
        }
    }
}

#[async_trait]
impl Reconciler for ProvisioningReconciler {
    async fn reconcile(&self, actor: &str, system: &str, target: &str) -> anyhow::Result<()> {
        info!(actor, system, target, "re-running provisioning pipeline");
        let mut topology = self.topology.lock().await;
        self.orchestrator
            .provision(&mut topology, &self.request)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        let identity = SystemIdentity::new("checkout", "prod");
        assert_eq!(identity.qualified(), "checkout-prod");
        assert_eq!(identity.launch_template_name(), "lc-checkout-prod");
        assert_eq!(identity.group_name(), "ag-checkout-prod");
        assert_eq!(identity.channel_name(), "flotilla-checkout-prod");
    }
}
