//! Instance readiness polling.
//!
//! After the scaling group exists and notifications are wired, the saga
//! waits for the fleet to actually produce a usable instance. Two nested
//! phases with independent intervals and budgets, because group-level
//! lifecycle convergence and instance-level boot convergence are governed
//! by different provider subsystems with different latencies:
//!
//! - **Phase A**: poll the group until its first instance reports in
//!   service. A missing group is fatal immediately; an empty or pending
//!   group keeps polling until the attempt budget runs out.
//! - **Phase B**: poll the discovered instance until it reports running,
//!   then extract its identity and network attributes. Transient describe
//!   errors and a not-yet-running state are tracked by separate counters.
//!
//! The poller returns a [`ReadinessResult`]; it never mutates the topology
//! itself. The caller decides how to merge the result into its model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::provider::{FleetProvider, InstanceDescription, Tag};

/// Poll intervals and budgets.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between group describes.
    pub group_interval: Duration,

    /// Group describes before giving up on an in-service instance.
    pub group_attempts: u32,

    /// Delay between instance describes.
    pub instance_interval: Duration,

    /// Consecutive failed instance describes tolerated.
    pub instance_error_budget: u32,

    /// Successful describes reporting a non-running state tolerated.
    pub instance_pending_budget: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            group_interval: Duration::from_secs(6),
            group_attempts: 50, // ~5 minutes
            instance_interval: Duration::from_secs(2),
            instance_error_budget: 5,
            instance_pending_budget: 20,
        }
    }
}

/// Identity and network attributes of the first ready instance.
#[derive(Debug, Clone)]
pub struct ReadinessResult {
    pub image_id: String,
    pub instance_id: String,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub security_groups: Vec<String>,
    pub tags: Vec<Tag>,
}

impl ReadinessResult {
    fn from_description(desc: InstanceDescription) -> Self {
        Self {
            image_id: desc.image_id,
            instance_id: desc.instance_id,
            public_ip_address: desc.public_ip_address,
            private_ip_address: desc.private_ip_address,
            security_groups: desc.security_groups,
            tags: desc.tags,
        }
    }

    /// Render as a node attribute map, in the shape dependent topology
    /// nodes expect.
    pub fn to_specific(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("imageId".to_string(), json!(self.image_id));
        map.insert("instanceId".to_string(), json!(self.instance_id));
        map.insert("publicIpAddress".to_string(), json!(self.public_ip_address));
        map.insert(
            "privateIpAddress".to_string(),
            json!(self.private_ip_address),
        );
        map.insert("securityGroups".to_string(), json!(self.security_groups));
        map.insert(
            "tags".to_string(),
            Value::Array(
                self.tags
                    .iter()
                    .map(|t| json!({"Key": t.key, "Value": t.value}))
                    .collect(),
            ),
        );
        map
    }
}

/// Waits for a scaling group's first instance to become usable.
pub struct InstanceReadinessPoller {
    fleet: Arc<dyn FleetProvider>,
    config: PollConfig,
}

impl InstanceReadinessPoller {
    pub fn new(fleet: Arc<dyn FleetProvider>, config: PollConfig) -> Self {
        Self { fleet, config }
    }

    /// Run both phases: group readiness, then instance readiness.
    pub async fn wait_for_instance(
        &self,
        group_name: &str,
    ) -> Result<ReadinessResult, ProvisionError> {
        let instance_id = self.wait_for_group(group_name).await?;
        info!(instance_id = %instance_id, "waiting for instance");
        self.wait_for_running(&instance_id).await
    }

    /// Phase A: poll the group until its first instance is in service,
    /// returning that instance's id.
    async fn wait_for_group(&self, group_name: &str) -> Result<String, ProvisionError> {
        for attempt in 1..=self.config.group_attempts {
            let group = self.fleet.describe_scaling_group(group_name).await?;

            let Some(group) = group else {
                return Err(ProvisionError::GroupMissing {
                    group: group_name.to_string(),
                });
            };

            match group.instances.first() {
                Some(instance) if instance.is_in_service() => {
                    return Ok(instance.instance_id.clone());
                }
                _ => {
                    debug!(
                        group = %group_name,
                        attempt,
                        "no instance in service yet, keep polling"
                    );
                }
            }

            if attempt < self.config.group_attempts {
                tokio::time::sleep(self.config.group_interval).await;
            }
        }

        Err(ProvisionError::GroupTimeout {
            group: group_name.to_string(),
            attempts: self.config.group_attempts,
        })
    }

    /// Phase B: poll the instance until it reports running.
    ///
    /// Two independent counters: consecutive describe errors (reset by any
    /// successful describe) and total non-running polls. Either budget
    /// running out is fatal.
    async fn wait_for_running(
        &self,
        instance_id: &str,
    ) -> Result<ReadinessResult, ProvisionError> {
        let mut consecutive_errors = 0u32;
        let mut pending_polls = 0u32;

        loop {
            match self.fleet.describe_instance(instance_id).await {
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.config.instance_error_budget {
                        return Err(e.into());
                    }
                    warn!(
                        instance_id = %instance_id,
                        consecutive_errors,
                        error = %e,
                        "instance describe failed, retrying"
                    );
                }
                Ok(desc) => {
                    consecutive_errors = 0;
                    if desc.is_running() {
                        info!(
                            instance_id = %instance_id,
                            public_ip = ?desc.public_ip_address,
                            "instance running"
                        );
                        return Ok(ReadinessResult::from_description(desc));
                    }

                    pending_polls += 1;
                    if pending_polls > self.config.instance_pending_budget {
                        return Err(ProvisionError::InstanceTimeout {
                            instance_id: instance_id.to_string(),
                            polls: pending_polls,
                        });
                    }
                    debug!(
                        instance_id = %instance_id,
                        state = %desc.state,
                        pending_polls,
                        "instance not running yet"
                    );
                }
            }

            tokio::time::sleep(self.config.instance_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_config_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.group_interval, Duration::from_secs(6));
        assert_eq!(config.group_attempts, 50);
        assert_eq!(config.instance_interval, Duration::from_secs(2));
        assert_eq!(config.instance_error_budget, 5);
        assert_eq!(config.instance_pending_budget, 20);
    }

    #[test]
    fn test_readiness_result_renders_node_attributes() {
        let result = ReadinessResult {
            image_id: "ami-1".to_string(),
            instance_id: "i-0abc".to_string(),
            public_ip_address: Some("203.0.113.7".to_string()),
            private_ip_address: Some("10.0.0.7".to_string()),
            security_groups: vec!["sg-123".to_string()],
            tags: vec![Tag {
                key: "flotilla-system".to_string(),
                value: "checkout-prod".to_string(),
            }],
        };

        let map = result.to_specific();
        assert_eq!(map["imageId"], "ami-1");
        assert_eq!(map["instanceId"], "i-0abc");
        assert_eq!(map["publicIpAddress"], "203.0.113.7");
        assert_eq!(map["securityGroups"][0], "sg-123");
        assert_eq!(map["tags"][0]["Key"], "flotilla-system");
    }
}
