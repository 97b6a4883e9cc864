//! External provider interfaces.
//!
//! The orchestrator consumes two cloud services through these traits:
//!
//! - [`FleetProvider`]: launch templates, scaling groups, instance
//!   descriptions, and lifecycle notification registration.
//! - [`MessagingProvider`]: pub/sub topics plus a durable queue with
//!   long-poll receive and explicit acknowledgment.
//!
//! Every call takes a flat parameter record and returns either a provider
//! error or a structured description. In-memory implementations live in
//! [`mock`] and back both development mode and the test suite.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flotilla_events::LifecycleEventKind;

use crate::fleet::{LaunchSpec, ScalingGroupSpec};

/// Provider call errors.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// The resource exists already; a concurrent creator won the race.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// Any other failed provider call.
    #[error("provider call failed: {0}")]
    Call(String),
}

/// A key/value tag on an instance. Serialized in the provider's wire
/// shape (`Key`/`Value`), matching how tags appear in topology attribute
/// maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// A tag attached to a scaling group, optionally propagated to the
/// instances it launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupTag {
    pub key: String,
    pub value: String,
    pub propagate_at_launch: bool,
}

impl GroupTag {
    pub fn group_only(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            propagate_at_launch: false,
        }
    }

    pub fn propagated(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            propagate_at_launch: true,
        }
    }
}

/// Canonical provider-side description of a launch template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    pub created_time: DateTime<Utc>,
}

/// Lifecycle state a group reports for a member instance.
pub mod lifecycle_states {
    pub const IN_SERVICE: &str = "InService";
    pub const PENDING: &str = "Pending";
}

/// Power state the provider reports for an instance.
pub mod instance_states {
    pub const RUNNING: &str = "running";
    pub const PENDING: &str = "pending";
}

/// One instance as reported by its scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInstance {
    pub instance_id: String,
    pub lifecycle_state: String,
}

impl GroupInstance {
    pub fn is_in_service(&self) -> bool {
        self.lifecycle_state == lifecycle_states::IN_SERVICE
    }
}

/// Canonical provider-side description of a scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingGroup {
    pub name: String,
    pub launch_template: String,
    pub min_size: u32,
    pub max_size: u32,
    pub instances: Vec<GroupInstance>,
    pub created_time: DateTime<Utc>,
}

/// Full description of a compute instance.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub image_id: String,
    pub state: String,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub security_groups: Vec<String>,
    pub tags: Vec<Tag>,
}

impl InstanceDescription {
    pub fn is_running(&self) -> bool {
        self.state == instance_states::RUNNING
    }
}

/// Queue attributes returned by the messaging provider.
#[derive(Debug, Clone)]
pub struct QueueAttributes {
    /// The queue's canonical identifier (ARN-equivalent), distinct from its
    /// URL and required for subscriptions and delivery policies.
    pub queue_arn: String,
}

/// A raw message received from the queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    /// How many times this message has been delivered, counting this one.
    pub receive_count: u32,
}

/// Elastic fleet control plane.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Create a launch template with the given parameters.
    async fn create_launch_template(&self, spec: &LaunchSpec) -> Result<(), ProviderError>;

    /// Describe a launch template by name. `None` when it does not exist.
    async fn describe_launch_template(
        &self,
        name: &str,
    ) -> Result<Option<LaunchTemplate>, ProviderError>;

    /// Create a scaling group with the given parameters.
    async fn create_scaling_group(&self, spec: &ScalingGroupSpec) -> Result<(), ProviderError>;

    /// Describe a scaling group by name. `None` when it does not exist.
    async fn describe_scaling_group(
        &self,
        name: &str,
    ) -> Result<Option<ScalingGroup>, ProviderError>;

    /// Describe a single compute instance.
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, ProviderError>;

    /// Register a topic as the lifecycle notification sink for a group,
    /// limited to the given event kinds.
    async fn put_notification_configuration(
        &self,
        group_name: &str,
        topic_arn: &str,
        kinds: &[LifecycleEventKind],
    ) -> Result<(), ProviderError>;
}

/// Pub/sub topic plus durable queue service.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Create a topic, returning its identifier.
    async fn create_topic(&self, name: &str) -> Result<String, ProviderError>;

    /// Create a queue, returning its URL.
    async fn create_queue(&self, name: &str) -> Result<String, ProviderError>;

    /// Fetch attributes for a queue by URL.
    async fn get_queue_attributes(&self, queue_url: &str)
        -> Result<QueueAttributes, ProviderError>;

    /// Subscribe a queue to a topic, returning the subscription identifier.
    async fn subscribe_queue(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<String, ProviderError>;

    /// Replace the queue's delivery policy.
    async fn set_queue_policy(
        &self,
        queue_url: &str,
        policy: &serde_json::Value,
    ) -> Result<(), ProviderError>;

    /// Long-poll receive at most one message. `None` when the wait elapses
    /// with an empty queue. A received message stays on the queue until
    /// deleted; it becomes visible again after `visibility` elapses.
    async fn receive_message(
        &self,
        queue_url: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<RawMessage>, ProviderError>;

    /// Acknowledge (delete) a received message.
    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), ProviderError>;
}
