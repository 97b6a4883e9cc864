//! In-memory provider implementations.
//!
//! Back development mode and the test suite. Behavior mirrors the real
//! services where it matters to callers:
//!
//! - Creating a resource whose name is taken fails with `AlreadyExists`;
//!   topic and queue creation are idempotent by name.
//! - A scaling group "boots" an instance after a configurable number of
//!   describes, and the instance reports running after a configurable
//!   number of its own describes, so readiness polling is exercised.
//! - Received messages stay on the queue until deleted and carry a
//!   delivery count, so at-least-once and poison flows are exercised.
//!
//! Failure injection and call recording are plain methods on the mocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use flotilla_events::LifecycleEventKind;

use crate::fleet::{LaunchSpec, ScalingGroupSpec};
use crate::provider::{
    instance_states, lifecycle_states, FleetProvider, GroupInstance, InstanceDescription,
    LaunchTemplate, MessagingProvider, ProviderError, QueueAttributes, RawMessage, ScalingGroup,
    Tag,
};

// =============================================================================
// Fleet
// =============================================================================

/// A recorded notification sink registration.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub group_name: String,
    pub topic_arn: String,
    pub kinds: Vec<LifecycleEventKind>,
}

struct MockGroup {
    spec: ScalingGroupSpec,
    created_time: chrono::DateTime<Utc>,
    describe_count: u32,
    instance_id: Option<String>,
}

struct MockInstance {
    description: InstanceDescription,
    polls: u32,
}

#[derive(Default)]
struct FleetState {
    launch_templates: HashMap<String, LaunchTemplate>,
    groups: HashMap<String, MockGroup>,
    instances: HashMap<String, MockInstance>,
    notification_configs: Vec<NotificationConfig>,

    instance_counter: u64,
    create_template_calls: u32,
    create_group_calls: u32,

    /// Group describes before the first instance reports in service.
    boot_after_polls: u32,

    /// Instance describes before the instance reports running.
    run_after_polls: u32,

    /// Remaining injected instance describe failures.
    fail_instance_describes: u32,

    /// When set, creates store the resource but report a concurrent
    /// creator.
    create_race: bool,
}

/// In-memory fleet provider.
pub struct MockFleetProvider {
    state: Mutex<FleetState>,
}

impl MockFleetProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FleetState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FleetState> {
        self.state.lock().expect("mock fleet lock poisoned")
    }

    /// Delay group readiness: the instance reports in service only after
    /// this many group describes.
    pub fn set_boot_polls(&self, polls: u32) {
        self.lock().boot_after_polls = polls;
    }

    /// Delay instance readiness: the instance reports running only after
    /// this many instance describes.
    pub fn set_run_polls(&self, polls: u32) {
        self.lock().run_after_polls = polls;
    }

    /// The group never produces an in-service instance.
    pub fn never_in_service(&self) {
        self.lock().boot_after_polls = u32::MAX;
    }

    /// Fail the next `count` instance describes.
    pub fn inject_instance_describe_failures(&self, count: u32) {
        self.lock().fail_instance_describes = count;
    }

    /// Make creates behave as if a concurrent creator won the race: the
    /// resource appears, but the create call reports `AlreadyExists`.
    pub fn enable_create_race(&self) {
        self.lock().create_race = true;
    }

    pub fn create_template_calls(&self) -> u32 {
        self.lock().create_template_calls
    }

    pub fn create_group_calls(&self) -> u32 {
        self.lock().create_group_calls
    }

    /// The parameters the most recent group creation was called with.
    pub fn scaling_group_request(&self, name: &str) -> Option<ScalingGroupSpec> {
        self.lock().groups.get(name).map(|g| g.spec.clone())
    }

    /// How many times a group has been described.
    pub fn group_describes(&self, name: &str) -> u32 {
        self.lock()
            .groups
            .get(name)
            .map(|g| g.describe_count)
            .unwrap_or(0)
    }

    pub fn notification_configs(&self) -> Vec<NotificationConfig> {
        self.lock().notification_configs.clone()
    }
}

impl Default for MockFleetProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetProvider for MockFleetProvider {
    async fn create_launch_template(&self, spec: &LaunchSpec) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.create_template_calls += 1;

        if state.launch_templates.contains_key(&spec.name) {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }

        let record = LaunchTemplate {
            name: spec.name.clone(),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            security_groups: spec.security_groups.clone(),
            key_name: spec.key_name.clone(),
            created_time: Utc::now(),
        };
        state.launch_templates.insert(spec.name.clone(), record);

        if state.create_race {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }
        debug!(name = %spec.name, "[MOCK] created launch template");
        Ok(())
    }

    async fn describe_launch_template(
        &self,
        name: &str,
    ) -> Result<Option<LaunchTemplate>, ProviderError> {
        Ok(self.lock().launch_templates.get(name).cloned())
    }

    async fn create_scaling_group(&self, spec: &ScalingGroupSpec) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.create_group_calls += 1;

        if state.groups.contains_key(&spec.name) {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }

        state.groups.insert(
            spec.name.clone(),
            MockGroup {
                spec: spec.clone(),
                created_time: Utc::now(),
                describe_count: 0,
                instance_id: None,
            },
        );

        if state.create_race {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }
        debug!(name = %spec.name, "[MOCK] created scaling group");
        Ok(())
    }

    async fn describe_scaling_group(
        &self,
        name: &str,
    ) -> Result<Option<ScalingGroup>, ProviderError> {
        let mut guard = self.lock();
        let FleetState {
            launch_templates,
            groups,
            instances,
            instance_counter,
            boot_after_polls,
            ..
        } = &mut *guard;

        let Some(group) = groups.get_mut(name) else {
            return Ok(None);
        };
        group.describe_count += 1;

        let mut members = Vec::new();
        if group.describe_count > *boot_after_polls {
            let instance_id = match &group.instance_id {
                Some(id) => id.clone(),
                None => {
                    *instance_counter += 1;
                    let id = format!("i-{:012x}", instance_counter);
                    let template = launch_templates.get(&group.spec.launch_template);
                    let tags = group
                        .spec
                        .tags
                        .iter()
                        .filter(|t| t.propagate_at_launch)
                        .map(|t| Tag {
                            key: t.key.clone(),
                            value: t.value.clone(),
                        })
                        .collect();
                    instances.insert(
                        id.clone(),
                        MockInstance {
                            description: InstanceDescription {
                                instance_id: id.clone(),
                                image_id: template
                                    .map(|t| t.image_id.clone())
                                    .unwrap_or_else(|| "ami-unknown".to_string()),
                                state: instance_states::PENDING.to_string(),
                                public_ip_address: Some(format!("203.0.113.{instance_counter}")),
                                private_ip_address: Some(format!("10.0.0.{instance_counter}")),
                                security_groups: template
                                    .map(|t| t.security_groups.clone())
                                    .unwrap_or_default(),
                                tags,
                            },
                            polls: 0,
                        },
                    );
                    group.instance_id = Some(id.clone());
                    id
                }
            };
            members.push(GroupInstance {
                instance_id,
                lifecycle_state: lifecycle_states::IN_SERVICE.to_string(),
            });
        }

        Ok(Some(ScalingGroup {
            name: group.spec.name.clone(),
            launch_template: group.spec.launch_template.clone(),
            min_size: group.spec.min_size,
            max_size: group.spec.max_size,
            instances: members,
            created_time: group.created_time,
        }))
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.fail_instance_describes > 0 {
            state.fail_instance_describes -= 1;
            return Err(ProviderError::Call(
                "injected instance describe failure".to_string(),
            ));
        }

        let run_after = state.run_after_polls;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::Call(format!("unknown instance {instance_id}")))?;

        instance.polls += 1;
        if instance.polls > run_after {
            instance.description.state = instance_states::RUNNING.to_string();
        }
        Ok(instance.description.clone())
    }

    async fn put_notification_configuration(
        &self,
        group_name: &str,
        topic_arn: &str,
        kinds: &[LifecycleEventKind],
    ) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.groups.contains_key(group_name) {
            return Err(ProviderError::Call(format!(
                "unknown scaling group {group_name}"
            )));
        }
        state.notification_configs.push(NotificationConfig {
            group_name: group_name.to_string(),
            topic_arn: topic_arn.to_string(),
            kinds: kinds.to_vec(),
        });
        Ok(())
    }
}

// =============================================================================
// Messaging
// =============================================================================

#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_arn: String,
    pub queue_arn: String,
    pub subscription_arn: String,
}

struct StoredMessage {
    message_id: String,
    body: String,
    receipt_handle: String,
    receive_count: u32,
}

struct QueueState {
    arn: String,
    policy: Option<serde_json::Value>,
    messages: VecDeque<StoredMessage>,
    delete_calls: Vec<String>,
}

#[derive(Default)]
struct MessagingState {
    topics: HashMap<String, String>,
    queue_urls: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    subscriptions: Vec<Subscription>,
    fail_receives: u32,
}

/// In-memory pub/sub + queue provider.
pub struct MockMessagingProvider {
    state: Mutex<MessagingState>,
}

impl MockMessagingProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MessagingState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MessagingState> {
        self.state.lock().expect("mock messaging lock poisoned")
    }

    /// Fail the next `count` receive calls.
    pub fn inject_receive_failures(&self, count: u32) {
        self.lock().fail_receives = count;
    }

    /// Deliver a message to every queue subscribed to the topic, wrapped
    /// in the delivery envelope. Returns the number of queues reached.
    pub fn publish(&self, topic_arn: &str, message: &str) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let targets: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|s| s.topic_arn == topic_arn)
            .map(|s| s.queue_arn.clone())
            .collect();

        let mut delivered = 0;
        for queue in state.queues.values_mut() {
            if targets.contains(&queue.arn) {
                let body = json!({
                    "Type": "Notification",
                    "TopicArn": topic_arn,
                    "Message": message,
                })
                .to_string();
                queue.messages.push_back(StoredMessage {
                    message_id: format!("m-{}", Uuid::new_v4()),
                    body,
                    receipt_handle: Uuid::new_v4().to_string(),
                    receive_count: 0,
                });
                delivered += 1;
            }
        }
        delivered
    }

    /// Enqueue a raw body directly, bypassing the topic.
    pub fn send_raw(&self, queue_url: &str, body: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(queue) = state.queues.get_mut(queue_url) {
            queue.messages.push_back(StoredMessage {
                message_id: format!("m-{}", Uuid::new_v4()),
                body: body.to_string(),
                receipt_handle: Uuid::new_v4().to_string(),
                receive_count: 0,
            });
        }
    }

    pub fn queue_policy(&self, queue_url: &str) -> Option<serde_json::Value> {
        self.lock()
            .queues
            .get(queue_url)
            .and_then(|q| q.policy.clone())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.lock().subscriptions.clone()
    }

    /// Every delete call made against a queue, in order.
    pub fn delete_calls(&self, queue_url: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|q| q.delete_calls.clone())
            .unwrap_or_default()
    }

    pub fn pending_messages(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }
}

impl Default for MockMessagingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingProvider for MockMessagingProvider {
    async fn create_topic(&self, name: &str) -> Result<String, ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let arn = state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| format!("arn:flotilla:topic:{name}"));
        Ok(arn.clone())
    }

    async fn create_queue(&self, name: &str) -> Result<String, ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(url) = state.queue_urls.get(name) {
            return Ok(url.clone());
        }

        let url = format!("https://queue.flotilla.local/{name}");
        state.queue_urls.insert(name.to_string(), url.clone());
        state.queues.insert(
            url.clone(),
            QueueState {
                arn: format!("arn:flotilla:queue:{name}"),
                policy: None,
                messages: VecDeque::new(),
                delete_calls: Vec::new(),
            },
        );
        Ok(url)
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<QueueAttributes, ProviderError> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|q| QueueAttributes {
                queue_arn: q.arn.clone(),
            })
            .ok_or_else(|| ProviderError::Call(format!("unknown queue {queue_url}")))
    }

    async fn subscribe_queue(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<String, ProviderError> {
        let subscription_arn = format!("arn:flotilla:subscription:{}", Uuid::new_v4());
        self.lock().subscriptions.push(Subscription {
            topic_arn: topic_arn.to_string(),
            queue_arn: queue_arn.to_string(),
            subscription_arn: subscription_arn.clone(),
        });
        Ok(subscription_arn)
    }

    async fn set_queue_policy(
        &self,
        queue_url: &str,
        policy: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        self.lock()
            .queues
            .get_mut(queue_url)
            .map(|q| q.policy = Some(policy.clone()))
            .ok_or_else(|| ProviderError::Call(format!("unknown queue {queue_url}")))
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        wait: Duration,
        _visibility: Duration,
    ) -> Result<Option<RawMessage>, ProviderError> {
        // First look without waiting.
        if let Some(message) = self.try_receive(queue_url)? {
            return Ok(Some(message));
        }

        // Simulate the long poll, then look once more.
        tokio::time::sleep(wait).await;
        self.try_receive(queue_url)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| ProviderError::Call(format!("unknown queue {queue_url}")))?;

        queue.delete_calls.push(receipt_handle.to_string());
        queue.messages.retain(|m| m.receipt_handle != receipt_handle);
        Ok(())
    }
}

impl MockMessagingProvider {
    fn try_receive(&self, queue_url: &str) -> Result<Option<RawMessage>, ProviderError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.fail_receives > 0 {
            state.fail_receives -= 1;
            return Err(ProviderError::Call("injected receive failure".to_string()));
        }

        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| ProviderError::Call(format!("unknown queue {queue_url}")))?;

        Ok(queue.messages.front_mut().map(|message| {
            message.receive_count += 1;
            RawMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                receipt_handle: message.receipt_handle.clone(),
                receive_count: message.receive_count,
            }
        }))
    }
}
