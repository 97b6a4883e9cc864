//! Integration tests for the queue consumer and event dispatch.
//!
//! Verify at-least-once acknowledgment, poison message policies, the
//! cooperative stop with drain, and launch events re-entering the
//! provisioning pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use flotilla_events::LifecycleNotification;
use flotilla_orchestrator::consumer::{IterationOutcome, MessageHandler};
use flotilla_orchestrator::provider::MessagingProvider;
use flotilla_orchestrator::{
    Config, ConsumerConfig, LifecycleEventDispatcher, MockFleetProvider, MockMessagingProvider,
    Orchestrator, PoisonPolicy, ProvisioningReconciler, ProvisioningRequest, QueueConsumer,
    Reconciler, SystemIdentity,
};
use flotilla_topology::{Topology, TopologyNode};

struct CountingHandler {
    calls: AtomicU32,
    fail: bool,
    delay: Option<Duration>,
}

impl CountingHandler {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: false,
            delay: None,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: true,
            delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: false,
            delay: Some(delay),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _notification: LifecycleNotification) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("handler rejected message");
        }
        Ok(())
    }
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        wait_time: Duration::from_millis(5),
        visibility_timeout: Duration::from_secs(40),
        poison_policy: PoisonPolicy::RetryForever,
    }
}

async fn queue_with(messaging: &MockMessagingProvider, bodies: &[&str]) -> String {
    let url = messaging.create_queue("lifecycle").await.unwrap();
    for body in bodies {
        messaging.send_raw(&url, body);
    }
    url
}

fn launch_body() -> String {
    json!({
        "Event": "autoscaling:EC2_INSTANCE_LAUNCH",
        "AutoScalingGroupName": "ag-checkout-prod",
        "EC2InstanceId": "i-0abc"
    })
    .to_string()
}

fn consumer(
    messaging: &Arc<MockMessagingProvider>,
    url: &str,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
) -> Arc<QueueConsumer> {
    Arc::new(QueueConsumer::new(
        Arc::clone(messaging) as _,
        url,
        handler,
        config,
    ))
}

#[tokio::test]
async fn test_handler_success_acknowledges_exactly_once() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[&launch_body()]).await;
    let handler = CountingHandler::ok();
    let consumer = consumer(&messaging, &url, handler.clone(), fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::Acknowledged);

    assert_eq!(handler.calls(), 1);
    assert_eq!(messaging.delete_calls(&url).len(), 1);
    assert_eq!(messaging.pending_messages(&url), 0);
}

#[tokio::test]
async fn test_handler_failure_withholds_acknowledgment() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[&launch_body()]).await;
    let handler = CountingHandler::failing();
    let consumer = consumer(&messaging, &url, handler.clone(), fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::Retained);

    assert_eq!(handler.calls(), 1);
    assert!(messaging.delete_calls(&url).is_empty());
    assert_eq!(messaging.pending_messages(&url), 1);
}

#[tokio::test]
async fn test_empty_queue_re_arms() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[]).await;
    let consumer = consumer(&messaging, &url, CountingHandler::ok(), fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::Empty);
}

#[tokio::test]
async fn test_unparseable_message_retries_forever_by_default() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &["not json"]).await;
    let handler = CountingHandler::ok();
    let consumer = consumer(&messaging, &url, handler.clone(), fast_config());

    for _ in 0..3 {
        assert_eq!(consumer.process_one().await, IterationOutcome::Retained);
    }

    assert_eq!(handler.calls(), 0);
    assert!(messaging.delete_calls(&url).is_empty());
    assert_eq!(messaging.pending_messages(&url), 1);
}

#[tokio::test]
async fn test_poison_policy_drops_after_limit() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &["not json"]).await;
    let config = ConsumerConfig {
        poison_policy: PoisonPolicy::DropAfter(2),
        ..fast_config()
    };
    let consumer = consumer(&messaging, &url, CountingHandler::ok(), config);

    // Deliveries one and two stay within the limit.
    assert_eq!(consumer.process_one().await, IterationOutcome::Retained);
    assert_eq!(consumer.process_one().await, IterationOutcome::Retained);

    // The third delivery exceeds it and is dropped unprocessed.
    assert_eq!(consumer.process_one().await, IterationOutcome::Dropped);
    assert_eq!(messaging.delete_calls(&url).len(), 1);
    assert_eq!(messaging.pending_messages(&url), 0);
}

#[tokio::test]
async fn test_unknown_event_kind_withholds_acknowledgment() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let body = json!({"Event": "autoscaling:EC2_INSTANCE_REBOOT"}).to_string();
    let url = queue_with(&messaging, &[&body]).await;
    let handler = CountingHandler::ok();
    let consumer = consumer(&messaging, &url, handler.clone(), fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::Retained);
    assert_eq!(handler.calls(), 0);
    assert!(messaging.delete_calls(&url).is_empty());
}

#[tokio::test]
async fn test_receive_failure_does_not_stop_processing() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[&launch_body()]).await;
    messaging.inject_receive_failures(1);
    let consumer = consumer(&messaging, &url, CountingHandler::ok(), fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::ReceiveFailed);
    assert_eq!(consumer.process_one().await, IterationOutcome::Acknowledged);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent_with_drain() {
    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[&launch_body()]).await;
    let handler = CountingHandler::slow(Duration::from_millis(20));
    let consumer = consumer(&messaging, &url, handler.clone(), fast_config());

    assert!(consumer.start());
    assert!(consumer.start());
    assert!(consumer.is_running());

    // Let the loop pick up the in-flight message, then stop: the stop must
    // wait for that iteration to finish, so the handler call and the
    // acknowledgment are both visible afterwards.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(consumer.stop().await);
    assert!(!consumer.is_running());

    assert_eq!(handler.calls(), 1);
    assert_eq!(messaging.delete_calls(&url).len(), 1);

    // A message arriving after the stop is not consumed.
    messaging.send_raw(&url, &launch_body());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(messaging.pending_messages(&url), 1);

    assert!(consumer.stop().await);
}

fn node(id: &str, parent: &str, kind: &str, specific: serde_json::Value) -> TopologyNode {
    let specific = match specific {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    TopologyNode {
        id: id.to_string(),
        contained_by: parent.to_string(),
        kind: kind.to_string(),
        specific,
        contains: Vec::new(),
    }
}

fn provisioning_fixture() -> (Topology, ProvisioningRequest, Config) {
    let mut root = node("root", "root", "system", json!({}));
    root.contains = vec!["vpc".to_string()];
    let mut vpc = node("vpc", "root", "network", json!({"GroupId": "sg-123"}));
    vpc.contains = vec!["web".to_string()];
    let mut web = node("web", "vpc", "scaling-group", json!({}));
    web.contains = vec!["web-instance".to_string()];
    let instance = node("web-instance", "web", "compute-instance", json!({}));
    let topology = Topology::from_nodes(vec![root, vpc, web, instance]).unwrap();

    let request = ProvisioningRequest {
        identity: SystemIdentity::new("checkout", "prod"),
        node_id: "web".to_string(),
    };

    let config = Config {
        default_image_id: Some("ami-1".to_string()),
        default_instance_type: Some("t3.small".to_string()),
        default_subnet_id: Some("subnet-1".to_string()),
        ..Config::default()
    };

    (topology, request, config)
}

/// The end-to-end loop: a launch notification published through the
/// channel re-runs the provisioning pipeline, converging on the existing
/// infrastructure, and the message is acknowledged.
#[tokio::test]
async fn test_launch_event_re_runs_pipeline_and_acknowledges() {
    let fleet = Arc::new(MockFleetProvider::new());
    let messaging = Arc::new(MockMessagingProvider::new());
    let (mut topology, request, config) = provisioning_fixture();

    let fast_poll = flotilla_orchestrator::readiness::PollConfig {
        group_interval: Duration::from_millis(1),
        instance_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&fleet) as _, Arc::clone(&messaging) as _, config)
            .with_poll_config(fast_poll),
    );

    let outcome = orchestrator
        .provision(&mut topology, &request)
        .await
        .unwrap();
    let queue_url = outcome.channel.queue_url.clone();

    let reconciler = Arc::new(ProvisioningReconciler::new(
        Arc::clone(&orchestrator),
        topology,
        request.clone(),
    ));
    let dispatcher = Arc::new(LifecycleEventDispatcher::new(
        reconciler as _,
        "checkout",
        "prod",
    ));
    let consumer = consumer(&messaging, &queue_url, dispatcher, fast_config());

    // The provider publishes the launch through the topic; the body on the
    // queue is the delivery envelope.
    assert_eq!(messaging.publish(&outcome.channel.topic_arn, &launch_body()), 1);

    assert_eq!(consumer.process_one().await, IterationOutcome::Acknowledged);
    assert_eq!(messaging.delete_calls(&queue_url).len(), 1);

    // The re-run converged instead of recreating infrastructure.
    assert_eq!(fleet.create_template_calls(), 1);
    assert_eq!(fleet.create_group_calls(), 1);
}

/// Reconciler failures withhold acknowledgment so the event redelivers.
#[tokio::test]
async fn test_failed_reconcile_leaves_event_on_queue() {
    struct FailingReconciler;

    #[async_trait]
    impl Reconciler for FailingReconciler {
        async fn reconcile(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("reconcile unavailable")
        }
    }

    let messaging = Arc::new(MockMessagingProvider::new());
    let url = queue_with(&messaging, &[&launch_body()]).await;
    let dispatcher = Arc::new(LifecycleEventDispatcher::new(
        Arc::new(FailingReconciler) as _,
        "checkout",
        "prod",
    ));
    let consumer = consumer(&messaging, &url, dispatcher, fast_config());

    assert_eq!(consumer.process_one().await, IterationOutcome::Retained);
    assert_eq!(messaging.pending_messages(&url), 1);
}
