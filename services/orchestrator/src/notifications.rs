//! Lifecycle notification channel setup.
//!
//! Wires the path an instance lifecycle event travels: scaling group →
//! topic → queue. Six steps run in strict sequence, each recording its
//! output in the accumulating [`NotificationChannel`]; the first failure
//! aborts the sequence and nothing already created is torn down.
//!
//! The sequence is not idempotent end to end: providers that treat
//! duplicate names as no-ops (topics, queues) converge, but re-running
//! still creates a fresh subscription and rewrites the queue policy. Call
//! it once per system.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use flotilla_events::LifecycleEventKind;

use crate::error::ProvisionError;
use crate::provider::{FleetProvider, MessagingProvider};

/// Accumulated channel state. Each field is written by exactly one setup
/// step and immutable once set.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    pub topic_arn: String,
    pub queue_url: String,
    pub queue_arn: String,
    pub subscription_arn: String,
}

/// Builds the notification channel for a scaling group.
pub struct NotificationChannelSetup {
    messaging: Arc<dyn MessagingProvider>,
    fleet: Arc<dyn FleetProvider>,
}

impl NotificationChannelSetup {
    pub fn new(messaging: Arc<dyn MessagingProvider>, fleet: Arc<dyn FleetProvider>) -> Self {
        Self { messaging, fleet }
    }

    /// Create topic and queue named `channel_name`, subscribe the queue to
    /// the topic, register the topic as `group_name`'s lifecycle sink, and
    /// authorize the topic to deliver into the queue.
    pub async fn setup(
        &self,
        channel_name: &str,
        group_name: &str,
    ) -> Result<NotificationChannel, ProvisionError> {
        let topic_arn = self.messaging.create_topic(channel_name).await?;
        debug!(topic_arn = %topic_arn, "created topic");

        let queue_url = self.messaging.create_queue(channel_name).await?;
        debug!(queue_url = %queue_url, "created queue");

        let attributes = self.messaging.get_queue_attributes(&queue_url).await?;
        let queue_arn = attributes.queue_arn;
        debug!(queue_arn = %queue_arn, "fetched queue attributes");

        let subscription_arn = self
            .messaging
            .subscribe_queue(&topic_arn, &queue_arn)
            .await?;
        debug!(subscription_arn = %subscription_arn, "subscribed queue to topic");

        self.fleet
            .put_notification_configuration(
                group_name,
                &topic_arn,
                &LifecycleEventKind::REGISTERED,
            )
            .await?;
        debug!(group = %group_name, "registered lifecycle notification sink");

        let policy = delivery_policy(channel_name, &queue_arn, &topic_arn);
        self.messaging.set_queue_policy(&queue_url, &policy).await?;

        info!(
            channel = %channel_name,
            group = %group_name,
            topic_arn = %topic_arn,
            queue_url = %queue_url,
            "notification channel ready"
        );

        Ok(NotificationChannel {
            topic_arn,
            queue_url,
            queue_arn,
            subscription_arn,
        })
    }
}

/// Queue policy granting the topic permission to deliver messages, scoped
/// by source so only this channel's topic may publish.
fn delivery_policy(sid: &str, queue_arn: &str, topic_arn: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": sid,
            "Effect": "Allow",
            "Principal": "*",
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnEquals": {
                    "aws:SourceArn": topic_arn
                }
            }
        }]
    })
}
