//! Queue message envelope parsing.
//!
//! A message delivered to the lifecycle queue carries the provider's
//! notification JSON. When the queue is fed through a pub/sub topic the body
//! is the delivery envelope instead, with the notification serialized into
//! its `Message` field as a JSON string.

use serde_json::Value;

use crate::error::EventError;
use crate::types::LifecycleEventKind;

/// A parsed fleet lifecycle notification.
#[derive(Debug, Clone)]
pub struct LifecycleNotification {
    /// The event kind discriminant.
    pub kind: LifecycleEventKind,

    /// The scaling group the event originated from, when present.
    pub group_name: Option<String>,

    /// The instance the event concerns, when present.
    pub instance_id: Option<String>,

    /// The full notification payload.
    pub payload: Value,
}

impl LifecycleNotification {
    /// Parse a raw queue message body.
    ///
    /// Unwraps one level of pub/sub envelope nesting (a JSON-string
    /// `Message` field), then routes on the `Event` discriminant. A body
    /// that is not JSON, lacks `Event`, or carries an unrecognized
    /// discriminant is an error; the caller decides whether the message is
    /// acknowledged.
    pub fn from_json(body: &str) -> Result<Self, EventError> {
        let outer: Value = serde_json::from_str(body)?;

        // Pub/sub delivery wraps the notification as a string field.
        let payload = match outer.get("Message") {
            Some(Value::String(inner)) => serde_json::from_str(inner)?,
            _ => outer,
        };

        let event = payload
            .get("Event")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::Malformed("missing Event field".to_string()))?;
        let kind = LifecycleEventKind::parse(event)?;

        let group_name = payload
            .get("AutoScalingGroupName")
            .and_then(Value::as_str)
            .map(str::to_string);
        let instance_id = payload
            .get("EC2InstanceId")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            kind,
            group_name,
            instance_id,
            payload,
        })
    }
}
