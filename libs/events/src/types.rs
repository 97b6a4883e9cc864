//! Lifecycle event kind definitions.
//!
//! The fleet provider publishes one notification per instance lifecycle
//! transition. The wire discriminants are fixed strings; this module maps
//! them onto a closed enum so adding a kind forces every router to handle it.

use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// All wire discriminants as constants.
pub mod event_types {
    pub const INSTANCE_LAUNCH: &str = "autoscaling:EC2_INSTANCE_LAUNCH";
    pub const INSTANCE_LAUNCH_ERROR: &str = "autoscaling:EC2_INSTANCE_LAUNCH_ERROR";
    pub const INSTANCE_TERMINATE: &str = "autoscaling:EC2_INSTANCE_TERMINATE";
    pub const INSTANCE_TERMINATE_ERROR: &str = "autoscaling:EC2_INSTANCE_TERMINATE_ERROR";
    pub const TEST_NOTIFICATION: &str = "autoscaling:TEST_NOTIFICATION";
}

/// Recognized fleet lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LifecycleEventKind {
    /// An instance joined the group.
    InstanceLaunch,

    /// The provider failed to launch an instance.
    InstanceLaunchError,

    /// An instance left the group.
    InstanceTerminate,

    /// The provider failed to terminate an instance.
    InstanceTerminateError,

    /// Channel-verification ping sent when a notification sink is registered.
    TestNotification,
}

impl LifecycleEventKind {
    /// The four kinds a scaling group is told to forward when its
    /// notification sink is registered. The test ping is delivered by the
    /// provider unconditionally and is not part of the registration.
    pub const REGISTERED: [LifecycleEventKind; 4] = [
        LifecycleEventKind::InstanceLaunch,
        LifecycleEventKind::InstanceLaunchError,
        LifecycleEventKind::InstanceTerminate,
        LifecycleEventKind::InstanceTerminateError,
    ];

    /// Parse a wire discriminant.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            event_types::INSTANCE_LAUNCH => Ok(Self::InstanceLaunch),
            event_types::INSTANCE_LAUNCH_ERROR => Ok(Self::InstanceLaunchError),
            event_types::INSTANCE_TERMINATE => Ok(Self::InstanceTerminate),
            event_types::INSTANCE_TERMINATE_ERROR => Ok(Self::InstanceTerminateError),
            event_types::TEST_NOTIFICATION => Ok(Self::TestNotification),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }

    /// The wire discriminant for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceLaunch => event_types::INSTANCE_LAUNCH,
            Self::InstanceLaunchError => event_types::INSTANCE_LAUNCH_ERROR,
            Self::InstanceTerminate => event_types::INSTANCE_TERMINATE,
            Self::InstanceTerminateError => event_types::INSTANCE_TERMINATE_ERROR,
            Self::TestNotification => event_types::TEST_NOTIFICATION,
        }
    }
}

impl std::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for LifecycleEventKind {
    type Error = EventError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<LifecycleEventKind> for String {
    fn from(kind: LifecycleEventKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_kinds() {
        for kind in [
            LifecycleEventKind::InstanceLaunch,
            LifecycleEventKind::InstanceLaunchError,
            LifecycleEventKind::InstanceTerminate,
            LifecycleEventKind::InstanceTerminateError,
            LifecycleEventKind::TestNotification,
        ] {
            assert_eq!(LifecycleEventKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_discriminant_is_an_error() {
        let err = LifecycleEventKind::parse("autoscaling:EC2_INSTANCE_REBOOT").unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(_)));
    }

    #[test]
    fn test_registered_excludes_test_ping() {
        assert!(!LifecycleEventKind::REGISTERED.contains(&LifecycleEventKind::TestNotification));
    }
}
