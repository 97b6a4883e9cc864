//! Configuration for the orchestrator.

use anyhow::Result;

/// Orchestrator configuration.
///
/// Per-node attributes on the topology take precedence; these are the
/// process-wide fallbacks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image used when a node does not pin one.
    pub default_image_id: Option<String>,

    /// Instance type used when a node does not pin one.
    pub default_instance_type: Option<String>,

    /// Subnet used when a node pins neither a subnet nor explicit zones.
    pub default_subnet_id: Option<String>,

    /// Key pair name used when a node does not pin one.
    pub default_key_name: Option<String>,

    /// Overrides the derived launch template name.
    pub default_launch_name: Option<String>,

    /// Overrides the derived scaling group name.
    pub default_group_name: Option<String>,

    /// Group floor when a node does not set MinSize.
    pub default_min_size: u32,

    /// Group ceiling when a node does not set MaxSize.
    pub default_max_size: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_image_id: None,
            default_instance_type: None,
            default_subnet_id: None,
            default_key_name: None,
            default_launch_name: None,
            default_group_name: None,
            default_min_size: 1,
            default_max_size: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let default_image_id = std::env::var("FLOTILLA_DEFAULT_IMAGE_ID").ok();
        let default_instance_type = std::env::var("FLOTILLA_DEFAULT_INSTANCE_TYPE").ok();
        let default_subnet_id = std::env::var("FLOTILLA_DEFAULT_SUBNET_ID").ok();
        let default_key_name = std::env::var("FLOTILLA_DEFAULT_KEY_NAME").ok();
        let default_launch_name = std::env::var("FLOTILLA_LAUNCH_NAME").ok();
        let default_group_name = std::env::var("FLOTILLA_GROUP_NAME").ok();

        let default_min_size = std::env::var("FLOTILLA_MIN_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let default_max_size = std::env::var("FLOTILLA_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let log_level = std::env::var("FLOTILLA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            default_image_id,
            default_instance_type,
            default_subnet_id,
            default_key_name,
            default_launch_name,
            default_group_name,
            default_min_size,
            default_max_size,
            log_level,
        })
    }
}
