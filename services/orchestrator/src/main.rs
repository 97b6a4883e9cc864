//! Flotilla orchestrator binary.
//!
//! Runs against the in-memory providers; real cloud bindings plug in
//! behind the same traits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_orchestrator::notifications::NotificationChannelSetup;
use flotilla_orchestrator::{
    Config, ConsumerConfig, LifecycleEventDispatcher, LoggingReconciler, MockFleetProvider,
    MockMessagingProvider, Orchestrator, ProvisioningReconciler, ProvisioningRequest,
    QueueConsumer, SystemIdentity,
};
use flotilla_topology::Topology;

#[derive(Parser)]
#[command(name = "orchestrator", about = "Flotilla fleet provisioning orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the fleet for a topology node, then watch its lifecycle
    /// queue until interrupted.
    Provision {
        /// System name, e.g. "checkout".
        #[arg(long)]
        system: String,

        /// Deployment target (topology name), e.g. "prod".
        #[arg(long)]
        target: String,

        /// Topology node to provision.
        #[arg(long)]
        node: String,

        /// Path to the serialized topology node list.
        #[arg(long)]
        topology_file: PathBuf,
    },

    /// Set up the notification channel for an existing scaling group.
    SetupNotifications {
        #[arg(long)]
        system: String,

        #[arg(long)]
        target: String,

        /// Scaling group name; derived from system/target when omitted.
        #[arg(long)]
        group: Option<String>,
    },

    /// Watch a lifecycle queue and log every event.
    Watch {
        #[arg(long)]
        queue_url: String,

        #[arg(long)]
        system: String,

        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let fleet = Arc::new(MockFleetProvider::new());
    let messaging = Arc::new(MockMessagingProvider::new());

    match cli.command {
        Command::Provision {
            system,
            target,
            node,
            topology_file,
        } => {
            let raw = std::fs::read_to_string(&topology_file)
                .with_context(|| format!("reading {}", topology_file.display()))?;
            let mut topology = Topology::from_json(&raw)?;

            let identity = SystemIdentity::new(system, target);
            let request = ProvisioningRequest {
                identity: identity.clone(),
                node_id: node,
            };

            let orchestrator = Arc::new(Orchestrator::new(
                Arc::clone(&fleet) as _,
                Arc::clone(&messaging) as _,
                config,
            ));

            let outcome = orchestrator.provision(&mut topology, &request).await?;
            info!(
                launch_template = %outcome.launch_template.name,
                group = %outcome.scaling_group.name,
                queue_url = %outcome.channel.queue_url,
                instance_id = %outcome.readiness.instance_id,
                "fleet provisioned"
            );

            // Keep consuming lifecycle events; launches re-run the
            // pipeline through the reconciler.
            let reconciler = Arc::new(ProvisioningReconciler::new(
                orchestrator,
                topology,
                request,
            ));
            let dispatcher = Arc::new(LifecycleEventDispatcher::new(
                reconciler,
                identity.system.clone(),
                identity.topology.clone(),
            ));
            let consumer = Arc::new(QueueConsumer::new(
                messaging,
                outcome.channel.queue_url.clone(),
                dispatcher,
                ConsumerConfig::default(),
            ));
            consumer.start();

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
            consumer.stop().await;
        }

        Command::SetupNotifications {
            system,
            target,
            group,
        } => {
            let identity = SystemIdentity::new(system, target);
            let group = group.unwrap_or_else(|| identity.group_name());

            let channel = NotificationChannelSetup::new(messaging, fleet)
                .setup(&identity.channel_name(), &group)
                .await?;
            info!(
                topic_arn = %channel.topic_arn,
                queue_url = %channel.queue_url,
                subscription_arn = %channel.subscription_arn,
                "notification channel ready"
            );
        }

        Command::Watch {
            queue_url,
            system,
            target,
        } => {
            let dispatcher = Arc::new(LifecycleEventDispatcher::new(
                Arc::new(LoggingReconciler),
                system,
                target,
            ));
            let consumer = Arc::new(QueueConsumer::new(
                messaging,
                queue_url,
                dispatcher,
                ConsumerConfig::default(),
            ));
            consumer.start();

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
            consumer.stop().await;
        }
    }

    Ok(())
}
