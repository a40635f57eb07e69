//! The main CianaParrot daemon: wires the channel, router, bridge session
//! manager, and scheduler together.
//!
//! The chat transport and the LLM agent are out-of-scope external
//! collaborators (§1, §6); this binary runs with the crate's own
//! [`ciana_parrot::NullAgent`] and [`ciana_parrot::RecordingChannel`] test
//! doubles until a real channel/agent integration is wired in by an
//! embedding application. [`RecordingChannel::deliver`] is how such an
//! embedding (or a test) feeds an inbound message into the running
//! dispatcher; the wire transport itself stays out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use ciana_parrot::bridge::{BridgeCliConfig, BridgeSessionManager};
use ciana_parrot::channel::{BoxFuture, Channel, ChannelRegistry, RecordingChannel};
use ciana_parrot::config::RouterSettings;
use ciana_parrot::dispatch::Dispatcher;
use ciana_parrot::router::{ChannelAuthorization, IncomingMessage, MessageRouter, RouterConfig};
use ciana_parrot::task_store::TaskStore;
use ciana_parrot::turn_log::TurnLog;
use ciana_parrot::user_state::{SessionCounterStore, UserStateStore};
use ciana_parrot::{AppConfig, NullAgent};

/// CianaParrot: personal-assistant runtime daemon.
#[derive(Debug, Parser)]
#[command(name = "ciana-parrot", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "ciana-parrot.toml")]
    config: std::path::PathBuf,
}

fn router_config_from(settings: &RouterSettings) -> RouterConfig {
    let authorization = settings
        .allowed_user_ids
        .iter()
        .map(|(channel, ids)| {
            (
                channel.clone(),
                ChannelAuthorization {
                    allowed_user_ids: ids.iter().cloned().collect(),
                },
            )
        })
        .collect::<HashMap<_, _>>();
    RouterConfig {
        authorization,
        trigger_prefix: settings.trigger_prefix.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ciana_parrot::observability::init_tracing("ciana_parrot=info");

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config).map_err(|err| {
        tracing::error!(error = %err, "failed to load configuration");
        err
    })?;

    let task_store = Arc::new(TaskStore::new(config.storage.tasks_path.clone()));
    let counters = Arc::new(SessionCounterStore::new(config.storage.counters_path.clone()));
    let turn_log = Arc::new(TurnLog::new(config.storage.turn_log_dir.clone()));

    let mut registry = ChannelRegistry::new();
    let demo_channel = Arc::new(RecordingChannel::default());
    registry.register("telegram", Arc::clone(&demo_channel) as Arc<dyn Channel>);
    let registry = Arc::new(registry);

    let message_router = Arc::new(MessageRouter::new(
        router_config_from(&config.router),
        Arc::clone(&counters),
        turn_log,
        Arc::new(NullAgent),
    ));

    let bridge_manager = config.bridge.as_ref().map(|settings| {
        Arc::new(BridgeSessionManager::new(
            BridgeCliConfig {
                binary: settings.cli_binary.clone(),
                permission_mode: settings.permission_mode.clone(),
                timeout_secs: settings.timeout_secs,
                gateway_bridge_name: settings.gateway_bridge_name.clone(),
            },
            Arc::new(UserStateStore::new(config.storage.user_state_path.clone())),
            None,
        ))
    });

    let dispatcher = Arc::new(Dispatcher::new(message_router, bridge_manager, Arc::clone(&registry)));
    demo_channel
        .start(Arc::new(move |msg: IncomingMessage| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                if let Err(err) = dispatcher.handle(msg).await {
                    tracing::warn!(error = %err, "failed to dispatch incoming message");
                }
            }) as BoxFuture
        }))
        .await?;

    let scheduler = if config.scheduler.enabled {
        Some(ciana_parrot::scheduler::Scheduler::new(
            task_store,
            Arc::new(NullAgent),
            Arc::clone(&registry),
            ciana_parrot::time_provider::production_time_provider(),
            config.poll_interval(),
        ))
    } else {
        None
    };

    if let Some(scheduler) = scheduler {
        tracing::info!("scheduler starting");
        scheduler.run().await?;
    } else {
        tracing::info!("scheduler disabled; idling");
        std::future::pending::<()>().await;
    }

    Ok(())
}
