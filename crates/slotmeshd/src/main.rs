//! slotmeshd — the slotmesh daemon.
//!
//! Currently ships the `simulate` command: a whole mesh in one process
//! on the in-process bus, with a coordinator answering the bootstrap
//! handshakes, a pool cluster receiving users, and a gateway relocating
//! them. Ends with the gateway's network status report on stdout.
//!
//! # Usage
//!
//! ```text
//! slotmeshd simulate --instances 3 --slots 8 --users 10 --mode matchmaking
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use slotmesh_membership::SelectionMode;
use slotmesh_node::{
    AlertSink, Bootstrap, ChannelNames, LogAlertSink, Node, NodeConfig, SharedConfig,
    bootstrap::{ConfigRequest, IdRequest, IdResponse},
};
use slotmesh_relocate::{UserDirectory, UserSender};
use slotmesh_transport::{LocalBus, Messenger};

#[derive(Parser)]
#[command(name = "slotmeshd", about = "slotmesh daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a multi-instance mesh on the in-process bus.
    Simulate {
        /// Instances in the pool cluster.
        #[arg(long, default_value = "3")]
        instances: u32,

        /// Slots per pool instance.
        #[arg(long, default_value = "8")]
        slots: u32,

        /// Users the gateway relocates into the pool.
        #[arg(long, default_value = "10")]
        users: u32,

        /// Selection mode: load-balancing, matchmaking, or random.
        #[arg(long, default_value = "load-balancing")]
        mode: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,slotmesh=debug".parse().expect("static filter")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            instances,
            slots,
            users,
            mode,
        } => simulate(instances, slots, users, &mode).await,
    }
}

fn parse_mode(mode: &str) -> anyhow::Result<SelectionMode> {
    match mode {
        "load-balancing" => Ok(SelectionMode::LoadBalancing),
        "matchmaking" => Ok(SelectionMode::Matchmaking),
        "random" => Ok(SelectionMode::Random),
        other => bail!("unknown selection mode {other:?}"),
    }
}

async fn simulate(instances: u32, slots: u32, users: u32, mode: &str) -> anyhow::Result<()> {
    let mode = parse_mode(mode)?;
    let bus = LocalBus::new();
    let channels = ChannelNames::default();
    let shared = SharedConfig {
        server_timeout_ms: 2_000,
        slot_poll_interval_ms: 25,
        heartbeat_ceiling_ms: 200,
        reservation_timeout_ms: 10_000,
        response_timeout_ms: 1_000,
    };

    spawn_coordinator(&bus, &channels, &shared).await?;

    // Pool instances bootstrap their ids from the coordinator, the
    // way a real deployment would.
    let alert: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let mut pool = Vec::new();
    for _ in 0..instances {
        let bootstrap = Bootstrap::new(
            Arc::new(bus.clone()),
            channels.clone(),
            Arc::clone(&alert),
        );
        let shared = bootstrap
            .load_shared_config()
            .await
            .context("loading shared config")?;
        let instance_id = bootstrap
            .request_instance_id("pool")
            .await
            .context("requesting instance id")?;
        let config = NodeConfig {
            cluster_id: "pool".to_string(),
            instance_id: Some(instance_id),
            ip: "127.0.0.1".to_string(),
            port: 25_565,
            total_slots: slots,
            strict_admission: false,
            consolidate: false,
            channels: channels.clone(),
        };
        let node = Node::start(
            &config,
            &shared,
            Arc::new(bus.clone()),
            Arc::new(NobodyHome),
            Arc::new(LoggingSender::default()),
        )
        .await?;
        pool.push(node);
    }

    let gateway_sender = Arc::new(LoggingSender::default());
    let gateway = Node::start(
        &NodeConfig {
            cluster_id: "lobby".to_string(),
            instance_id: Some("gateway-1".to_string()),
            ip: "127.0.0.1".to_string(),
            port: 25_566,
            total_slots: 1_000,
            strict_admission: false,
            consolidate: false,
            channels: channels.clone(),
        },
        &shared,
        Arc::new(bus.clone()),
        Arc::new(NobodyHome),
        Arc::clone(&gateway_sender) as Arc<dyn UserSender>,
    )
    .await?;

    // Let first heartbeats propagate before relocating anyone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        pool_size = gateway.cluster_size("pool"),
        "mesh assembled, relocating users"
    );

    let mut delivered = 0u32;
    for _ in 0..users {
        let ticket = gateway.send_users_to_cluster("pool", mode, HashSet::from([Uuid::new_v4()]));
        if ticket.outcome().await {
            delivered += 1;
        }
    }

    // Let the final heartbeats carry the reservations' effect.
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("delivered {delivered}/{users} users into the pool");
    for line in gateway.status_report() {
        println!("{line}");
    }
    for (destination, count) in gateway_sender.tally() {
        println!("  sent {count} to {destination}");
    }
    Ok(())
}

/// Answers config and id requests, allocating sequential ids.
async fn spawn_coordinator(
    bus: &LocalBus,
    channels: &ChannelNames,
    shared: &SharedConfig,
) -> anyhow::Result<()> {
    let mut config_rx = bus.subscribe(&channels.config_request).await?;
    let mut id_rx = bus.subscribe(&channels.id_request).await?;

    {
        let bus = bus.clone();
        let response_channel = channels.config_response.clone();
        let snapshot = serde_json::to_vec(shared).context("encoding shared config")?;
        tokio::spawn(async move {
            while let Some(payload) = config_rx.recv().await {
                if serde_json::from_slice::<ConfigRequest>(&payload).is_err() {
                    continue;
                }
                let _ = bus
                    .publish(&response_channel, Bytes::from(snapshot.clone()))
                    .await;
            }
        });
    }

    {
        let bus = bus.clone();
        let response_channel = channels.id_response.clone();
        let next = AtomicU32::new(1);
        tokio::spawn(async move {
            while let Some(payload) = id_rx.recv().await {
                let Ok(request) = serde_json::from_slice::<IdRequest>(&payload) else {
                    continue;
                };
                let serial = next.fetch_add(1, Ordering::SeqCst);
                let answer = IdResponse {
                    nonce: request.nonce,
                    instance_id: format!("{}-{serial}", request.cluster_id),
                };
                let Ok(encoded) = serde_json::to_vec(&answer) else {
                    continue;
                };
                let _ = bus.publish(&response_channel, Bytes::from(encoded)).await;
            }
        });
    }
    Ok(())
}

/// Simulation stand-in for a host's live-user list: nobody is ever
/// present, so user-targeted requests go unanswered.
struct NobodyHome;

impl UserDirectory for NobodyHome {
    fn is_user_present(&self, _user: &Uuid) -> bool {
        false
    }
    fn is_name_present(&self, _name: &str) -> bool {
        false
    }
    fn present_users(&self) -> HashSet<Uuid> {
        HashSet::new()
    }
}

/// Records where users were sent instead of moving anyone.
#[derive(Default)]
struct LoggingSender {
    sent: Mutex<Vec<(Uuid, String)>>,
}

impl LoggingSender {
    fn tally(&self) -> Vec<(String, usize)> {
        let sent = match self.sent.lock() {
            Ok(sent) => sent,
            Err(_) => return Vec::new(),
        };
        let mut counts: Vec<(String, usize)> = Vec::new();
        for (_, destination) in sent.iter() {
            match counts.iter_mut().find(|(d, _)| d == destination) {
                Some((_, n)) => *n += 1,
                None => counts.push((destination.clone(), 1)),
            }
        }
        counts.sort();
        counts
    }
}

impl UserSender for LoggingSender {
    fn send_user(&self, user: Uuid, destination_instance: &str) {
        info!(%user, destination_instance, "user sent");
        self.sent
            .lock()
            .map(|mut sent| sent.push((user, destination_instance.to_string())))
            .unwrap_or(());
    }
}
