//! flockd — a UDP-multicast host around the flock EVS engine.
//!
//! One process is one group member. Frames go out over a multicast group
//! every member subscribes to; three tokio intervals drive the engine's
//! timers; deliveries and view changes are logged. Peers are discovered
//! through the protocol itself, so pointing several instances at the same
//! multicast group is all the setup there is.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use log::{info, warn};
use tokio::net::UdpSocket;
use tokio::time::interval;

use flock_core::{FlockError, NodeId, Proto, Safety, State, Transport, UpMeta, UpperLayer};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "flockd", about = "EVS group membership daemon")]
struct Args {
    /// Config file path (default /etc/flock/flockd.toml or $FLOCKD_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Human-readable node name (max 16 bytes).
    #[arg(long)]
    name: Option<String>,

    /// Multicast group address, e.g. 239.255.7.1:14700.
    #[arg(long)]
    group: Option<String>,

    /// Send a heartbeat payload this often; 0 disables.
    #[arg(long, default_value_t = 0)]
    heartbeat_ms: u64,
}

/// Outbound side: best-effort multicast over one shared socket.
struct UdpTransport {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    id: NodeId,
}

impl Transport for UdpTransport {
    fn send(&mut self, frame: Bytes) -> Result<(), FlockError> {
        match self.socket.try_send_to(&frame, self.group) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(FlockError::WouldBlock),
            Err(e) => {
                // Transient socket errors look like backpressure to the
                // engine; the resend timer retries.
                warn!("multicast send failed: {e}");
                Err(FlockError::WouldBlock)
            }
        }
    }

    fn local_id(&self) -> NodeId {
        self.id
    }
}

/// Upper layer: log what the group delivers.
struct LogSink;

impl UpperLayer for LogSink {
    fn handle_up(&mut self, payload: Option<&Bytes>, meta: &UpMeta) {
        match (&meta.view, payload) {
            (Some(view), _) => info!("view change: {view}"),
            (None, Some(p)) => info!(
                "delivered {} bytes from {} ({})",
                p.len(),
                meta.source,
                String::from_utf8_lossy(p)
            ),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_ref());
    if let Some(name) = args.name {
        cfg.node.name = name;
    }
    if let Some(group) = args.group {
        cfg.net.group = group;
    }

    let group: SocketAddr = cfg.net.group.parse().context("bad multicast group")?;
    let bind: SocketAddr = cfg.net.bind.parse().context("bad bind address")?;
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    match (group, bind) {
        (SocketAddr::V4(g), SocketAddr::V4(b)) => {
            socket
                .join_multicast_v4(*g.ip(), *b.ip())
                .context("joining multicast group")?;
            socket.set_multicast_loop_v4(false).ok();
        }
        _ => anyhow::bail!("only IPv4 multicast groups are supported"),
    }
    let socket = Arc::new(socket);

    let id = NodeId::random();
    info!("node {id} ({}) on group {group}", cfg.node.name);

    let transport = UdpTransport {
        socket: socket.clone(),
        group,
        id,
    };
    let proto_cfg = cfg.proto.clone();
    let mut proto =
        Proto::new(proto_cfg.clone(), transport, LogSink, &cfg.node.name).map_err(|e| {
            anyhow::anyhow!("engine init: {e}")
        })?;
    proto
        .connect()
        .map_err(|e| anyhow::anyhow!("connect: {e}"))?;

    let mut consensus = interval(Duration::from_millis(proto_cfg.consensus_period_ms.max(1)));
    let mut install = interval(Duration::from_millis(proto_cfg.install_period_ms.max(1)));
    let mut resend = interval(Duration::from_millis(proto_cfg.resend_period_ms.max(1)));
    let mut heartbeat = interval(Duration::from_millis(args.heartbeat_ms.max(1)));
    let heartbeat_on = args.heartbeat_ms > 0;
    let mut heartbeat_count: u64 = 0;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            r = socket.recv_from(&mut buf) => {
                let (n, _from) = r.context("socket receive")?;
                proto.handle_msg(&buf[..n]);
            }
            _ = consensus.tick() => proto.handle_consensus_timer(),
            _ = install.tick() => proto.handle_install_timer(),
            _ = resend.tick() => proto.handle_resend_timer(),
            _ = heartbeat.tick(), if heartbeat_on => {
                if proto.state() == State::Operational {
                    heartbeat_count += 1;
                    let payload = Bytes::from(format!("{} #{heartbeat_count}", cfg.node.name));
                    if let Err(e) = proto.send(payload, 0, Safety::Safe, false) {
                        warn!("heartbeat not sent: {e}");
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("shutting down");
                proto.disconnect();
                break;
            }
        }
    }
    Ok(())
}
