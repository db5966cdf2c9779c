//! Process entry point: parses CLI flags, wires the production
//! collaborators to a [`MigrationSupervisor`], and runs the control-channel
//! listener, the admin listener, and the per-tick driver loop side by side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use parking_lot::Mutex;
use slotstore_core::clock::{ClockSource, SystemClock};
use slotstore_core::NodeId;
use slotstore_server::cluster::collab::{
    ClusterMap, Collaborators, KeySpace, PauseFacility, ReplicationFeeder, Session,
    SnapshotProducer,
};
use slotstore_server::cluster::net_session::TcpSession;
use slotstore_server::cluster::types::{ImportJob, JobMeta};
use slotstore_server::cluster::wire::{RespReply, SyncSlotsCodec, SyncSlotsFrame};
use slotstore_server::{
    AdminCommand, AdminDispatcher, AdminError, AdminReply, ChannelReplicationFeeder,
    ImmediateSnapshotProducer, InProcessClusterMap, MarkerKeySpace, MigrationConfig,
    MigrationSupervisor, SharedPauseFacility,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "slotstore-server", version, about = "Slot migration control plane")]
struct Args {
    /// This node's 40-hex-character cluster identity.
    #[arg(long, env = "SLOTSTORE_NODE_ID")]
    node_id: NodeId,

    /// Address the `CLUSTER SYNCSLOTS` control channel listens on.
    #[arg(long, env = "SLOTSTORE_BIND", default_value = "0.0.0.0:7600")]
    bind: SocketAddr,

    /// Address the operator-facing admin surface (`MIGRATESLOTS` et al.)
    /// listens on.
    #[arg(long, env = "SLOTSTORE_ADMIN_BIND", default_value = "127.0.0.1:7601")]
    admin_bind: SocketAddr,

    /// How often the migration supervisor's tick loop runs, in milliseconds.
    #[arg(long, env = "SLOTSTORE_TICK_MS")]
    tick_ms: Option<u64>,

    /// Address to expose Prometheus metrics on. Omit to disable the
    /// exporter entirely.
    #[arg(long, env = "SLOTSTORE_METRICS_BIND")]
    metrics_bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("slotstore_server=info")),
        )
        .init();

    let args = Args::parse();

    if let Some(metrics_bind) = args.metrics_bind {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_bind)
            .install()
            .context("installing Prometheus metrics exporter")?;
        info!(bind = %metrics_bind, "Prometheus metrics exporter installed");
    }

    let mut cfg = MigrationConfig::default();
    if let Some(tick_ms) = args.tick_ms {
        cfg.tick_interval_ms = tick_ms;
    }
    let tick_interval_ms = cfg.tick_interval_ms;

    let cluster_map = Arc::new(InProcessClusterMap::new(args.node_id));
    let collab = Collaborators {
        cluster_map: cluster_map.clone() as Arc<dyn ClusterMap>,
        key_space: Arc::new(MarkerKeySpace::new()) as Arc<dyn KeySpace>,
        snapshot_producer: Arc::new(ImmediateSnapshotProducer::new()) as Arc<dyn SnapshotProducer>,
        replication_feeder: Arc::new(ChannelReplicationFeeder::new()) as Arc<dyn ReplicationFeeder>,
        pause_facility: Arc::new(SharedPauseFacility::new()) as Arc<dyn PauseFacility>,
    };
    let supervisor = Arc::new(Mutex::new(MigrationSupervisor::new(cfg, collab)));

    let tick_handle = tokio::spawn(tick_loop(supervisor.clone(), tick_interval_ms));
    let control_handle = tokio::spawn(control_listener(args.bind, supervisor.clone()));
    let admin_handle = tokio::spawn(admin_listener(args.admin_bind, supervisor, cluster_map));

    tokio::select! {
        res = tick_handle => res.context("tick loop task panicked")?,
        res = control_handle => res.context("control listener task panicked")??,
        res = admin_handle => res.context("admin listener task panicked")??,
    }

    Ok(())
}

async fn tick_loop(supervisor: Arc<Mutex<MigrationSupervisor>>, tick_interval_ms: u64) {
    let clock = SystemClock;
    let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
    loop {
        interval.tick().await;
        supervisor.lock().tick(clock.now_ms());
    }
}

/// Accepts inbound migration connections. `ESTABLISH` is parsed directly
/// off the socket with the same [`SyncSlotsCodec`] the synchronous driver
/// uses (§4.6); once it is acknowledged, the socket -- and any bytes the
/// peer already sent past that frame -- are handed to a freshly built
/// `ImportJob`, which the tick loop drives from then on like any other job.
async fn control_listener(
    bind: SocketAddr,
    supervisor: Arc<Mutex<MigrationSupervisor>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding control channel listener on {bind}"))?;
    info!(%bind, "control channel listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(err) = accept_establish(stream, &supervisor).await {
                warn!(%peer_addr, %err, "inbound migration connection dropped during handshake");
            }
        });
    }
}

async fn accept_establish(
    mut stream: TcpStream,
    supervisor: &Arc<Mutex<MigrationSupervisor>>,
) -> anyhow::Result<()> {
    let mut codec = SyncSlotsCodec;
    let mut buf = BytesMut::with_capacity(4096);

    let frame = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(frame) = codec
                .decode(&mut buf)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
            {
                return Ok::<SyncSlotsFrame, anyhow::Error>(frame);
            }
            let mut scratch = [0u8; 4096];
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                anyhow::bail!("connection closed before ESTABLISH");
            }
            buf.extend_from_slice(&scratch[..n]);
        }
    })
    .await
    .context("timed out waiting for ESTABLISH")??;

    let SyncSlotsFrame::Establish { source, name, ranges } = frame else {
        anyhow::bail!("expected ESTABLISH, got {frame:?}");
    };

    if let Err(err) = supervisor.lock().check_import_preconditions(&ranges) {
        let mut reply_buf = BytesMut::new();
        codec
            .encode(SyncSlotsFrame::Reply(RespReply::Err(err.to_string())), &mut reply_buf)
            .context("encoding ESTABLISH error reply")?;
        stream
            .write_all(&reply_buf)
            .await
            .context("writing ESTABLISH error reply")?;
        warn!(job = %name, source = %source, %err, "rejected inbound ESTABLISH");
        return Ok(());
    }

    let mut reply_buf = BytesMut::new();
    codec
        .encode(SyncSlotsFrame::Reply(RespReply::Ok), &mut reply_buf)
        .context("encoding ESTABLISH reply")?;
    stream.write_all(&reply_buf).await.context("writing ESTABLISH reply")?;

    let now = SystemClock.now_ms();
    let meta = JobMeta::new(name, source, ranges, now);
    let session: Box<dyn Session> = Box::new(TcpSession::from_accepted(stream));
    let job = ImportJob::new_with_buffered(meta, session, buf);

    info!(job = %name, source = %source, "import job registered from inbound ESTABLISH");
    supervisor.lock().add_import(job);
    Ok(())
}

/// Runs the operator-facing admin surface over a plain line-oriented TCP
/// protocol: one `MIGRATESLOTS`/`CANCELSLOTMIGRATIONS`/`GETSLOTMIGRATIONS`
/// command per line, one `+`/`-`-prefixed reply line back (the general
/// client-facing RESP encoding of this text is an external wire layer's
/// job, per §1).
async fn admin_listener(
    bind: SocketAddr,
    supervisor: Arc<Mutex<MigrationSupervisor>>,
    cluster_map: Arc<InProcessClusterMap>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding admin listener on {bind}"))?;
    info!(%bind, "admin surface listening");

    let cluster_map_dyn: Arc<dyn ClusterMap> = cluster_map.clone();
    let dispatcher = Arc::new(AdminDispatcher::new(
        supervisor,
        cluster_map_dyn,
        Arc::new(|| SystemClock.now_ms()),
        Arc::new(move |target: NodeId| -> Result<Box<dyn Session>, AdminError> {
            let addr = cluster_map
                .lookup_node(target)
                .ok_or_else(|| AdminError::UnknownNode(target.to_string()))?;
            let socket: SocketAddr = format!("{}:{}", addr.host, addr.port)
                .parse()
                .map_err(|_| AdminError::UnknownNode(target.to_string()))?;
            Ok(Box::new(TcpSession::connect(socket)))
        }),
    ));

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_admin_connection(stream, dispatcher).await {
                warn!(%peer_addr, %err, "admin connection closed with error");
            }
        });
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    dispatcher: Arc<AdminDispatcher>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let reply = match AdminCommand::parse(&tokens) {
            Ok(cmd) => dispatcher.handle(cmd),
            Err(err) => AdminReply::Err(err.to_string()),
        };
        let text = match reply {
            AdminReply::Ok(msg) => format!("+{msg}\n"),
            AdminReply::Err(msg) => format!("-{msg}\n"),
        };
        if let Err(err) = write_half.write_all(text.as_bytes()).await {
            error!(%err, "failed writing admin reply");
            break;
        }
    }
    Ok(())
}
