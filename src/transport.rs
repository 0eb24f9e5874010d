//! The transport endpoint: where the source state, the peer table, the
//! timer engine and the packet dispatch come together.
//!
//! Lifecycle: [`Transport::bind`] validates the configuration, spawns the
//! timer and RDATA service tasks (waiting for the timer to come up before
//! returning), announces a sending transport with three SPMs and registers
//! the endpoint in the process-wide registry. [`Transport::shutdown`] flips
//! the shutdown flag, lets the timer drain a final SPM and joins the tasks.

use crate::config::TransportConfig;
use crate::error::{PgmError, PgmResult};
use crate::packet_header::{self, PacketType, PgmHeader, PGM_HEADER_LEN};
use crate::peer::Peer;
use crate::rate::TokenBucket;
use crate::receiver;
use crate::send_pipeline::{PgmSocket, SendPipeline};
use crate::source::Source;
use crate::stats::{ReceiverStats, SourceStats};
use crate::timer::TimerShared;
use crate::tsi::{Gsi, Tsi};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, Instrument, Level};
use uuid::Uuid;

pub(crate) struct TransportCtx {
    pub config: Arc<TransportConfig>,
    pub tsi: Tsi,
    pub dport: u16,
    /// the multicast group this session sends to and receives from
    pub group_addr: SocketAddr,
    /// our unicast NLA on the sending interface
    pub path_nla: IpAddr,
    pub pipeline: Arc<SendPipeline>,
    pub source: Option<Arc<Source>>,
    pub peers: RwLock<FxHashMap<Tsi, Arc<Peer>>>,
    pub timer: Arc<TimerShared>,
    /// receive windows with contiguous committed data, drained by `recv`
    pub peers_waiting: StdMutex<Vec<Arc<Peer>>>,
    pub waiting_notify: Notify,
    /// datagrams dropped before any peer or source state could own the
    /// count: traffic for other sessions, peer traffic about unknown
    /// sources, unroutable upstream packets
    pub packets_discarded: AtomicU64,
    pub shutdown: watch::Sender<bool>,
}

impl TransportCtx {
    pub fn count_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// O(1) reader wake-up: remember the window and poke the notify
    pub fn enqueue_waiting(&self, peer: &Arc<Peer>) {
        let mut waiting = self.peers_waiting.lock().expect("waiting lock poisoned");
        if !waiting.iter().any(|p| Arc::ptr_eq(p, peer)) {
            waiting.push(peer.clone());
        }
        drop(waiting);
        self.waiting_notify.notify_one();
    }
}

pub struct Transport {
    ctx: Arc<TransportCtx>,
    recv_socket: Arc<dyn PgmSocket>,
    rx_buffer: Mutex<Vec<u8>>,
    timer_task: Option<JoinHandle<()>>,
    rdata_task: Option<JoinHandle<()>>,
    /// drives NAK/SPMR reception for a send-only transport, where no caller
    /// ever enters `recv`
    pump_task: Option<JoinHandle<()>>,
}

impl Transport {
    /// bind a transport over caller-provided sockets: one to receive on,
    /// one plain send lane and one router-alert send lane. Multicast group
    /// membership and socket options belong to the caller.
    pub async fn bind(
        config: TransportConfig,
        gsi: Gsi,
        sport: u16,
        dport: u16,
        group_addr: SocketAddr,
        path_nla: IpAddr,
        recv_socket: Arc<dyn PgmSocket>,
        send_socket: Arc<dyn PgmSocket>,
        send_with_router_alert_socket: Arc<dyn PgmSocket>,
    ) -> anyhow::Result<Transport> {
        config.validate()?;
        let config = Arc::new(config);
        let tsi = Tsi::new(gsi, sport);
        info!("binding transport, tsi {}", tsi);

        let rate = if config.txw_max_rte > 0 {
            Some(Arc::new(TokenBucket::new(config.txw_max_rte, crate::config::IPHDR_LEN))
                as Arc<dyn crate::rate::RateLimiter>)
        } else {
            None
        };
        let pipeline = Arc::new(SendPipeline::new(send_socket, send_with_router_alert_socket, rate));

        let timer = Arc::new(TimerShared::new(Instant::now(), config.spm_ambient_interval));

        let source = if config.can_send {
            Some(Arc::new(Source::new(
                config.clone(),
                tsi,
                dport,
                group_addr,
                path_nla,
                pipeline.clone(),
                timer.clone(),
            )))
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(TransportCtx {
            config,
            tsi,
            dport,
            group_addr,
            path_nla,
            pipeline,
            source,
            peers: RwLock::new(FxHashMap::default()),
            timer,
            peers_waiting: StdMutex::new(Vec::new()),
            waiting_notify: Notify::new(),
            packets_discarded: AtomicU64::new(0),
            shutdown,
        });

        // spawn the timer task and wait until it is up before the transport
        // is usable
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let timer_ctx = ctx.clone();
        let timer_task = tokio::spawn(async move {
            let _ = ready_tx.send(());
            crate::timer::run(timer_ctx).await;
        });
        ready_rx.await.map_err(|_| anyhow::anyhow!("timer task failed to start"))?;

        let rdata_task = ctx.source.as_ref().map(|source| {
            tokio::spawn(crate::source::run_rdata_service(
                source.clone(),
                ctx.shutdown.subscribe(),
            ))
        });

        // announce the new session
        if let Some(source) = &ctx.source {
            for _ in 0..3 {
                source.send_spm().await;
            }
        }

        let pump_task = if ctx.config.can_send && !ctx.config.can_recv {
            let pump_ctx = ctx.clone();
            let pump_socket = recv_socket.clone();
            let mut pump_shutdown = ctx.shutdown.subscribe();
            Some(tokio::spawn(async move {
                let mut buf = vec![0u8; pump_ctx.config.max_tpdu as usize];
                loop {
                    tokio::select! {
                        received = pump_socket.recv_from(&mut buf) => {
                            let Ok((len, src, dst)) = received else { return };
                            dispatch(&pump_ctx, &buf[..len], src, dst).await;
                        }
                        _ = pump_shutdown.changed() => return,
                    }
                }
            }))
        } else {
            None
        };

        registry().write().expect("registry lock poisoned").push((tsi, Arc::downgrade(&ctx)));
        debug!("transport bound");

        Ok(Transport {
            recv_socket,
            rx_buffer: Mutex::new(vec![0u8; ctx.config.max_tpdu as usize]),
            ctx,
            timer_task: Some(timer_task),
            rdata_task,
            pump_task,
        })
    }

    /// convenience binding over plain UDP encapsulation: `listen` receives,
    /// two ephemeral sockets send. The caller still owns multicast joins.
    pub async fn bind_udp(
        config: TransportConfig,
        gsi: Gsi,
        sport: u16,
        dport: u16,
        group_addr: SocketAddr,
        listen: SocketAddr,
    ) -> anyhow::Result<Transport> {
        let recv_socket = Arc::new(UdpSocket::bind(listen).await?);
        let send_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let alert_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let path_nla = send_socket.local_addr()?.ip();
        Transport::bind(
            config,
            gsi,
            sport,
            dport,
            group_addr,
            path_nla,
            recv_socket,
            send_socket,
            alert_socket,
        )
        .await
    }

    pub fn tsi(&self) -> Tsi {
        self.ctx.tsi
    }

    /// send one APDU, fragmenting as necessary; blocks on the rate limiter
    pub async fn send(&self, apdu: &[u8]) -> PgmResult<usize> {
        match &self.ctx.source {
            Some(source) => source.send_apdu(apdu, false).await,
            None => Err(PgmError::InvalidArgument("transport is receive-only".into())),
        }
    }

    /// like [`Transport::send`] but surfaces `RateLimited`/`WouldBlock`
    /// instead of waiting
    pub async fn send_nonblocking(&self, apdu: &[u8]) -> PgmResult<usize> {
        match &self.ctx.source {
            Some(source) => source.send_apdu(apdu, true).await,
            None => Err(PgmError::InvalidArgument("transport is receive-only".into())),
        }
    }

    /// receive contiguous application data: drains committed bytes from all
    /// waiting receive windows, reading and dispatching datagrams until
    /// something is deliverable. Timer-induced loss (a sealed hole freeing
    /// the data behind it) wakes this too.
    pub async fn recv(&self) -> PgmResult<Vec<Bytes>> {
        if !self.ctx.config.can_recv {
            return Err(PgmError::InvalidArgument("transport is send-only".into()));
        }

        let mut buf = self.rx_buffer.lock().await;
        loop {
            let flushed = self.flush_waiting().await;
            if !flushed.is_empty() {
                return Ok(flushed);
            }

            tokio::select! {
                _ = self.ctx.waiting_notify.notified() => {}
                received = self.recv_socket.recv_from(&mut buf) => {
                    let (len, src, dst) = received?;
                    dispatch(&self.ctx, &buf[..len], src, dst).await;
                }
            }
        }
    }

    async fn flush_waiting(&self) -> Vec<Bytes> {
        let waiting = {
            let mut waiting = self.ctx.peers_waiting.lock().expect("waiting lock poisoned");
            std::mem::take(&mut *waiting)
        };

        let mut out = Vec::new();
        for peer in waiting {
            let mut inner = peer.inner.lock().await;
            let (data, apdus_lost) = inner.rxw.read();
            inner.stats.apdus_lost += apdus_lost;
            inner.stats.msgs_received += data.len() as u64;
            out.extend(data);
        }
        out
    }

    pub async fn source_stats(&self) -> Option<SourceStats> {
        match &self.ctx.source {
            Some(source) => Some(source.stats().await),
            None => None,
        }
    }

    pub async fn peer_stats(&self, tsi: Tsi) -> Option<ReceiverStats> {
        let peers = self.ctx.peers.read().await;
        let peer = peers.get(&tsi)?.clone();
        drop(peers);
        let inner = peer.inner.lock().await;
        Some(inner.stats.clone())
    }

    pub async fn peer_count(&self) -> usize {
        self.ctx.peers.read().await.len()
    }

    /// datagrams dropped by the dispatcher with no peer or source to charge
    /// them to
    pub fn packets_discarded(&self) -> u64 {
        self.ctx.packets_discarded.load(Ordering::Relaxed)
    }

    /// wait until committed data is likely available; readiness companion
    /// to [`Transport::recv`] for external event loops
    pub async fn readable(&self) {
        self.ctx.waiting_notify.notified().await;
    }

    /// stop the timer (draining a final SPM for a sending transport), join
    /// the service tasks and deregister
    pub async fn shutdown(mut self) {
        let _ = self.ctx.shutdown.send(true);
        if let Some(task) = self.timer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.rdata_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.pump_task.take() {
            let _ = task.await;
        }
        deregister(self.ctx.tsi);
        info!("transport destroyed, tsi {}", self.ctx.tsi);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
        if let Some(task) = self.rdata_task.take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        deregister(self.ctx.tsi);
    }
}

/// process-wide registry of bound transports, for admin and monitoring
fn registry() -> &'static StdRwLock<Vec<(Tsi, Weak<TransportCtx>)>> {
    static REGISTRY: OnceLock<StdRwLock<Vec<(Tsi, Weak<TransportCtx>)>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdRwLock::new(Vec::new()))
}

fn deregister(tsi: Tsi) {
    let mut registry = registry().write().expect("registry lock poisoned");
    registry.retain(|(t, ctx)| *t != tsi && ctx.strong_count() > 0);
}

/// TSIs of all live transports in this process
pub fn registered_transports() -> Vec<Tsi> {
    let registry = registry().read().expect("registry lock poisoned");
    registry
        .iter()
        .filter(|(_, ctx)| ctx.strong_count() > 0)
        .map(|(tsi, _)| *tsi)
        .collect()
}

/// validate an incoming datagram and route it by packet type and direction
pub(crate) async fn dispatch(ctx: &Arc<TransportCtx>, tpdu: &[u8], src: SocketAddr, dst: SocketAddr) {
    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "packet_received", ?correlation_id);
    dispatch_routed(ctx, tpdu, src, dst).instrument(span).await
}

async fn dispatch_routed(ctx: &Arc<TransportCtx>, tpdu: &[u8], src: SocketAddr, dst: SocketAddr) {
    if tpdu.len() < PGM_HEADER_LEN {
        trace!("runt datagram from {:?} - dropping", src);
        return;
    }
    let header = match PgmHeader::deser(&mut &tpdu[..]) {
        Ok(header) => header,
        Err(_) => {
            debug!("unparsable pgm header from {:?} - dropping", src);
            return;
        }
    };
    if packet_header::verify_checksum(tpdu, header.typ).is_err() {
        debug!("checksum failure on {:?} from {:?} - dropping", header.typ, src);
        return;
    }

    let body = &tpdu[PGM_HEADER_LEN..];
    let tsi = Tsi::new(header.gsi, header.sport);

    if header.typ.is_upstream() || header.typ.is_peer() {
        // receiver-to-source or receiver-to-receiver; for another session
        // when the wire sport is not our data-destination port
        if header.sport != ctx.dport {
            trace!("upstream traffic for another session - dropping");
            ctx.count_discarded();
            return;
        }

        if header.typ.is_peer() && dst.ip().is_multicast() {
            if header.dport == ctx.tsi.sport {
                // we are the source this is aimed at
                let Some(source) = &ctx.source else {
                    ctx.count_discarded();
                    return;
                };
                match header.typ {
                    PacketType::Spmr => source.on_spmr().await,
                    // the source ignores multicast NAKs
                    _ => {}
                }
            } else {
                // peer-to-peer traffic about some source we may also follow
                if !ctx.config.can_recv {
                    return;
                }
                let source_tsi = Tsi::new(header.gsi, header.dport);
                let peer = {
                    let peers = ctx.peers.read().await;
                    peers.get(&source_tsi).cloned()
                };
                let Some(peer) = peer else {
                    trace!("peer traffic about unknown source {} - dropping", source_tsi);
                    ctx.count_discarded();
                    return;
                };
                match header.typ {
                    PacketType::Nak => receiver::on_peer_nak(ctx, &peer, &header, body).await,
                    PacketType::Spmr => {
                        // a sibling asked already; squelch our own request
                        let mut inner = peer.inner.lock().await;
                        inner.spmr_expiry = None;
                    }
                    _ => {}
                }
            }
        } else if header.typ.is_upstream()
            && !dst.ip().is_multicast()
            && header.dport == ctx.tsi.sport
        {
            let Some(source) = &ctx.source else {
                ctx.count_discarded();
                return;
            };
            match header.typ {
                PacketType::Nak => source.on_nak(&header, body).await,
                PacketType::Nnak => source.on_nnak(&header, body).await,
                PacketType::Spmr => source.on_spmr().await,
                PacketType::Polr => {
                    trace!("polr not implemented - dropping");
                    source.count_discarded().await;
                }
                _ => {}
            }
        } else {
            // multicast POLR lands here too: recognised, not implemented
            trace!("unroutable upstream packet from {:?} - dropping", src);
            ctx.count_discarded();
        }
        return;
    }

    // downstream: source to receivers
    if header.dport != ctx.dport {
        trace!("downstream traffic for another session - dropping");
        ctx.count_discarded();
        return;
    }
    if !ctx.config.can_recv {
        return;
    }

    let peer = resolve_peer(ctx, tsi, src).await;
    {
        let mut inner = peer.inner.lock().await;
        inner.stats.bytes_received += tpdu.len() as u64;
        inner.last_packet = Instant::now();
    }

    match header.typ {
        PacketType::Spm => receiver::on_spm(ctx, &peer, &header, body, dst).await,
        PacketType::Odata | PacketType::Rdata => receiver::on_data(ctx, &peer, &header, body).await,
        PacketType::Ncf => receiver::on_ncf(ctx, &peer, &header, body).await,
        _ => {
            trace!("unhandled downstream type {:?} - dropping", header.typ);
        }
    }
}

/// look up the peer for a TSI, creating it on first sight
async fn resolve_peer(ctx: &Arc<TransportCtx>, tsi: Tsi, src: SocketAddr) -> Arc<Peer> {
    {
        let peers = ctx.peers.read().await;
        if let Some(peer) = peers.get(&tsi) {
            return peer.clone();
        }
    }

    let mut peers = ctx.peers.write().await;
    // racing resolver may have inserted it meanwhile
    if let Some(peer) = peers.get(&tsi) {
        return peer.clone();
    }

    let now = Instant::now();
    let peer = Arc::new(Peer::new(tsi, src, &ctx.config, now));
    peers.insert(tsi, peer.clone());
    drop(peers);

    // the new peer's SPM request is probably the nearest deadline
    if !ctx.config.is_passive {
        ctx.timer.reschedule(now + ctx.config.spmr_expiry);
    }
    peer
}
