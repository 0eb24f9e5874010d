//! In-memory network for end-to-end tests: a routing table of unicast
//! endpoints and multicast groups with optional packet-drop injection.
//! Multicast never loops back to sockets of the sending node, matching a
//! sender with `IP_MULTICAST_LOOP` off.

use async_trait::async_trait;
use pgm_transport::send_pipeline::PgmSocket;
use pgm_transport::{Gsi, Transport, TransportConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const ODATA: u8 = 0x04;
pub const RDATA: u8 = 0x05;
pub const NAK: u8 = 0x08;

pub fn packet_type(tpdu: &[u8]) -> u8 {
    tpdu[4]
}

pub fn data_sqn(tpdu: &[u8]) -> u32 {
    u32::from_be_bytes([tpdu[16], tpdu[17], tpdu[18], tpdu[19]])
}

pub fn group() -> SocketAddr {
    SocketAddr::from(([239, 192, 0, 1], 7500))
}

pub fn host(n: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
}

type Datagram = (Vec<u8>, SocketAddr, SocketAddr);
pub type DropFilter = Box<dyn FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send>;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<SocketAddr, (u64, mpsc::UnboundedSender<Datagram>)>,
    members: HashMap<SocketAddr, Vec<SocketAddr>>,
    drop_filter: Option<DropFilter>,
}

#[derive(Default)]
pub struct Network {
    inner: Mutex<NetworkInner>,
}

impl Network {
    pub fn new() -> Arc<Network> {
        Arc::new(Network::default())
    }

    pub fn socket(self: &Arc<Self>, owner: u64, addr: SocketAddr) -> Arc<NetSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(addr, (owner, tx));
        Arc::new(NetSocket {
            network: self.clone(),
            local: addr,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn join(&self, group: SocketAddr, member: SocketAddr) {
        self.inner
            .lock()
            .unwrap()
            .members
            .entry(group)
            .or_default()
            .push(member);
    }

    /// install a predicate deciding which datagrams the "network" loses
    pub fn set_drop_filter(&self, filter: DropFilter) {
        self.inner.lock().unwrap().drop_filter = Some(filter);
    }

    fn route(&self, buf: &[u8], src: SocketAddr, dst: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(filter) = &mut inner.drop_filter {
            if filter(buf, src, dst) {
                return;
            }
        }
        let src_owner = inner.endpoints.get(&src).map(|(owner, _)| *owner);
        if dst.ip().is_multicast() {
            let members = inner.members.get(&dst).cloned().unwrap_or_default();
            for member in members {
                if let Some((owner, tx)) = inner.endpoints.get(&member) {
                    if Some(*owner) == src_owner {
                        continue;
                    }
                    let _ = tx.send((buf.to_vec(), src, dst));
                }
            }
        } else if let Some((_, tx)) = inner.endpoints.get(&dst) {
            let _ = tx.send((buf.to_vec(), src, dst));
        }
    }
}

pub struct NetSocket {
    network: Arc<Network>,
    local: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl PgmSocket for NetSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        self.network.route(buf, self.local, to);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
        let (data, src, dst) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, src, dst))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// bind a transport onto the test network: the receive socket sits at
/// `(host, dport)` and joins the group, two more sockets provide the send
/// lanes
pub async fn bind_node(
    net: &Arc<Network>,
    owner: u64,
    config: TransportConfig,
    gsi: Gsi,
    sport: u16,
    host_ip: IpAddr,
) -> Transport {
    let dport = group().port();
    let recv_addr = SocketAddr::new(host_ip, dport);
    let recv = net.socket(owner, recv_addr);
    net.join(group(), recv_addr);
    let send = net.socket(owner, SocketAddr::new(host_ip, 40_000 + owner as u16));
    let alert = net.socket(owner, SocketAddr::new(host_ip, 41_000 + owner as u16));

    Transport::bind(config, gsi, sport, dport, group(), host_ip, recv, send, alert)
        .await
        .expect("transport binds")
}

/// drive a receiving transport, forwarding every committed message
pub fn spawn_reader(transport: Arc<Transport>) -> mpsc::UnboundedReceiver<bytes::Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match transport.recv().await {
                Ok(messages) => {
                    for message in messages {
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                }
                Err(_) => return,
            }
        }
    });
    rx
}

/// a sending transport still has to drain its socket for NAKs and SPMRs
pub fn spawn_pump(transport: Arc<Transport>) {
    tokio::spawn(async move {
        loop {
            if transport.recv().await.is_err() {
                return;
            }
        }
    });
}
