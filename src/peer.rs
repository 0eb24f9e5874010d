//! Per-source state on the receiving side. A peer is created lazily on the
//! first downstream packet from an unknown TSI and dropped by the timer
//! engine once `peer_expiry` passes without traffic.

use crate::config::TransportConfig;
use crate::fec::RsCodec;
use crate::rxw::ReceiveWindow;
use crate::sqn::Sqn;
use crate::stats::ReceiverStats;
use crate::tsi::Tsi;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct PeerInner {
    /// unicast NLA of the source, learned from its SPM path; NAKs cannot be
    /// sent until this is known
    pub nla: Option<IpAddr>,
    /// multicast group the source sends to, learned from the destination of
    /// its multicast traffic
    pub group_nla: Option<IpAddr>,
    /// source address of the first packet seen from this TSI
    pub local_nla: SocketAddr,
    pub expiry: Instant,
    /// armed while an SPM request is outstanding; cleared on any SPM or on a
    /// peer's multicast SPMR
    pub spmr_expiry: Option<Instant>,
    /// highest SPM sequence seen; `None` until the first SPM
    pub spm_sqn: Option<Sqn>,

    // FEC parameters advertised by this source via OPT_PARITY_PRM
    pub use_proactive_parity: bool,
    pub use_ondemand_parity: bool,
    pub rs_k: u8,
    pub tg_sqn_shift: u8,
    /// decoder for this source's group size, built when parameters are learned
    pub fec: Option<Arc<RsCodec>>,

    pub rxw: ReceiveWindow,
    pub stats: ReceiverStats,
    pub last_packet: Instant,
    pub min_fail_time: Option<Duration>,
    pub max_fail_time: Option<Duration>,
}

impl PeerInner {
    pub fn learn_fec_params(&mut self, proactive: bool, ondemand: bool, group_size: u32) {
        self.use_proactive_parity = proactive;
        self.use_ondemand_parity = ondemand;
        if self.rs_k != group_size as u8 {
            self.rs_k = group_size as u8;
            self.tg_sqn_shift = (group_size as u8).trailing_zeros() as u8;
            self.fec = Some(Arc::new(RsCodec::new(group_size as usize)));
        }
    }

    /// record how long a cancelled sequence number had been outstanding
    pub fn record_fail_time(&mut self, t0: Instant, now: Instant) {
        let fail_time = now.duration_since(t0);
        self.max_fail_time = Some(self.max_fail_time.map_or(fail_time, |t| t.max(fail_time)));
        self.min_fail_time = Some(self.min_fail_time.map_or(fail_time, |t| t.min(fail_time)));
    }
}

pub struct Peer {
    pub tsi: Tsi,
    pub inner: Mutex<PeerInner>,
}

impl Peer {
    pub fn new(tsi: Tsi, local_nla: SocketAddr, config: &TransportConfig, now: Instant) -> Peer {
        debug!("new peer, tsi {}, local nla {:?}", tsi, local_nla);
        Peer {
            tsi,
            inner: Mutex::new(PeerInner {
                nla: None,
                group_nla: None,
                local_nla,
                expiry: now + config.peer_expiry,
                spmr_expiry: Some(now + config.spmr_expiry),
                spm_sqn: None,
                use_proactive_parity: false,
                use_ondemand_parity: false,
                rs_k: 0,
                tg_sqn_shift: 0,
                fec: None,
                rxw: ReceiveWindow::new(config.effective_rxw_sqns()),
                stats: ReceiverStats::default(),
                last_packet: now,
                min_fail_time: None,
                max_fail_time: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecCodec;
    use std::net::Ipv4Addr;

    fn test_peer() -> Peer {
        let tsi = Tsi::new(crate::tsi::Gsi::from_bytes([1, 2, 3, 4, 5, 6]), 1000);
        Peer::new(
            tsi,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 3056),
            &TransportConfig::default(),
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_new_peer_arms_spmr() {
        let peer = test_peer();
        let inner = peer.inner.lock().await;
        assert!(inner.spmr_expiry.is_some());
        assert!(inner.nla.is_none());
        assert!(inner.spm_sqn.is_none());
    }

    #[tokio::test]
    async fn test_learn_fec_params_builds_decoder() {
        let peer = test_peer();
        let mut inner = peer.inner.lock().await;
        inner.learn_fec_params(false, true, 8);
        assert_eq!(inner.rs_k, 8);
        assert_eq!(inner.tg_sqn_shift, 3);
        assert!(inner.use_ondemand_parity);
        assert_eq!(inner.fec.as_ref().unwrap().group_size(), 8);

        // same k: decoder is not rebuilt
        let before = Arc::as_ptr(inner.fec.as_ref().unwrap());
        inner.learn_fec_params(true, true, 8);
        assert_eq!(before, Arc::as_ptr(inner.fec.as_ref().unwrap()));
        assert!(inner.use_proactive_parity);
    }

    #[tokio::test]
    async fn test_fail_time_accounting() {
        let peer = test_peer();
        let mut inner = peer.inner.lock().await;
        let t0 = Instant::now();
        inner.record_fail_time(t0, t0 + Duration::from_millis(100));
        inner.record_fail_time(t0, t0 + Duration::from_millis(50));
        assert_eq!(inner.min_fail_time, Some(Duration::from_millis(50)));
        assert_eq!(inner.max_fail_time, Some(Duration::from_millis(100)));
    }
}
