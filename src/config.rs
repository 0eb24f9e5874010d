//! Transport configuration. The whole surface is an owned value handed to
//! `Transport::bind`, so every knob is frozen from that point on; `validate`
//! enforces the cross-field constraints up front.

use anyhow::bail;
use std::time::Duration;

/// assumed IP header length charged against `max_tpdu`
pub const IPHDR_LEN: usize = 20;

#[derive(Clone, Debug)]
pub struct FecConfig {
    /// FEC block size `n`, in `[k+1, 255]`
    pub rs_n: u8,
    /// transmission group size `k`, a power of two in `[2, 128]`
    pub rs_k: u8,
    pub proactive: bool,
    pub ondemand: bool,
    pub var_pktlen: bool,
}

impl FecConfig {
    pub fn parity_count(&self) -> u32 {
        u32::from(self.rs_n) - u32::from(self.rs_k)
    }

    pub fn tg_sqn_shift(&self) -> u8 {
        self.rs_k.trailing_zeros() as u8
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// maximum PGM packet size including the IP header
    pub max_tpdu: u16,
    /// multicast TTL
    pub hops: u8,
    /// idle SPM period
    pub spm_ambient_interval: Duration,
    /// ascending ramp fired after each ODATA burst; empty disables heartbeats
    pub spm_heartbeat_intervals: Vec<Duration>,
    /// downstream silence after which a peer is dropped
    pub peer_expiry: Duration,
    /// delay before a new peer solicits an SPM
    pub spmr_expiry: Duration,

    /// transmit window length in sequence numbers; 0 sizes by duration
    pub txw_sqns: u32,
    /// receive window length in sequence numbers; 0 sizes by duration
    pub rxw_sqns: u32,
    /// alternate window sizing: seconds of traffic at `*_max_rte`
    pub txw_secs: u32,
    pub rxw_secs: u32,
    /// bytes per second rate target; also drives the send rate limiter
    pub txw_max_rte: u64,
    pub rxw_max_rte: u64,

    /// socket buffer sizes, applied by the I/O layer
    pub sndbuf: usize,
    pub rcvbuf: usize,

    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,

    pub fec: Option<FecConfig>,

    pub can_send: bool,
    pub can_recv: bool,
    /// a passive receiver emits neither NAK nor SPMR
    pub is_passive: bool,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            max_tpdu: 1500,
            hops: 16,
            spm_ambient_interval: Duration::from_millis(8192),
            spm_heartbeat_intervals: vec![
                Duration::from_millis(4),
                Duration::from_millis(4),
                Duration::from_millis(8),
                Duration::from_millis(16),
                Duration::from_millis(32),
                Duration::from_millis(64),
                Duration::from_millis(128),
                Duration::from_millis(256),
                Duration::from_millis(512),
                Duration::from_millis(1024),
                Duration::from_millis(2048),
                Duration::from_millis(4096),
                Duration::from_millis(7168),
            ],
            peer_expiry: Duration::from_millis(5 * 8192),
            spmr_expiry: Duration::from_millis(250),
            txw_sqns: 1024,
            rxw_sqns: 1024,
            txw_secs: 0,
            rxw_secs: 0,
            txw_max_rte: 0,
            rxw_max_rte: 0,
            sndbuf: 0,
            rcvbuf: 0,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_data_retries: 50,
            nak_ncf_retries: 50,
            fec: None,
            can_send: true,
            can_recv: true,
            is_passive: false,
        }
    }
}

impl TransportConfig {
    /// restrict to sending; incoming SPM/ODATA/RDATA are discarded
    pub fn send_only(mut self) -> TransportConfig {
        self.can_recv = false;
        self
    }

    /// restrict to receiving; no transmit window, no SPM broadcasts.
    /// a passive receiver additionally never sends NAK or SPMR.
    pub fn recv_only(mut self, passive: bool) -> TransportConfig {
        self.can_send = false;
        self.is_passive = passive;
        self
    }

    /// payload bytes available in a single unfragmented TSDU
    pub fn max_tsdu(&self) -> usize {
        self.max_tpdu as usize
            - IPHDR_LEN
            - crate::packet_header::PGM_HEADER_LEN
            - crate::packet_header::DATA_HEADER_LEN
            - self.varpkt_reserve()
    }

    /// payload bytes available per TPDU once OPT_FRAGMENT is carried
    pub fn max_tsdu_fragment(&self) -> usize {
        self.max_tsdu() - crate::options::FRAGMENT_CHAIN_LEN
    }

    /// trailing bytes reserved per packet for the actual-length word of
    /// variable-packet-length parity groups
    pub fn varpkt_reserve(&self) -> usize {
        match &self.fec {
            Some(fec) if fec.var_pktlen => 2,
            _ => 0,
        }
    }

    /// effective transmit window length in sequence numbers
    pub fn effective_txw_sqns(&self) -> u32 {
        if self.txw_sqns > 0 {
            self.txw_sqns
        } else {
            self.sqns_from_rate(self.txw_secs, self.txw_max_rte)
        }
    }

    /// effective receive window length in sequence numbers
    pub fn effective_rxw_sqns(&self) -> u32 {
        if self.rxw_sqns > 0 {
            self.rxw_sqns
        } else {
            self.sqns_from_rate(self.rxw_secs, self.rxw_max_rte)
        }
    }

    fn sqns_from_rate(&self, secs: u32, max_rte: u64) -> u32 {
        let per_sec = max_rte / self.max_tpdu as u64;
        (u64::from(secs) * per_sec).clamp(1, u64::from(u32::MAX / 2)) as u32
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let header_floor = IPHDR_LEN
            + crate::packet_header::PGM_HEADER_LEN
            + crate::packet_header::DATA_HEADER_LEN
            + crate::options::FRAGMENT_CHAIN_LEN
            + self.varpkt_reserve();
        if (self.max_tpdu as usize) < header_floor + 1 {
            bail!("max_tpdu {} cannot carry a fragmented PGM data packet", self.max_tpdu);
        }
        if self.hops == 0 {
            bail!("hops must be in 1..=255");
        }
        if !self.can_send && !self.can_recv {
            bail!("transport must be able to send, receive, or both");
        }

        if self.can_send {
            if self.spm_ambient_interval.is_zero() {
                bail!("spm_ambient_interval must be non-zero");
            }
            let mut previous = Duration::ZERO;
            for (i, ivl) in self.spm_heartbeat_intervals.iter().enumerate() {
                if ivl.is_zero() {
                    bail!("spm_heartbeat_intervals[{}] must be non-zero", i);
                }
                if *ivl < previous {
                    bail!("spm_heartbeat_intervals must be ascending");
                }
                previous = *ivl;
            }
            if self.txw_sqns == 0 && (self.txw_secs == 0 || self.txw_max_rte == 0) {
                bail!("transmit window needs txw_sqns, or txw_secs with txw_max_rte");
            }
            if self.txw_sqns >= (1 << 31) - 1 {
                bail!("txw_sqns must be below 2^31 - 1");
            }
        }

        if self.can_recv {
            if self.peer_expiry < 2 * self.spm_ambient_interval {
                bail!("peer_expiry must be at least twice spm_ambient_interval");
            }
            if self.spmr_expiry >= self.spm_ambient_interval {
                bail!("spmr_expiry must be below spm_ambient_interval");
            }
            if self.rxw_sqns == 0 && (self.rxw_secs == 0 || self.rxw_max_rte == 0) {
                bail!("receive window needs rxw_sqns, or rxw_secs with rxw_max_rte");
            }
            if self.rxw_sqns >= (1 << 31) - 1 {
                bail!("rxw_sqns must be below 2^31 - 1");
            }
            if self.nak_bo_ivl < Duration::from_micros(2) {
                bail!("nak_bo_ivl too small to randomise");
            }
        }

        if let Some(fec) = &self.fec {
            if !fec.rs_k.is_power_of_two() || !(2..=128).contains(&fec.rs_k) {
                bail!("fec k must be a power of two in [2, 128]");
            }
            if u16::from(fec.rs_n) < u16::from(fec.rs_k) + 1 {
                bail!("fec n must be at least k + 1");
            }
            let h = f64::from(fec.parity_count());
            let k = f64::from(fec.rs_k);
            if fec.rs_k > 223 && (h * 223.0) / k < 1.0 {
                bail!("fec h/k ratio too low to generate parity data");
            }
            if !fec.proactive && !fec.ondemand {
                bail!("fec requires proactive or on-demand mode");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_validates() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn test_send_only_recv_only() {
        let cfg = TransportConfig::default().send_only();
        assert!(cfg.can_send && !cfg.can_recv);
        cfg.validate().unwrap();

        let cfg = TransportConfig::default().recv_only(true);
        assert!(!cfg.can_send && cfg.can_recv && cfg.is_passive);
        cfg.validate().unwrap();
    }

    #[rstest]
    #[case::tiny_tpdu(|c: &mut TransportConfig| c.max_tpdu = 40)]
    #[case::zero_hops(|c: &mut TransportConfig| c.hops = 0)]
    #[case::neither_direction(|c: &mut TransportConfig| { c.can_send = false; c.can_recv = false; })]
    #[case::peer_expiry_too_short(|c: &mut TransportConfig| c.peer_expiry = c.spm_ambient_interval)]
    #[case::spmr_too_long(|c: &mut TransportConfig| c.spmr_expiry = c.spm_ambient_interval)]
    #[case::no_txw(|c: &mut TransportConfig| c.txw_sqns = 0)]
    #[case::descending_heartbeats(|c: &mut TransportConfig| c.spm_heartbeat_intervals = vec![Duration::from_millis(8), Duration::from_millis(4)])]
    #[case::fec_k_not_power_of_two(|c: &mut TransportConfig| c.fec = Some(FecConfig { rs_n: 10, rs_k: 6, proactive: true, ondemand: false, var_pktlen: false }))]
    #[case::fec_n_too_small(|c: &mut TransportConfig| c.fec = Some(FecConfig { rs_n: 4, rs_k: 4, proactive: true, ondemand: false, var_pktlen: false }))]
    #[case::fec_no_mode(|c: &mut TransportConfig| c.fec = Some(FecConfig { rs_n: 6, rs_k: 4, proactive: false, ondemand: false, var_pktlen: false }))]
    fn test_validate_rejects(#[case] mutate: fn(&mut TransportConfig)) {
        let mut cfg = TransportConfig::default();
        mutate(&mut cfg);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_window_sizing_by_duration() {
        let mut cfg = TransportConfig::default();
        cfg.txw_sqns = 0;
        cfg.txw_secs = 10;
        cfg.txw_max_rte = 15_000;
        assert_eq!(cfg.effective_txw_sqns(), 100);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_tsdu_budgets() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.max_tsdu(), 1500 - 20 - 16 - 8);
        assert_eq!(cfg.max_tsdu_fragment(), cfg.max_tsdu() - 19);

        let mut with_var = TransportConfig::default();
        with_var.fec = Some(FecConfig { rs_n: 6, rs_k: 4, proactive: true, ondemand: true, var_pktlen: true });
        assert_eq!(with_var.max_tsdu(), cfg.max_tsdu() - 2);
    }
}
