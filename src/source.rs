//! Sending side of a transport: ODATA segmentation and emission, SPM
//! assembly, NAK handling with immediate NCF confirmation, and the RDATA
//! service that rebuilds selective repairs and computes parity packets.

use crate::config::{TransportConfig, IPHDR_LEN};
use crate::control_messages::{DataHeader, NakBody, SpmBody};
use crate::error::{PgmError, PgmResult};
use crate::fec::{FecCodec, RsCodec};
use crate::options::{self, OptFragment, OptionsBuilder, ParsedOptions, FRAGMENT_STRIPE_LEN};
use crate::packet_header::{self, flags, PacketType, PgmHeader, DATA_HEADER_LEN, PGM_HEADER_LEN};
use crate::send_pipeline::SendPipeline;
use crate::sqn::Sqn;
use crate::stats::SourceStats;
use crate::timer::TimerShared;
use crate::tsi::Tsi;
use crate::txw::{TransmitWindow, TxwEntry};
use crate::checksum;
use bytes::BufMut;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct SourceInner {
    txw: TransmitWindow,
    spm_sqn: Sqn,
    stats: SourceStats,
}

pub(crate) struct Source {
    config: Arc<TransportConfig>,
    tsi: Tsi,
    dport: u16,
    /// the multicast group all downstream traffic is sent to
    group_addr: SocketAddr,
    /// our unicast NLA, advertised as the SPM path for upstream NAKs
    path_nla: IpAddr,
    pipeline: Arc<SendPipeline>,
    fec: Option<Arc<RsCodec>>,
    timer: Arc<TimerShared>,
    /// wakes the RDATA service when retransmission work is queued
    pub rdata_notify: Arc<Notify>,
    inner: RwLock<SourceInner>,
}

impl Source {
    pub fn new(
        config: Arc<TransportConfig>,
        tsi: Tsi,
        dport: u16,
        group_addr: SocketAddr,
        path_nla: IpAddr,
        pipeline: Arc<SendPipeline>,
        timer: Arc<TimerShared>,
    ) -> Source {
        let fec = config
            .fec
            .as_ref()
            .map(|fec| Arc::new(RsCodec::new(fec.rs_k as usize)));
        Source {
            tsi,
            dport,
            group_addr,
            path_nla,
            pipeline,
            fec,
            timer,
            rdata_notify: Arc::new(Notify::new()),
            inner: RwLock::new(SourceInner {
                txw: TransmitWindow::new(config.effective_txw_sqns()),
                spm_sqn: Sqn::ZERO,
                stats: SourceStats::default(),
            }),
            config,
        }
    }

    pub async fn stats(&self) -> SourceStats {
        self.inner.read().await.stats.clone()
    }

    fn tg_sqn_shift(&self) -> u8 {
        self.config.fec.as_ref().map(|f| f.tg_sqn_shift()).unwrap_or(0)
    }

    /// parity packets available per group; the sequence-number low bits
    /// carry the parity index, so it is bounded by the group size
    fn parity_count(&self) -> u32 {
        self.config
            .fec
            .as_ref()
            .map(|f| f.parity_count().min(u32::from(f.rs_k)))
            .unwrap_or(0)
    }

    /// frame, window and send one APDU, fragmenting as needed. The window
    /// lock is held as writer across push and send so on-wire order matches
    /// sequence order.
    pub async fn send_apdu(&self, apdu: &[u8], nonblocking: bool) -> PgmResult<usize> {
        if apdu.is_empty() {
            return Err(PgmError::InvalidArgument("empty apdu".into()));
        }

        let max_tsdu = self.config.max_tsdu();
        let max_fragment = self.config.max_tsdu_fragment();
        let mut inner = self.inner.write().await;

        if apdu.len() <= max_tsdu {
            self.send_one(&mut inner, apdu, None, nonblocking).await?;
        } else {
            let fragments = apdu.len().div_ceil(max_fragment);
            if fragments as u64 > u64::from(self.config.effective_txw_sqns()) {
                return Err(PgmError::InvalidArgument(format!(
                    "apdu of {} bytes does not fit the transmit window",
                    apdu.len()
                )));
            }

            let first_sqn = inner.txw.next_lead();
            let mut offset = 0usize;
            while offset < apdu.len() {
                let tsdu_length = max_fragment.min(apdu.len() - offset);
                let fragment = OptFragment {
                    first_sqn,
                    offset: offset as u32,
                    apdu_len: apdu.len() as u32,
                };
                self.send_one(&mut inner, &apdu[offset..offset + tsdu_length], Some(fragment), nonblocking)
                    .await?;
                offset += tsdu_length;
            }
        }

        drop(inner);
        self.timer
            .reset_heartbeat(&self.config.spm_heartbeat_intervals, Instant::now());
        Ok(apdu.len())
    }

    /// build one ODATA TPDU, push it into the window and send it
    async fn send_one(
        &self,
        inner: &mut SourceInner,
        tsdu: &[u8],
        fragment: Option<OptFragment>,
        nonblocking: bool,
    ) -> PgmResult<()> {
        let sqn = inner.txw.next_lead();
        let trail = inner.txw.trail();

        let mut header = PgmHeader::new(PacketType::Odata, self.tsi.gsi, self.tsi.sport, self.dport);
        header.tsdu_length = tsdu.len() as u16;
        if fragment.is_some() {
            header.options = flags::OPT_PRESENT;
        }

        let mut tpdu = Vec::with_capacity(self.config.max_tpdu as usize - IPHDR_LEN);
        header.ser(&mut tpdu);
        DataHeader { sqn, trail }.ser(&mut tpdu);
        if let Some(fragment) = &fragment {
            OptionsBuilder::new().fragment(fragment).build(&mut tpdu);
        }
        let payload_offset = tpdu.len();
        tpdu.put_slice(tsdu);
        packet_header::finalize_checksum(&mut tpdu);

        let unfolded_data_csum = checksum::partial(tsdu, 0);
        let tpdu_len = tpdu.len();

        let assigned = inner.txw.push(TxwEntry {
            tpdu: tpdu.clone(),
            tsdu_length: tsdu.len() as u16,
            payload_offset,
            unfolded_data_csum,
            fragment,
        });
        debug_assert_eq!(assigned, sqn);
        trace!("odata {} with {} payload bytes", sqn, tsdu.len());

        self.pipeline
            .send(&tpdu, self.group_addr, true, false, nonblocking)
            .await?;

        inner.stats.data_msgs_sent += 1;
        inner.stats.data_bytes_sent += tsdu.len() as u64;
        inner.stats.bytes_sent += (tpdu_len + IPHDR_LEN) as u64;

        // a completed transmission group schedules its proactive parity
        if let Some(fec) = &self.config.fec {
            if fec.proactive && self.parity_count() > 0 {
                let shift = fec.tg_sqn_shift();
                if inner.txw.next_lead().tg_index(shift) == 0 {
                    let tg = sqn.tg_base(shift);
                    let request = tg.plus(self.parity_count() - 1);
                    if inner.txw.retransmit_push(request, true, shift) {
                        self.rdata_notify.notify_one();
                    }
                }
            }
        }
        Ok(())
    }

    /// assemble and multicast one SPM advertising the current window edges
    pub async fn send_spm(&self) {
        let mut inner = self.inner.write().await;
        let spm_sqn = inner.spm_sqn;
        inner.spm_sqn = inner.spm_sqn.next();

        let mut header = PgmHeader::new(PacketType::Spm, self.tsi.gsi, self.tsi.sport, self.dport);
        let with_parity_prm = self.config.fec.is_some();
        if with_parity_prm {
            header.options = flags::OPT_PRESENT | flags::OPT_NETWORK;
        }

        let mut tpdu = Vec::with_capacity(64);
        header.ser(&mut tpdu);
        SpmBody {
            spm_sqn,
            trail: inner.txw.trail(),
            lead: inner.txw.lead(),
            path_nla: self.path_nla,
        }
        .ser(&mut tpdu);
        if let Some(fec) = &self.config.fec {
            OptionsBuilder::new()
                .parity_prm(fec.proactive, fec.ondemand, u32::from(fec.rs_k))
                .build(&mut tpdu);
        }
        packet_header::finalize_checksum(&mut tpdu);

        trace!("spm {} trail {} lead {}", spm_sqn, inner.txw.trail(), inner.txw.lead());
        if self
            .pipeline
            .send(&tpdu, self.group_addr, true, true, false)
            .await
            .is_ok()
        {
            inner.stats.spms_sent += 1;
            inner.stats.bytes_sent += (tpdu.len() + IPHDR_LEN) as u64;
        }
    }

    /// a NAK reached us as the source: verify its NLAs, confirm with an NCF
    /// and queue the retransmissions
    pub async fn on_nak(&self, header: &PgmHeader, body: &[u8]) {
        let is_parity = header.has_option(flags::OPT_PARITY);

        {
            let mut inner = self.inner.write().await;
            if is_parity {
                inner.stats.parity_naks_received += 1;
                if !self.config.fec.as_ref().map(|f| f.ondemand).unwrap_or(false) {
                    inner.stats.malformed_naks += 1;
                    inner.stats.packets_discarded += 1;
                    return;
                }
            } else {
                inner.stats.selective_naks_received += 1;
            }
        }

        let mut buf = body;
        let nak = match NakBody::deser(&mut buf) {
            Ok(nak) => nak,
            Err(_) => {
                self.count_malformed_nak().await;
                return;
            }
        };

        // the NAK must name our path and our send group
        if nak.src_nla != self.path_nla || nak.grp_nla != self.group_addr.ip() {
            debug!("nak with foreign nla {:?}/{:?} - discarding", nak.src_nla, nak.grp_nla);
            self.count_malformed_nak().await;
            return;
        }

        let mut sqn_list = vec![nak.sqn];
        if header.has_option(flags::OPT_PRESENT) {
            match options::parse(buf) {
                Ok(ParsedOptions { nak_list, .. }) => sqn_list.extend(nak_list),
                Err(_) => {
                    self.count_malformed_nak().await;
                    return;
                }
            }
        }
        trace!("nak for {} sequence numbers", sqn_list.len());

        // confirm first, then defer to the rdata service
        self.send_ncf(&sqn_list, is_parity).await;

        let shift = self.tg_sqn_shift();
        let mut inner = self.inner.write().await;
        let mut queued = false;
        for &sqn in &sqn_list {
            queued |= inner.txw.retransmit_push(sqn, is_parity, shift);
        }
        drop(inner);
        if queued {
            self.rdata_notify.notify_one();
        }
    }

    pub async fn count_discarded(&self) {
        self.inner.write().await.stats.packets_discarded += 1;
    }

    async fn count_malformed_nak(&self) {
        let mut inner = self.inner.write().await;
        inner.stats.malformed_naks += 1;
        inner.stats.packets_discarded += 1;
    }

    /// multicast an NCF covering the accepted NAK
    async fn send_ncf(&self, sqn_list: &[Sqn], is_parity: bool) {
        let mut header = PgmHeader::new(PacketType::Ncf, self.tsi.gsi, self.tsi.sport, self.dport);
        header.options = if sqn_list.len() > 1 {
            flags::OPT_PRESENT | flags::OPT_NETWORK
        } else {
            0
        };
        if is_parity {
            header.options |= flags::OPT_PARITY;
        }

        let mut tpdu = Vec::with_capacity(64 + 4 * sqn_list.len());
        header.ser(&mut tpdu);
        NakBody {
            sqn: sqn_list[0],
            src_nla: self.path_nla,
            grp_nla: self.group_addr.ip(),
        }
        .ser(&mut tpdu);
        if sqn_list.len() > 1 {
            OptionsBuilder::new().nak_list(&sqn_list[1..]).build(&mut tpdu);
        }
        packet_header::finalize_checksum(&mut tpdu);

        if self
            .pipeline
            .send(&tpdu, self.group_addr, false, true, false)
            .await
            .is_ok()
        {
            let mut inner = self.inner.write().await;
            inner.stats.bytes_sent += (tpdu.len() + IPHDR_LEN) as u64;
        }
    }

    /// an SPMR solicits one immediate SPM
    pub async fn on_spmr(&self) {
        self.send_spm().await;
    }

    /// Null-NAKs are counted, nothing else
    pub async fn on_nnak(&self, header: &PgmHeader, body: &[u8]) {
        let mut inner = self.inner.write().await;
        inner.stats.nnak_packets_received += 1;

        let mut buf = body;
        let nnak = match NakBody::deser(&mut buf) {
            Ok(nnak) => nnak,
            Err(_) => {
                inner.stats.nnak_errors += 1;
                inner.stats.packets_discarded += 1;
                return;
            }
        };
        if nnak.src_nla != self.path_nla || nnak.grp_nla != self.group_addr.ip() {
            inner.stats.nnak_errors += 1;
            inner.stats.packets_discarded += 1;
            return;
        }

        let mut count = 1;
        if header.has_option(flags::OPT_PRESENT) {
            if let Ok(parsed) = options::parse(buf) {
                count += parsed.nak_list.len() as u64;
            }
        }
        inner.stats.nnaks_received += count;
    }

    /// one round of the RDATA service: pop a retransmit request and send
    /// the repair. returns false when the queue is empty.
    pub async fn service_rdata(&self) -> bool {
        let mut inner = self.inner.write().await;
        let Some(work) = inner.txw.retransmit_try_pop(self.parity_count()) else {
            return false;
        };

        let tpdu = if work.is_parity {
            match self.build_parity_rdata(&mut inner, work.sqn, work.parity_index) {
                Some(tpdu) => tpdu,
                None => {
                    inner.stats.packets_discarded += 1;
                    return true;
                }
            }
        } else {
            match self.build_selective_rdata(&inner, work.sqn) {
                Some(tpdu) => tpdu,
                None => {
                    // the window moved past the requested number; stale NAK
                    debug!("rdata request for {} outside the window", work.sqn);
                    inner.stats.packets_discarded += 1;
                    return true;
                }
            }
        };

        let tsdu_length = u64::from(u16::from_be_bytes([tpdu[14], tpdu[15]]));
        if self
            .pipeline
            .send(&tpdu, self.group_addr, true, true, false)
            .await
            .is_ok()
        {
            if work.is_parity {
                inner.stats.parity_msgs_retransmitted += 1;
                inner.stats.parity_bytes_retransmitted += tsdu_length;
            } else {
                inner.stats.selective_msgs_retransmitted += 1;
                inner.stats.selective_bytes_retransmitted += tsdu_length;
            }
            inner.stats.bytes_sent += (tpdu.len() + IPHDR_LEN) as u64;
        }
        drop(inner);

        self.timer
            .reset_heartbeat(&self.config.spm_heartbeat_intervals, Instant::now());
        true
    }

    /// rebuild RDATA from the stored ODATA: flip the type, refresh the
    /// trailing edge and re-checksum the header against the cached data sum
    fn build_selective_rdata(&self, inner: &SourceInner, sqn: Sqn) -> Option<Vec<u8>> {
        let trail = inner.txw.trail();
        let entry = inner.txw.peek(sqn).ok()?;

        let mut tpdu = entry.tpdu.clone();
        tpdu[4] = PacketType::Rdata.to_wire();
        tpdu[20..24].copy_from_slice(&trail.to_raw().to_be_bytes());
        tpdu[6] = 0;
        tpdu[7] = 0;
        let header_sum = checksum::partial(&tpdu[..entry.payload_offset], 0);
        let cs = checksum::fold(checksum::block_add(
            header_sum,
            entry.unfolded_data_csum,
            entry.payload_offset,
        ));
        tpdu[6] = (cs >> 8) as u8;
        tpdu[7] = cs as u8;
        Some(tpdu)
    }

    /// compute a parity RDATA packet for one transmission group
    fn build_parity_rdata(&self, inner: &mut SourceInner, tg: Sqn, h: u32) -> Option<Vec<u8>> {
        let fec = self.fec.as_ref()?;
        let k = fec.group_size() as u32;
        let shift = self.tg_sqn_shift();
        debug_assert_eq!(tg.tg_index(shift), 0);

        // the whole group must still be in the window
        let mut payloads = Vec::with_capacity(k as usize);
        let mut stripes = Vec::with_capacity(k as usize);
        let mut max_tsdu = 0usize;
        let mut is_var_pktlen = false;
        let mut is_op_encoded = false;
        for i in 0..k {
            let entry = match inner.txw.peek(tg.plus(i)) {
                Ok(entry) => entry,
                Err(_) => {
                    warn!("transmission group {} no longer complete in the window", tg);
                    return None;
                }
            };
            let tsdu = entry.payload().to_vec();
            if max_tsdu != 0 && tsdu.len() != max_tsdu {
                is_var_pktlen = true;
            }
            max_tsdu = max_tsdu.max(tsdu.len());
            match &entry.fragment {
                Some(fragment) => {
                    is_op_encoded = true;
                    stripes.push(fragment.to_stripe());
                }
                None => stripes.push(OptFragment::null_stripe()),
            }
            payloads.push(tsdu);
        }

        // zero-pad to the group maximum; with variable lengths the true TSDU
        // length rides in the trailing two bytes of each block
        let block_len = if is_var_pktlen { max_tsdu + 2 } else { max_tsdu };
        for payload in payloads.iter_mut() {
            let true_len = payload.len() as u16;
            payload.resize(block_len, 0);
            if is_var_pktlen {
                payload[block_len - 2..].copy_from_slice(&true_len.to_be_bytes());
            }
        }

        let mut header = PgmHeader::new(PacketType::Rdata, self.tsi.gsi, self.tsi.sport, self.dport);
        header.options = flags::OPT_PARITY;
        if is_var_pktlen {
            header.options |= flags::OPT_VAR_PKTLEN;
        }
        if is_op_encoded {
            header.options |= flags::OPT_PRESENT;
        }
        header.tsdu_length = block_len as u16;

        let mut tpdu = Vec::with_capacity(PGM_HEADER_LEN + DATA_HEADER_LEN + options::FRAGMENT_CHAIN_LEN + block_len);
        header.ser(&mut tpdu);
        DataHeader { sqn: tg.plus(h), trail: inner.txw.trail() }.ser(&mut tpdu);

        if is_op_encoded {
            // fragment metadata is itself Reed-Solomon encoded as a parallel stripe
            let stripe_refs = stripes.iter().map(|s| &s[..]).collect::<Vec<_>>();
            let mut parity_stripe = [0u8; FRAGMENT_STRIPE_LEN];
            fec.encode(&stripe_refs, h as usize, &mut parity_stripe);
            OptionsBuilder::new().fragment_stripe(&parity_stripe).build(&mut tpdu);
        }

        let payload_refs = payloads.iter().map(|p| &p[..]).collect::<Vec<_>>();
        let mut parity_block = vec![0u8; block_len];
        fec.encode(&payload_refs, h as usize, &mut parity_block);
        tpdu.put_slice(&parity_block);
        packet_header::finalize_checksum(&mut tpdu);

        trace!("parity rdata for group {} index {}", tg, h);
        Some(tpdu)
    }
}

/// the RDATA service task: drains the retransmit queue whenever prodded
pub(crate) async fn run_rdata_service(
    source: Arc<Source>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = source.rdata_notify.notified() => {
                while source.service_rdata().await {}
            }
            _ = shutdown.changed() => break,
        }
    }
}
