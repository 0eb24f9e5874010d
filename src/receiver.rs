//! Receiving side: downstream packet handlers feeding each peer's receive
//! window, the NAK state machine transitions driven by the timer engine,
//! and NAK/SPMR emission.

use crate::config::TransportConfig;
use crate::control_messages::{DataHeader, NakBody, SpmBody};
use crate::error::PgmError;
use crate::fec::FecCodec;
use crate::options::{self, OptFragment, OptionsBuilder, ParsedOptions, MAX_NAK_LIST_SQNS};
use crate::packet_header::{self, flags, PacketType, PgmHeader};
use crate::peer::{Peer, PeerInner};
use crate::rxw::{RxwPush, RxwState};
use crate::sqn::Sqn;
use crate::transport::TransportCtx;
use crate::tsi::Tsi;
use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// uniform draw in `[1, nak_bo_ivl)` to spread NAK storms across receivers
pub(crate) fn nak_backoff_draw(config: &TransportConfig) -> impl FnMut() -> Duration + '_ {
    move || {
        let upper = config.nak_bo_ivl.as_micros().max(2) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(1..upper))
    }
}

/// SPM: advance the peer's view of the sender's window, learn its path NLA
/// and FEC parameters, refresh expiry
pub(crate) async fn on_spm(
    ctx: &TransportCtx,
    peer: &Arc<Peer>,
    header: &PgmHeader,
    body: &[u8],
    dst: SocketAddr,
) {
    let mut buf = body;
    let spm = match SpmBody::deser(&mut buf) {
        Ok(spm) => spm,
        Err(_) => {
            let mut inner = peer.inner.lock().await;
            inner.stats.malformed_spms += 1;
            inner.stats.packets_discarded += 1;
            return;
        }
    };

    let now = Instant::now();
    let mut inner = peer.inner.lock().await;

    let advances = inner.spm_sqn.map_or(true, |prev| spm.spm_sqn.is_after_eq(prev));
    if advances {
        inner.nla = Some(spm.path_nla);
        inner.spm_sqn = Some(spm.spm_sqn.next());
        if dst.ip().is_multicast() {
            inner.group_nla = Some(dst.ip());
        }

        let mut draw = nak_backoff_draw(&ctx.config);
        let created = inner.rxw.window_update(spm.trail, spm.lead, now, &mut draw);
        if created > 0 {
            if let Some(expiry) = inner.rxw.next_backoff_expiry() {
                ctx.timer.reschedule(expiry);
            }
        }
    } else {
        inner.stats.dup_spms += 1;
        inner.stats.packets_discarded += 1;
    }

    if header.has_option(flags::OPT_PRESENT) {
        match options::parse(buf) {
            Ok(ParsedOptions { parity_prm: Some(prm), .. }) => {
                if (2..=128).contains(&prm.group_size) && prm.group_size.is_power_of_two() {
                    inner.learn_fec_params(prm.proactive, prm.ondemand, prm.group_size);
                } else {
                    inner.stats.malformed_spms += 1;
                    inner.stats.packets_discarded += 1;
                    return;
                }
            }
            Ok(_) => {}
            Err(_) => {
                inner.stats.malformed_spms += 1;
                inner.stats.packets_discarded += 1;
                return;
            }
        }
    }

    // either way the peer is alive
    inner.expiry = now + ctx.config.peer_expiry;
    inner.spmr_expiry = None;
}

/// slice the TSDU out of a data body, past the option chain
fn data_payload<'a>(
    header: &PgmHeader,
    body: &'a [u8],
) -> Result<(DataHeader, Option<ParsedOptions>, &'a [u8]), PgmError> {
    let mut buf = body;
    let data = DataHeader::deser(&mut buf)?;

    let (parsed, opt_len) = if header.has_option(flags::OPT_PRESENT) {
        let parsed = options::parse(buf)?;
        let opt_len = parsed.total_length as usize;
        (Some(parsed), opt_len)
    } else {
        (None, 0)
    };

    let payload = &buf[opt_len..];
    if payload.len() < header.tsdu_length as usize {
        return Err(PgmError::Malformed("tsdu shorter than advertised"));
    }
    Ok((data, parsed, &payload[..header.tsdu_length as usize]))
}

/// ODATA and selective RDATA: insert at the packet's sequence number,
/// opening NAK placeholders for any gap it reveals
pub(crate) async fn on_data(ctx: &TransportCtx, peer: &Arc<Peer>, header: &PgmHeader, body: &[u8]) {
    let is_rdata = header.typ == PacketType::Rdata;

    if is_rdata && header.has_option(flags::OPT_PARITY) {
        on_parity_rdata(ctx, peer, header, body).await;
        return;
    }

    let mut inner = peer.inner.lock().await;
    let (data, parsed, payload) = match data_payload(header, body) {
        Ok(x) => x,
        Err(_) => {
            if is_rdata {
                inner.stats.malformed_rdata += 1;
            } else {
                inner.stats.malformed_odata += 1;
            }
            inner.stats.packets_discarded += 1;
            return;
        }
    };
    let fragment = parsed.as_ref().and_then(|p| p.fragment);

    let now = Instant::now();
    let mut draw = nak_backoff_draw(&ctx.config);
    let push = inner.rxw.push_data(
        data.sqn,
        data.trail,
        Bytes::copy_from_slice(payload),
        fragment,
        now,
        &mut draw,
    );
    trace!("{:?} {} -> {:?}", header.typ, data.sqn, push);

    match push {
        RxwPush::Placeholders(_) => {
            // first-time gaps: get the timer onto the earliest back-off
            if let Some(expiry) = inner.rxw.next_backoff_expiry() {
                ctx.timer.reschedule(expiry);
            }
        }
        RxwPush::Duplicate => {
            inner.stats.dup_datas += 1;
            inner.stats.packets_discarded += 1;
        }
        RxwPush::NotInWindow => {
            inner.stats.packets_discarded += 1;
        }
        RxwPush::Appended | RxwPush::Filled => {}
    }

    inner.stats.data_bytes_received += u64::from(header.tsdu_length);
    inner.stats.data_msgs_received += 1;

    if inner.rxw.has_waiting_data() {
        drop(inner);
        ctx.enqueue_waiting(peer);
    }
}

/// parity RDATA: stage the parity block in a missing slot and decode the
/// transmission group once any k of its blocks are on hand
async fn on_parity_rdata(ctx: &TransportCtx, peer: &Arc<Peer>, header: &PgmHeader, body: &[u8]) {
    let mut inner = peer.inner.lock().await;

    let (data, parsed, payload) = match data_payload(header, body) {
        Ok(x) => x,
        Err(_) => {
            inner.stats.malformed_rdata += 1;
            inner.stats.packets_discarded += 1;
            return;
        }
    };

    let Some(codec) = inner.fec.clone() else {
        debug!("parity rdata from {} before its parity parameters are known", peer.tsi);
        inner.stats.malformed_rdata += 1;
        inner.stats.packets_discarded += 1;
        return;
    };
    let shift = inner.tg_sqn_shift;
    let k = codec.group_size() as u32;
    let tg = data.sqn.tg_base(shift);
    let parity_index = data.sqn.tg_index(shift);
    let stripe = parsed.as_ref().and_then(|p| p.fragment_stripe);

    // a re-delivered parity packet must not occupy a second slot
    let already_staged = tg.iter_to(tg.plus(k)).any(|sqn| {
        matches!(
            inner.rxw.peek(sqn),
            Some(e) if e.state == RxwState::HaveParity && e.parity_index == Some(parity_index)
        )
    });
    if already_staged {
        inner.stats.dup_datas += 1;
        inner.stats.packets_discarded += 1;
        return;
    }

    // stage the parity block in the first slot that still needs repair
    let slot = tg
        .iter_to(tg.plus(k))
        .find(|&sqn| {
            !matches!(
                inner.rxw.peek(sqn).map(|e| e.state),
                Some(RxwState::HaveData) | Some(RxwState::HaveParity)
            )
        });
    let now = Instant::now();
    let mut draw = nak_backoff_draw(&ctx.config);
    match slot {
        Some(slot_sqn) => {
            let push = inner.rxw.push_parity(
                slot_sqn,
                parity_index,
                Bytes::copy_from_slice(payload),
                stripe,
                now,
                &mut draw,
            );
            if push == RxwPush::Duplicate || push == RxwPush::NotInWindow {
                inner.stats.packets_discarded += 1;
                return;
            }
        }
        None => {
            // group already complete
            inner.stats.dup_datas += 1;
            inner.stats.packets_discarded += 1;
            return;
        }
    }

    try_decode_group(ctx, &mut inner, &*codec, header, tg, k).await;

    if inner.rxw.has_waiting_data() {
        drop(inner);
        ctx.enqueue_waiting(peer);
    }
}

/// reconstruct the missing originals of a transmission group when enough
/// blocks (data + parity) have arrived
async fn try_decode_group(
    _ctx: &TransportCtx,
    inner: &mut PeerInner,
    codec: &dyn FecCodec,
    header: &PgmHeader,
    tg: Sqn,
    k: u32,
) {
    let is_var_pktlen = header.has_option(flags::OPT_VAR_PKTLEN);
    let is_op_encoded = header.has_option(flags::OPT_PRESENT);

    // collect the group's state
    let mut blocks = Vec::with_capacity(k as usize);
    let mut offsets = Vec::with_capacity(k as usize);
    let mut stripes = Vec::with_capacity(k as usize);
    let mut parity_len = 0usize;
    for sqn in tg.iter_to(tg.plus(k)) {
        match inner.rxw.peek(sqn) {
            Some(entry) if entry.state == RxwState::HaveParity => {
                let payload = entry.payload.as_ref().expect("parity entry carries payload");
                parity_len = parity_len.max(payload.len());
            }
            Some(_) | None => {}
        }
    }
    if parity_len == 0 || (is_var_pktlen && parity_len < 2) {
        return;
    }

    for (i, sqn) in tg.iter_to(tg.plus(k)).enumerate() {
        match inner.rxw.peek(sqn) {
            Some(entry) if entry.state == RxwState::HaveData => {
                let payload = entry.payload.as_ref().expect("data entry carries payload");
                if !is_var_pktlen && payload.len() != parity_len {
                    warn!("variable tsdu length in group {} without OPT_VAR_PKTLEN", tg);
                    return;
                }
                if is_var_pktlen && payload.len() > parity_len - 2 {
                    warn!("tsdu in group {} longer than the parity block", tg);
                    return;
                }
                // reconstruct the sender's block representation: zero-pad,
                // true length in the trailing word when variable
                let mut block = payload.to_vec();
                let true_len = block.len() as u16;
                block.resize(parity_len, 0);
                if is_var_pktlen {
                    block[parity_len - 2..].copy_from_slice(&true_len.to_be_bytes());
                }
                blocks.push(block);
                offsets.push(i);
                stripes.push(
                    entry
                        .fragment
                        .as_ref()
                        .map(|f| f.to_stripe())
                        .unwrap_or_else(OptFragment::null_stripe),
                );
            }
            Some(entry) if entry.state == RxwState::HaveParity => {
                let payload = entry.payload.as_ref().expect("parity entry carries payload");
                let mut block = payload.to_vec();
                block.resize(parity_len, 0);
                blocks.push(block);
                offsets.push(k as usize + entry.parity_index.unwrap_or(0) as usize);
                stripes.push(entry.fragment_stripe.unwrap_or_else(OptFragment::null_stripe));
            }
            _ => {
                trace!("transmission group {} incomplete, awaiting further repair", tg);
                return;
            }
        }
    }

    // GF(2^8) has 255 code positions, and a repeated position would hand
    // the decoder a singular matrix
    if offsets.iter().any(|&offset| offset >= 255) {
        return;
    }
    for (i, &offset) in offsets.iter().enumerate() {
        if offsets[..i].contains(&offset) {
            return;
        }
    }

    codec.decode(&mut blocks, &offsets);
    if is_op_encoded {
        let mut stripe_blocks = stripes.iter().map(|s| s.to_vec()).collect::<Vec<_>>();
        codec.decode(&mut stripe_blocks, &offsets);
        for (stripe, decoded) in stripes.iter_mut().zip(&stripe_blocks) {
            stripe.copy_from_slice(decoded);
        }
    }

    // install the reconstructed packets as repairs
    for (i, sqn) in tg.iter_to(tg.plus(k)).enumerate() {
        if offsets[i] < k as usize {
            continue;
        }
        let block = &blocks[i];
        let payload = if is_var_pktlen {
            let true_len =
                u16::from_be_bytes([block[parity_len - 2], block[parity_len - 1]]) as usize;
            if true_len > parity_len - 2 {
                warn!("reconstructed block {} carries invalid length {}", sqn, true_len);
                inner.stats.malformed_rdata += 1;
                continue;
            }
            Bytes::copy_from_slice(&block[..true_len])
        } else {
            Bytes::copy_from_slice(block)
        };

        let fragment = if is_op_encoded {
            OptFragment::from_stripe(&stripes[i])
        } else {
            None
        };

        let len = payload.len() as u64;
        if inner.rxw.push_repair(sqn, payload, fragment) == RxwPush::Filled {
            inner.stats.data_bytes_received += len;
            inner.stats.data_msgs_received += 1;
            trace!("reconstructed {} from parity", sqn);
        }
    }
}

/// NCF: the source (or a designated local repairer) confirmed a NAK; stop
/// repeating ours and wait for the repair data
pub(crate) async fn on_ncf(ctx: &TransportCtx, peer: &Arc<Peer>, header: &PgmHeader, body: &[u8]) {
    let mut inner = peer.inner.lock().await;

    let mut buf = body;
    let ncf = match NakBody::deser(&mut buf) {
        Ok(ncf) => ncf,
        Err(_) => {
            inner.stats.malformed_ncfs += 1;
            inner.stats.packets_discarded += 1;
            return;
        }
    };

    if ncf.grp_nla != ctx.group_addr.ip() {
        trace!("ncf for a different multicast group - discarding");
        inner.stats.packets_discarded += 1;
        return;
    }

    let mut sqn_list = vec![ncf.sqn];
    if header.has_option(flags::OPT_PRESENT) {
        match options::parse(buf) {
            Ok(parsed) => sqn_list.extend(parsed.nak_list),
            Err(_) => {
                inner.stats.malformed_ncfs += 1;
                inner.stats.packets_discarded += 1;
                return;
            }
        }
    }

    apply_ncf(ctx, &mut inner, header, &sqn_list).await;
}

/// a NAK from another receiver on the segment doubles as an NCF: suppress
/// our own pending NAKs for the same numbers
pub(crate) async fn on_peer_nak(
    ctx: &TransportCtx,
    peer: &Arc<Peer>,
    header: &PgmHeader,
    body: &[u8],
) {
    let mut inner = peer.inner.lock().await;

    let mut buf = body;
    let nak = match NakBody::deser(&mut buf) {
        Ok(nak) => nak,
        Err(_) => {
            inner.stats.nak_errors += 1;
            inner.stats.packets_discarded += 1;
            return;
        }
    };

    if nak.grp_nla != ctx.group_addr.ip() {
        trace!("peer nak for a different multicast group - discarding");
        inner.stats.packets_discarded += 1;
        return;
    }

    let mut sqn_list = vec![nak.sqn];
    if header.has_option(flags::OPT_PRESENT) {
        if let Ok(parsed) = options::parse(buf) {
            sqn_list.extend(parsed.nak_list);
        }
    }

    inner.stats.naks_suppressed += sqn_list.len() as u64;
    apply_ncf(ctx, &mut inner, header, &sqn_list).await;
}

async fn apply_ncf(ctx: &TransportCtx, inner: &mut PeerInner, header: &PgmHeader, sqn_list: &[Sqn]) {
    let now = Instant::now();
    let rdata_expiry = now + ctx.config.nak_rdata_ivl;
    let mut draw = nak_backoff_draw(&ctx.config);

    if header.has_option(flags::OPT_PARITY) && inner.rs_k > 0 {
        // a parity confirmation covers every outstanding hole of the group
        let k = u32::from(inner.rs_k);
        let shift = inner.tg_sqn_shift;
        for &sqn in sqn_list {
            let tg = sqn.tg_base(shift);
            for member in tg.iter_to(tg.plus(k)) {
                if matches!(
                    inner.rxw.peek(member).map(|e| e.state),
                    Some(RxwState::BackOff) | Some(RxwState::WaitNcf) | Some(RxwState::WaitData)
                ) {
                    inner.rxw.ncf(member, rdata_expiry, now, &mut draw);
                }
            }
        }
    } else {
        for &sqn in sqn_list {
            inner.rxw.ncf(sqn, rdata_expiry, now, &mut draw);
        }
    }
}

/// walk all peers, firing due NAK state transitions, SPM requests and peer
/// expiry; called from the timer engine
pub(crate) async fn check_peer_nak_state(ctx: &TransportCtx, now: Instant) {
    let peers = {
        let peers = ctx.peers.read().await;
        peers.iter().map(|(tsi, peer)| (*tsi, peer.clone())).collect::<Vec<_>>()
    };

    let mut expired_peers: Vec<Tsi> = Vec::new();

    for (tsi, peer) in &peers {
        let mut inner = peer.inner.lock().await;

        if let Some(spmr) = inner.spmr_expiry {
            if now >= spmr {
                if ctx.config.is_passive {
                    inner.spmr_expiry = None;
                } else {
                    send_spmr(ctx, &mut inner, *tsi).await;
                }
            }
        }

        nak_backoff_state(ctx, &mut inner, *tsi, now).await;
        nak_repeat_state(ctx, &mut inner, now).await;
        nak_rdata_state(ctx, &mut inner, now).await;

        if now >= inner.expiry {
            info!("peer expired, tsi {}", tsi);
            expired_peers.push(*tsi);
        }

        if inner.rxw.has_waiting_data() {
            drop(inner);
            ctx.enqueue_waiting(peer);
        }
    }

    if !expired_peers.is_empty() {
        let mut peers = ctx.peers.write().await;
        for tsi in expired_peers {
            peers.remove(&tsi);
        }
    }
}

/// BACK_OFF expiry: batch due sequence numbers into as few NAKs as
/// possible and move them to WAIT_NCF
async fn nak_backoff_state(ctx: &TransportCtx, inner: &mut PeerInner, tsi: Tsi, now: Instant) {
    let due = inner.rxw.take_expired_backoff(now);
    if due.is_empty() {
        return;
    }

    let valid_nla = inner.nla.is_some();
    if !valid_nla {
        // cannot NAK a source whose unicast address we never learned
        let mut dropped = 0;
        for sqn in due {
            inner.rxw.mark_lost(sqn);
            dropped += 1;
        }
        warn!("dropped {} messages due to invalid NLA", dropped);
        return;
    }

    let rpt_expiry = now + ctx.config.nak_rpt_ivl;

    if inner.use_ondemand_parity && inner.rs_k > 0 {
        // one parity NAK per transmission group, asking for as many parity
        // packets as there are holes
        let shift = inner.tg_sqn_shift;
        let mut groups: Vec<(Sqn, u32)> = Vec::new();
        for &sqn in &due {
            let tg = sqn.tg_base(shift);
            match groups.iter_mut().find(|(base, _)| *base == tg) {
                Some((_, count)) => *count += 1,
                None => groups.push((tg, 1)),
            }
        }
        for (tg, count) in groups {
            if !ctx.config.is_passive {
                send_parity_nak(ctx, inner, tsi, tg, count).await;
            }
        }
        for sqn in due {
            inner.rxw.to_wait_ncf(sqn, rpt_expiry);
        }
        return;
    }

    for batch in due.chunks(1 + MAX_NAK_LIST_SQNS) {
        if !ctx.config.is_passive {
            send_nak(ctx, inner, tsi, batch).await;
        }
        for &sqn in batch {
            inner.rxw.to_wait_ncf(sqn, rpt_expiry);
        }
    }
}

/// WAIT_NCF expiry: retry into BACK_OFF until `nak_ncf_retries` is spent,
/// then seal the hole
async fn nak_repeat_state(ctx: &TransportCtx, inner: &mut PeerInner, now: Instant) {
    let due = inner.rxw.take_expired_wait_ncf(now);
    if due.is_empty() {
        return;
    }

    let valid_nla = inner.nla.is_some();
    let mut draw = nak_backoff_draw(&ctx.config);
    let mut dropped = 0;
    for sqn in due {
        if !valid_nla {
            inner.rxw.mark_lost(sqn);
            dropped += 1;
            continue;
        }
        if inner.rxw.bump_ncf_retry(sqn) > ctx.config.nak_ncf_retries {
            if let Some((_, _, t0)) = inner.rxw.entry_counts(sqn) {
                inner.record_fail_time(t0, now);
            }
            debug!("lost data {} due to ncf cancellation", sqn);
            inner.rxw.mark_lost(sqn);
            inner.stats.naks_failed_ncf_retries_exceeded += 1;
        } else {
            inner.rxw.retry_backoff(sqn, now + draw());
        }
    }
    if dropped > 0 {
        warn!("dropped {} messages due to invalid NLA", dropped);
    }
}

/// WAIT_DATA expiry: the confirmed repair never came; retry into BACK_OFF
/// until `nak_data_retries` is spent, then seal the hole
async fn nak_rdata_state(ctx: &TransportCtx, inner: &mut PeerInner, now: Instant) {
    let due = inner.rxw.take_expired_wait_data(now);
    if due.is_empty() {
        return;
    }

    let valid_nla = inner.nla.is_some();
    let mut draw = nak_backoff_draw(&ctx.config);
    let mut dropped = 0;
    for sqn in due {
        if !valid_nla {
            inner.rxw.mark_lost(sqn);
            dropped += 1;
            continue;
        }
        if inner.rxw.bump_data_retry(sqn) > ctx.config.nak_data_retries {
            if let Some((_, _, t0)) = inner.rxw.entry_counts(sqn) {
                inner.record_fail_time(t0, now);
            }
            debug!("lost data {} due to data cancellation", sqn);
            inner.rxw.mark_lost(sqn);
            inner.stats.naks_failed_data_retries_exceeded += 1;
        } else {
            inner.rxw.retry_backoff(sqn, now + draw());
        }
    }
    if dropped > 0 {
        warn!("dropped {} messages due to invalid NLA", dropped);
    }
}

/// unicast a selective NAK to the source; a batch travels as OPT_NAK_LIST
async fn send_nak(ctx: &TransportCtx, inner: &mut PeerInner, tsi: Tsi, sqns: &[Sqn]) {
    debug_assert!(!sqns.is_empty() && sqns.len() <= 1 + MAX_NAK_LIST_SQNS);
    let Some(nla) = inner.nla else { return };

    // sport and dport swap over for upstream traffic
    let mut header = PgmHeader::new(PacketType::Nak, ctx.tsi.gsi, ctx.dport, tsi.sport);
    if sqns.len() > 1 {
        header.options = flags::OPT_PRESENT | flags::OPT_NETWORK;
    }

    let mut tpdu = Vec::with_capacity(64 + 4 * sqns.len());
    header.ser(&mut tpdu);
    NakBody {
        sqn: sqns[0],
        src_nla: nla,
        grp_nla: inner.group_nla.unwrap_or_else(|| ctx.group_addr.ip()),
    }
    .ser(&mut tpdu);
    if sqns.len() > 1 {
        OptionsBuilder::new().nak_list(&sqns[1..]).build(&mut tpdu);
    }
    packet_header::finalize_checksum(&mut tpdu);

    let to = SocketAddr::new(nla, ctx.dport);
    // single NAKs ride the router-alert lane so DLRs can intercept them
    let router_alert = sqns.len() == 1;
    trace!("nak to {:?} for {} sequence numbers", to, sqns.len());
    if ctx.pipeline.send(&tpdu, to, false, router_alert, false).await.is_ok() {
        inner.stats.selective_nak_packets_sent += 1;
        inner.stats.selective_naks_sent += sqns.len() as u64;
    }
}

/// one NAK per transmission group requesting `count` parity packets
async fn send_parity_nak(ctx: &TransportCtx, inner: &mut PeerInner, tsi: Tsi, tg: Sqn, count: u32) {
    let Some(nla) = inner.nla else { return };
    let count = count.min(u32::from(inner.rs_k));

    let mut header = PgmHeader::new(PacketType::Nak, ctx.tsi.gsi, ctx.dport, tsi.sport);
    header.options = flags::OPT_PARITY;

    let mut tpdu = Vec::with_capacity(64);
    header.ser(&mut tpdu);
    NakBody {
        sqn: tg.plus(count - 1),
        src_nla: nla,
        grp_nla: inner.group_nla.unwrap_or_else(|| ctx.group_addr.ip()),
    }
    .ser(&mut tpdu);
    packet_header::finalize_checksum(&mut tpdu);

    let to = SocketAddr::new(nla, ctx.dport);
    trace!("parity nak to {:?} for group {} x{}", to, tg, count);
    if ctx.pipeline.send(&tpdu, to, false, true, false).await.is_ok() {
        inner.stats.parity_nak_packets_sent += 1;
        inner.stats.parity_naks_sent += u64::from(count);
    }
}

/// solicit an SPM: multicast to the group (so sibling receivers squelch
/// their own) and unicast to where the source's traffic came from
async fn send_spmr(ctx: &TransportCtx, inner: &mut PeerInner, tsi: Tsi) {
    let header = PgmHeader::new(PacketType::Spmr, ctx.tsi.gsi, ctx.dport, tsi.sport);
    let mut tpdu = Vec::with_capacity(16);
    header.ser(&mut tpdu);
    packet_header::finalize_checksum(&mut tpdu);

    trace!("spmr for {}", tsi);
    let _ = ctx.pipeline.send(&tpdu, ctx.group_addr, false, false, false).await;
    let _ = ctx
        .pipeline
        .send(&tpdu, inner.local_nla, false, false, false)
        .await;

    inner.stats.spmrs_sent += 1;
    inner.spmr_expiry = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_draw_spread_is_uniform() {
        let mut config = TransportConfig::default();
        config.nak_bo_ivl = Duration::from_millis(10);
        let mut draw = nak_backoff_draw(&config);

        const SAMPLES: usize = 10_000;
        let mut bins = [0usize; 10];
        for _ in 0..SAMPLES {
            let value = draw();
            assert!(value >= Duration::from_micros(1));
            assert!(value < config.nak_bo_ivl);
            let bin = (value.as_micros() as usize) / 1000;
            bins[bin.min(9)] += 1;
        }

        // coarse chi-square style bound: each millisecond bucket within
        // thirty percent of the uniform expectation
        let expected = SAMPLES / bins.len();
        for (i, &count) in bins.iter().enumerate() {
            assert!(
                count > expected * 7 / 10 && count < expected * 13 / 10,
                "bin {} holds {} samples, expected about {}",
                i,
                count,
                expected
            );
        }
    }
}
