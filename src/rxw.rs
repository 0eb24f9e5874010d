//! Receive window: ordered reassembly of out-of-order, lossy, fragmented
//! arrivals, carrying the per-packet NAK state machine.
//!
//! Every sequence number between trail and lead owns a slot. A slot holding
//! payload is `HaveData`/`HaveParity`; a gap discovered by a forward jump
//! becomes a placeholder cycling through `BackOff -> WaitNcf -> WaitData`
//! until repair data arrives or retries are exhausted (`Lost`).
//!
//! The per-state queues hold sequence numbers in insertion order, which is
//! expiry order for the fixed NCF/RDATA intervals; entries whose state moved
//! on are skipped when popped rather than unlinked eagerly.

use crate::options::{OptFragment, FRAGMENT_STRIPE_LEN};
use crate::sqn::Sqn;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RxwState {
    BackOff,
    WaitNcf,
    WaitData,
    HaveData,
    HaveParity,
    Lost,
}

#[derive(Debug)]
pub struct RxwEntry {
    pub sqn: Sqn,
    pub state: RxwState,
    pub payload: Option<Bytes>,
    pub fragment: Option<OptFragment>,
    /// raw fragment option stripe, kept on parity entries for decoding
    pub fragment_stripe: Option<[u8; FRAGMENT_STRIPE_LEN]>,
    /// parity symbol index for `HaveParity`
    pub parity_index: Option<u32>,
    pub nak_rb_expiry: Instant,
    pub nak_rpt_expiry: Instant,
    pub nak_rdata_expiry: Instant,
    /// arrival of the gap, for failure-time accounting
    pub t0: Instant,
    pub nak_transmit_count: u32,
    pub ncf_retry_count: u32,
    pub data_retry_count: u32,
}

impl RxwEntry {
    fn new(sqn: Sqn, state: RxwState, now: Instant) -> RxwEntry {
        RxwEntry {
            sqn,
            state,
            payload: None,
            fragment: None,
            fragment_stripe: None,
            parity_index: None,
            nak_rb_expiry: now,
            nak_rpt_expiry: now,
            nak_rdata_expiry: now,
            t0: now,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RxwPush {
    /// in-order arrival, window advanced without gaps
    Appended,
    /// filled an outstanding placeholder
    Filled,
    /// forward jump created this many placeholders, all pending NAK
    Placeholders(u32),
    Duplicate,
    NotInWindow,
}

pub struct ReceiveWindow {
    slots: Vec<Option<RxwEntry>>,
    defined: bool,
    trail: Sqn,
    lead: Sqn,
    backoff_queue: VecDeque<Sqn>,
    wait_ncf_queue: VecDeque<Sqn>,
    wait_data_queue: VecDeque<Sqn>,
    /// contiguous committed data (or a sealed gap) is waiting at the trail
    is_waiting: bool,
    pub lost_count: u64,
    pub committed_count: u64,
}

impl ReceiveWindow {
    pub fn new(rxw_sqns: u32) -> ReceiveWindow {
        assert!(rxw_sqns > 0);
        let mut slots = Vec::with_capacity(rxw_sqns as usize);
        slots.resize_with(rxw_sqns as usize, || None);
        ReceiveWindow {
            slots,
            defined: false,
            trail: Sqn::ZERO,
            lead: Sqn::ZERO,
            backoff_queue: VecDeque::new(),
            wait_ncf_queue: VecDeque::new(),
            wait_data_queue: VecDeque::new(),
            is_waiting: false,
            lost_count: 0,
            committed_count: 0,
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot_index(&self, sqn: Sqn) -> usize {
        sqn.to_raw() as usize % self.slots.len()
    }

    pub fn peek(&self, sqn: Sqn) -> Option<&RxwEntry> {
        let entry = self.slots[self.slot_index(sqn)].as_ref()?;
        if entry.sqn == sqn {
            Some(entry)
        } else {
            None
        }
    }

    fn entry_mut(&mut self, sqn: Sqn) -> Option<&mut RxwEntry> {
        let index = self.slot_index(sqn);
        match self.slots[index].as_mut() {
            Some(entry) if entry.sqn == sqn => Some(entry),
            _ => None,
        }
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        self.defined
            && sqn.is_after_eq(self.trail)
            && sqn.distance_from(self.trail) < self.capacity()
    }

    fn define_at(&mut self, sqn: Sqn) {
        self.defined = true;
        self.trail = sqn;
        self.lead = sqn.prev();
        trace!("window defined at {}", sqn);
    }

    /// create BACK_OFF placeholders for `(lead, up_to)`, each with an
    /// independent random back-off expiry drawn from `draw`
    fn fill_gap(
        &mut self,
        up_to: Sqn,
        now: Instant,
        draw: &mut dyn FnMut() -> Duration,
    ) -> u32 {
        let mut created = 0;
        for sqn in self.lead.next().iter_to(up_to) {
            let mut entry = RxwEntry::new(sqn, RxwState::BackOff, now);
            entry.nak_rb_expiry = now + draw();
            let index = self.slot_index(sqn);
            self.slots[index] = Some(entry);
            self.backoff_queue.push_back(sqn);
            created += 1;
        }
        if created > 0 {
            trace!("created {} placeholders up to {}", created, up_to);
        }
        created
    }

    /// mark entries the source can no longer repair (below its advertised
    /// trail) as lost
    fn advance_trail(&mut self, advertised_trail: Sqn) -> u32 {
        if !self.defined || !advertised_trail.is_after(self.trail) {
            return 0;
        }
        let mut sealed = 0;
        for sqn in self.trail.iter_to(advertised_trail) {
            if !self.lead.is_after_eq(sqn) {
                break;
            }
            if let Some(entry) = self.entry_mut(sqn) {
                if !matches!(entry.state, RxwState::HaveData | RxwState::Lost) {
                    entry.state = RxwState::Lost;
                    entry.payload = None;
                    sealed += 1;
                }
            }
        }
        if sealed > 0 {
            debug!("sealed {} holes below advertised trail {}", sealed, advertised_trail);
            self.lost_count += u64::from(sealed);
            self.update_waiting();
        }
        sealed
    }

    /// insert original or selective-repair payload at `sqn`
    pub fn push_data(
        &mut self,
        sqn: Sqn,
        advertised_trail: Sqn,
        payload: Bytes,
        fragment: Option<OptFragment>,
        now: Instant,
        draw: &mut dyn FnMut() -> Duration,
    ) -> RxwPush {
        if !self.defined {
            self.define_at(sqn);
        }

        self.advance_trail(advertised_trail);

        if !self.in_window(sqn) {
            return RxwPush::NotInWindow;
        }

        let result = if sqn.is_after(self.lead) {
            let placeholders = self.fill_gap(sqn, now, draw);
            let mut entry = RxwEntry::new(sqn, RxwState::HaveData, now);
            entry.payload = Some(payload);
            entry.fragment = fragment;
            let index = self.slot_index(sqn);
            self.slots[index] = Some(entry);
            self.lead = sqn;
            if placeholders > 0 {
                RxwPush::Placeholders(placeholders)
            } else {
                RxwPush::Appended
            }
        } else {
            match self.entry_mut(sqn) {
                Some(entry) => match entry.state {
                    RxwState::HaveData | RxwState::HaveParity => RxwPush::Duplicate,
                    RxwState::Lost => RxwPush::Duplicate,
                    _ => {
                        entry.state = RxwState::HaveData;
                        entry.payload = Some(payload);
                        entry.fragment = fragment;
                        RxwPush::Filled
                    }
                },
                None => {
                    // below the trail the slot has been released already
                    RxwPush::NotInWindow
                }
            }
        };

        self.update_waiting();
        result
    }

    /// store a parity packet in the slot of a missing original
    pub fn push_parity(
        &mut self,
        slot_sqn: Sqn,
        parity_index: u32,
        payload: Bytes,
        stripe: Option<[u8; FRAGMENT_STRIPE_LEN]>,
        now: Instant,
        draw: &mut dyn FnMut() -> Duration,
    ) -> RxwPush {
        if !self.defined {
            self.define_at(slot_sqn);
        }
        if !self.in_window(slot_sqn) {
            return RxwPush::NotInWindow;
        }

        if slot_sqn.is_after(self.lead) {
            // the placeholder created for slot_sqn itself is overwritten below
            self.fill_gap(slot_sqn.next(), now, draw);
            self.lead = slot_sqn;
        }

        match self.entry_mut(slot_sqn) {
            Some(entry) => match entry.state {
                RxwState::HaveData | RxwState::HaveParity => RxwPush::Duplicate,
                _ => {
                    entry.state = RxwState::HaveParity;
                    entry.payload = Some(payload);
                    entry.parity_index = Some(parity_index);
                    entry.fragment_stripe = stripe;
                    RxwPush::Filled
                }
            },
            None => RxwPush::NotInWindow,
        }
    }

    /// install a reconstructed original produced by the FEC decode path
    pub fn push_repair(&mut self, sqn: Sqn, payload: Bytes, fragment: Option<OptFragment>) -> RxwPush {
        let result = match self.entry_mut(sqn) {
            Some(entry) => match entry.state {
                RxwState::HaveData => RxwPush::Duplicate,
                _ => {
                    entry.state = RxwState::HaveData;
                    entry.payload = Some(payload);
                    entry.fragment = fragment;
                    entry.parity_index = None;
                    entry.fragment_stripe = None;
                    RxwPush::Filled
                }
            },
            None => RxwPush::NotInWindow,
        };
        self.update_waiting();
        result
    }

    /// SPM window advertisement: open placeholders up to the advertised lead
    /// and seal holes below the advertised trail. returns placeholders created.
    pub fn window_update(
        &mut self,
        advertised_trail: Sqn,
        advertised_lead: Sqn,
        now: Instant,
        draw: &mut dyn FnMut() -> Duration,
    ) -> u32 {
        if !self.defined {
            // join the session at the advertised lead; earlier data is not
            // recoverable for a fresh window
            self.defined = true;
            self.trail = advertised_lead.next();
            self.lead = advertised_lead;
            return 0;
        }

        let mut created = 0;
        if advertised_lead.is_after(self.lead)
            && advertised_lead.distance_from(self.trail) < self.capacity()
        {
            created = self.fill_gap(advertised_lead.next(), now, draw);
            self.lead = advertised_lead;
        }
        self.advance_trail(advertised_trail);
        created
    }

    /// NCF or peer-NAK observed for `sqn`: stop our own NAK and wait for
    /// repair data
    pub fn ncf(
        &mut self,
        sqn: Sqn,
        rdata_expiry: Instant,
        now: Instant,
        draw: &mut dyn FnMut() -> Duration,
    ) -> bool {
        if !self.defined {
            self.define_at(sqn);
        }
        if !self.in_window(sqn) {
            return false;
        }

        if sqn.is_after(self.lead) {
            self.fill_gap(sqn.next(), now, draw);
            self.lead = sqn;
        }

        match self.entry_mut(sqn) {
            Some(entry) => match entry.state {
                RxwState::BackOff | RxwState::WaitNcf => {
                    entry.state = RxwState::WaitData;
                    entry.nak_rdata_expiry = rdata_expiry;
                    let sqn = entry.sqn;
                    self.wait_data_queue.push_back(sqn);
                    true
                }
                // already waiting for repair data; a repeated NCF must not
                // keep pushing the deadline out
                RxwState::WaitData => true,
                _ => false,
            },
            None => false,
        }
    }

    /// hole sealed; the reader will skip it
    pub fn mark_lost(&mut self, sqn: Sqn) {
        if let Some(entry) = self.entry_mut(sqn) {
            if entry.state != RxwState::Lost {
                entry.state = RxwState::Lost;
                entry.payload = None;
                self.lost_count += 1;
            }
        }
        self.update_waiting();
    }

    /// move an entry back into BACK_OFF for the next NAK round
    pub fn retry_backoff(&mut self, sqn: Sqn, rb_expiry: Instant) {
        if let Some(entry) = self.entry_mut(sqn) {
            entry.state = RxwState::BackOff;
            entry.nak_rb_expiry = rb_expiry;
            self.backoff_queue.push_back(sqn);
        }
    }

    /// NAK sent for this entry; now waiting for the NCF
    pub fn to_wait_ncf(&mut self, sqn: Sqn, rpt_expiry: Instant) {
        if let Some(entry) = self.entry_mut(sqn) {
            entry.state = RxwState::WaitNcf;
            entry.nak_transmit_count += 1;
            entry.nak_rpt_expiry = rpt_expiry;
            self.wait_ncf_queue.push_back(sqn);
        }
    }

    fn clean_queue_front(&mut self, queue: fn(&mut Self) -> &mut VecDeque<Sqn>, state: RxwState) {
        loop {
            let front = match queue(self).front() {
                Some(&sqn) => sqn,
                None => return,
            };
            let live = matches!(self.peek(front), Some(entry) if entry.state == state);
            if live {
                return;
            }
            queue(self).pop_front();
        }
    }

    pub fn next_backoff_expiry(&mut self) -> Option<Instant> {
        self.clean_queue_front(|w| &mut w.backoff_queue, RxwState::BackOff);
        let sqn = *self.backoff_queue.front()?;
        self.peek(sqn).map(|e| e.nak_rb_expiry)
    }

    pub fn next_wait_ncf_expiry(&mut self) -> Option<Instant> {
        self.clean_queue_front(|w| &mut w.wait_ncf_queue, RxwState::WaitNcf);
        let sqn = *self.wait_ncf_queue.front()?;
        self.peek(sqn).map(|e| e.nak_rpt_expiry)
    }

    pub fn next_wait_data_expiry(&mut self) -> Option<Instant> {
        self.clean_queue_front(|w| &mut w.wait_data_queue, RxwState::WaitData);
        let sqn = *self.wait_data_queue.front()?;
        self.peek(sqn).map(|e| e.nak_rdata_expiry)
    }

    fn take_expired(
        &mut self,
        queue: fn(&mut Self) -> &mut VecDeque<Sqn>,
        state: RxwState,
        expiry: fn(&RxwEntry) -> Instant,
        now: Instant,
    ) -> Vec<Sqn> {
        let mut expired = Vec::new();
        loop {
            self.clean_queue_front(queue, state);
            let front = match queue(self).front() {
                Some(&sqn) => sqn,
                None => break,
            };
            let is_due = self
                .peek(front)
                .map(|e| expiry(e) <= now)
                .unwrap_or(false);
            if !is_due {
                break;
            }
            queue(self).pop_front();
            // an entry that re-entered the state leaves an older queue
            // position behind; deliver each sequence number once
            if !expired.contains(&front) {
                expired.push(front);
            }
        }
        expired
    }

    pub fn take_expired_backoff(&mut self, now: Instant) -> Vec<Sqn> {
        self.take_expired(|w| &mut w.backoff_queue, RxwState::BackOff, |e| e.nak_rb_expiry, now)
    }

    pub fn take_expired_wait_ncf(&mut self, now: Instant) -> Vec<Sqn> {
        self.take_expired(|w| &mut w.wait_ncf_queue, RxwState::WaitNcf, |e| e.nak_rpt_expiry, now)
    }

    pub fn take_expired_wait_data(&mut self, now: Instant) -> Vec<Sqn> {
        self.take_expired(|w| &mut w.wait_data_queue, RxwState::WaitData, |e| e.nak_rdata_expiry, now)
    }

    pub fn entry_counts(&mut self, sqn: Sqn) -> Option<(u32, u32, Instant)> {
        self.entry_mut(sqn)
            .map(|e| (e.ncf_retry_count, e.data_retry_count, e.t0))
    }

    pub fn bump_ncf_retry(&mut self, sqn: Sqn) -> u32 {
        match self.entry_mut(sqn) {
            Some(entry) => {
                entry.ncf_retry_count += 1;
                entry.ncf_retry_count
            }
            None => 0,
        }
    }

    pub fn bump_data_retry(&mut self, sqn: Sqn) -> u32 {
        match self.entry_mut(sqn) {
            Some(entry) => {
                entry.data_retry_count += 1;
                entry.data_retry_count
            }
            None => 0,
        }
    }

    fn update_waiting(&mut self) {
        self.is_waiting = matches!(
            self.peek(self.trail),
            Some(entry) if matches!(entry.state, RxwState::HaveData | RxwState::Lost)
        );
    }

    /// contiguous committed data or a sealed gap is available at the trail
    pub fn has_waiting_data(&self) -> bool {
        self.is_waiting
    }

    fn release(&mut self, sqn: Sqn) {
        let index = self.slot_index(sqn);
        self.slots[index] = None;
    }

    /// drain contiguous committed payload from the trail as zero-copy
    /// scatter/gather slices, silently skipping sealed holes. APDUs commit
    /// only when complete; an APDU containing a lost fragment is dropped
    /// whole. returns the slices and the count of lost APDUs encountered.
    pub fn read(&mut self) -> (Vec<Bytes>, u64) {
        let mut out = Vec::new();
        let mut apdus_lost = 0u64;

        'outer: while self.defined && self.lead.is_after_eq(self.trail) {
            let (state, fragment) = match self.peek(self.trail) {
                Some(entry) => (entry.state, entry.fragment),
                None => break,
            };

            match state {
                RxwState::Lost => {
                    self.release(self.trail);
                    self.trail = self.trail.next();
                }
                RxwState::HaveData => match fragment {
                    None => {
                        let payload = self
                            .entry_mut(self.trail)
                            .and_then(|e| e.payload.clone())
                            .expect("HaveData entry carries payload");
                        out.push(payload);
                        self.release(self.trail);
                        self.trail = self.trail.next();
                        self.committed_count += 1;
                    }
                    Some(fragment) => {
                        if fragment.first_sqn != self.trail {
                            // head of this apdu fell below the window; the
                            // tail fragments cannot be delivered
                            warn!(
                                "orphan fragment {} of apdu starting at {} - dropping",
                                self.trail, fragment.first_sqn
                            );
                            self.release(self.trail);
                            self.trail = self.trail.next();
                            apdus_lost += 1;
                            continue;
                        }

                        // walk the fragments of this apdu
                        let mut accumulated = 0u32;
                        let mut members = Vec::new();
                        let mut sqn = self.trail;
                        loop {
                            let entry = match self.peek(sqn) {
                                Some(entry) => entry,
                                None => break 'outer, // gap not yet discovered
                            };
                            match entry.state {
                                RxwState::HaveData => {
                                    let payload = entry.payload.clone().expect("payload present");
                                    accumulated += payload.len() as u32;
                                    members.push(payload);
                                }
                                RxwState::Lost => {
                                    // drop the whole apdu: everything up to and
                                    // including this sealed hole is released
                                    for drop_sqn in self.trail.iter_to(sqn.next()) {
                                        self.release(drop_sqn);
                                    }
                                    self.trail = sqn.next();
                                    apdus_lost += 1;
                                    continue 'outer;
                                }
                                _ => break 'outer, // repair still pending
                            }
                            if accumulated >= fragment.apdu_len {
                                break;
                            }
                            sqn = sqn.next();
                        }

                        if accumulated != fragment.apdu_len {
                            warn!(
                                "apdu at {} reassembled to {} bytes, header said {} - dropping",
                                self.trail, accumulated, fragment.apdu_len
                            );
                            for drop_sqn in self.trail.iter_to(sqn.next()) {
                                self.release(drop_sqn);
                            }
                            self.trail = sqn.next();
                            apdus_lost += 1;
                            continue;
                        }

                        out.extend(members);
                        for drop_sqn in self.trail.iter_to(sqn.next()) {
                            self.release(drop_sqn);
                        }
                        self.trail = sqn.next();
                        self.committed_count += 1;
                    }
                },
                _ => break, // gap pending repair
            }
        }

        self.update_waiting();
        (out, apdus_lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    fn fixed_draw() -> impl FnMut() -> Duration {
        || Duration::from_millis(10)
    }

    fn push_simple(rxw: &mut ReceiveWindow, sqn: u32, payload: &[u8]) -> RxwPush {
        rxw.push_data(
            Sqn::from_raw(sqn),
            Sqn::from_raw(0),
            Bytes::copy_from_slice(payload),
            None,
            now(),
            &mut fixed_draw(),
        )
    }

    #[test]
    fn test_in_order_append_and_read() {
        let mut rxw = ReceiveWindow::new(16);
        assert_eq!(push_simple(&mut rxw, 0, b"a"), RxwPush::Appended);
        assert_eq!(push_simple(&mut rxw, 1, b"b"), RxwPush::Appended);
        assert!(rxw.has_waiting_data());

        let (data, lost) = rxw.read();
        assert_eq!(data, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(lost, 0);
        assert_eq!(rxw.trail(), Sqn::from_raw(2));
        assert!(!rxw.has_waiting_data());
    }

    #[test]
    fn test_gap_creates_placeholders_and_blocks_read() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        assert_eq!(push_simple(&mut rxw, 3, b"d"), RxwPush::Placeholders(2));

        let (data, _) = rxw.read();
        assert_eq!(data.len(), 1); // only sqn 0, then the gap blocks

        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::BackOff);
        assert_eq!(rxw.peek(Sqn::from_raw(2)).unwrap().state, RxwState::BackOff);

        // filling the gap releases the rest
        assert_eq!(push_simple(&mut rxw, 1, b"b"), RxwPush::Filled);
        assert_eq!(push_simple(&mut rxw, 2, b"c"), RxwPush::Filled);
        let (data, lost) = rxw.read();
        assert_eq!(data.len(), 3);
        assert_eq!(lost, 0);
    }

    #[test]
    fn test_duplicate_counted_not_mutated() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"first");
        assert_eq!(push_simple(&mut rxw, 0, b"second"), RxwPush::Duplicate);

        let (data, _) = rxw.read();
        assert_eq!(data, vec![Bytes::from_static(b"first")]);
    }

    #[test]
    fn test_not_in_window() {
        let mut rxw = ReceiveWindow::new(8);
        push_simple(&mut rxw, 100, b"x");
        let (data, _) = rxw.read();
        assert_eq!(data.len(), 1);

        // below the trail
        assert_eq!(push_simple(&mut rxw, 99, b"old"), RxwPush::NotInWindow);
        // too far ahead of the trail
        assert_eq!(push_simple(&mut rxw, 120, b"far"), RxwPush::NotInWindow);
    }

    #[test]
    fn test_lost_hole_skipped_silently() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 41, b"a");
        push_simple(&mut rxw, 43, b"c");
        rxw.mark_lost(Sqn::from_raw(42));
        assert_eq!(rxw.lost_count, 1);

        let (data, lost) = rxw.read();
        assert_eq!(data, vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);
        assert_eq!(lost, 0); // plain packets, not an apdu
        assert_eq!(rxw.trail(), Sqn::from_raw(44));
    }

    fn fragment(first: u32, offset: u32, total: u32) -> Option<OptFragment> {
        Some(OptFragment {
            first_sqn: Sqn::from_raw(first),
            offset,
            apdu_len: total,
        })
    }

    #[test]
    fn test_apdu_commits_only_when_complete() {
        let mut rxw = ReceiveWindow::new(16);
        rxw.push_data(Sqn::from_raw(0), Sqn::ZERO, Bytes::from_static(b"hello"), fragment(0, 0, 10), now(), &mut fixed_draw());

        let (data, _) = rxw.read();
        assert!(data.is_empty(), "half an apdu must not commit");

        rxw.push_data(Sqn::from_raw(1), Sqn::ZERO, Bytes::from_static(b"world"), fragment(0, 5, 10), now(), &mut fixed_draw());
        let (data, lost) = rxw.read();
        assert_eq!(data, vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
        assert_eq!(lost, 0);
    }

    #[test]
    fn test_apdu_with_lost_fragment_dropped_whole() {
        let mut rxw = ReceiveWindow::new(16);
        rxw.push_data(Sqn::from_raw(0), Sqn::ZERO, Bytes::from_static(b"hello"), fragment(0, 0, 10), now(), &mut fixed_draw());
        // sqn 1 never arrives; sqn 2 starts the next message
        rxw.push_data(Sqn::from_raw(2), Sqn::ZERO, Bytes::from_static(b"next"), None, now(), &mut fixed_draw());
        rxw.mark_lost(Sqn::from_raw(1));

        let (data, apdus_lost) = rxw.read();
        assert_eq!(data, vec![Bytes::from_static(b"next")]);
        assert_eq!(apdus_lost, 1);
        assert_eq!(rxw.trail(), Sqn::from_raw(3));
    }

    #[test]
    fn test_ncf_moves_backoff_to_wait_data() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        push_simple(&mut rxw, 2, b"c");
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::BackOff);

        let t = now();
        assert!(rxw.ncf(Sqn::from_raw(1), t + Duration::from_secs(2), t, &mut fixed_draw()));
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::WaitData);
        assert!(rxw.take_expired_backoff(t + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_ncf_beyond_lead_creates_placeholders() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        let t = now();
        assert!(rxw.ncf(Sqn::from_raw(3), t + Duration::from_secs(2), t, &mut fixed_draw()));
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::BackOff);
        assert_eq!(rxw.peek(Sqn::from_raw(2)).unwrap().state, RxwState::BackOff);
        assert_eq!(rxw.peek(Sqn::from_raw(3)).unwrap().state, RxwState::WaitData);
        assert_eq!(rxw.lead(), Sqn::from_raw(3));
    }

    #[test]
    fn test_backoff_expiry_and_transition_cycle() {
        let mut rxw = ReceiveWindow::new(16);
        let t = now();
        push_simple(&mut rxw, 0, b"a");
        push_simple(&mut rxw, 2, b"c");

        let expiry = rxw.next_backoff_expiry().unwrap();
        assert!(rxw.take_expired_backoff(expiry - Duration::from_millis(1)).is_empty());
        let expired = rxw.take_expired_backoff(expiry);
        assert_eq!(expired, vec![Sqn::from_raw(1)]);

        rxw.to_wait_ncf(Sqn::from_raw(1), t + Duration::from_secs(2));
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().nak_transmit_count, 1);
        assert_eq!(
            rxw.take_expired_wait_ncf(t + Duration::from_secs(2)),
            vec![Sqn::from_raw(1)]
        );

        rxw.retry_backoff(Sqn::from_raw(1), t + Duration::from_millis(30));
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::BackOff);
        assert_eq!(rxw.bump_ncf_retry(Sqn::from_raw(1)), 1);
    }

    #[test]
    fn test_stale_queue_entries_skipped() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        push_simple(&mut rxw, 2, b"c");
        // the placeholder gets data before its back-off fires
        push_simple(&mut rxw, 1, b"b");

        assert_eq!(rxw.next_backoff_expiry(), None);
        assert!(rxw.take_expired_backoff(now() + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_window_update_defines_at_lead() {
        let mut rxw = ReceiveWindow::new(16);
        let created = rxw.window_update(Sqn::from_raw(10), Sqn::from_raw(20), now(), &mut fixed_draw());
        assert_eq!(created, 0);
        assert_eq!(rxw.trail(), Sqn::from_raw(21));

        // data continuing from the advertised lead is in order
        assert_eq!(push_simple(&mut rxw, 21, b"x"), RxwPush::Appended);
    }

    #[test]
    fn test_window_update_opens_gap() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        let created = rxw.window_update(Sqn::from_raw(0), Sqn::from_raw(3), now(), &mut fixed_draw());
        assert_eq!(created, 3);
        assert_eq!(rxw.lead(), Sqn::from_raw(3));
    }

    #[test]
    fn test_advertised_trail_seals_holes() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        push_simple(&mut rxw, 4, b"e");
        // source moved its trail to 3: sqns 1 and 2 are gone for good
        rxw.window_update(Sqn::from_raw(3), Sqn::from_raw(4), now(), &mut fixed_draw());

        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::Lost);
        assert_eq!(rxw.peek(Sqn::from_raw(2)).unwrap().state, RxwState::Lost);
        assert_eq!(rxw.peek(Sqn::from_raw(3)).unwrap().state, RxwState::BackOff);
    }

    #[test]
    fn test_parity_then_repair() {
        let mut rxw = ReceiveWindow::new(16);
        push_simple(&mut rxw, 0, b"a");
        push_simple(&mut rxw, 3, b"d");

        let push = rxw.push_parity(Sqn::from_raw(1), 0, Bytes::from_static(b"pp"), None, now(), &mut fixed_draw());
        assert_eq!(push, RxwPush::Filled);
        assert_eq!(rxw.peek(Sqn::from_raw(1)).unwrap().state, RxwState::HaveParity);

        // the decode path turns parity into data
        assert_eq!(
            rxw.push_repair(Sqn::from_raw(1), Bytes::from_static(b"b"), None),
            RxwPush::Filled
        );
        assert_eq!(
            rxw.push_repair(Sqn::from_raw(2), Bytes::from_static(b"c"), None),
            RxwPush::Filled
        );

        let (data, _) = rxw.read();
        assert_eq!(data.len(), 4);
    }
}
