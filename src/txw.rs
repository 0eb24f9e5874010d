//! Transmit window: a pre-allocated ring of the most recent TPDUs keyed by
//! sequence number, plus the queue of pending retransmit requests feeding
//! the RDATA service.

use crate::error::PgmError;
use crate::options::OptFragment;
use crate::sqn::Sqn;
use std::collections::VecDeque;
use tracing::trace;

pub struct TxwEntry {
    /// complete TPDU as sent, PGM header first
    pub tpdu: Vec<u8>,
    pub tsdu_length: u16,
    /// offset of the TSDU within `tpdu`, past the options chain
    pub payload_offset: usize,
    /// cached unfolded ones-complement sum over the TSDU, so RDATA rebuilds
    /// only re-checksum the header
    pub unfolded_data_csum: u32,
    pub fragment: Option<OptFragment>,
}

impl TxwEntry {
    pub fn payload(&self) -> &[u8] {
        &self.tpdu[self.payload_offset..self.payload_offset + self.tsdu_length as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// requested sequence number; transmission group base for parity
    pub sqn: Sqn,
    pub is_parity: bool,
    /// parity packets requested for the group
    pub requested_count: u32,
    /// next parity index to generate
    pub next_index: u32,
}

/// one dequeued unit of retransmission work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmit {
    pub sqn: Sqn,
    pub is_parity: bool,
    /// parity symbol index `h` when `is_parity`
    pub parity_index: u32,
}

pub struct TransmitWindow {
    slots: Vec<Option<TxwEntry>>,
    trail: Sqn,
    next_lead: Sqn,
    len: u32,
    retransmit_queue: VecDeque<RetransmitRequest>,
}

impl TransmitWindow {
    pub fn new(txw_sqns: u32) -> TransmitWindow {
        assert!(txw_sqns > 0);
        let mut slots = Vec::with_capacity(txw_sqns as usize);
        slots.resize_with(txw_sqns as usize, || None);
        TransmitWindow {
            slots,
            trail: Sqn::ZERO,
            next_lead: Sqn::ZERO,
            len: 0,
            retransmit_queue: VecDeque::new(),
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    /// highest assigned sequence number; equal to `trail - 1` while empty so
    /// that SPM trail/lead advertising stays consistent
    pub fn lead(&self) -> Sqn {
        self.next_lead.prev()
    }

    pub fn next_lead(&self) -> Sqn {
        self.next_lead
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_index(&self, sqn: Sqn) -> usize {
        sqn.to_raw() as usize % self.slots.len()
    }

    /// append at `lead + 1`, evicting the trail entry when full
    pub fn push(&mut self, entry: TxwEntry) -> Sqn {
        if self.len as usize == self.slots.len() {
            let trail_index = self.slot_index(self.trail);
            self.slots[trail_index] = None;
            self.trail = self.trail.next();
            self.len -= 1;
        }

        let sqn = self.next_lead;
        let index = self.slot_index(sqn);
        self.slots[index] = Some(entry);
        self.next_lead = self.next_lead.next();
        self.len += 1;
        sqn
    }

    /// O(1) lookup while `trail <= sqn <= lead`
    pub fn peek(&self, sqn: Sqn) -> Result<&TxwEntry, PgmError> {
        if self.len == 0 || !sqn.is_after_eq(self.trail) || !self.lead().is_after_eq(sqn) {
            return Err(PgmError::NotInWindow);
        }
        self.slots[self.slot_index(sqn)]
            .as_ref()
            .ok_or(PgmError::NotInWindow)
    }

    /// enqueue a retransmit request; parity requests coalesce per
    /// transmission group, accumulating the requested parity count.
    /// returns true when new work was queued.
    pub fn retransmit_push(&mut self, sqn: Sqn, is_parity: bool, tg_sqn_shift: u8) -> bool {
        if is_parity {
            let tg = sqn.tg_base(tg_sqn_shift);
            let count = sqn.tg_index(tg_sqn_shift) + 1;
            if let Some(existing) = self
                .retransmit_queue
                .iter_mut()
                .find(|r| r.is_parity && r.sqn == tg)
            {
                existing.requested_count = existing.requested_count.max(count);
                trace!("coalesced parity retransmit for group {}, count {}", tg, existing.requested_count);
                return false;
            }
            self.retransmit_queue.push_back(RetransmitRequest {
                sqn: tg,
                is_parity: true,
                requested_count: count,
                next_index: 0,
            });
            true
        } else {
            if self
                .retransmit_queue
                .iter()
                .any(|r| !r.is_parity && r.sqn == sqn)
            {
                return false;
            }
            self.retransmit_queue.push_back(RetransmitRequest {
                sqn,
                is_parity: false,
                requested_count: 1,
                next_index: 0,
            });
            true
        }
    }

    /// dequeue one unit of retransmission work; a parity request yields one
    /// parity index per call until the requested count (capped at `max_h`)
    /// is exhausted
    pub fn retransmit_try_pop(&mut self, max_h: u32) -> Option<Retransmit> {
        let front = self.retransmit_queue.front_mut()?;

        if !front.is_parity {
            let sqn = front.sqn;
            self.retransmit_queue.pop_front();
            return Some(Retransmit { sqn, is_parity: false, parity_index: 0 });
        }

        let limit = front.requested_count.min(max_h);
        if front.next_index >= limit {
            self.retransmit_queue.pop_front();
            return self.retransmit_try_pop(max_h);
        }
        let result = Retransmit {
            sqn: front.sqn,
            is_parity: true,
            parity_index: front.next_index,
        };
        front.next_index += 1;
        if front.next_index >= limit {
            self.retransmit_queue.pop_front();
        }
        Some(result)
    }

    pub fn has_retransmit_work(&self) -> bool {
        !self.retransmit_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(tag: u8) -> TxwEntry {
        TxwEntry {
            tpdu: vec![tag; 24],
            tsdu_length: 4,
            payload_offset: 20,
            unfolded_data_csum: 0,
            fragment: None,
        }
    }

    #[test]
    fn test_push_assigns_monotonic_sqns() {
        let mut txw = TransmitWindow::new(8);
        assert!(txw.is_empty());
        for i in 0..5u32 {
            let sqn = txw.push(entry(i as u8));
            assert_eq!(sqn, Sqn::from_raw(i));
            assert_eq!(txw.lead(), sqn);
        }
        assert_eq!(txw.trail(), Sqn::ZERO);
        assert_eq!(txw.next_lead(), Sqn::from_raw(5));
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let mut txw = TransmitWindow::new(3);
        for i in 0..5u8 {
            txw.push(entry(i));
        }
        assert_eq!(txw.trail(), Sqn::from_raw(2));
        assert_eq!(txw.lead(), Sqn::from_raw(4));
        assert!(matches!(txw.peek(Sqn::from_raw(1)), Err(PgmError::NotInWindow)));
        assert_eq!(txw.peek(Sqn::from_raw(2)).unwrap().tpdu[0], 2);
        assert_eq!(txw.peek(Sqn::from_raw(4)).unwrap().tpdu[0], 4);
    }

    #[rstest]
    #[case::empty_window(0, 0)]
    #[case::beyond_lead(3, 7)]
    fn test_peek_out_of_window(#[case] pushes: u8, #[case] sqn: u32) {
        let mut txw = TransmitWindow::new(8);
        for i in 0..pushes {
            txw.push(entry(i));
        }
        assert!(matches!(txw.peek(Sqn::from_raw(sqn)), Err(PgmError::NotInWindow)));
    }

    #[test]
    fn test_selective_retransmit_dedup() {
        let mut txw = TransmitWindow::new(8);
        assert!(txw.retransmit_push(Sqn::from_raw(3), false, 0));
        assert!(!txw.retransmit_push(Sqn::from_raw(3), false, 0));
        assert!(txw.retransmit_push(Sqn::from_raw(4), false, 0));

        assert_eq!(
            txw.retransmit_try_pop(0),
            Some(Retransmit { sqn: Sqn::from_raw(3), is_parity: false, parity_index: 0 })
        );
        assert_eq!(
            txw.retransmit_try_pop(0),
            Some(Retransmit { sqn: Sqn::from_raw(4), is_parity: false, parity_index: 0 })
        );
        assert_eq!(txw.retransmit_try_pop(0), None);
    }

    #[test]
    fn test_parity_coalescing_accumulates_count() {
        let mut txw = TransmitWindow::new(8);
        // group base 8, shift 2: requests for 1 and then 3 parity packets
        assert!(txw.retransmit_push(Sqn::from_raw(8), true, 2));
        assert!(!txw.retransmit_push(Sqn::from_raw(10), true, 2));

        let popped = std::iter::from_fn(|| txw.retransmit_try_pop(2)).collect::<Vec<_>>();
        assert_eq!(
            popped,
            vec![
                Retransmit { sqn: Sqn::from_raw(8), is_parity: true, parity_index: 0 },
                Retransmit { sqn: Sqn::from_raw(8), is_parity: true, parity_index: 1 },
            ]
        );
    }

    #[test]
    fn test_parity_count_capped_at_available_parity() {
        let mut txw = TransmitWindow::new(8);
        assert!(txw.retransmit_push(Sqn::from_raw(7), true, 2)); // asks for 4
        let popped = std::iter::from_fn(|| txw.retransmit_try_pop(2)).collect::<Vec<_>>();
        assert_eq!(popped.len(), 2);
    }

    #[test]
    fn test_wrap_around_window() {
        let mut txw = TransmitWindow::new(4);
        txw.trail = Sqn::from_raw(u32::MAX - 1);
        txw.next_lead = Sqn::from_raw(u32::MAX - 1);
        for i in 0..4u8 {
            txw.push(entry(i));
        }
        assert_eq!(txw.lead(), Sqn::from_raw(1));
        assert_eq!(txw.peek(Sqn::from_raw(0)).unwrap().tpdu[0], 2);
    }
}
