//! Timer engine: one task per transport computes the next expiry across
//! every source of timed work and dispatches the due state transitions.
//!
//! `next_poll` is the minimum of the ambient SPM timer, the armed heartbeat
//! timer, the tails of the three per-peer NAK state queues, and the per-peer
//! SPMR and expiry deadlines. Whoever moves a deadline earlier pokes the
//! notify so the sleeping task re-computes.

use crate::transport::TransportCtx;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub(crate) struct TimerState {
    pub next_poll: Instant,
    pub next_ambient_spm: Instant,
    /// index into the heartbeat schedule while the ramp is armed
    pub heartbeat_index: Option<usize>,
    pub next_heartbeat_spm: Instant,
}

pub(crate) struct TimerShared {
    pub state: Mutex<TimerState>,
    pub notify: Notify,
}

impl TimerShared {
    pub fn new(now: Instant, ambient: Duration) -> TimerShared {
        TimerShared {
            state: Mutex::new(TimerState {
                next_poll: now + ambient,
                next_ambient_spm: now + ambient,
                heartbeat_index: None,
                next_heartbeat_spm: now,
            }),
            notify: Notify::new(),
        }
    }

    /// pull `next_poll` forward; prods the timer task when it was sleeping
    /// past the new deadline
    pub fn reschedule(&self, expiry: Instant) {
        let mut state = self.state.lock().expect("timer lock poisoned");
        if state.next_poll > expiry {
            state.next_poll = expiry;
            trace!("prod timer task");
            self.notify.notify_one();
        }
    }

    /// any ODATA/RDATA emission restarts the heartbeat ramp at its first
    /// interval
    pub fn reset_heartbeat(&self, schedule: &[Duration], now: Instant) {
        let Some(first) = schedule.first() else {
            return;
        };
        let expiry = now + *first;
        let mut state = self.state.lock().expect("timer lock poisoned");
        state.heartbeat_index = Some(0);
        state.next_heartbeat_spm = expiry;
        if state.next_poll > expiry {
            state.next_poll = expiry;
            self.notify.notify_one();
        }
    }
}

/// the timer task body; exits when the shutdown flag flips
pub(crate) async fn run(ctx: std::sync::Arc<TransportCtx>) {
    let mut shutdown = ctx.shutdown.subscribe();
    debug!("timer task running");

    loop {
        let next_poll = prepare(&ctx).await;

        tokio::select! {
            _ = ctx.timer.notify.notified() => {
                // a deadline moved, recompute
                continue;
            }
            _ = tokio::time::sleep_until(next_poll) => {
                dispatch(&ctx).await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    // bounded drain: a sending transport advertises its final window state
    if let Some(source) = &ctx.source {
        source.send_spm().await;
    }
    debug!("timer task stopped");
}

/// determine the nearest deadline and publish it as `next_poll`
async fn prepare(ctx: &TransportCtx) -> Instant {
    let now = Instant::now();
    let mut expiration = now + Duration::from_secs(30);

    if ctx.source.is_some() {
        let state = ctx.timer.state.lock().expect("timer lock poisoned");
        expiration = match state.heartbeat_index {
            Some(_) => state.next_ambient_spm.min(state.next_heartbeat_spm),
            None => state.next_ambient_spm,
        };
    }

    if ctx.config.can_recv {
        expiration = min_peer_expiry(ctx, expiration).await;
    }

    let mut state = ctx.timer.state.lock().expect("timer lock poisoned");
    state.next_poll = expiration;
    expiration
}

/// the earliest deadline among all peers: SPMR, the three NAK state queues,
/// and peer expiry. each queue keeps its tail sorted so every candidate is
/// one peek.
async fn min_peer_expiry(ctx: &TransportCtx, mut expiration: Instant) -> Instant {
    let peers = ctx.peers.read().await;
    for peer in peers.values() {
        let mut inner = peer.inner.lock().await;

        if let Some(spmr) = inner.spmr_expiry {
            expiration = expiration.min(spmr);
        }
        expiration = expiration.min(inner.expiry);
        if let Some(rb) = inner.rxw.next_backoff_expiry() {
            expiration = expiration.min(rb);
        }
        if let Some(rpt) = inner.rxw.next_wait_ncf_expiry() {
            expiration = expiration.min(rpt);
        }
        if let Some(rdata) = inner.rxw.next_wait_data_expiry() {
            expiration = expiration.min(rdata);
        }
    }
    expiration
}

/// fire everything that is due
async fn dispatch(ctx: &TransportCtx) {
    let now = Instant::now();

    if let Some(source) = &ctx.source {
        let due = {
            let mut state = ctx.timer.state.lock().expect("timer lock poisoned");
            spm_due(
                &mut state,
                &ctx.config.spm_heartbeat_intervals,
                ctx.config.spm_ambient_interval,
                now,
            )
        };
        if due {
            source.send_spm().await;
        }
    }

    if ctx.config.can_recv {
        crate::receiver::check_peer_nak_state(ctx, now).await;
    }
}

/// decide whether an SPM is due and advance the ambient/heartbeat schedule.
/// ambient resets the ramp; a heartbeat advances it and falls back to
/// ambient when the schedule is exhausted.
fn spm_due(state: &mut TimerState, schedule: &[Duration], ambient: Duration, now: Instant) -> bool {
    if now >= state.next_ambient_spm {
        state.heartbeat_index = None;
        state.next_ambient_spm = now + ambient;
        return true;
    }
    if let Some(index) = state.heartbeat_index {
        if now >= state.next_heartbeat_spm {
            let next = index + 1;
            if next < schedule.len() {
                state.heartbeat_index = Some(next);
                state.next_heartbeat_spm = now + schedule[next];
            } else {
                state.heartbeat_index = None;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(now: Instant, ambient: Duration) -> TimerState {
        TimerState {
            next_poll: now + ambient,
            next_ambient_spm: now + ambient,
            heartbeat_index: None,
            next_heartbeat_spm: now,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambient_spm_fires_and_resets_ramp() {
        let ambient = Duration::from_millis(8192);
        let schedule = vec![Duration::from_millis(4), Duration::from_millis(8)];
        let now = Instant::now();
        let mut state = fresh(now, ambient);
        state.heartbeat_index = Some(1);

        assert!(!spm_due(&mut state, &schedule, ambient, now + Duration::from_millis(1)));

        let at = now + ambient;
        assert!(spm_due(&mut state, &schedule, ambient, at));
        assert_eq!(state.heartbeat_index, None);
        assert_eq!(state.next_ambient_spm, at + ambient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_walks_ramp_then_disarms() {
        let ambient = Duration::from_secs(60);
        let schedule = vec![Duration::from_millis(4), Duration::from_millis(8)];
        let now = Instant::now();
        let mut state = fresh(now, ambient);

        // armed at index 0 as an ODATA send would
        state.heartbeat_index = Some(0);
        state.next_heartbeat_spm = now + schedule[0];

        let t1 = now + schedule[0];
        assert!(spm_due(&mut state, &schedule, ambient, t1));
        assert_eq!(state.heartbeat_index, Some(1));
        assert_eq!(state.next_heartbeat_spm, t1 + schedule[1]);

        let t2 = t1 + schedule[1];
        assert!(spm_due(&mut state, &schedule, ambient, t2));
        assert_eq!(state.heartbeat_index, None, "ramp exhausted falls back to ambient");

        assert!(!spm_due(&mut state, &schedule, ambient, t2 + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_only_pulls_forward() {
        let now = Instant::now();
        let shared = TimerShared::new(now, Duration::from_secs(8));

        shared.reschedule(now + Duration::from_secs(1));
        assert_eq!(shared.state.lock().unwrap().next_poll, now + Duration::from_secs(1));

        shared.reschedule(now + Duration::from_secs(5));
        assert_eq!(shared.state.lock().unwrap().next_poll, now + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_heartbeat_arms_first_interval() {
        let now = Instant::now();
        let shared = TimerShared::new(now, Duration::from_secs(8));
        let schedule = vec![Duration::from_millis(4), Duration::from_millis(8)];

        shared.reset_heartbeat(&schedule, now);
        let state = shared.state.lock().unwrap();
        assert_eq!(state.heartbeat_index, Some(0));
        assert_eq!(state.next_heartbeat_spm, now + Duration::from_millis(4));
        assert_eq!(state.next_poll, now + Duration::from_millis(4));
    }
}
