//! Per-flow delivery timeline.
//!
//! ```text
//!      A   B    C
//! --------------------
//!      *            enqueue
//!      |---|        delay
//!          |----|   transfer (packet size / link speed)
//!               *   delivery (the send callback runs)
//! ```
//!
//! A packet enqueued at `A` starts crossing the emulated bottleneck at
//! `B = max(A + delay, tail)`, where `tail` is the time the previous packet on the flow
//! finished, and is delivered at `C = B + transfer`. Taking the max with `tail` keeps
//! deliveries in enqueue order and keeps packets from overlapping on the bottleneck, even
//! though each packet's timing is computed when it arrives.
//!
//! When a packet carrying FIN is delivered the flow is cancelled: every pending delivery is
//! dropped and later packets on the flow are sent without delay.

use crate::{classifier::FlowId, packet::Flags, rule::Sample, Error};
use delaybox_runtime::{EventId, Scheduler};
use rand::Rng;
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::debug;

struct State {
    /// When the last bit of the last enqueued packet is done transmitting.
    tail_packet_end: SystemTime,
    /// Deliveries that have been scheduled but have not run (oldest first).
    pending: VecDeque<EventId>,
    cancelled: bool,
}

/// Runtime state of one flow.
pub struct Flow<E: Scheduler + Rng> {
    context: E,
    id: FlowId,
    sample: Sample,
    state: Rc<RefCell<State>>,
}

impl<E: Scheduler + Rng> Flow<E> {
    /// Create a flow with parameters already sampled from its rule.
    pub fn new(context: E, id: FlowId, sample: Sample) -> Self {
        debug!(
            flow = id,
            delay = ?sample.delay,
            loss_rate = sample.loss_rate,
            link_speed = sample.link_speed,
            "new flow"
        );
        Self {
            context,
            id,
            sample,
            state: Rc::new(RefCell::new(State {
                tail_packet_end: UNIX_EPOCH,
                pending: VecDeque::new(),
                cancelled: false,
            })),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    /// Time at which the most recently enqueued packet finishes (`UNIX_EPOCH` once cancelled).
    pub fn tail_packet_end(&self) -> SystemTime {
        self.state.borrow().tail_packet_end
    }

    /// Number of deliveries waiting to run.
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }

    /// Time needed to push `size` bytes through the bottleneck.
    fn transfer_duration(&self, size: usize) -> Result<Duration, Error> {
        let link_speed = self.sample.link_speed;
        if link_speed == 0.0 {
            return Ok(Duration::ZERO);
        }
        Duration::try_from_secs_f64(8.0 * size as f64 / link_speed)
            .map_err(|_| Error::InvalidLinkSpeed(link_speed))
    }

    /// Schedule `send` to run once the packet has been delayed and transferred.
    ///
    /// Returns `Ok(false)` if the packet was dropped by the flow's loss rate (`send` is never
    /// called). On a cancelled flow `send` runs immediately and `Ok(true)` is returned.
    pub fn enqueue<F>(&mut self, send: F, size: usize, flags: Flags) -> Result<bool, Error>
    where
        F: FnOnce() + 'static,
    {
        if self.is_cancelled() {
            debug!(flow = self.id, "packet on cancelled flow; sending immediately");
            send();
            return Ok(true);
        }

        // Loss is decided per packet, independently of the timeline
        if self.context.gen::<f64>() < self.sample.loss_rate {
            debug!(
                flow = self.id,
                loss_rate = self.sample.loss_rate,
                "packet dropped by loss rate"
            );
            return Ok(false);
        }

        let transfer = self.transfer_duration(size)?;
        let now = self.context.current();
        let arrival = now
            .checked_add(self.sample.delay)
            .ok_or(delaybox_runtime::Error::DeadlineOverflow)?;
        let mut state = self.state.borrow_mut();
        let start = if now > state.tail_packet_end {
            arrival
        } else {
            arrival.max(state.tail_packet_end)
        };
        let end = start
            .checked_add(transfer)
            .ok_or(delaybox_runtime::Error::DeadlineOverflow)?;

        let event = self.context.schedule_at(end, {
            let state = self.state.clone();
            let context = self.context.clone();
            let id = self.id;
            move || dequeue(id, &state, &context, send, flags)
        })?;
        debug!(
            flow = self.id,
            size,
            queued = state.pending.len(),
            ?start,
            ?end,
            "packet enqueued"
        );
        state.pending.push_back(event);
        state.tail_packet_end = end;
        Ok(true)
    }

    /// Drop every pending delivery and stop delaying packets on this flow.
    ///
    /// Cancellation is terminal. Calling it again has no effect.
    pub fn cancel(&self) {
        cancel(&self.state, &self.context);
    }
}

fn dequeue<E: Scheduler, F: FnOnce()>(
    id: FlowId,
    state: &RefCell<State>,
    context: &E,
    send: F,
    flags: Flags,
) {
    {
        let mut state = state.borrow_mut();
        if state.cancelled {
            return;
        }
        state.pending.pop_front();
    }

    // No borrow is held: `send` may enqueue more packets on this flow
    send();

    if flags.contains(Flags::FIN) {
        cancel(state, context);
        debug!(flow = id, "flow cancelled by FIN");
    }
}

fn cancel<E: Scheduler>(state: &RefCell<State>, context: &E) {
    let pending = {
        let mut state = state.borrow_mut();
        state.tail_packet_end = UNIX_EPOCH;
        state.cancelled = true;
        std::mem::take(&mut state.pending)
    };
    for event in pending {
        context.cancel(event);
    }
}
