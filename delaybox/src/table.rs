//! Live flows, created lazily from the rule that first matched them.

use crate::{classifier::FlowId, flow::Flow, packet::Flags, rule::Rule, Error};
use delaybox_runtime::Scheduler;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

/// Default number of flows the table may hold before it starts sweeping cancelled ones.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 100;

/// Owns every [Flow] the shaper has seen.
pub struct FlowTable<E: Scheduler + Rng> {
    context: E,
    prune_threshold: usize,
    flows: BTreeMap<FlowId, Flow<E>>,
}

impl<E: Scheduler + Rng> FlowTable<E> {
    pub fn new(context: E, prune_threshold: usize) -> Self {
        Self {
            context,
            prune_threshold,
            flows: BTreeMap::new(),
        }
    }

    /// Route a packet through its flow, creating the flow from `rule` on first sight.
    ///
    /// Packets on cancelled flows are sent immediately. Returns `Ok(false)` if the packet was
    /// dropped by the flow's loss rate.
    pub fn enqueue<F>(
        &mut self,
        id: FlowId,
        rule: &Rule,
        send: F,
        size: usize,
        flags: Flags,
    ) -> Result<bool, Error>
    where
        F: FnOnce() + 'static,
    {
        match self.flows.get(&id) {
            Some(flow) if flow.is_cancelled() => {
                debug!(flow = id, "packet on cancelled flow; sending immediately");
                send();
                return Ok(true);
            }
            Some(_) => {}
            None => {
                let sample = rule.sample(&mut self.context)?;
                let flow = Flow::new(self.context.clone(), id, sample);
                self.flows.insert(id, flow);
            }
        }

        // Checking a table of N flows about once every N packets keeps long runs bounded
        let len = self.flows.len();
        if len > self.prune_threshold && self.context.gen_range(1..=len) == 1 {
            self.prune();
        }

        let flow = self
            .flows
            .get_mut(&id)
            .expect("active flow is never pruned");
        flow.enqueue(send, size, flags)
    }

    /// Remove every cancelled flow.
    ///
    /// Returns the number of flows removed.
    pub fn prune(&mut self) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| !flow.is_cancelled());
        let pruned = before - self.flows.len();
        debug!(pruned, remaining = self.flows.len(), "pruned cancelled flows");
        pruned
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow<E>> {
        self.flows.get(&id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
