//! Route a device's outbound packets through a shared [DelayBox].
//!
//! [DelayBoxDevice] wraps any [NetDevice]. Each packet handed to [DelayBoxDevice::send] is
//! given to the attached [DelayBox] together with a callback that performs the real send
//! once the packet's flow releases it. Packets waiting on a flow are counted as "in flight"
//! and, together with the packets already queued by the underlying device, are compared
//! against the device's transmit-queue limit: when the limit is reached the upstream queue
//! is stopped, and it is restarted as soon as a delayed packet is handed to the device.
//!
//! Every packet produces exactly one [Trace]: [Trace::Enqueued] when it was accepted (sent
//! now or scheduled) and [Trace::Dropped] when the flow's loss rate discarded it.

use crate::{engine::DelayBox, metrics::Metrics, packet::Packet, Error};
use delaybox_runtime::{Metrics as RuntimeMetrics, Scheduler};
use prometheus_client::metrics::gauge::Gauge;
use rand::Rng;
use std::{
    cell::{Ref, RefCell, RefMut},
    rc::Rc,
};
use tracing::debug;

/// Maximum occupancy of a device's transmit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLimit {
    Packets(usize),
    Bytes(usize),
}

/// Current occupancy of a device's transmit queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub packets: usize,
    pub bytes: usize,
}

/// A device that can put packets on the wire.
///
/// `send` may be called from a delayed delivery. It must not synchronously re-enter the
/// [DelayBox] the device is attached to (deliver to the peer by scheduling an event instead).
pub trait NetDevice: 'static {
    /// Link-layer address of a destination.
    type Address: Clone + 'static;

    /// Transmit a packet. Returns `false` if the device refused it.
    fn send(&mut self, packet: Packet, destination: Self::Address, protocol: u16) -> bool;

    /// Largest packet the device can transmit.
    fn mtu(&self) -> usize;

    fn limit(&self) -> QueueLimit;

    fn occupancy(&self) -> Occupancy;

    /// Ask upstream producers to stop handing packets to the device.
    fn stop_queue(&mut self);

    /// Allow upstream producers to resume.
    fn start_queue(&mut self);
}

/// What happened to a packet handed to [DelayBoxDevice::send].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trace {
    Enqueued,
    Dropped,
}

struct Shared<D: NetDevice> {
    device: D,
    in_flight_packets: usize,
    in_flight_bytes: usize,
    stopped: bool,
}

impl<D: NetDevice> Shared<D> {
    fn release(&mut self, size: usize) {
        self.in_flight_packets -= 1;
        self.in_flight_bytes -= size;
        if self.stopped {
            self.stopped = false;
            self.device.start_queue();
            debug!("restarted transmit queue");
        }
    }
}

/// A packet counted as in flight until it is sent or discarded.
///
/// Dropping the guard without sending (for example when its flow is cancelled) still
/// releases the packet's share of the queue.
struct InFlight<D: NetDevice> {
    shared: Rc<RefCell<Shared<D>>>,
    gauge: Gauge,
    size: usize,
    released: bool,
}

impl<D: NetDevice> InFlight<D> {
    fn new(shared: Rc<RefCell<Shared<D>>>, gauge: Gauge, size: usize) -> Self {
        {
            let mut shared = shared.borrow_mut();
            shared.in_flight_packets += 1;
            shared.in_flight_bytes += size;
        }
        gauge.inc();
        Self {
            shared,
            gauge,
            size,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.borrow_mut().release(self.size);
        self.gauge.dec();
    }

    fn send(mut self, packet: Packet, destination: D::Address, protocol: u16) {
        self.release();
        self.shared
            .borrow_mut()
            .device
            .send(packet, destination, protocol);
    }
}

impl<D: NetDevice> Drop for InFlight<D> {
    fn drop(&mut self) {
        self.release();
    }
}

type Subscriber = Box<dyn FnMut(Trace, &Packet)>;

/// A [NetDevice] wrapper that delays outbound packets with a (shared) [DelayBox].
pub struct DelayBoxDevice<E: Scheduler + Rng, D: NetDevice> {
    delay_box: Option<Rc<RefCell<DelayBox<E>>>>,
    shared: Rc<RefCell<Shared<D>>>,
    subscribers: Vec<Subscriber>,
    metrics: Metrics,
}

impl<E: Scheduler + Rng + RuntimeMetrics, D: NetDevice> DelayBoxDevice<E, D> {
    /// Wrap `device`, registering metrics with `context`.
    ///
    /// No [DelayBox] is attached: packets are sent directly until [Self::attach] is called.
    pub fn new(context: &E, device: D) -> Self {
        Self {
            delay_box: None,
            shared: Rc::new(RefCell::new(Shared {
                device,
                in_flight_packets: 0,
                in_flight_bytes: 0,
                stopped: false,
            })),
            subscribers: Vec::new(),
            metrics: Metrics::init(context),
        }
    }
}

impl<E: Scheduler + Rng, D: NetDevice> DelayBoxDevice<E, D> {
    /// Delay packets sent from now on with `delay_box`.
    ///
    /// Returns the previously attached box, if any.
    pub fn attach(
        &mut self,
        delay_box: Rc<RefCell<DelayBox<E>>>,
    ) -> Option<Rc<RefCell<DelayBox<E>>>> {
        self.delay_box.replace(delay_box)
    }

    /// Stop delaying packets. Packets already scheduled are still delivered.
    pub fn detach(&mut self) -> Option<Rc<RefCell<DelayBox<E>>>> {
        self.delay_box.take()
    }

    pub fn delay_box(&self) -> Option<&Rc<RefCell<DelayBox<E>>>> {
        self.delay_box.as_ref()
    }

    /// Observe the fate of every packet sent through the device.
    pub fn on_trace<F>(&mut self, subscriber: F)
    where
        F: FnMut(Trace, &Packet) + 'static,
    {
        self.subscribers.push(Box::new(subscriber));
    }

    fn trace(&mut self, trace: Trace, packet: &Packet) {
        match trace {
            Trace::Enqueued => {
                self.metrics.enqueued_packets.inc();
                self.metrics.enqueued_bytes.inc_by(packet.len() as u64);
            }
            Trace::Dropped => {
                self.metrics.dropped_packets.inc();
            }
        }
        for subscriber in self.subscribers.iter_mut() {
            subscriber(trace, packet);
        }
    }

    /// Send `packet`, delaying it according to the attached [DelayBox] (if any).
    ///
    /// Returns `Ok(false)` if the packet was dropped by its flow's loss rate (or, without a
    /// [DelayBox], refused by the device).
    pub fn send(
        &mut self,
        packet: Packet,
        destination: D::Address,
        protocol: u16,
    ) -> Result<bool, Error> {
        let Some(delay_box) = self.delay_box.clone() else {
            self.trace(Trace::Enqueued, &packet);
            let sent = self
                .shared
                .borrow_mut()
                .device
                .send(packet, destination, protocol);
            return Ok(sent);
        };

        let in_flight = InFlight::new(
            self.shared.clone(),
            self.metrics.in_flight_packets.clone(),
            packet.len(),
        );
        let send = {
            let packet = packet.clone();
            move || in_flight.send(packet, destination, protocol)
        };
        if !delay_box.borrow_mut().delay(send, &packet)? {
            self.trace(Trace::Dropped, &packet);
            return Ok(false);
        }
        self.trace(Trace::Enqueued, &packet);

        // Stop upstream producers once delayed and queued packets fill the device
        let mut shared = self.shared.borrow_mut();
        let occupancy = shared.device.occupancy();
        let full = match shared.device.limit() {
            QueueLimit::Packets(max) => shared.in_flight_packets + occupancy.packets >= max,
            QueueLimit::Bytes(max) => {
                shared.in_flight_bytes + occupancy.bytes + shared.device.mtu() > max
            }
        };
        if full && !shared.stopped {
            shared.stopped = true;
            shared.device.stop_queue();
            debug!(
                in_flight_packets = shared.in_flight_packets,
                in_flight_bytes = shared.in_flight_bytes,
                "stopped transmit queue"
            );
        }
        Ok(true)
    }

    /// Packets handed to the [DelayBox] that have not yet reached the device.
    pub fn in_flight_packets(&self) -> usize {
        self.shared.borrow().in_flight_packets
    }

    /// Bytes handed to the [DelayBox] that have not yet reached the device.
    pub fn in_flight_bytes(&self) -> usize {
        self.shared.borrow().in_flight_bytes
    }

    /// Whether the upstream queue is currently stopped by this wrapper.
    pub fn is_stopped(&self) -> bool {
        self.shared.borrow().stopped
    }

    pub fn device(&self) -> Ref<'_, D> {
        Ref::map(self.shared.borrow(), |shared| &shared.device)
    }

    pub fn device_mut(&self) -> RefMut<'_, D> {
        RefMut::map(self.shared.borrow_mut(), |shared| &mut shared.device)
    }
}
