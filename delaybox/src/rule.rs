//! Shaping rules and the table that matches packets against them.
//!
//! A [Rule] holds three distributions (delay, loss rate, and bottleneck link speed). A flow
//! draws one sample from each when it is created and keeps it for its lifetime.
//!
//! Rules are keyed by (source, destination) endpoints where a port of [WILDCARD] matches any
//! port. [RuleTable::lookup] tries keys from most to least specific:
//!
//! 1. `(source:port, destination:port)`
//! 2. `(source:*, destination:port)`
//! 3. `(source:port, destination:*)`
//! 4. `(source:*, destination:*)`

use crate::{classifier::FlowKey, Error};
use rand::Rng;
use rand_distr::{Distribution as _, Exp, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Port that matches any port.
pub const WILDCARD: u16 = 0;

/// A distribution to sample a rule parameter from.
///
/// In configuration files a bare number is a constant; the other forms are distinguished by
/// their field names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Distribution {
    Constant(f64),
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std_dev: f64 },
    Exponential { mean: f64 },
}

impl Distribution {
    /// Check that the distribution's parameters are usable.
    pub fn validate(&self) -> Result<(), Error> {
        let valid = match *self {
            Self::Constant(value) => value.is_finite(),
            Self::Uniform { min, max } => min.is_finite() && max.is_finite() && min <= max,
            Self::Normal { mean, std_dev } => {
                mean.is_finite() && std_dev.is_finite() && std_dev >= 0.0
            }
            Self::Exponential { mean } => mean.is_finite() && mean > 0.0,
        };
        if !valid {
            return Err(Error::InvalidDistribution(format!("{:?}", self)));
        }
        Ok(())
    }

    /// Draw a value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, Error> {
        self.validate()?;
        let invalid = |err: &dyn std::fmt::Display| Error::InvalidDistribution(err.to_string());
        let value = match *self {
            Self::Constant(value) => value,
            Self::Uniform { min, max } => Uniform::new_inclusive(min, max).sample(rng),
            Self::Normal { mean, std_dev } => Normal::new(mean, std_dev)
                .map_err(|err| invalid(&err))?
                .sample(rng),
            Self::Exponential { mean } => Exp::new(1.0 / mean)
                .map_err(|err| invalid(&err))?
                .sample(rng),
        };
        Ok(value)
    }
}

impl From<f64> for Distribution {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

/// Parameters drawn from a [Rule] for one flow.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Propagation delay applied to every packet.
    pub delay: Duration,
    /// Probability of dropping each packet, in `[0, 1]`.
    pub loss_rate: f64,
    /// Bottleneck link speed in bits per second (`0` means unlimited).
    pub link_speed: f64,
}

/// Delay, loss rate, and link speed distributions.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    delay: Distribution,
    loss_rate: Distribution,
    link_speed: Distribution,
}

impl Rule {
    /// Create a rule with constant parameters.
    ///
    /// * `delay` - seconds to delay each packet.
    /// * `loss_rate` - probability of dropping each packet.
    /// * `link_speed` - bottleneck speed in bits per second (`0` for unlimited).
    ///
    /// Values are checked when a flow samples the rule.
    pub fn new(delay: f64, loss_rate: f64, link_speed: f64) -> Self {
        Self {
            delay: Distribution::Constant(delay),
            loss_rate: Distribution::Constant(loss_rate),
            link_speed: Distribution::Constant(link_speed),
        }
    }

    /// Create a rule from arbitrary distributions, validating their parameters.
    pub fn try_new(
        delay: Distribution,
        loss_rate: Distribution,
        link_speed: Distribution,
    ) -> Result<Self, Error> {
        delay.validate()?;
        loss_rate.validate()?;
        link_speed.validate()?;
        Ok(Self {
            delay,
            loss_rate,
            link_speed,
        })
    }

    pub fn delay(&self) -> &Distribution {
        &self.delay
    }

    pub fn loss_rate(&self) -> &Distribution {
        &self.loss_rate
    }

    pub fn link_speed(&self) -> &Distribution {
        &self.link_speed
    }

    /// Draw the parameters for a new flow.
    ///
    /// Fails if a sampled value is out of range: a negative delay would break the ordering of
    /// the flow's timeline, so it is never clamped.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Sample, Error> {
        let delay = self.delay.sample(rng)?;
        if !delay.is_finite() || delay < 0.0 {
            return Err(Error::NegativeDelay(delay));
        }
        let delay = Duration::try_from_secs_f64(delay).map_err(|_| Error::NegativeDelay(delay))?;

        let loss_rate = self.loss_rate.sample(rng)?;
        if !(0.0..=1.0).contains(&loss_rate) {
            return Err(Error::InvalidLossRate(loss_rate));
        }

        let link_speed = self.link_speed.sample(rng)?;
        if !link_speed.is_finite() || link_speed < 0.0 {
            return Err(Error::InvalidLinkSpeed(link_speed));
        }

        Ok(Sample {
            delay,
            loss_rate,
            link_speed,
        })
    }
}

impl Default for Rule {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// Rules keyed by endpoint patterns.
#[derive(Default)]
pub struct RuleTable {
    rules: BTreeMap<FlowKey, Rule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule matching any ports between `source` and `destination`.
    pub fn add(
        &mut self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        symmetric: bool,
        rule: Rule,
    ) -> Option<Rule> {
        self.add_ports(
            SocketAddrV4::new(source, WILDCARD),
            SocketAddrV4::new(destination, WILDCARD),
            symmetric,
            rule,
        )
    }

    /// Add a rule for specific endpoints (a port of [WILDCARD] matches any port).
    ///
    /// If `symmetric`, the rule also matches traffic from `destination` to `source`. Adding a
    /// rule for a key that already has one replaces it, returning the previous rule.
    pub fn add_ports(
        &mut self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        symmetric: bool,
        rule: Rule,
    ) -> Option<Rule> {
        self.rules
            .insert(FlowKey::new(source, destination, symmetric), rule)
    }

    /// Find the most specific rule matching a packet from `source` to `destination`.
    pub fn lookup(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        symmetric: bool,
    ) -> Option<&Rule> {
        let (src, sport) = (*source.ip(), source.port());
        let (dst, dport) = (*destination.ip(), destination.port());
        [
            (sport, dport),
            (WILDCARD, dport),
            (sport, WILDCARD),
            (WILDCARD, WILDCARD),
        ]
        .into_iter()
        .find_map(|(sport, dport)| {
            let key = FlowKey::new(
                SocketAddrV4::new(src, sport),
                SocketAddrV4::new(dst, dport),
                symmetric,
            );
            self.rules.get(&key)
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
