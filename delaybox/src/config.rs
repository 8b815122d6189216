//! Load shaping rules from YAML.
//!
//! ```yaml
//! symmetric: true
//! prune_threshold: 100
//! rules:
//!   - source: 10.0.0.1
//!     destination: 10.0.1.1
//!     destination_port: 80
//!     delay: { min: 0.01, max: 0.05 }
//!     loss_rate: 0.01
//!     link_speed: 10000000
//! ```
//!
//! Each parameter is either a number (a constant) or one of `{min, max}` (uniform),
//! `{mean, std_dev}` (normal), or `{mean}` (exponential). Omitted ports match any port and
//! omitted loss rates or link speeds are `0` (no loss, unlimited speed).

use crate::{
    engine::Config,
    rule::{Distribution, Rule, WILDCARD},
    table::DEFAULT_PRUNE_THRESHOLD,
    Error,
};
use serde::{Deserialize, Serialize};
use std::{fs::File, net::Ipv4Addr, path::Path};

fn default_symmetric() -> bool {
    true
}

fn default_prune_threshold() -> usize {
    DEFAULT_PRUNE_THRESHOLD
}

fn zero() -> Distribution {
    Distribution::Constant(0.0)
}

/// A rule between two hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    #[serde(default)]
    pub source_port: u16,
    #[serde(default)]
    pub destination_port: u16,
    /// Seconds.
    pub delay: Distribution,
    #[serde(default = "zero")]
    pub loss_rate: Distribution,
    /// Bits per second.
    #[serde(default = "zero")]
    pub link_speed: Distribution,
}

impl RuleConfig {
    /// Build the [Rule], validating its distributions.
    pub fn rule(&self) -> Result<Rule, Error> {
        Rule::try_new(
            self.delay.clone(),
            self.loss_rate.clone(),
            self.link_speed.clone(),
        )
    }

    /// Whether the rule is restricted to specific ports.
    pub fn has_ports(&self) -> bool {
        self.source_port != WILDCARD || self.destination_port != WILDCARD
    }
}

/// Configuration of a [DelayBox](crate::DelayBox) and its rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayBoxConfig {
    #[serde(default = "default_symmetric")]
    pub symmetric: bool,
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl DelayBoxConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = File::open(path)?;
        let config: Self = serde_yaml::from_reader(config_file)?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn engine(&self) -> Config {
        Config {
            symmetric: self.symmetric,
            prune_threshold: self.prune_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_full_config() {
        let config = DelayBoxConfig::from_yaml(
            r#"
symmetric: false
prune_threshold: 10
rules:
  - source: 10.0.0.1
    destination: 10.0.1.1
    source_port: 5000
    destination_port: 80
    delay: 0.05
    loss_rate: 0.01
    link_speed: 8000
"#,
        )
        .unwrap();
        assert!(!config.symmetric);
        assert_eq!(config.prune_threshold, 10);
        assert_eq!(config.rules.len(), 1);

        let rule = &config.rules[0];
        assert_eq!(rule.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(rule.destination, Ipv4Addr::new(10, 0, 1, 1));
        assert!(rule.has_ports());
        assert_eq!(rule.rule().unwrap(), Rule::new(0.05, 0.01, 8000.0));

        let engine = config.engine();
        assert!(!engine.symmetric);
        assert_eq!(engine.prune_threshold, 10);
    }

    #[test]
    fn test_defaults() {
        let config = DelayBoxConfig::from_yaml(
            r#"
rules:
  - source: 10.0.0.1
    destination: 10.0.1.1
    delay: 0.1
"#,
        )
        .unwrap();
        assert!(config.symmetric);
        assert_eq!(config.prune_threshold, DEFAULT_PRUNE_THRESHOLD);
        let rule = &config.rules[0];
        assert!(!rule.has_ports());
        assert_eq!(rule.loss_rate, Distribution::Constant(0.0));
        assert_eq!(rule.link_speed, Distribution::Constant(0.0));
    }

    #[test_case("0.25", Distribution::Constant(0.25); "constant")]
    #[test_case("3", Distribution::Constant(3.0); "integer constant")]
    #[test_case("{ min: 0.01, max: 0.02 }", Distribution::Uniform { min: 0.01, max: 0.02 }; "uniform")]
    #[test_case("{ mean: 0.1, std_dev: 0.01 }", Distribution::Normal { mean: 0.1, std_dev: 0.01 }; "normal")]
    #[test_case("{ mean: 0.1 }", Distribution::Exponential { mean: 0.1 }; "exponential")]
    fn test_distribution_forms(delay: &str, expected: Distribution) {
        let yaml = format!(
            "rules:\n  - source: 10.0.0.1\n    destination: 10.0.1.1\n    delay: {delay}\n"
        );
        let config = DelayBoxConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.rules[0].delay, expected);
    }

    #[test]
    fn test_invalid_distribution() {
        let config = DelayBoxConfig::from_yaml(
            r#"
rules:
  - source: 10.0.0.1
    destination: 10.0.1.1
    delay: { min: 0.5, max: 0.1 }
"#,
        )
        .unwrap();
        assert!(matches!(
            config.rules[0].rule(),
            Err(Error::InvalidDistribution(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = DelayBoxConfig::from_yaml("rules:\n  - source: not-an-address\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("delaybox-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "rules:\n  - source: 10.0.0.1\n    destination: 10.0.1.1\n    delay: 0.05\n",
        )
        .unwrap();
        let config = DelayBoxConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.rules.len(), 1);

        let missing = DelayBoxConfig::from_file(&path);
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
