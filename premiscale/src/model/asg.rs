//! AutoscalingGroup: a named desired-size policy over a set of hosts.
//! See spec.md §3, §4.3.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScalingMethod {
    Cpu,
    Memory,
    Net,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplacementStrategy {
    RollingUpdate,
    Recreate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    pub strategy: ReplacementStrategy,
    pub max_unavailable: u32,
    pub max_surge: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtilizationTargets {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub net: Option<f64>,
    pub block: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub bridge: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AutoscalingGroup {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub increment: u32,
    pub cooldown_secs: u64,
    pub scaling_method: ScalingMethod,
    pub target_utilization: UtilizationTargets,
    pub replacement: Replacement,
    pub network: NetworkSpec,
    pub image: String,
    pub domain_name_template: String,
    pub cloud_init: Option<String>,
    pub hosts: Vec<String>,
}

impl AutoscalingGroup {
    /// Clamp a proposed new desired size into [min, max] (spec.md §4.3 step 3).
    pub fn clamp_desired(&self, proposed: i64) -> u32 {
        proposed.clamp(self.min as i64, self.max as i64) as u32
    }

    /// Render the name for the `index`th member, following the ASG's
    /// domain-name template (e.g. `"{asg}-{index}"`).
    pub fn render_domain_name(&self, index: u32) -> String {
        self.domain_name_template
            .replace("{asg}", &self.name)
            .replace("{index}", &index.to_string())
    }
}

/// Map of ASG name to its declared policy, as read from config.
pub type AsgTable = HashMap<String, AutoscalingGroup>;

#[cfg(test)]
mod tests {
    use super::*;

    fn asg() -> AutoscalingGroup {
        AutoscalingGroup {
            name: "g1".into(),
            min: 1,
            max: 5,
            desired: 2,
            increment: 1,
            cooldown_secs: 60,
            scaling_method: ScalingMethod::Cpu,
            target_utilization: UtilizationTargets { cpu: Some(0.6), ..Default::default() },
            replacement: Replacement {
                strategy: ReplacementStrategy::RollingUpdate,
                max_unavailable: 1,
                max_surge: 1,
            },
            network: NetworkSpec { bridge: "br0".into(), mtu: None },
            image: "img".into(),
            domain_name_template: "{asg}-{index}".into(),
            cloud_init: None,
            hosts: vec!["h1".into()],
        }
    }

    #[test]
    fn clamp_respects_bounds() {
        let a = asg();
        assert_eq!(a.clamp_desired(-5), 1);
        assert_eq!(a.clamp_desired(100), 5);
        assert_eq!(a.clamp_desired(3), 3);
    }

    #[test]
    fn domain_name_template_renders() {
        assert_eq!(asg().render_domain_name(3), "g1-3");
    }
}
