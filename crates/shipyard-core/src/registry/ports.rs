//! Deterministic port ranges.
//!
//! A project owns `PROJECT_PORT_SPAN` ports starting at its `port_start`.
//! Environment slot `s` owns `ENVIRONMENT_PORT_SPAN` of them, split into a
//! blue and a green half. A release takes the half its predecessor does not
//! use, so a shadow never collides with the live release.

use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const MAX_ENVIRONMENTS: u8 = 8;
pub const SERVICES_PER_COLOR: u16 = 10;
pub const ENVIRONMENT_PORT_SPAN: u16 = SERVICES_PER_COLOR * 2;
pub const PROJECT_PORT_SPAN: u16 = ENVIRONMENT_PORT_SPAN * MAX_ENVIRONMENTS as u16;

/// Lowest accepted `port_start`.
pub const MIN_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    Blue,
    Green,
}

impl Color {
    pub fn other(self) -> Self {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }

    fn offset(self) -> u16 {
        match self {
            Color::Blue => 0,
            Color::Green => SERVICES_PER_COLOR,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port layout of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPlan {
    base: u16,
}

impl PortPlan {
    pub fn new(port_start: u16, slot: u8) -> anyhow::Result<Self> {
        if slot >= MAX_ENVIRONMENTS {
            anyhow::bail!(
                "environment slot {} exceeds the maximum of {}",
                slot,
                MAX_ENVIRONMENTS
            );
        }
        check_port_start(port_start)?;
        Ok(Self {
            base: port_start + ENVIRONMENT_PORT_SPAN * slot as u16,
        })
    }

    /// Port of the `index`-th port-bearing service of a release in `color`.
    pub fn port(&self, color: Color, index: usize) -> anyhow::Result<u16> {
        if index >= SERVICES_PER_COLOR as usize {
            anyhow::bail!(
                "a release may expose at most {} ported services",
                SERVICES_PER_COLOR
            );
        }
        Ok(self.base + color.offset() + index as u16)
    }

    pub fn range(&self) -> Range<u16> {
        self.base..self.base + ENVIRONMENT_PORT_SPAN
    }
}

/// Validate that a project's full range fits in the unprivileged port space.
pub fn check_port_start(port_start: u16) -> anyhow::Result<()> {
    if port_start < MIN_PORT {
        anyhow::bail!("port_start must be at least {}, got {}", MIN_PORT, port_start);
    }
    if port_start.checked_add(PROJECT_PORT_SPAN).is_none() {
        anyhow::bail!(
            "port_start {} leaves no room for {} ports",
            port_start,
            PROJECT_PORT_SPAN
        );
    }
    Ok(())
}

pub fn project_range(port_start: u16) -> Range<u32> {
    let start = port_start as u32;
    start..start + PROJECT_PORT_SPAN as u32
}

pub fn ranges_overlap(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_do_not_share_ports() {
        let plan = PortPlan::new(8100, 0).unwrap();
        assert_eq!(plan.port(Color::Blue, 0).unwrap(), 8100);
        assert_eq!(plan.port(Color::Green, 0).unwrap(), 8110);
        assert_eq!(plan.port(Color::Green, 9).unwrap(), 8119);
        assert!(plan.port(Color::Blue, 10).is_err());
    }

    #[test]
    fn slots_are_disjoint() {
        let qa = PortPlan::new(8100, 0).unwrap();
        let prod = PortPlan::new(8100, 2).unwrap();
        assert_eq!(prod.port(Color::Blue, 0).unwrap(), 8140);
        assert!(qa.range().end <= prod.range().start);
        assert!(PortPlan::new(8100, MAX_ENVIRONMENTS).is_err());
    }

    #[test]
    fn overlap_detection() {
        assert!(ranges_overlap(&project_range(8100), &project_range(8200)));
        assert!(!ranges_overlap(&project_range(8100), &project_range(8260)));
    }

    #[test]
    fn rejects_privileged_and_overflowing_starts() {
        assert!(check_port_start(80).is_err());
        assert!(check_port_start(65500).is_err());
        assert!(check_port_start(9000).is_ok());
    }
}
