//! Safe travel between layer visits.

use layerbatch_gcode::{Command, MachineState, Move};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

const EPSILON: f64 = 1e-6;

/// Z-hop parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZHopConfig {
    /// Wrap unsafe travel in a hop. When off, travel is still ordered so the
    /// nozzle rises before moving sideways.
    pub enabled: bool,
    /// Clearance above the highest point involved (mm).
    pub height: f64,
    /// Vertical speed (mm/s).
    pub z_speed: f64,
    /// Horizontal travel speed (mm/s).
    pub travel_speed: f64,
}

impl Default for ZHopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            height: 0.5,
            z_speed: 10.0,
            travel_speed: 150.0,
        }
    }
}

impl ZHopConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.height >= 0.0 && self.height.is_finite()) {
            return Err(BatchError::InvalidSettings(
                "zhop height must be zero or positive".into(),
            ));
        }
        if !(self.z_speed > 0.0) || !(self.travel_speed > 0.0) {
            return Err(BatchError::InvalidSettings(
                "zhop speeds must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Vertical feedrate (mm/min).
    pub fn z_feedrate(&self) -> f64 {
        self.z_speed * 60.0
    }

    /// Travel feedrate (mm/min).
    pub fn travel_feedrate(&self) -> f64 {
        self.travel_speed * 60.0
    }
}

/// Where a travel should end and what it crosses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Travel {
    /// Destination X, Y, Z (mm).
    pub to: [f64; 3],
    /// Highest Z deposited so far (mm).
    pub ceiling: f64,
    /// Destination does not continue from the layer the nozzle left.
    pub out_of_order: bool,
}

/// Planned travel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TravelPlan {
    /// Moves to emit.
    pub commands: Vec<Command>,
    /// Whether the moves form a hop.
    pub hopped: bool,
}

/// Plan a travel from `from` to `travel.to`.
///
/// A hop (rise at the current XY, XY travel at hop height, descend) is used
/// when either end is below the ceiling, when the destination is lower than
/// the current Z, or when the travel jumps between layers out of order. The
/// hop height is the highest of the current Z, the ceiling and the
/// destination, plus the configured clearance. Otherwise Z moves first when
/// rising and last when descending.
pub fn plan_travel(config: &ZHopConfig, from: &MachineState, travel: &Travel) -> TravelPlan {
    let [x, y, z] = travel.to;
    let zf = config.z_feedrate();
    let tf = config.travel_feedrate();

    let needs_hop = from.z < travel.ceiling - EPSILON
        || z < travel.ceiling - EPSILON
        || z < from.z - EPSILON
        || travel.out_of_order;

    if config.enabled && needs_hop {
        let hop = from.z.max(travel.ceiling).max(z) + config.height;
        return TravelPlan {
            commands: vec![
                Move::new().z(hop).f(zf).build(),
                Move::new().xy(x, y).f(tf).build(),
                Move::new().z(z).f(zf).build(),
            ],
            hopped: true,
        };
    }

    let vertical = ((from.z - z).abs() > EPSILON).then(|| Move::new().z(z).f(zf).build());
    let lateral = ((from.x - x).abs() > EPSILON || (from.y - y).abs() > EPSILON)
        .then(|| Move::new().xy(x, y).f(tf).build());
    let commands = if z >= from.z {
        vertical.into_iter().chain(lateral).collect()
    } else {
        lateral.into_iter().chain(vertical).collect()
    };
    TravelPlan {
        commands,
        hopped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(x: f64, y: f64, z: f64) -> MachineState {
        MachineState {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    fn travel(to: [f64; 3], ceiling: f64) -> Travel {
        Travel {
            to,
            ceiling,
            out_of_order: false,
        }
    }

    #[test]
    fn test_next_layer_is_plain() {
        let plan = plan_travel(
            &ZHopConfig::default(),
            &at(0.0, 0.0, 0.2),
            &travel([5.0, 5.0, 0.4], 0.2),
        );
        assert!(!plan.hopped);
        let raw: Vec<&str> = plan.commands.iter().map(|c| c.raw.as_str()).collect();
        assert_eq!(raw, vec!["G1 Z0.400 F600", "G1 X5.000 Y5.000 F9000"]);
    }

    #[test]
    fn test_descent_hops_above_ceiling() {
        let plan = plan_travel(
            &ZHopConfig::default(),
            &at(20.0, 20.0, 2.0),
            &travel([5.0, 5.0, 0.4], 2.0),
        );
        assert!(plan.hopped);
        let z: Vec<f64> = plan.commands.iter().filter_map(|c| c.z).collect();
        assert_relative_eq!(z[0], 2.5);
        assert_relative_eq!(z[1], 0.4);
        assert!(plan.commands[1].z.is_none());
        assert_relative_eq!(plan.commands[1].x.unwrap(), 5.0);
    }

    #[test]
    fn test_below_ceiling_hops() {
        // nozzle is under printed material even though it climbs
        let plan = plan_travel(
            &ZHopConfig::default(),
            &at(0.0, 0.0, 0.4),
            &travel([0.0, 0.0, 0.6], 3.0),
        );
        assert!(plan.hopped);
        assert_relative_eq!(plan.commands[0].z.unwrap(), 3.5);
    }

    #[test]
    fn test_out_of_order_jump_hops() {
        let plan = plan_travel(
            &ZHopConfig::default(),
            &at(0.0, 0.0, 0.6),
            &Travel {
                to: [1.0, 1.0, 1.6],
                ceiling: 0.6,
                out_of_order: true,
            },
        );
        assert!(plan.hopped);
        assert_relative_eq!(plan.commands[0].z.unwrap(), 2.1);
    }

    #[test]
    fn test_disabled_orders_descent_last() {
        let config = ZHopConfig {
            enabled: false,
            ..Default::default()
        };
        let plan = plan_travel(&config, &at(0.0, 0.0, 2.0), &travel([5.0, 0.0, 1.0], 2.0));
        assert!(!plan.hopped);
        assert!(plan.commands[0].x.is_some());
        assert_relative_eq!(plan.commands[1].z.unwrap(), 1.0);
    }

    #[test]
    fn test_no_motion_needed() {
        let plan = plan_travel(
            &ZHopConfig::default(),
            &at(1.0, 1.0, 0.2),
            &travel([1.0, 1.0, 0.2], 0.2),
        );
        assert!(plan.commands.is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(ZHopConfig::default().validate().is_ok());
        let bad = ZHopConfig {
            z_speed: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
