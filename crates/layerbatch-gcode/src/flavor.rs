//! Tool-change flavors.
//!
//! A flavor is a fixed instruction template rendered for one destination
//! tool. Rendered lines go through the same line scanner as parsed input, so
//! tool-change tagging of synthesized blocks matches what the parser would
//! produce when reading them back.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::{format_coord, Command, AXIS_PRECISION};
use crate::parser::ParseState;

/// Clearance above the highest deposited Z for the first lift of a
/// Bambu-style change (mm).
pub const BAMBU_LIFT: f64 = 0.4;
/// Clearance above the highest deposited Z while purging (mm).
pub const BAMBU_CLEARANCE: f64 = 3.0;

/// Tool-change dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChangeFlavor {
    /// Bambu Lab AMS sequence (`M620`/`M621` with purge and wipe).
    #[default]
    Bambu,
    /// Bare `T<n>` followed by a temperature wait.
    Generic,
}

/// Values substituted into a tool-change template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolChangeParams {
    /// Tool active before the change, if any.
    pub from: Option<u8>,
    /// Destination tool.
    pub to: u8,
    /// Nozzle temperature for the destination tool (°C).
    pub temperature: u32,
    /// Highest Z deposited so far (mm).
    pub ceiling_z: f64,
}

impl ToolChangeFlavor {
    /// Get the tool-change template for this flavor.
    pub fn template(&self) -> &'static str {
        match self {
            ToolChangeFlavor::Bambu => {
                "M620 S{tool}A\n\
                 ; tool change {from} -> T{tool}\n\
                 M204 S9000\n\
                 G17\n\
                 G2 Z{lift_z} I0.86 J0.86 P1 F10000\n\
                 G1 Z{clear_z} F1200\n\
                 G1 X70 F21000\n\
                 G1 Y245\n\
                 G1 Y265 F3000\n\
                 M400\n\
                 M106 P1 S0\n\
                 M106 P2 S0\n\
                 M104 S{temp}\n\
                 M620.11 S0\n\
                 M400\n\
                 G1 X90\n\
                 G1 Y255 F4000\n\
                 G1 X100 F5000\n\
                 G1 X120 F15000\n\
                 G1 X20 Y50 F21000\n\
                 G1 Y-3\n\
                 M620.1 E F299 T240\n\
                 T{tool}\n\
                 M620.1 E F299 T240\n\
                 M620.11 S0\n\
                 G92 E0\n\
                 ; FLUSH_START\n\
                 M400\n\
                 M109 S{temp}\n\
                 G1 E2 F299\n\
                 ; FLUSH_END\n\
                 M400\n\
                 G92 E0\n\
                 G1 E-2 F1800\n\
                 M106 P1 S255\n\
                 M400 S3\n\
                 G1 X70 F5000\n\
                 G1 X90 F3000\n\
                 G1 Y255 F4000\n\
                 G1 X105 F5000\n\
                 G1 Y265\n\
                 G1 X70 F10000\n\
                 G1 X100 F5000\n\
                 G1 X70 F10000\n\
                 G1 X100 F5000\n\
                 G1 X70 F10000\n\
                 G1 X80 F15000\n\
                 G1 X60\n\
                 G1 X80\n\
                 G1 X60\n\
                 G1 X80\n\
                 G1 X100 F5000\n\
                 G1 X165 F15000\n\
                 G1 Y256\n\
                 M400\n\
                 G1 Z{clear_z} F3000\n\
                 M204 S10000\n\
                 M621 S{tool}A\n\
                 M106 S0\n\
                 M104 S{temp}\n\
                 M900 K0.015 L1000 M10\n"
            }
            ToolChangeFlavor::Generic => {
                "; tool change {from} -> T{tool}\n\
                 T{tool}\n\
                 M109 S{temp} ; wait for nozzle temp\n"
            }
        }
    }

    /// Render the template into commands.
    pub fn render(&self, params: &ToolChangeParams) -> Vec<Command> {
        let from = params
            .from
            .map_or_else(|| "none".to_string(), |t| format!("T{}", t));
        let text = self
            .template()
            .replace("{tool}", &params.to.to_string())
            .replace("{from}", &from)
            .replace("{temp}", &params.temperature.to_string())
            .replace(
                "{lift_z}",
                &format_coord(params.ceiling_z + BAMBU_LIFT, AXIS_PRECISION),
            )
            .replace(
                "{clear_z}",
                &format_coord(params.ceiling_z + BAMBU_CLEARANCE, AXIS_PRECISION),
            );

        let mut state = ParseState::default();
        text.lines()
            .enumerate()
            .map(|(i, line)| {
                let (next, scanned) = state.scan(i, line);
                state = next;
                Command {
                    line: None,
                    ..scanned.command
                }
            })
            .collect()
    }
}

impl fmt::Display for ToolChangeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolChangeFlavor::Bambu => write!(f, "bambu"),
            ToolChangeFlavor::Generic => write!(f, "generic"),
        }
    }
}

impl FromStr for ToolChangeFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bambu" => Ok(ToolChangeFlavor::Bambu),
            "generic" => Ok(ToolChangeFlavor::Generic),
            other => Err(format!("unknown tool-change flavor '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> ToolChangeParams {
        ToolChangeParams {
            from: Some(0),
            to: 1,
            temperature: 230,
            ceiling_z: 1.0,
        }
    }

    #[test]
    fn test_bambu_block_is_one_sequence() {
        let block = ToolChangeFlavor::Bambu.render(&params());
        assert_eq!(block.first().unwrap().raw, "M620 S1A");
        let close = block.iter().position(|c| c.raw == "M621 S1A").unwrap();
        assert!(block[..=close].iter().all(|c| c.in_tool_change));
        assert!(block[close + 1..].iter().all(|c| !c.in_tool_change));
        assert!(block.iter().all(|c| c.line.is_none()));
    }

    #[test]
    fn test_bambu_lift_follows_ceiling() {
        let block = ToolChangeFlavor::Bambu.render(&params());
        let lifts: Vec<f64> = block.iter().filter_map(|c| c.z).collect();
        assert_eq!(lifts.len(), 3);
        assert_relative_eq!(lifts[0], 1.4);
        assert_relative_eq!(lifts[1], 4.0);
        assert!(block.iter().any(|c| c.raw == "M109 S230"));
    }

    #[test]
    fn test_single_tool_select_per_block() {
        for flavor in [ToolChangeFlavor::Bambu, ToolChangeFlavor::Generic] {
            let block = flavor.render(&params());
            let selects: Vec<u8> = block.iter().filter_map(|c| c.tool).collect();
            assert_eq!(selects, vec![1], "{}", flavor);
        }
    }

    #[test]
    fn test_generic_block() {
        let block = ToolChangeFlavor::Generic.render(&ToolChangeParams {
            from: None,
            ..params()
        });
        let raw: Vec<&str> = block.iter().map(|c| c.raw.as_str()).collect();
        assert_eq!(
            raw,
            vec![
                "; tool change none -> T1",
                "T1",
                "M109 S230 ; wait for nozzle temp"
            ]
        );
        assert!(block[1].in_tool_change);
    }

    #[test]
    fn test_parse_flavor() {
        assert_eq!("Bambu".parse(), Ok(ToolChangeFlavor::Bambu));
        assert_eq!("generic".parse(), Ok(ToolChangeFlavor::Generic));
        assert!("marlin".parse::<ToolChangeFlavor>().is_err());
    }
}
