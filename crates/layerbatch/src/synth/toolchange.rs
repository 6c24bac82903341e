//! Tool-change block configuration.

use layerbatch_gcode::{Command, ToolChangeFlavor, ToolChangeParams};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// How tool changes are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolChangeConfig {
    /// Instruction template.
    pub flavor: ToolChangeFlavor,
    /// Nozzle temperature for tools without an entry in `temperatures` (°C).
    pub default_temperature: u32,
    /// Nozzle temperature per tool, indexed by tool number (°C).
    pub temperatures: Vec<u32>,
}

impl Default for ToolChangeConfig {
    fn default() -> Self {
        Self {
            flavor: ToolChangeFlavor::default(),
            default_temperature: 220,
            temperatures: Vec::new(),
        }
    }
}

impl ToolChangeConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = std::iter::once(&self.default_temperature)
            .chain(&self.temperatures)
            .find(|&&t| t == 0 || t > 500)
        {
            return Err(BatchError::InvalidSettings(format!(
                "tool temperature {} is out of range",
                t
            )));
        }
        Ok(())
    }

    /// Nozzle temperature for `tool`.
    pub fn temperature(&self, tool: u8) -> u32 {
        self.temperatures
            .get(tool as usize)
            .copied()
            .unwrap_or(self.default_temperature)
    }

    /// Render the change from `from` to `to`.
    pub fn block(&self, from: Option<u8>, to: u8, ceiling_z: f64) -> Vec<Command> {
        self.flavor.render(&ToolChangeParams {
            from,
            to,
            temperature: self.temperature(to),
            ceiling_z,
        })
    }
}
