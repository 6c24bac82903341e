//! Modal machine state threaded through the command stream.

use crate::command::Command;

/// Axis positioning mode (`G90` / `G91`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Positioning {
    /// `G90`
    #[default]
    Absolute,
    /// `G91`
    Relative,
}

/// Extruder positioning mode (`M82` / `M83`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtrusionMode {
    /// `M82`
    #[default]
    Absolute,
    /// `M83`
    Relative,
}

/// Position and modal state of the printer at a point in the program.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MachineState {
    /// X position (mm).
    pub x: f64,
    /// Y position (mm).
    pub y: f64,
    /// Z position (mm).
    pub z: f64,
    /// Extruder position (mm of filament).
    pub e: f64,
    /// Modal feedrate (mm/min), once one has been set.
    pub feedrate: Option<f64>,
    /// XYZ positioning mode.
    pub positioning: Positioning,
    /// Extruder positioning mode.
    pub extrusion: ExtrusionMode,
    /// Active tool, once one has been selected.
    pub tool: Option<u8>,
}

impl MachineState {
    /// Apply one command and return the extrusion delta it produced.
    ///
    /// Only motion commands extrude. Lines that are not understood leave the
    /// state untouched.
    pub fn apply(&mut self, cmd: &Command) -> f64 {
        if let Some(tool) = cmd.tool {
            self.tool = Some(tool);
            return 0.0;
        }

        match cmd.mnemonic.as_str() {
            "G90" => self.positioning = Positioning::Absolute,
            "G91" => self.positioning = Positioning::Relative,
            "M82" => self.extrusion = ExtrusionMode::Absolute,
            "M83" => self.extrusion = ExtrusionMode::Relative,
            "G92" => self.set_position(cmd),
            "G28" => self.home(cmd),
            "G0" | "G1" | "G2" | "G3" => return self.motion(cmd),
            _ => {}
        }
        0.0
    }

    /// State after applying `cmd`, leaving `self` untouched.
    pub fn peek(&self, cmd: &Command) -> MachineState {
        let mut next = *self;
        next.apply(cmd);
        next
    }

    fn motion(&mut self, cmd: &Command) -> f64 {
        if let Some(f) = cmd.f {
            self.feedrate = Some(f);
        }
        let relative = self.positioning == Positioning::Relative;
        for (target, value) in [(&mut self.x, cmd.x), (&mut self.y, cmd.y), (&mut self.z, cmd.z)] {
            if let Some(v) = value {
                *target = if relative { *target + v } else { v };
            }
        }

        match (cmd.e, self.extrusion) {
            (Some(e), ExtrusionMode::Relative) => {
                self.e += e;
                e
            }
            (Some(e), ExtrusionMode::Absolute) => {
                let delta = e - self.e;
                self.e = e;
                delta
            }
            (None, _) => 0.0,
        }
    }

    fn set_position(&mut self, cmd: &Command) {
        let any = cmd.x.is_some() || cmd.y.is_some() || cmd.z.is_some() || cmd.e.is_some();
        if !any {
            self.x = 0.0;
            self.y = 0.0;
            self.z = 0.0;
            self.e = 0.0;
            return;
        }
        if let Some(x) = cmd.x {
            self.x = x;
        }
        if let Some(y) = cmd.y {
            self.y = y;
        }
        if let Some(z) = cmd.z {
            self.z = z;
        }
        if let Some(e) = cmd.e {
            self.e = e;
        }
    }

    fn home(&mut self, cmd: &Command) {
        // G28 words carry no meaningful value, so check the raw text
        let code = cmd.code();
        let axes: Vec<char> = code
            .chars()
            .skip(cmd.mnemonic.len())
            .filter(|c| matches!(c, 'X' | 'Y' | 'Z'))
            .collect();
        if axes.is_empty() || axes.contains(&'X') {
            self.x = 0.0;
        }
        if axes.is_empty() || axes.contains(&'Y') {
            self.y = 0.0;
        }
        if axes.is_empty() || axes.contains(&'Z') {
            self.z = 0.0;
        }
    }

    /// Whether the extruder is in absolute mode.
    pub fn absolute_extrusion(&self) -> bool {
        self.extrusion == ExtrusionMode::Absolute
    }
}
