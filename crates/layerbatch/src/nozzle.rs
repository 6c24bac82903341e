//! Nozzle profile.

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Nozzle modelled as a conical frustum standing on its tip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NozzleGeometry {
    /// Tip diameter (mm).
    pub tip_diameter: f64,
    /// Included cone angle (degrees). E3D V6 style nozzles are about 60°.
    pub cone_angle: f64,
    /// Height of the conical section (mm).
    pub cone_height: f64,
}

impl Default for NozzleGeometry {
    fn default() -> Self {
        Self {
            tip_diameter: 0.4,
            cone_angle: 60.0,
            cone_height: 10.0,
        }
    }
}

impl NozzleGeometry {
    /// Nozzle with the given tip diameter and default cone.
    pub fn with_tip(tip_diameter: f64) -> Self {
        Self {
            tip_diameter,
            ..Default::default()
        }
    }

    /// Tip radius (mm).
    pub fn tip_radius(&self) -> f64 {
        self.tip_diameter / 2.0
    }

    /// Cone half-angle in radians.
    pub fn half_angle(&self) -> f64 {
        (self.cone_angle / 2.0).to_radians()
    }

    /// Horizontal radius of the nozzle at `height` above the tip.
    ///
    /// Grows linearly with height; at or below the tip it is the tip radius.
    pub fn radius_at(&self, height: f64) -> f64 {
        if height <= 0.0 {
            return self.tip_radius();
        }
        self.tip_radius() + height * self.half_angle().tan()
    }

    /// Validate the profile.
    pub fn validate(&self) -> Result<()> {
        if !(self.tip_diameter > 0.0) {
            return Err(BatchError::InvalidSettings(
                "nozzle tip_diameter must be positive".into(),
            ));
        }
        let half = self.cone_angle / 2.0;
        if !(half > 0.0 && half < 90.0) {
            return Err(BatchError::InvalidSettings(
                "nozzle cone half-angle must be between 0 and 90 degrees".into(),
            ));
        }
        if !(self.cone_height > 0.0) {
            return Err(BatchError::InvalidSettings(
                "nozzle cone_height must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_radius_at_tip() {
        let nozzle = NozzleGeometry::default();
        assert_relative_eq!(nozzle.radius_at(0.0), 0.2);
        assert_relative_eq!(nozzle.radius_at(-1.0), 0.2);
    }

    #[test]
    fn test_radius_grows_with_height() {
        let nozzle = NozzleGeometry::default();
        // 30° half-angle
        assert_relative_eq!(nozzle.radius_at(1.0), 0.2 + 30f64.to_radians().tan());
        let mut last = nozzle.radius_at(0.0);
        for i in 1..50 {
            let r = nozzle.radius_at(i as f64 * 0.2);
            assert!(r > last);
            last = r;
        }
    }

    #[test]
    fn test_validate() {
        assert!(NozzleGeometry::default().validate().is_ok());
        assert!(NozzleGeometry::with_tip(0.0).validate().is_err());
        let flat = NozzleGeometry {
            cone_angle: 180.0,
            ..Default::default()
        };
        assert!(flat.validate().is_err());
        let nan = NozzleGeometry {
            tip_diameter: f64::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }
}
