//! Math types.
//!
//! Positions and velocities share one vector type. A 2D arena uses the first
//! two components and keeps `z` at zero.

use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

/// Position or velocity in arena space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Vector {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Planar vector; `z` is zero.
    pub const fn planar(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Drops the components the arena does not simulate.
    pub fn project(self, dims: Dimensions) -> Self {
        match dims {
            Dimensions::Two => Self::planar(self.x, self.y),
            Dimensions::Three => self,
        }
    }
}

impl Add for Vector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f64> for Vector {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Arena dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Dimensions {
    #[default]
    #[serde(rename = "2d")]
    Two,
    #[serde(rename = "3d")]
    Three,
}

impl std::str::FromStr for Dimensions {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "2" | "2d" => Ok(Dimensions::Two),
            "3" | "3d" => Ok(Dimensions::Three),
            other => anyhow::bail!("unknown arena dimensions {other:?}, expected 2d or 3d"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_add() {
        let p = Vector::planar(1.0, 2.0) + Vector::planar(2.0, -4.0) * 0.5;
        assert_eq!(p, Vector::planar(2.0, 0.0));
    }

    #[test]
    fn planar_projection_drops_z() {
        let v = Vector::new(1.0, 2.0, 3.0);
        assert_eq!(v.project(Dimensions::Two), Vector::planar(1.0, 2.0));
        assert_eq!(v.project(Dimensions::Three), v);
    }

    #[test]
    fn dimensions_parse() {
        assert_eq!("3d".parse::<Dimensions>().unwrap(), Dimensions::Three);
        assert!("4d".parse::<Dimensions>().is_err());
    }
}
