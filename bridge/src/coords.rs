use glam::{DMat3, DMat4, DVec3, Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine axis that feeds one host axis, with sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignedAxis {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl SignedAxis {
    fn index(self) -> usize {
        match self {
            SignedAxis::PosX | SignedAxis::NegX => 0,
            SignedAxis::PosY | SignedAxis::NegY => 1,
            SignedAxis::PosZ | SignedAxis::NegZ => 2,
        }
    }

    fn sign(self) -> f64 {
        match self {
            SignedAxis::PosX | SignedAxis::PosY | SignedAxis::PosZ => 1.0,
            _ => -1.0,
        }
    }
}

/// Conversion between the rule engine's coordinate convention and the host's.
///
/// `host[i] = sign * engine[axes[i]] * scale`. All unit and axis handling for both
/// directions lives here; nothing else in the crate touches raw conventions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateRemap {
    pub axes: [SignedAxis; 3],
    /// Host units per engine unit.
    pub scale: f64,
    /// Flip the V texture coordinate (`v' = 1 - v`).
    pub flip_v: bool,
}

impl Default for CoordinateRemap {
    fn default() -> Self {
        Self::identity()
    }
}

impl CoordinateRemap {
    /// Engine and host agree: Y-up, meters.
    pub fn identity() -> Self {
        Self {
            axes: [SignedAxis::PosX, SignedAxis::PosY, SignedAxis::PosZ],
            scale: 1.0,
            flip_v: false,
        }
    }

    /// Y-up meter engine into a Z-up centimeter host.
    pub fn z_up_centimeters() -> Self {
        Self {
            axes: [SignedAxis::PosX, SignedAxis::PosZ, SignedAxis::PosY],
            scale: 100.0,
            flip_v: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(ConfigError::Invalid(format!("coordinate scale must be positive, got {}", self.scale)));
        }
        let mut seen = [false; 3];
        for axis in self.axes {
            if std::mem::replace(&mut seen[axis.index()], true) {
                return Err(ConfigError::Invalid(format!("coordinate axes {:?} are not a permutation", self.axes)));
            }
        }
        Ok(())
    }

    /// Rotation/reflection part as a matrix mapping engine vectors to host vectors.
    fn basis(&self) -> DMat3 {
        let mut cols = [DVec3::ZERO; 3];
        for (host_axis, axis) in self.axes.iter().enumerate() {
            cols[axis.index()][host_axis] = axis.sign();
        }
        DMat3::from_cols(cols[0], cols[1], cols[2])
    }

    /// Whether the mapping mirrors space, which inverts triangle winding.
    pub fn flips_handedness(&self) -> bool {
        self.basis().determinant() < 0.0
    }

    pub fn point_to_host(&self, p: DVec3) -> DVec3 {
        self.basis() * p * self.scale
    }

    pub fn point_to_engine(&self, p: DVec3) -> DVec3 {
        self.basis().transpose() * (p / self.scale)
    }

    pub fn normal_to_host(&self, n: DVec3) -> DVec3 {
        (self.basis() * n).normalize_or_zero()
    }

    pub fn uv_to_host(&self, uv: [f64; 2]) -> Vec2 {
        let v = if self.flip_v { 1.0 - uv[1] } else { uv[1] };
        Vec2::new(uv[0] as f32, v as f32)
    }

    /// Conjugates an engine-space affine transform into host space.
    pub fn transform_to_host(&self, m: DMat4) -> Mat4 {
        let to_host = DMat4::from_mat3(self.basis() * self.scale);
        let to_engine = DMat4::from_mat3(self.basis().transpose() * (1.0 / self.scale));
        (to_host * m * to_engine).as_mat4()
    }

    pub fn host_vec3(&self, p: DVec3) -> Vec3 {
        self.point_to_host(p).as_vec3()
    }
}
