//! Spatial value types exchanged with peers.
//!
//! These are plain data carriers; the 3-D engine owns the real math.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// A 3-component vector (position, scale, or world offset).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Whether every component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vector3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// A rotation quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Position, rotation and scale of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vector3,
    pub rotation: Quaternion,
    pub scale: Vector3,
}

impl Transform {
    #[must_use]
    pub const fn new(position: Vector3, rotation: Quaternion, scale: Vector3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Identity transform at `position`.
    #[must_use]
    pub const fn at(position: Vector3) -> Self {
        Self::new(position, Quaternion::IDENTITY, Vector3::ONE)
    }

    /// Moves a locally-expressed transform into session space.
    ///
    /// Session space is local space shifted by the session's world offset.
    #[must_use]
    pub fn to_session_space(&self, world_offset: Vector3) -> Self {
        Self {
            position: self.position + world_offset,
            ..*self
        }
    }

    /// Inverse of [`Transform::to_session_space`].
    #[must_use]
    pub fn to_local_space(&self, world_offset: Vector3) -> Self {
        Self {
            position: self.position - world_offset,
            ..*self
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(Vector3::ZERO)
    }
}
