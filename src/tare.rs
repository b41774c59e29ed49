//! World-tare quaternion helpers.
//!
//! The hub can tare its own rotation vector, but some applications prefer to
//! keep the hub's output untouched and re-zero the heading on the host side.
//! [`TareState`] is that host-side correction: a quaternion applied to every
//! incoming rotation vector, adjustable around the vertical axis without
//! disturbing pitch and roll.

use libm::{atan2f, cosf, sinf};

/// A rotation quaternion, Hamilton convention.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Quaternion = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    /// Hamilton product `self * other`.
    pub fn multiply(&self, other: &Quaternion) -> Quaternion {
        Quaternion {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    /// Heading of this rotation around the vertical axis, in radians.
    pub fn yaw(&self) -> f32 {
        let num = 2.0 * self.y * self.x - 2.0 * self.w * self.z;
        let den = 2.0 * self.w * self.w + 2.0 * self.y * self.y - 1.0;
        atan2f(num, den)
    }

    /// The pure-yaw rotation of `yaw` radians.
    pub fn from_yaw(yaw: f32) -> Quaternion {
        Quaternion {
            w: cosf(0.5 * yaw),
            x: 0.0,
            y: 0.0,
            z: -sinf(0.5 * yaw),
        }
    }
}

/// A host-side tare transformation.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TareState {
    q: Quaternion,
}

impl TareState {
    /// A tare that leaves rotation vectors unchanged.
    pub const fn new() -> Self {
        TareState { q: Quaternion::IDENTITY }
    }

    /// Applies the tare to an incoming rotation vector.
    pub fn apply(&self, q: &Quaternion) -> Quaternion {
        self.q.multiply(q)
    }

    /// Resets the tare to the identity.
    pub fn clear(&mut self) {
        self.q = Quaternion::IDENTITY;
    }

    /// Returns a tare that maps the heading of `from` onto the heading of
    /// `to` (or onto zero heading when `to` is absent), leaving the other
    /// axes alone.
    ///
    /// Both quaternions must already have this tare applied, ie. be outputs
    /// of [`TareState::apply`].
    pub fn retare_z(&self, from: &Quaternion, to: Option<&Quaternion>) -> TareState {
        let target = to.map(Quaternion::yaw).unwrap_or(0.0);
        let delta = Quaternion::from_yaw(target - from.yaw());
        TareState { q: self.q.multiply(&delta) }
    }
}

impl Default for TareState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::PI;

    const TOL: f32 = 0.0005;

    fn deg(d: f32) -> f32 {
        d * PI / 180.0
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < TOL
    }

    fn close_rad(a: f32, b: f32) -> bool {
        let mut diff = b - a;
        if diff > PI {
            diff -= 2.0 * PI;
        }
        if diff < -PI {
            diff += 2.0 * PI;
        }
        diff.abs() < TOL
    }

    /// Known yaw-only quaternions (ENU convention) and their headings.
    fn yaw_table() -> [(Quaternion, f32); 13] {
        let q = |w, z| Quaternion { w, x: 0.0, y: 0.0, z };
        [
            (q(0.0000, 1.0000), deg(-180.0)),
            (q(0.2588, 0.9659), deg(-150.0)),
            (q(0.5000, 0.8660), deg(-120.0)),
            (q(0.7071, 0.7071), deg(-90.0)),
            (q(0.8660, 0.5000), deg(-60.0)),
            (q(0.9659, 0.2588), deg(-30.0)),
            (q(1.0000, -0.0000), deg(0.0)),
            (q(0.9659, -0.2588), deg(30.0)),
            (q(0.8660, -0.5000), deg(60.0)),
            (q(0.7071, -0.7071), deg(90.0)),
            (q(0.5000, -0.8660), deg(120.0)),
            (q(0.2588, -0.9659), deg(150.0)),
            (q(0.0000, -1.0000), deg(180.0)),
        ]
    }

    #[test]
    fn yaw_extraction_and_construction() {
        for (q, yaw) in yaw_table() {
            assert!(close_rad(q.yaw(), yaw), "yaw of {:?}", q);
            let built = Quaternion::from_yaw(yaw);
            assert!(close(built.w, q.w) && close(built.x, q.x), "{:?}", q);
            assert!(close(built.y, q.y) && close(built.z, q.z), "{:?}", q);
        }
    }

    #[test]
    fn identity_tare_is_transparent() {
        let tare = TareState::new();
        let q = Quaternion { w: 0.7071, x: 0.1, y: -0.2, z: 0.7071 };
        assert_eq!(tare.apply(&q), q);
    }

    #[test]
    fn apply_is_hamilton_product() {
        // i * j = k
        let i = Quaternion { w: 0.0, x: 1.0, y: 0.0, z: 0.0 };
        let j = Quaternion { w: 0.0, x: 0.0, y: 1.0, z: 0.0 };
        let k = i.multiply(&j);
        assert_eq!(k, Quaternion { w: 0.0, x: 0.0, y: 0.0, z: 1.0 });
    }

    #[test]
    fn retare_zeroes_heading() {
        let tare = TareState::new();
        let facing_east = Quaternion::from_yaw(deg(90.0));

        let tare = tare.retare_z(&facing_east, None);
        let corrected = tare.apply(&facing_east);
        assert!(close_rad(corrected.yaw(), 0.0));
    }

    #[test]
    fn retare_to_target_heading() {
        let tare = TareState::new();
        let from = Quaternion::from_yaw(deg(30.0));
        let to = Quaternion::from_yaw(deg(-45.0));

        let tare = tare.retare_z(&from, Some(&to));
        let corrected = tare.apply(&from);
        assert!(close_rad(corrected.yaw(), deg(-45.0)));
    }

    #[test]
    fn clear_restores_identity() {
        let mut tare = TareState::new().retare_z(&Quaternion::from_yaw(1.0), None);
        assert_ne!(tare, TareState::new());
        tare.clear();
        assert_eq!(tare, TareState::new());
    }
}
