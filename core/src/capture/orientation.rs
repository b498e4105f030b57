// JPEG orientation for the still capture request

use super::camera::{CameraInfo, LensFacing};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed orientation preset used when auto-rotation is off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedOrientation {
    #[default]
    Portrait,
    PortraitReversed,
    Landscape,
    LandscapeReversed,
}

impl ForcedOrientation {
    pub const ALL: [ForcedOrientation; 4] = [
        ForcedOrientation::Portrait,
        ForcedOrientation::PortraitReversed,
        ForcedOrientation::Landscape,
        ForcedOrientation::LandscapeReversed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForcedOrientation::Portrait => "portrait",
            ForcedOrientation::PortraitReversed => "portrait_reversed",
            ForcedOrientation::Landscape => "landscape",
            ForcedOrientation::LandscapeReversed => "landscape_reversed",
        }
    }

    /// Rotation applied to the encoded image
    pub fn degrees(&self) -> u32 {
        match self {
            ForcedOrientation::Portrait => 90,
            ForcedOrientation::PortraitReversed => 270,
            ForcedOrientation::Landscape => 0,
            ForcedOrientation::LandscapeReversed => 180,
        }
    }
}

impl fmt::Display for ForcedOrientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForcedOrientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown orientation '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationPolicy {
    pub auto_rotate: bool,
    pub forced: ForcedOrientation,
}

impl Default for OrientationPolicy {
    fn default() -> Self {
        Self {
            auto_rotate: true,
            forced: ForcedOrientation::Portrait,
        }
    }
}

/// Final JPEG rotation for a capture on `camera` with the device at
/// `device_rotation` degrees.
///
/// Front cameras are mirrored, so the device rotation is subtracted.
pub fn compute_jpeg_orientation(
    policy: &OrientationPolicy,
    camera: &CameraInfo,
    device_rotation: u32,
) -> u32 {
    if !policy.auto_rotate {
        return policy.forced.degrees();
    }

    let sensor = camera.sensor_orientation % 360;
    let rotation = device_rotation % 360;
    match camera.facing {
        LensFacing::Front => (sensor + 360 - rotation) % 360,
        LensFacing::Back | LensFacing::External => (sensor + rotation) % 360,
    }
}

/// Snap a raw orientation-sensor reading to the nearest quarter turn.
///
/// Negative readings (orientation unknown) map to 0.
pub fn snap_rotation(degrees: i32) -> u32 {
    match degrees.rem_euclid(360) {
        _ if degrees < 0 => 0,
        d if !(45..315).contains(&d) => 0,
        d if d < 135 => 90,
        d if d < 225 => 180,
        _ => 270,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn auto() -> OrientationPolicy {
        OrientationPolicy::default()
    }

    #[test]
    fn test_rear_camera_adds_rotation() {
        let camera = CameraInfo::new("0", LensFacing::Back, 90);
        let got: Vec<u32> = [0, 90, 180, 270]
            .iter()
            .map(|&r| compute_jpeg_orientation(&auto(), &camera, r))
            .collect();
        assert_eq!(got, vec![90, 180, 270, 0]);
    }

    #[test]
    fn test_front_camera_subtracts_rotation() {
        let camera = CameraInfo::new("1", LensFacing::Front, 90);
        let got: Vec<u32> = [0, 90, 180, 270]
            .iter()
            .map(|&r| compute_jpeg_orientation(&auto(), &camera, r))
            .collect();
        assert_eq!(got, vec![90, 0, 270, 180]);
    }

    #[test]
    fn test_forced_orientation_ignores_sensor() {
        let camera = CameraInfo::new("0", LensFacing::Back, 90);
        for forced in ForcedOrientation::ALL {
            let policy = OrientationPolicy {
                auto_rotate: false,
                forced,
            };
            assert_eq!(
                compute_jpeg_orientation(&policy, &camera, 180),
                forced.degrees()
            );
        }
    }

    #[test]
    fn test_orientation_names_round_trip() {
        for forced in ForcedOrientation::ALL {
            assert_eq!(forced.as_str().parse::<ForcedOrientation>(), Ok(forced));
        }
        assert!("sideways".parse::<ForcedOrientation>().is_err());
    }

    #[test]
    fn test_snap_rotation_buckets() {
        assert_eq!(snap_rotation(0), 0);
        assert_eq!(snap_rotation(44), 0);
        assert_eq!(snap_rotation(45), 90);
        assert_eq!(snap_rotation(134), 90);
        assert_eq!(snap_rotation(135), 180);
        assert_eq!(snap_rotation(224), 180);
        assert_eq!(snap_rotation(225), 270);
        assert_eq!(snap_rotation(314), 270);
        assert_eq!(snap_rotation(315), 0);
        assert_eq!(snap_rotation(-1), 0);
    }

    proptest! {
        #[test]
        fn prop_orientation_is_a_quarter_turn(
            sensor in prop::sample::select(vec![0u32, 90, 180, 270]),
            rotation in prop::sample::select(vec![0u32, 90, 180, 270]),
            front in any::<bool>(),
        ) {
            let facing = if front { LensFacing::Front } else { LensFacing::Back };
            let camera = CameraInfo::new("c", facing, sensor);
            let degrees = compute_jpeg_orientation(&auto(), &camera, rotation);
            prop_assert!(degrees < 360);
            prop_assert_eq!(degrees % 90, 0);
        }

        #[test]
        fn prop_snap_rotation_is_a_quarter_turn(raw in -1i32..720) {
            let snapped = snap_rotation(raw);
            prop_assert!(snapped < 360);
            prop_assert_eq!(snapped % 90, 0);
        }
    }
}
