//! Per-frame fingertip selection and the touch/hover decision.
//!
//! A cast shadow coincides with the object casting it only on contact, so
//! the ratio of shadow to foreground around a fingertip is minimal for a
//! touch. It is never zero: the shadow still outlines the hand contour.

use anyhow::Result;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::config;
use crate::finger_tracker::Fingertip;

// Noise is not consistent across frames, so it never accumulates a large
// age; a solid fingertip easily lives past this bound.
const MIN_FINGER_AGE: usize = 5;

const TOUCH_THRESHOLD: f32 = 0.20;
const HOVER_THRESHOLD: f32 = 0.30;

/// Outcome of a frame with a usable fingertip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchAction {
    pub point: Point,
    /// True for surface contact, false for a near hover.
    pub touch: bool,
}

/// Selects one fingertip per frame, sticky across frames, and classifies
/// it as touching or hovering by the shadow ratio around its base.
pub struct TouchDecider {
    last_id: Option<u64>,
}

impl TouchDecider {
    pub fn new() -> Self {
        TouchDecider { last_id: None }
    }

    pub fn decide(
        &mut self,
        fingertips: &[Fingertip],
        foreground_mask: &Mat,
        shadow_mask: &Mat,
        camera_view: &Mat,
    ) -> Result<Option<TouchAction>> {
        // Prefer the fingertip used last frame, otherwise the oldest one
        // that has lived long enough to not be noise.
        let mut chosen: Option<Fingertip> = None;
        let mut oldest_age = MIN_FINGER_AGE;
        for fingertip in fingertips {
            if Some(fingertip.id) == self.last_id {
                chosen = Some(*fingertip);
                break;
            }
            if fingertip.age >= oldest_age {
                oldest_age = fingertip.age;
                chosen = Some(*fingertip);
            }
        }

        let Some(finger) = chosen else {
            return Ok(None);
        };
        self.last_id = Some(finger.id);

        // Region of interest around the base of the finger, wide enough to
        // also cover the tip.
        let offset = finger.com - finger.point;
        let radius = f64::from(offset.x * offset.x + offset.y * offset.y).sqrt() as i32 + 7;
        let top_left = Point::new(
            (finger.com.x - radius).max(0),
            (finger.com.y - radius).max(0),
        );
        let bottom_right = Point::new(
            (finger.com.x + radius).min(shadow_mask.cols() - 2),
            (finger.com.y + radius).min(shadow_mask.rows() - 2),
        );
        let roi = Rect::new(
            top_left.x,
            top_left.y,
            bottom_right.x - top_left.x,
            bottom_right.y - top_left.y,
        );

        let shadow = core::count_non_zero(&Mat::roi(shadow_mask, roi)?)?;
        let foreground = core::count_non_zero(&Mat::roi(foreground_mask, roi)?)?;
        let ratio = shadow as f32 / foreground as f32;

        if config::SHOW_RATIO_PATCH {
            show_ratio_patch(camera_view, roi, ratio)?;
        }

        if ratio <= TOUCH_THRESHOLD {
            return Ok(Some(TouchAction { point: finger.point, touch: true }));
        }
        if ratio <= HOVER_THRESHOLD {
            return Ok(Some(TouchAction { point: finger.point, touch: false }));
        }
        Ok(None)
    }
}

impl Default for TouchDecider {
    fn default() -> Self {
        Self::new()
    }
}

fn show_ratio_patch(camera_view: &Mat, roi: Rect, ratio: f32) -> Result<()> {
    let mut patch = Mat::new_size_with_default(
        Size::new(512, 612),
        opencv::core::CV_8UC3,
        Scalar::all(0.0),
    )?;

    let mut scaled = Mat::default();
    imgproc::resize(
        &Mat::roi(camera_view, roi)?,
        &mut scaled,
        Size::new(512, 512),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    let mut slot = Mat::roi_mut(&mut patch, Rect::new(0, 0, 512, 512))?;
    scaled.copy_to(&mut slot)?;

    imgproc::put_text(
        &mut patch,
        &format!("{ratio}"),
        Point::new(0, 600),
        imgproc::FONT_HERSHEY_COMPLEX_SMALL,
        3.0,
        Scalar::all(255.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    highgui::imshow("Ratio Patch", &patch)?;
    highgui::poll_key()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC1;

    const CANVAS: Size = Size { width: 640, height: 480 };

    fn fingertip(id: u64, age: usize) -> Fingertip {
        Fingertip {
            point: Point::new(320, 200),
            com: Point::new(320, 230),
            age,
            id,
        }
    }

    fn blank() -> Mat {
        Mat::new_size_with_default(CANVAS, CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    fn view() -> Mat {
        Mat::new_size_with_default(CANVAS, opencv::core::CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    /// Foreground filled across the ROI with a shadow strip covering the
    /// requested fraction of it.
    fn masks_with_shadow_fraction(fraction: f32) -> (Mat, Mat) {
        let mut foreground = blank();
        let roi = Rect::new(283, 193, 74, 74);
        imgproc::rectangle(
            &mut foreground,
            roi,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut shadow = blank();
        let strip_height = (roi.height as f32 * fraction) as i32;
        if strip_height > 0 {
            imgproc::rectangle(
                &mut shadow,
                Rect::new(roi.x, roi.y, roi.width, strip_height),
                Scalar::all(255.0),
                imgproc::FILLED,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        (foreground, shadow)
    }

    #[test]
    fn young_fingertips_are_ignored_as_noise() {
        let mut decider = TouchDecider::new();
        let (foreground, shadow) = masks_with_shadow_fraction(0.0);
        let action = decider
            .decide(&[fingertip(1, 4)], &foreground, &shadow, &view())
            .unwrap();
        assert_eq!(action, None);
    }

    #[test]
    fn low_shadow_ratio_registers_a_touch() {
        let mut decider = TouchDecider::new();
        let (foreground, shadow) = masks_with_shadow_fraction(0.1);
        let action = decider
            .decide(&[fingertip(1, 5)], &foreground, &shadow, &view())
            .unwrap();
        assert_eq!(
            action,
            Some(TouchAction { point: Point::new(320, 200), touch: true })
        );
    }

    #[test]
    fn moderate_shadow_ratio_registers_a_hover() {
        let mut decider = TouchDecider::new();
        let (foreground, shadow) = masks_with_shadow_fraction(0.25);
        let action = decider
            .decide(&[fingertip(1, 5)], &foreground, &shadow, &view())
            .unwrap();
        assert_eq!(
            action,
            Some(TouchAction { point: Point::new(320, 200), touch: false })
        );
    }

    #[test]
    fn large_shadow_ratio_emits_nothing() {
        let mut decider = TouchDecider::new();
        let (foreground, shadow) = masks_with_shadow_fraction(0.5);
        let action = decider
            .decide(&[fingertip(1, 5)], &foreground, &shadow, &view())
            .unwrap();
        assert_eq!(action, None);
    }

    #[test]
    fn selection_is_sticky_across_frames() {
        let mut decider = TouchDecider::new();
        let (foreground, shadow) = masks_with_shadow_fraction(0.1);

        let first = decider
            .decide(&[fingertip(7, 6)], &foreground, &shadow, &view())
            .unwrap();
        assert!(first.is_some());

        // The previously selected fingertip wins over an older newcomer.
        let newcomer = Fingertip {
            point: Point::new(100, 100),
            com: Point::new(100, 130),
            age: 30,
            id: 9,
        };
        let second = decider
            .decide(&[newcomer, fingertip(7, 7)], &foreground, &shadow, &view())
            .unwrap();
        assert_eq!(second.unwrap().point, Point::new(320, 200));
    }
}
