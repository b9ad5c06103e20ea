//! Fingertip detection and identity tracking over foreground masks.
//!
//! Fingertips are found as tightly curved extremities of blob contours: the
//! convex hull proposes candidate vertices, an arc test walks the contour
//! outward from each vertex and scores how long the local curvature stays
//! inside a finger-shaped envelope, and nearby vertices are non-max
//! suppressed into one candidate per cluster. Candidates are then matched
//! against tracked fingertips from previous frames so identities persist.

use anyhow::Result;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size, Vector, CV_8UC3};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::config;

// Contour settings
const MIN_CONTOUR_AREA: f64 = 500.0;

// Arc test settings
const ARC_MIN_SCORE: i32 = 50;
const ARC_TEST_LENGTH: i64 = 450;
const NONMAX_PROXIMITY: i64 = 500;

// Tracking settings
const MAX_TRACKING_RANGE: i64 = 75;
const MAX_TRACKING_LIFE: i32 = 10;
const FOCUS_RESET_TIME: i32 = 10;

/// A tracked fingertip candidate for the current frame.
#[derive(Debug, Clone, Copy)]
pub struct Fingertip {
    /// Tip pixel in output coordinates.
    pub point: Point,
    /// Midpoint of the two contour samples 15 indices either side of the
    /// tip; a local proxy for the base of the finger.
    pub com: Point,
    /// Number of consecutive frames this fingertip has been matched.
    pub age: usize,
    /// Stable identity; never reused within a tracker instance.
    pub id: u64,
}

/// Detects fingertips in foreground masks and tracks their identity
/// across frames within a focusable region.
pub struct FingerTracker {
    canvas: Size,
    tracking_region: Rect,
    tracking_reset_timer: i32,
    next_id: u64,
    candidates: Vec<(Point, Point)>,
    tracking_memory: Vec<(Fingertip, i32)>,
    debug_render: Mat,
}

impl FingerTracker {
    pub fn new(canvas: Size) -> Self {
        assert!(canvas.width > 0 && canvas.height > 0);
        FingerTracker {
            canvas,
            tracking_region: Rect::new(0, 0, canvas.width, canvas.height),
            tracking_reset_timer: 0,
            next_id: 0,
            candidates: Vec::new(),
            tracking_memory: Vec::new(),
            debug_render: Mat::default(),
        }
    }

    /// Restricts subsequent detection to a rectangle centred on `point`,
    /// clamped to the canvas, and resets the focus timer.
    pub fn focus(&mut self, point: Point, size: Size) {
        let half_width = size.width / 2;
        let half_height = size.height / 2;

        let top_left = Point::new(
            (point.x - half_width).max(0),
            (point.y - half_height).max(0),
        );
        let bottom_right = Point::new(
            (point.x + half_width).min(self.canvas.width - 1),
            (point.y + half_height).min(self.canvas.height - 1),
        );

        self.tracking_region = Rect::new(
            top_left.x,
            top_left.y,
            bottom_right.x - top_left.x,
            bottom_right.y - top_left.y,
        );
        self.tracking_reset_timer = FOCUS_RESET_TIME;
    }

    /// Returns the fingertips of the current frame, with stable identities
    /// where a match against the previous frames was possible.
    pub fn detect(&mut self, mask: &Mat, shadow_mask: &Mat) -> Result<Vec<Fingertip>> {
        let mut fingertips = Vec::new();

        if config::SHOW_TRACKING_OUTPUT {
            self.debug_render =
                Mat::new_size_with_default(mask.size()?, CV_8UC3, Scalar::all(0.0))?;
        }

        // The focus region expires back to the full canvas.
        self.tracking_reset_timer -= 1;
        if self.tracking_reset_timer < 0 {
            self.tracking_region = Rect::new(0, 0, mask.cols(), mask.rows());
        }

        // All external contours within the focus area, with full point
        // lists so the arc test can walk them index by index.
        let focused = Mat::roi(mask, self.tracking_region)?;
        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &focused,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_NONE,
            self.tracking_region.tl(),
        )?;

        for contour in &contours {
            if imgproc::contour_area(&contour, false)? < MIN_CONTOUR_AREA {
                continue;
            }
            let contour = contour.to_vec();

            if config::SHOW_TRACKING_OUTPUT {
                for point in &contour {
                    imgproc::circle(
                        &mut self.debug_render,
                        *point,
                        0,
                        Scalar::all(64.0),
                        1,
                        imgproc::LINE_8,
                        0,
                    )?;
                }
            }

            // Hull points are extremities of the mask; an outstretched
            // finger always ends at one.
            let mut hull_indices = Vector::<i32>::new();
            imgproc::convex_hull(
                &Vector::<Point>::from_slice(&contour),
                &mut hull_indices,
                false,
                false,
            )?;
            if hull_indices.is_empty() {
                continue;
            }
            let hull: Vec<usize> = hull_indices.iter().map(|i| i as usize).collect();

            self.scan_hull(&contour, &hull);
        }

        // Match candidates against tracked fingertips, entry first.
        let mut entry = 0;
        while entry < self.tracking_memory.len() {
            let (finger, _) = self.tracking_memory[entry];

            let mut match_index = None;
            let mut closest_distance_sqr = MAX_TRACKING_RANGE * MAX_TRACKING_RANGE;
            for (c, (point, _)) in self.candidates.iter().enumerate() {
                let distance_sqr = distance_sqr(finger.point, *point);
                if distance_sqr < closest_distance_sqr {
                    closest_distance_sqr = distance_sqr;
                    match_index = Some(c);
                }
            }

            if let Some(c) = match_index {
                let (point, com) = self.candidates.swap_remove(c);
                fingertips.push(Fingertip {
                    point,
                    com,
                    age: finger.age + 1,
                    id: finger.id,
                });

                if config::SHOW_TRACKING_OUTPUT {
                    imgproc::circle(
                        &mut self.debug_render,
                        point,
                        2,
                        Scalar::new(0.0, 255.0, 0.0, 0.0),
                        2,
                        imgproc::LINE_8,
                        0,
                    )?;
                }

                // Matched entries and candidates leave both pools.
                self.tracking_memory.swap_remove(entry);
            } else {
                entry += 1;
            }
        }

        // Remaining candidates become new fingertips.
        for (point, com) in self.candidates.drain(..) {
            fingertips.push(Fingertip { point, com, age: 1, id: self.next_id });
            self.next_id += 1;

            if config::SHOW_TRACKING_OUTPUT {
                imgproc::circle(
                    &mut self.debug_render,
                    point,
                    2,
                    Scalar::new(0.0, 255.0, 255.0, 0.0),
                    2,
                    imgproc::LINE_8,
                    0,
                )?;
            }
        }

        self.update_tracking_memory(&fingertips);

        if config::SHOW_TRACKING_OUTPUT {
            let mut shadow_bgr = Mat::default();
            imgproc::cvt_color(shadow_mask, &mut shadow_bgr, imgproc::COLOR_GRAY2BGR, 0)?;
            let mut render = Mat::default();
            core::add_weighted(
                &self.debug_render,
                1.0,
                &shadow_bgr,
                0.15,
                0.0,
                &mut render,
                -1,
            )?;
            highgui::imshow("Fingertip Debug Map", &render)?;
            highgui::poll_key()?;
        }

        Ok(fingertips)
    }

    /// Traverses the hull in order, grouping vertices into proximity
    /// clusters and emitting the best arc-scoring vertex of each cluster.
    fn scan_hull(&mut self, contour: &[Point], hull: &[usize]) {
        // Start the traversal at an edge vertex so no cluster spans the
        // traversal wrap.
        let offset = hull
            .iter()
            .position(|&index| self.edge_test(contour[index]))
            .unwrap_or(0);

        let mut last_point = contour[hull[offset]];
        let mut best: Option<usize> = None;
        let mut best_score = ARC_MIN_SCORE;
        for i in 0..hull.len() {
            let index = hull[(offset + i) % hull.len()];
            let score = self.arc_score(contour, index);

            // A vertex beyond the proximity bound closes the cluster.
            let step = contour[index] - last_point;
            if distance_sqr(Point::default(), step) > NONMAX_PROXIMITY {
                if let Some(best_index) = best {
                    self.candidates.push(candidate(contour, best_index));
                }
                best_score = ARC_MIN_SCORE;
                best = None;
            }
            last_point = contour[index];

            if score > best_score {
                best_score = score;
                best = Some(index);
            }
        }

        // The cluster still open when the traversal ends is a real cluster
        // too; its winner would otherwise vanish with the wrap.
        if let Some(best_index) = best {
            self.candidates.push(candidate(contour, best_index));
        }
    }

    /// Walks the contour outward from a hull vertex in both directions,
    /// counting how many steps the enclosed angle stays inside the finger
    /// arc envelope. Edge contact stops the walk.
    fn arc_score(&self, contour: &[Point], index: usize) -> i32 {
        let reference = contour[index];

        // An edge vertex cannot be an arc.
        if self.edge_test(reference) {
            return 0;
        }

        let length = contour.len() as i64;
        let mut score = 0;
        for i in 4..ARC_TEST_LENGTH + 4 {
            let prev = contour[(index as i64 - i).rem_euclid(length) as usize];
            let next = contour[((index as i64 + i) % length) as usize];

            if self.edge_test(prev) || self.edge_test(next) {
                break;
            }

            let angle = (360.0
                + signed_angle_between(next - reference, prev - reference))
                % 360.0;
            if angle < arc_char_min(i) || angle > arc_char_max(i) {
                break;
            }

            score += 1;
        }

        score
    }

    /// Ages out unmatched entries and re-seeds the memory from the current
    /// frame's fingertips.
    fn update_tracking_memory(&mut self, fingertips: &[Fingertip]) {
        self.tracking_memory.retain_mut(|(_, life)| {
            *life -= 1;
            *life > 0
        });

        for fingertip in fingertips {
            self.tracking_memory.push((*fingertip, MAX_TRACKING_LIFE));
        }
    }

    /// True when the point lies on any edge of the tracking rectangle;
    /// used to reject the wrist where it crosses the region boundary.
    fn edge_test(&self, point: Point) -> bool {
        point.x == self.tracking_region.x
            || point.y == self.tracking_region.y
            || point.x == self.tracking_region.x + self.tracking_region.width - 1
            || point.y == self.tracking_region.y + self.tracking_region.height - 1
    }

    #[cfg(test)]
    pub(crate) fn region(&self) -> Rect {
        self.tracking_region
    }
}

/// Upper bound of the acceptable arc angle at walk distance `i`: wide near
/// the tip, narrowing to finger width further out. Empirical coefficients.
fn arc_char_max(i: i64) -> f32 {
    let x = i as f32;
    if i < 40 {
        -0.05 * (x * x) + 175.0
    } else {
        -0.001 * (x * x) + 75.0
    }
}

/// Lower bound of the acceptable arc angle at walk distance `i`.
fn arc_char_min(i: i64) -> f32 {
    (-0.1 * ((i * i) as f32) + 50.0).max(10.0)
}

/// Signed angle in degrees from `v` to `u`.
fn signed_angle_between(v: Point, u: Point) -> f32 {
    let v = (v.x as f32, v.y as f32);
    let u = (u.x as f32, u.y as f32);
    (u.0 * v.1 - u.1 * v.0).atan2(u.0 * v.0 + u.1 * v.1).to_degrees()
}

fn distance_sqr(a: Point, b: Point) -> i64 {
    let dx = i64::from(a.x - b.x);
    let dy = i64::from(a.y - b.y);
    dx * dx + dy * dy
}

/// Builds the candidate pair (tip, base proxy) for a winning vertex.
fn candidate(contour: &[Point], index: usize) -> (Point, Point) {
    let length = contour.len();
    let ahead = contour[(index + 15) % length];
    let behind = contour[(index + length - 15) % length];
    (
        contour[index],
        Point::new((ahead.x + behind.x) / 2, (ahead.y + behind.y) / 2),
    )
}
