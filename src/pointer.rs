//! Host pointer injection with monitor mapping and motion smoothing.

use anyhow::{anyhow, Context, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
use nalgebra::Vector2;
use opencv::core::{Point, Size};
use xcap::Monitor;

// Small jitters damp almost to a stop, drags follow quickly, and anything
// past the jump threshold snaps immediately.
const DRAG_THRESHOLD: f32 = 20.0;
const JUMP_THRESHOLD: f32 = 150.0;
const STOP_RATE: f32 = 0.05;
const DRAG_RATE: f32 = 0.8;

/// Drives the host pointing device, mapping output coordinates onto the
/// primary monitor captured once at construction.
pub struct Pointer {
    enigo: Enigo,
    cursor: Vector2<f32>,
    input_offset: Vector2<f32>,
    input_scaling: Vector2<f32>,
    left_held: bool,
    right_held: bool,
}

impl Pointer {
    pub fn new(input_region: Size) -> Result<Self> {
        assert!(input_region.width > 0 && input_region.height > 0);

        let monitors = Monitor::all().context("failed to enumerate monitors")?;
        let monitor = monitors
            .iter()
            .find(|monitor| monitor.is_primary())
            .or_else(|| monitors.first())
            .ok_or_else(|| anyhow!("no monitor available for pointer mapping"))?;

        let input_offset = Vector2::new(monitor.x() as f32, monitor.y() as f32);
        let input_scaling = Vector2::new(
            monitor.width() as f32 / input_region.width as f32,
            monitor.height() as f32 / input_region.height as f32,
        );

        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| anyhow!("failed to open the input connection: {e}"))?;

        Ok(Pointer {
            enigo,
            cursor: input_offset,
            input_offset,
            input_scaling,
            left_held: false,
            right_held: false,
        })
    }

    /// Moves the pointer to `coord` mapped into the monitor area, with
    /// optional motion smoothing.
    pub fn move_to(&mut self, coord: Point, smoothing: bool) -> Result<()> {
        let target = Vector2::new(
            coord.x as f32 * self.input_scaling.x + self.input_offset.x,
            coord.y as f32 * self.input_scaling.y + self.input_offset.y,
        );

        self.cursor = if smoothing {
            smooth_step(self.cursor, target)
        } else {
            target
        };

        self.enigo
            .move_mouse(
                self.cursor.x.round() as i32,
                self.cursor.y.round() as i32,
                Coordinate::Abs,
            )
            .map_err(|e| anyhow!("failed to move the pointer: {e}"))?;
        Ok(())
    }

    /// Latches the left button down. Repeated calls are no-ops until the
    /// hold is released.
    pub fn hold_left(&mut self) -> Result<()> {
        if !self.left_held {
            self.enigo
                .button(Button::Left, Direction::Press)
                .map_err(|e| anyhow!("failed to press the left button: {e}"))?;
            self.left_held = true;
        }
        Ok(())
    }

    /// Latches the right button down.
    pub fn hold_right(&mut self) -> Result<()> {
        if !self.right_held {
            self.enigo
                .button(Button::Right, Direction::Press)
                .map_err(|e| anyhow!("failed to press the right button: {e}"))?;
            self.right_held = true;
        }
        Ok(())
    }

    /// Releases whichever buttons are latched; a no-op otherwise.
    pub fn release_hold(&mut self) -> Result<()> {
        if self.left_held {
            self.enigo
                .button(Button::Left, Direction::Release)
                .map_err(|e| anyhow!("failed to release the left button: {e}"))?;
            self.left_held = false;
        }
        if self.right_held {
            self.enigo
                .button(Button::Right, Direction::Release)
                .map_err(|e| anyhow!("failed to release the right button: {e}"))?;
            self.right_held = false;
        }
        Ok(())
    }
}

/// One smoothing step towards `target`: snap past the jump threshold,
/// follow at the drag rate in between, damp to a stop below.
fn smooth_step(current: Vector2<f32>, target: Vector2<f32>) -> Vector2<f32> {
    let delta = target - current;
    let distance = delta.norm();
    if distance > JUMP_THRESHOLD {
        target
    } else if distance > DRAG_THRESHOLD {
        current + DRAG_RATE * delta
    } else {
        current + STOP_RATE * delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumps_snap_to_the_target() {
        let current = Vector2::new(0.0, 0.0);
        let target = Vector2::new(200.0, 0.0);
        assert_eq!(smooth_step(current, target), target);
    }

    #[test]
    fn drags_step_at_the_drag_rate() {
        let current = Vector2::new(0.0, 0.0);
        let target = Vector2::new(100.0, 0.0);
        let next = smooth_step(current, target);
        assert!((next.x - 80.0).abs() < 1e-5);
        assert_eq!(next.y, 0.0);
    }

    #[test]
    fn small_movements_damp_towards_a_stop() {
        // Ten pixels apart: five steps at the stop rate cover about 2.26.
        let target = Vector2::new(10.0, 0.0);
        let mut cursor = Vector2::new(0.0, 0.0);
        for _ in 0..5 {
            cursor = smooth_step(cursor, target);
        }
        assert!((cursor.x - 2.262).abs() < 1e-2, "cursor was at {}", cursor.x);
    }

    #[test]
    fn smoothing_is_a_contraction_below_the_jump_threshold() {
        let target = Vector2::new(40.0, 90.0);
        for start in [
            Vector2::new(0.0, 0.0),
            Vector2::new(39.0, 89.0),
            Vector2::new(-50.0, 20.0),
        ] {
            let next = smooth_step(start, target);
            assert!((next - target).norm() <= (start - target).norm());
        }
    }
}
