//! Real-time segmentation of foreground and shadow against a predicted
//! view of the display contents.
//!
//! A predictor worker continuously turns captured screen frames into
//! predicted camera frames and publishes them into a small ring queue
//! shifted by a fixed number of frames, modelling the display-to-camera
//! round-trip latency. `segment` subtracts the appropriately delayed
//! prediction from each rectified camera frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use opencv::core::{
    self, Mat, Point, Rect, Scalar, Size, CV_32F, CV_32FC3, CV_8U, CV_8UC1,
};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::config;
use crate::screen::ScreenSource;
use crate::view::{self, ViewCalibrator, ViewProperties};

// Pixels darker than ambient plus this offset are classified as shadow.
const SHADOW_OFFSET: f64 = 50.0;
// Score threshold above the measured background noise floor.
const NOISE_OFFSET: f64 = 15.0;

const PREDICTION_RATE_HZ: u64 = 60;
const PREDICTION_RATE_MS: u64 = 1000 / PREDICTION_RATE_HZ;

/// Ring buffer of predicted frames realising a fixed delay: the entry at
/// the write index is the oldest, about to be overwritten, and is exactly
/// what the consumer reads.
struct FrameQueue {
    frames: Vec<Mat>,
    write_index: usize,
}

impl FrameQueue {
    fn new(length: usize, frame_size: Size) -> Result<Self> {
        assert!(length > 0);
        let mut frames = Vec::with_capacity(length);
        for _ in 0..length {
            frames.push(Mat::new_size_with_default(
                frame_size,
                CV_32FC3,
                Scalar::all(0.0),
            )?);
        }
        Ok(FrameQueue { frames, write_index: 0 })
    }

    fn push(&mut self, frame: &Mat) -> Result<()> {
        frame.copy_to(&mut self.frames[self.write_index])?;
        self.write_index = (self.write_index + 1) % self.frames.len();
        Ok(())
    }

    fn read_into(&self, dst: &mut Mat) -> Result<()> {
        self.frames[self.write_index].copy_to(dst)?;
        Ok(())
    }
}

/// Concurrent background-subtraction engine producing foreground and
/// shadow masks for each rectified camera frame.
pub struct MaskGenerator {
    sharpening_kernel: Mat,
    morph_kernel: Mat,
    score_weights: Mat,

    view: Mat,
    background: Mat,
    difference: Mat,
    score: Mat,
    raw_mask: Mat,
    mask_a: Mat,
    mask_b: Mat,
    noise_mask: Mat,
    border_mask: Mat,
    background_mask: Mat,
    grey_view: Mat,

    ambient_intensity: f64,
    queue: Arc<Mutex<FrameQueue>>,
    run_flag: Arc<AtomicBool>,
    predictor: Option<JoinHandle<()>>,
}

impl MaskGenerator {
    pub fn new() -> Result<Self> {
        // Light sharpening kernel applied to the camera view before the
        // difference, to keep finger edges from washing out.
        let sharpening_kernel = Mat::from_slice_2d(&[
            [0.00f32, -0.25, 0.00],
            [-0.25, 2.00, -0.25],
            [0.00, -0.25, 0.00],
        ])?;

        let morph_kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(3, 3),
            Point::new(-1, -1),
        )?;

        // Red-biased projection of the colour difference, exploiting the
        // red dominance of skin reflectance.
        let score_weights = Mat::from_slice(&[0.75f32, 0.75, 1.00])?.try_clone()?;

        Ok(MaskGenerator {
            sharpening_kernel,
            morph_kernel,
            score_weights,
            view: Mat::default(),
            background: Mat::default(),
            difference: Mat::default(),
            score: Mat::default(),
            raw_mask: Mat::default(),
            mask_a: Mat::default(),
            mask_b: Mat::default(),
            noise_mask: Mat::default(),
            border_mask: Mat::default(),
            background_mask: Mat::default(),
            grey_view: Mat::default(),
            ambient_intensity: 0.0,
            queue: Arc::new(Mutex::new(FrameQueue::new(1, Size::new(1, 1))?)),
            run_flag: Arc::new(AtomicBool::new(false)),
            predictor: None,
        })
    }

    /// Allocates buffers and launches the predictor worker with a copy of
    /// the calibration. Transitions to the running state.
    pub fn start(
        &mut self,
        screen: Box<dyn ScreenSource>,
        calibration: &ViewCalibrator,
    ) -> Result<()> {
        assert!(self.predictor.is_none(), "mask generator is already running");

        self.arm(calibration)?;

        let properties = calibration.context();
        let queue = Arc::clone(&self.queue);
        let run_flag = Arc::clone(&self.run_flag);
        self.predictor = Some(
            thread::Builder::new()
                .name("predictor".into())
                .spawn(move || {
                    if let Err(e) = predictor_process(screen, properties, queue, run_flag) {
                        log::error!("Predictor worker aborted: {e:#}");
                    }
                })?,
        );

        log::info!("Mask generator running");
        Ok(())
    }

    /// Buffer allocation and state shared by `start` and the tests, which
    /// drive the queue without a worker thread.
    fn arm(&mut self, calibration: &ViewCalibrator) -> Result<()> {
        let input_size = calibration.output_resolution();

        // Border mask: a rectangle one pixel in from the canvas edge, used
        // to keep blobs that enter from outside the screen.
        self.border_mask =
            Mat::new_size_with_default(input_size, CV_8UC1, Scalar::all(0.0))?;
        imgproc::rectangle(
            &mut self.border_mask,
            Rect::new(0, 0, input_size.width, input_size.height),
            Scalar::all(255.0),
            1,
            imgproc::LINE_8,
            0,
        )?;

        // Before the first segmentation every pixel counts as background.
        self.background_mask =
            Mat::new_size_with_default(input_size, CV_8UC1, Scalar::all(255.0))?;

        self.ambient_intensity = f64::from(calibration.ambient_intensity());

        self.queue = Arc::new(Mutex::new(FrameQueue::new(
            config::PREDICTION_DELAY,
            input_size,
        )?));
        self.run_flag = Arc::new(AtomicBool::new(true));
        Ok(())
    }

    /// Segments the rectified camera frame into a foreground mask and a
    /// shadow mask. Only valid while running; deterministic given the
    /// current queue state.
    pub fn segment(
        &mut self,
        view: &Mat,
        foreground_mask: &mut Mat,
        shadow_mask: &mut Mat,
    ) -> Result<()> {
        assert!(
            self.run_flag.load(Ordering::Relaxed),
            "segment called outside the running state"
        );

        imgproc::filter_2d(
            view,
            &mut self.view,
            CV_32F,
            &self.sharpening_kernel,
            Point::new(-1, -1),
            0.0,
            core::BORDER_DEFAULT,
        )?;

        self.queue.lock().unwrap().read_into(&mut self.background)?;

        // Dynamic background subtraction between the prediction and the
        // camera view, projected to a single score channel.
        core::absdiff(&self.background, &self.view, &mut self.difference)?;
        core::transform(&self.difference, &mut self.score, &self.score_weights)?;

        // Minimal differences belong to the background.
        let noise_floor = core::mean(&self.score, &self.background_mask)?[0];
        imgproc::threshold(
            &self.score,
            &mut self.raw_mask,
            noise_floor + NOISE_OFFSET,
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        self.raw_mask.convert_to(&mut self.mask_a, CV_8U, 1.0, 0.0)?;

        if config::SHOW_OUTPUT_PREDICTION {
            let mut view_8u = Mat::default();
            let mut background_8u = Mat::default();
            let mut mask_bgr = Mat::default();
            self.view.convert_to(&mut view_8u, CV_8U, 1.0, 0.0)?;
            self.background.convert_to(&mut background_8u, CV_8U, 1.0, 0.0)?;
            imgproc::cvt_color(&self.mask_a, &mut mask_bgr, imgproc::COLOR_GRAY2BGR, 0)?;
            view::show_side_by_side(
                "View vs. Prediction vs. Raw Mask",
                &[&view_8u, &background_8u, &mask_bgr],
            )?;
        }

        // Erode away small noise and thin lines.
        imgproc::erode(
            &self.mask_a,
            &mut self.mask_b,
            &self.morph_kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        // Remove any blob that is not connected to the screen border: a
        // hand always enters from outside the screen, so flood-filling the
        // border ring erases exactly the blobs that touch it, and the
        // subtraction keeps them while interior blobs vanish.
        core::add(
            &self.mask_b,
            &self.border_mask,
            &mut self.noise_mask,
            &core::no_array(),
            -1,
        )?;
        imgproc::flood_fill(
            &mut self.noise_mask,
            Point::new(0, 0),
            Scalar::all(0.0),
            None,
            Scalar::default(),
            Scalar::default(),
            4,
        )?;
        core::subtract(
            &self.mask_b,
            &self.noise_mask,
            &mut self.mask_a,
            &core::no_array(),
            -1,
        )?;
        core::subtract(
            &self.mask_a,
            &self.border_mask,
            &mut self.mask_b,
            &core::no_array(),
            -1,
        )?;

        // Dilate the mask back out and smooth away jagged edges.
        imgproc::dilate(
            &self.mask_b,
            &mut self.mask_a,
            &self.morph_kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        imgproc::box_filter(
            &self.mask_a,
            &mut self.mask_b,
            -1,
            Size::new(5, 5),
            Point::new(-1, -1),
            true,
            core::BORDER_DEFAULT,
        )?;
        imgproc::threshold(&self.mask_b, foreground_mask, 192.0, 255.0, imgproc::THRESH_BINARY)?;

        // Shadow: darker than ambient within the foreground area. The
        // brightly lit background is rejected by masking it to white first.
        core::bitwise_not(foreground_mask, &mut self.background_mask, &core::no_array())?;
        imgproc::cvt_color(view, &mut self.grey_view, imgproc::COLOR_BGR2GRAY, 0)?;
        self.grey_view.set_to(&Scalar::all(255.0), &self.background_mask)?;
        imgproc::threshold(
            &self.grey_view,
            shadow_mask,
            self.ambient_intensity + SHADOW_OFFSET,
            255.0,
            imgproc::THRESH_BINARY_INV,
        )?;

        if config::SHOW_BACKSUB_OUTPUTS {
            highgui::imshow("Foreground Mask", foreground_mask)?;
            highgui::imshow("Shadow Mask", shadow_mask)?;
            highgui::poll_key()?;
        }

        Ok(())
    }

    /// Clears the running flag and joins the worker. Idempotent.
    pub fn stop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(worker) = self.predictor.take() {
            if worker.join().is_err() {
                log::error!("Predictor worker panicked");
            }
        }
    }
}

impl Drop for MaskGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Predictor worker loop: polls the screen source at the prediction rate,
/// predicts the camera appearance of fresh frames and publishes into the
/// latency queue. On a timeout the previous prediction is republished so
/// the queue keeps advancing at a fixed cadence.
fn predictor_process(
    mut screen: Box<dyn ScreenSource>,
    properties: ViewProperties,
    queue: Arc<Mutex<FrameQueue>>,
    run_flag: Arc<AtomicBool>,
) -> Result<()> {
    let calibrator = ViewCalibrator::from_context(&properties);
    let resolution = properties.output_resolution;

    let mut raw_capture = Mat::default();
    let mut bgr_capture = Mat::default();
    let mut frame = Mat::default();
    let mut prediction =
        Mat::new_size_with_default(resolution, CV_32FC3, Scalar::all(0.0))?;

    let period = Duration::from_millis(PREDICTION_RATE_MS);
    while run_flag.load(Ordering::Relaxed) {
        let start = Instant::now();

        // A fresh screen frame gets downsampled and predicted; a timeout
        // leaves the previous prediction in place.
        if screen.read(&mut raw_capture, PREDICTION_RATE_MS - 1)? {
            imgproc::cvt_color(&raw_capture, &mut bgr_capture, imgproc::COLOR_BGRA2BGR, 0)?;
            imgproc::resize(
                &bgr_capture,
                &mut frame,
                resolution,
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            calibrator.predict(&frame, &mut prediction)?;
        }

        // Hold the prediction cadence before publishing.
        while start.elapsed() < period {
            thread::yield_now();
        }

        queue.lock().unwrap().push(&prediction)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::identity_properties;
    use opencv::core::{Vec3f, CV_8UC3};

    fn constant_frame(size: Size, value: f64) -> Mat {
        Mat::new_size_with_default(size, CV_32FC3, Scalar::all(value)).unwrap()
    }

    #[test]
    fn queue_delays_by_exactly_its_length() {
        let size = Size::new(4, 4);
        let mut queue = FrameQueue::new(3, size).unwrap();
        let mut out = Mat::default();

        // Three pushes must pass before the first frame comes back out.
        for value in 1..=6 {
            queue.read_into(&mut out).unwrap();
            let expected = if value <= 3 { 0.0 } else { f64::from(value - 3) };
            assert_eq!(
                *out.at_2d::<Vec3f>(0, 0).unwrap(),
                Vec3f::all(expected as f32),
                "before push {value}"
            );
            queue.push(&constant_frame(size, f64::from(value))).unwrap();
        }
    }

    #[test]
    fn static_scene_produces_empty_masks() {
        let resolution = Size::new(64, 48);
        let calibrator = ViewCalibrator::from_context(&identity_properties(resolution));
        let mut generator = MaskGenerator::new().unwrap();
        generator.arm(&calibrator).unwrap();

        // Fill the queue with the predicted view of a constant grey screen.
        let grey = Mat::new_size_with_default(resolution, CV_8UC3, Scalar::all(128.0)).unwrap();
        let mut prediction = Mat::default();
        calibrator.predict(&grey, &mut prediction).unwrap();
        for _ in 0..config::PREDICTION_DELAY {
            generator.queue.lock().unwrap().push(&prediction).unwrap();
        }

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        for _ in 0..3 {
            generator.segment(&grey, &mut foreground, &mut shadow).unwrap();
            assert_eq!(core::count_non_zero(&foreground).unwrap(), 0);
            assert_eq!(core::count_non_zero(&shadow).unwrap(), 0);
        }
    }

    #[test]
    fn border_connected_blobs_survive_interior_blobs_vanish() {
        let resolution = Size::new(64, 48);
        let calibrator = ViewCalibrator::from_context(&identity_properties(resolution));
        let mut generator = MaskGenerator::new().unwrap();
        generator.arm(&calibrator).unwrap();

        let background = Mat::new_size_with_default(resolution, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut prediction = Mat::default();
        calibrator.predict(&background, &mut prediction).unwrap();
        for _ in 0..config::PREDICTION_DELAY {
            generator.queue.lock().unwrap().push(&prediction).unwrap();
        }

        // A bright blob rising from the bottom border and a detached bright
        // blob floating in the interior.
        let mut view = background.clone();
        imgproc::rectangle(
            &mut view,
            Rect::new(20, 24, 14, 24),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        imgproc::rectangle(
            &mut view,
            Rect::new(44, 8, 10, 10),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        generator.segment(&view, &mut foreground, &mut shadow).unwrap();

        // The border-connected blob survives the flood fill.
        let entering = Mat::roi(&foreground, Rect::new(22, 30, 10, 14)).unwrap();
        assert!(core::count_non_zero(&entering).unwrap() > 0);

        // The interior blob is removed entirely.
        let floating = Mat::roi(&foreground, Rect::new(42, 6, 14, 14)).unwrap();
        assert_eq!(core::count_non_zero(&floating).unwrap(), 0);
    }

    #[test]
    fn a_finger_entering_from_the_bottom_drives_a_touch() {
        let resolution = Size::new(640, 480);
        let calibrator = ViewCalibrator::from_context(&identity_properties(resolution));
        let mut generator = MaskGenerator::new().unwrap();
        generator.arm(&calibrator).unwrap();

        let background =
            Mat::new_size_with_default(resolution, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut prediction = Mat::default();
        calibrator.predict(&background, &mut prediction).unwrap();
        for _ in 0..config::PREDICTION_DELAY {
            generator.queue.lock().unwrap().push(&prediction).unwrap();
        }

        let mut tracker = crate::finger_tracker::FingerTracker::new(resolution);
        let mut decider = crate::touch::TouchDecider::new();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        let mut last_action = None;
        let mut last_id = None;
        for frame in 0..8 {
            // The fingertip rises from the bottom edge, 10 pixels per frame.
            let cap_y = 420 - frame * 10;
            let mut view = background.clone();
            draw_finger(&mut view, 320, cap_y);

            generator.segment(&view, &mut foreground, &mut shadow).unwrap();
            let fingertips = tracker.detect(&foreground, &shadow).unwrap();
            assert_eq!(fingertips.len(), 1, "frame {frame}");
            assert_eq!(fingertips[0].age, frame as usize + 1);
            if let Some(id) = last_id {
                assert_eq!(fingertips[0].id, id);
            }
            last_id = Some(fingertips[0].id);

            last_action = decider
                .decide(&fingertips, &foreground, &shadow, &view)
                .unwrap();
            if frame < 4 {
                assert!(last_action.is_none(), "age gate on frame {frame}");
            }
        }

        // A shadow-free finger blob means coincident shadow: contact.
        let action = last_action.expect("an aged fingertip produces an action");
        assert!(action.touch);
        assert!((action.point.x - 320).abs() < 20);
        assert!((action.point.y - (350 - 15)).abs() < 20);
    }

    #[test]
    fn shadow_around_the_fingertip_suppresses_the_touch() {
        let resolution = Size::new(640, 480);
        let calibrator = ViewCalibrator::from_context(&identity_properties(resolution));
        let mut generator = MaskGenerator::new().unwrap();
        generator.arm(&calibrator).unwrap();

        let background =
            Mat::new_size_with_default(resolution, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut prediction = Mat::default();
        calibrator.predict(&background, &mut prediction).unwrap();
        for _ in 0..config::PREDICTION_DELAY {
            generator.queue.lock().unwrap().push(&prediction).unwrap();
        }

        let mut tracker = crate::finger_tracker::FingerTracker::new(resolution);
        let mut decider = crate::touch::TouchDecider::new();

        // A dark core at the tip reads as shadow without changing the blob
        // silhouette: the cast shadow is not coincident with the finger.
        let cap_y = 360;
        let mut view = background.clone();
        draw_finger(&mut view, 320, cap_y);
        imgproc::circle(
            &mut view,
            Point::new(320, cap_y),
            12,
            Scalar::all(30.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        let mut last_action = None;
        for frame in 0..6 {
            generator.segment(&view, &mut foreground, &mut shadow).unwrap();
            let fingertips = tracker.detect(&foreground, &shadow).unwrap();
            assert_eq!(fingertips.len(), 1, "frame {frame}");
            last_action = decider
                .decide(&fingertips, &foreground, &shadow, &view)
                .unwrap();
        }

        // The shadowed tip never classifies as a touch.
        assert!(last_action.map_or(true, |action| !action.touch));

        // The dark core landed in both masks.
        let core_roi = Rect::new(310, cap_y - 10, 20, 20);
        assert!(
            core::count_non_zero(&Mat::roi(&shadow, core_roi).unwrap()).unwrap() > 0,
            "dark core reads as shadow"
        );
        assert!(
            core::count_non_zero(&Mat::roi(&foreground, core_roi).unwrap()).unwrap() > 0,
            "dark core stays foreground"
        );
    }

    /// A finger-shaped blob: a stem rising from the bottom edge capped
    /// with a disc.
    fn draw_finger(view: &mut Mat, tip_x: i32, cap_y: i32) {
        imgproc::rectangle(
            view,
            Rect::new(tip_x - 15, cap_y, 30, view.rows() - cap_y),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        imgproc::circle(
            view,
            Point::new(tip_x, cap_y),
            15,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "running state")]
    fn segment_before_start_is_a_contract_violation() {
        let mut generator = MaskGenerator::new().unwrap();
        let view = Mat::new_size_with_default(Size::new(8, 8), CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        let _ = generator.segment(&view, &mut foreground, &mut shadow);
    }
}
