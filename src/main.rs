//! Turns an ordinary display observed by a camera into a virtual
//! touchscreen: calibrates the display-to-camera mapping, segments hands
//! against a predicted view of the screen contents, tracks fingertips and
//! drives the host pointer from the touch decision.

mod capture;
mod config;
mod error;
mod finger_tracker;
mod mask;
mod pointer;
mod screen;
mod touch;
mod view;
mod webcam;

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use opencv::core::{Mat, Size};
use opencv::highgui;

use crate::finger_tracker::FingerTracker;
use crate::mask::MaskGenerator;
use crate::pointer::Pointer;
use crate::screen::ScreenCapture;
use crate::touch::TouchDecider;
use crate::view::{ViewCalibrator, ViewProperties};
use crate::webcam::Webcam;

#[derive(Parser)]
#[command(name = "vtouch", about = "Turns a camera-observed display into a virtual touchscreen")]
struct Args {
    /// Camera hardware id
    camera: Option<i32>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let webcam_id = args.camera.unwrap_or(config::WEBCAM_ID);

    let webcam = match Webcam::open(
        webcam_id,
        Size::new(config::WEBCAM_WIDTH, config::WEBCAM_HEIGHT),
        config::WEBCAM_FRAMERATE,
    ) {
        Ok(webcam) => webcam,
        Err(e) => {
            log::error!("Failed to load webcam with hardware id {webcam_id}: {e:#}");
            std::process::exit(-1);
        }
    };

    if let Err(e) = run(webcam) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(mut webcam: Webcam) -> Result<()> {
    log::info!(
        "Loaded webcam ({}x{}@{})",
        webcam.width,
        webcam.height,
        webcam.framerate
    );

    let output_resolution = Size::new(config::CALIB_OUTPUT_WIDTH, config::CALIB_OUTPUT_HEIGHT);
    let calibrator = calibrate_view(&mut webcam, output_resolution)?;

    // Touchscreen systems.
    let screen = ScreenCapture::open_for_monitor(config::MONITOR_INDEX)?;
    let mut mask_generator = MaskGenerator::new()?;
    let mut finger_tracker = FingerTracker::new(output_resolution);
    let mut decider = TouchDecider::new();
    let mut pointer = Pointer::new(output_resolution)?;

    mask_generator.start(Box::new(screen), &calibrator)?;

    // Main processing loop.
    let mut raw_frame = Mat::default();
    let mut screen_frame = Mat::default();
    let mut foreground_mask = Mat::default();
    let mut shadow_mask = Mat::default();
    let mut frame_start = Instant::now();
    while webcam.next_frame(&mut raw_frame)? {
        let process_start = Instant::now();

        if config::SHOW_RAW_WEBCAM_VIEW {
            highgui::imshow("Raw Capture", &raw_frame)?;
            highgui::poll_key()?;
        }

        calibrator.correct(&raw_frame, &mut screen_frame)?;
        mask_generator.segment(&screen_frame, &mut foreground_mask, &mut shadow_mask)?;

        // Detect fingertips in the foreground mask and register touches.
        let fingertips = finger_tracker.detect(&foreground_mask, &shadow_mask)?;
        match decider.decide(&fingertips, &foreground_mask, &shadow_mask, &screen_frame)? {
            Some(action) => {
                finger_tracker.focus(action.point, Size::new(256, 256));
                pointer.move_to(action.point, true)?;
                if action.touch {
                    pointer.hold_left()?;
                }
            }
            None => pointer.release_hold()?,
        }

        if config::SHOW_LATENCIES {
            let frame_ms = frame_start.elapsed().as_secs_f32() * 1000.0;
            let process_ms = process_start.elapsed().as_secs_f32() * 1000.0;
            log::info!(
                "Latency: {process_ms:.2}/{frame_ms:.2}ms ({:.1}%)",
                process_ms / frame_ms * 100.0
            );
            frame_start = Instant::now();
        }
    }

    mask_generator.stop();
    Ok(())
}

/// Produces the view calibration, either interactively or from the cache
/// file when enabled, persisting fresh calibrations for later runs.
fn calibrate_view(webcam: &mut Webcam, output_resolution: Size) -> Result<ViewCalibrator> {
    if config::LOAD_SAVED_CALIBRATION && Path::new(config::CALIBRATION_CACHE_PATH).exists() {
        match ViewProperties::load(config::CALIBRATION_CACHE_PATH) {
            Ok(properties) if properties.output_resolution == output_resolution => {
                log::info!("Loaded calibration from {}", config::CALIBRATION_CACHE_PATH);
                return Ok(ViewCalibrator::from_context(&properties));
            }
            Ok(_) => log::warn!("Stored calibration has a stale resolution, recalibrating"),
            Err(e) => log::warn!("Failed to load the stored calibration: {e:#}"),
        }
    }

    let mut calibrator = ViewCalibrator::new(output_resolution)?;
    calibrator.calibrate(webcam, config::CALIB_MIN_COVERAGE, config::CALIB_SETTLE_TIME_MS)?;

    if let Err(e) = calibrator.context().save(config::CALIBRATION_CACHE_PATH) {
        log::warn!("Failed to persist the calibration: {e:#}");
    }
    Ok(calibrator)
}
