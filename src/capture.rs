//! Interactive capture primitives shared by the calibration routines:
//! fullscreen pattern display, exposure locking and averaged captures.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size, Vec3b, CV_64FC3, CV_8UC3};
use opencv::prelude::*;
use opencv::{highgui, imgproc, videoio};

use crate::config;
use crate::webcam::Webcam;

/// Creates (or re-asserts) a fullscreen, always-on-top window and returns
/// its screen rectangle.
pub fn make_fullscreen_window(window_name: &str) -> Result<Rect> {
    highgui::named_window(window_name, highgui::WINDOW_GUI_NORMAL)?;
    highgui::set_window_property(window_name, highgui::WND_PROP_TOPMOST, 1.0)?;
    highgui::set_window_property(
        window_name,
        highgui::WND_PROP_FULLSCREEN,
        f64::from(highgui::WINDOW_FULLSCREEN),
    )?;
    Ok(highgui::get_window_image_rect(window_name)?)
}

/// Locks focus, white balance and gain, then walks the exposure level down
/// until a captured white frame no longer clips past `brightness_target`.
///
/// Subsequent colour measurements stay linear and projector-dominant.
pub fn lock_exposure(webcam: &mut Webcam, brightness_target: f64, window_name: &str) -> Result<()> {
    assert!(brightness_target > 0.0 && brightness_target < 255.0);

    {
        let cam = webcam.raw_mut();

        // Lock the focus where it already is.
        cam.set(videoio::CAP_PROP_AUTOFOCUS, 0.0)?;
        let focus = cam.get(videoio::CAP_PROP_FOCUS)?;
        cam.set(videoio::CAP_PROP_FOCUS, focus)?;

        // Pin the white balance to a neutral temperature.
        cam.set(videoio::CAP_PROP_AUTO_WB, 0.0)?;
        cam.set(videoio::CAP_PROP_WB_TEMPERATURE, 4500.0)?;

        cam.set(videoio::CAP_PROP_AUTO_EXPOSURE, 0.25)?;
        cam.set(videoio::CAP_PROP_GAIN, 0.0)?;
    }

    let settle_ms = u64::try_from(webcam.latency_ms).unwrap_or(0) * 2;
    let mut sample = Mat::default();
    let mut intensity = Mat::default();
    let mut exposure_level = 0;
    loop {
        webcam
            .raw_mut()
            .set(videoio::CAP_PROP_EXPOSURE, f64::from(exposure_level))?;
        exposure_level -= 1;

        capture_colour(webcam, &mut sample, Scalar::all(255.0), settle_ms, 3, window_name)?;
        imgproc::cvt_color(&sample, &mut intensity, imgproc::COLOR_BGR2GRAY, 0)?;

        let mut max_brightness = 0.0;
        core::min_max_loc(
            &intensity,
            None,
            Some(&mut max_brightness),
            None,
            None,
            &core::no_array(),
        )?;

        if config::SHOW_AUTO_EXPOSURE_SAMPLES {
            highgui::imshow(
                &format!("Exposure: {exposure_level}  Max Intensity: {max_brightness}"),
                &intensity,
            )?;
            highgui::poll_key()?;
        }

        if max_brightness <= brightness_target {
            return Ok(());
        }
    }
}

/// Displays a uniform colour fullscreen and captures its averaged camera view.
pub fn capture_colour(
    webcam: &mut Webcam,
    dst: &mut Mat,
    colour: Scalar,
    settle_time_ms: u64,
    capture_samples: i32,
    window_name: &str,
) -> Result<()> {
    let colour_image = Mat::new_size_with_default(Size::new(1, 1), CV_8UC3, colour)?;
    capture_image(webcam, dst, &colour_image, settle_time_ms, capture_samples, window_name)
}

/// Displays an image fullscreen, waits for the projection and the camera to
/// settle, then averages `capture_samples` frames into `dst`.
pub fn capture_image(
    webcam: &mut Webcam,
    dst: &mut Mat,
    image: &Mat,
    settle_time_ms: u64,
    capture_samples: i32,
    window_name: &str,
) -> Result<()> {
    assert!(capture_samples >= 1);

    make_fullscreen_window(window_name)?;
    highgui::imshow(window_name, image)?;
    highgui::poll_key()?;

    thread::sleep(Duration::from_millis(settle_time_ms));

    // Burn buffered frames so the average only sees the settled pattern.
    webcam.drop_frame()?;
    webcam.drop_frame()?;
    webcam.drop_frame()?;
    webcam.next_frame(dst)?;
    webcam.next_frame(dst)?;
    webcam.next_frame(dst)?;

    if capture_samples > 1 {
        let mut average = Mat::new_size_with_default(
            Size::new(webcam.width, webcam.height),
            CV_64FC3,
            Scalar::all(0.0),
        )?;
        for _ in 0..capture_samples {
            webcam.next_frame(dst)?;
            imgproc::accumulate(dst, &mut average, &core::no_array())?;
        }
        average.convert_to(dst, CV_8UC3, 1.0 / f64::from(capture_samples), 0.0)?;
    }

    Ok(())
}

/// Shows a live camera preview with header and footer text until the user
/// presses any key.
pub fn show_feedback(
    webcam: &mut Webcam,
    top_text: &str,
    bot_text: &str,
    window_name: &str,
) -> Result<()> {
    let window_region = make_fullscreen_window(window_name)?;
    let window_size = window_region.size();

    // Scale the camera view to fit between the header and footer bands.
    const HEADER_SIZE: f32 = 80.0;
    const FOOTER_SIZE: f32 = 80.0;
    let vertical_space = window_size.height as f32 - HEADER_SIZE - FOOTER_SIZE;

    let hs = vertical_space / webcam.height as f32;
    let ws = window_size.width as f32 / webcam.width as f32;
    let scaling = hs.min(ws);

    let webcam_size = Size::new(
        (webcam.width as f32 * scaling) as i32,
        (webcam.height as f32 * scaling) as i32,
    );
    let webcam_slot = Rect::new(
        (window_size.width - webcam_size.width) / 2,
        (window_size.height - webcam_size.height) / 2,
        webcam_size.width,
        webcam_size.height,
    );

    let mut window_frame = Mat::new_size_with_default(window_size, CV_8UC3, Scalar::all(255.0))?;
    let mut webcam_frame = Mat::default();
    let mut webcam_scaled_frame = Mat::default();
    while highgui::wait_key(webcam.latency_ms)? == -1 {
        window_frame.set_to(&Scalar::all(255.0), &core::no_array())?;

        webcam.next_frame(&mut webcam_frame)?;
        imgproc::resize(
            &webcam_frame,
            &mut webcam_scaled_frame,
            webcam_size,
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        let mut slot = Mat::roi_mut(&mut window_frame, webcam_slot)?;
        webcam_scaled_frame.copy_to(&mut slot)?;

        imgproc::put_text(
            &mut window_frame,
            top_text,
            Point::new(10, 50),
            imgproc::FONT_HERSHEY_COMPLEX_SMALL,
            2.0,
            Scalar::all(0.0),
            3,
            imgproc::LINE_AA,
            false,
        )?;
        imgproc::put_text(
            &mut window_frame,
            bot_text,
            Point::new(10, window_size.height - 50),
            imgproc::FONT_HERSHEY_COMPLEX_SMALL,
            2.0,
            Scalar::all(0.0),
            3,
            imgproc::LINE_AA,
            false,
        )?;

        highgui::imshow(window_name, &window_frame)?;
    }

    Ok(())
}

/// Builds a chessboard pattern of the given cell dimensions by tiling a
/// 2x2 sub-pattern.
pub fn make_chessboard(size: Size, colour_1: Vec3b, colour_2: Vec3b) -> Result<Mat> {
    assert!(size.width % 2 == 0 && size.height % 2 == 0);
    assert!(size.width > 1 && size.height > 1);

    let mut sub_pattern = Mat::new_size_with_default(Size::new(2, 2), CV_8UC3, Scalar::all(0.0))?;
    *sub_pattern.at_2d_mut::<Vec3b>(0, 0)? = colour_1;
    *sub_pattern.at_2d_mut::<Vec3b>(0, 1)? = colour_2;
    *sub_pattern.at_2d_mut::<Vec3b>(1, 1)? = colour_1;
    *sub_pattern.at_2d_mut::<Vec3b>(1, 0)? = colour_2;

    let mut full_pattern = Mat::default();
    core::repeat(&sub_pattern, size.height / 2, size.width / 2, &mut full_pattern)?;
    Ok(full_pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chessboard_tiles_alternate() {
        let black = Vec3b::all(0);
        let white = Vec3b::all(255);
        let board = make_chessboard(Size::new(22, 18), black, white).unwrap();

        assert_eq!(board.cols(), 22);
        assert_eq!(board.rows(), 18);
        assert_eq!(*board.at_2d::<Vec3b>(0, 0).unwrap(), black);
        assert_eq!(*board.at_2d::<Vec3b>(0, 1).unwrap(), white);
        assert_eq!(*board.at_2d::<Vec3b>(1, 0).unwrap(), white);
        assert_eq!(*board.at_2d::<Vec3b>(17, 21).unwrap(), black);
    }
}
