//! View calibration: geometric and photometric modelling of the
//! display-to-camera mapping.
//!
//! The geometric model bakes lens undistortion and a view homography into a
//! single per-pixel correction map, so a raw camera frame can be rectified
//! to display coordinates with one remap. The photometric model is a sparse
//! 8x8x8 display-to-camera colour lookup table plus a per-pixel reflectance
//! map, which together predict the camera's view of any rendered frame.

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use opencv::core::{
    self, Mat, Point, Point2f, Point3f, Scalar, Size, TermCriteria, Vec2f, Vec3b, Vec3f, Vector,
    CV_32FC2, CV_32FC3, CV_64FC1, CV_8UC1, CV_8UC3,
};
use opencv::prelude::*;
use opencv::{calib3d, highgui, imgproc};
use serde::{Deserialize, Serialize};

use crate::capture;
use crate::config;
use crate::error::CalibrationFailure;
use crate::webcam::Webcam;

// Colour map layout: 8x8x8 = 512 samples at a colour step of 1/7,
// indexed as x = B, y = G, z = R.
pub const CMAP_SIZE: usize = 8;
pub const CMAP_STEP: f32 = 1.0 / (CMAP_SIZE as f32 - 1.0);
const CMAP_VOLUME: usize = CMAP_SIZE * CMAP_SIZE * CMAP_SIZE;

// The colour cube is projected as two 16x16 tiled patterns of 256 cells.
const PATTERN_TILE: usize = 16;

const fn cube_index(x: usize, y: usize, z: usize) -> usize {
    (z * CMAP_SIZE + y) * CMAP_SIZE + x
}

/// Serialisable calibration state, safe to copy between worker contexts.
#[derive(Clone)]
pub struct ViewProperties {
    /// Working resolution of all rectified images.
    pub output_resolution: Size,
    /// 3x3 map from lens-corrected camera pixels to output coordinates.
    pub view_homography: Mat,
    /// Lens undistortion and homography baked into one per-pixel remap.
    pub correction_map: Mat,
    /// Corners of the physical display in the raw camera image,
    /// counter-clockwise from the top left.
    pub screen_contour: Vec<Point2f>,
    /// Camera colour observed for each quantised display colour.
    pub colour_map: Vec<Vec3f>,
    /// Per-pixel gain normalised to 1 at the white point; models surface
    /// albedo and camera vignetting.
    pub reflectance_map: Mat,
}

/// On-disk form of [`ViewProperties`]; lets a run skip calibration.
#[derive(Serialize, Deserialize)]
struct StoredProperties {
    width: i32,
    height: i32,
    view_homography: Vec<f64>,
    correction_map: Vec<[f32; 2]>,
    screen_contour: Vec<[f32; 2]>,
    colour_map: Vec<[f32; 3]>,
    reflectance_map: Vec<[f32; 3]>,
}

impl ViewProperties {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let stored = StoredProperties {
            width: self.output_resolution.width,
            height: self.output_resolution.height,
            view_homography: self.view_homography.data_typed::<f64>()?.to_vec(),
            correction_map: self
                .correction_map
                .data_typed::<Vec2f>()?
                .iter()
                .map(|v| [v[0], v[1]])
                .collect(),
            screen_contour: self.screen_contour.iter().map(|p| [p.x, p.y]).collect(),
            colour_map: self.colour_map.iter().map(|v| [v[0], v[1], v[2]]).collect(),
            reflectance_map: self
                .reflectance_map
                .data_typed::<Vec3f>()?
                .iter()
                .map(|v| [v[0], v[1], v[2]])
                .collect(),
        };
        fs::write(path, serde_json::to_string(&stored)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let stored: StoredProperties = serde_json::from_str(&fs::read_to_string(path)?)
            .context("failed to parse the stored calibration")?;
        let resolution = Size::new(stored.width, stored.height);
        let pixels = (stored.width * stored.height) as usize;
        ensure!(stored.width > 0 && stored.height > 0, "invalid stored resolution");
        ensure!(stored.view_homography.len() == 9, "invalid stored homography");
        ensure!(stored.correction_map.len() == pixels, "invalid stored correction map");
        ensure!(stored.colour_map.len() == CMAP_VOLUME, "invalid stored colour map");
        ensure!(stored.reflectance_map.len() == pixels, "invalid stored reflectance map");

        let correction: Vec<Vec2f> =
            stored.correction_map.iter().map(|v| Vec2f::from(*v)).collect();
        let reflectance: Vec<Vec3f> =
            stored.reflectance_map.iter().map(|v| Vec3f::from(*v)).collect();

        Ok(ViewProperties {
            output_resolution: resolution,
            view_homography: Mat::from_slice(&stored.view_homography)?
                .reshape(1, 3)?
                .try_clone()?,
            correction_map: Mat::from_slice(&correction)?
                .reshape(0, stored.height)?
                .try_clone()?,
            screen_contour: stored
                .screen_contour
                .iter()
                .map(|p| Point2f::new(p[0], p[1]))
                .collect(),
            colour_map: stored.colour_map.iter().map(|v| Vec3f::from(*v)).collect(),
            reflectance_map: Mat::from_slice(&reflectance)?
                .reshape(0, stored.height)?
                .try_clone()?,
        })
    }
}

/// Recovers and applies the display-to-camera mapping.
pub struct ViewCalibrator {
    output_resolution: Size,
    correction_map: Mat,
    view_homography: Mat,
    screen_contour: Vec<Point2f>,
    colour_map: Vec<Vec3f>,
    reflectance_map: Mat,
}

impl ViewCalibrator {
    pub fn new(output_resolution: Size) -> Result<Self> {
        assert!(output_resolution.width > 0 && output_resolution.height > 0);
        Ok(ViewCalibrator {
            output_resolution,
            correction_map: Mat::new_size_with_default(
                output_resolution,
                CV_32FC2,
                Scalar::all(0.0),
            )?,
            view_homography: Mat::eye(3, 3, CV_64FC1)?.to_mat()?,
            screen_contour: Vec::new(),
            colour_map: vec![Vec3f::default(); CMAP_VOLUME],
            reflectance_map: Mat::new_size_with_default(
                output_resolution,
                CV_32FC3,
                Scalar::all(1.0),
            )?,
        })
    }

    /// Rebuilds a calibrator from copied properties; used to hand a finished
    /// calibration to a worker thread.
    pub fn from_context(context: &ViewProperties) -> Self {
        ViewCalibrator {
            output_resolution: context.output_resolution,
            correction_map: context.correction_map.clone(),
            view_homography: context.view_homography.clone(),
            screen_contour: context.screen_contour.clone(),
            colour_map: context.colour_map.clone(),
            reflectance_map: context.reflectance_map.clone(),
        }
    }

    pub fn context(&self) -> ViewProperties {
        ViewProperties {
            output_resolution: self.output_resolution,
            view_homography: self.view_homography.clone(),
            correction_map: self.correction_map.clone(),
            screen_contour: self.screen_contour.clone(),
            colour_map: self.colour_map.clone(),
            reflectance_map: self.reflectance_map.clone(),
        }
    }

    pub fn output_resolution(&self) -> Size {
        self.output_resolution
    }

    /// Mean camera intensity when the display shows black; a lower bound on
    /// pixel values even in shadow.
    pub fn ambient_intensity(&self) -> f32 {
        let ambient = self.colour_map[0];
        (ambient[0] + ambient[1] + ambient[2]) / 3.0
    }

    /// Interactively fits the geometric and photometric models against the
    /// current camera view. Blocks on the user and loops until the display
    /// is fully visible with sufficient coverage.
    pub fn calibrate(
        &mut self,
        webcam: &mut Webcam,
        min_coverage: f64,
        settle_time_ms: u64,
    ) -> Result<()> {
        assert!(webcam.is_open());

        let window_name = "Screen Calibrator";
        capture::make_fullscreen_window(window_name)?;

        if !config::AUTO_START_CALIBRATION {
            capture::show_feedback(
                webcam,
                "Please ensure the entire screen is visible and in focus!",
                "Press any key to start the calibration...",
                window_name,
            )?;
        }

        // Calibration colours used for detecting the screen and later for
        // photometric calibration, chosen for their apparent brightness and
        // high green component, which is robust in practice.
        let calibration_colours = [
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            Scalar::new(255.0, 255.0, 0.0, 0.0),
            Scalar::new(0.0, 255.0, 255.0, 0.0),
        ];

        let mut colour_samples = vec![Mat::default(); calibration_colours.len()];
        let mut chessboard_sample = Mat::default();
        loop {
            if !config::SKIP_AUTO_EXPOSURE {
                capture::lock_exposure(webcam, 250.0, window_name)?;
            }

            for (sample, colour) in colour_samples.iter_mut().zip(&calibration_colours) {
                capture::capture_colour(
                    webcam,
                    sample,
                    *colour,
                    settle_time_ms,
                    config::CAPTURE_SAMPLES,
                    window_name,
                )?;
            }

            // Chessboard pattern for geometric lens distortion calibration.
            let chessboard_size = Size::new(config::CHESSBOARD_COLS, config::CHESSBOARD_ROWS);
            let chessboard_pattern =
                capture::make_chessboard(chessboard_size, Vec3b::all(0), Vec3b::all(255))?;
            capture::capture_image(
                webcam,
                &mut chessboard_sample,
                &chessboard_pattern,
                settle_time_ms,
                config::CAPTURE_SAMPLES,
                window_name,
            )?;

            let screen_corners = match self.find_geometric_model(
                &calibration_colours,
                &colour_samples,
                &chessboard_sample,
                chessboard_size,
            )? {
                Ok(corners) => corners,
                Err(failure) => {
                    log::warn!("Calibration pass failed: {failure}");
                    capture::show_feedback(
                        webcam,
                        failure.feedback(),
                        "Press any key to try again",
                        window_name,
                    )?;
                    continue;
                }
            };
            self.screen_contour = screen_corners;

            // The detected screen must meet the minimum coverage constraint.
            if !meets_coverage(&self.screen_contour, min_coverage, self.output_resolution)? {
                log::warn!("Calibration pass failed: {}", CalibrationFailure::LowCoverage);
                capture::show_feedback(
                    webcam,
                    CalibrationFailure::LowCoverage.feedback(),
                    "Press any key to try again",
                    window_name,
                )?;
                continue;
            }

            // Correct the colour samples so the photometric model is built
            // in rectified display coordinates.
            let mut corrected_samples = vec![Mat::default(); colour_samples.len()];
            for (sample, corrected) in colour_samples.iter().zip(corrected_samples.iter_mut()) {
                self.correct(sample, corrected)?;
            }

            self.find_photometric_model(
                webcam,
                settle_time_ms,
                window_name,
                &corrected_samples[0],
            )?;
            break;
        }

        // Show the detected screen outline to the user for a few seconds.
        let mut last_point = *self.screen_contour.last().expect("contour has four corners");
        for &point in &self.screen_contour {
            imgproc::line(
                &mut chessboard_sample,
                Point::new(last_point.x as i32, last_point.y as i32),
                Point::new(point.x as i32, point.y as i32),
                Scalar::new(255.0, 0.0, 255.0, 0.0),
                2,
                imgproc::LINE_8,
                0,
            )?;
            last_point = point;
        }
        highgui::imshow(window_name, &chessboard_sample)?;
        highgui::wait_key(2000)?;
        highgui::destroy_window(window_name)?;

        log::info!("View calibration complete");
        Ok(())
    }

    /// Rectifies a raw camera frame into display coordinates.
    pub fn correct(&self, src: &Mat, dst: &mut Mat) -> Result<()> {
        imgproc::remap(
            src,
            dst,
            &self.correction_map,
            &core::no_array(),
            imgproc::INTER_CUBIC,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;
        Ok(())
    }

    /// Predicts the camera's view of a rendered frame: a trilinear lookup in
    /// the colour map followed by the per-pixel reflectance gain. The output
    /// is CV_32FC3 in the range [0,255].
    pub fn predict(&self, src: &Mat, dst: &mut Mat) -> Result<()> {
        assert_eq!(src.typ(), CV_8UC3);
        debug_assert_eq!(src.size()?, self.output_resolution);

        if dst.size()? != src.size()? || dst.typ() != CV_32FC3 {
            *dst = Mat::new_size_with_default(src.size()?, CV_32FC3, Scalar::all(0.0))?;
        }

        let src_pixels = src.data_typed::<Vec3b>()?;
        let reflectance = self.reflectance_map.data_typed::<Vec3f>()?;
        let dst_pixels = dst.data_typed_mut::<Vec3f>()?;
        let map = &self.colour_map;

        for ((out, px), refl) in dst_pixels.iter_mut().zip(src_pixels).zip(reflectance) {
            let norm = [
                f32::from(px[0]) / 255.0,
                f32::from(px[1]) / 255.0,
                f32::from(px[2]) / 255.0,
            ];

            // Locate the sub-cube within the map. The index is clamped to
            // the last valid cell so a saturated channel interpolates to the
            // final node exactly.
            let x = ((norm[0] / CMAP_STEP) as usize).min(CMAP_SIZE - 2);
            let y = ((norm[1] / CMAP_STEP) as usize).min(CMAP_SIZE - 2);
            let z = ((norm[2] / CMAP_STEP) as usize).min(CMAP_SIZE - 2);

            let fx = (norm[0] - x as f32 * CMAP_STEP) / CMAP_STEP;
            let fy = (norm[1] - y as f32 * CMAP_STEP) / CMAP_STEP;
            let fz = (norm[2] - z as f32 * CMAP_STEP) / CMAP_STEP;

            let prediction = tlerp3(
                map[cube_index(x, y, z)],
                map[cube_index(x, y + 1, z)],
                map[cube_index(x + 1, y + 1, z)],
                map[cube_index(x + 1, y, z)],
                map[cube_index(x, y, z + 1)],
                map[cube_index(x, y + 1, z + 1)],
                map[cube_index(x + 1, y + 1, z + 1)],
                map[cube_index(x + 1, y, z + 1)],
                fx,
                fy,
                fz,
            );

            *out = Vec3f::from([
                prediction[0] * refl[0],
                prediction[1] * refl[1],
                prediction[2] * refl[2],
            ]);
        }

        Ok(())
    }

    /// Fits the geometric model and returns the raw screen corners, or the
    /// reason this pass has to be retried.
    fn find_geometric_model(
        &mut self,
        colours: &[Scalar],
        samples: &[Mat],
        chessboard_sample: &Mat,
        chessboard_size: Size,
    ) -> Result<std::result::Result<Vec<Point2f>, CalibrationFailure>> {
        assert!(chessboard_size.width > 2 && chessboard_size.height > 2);

        let webcam_resolution = chessboard_sample.size()?;

        // Raw screen contour from the colour samples.
        let screen_corners = match detect_screen(colours, samples)? {
            Ok(corners) => corners,
            Err(failure) => return Ok(Err(failure)),
        };

        // The screen contour bounds the chessboard search.
        let chessboard_corners =
            match detect_chessboard(&screen_corners, chessboard_sample, chessboard_size)? {
                Some(corners) => corners,
                None => return Ok(Err(CalibrationFailure::ChessboardNotFound)),
            };

        // Ideal (projected) chessboard corner grid in output coordinates.
        let square_width = self.output_resolution.width as f32 / chessboard_size.width as f32;
        let square_height = self.output_resolution.height as f32 / chessboard_size.height as f32;

        let mut ideal_chessboard_corners = Vector::<Point2f>::new();
        for r in 1..chessboard_size.height {
            for c in 1..chessboard_size.width {
                ideal_chessboard_corners
                    .push(Point2f::new(c as f32 * square_width, r as f32 * square_height));
            }
        }

        // Intrinsic camera properties from the single chessboard view.
        let mut ideal_corner_samples = Vector::<Vector<Point3f>>::new();
        ideal_corner_samples.push(
            ideal_chessboard_corners
                .iter()
                .map(|p| Point3f::new(p.x, p.y, 0.0))
                .collect(),
        );
        let mut corner_samples = Vector::<Vector<Point2f>>::new();
        corner_samples.push(chessboard_corners);

        let mut camera_matrix = Mat::default();
        let mut distortion_coefficients = Mat::default();
        calib3d::calibrate_camera(
            &ideal_corner_samples,
            &corner_samples,
            webcam_resolution,
            &mut camera_matrix,
            &mut distortion_coefficients,
            &mut core::no_array(),
            &mut core::no_array(),
            0,
            TermCriteria::new(
                core::TermCriteria_COUNT + core::TermCriteria_EPS,
                30,
                f64::EPSILON,
            )?,
        )?;

        let optimal_camera_matrix = calib3d::get_optimal_new_camera_matrix(
            &camera_matrix,
            &distortion_coefficients,
            webcam_resolution,
            1.0,
            webcam_resolution,
            None,
            false,
        )?;

        let mut lens_correction_map = Mat::default();
        calib3d::init_undistort_rectify_map(
            &camera_matrix,
            &distortion_coefficients,
            &core::no_array(),
            &optimal_camera_matrix,
            webcam_resolution,
            CV_32FC2,
            &mut lens_correction_map,
            &mut core::no_array(),
        )?;

        // Undistort the samples and re-run both detections so the
        // homography is fitted on lens-corrected points.
        let mut corrected_chessboard = Mat::default();
        imgproc::remap(
            chessboard_sample,
            &mut corrected_chessboard,
            &lens_correction_map,
            &core::no_array(),
            imgproc::INTER_LANCZOS4,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;

        let mut corrected_samples = vec![Mat::default(); samples.len()];
        for (sample, corrected) in samples.iter().zip(corrected_samples.iter_mut()) {
            imgproc::remap(
                sample,
                corrected,
                &lens_correction_map,
                &core::no_array(),
                imgproc::INTER_LANCZOS4,
                core::BORDER_CONSTANT,
                Scalar::default(),
            )?;
        }

        let corrected_screen_corners = match detect_screen(colours, &corrected_samples)? {
            Ok(corners) => corners,
            Err(failure) => return Ok(Err(failure)),
        };

        let corrected_chessboard_corners = match detect_chessboard(
            &corrected_screen_corners,
            &corrected_chessboard,
            chessboard_size,
        )? {
            Some(corners) => corners,
            None => return Ok(Err(CalibrationFailure::ChessboardNotFound)),
        };

        // Screen plus chessboard corners against their ideal positions.
        let mut screen_points = Vector::<Point2f>::new();
        for &corner in &corrected_screen_corners {
            screen_points.push(corner);
        }
        for corner in &corrected_chessboard_corners {
            screen_points.push(corner);
        }

        let br = Point2f::new(
            self.output_resolution.width as f32,
            self.output_resolution.height as f32,
        );
        let mut ideal_corners = Vector::<Point2f>::new();
        ideal_corners.push(Point2f::new(0.0, 0.0));
        ideal_corners.push(Point2f::new(0.0, br.y));
        ideal_corners.push(Point2f::new(br.x, br.y));
        ideal_corners.push(Point2f::new(br.x, 0.0));
        for corner in &ideal_chessboard_corners {
            ideal_corners.push(corner);
        }

        let mut usac_params = calib3d::UsacParams::default()?;
        usac_params.confidence = 0.999;
        usac_params.threshold = 3.0;
        usac_params.max_iterations = 1000;
        usac_params.sampler = calib3d::SamplingMethod::SAMPLING_UNIFORM;
        usac_params.score = calib3d::ScoreMethod::SCORE_METHOD_MAGSAC;
        usac_params.final_polisher = calib3d::PolishingMethod::MAGSAC;
        usac_params.final_polisher_iterations = 10;
        usac_params.lo_method = calib3d::LocalOptimMethod::LOCAL_OPTIM_SIGMA;
        usac_params.lo_iterations = 10;
        usac_params.lo_sample_size = 20;
        self.view_homography = calib3d::find_homography_1(
            &screen_points,
            &ideal_corners,
            &mut core::no_array(),
            usac_params,
        )?;

        // Bake the homography into the lens correction map.
        imgproc::warp_perspective(
            &lens_correction_map,
            &mut self.correction_map,
            &self.view_homography,
            self.output_resolution,
            imgproc::INTER_LANCZOS4,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;

        Ok(Ok(screen_corners))
    }

    /// Fits the photometric model: the reflectance map from the corrected
    /// white sample, then the 8x8x8 colour map from two projected tiles.
    fn find_photometric_model(
        &mut self,
        webcam: &mut Webcam,
        settle_time_ms: u64,
        window_name: &str,
        white_sample: &Mat,
    ) -> Result<()> {
        // Spatial reflectance of all pixels, normalised at the white point.
        let white_point = core::mean(white_sample, &core::no_array())?;
        let mut white_response = Mat::default();
        white_sample.convert_to(&mut white_response, CV_32FC3, 1.0, 0.0)?;

        self.reflectance_map =
            Mat::new_size_with_default(self.output_resolution, CV_32FC3, Scalar::default())?;
        {
            let response = white_response.data_typed::<Vec3f>()?;
            let reflectance = self.reflectance_map.data_typed_mut::<Vec3f>()?;
            for (refl, resp) in reflectance.iter_mut().zip(response) {
                *refl = Vec3f::from([
                    resp[0] / white_point[0] as f32,
                    resp[1] / white_point[1] as f32,
                    resp[2] / white_point[2] as f32,
                ]);
            }
        }

        let mut capture_buffer = Mat::default();
        let mut sample_buffer = Mat::default();
        let mut cpu_buffer = Mat::default();
        for k in 0..2usize {
            // Fill in the 16x16 colour pattern for this half of the cube.
            let mut pattern = Mat::new_size_with_default(
                Size::new(PATTERN_TILE as i32, PATTERN_TILE as i32),
                CV_8UC3,
                Scalar::default(),
            )?;
            for i in 0..PATTERN_TILE * PATTERN_TILE {
                let map_index = k * 256 + i;
                let x = map_index % CMAP_SIZE;
                let y = (map_index / CMAP_SIZE) % CMAP_SIZE;
                let z = map_index / (CMAP_SIZE * CMAP_SIZE);

                *pattern.at_2d_mut::<Vec3b>(
                    (i / PATTERN_TILE) as i32,
                    (i % PATTERN_TILE) as i32,
                )? = Vec3b::from([
                    quantised_level(x),
                    quantised_level(y),
                    quantised_level(z),
                ]);
            }

            capture::capture_image(
                webcam,
                &mut capture_buffer,
                &pattern,
                settle_time_ms,
                config::CAPTURE_SAMPLES,
                window_name,
            )?;
            self.correct(&capture_buffer, &mut sample_buffer)?;
            sample_buffer.convert_to(&mut cpu_buffer, CV_32FC3, 1.0, 0.0)?;

            if config::SHOW_PHOTOMETRIC_SAMPLES {
                let mut scaled = Mat::default();
                imgproc::resize(
                    &pattern,
                    &mut scaled,
                    sample_buffer.size()?,
                    0.0,
                    0.0,
                    imgproc::INTER_NEAREST,
                )?;
                show_side_by_side(&format!("Photometric Pattern {k}"), &[&scaled, &sample_buffer])?;
            }

            // Average each projected cell, removing the local reflectance so
            // the map holds pure display-to-camera colour responses.
            let cell_width = (self.output_resolution.width as usize) / PATTERN_TILE;
            let cell_height = (self.output_resolution.height as usize) / PATTERN_TILE;
            let row_stride = self.output_resolution.width as usize;

            let pixels = cpu_buffer.data_typed::<Vec3f>()?;
            let reflectance = self.reflectance_map.data_typed::<Vec3f>()?;
            for r in 0..PATTERN_TILE {
                for c in 0..PATTERN_TILE {
                    let mut measured = [0.0f32; 3];
                    for rr in 0..cell_height {
                        for rc in 0..cell_width {
                            let index = (r * cell_height + rr) * row_stride + c * cell_width + rc;
                            let raw = pixels[index];
                            let refl = reflectance[index];
                            measured[0] += raw[0] / refl[0];
                            measured[1] += raw[1] / refl[1];
                            measured[2] += raw[2] / refl[2];
                        }
                    }

                    let area = (cell_width * cell_height) as f32;
                    self.colour_map[k * 256 + r * PATTERN_TILE + c] = Vec3f::from([
                        measured[0] / area,
                        measured[1] / area,
                        measured[2] / area,
                    ]);
                }
            }
        }

        Ok(())
    }
}

/// Display level of a colour-cube node as an 8-bit channel value.
fn quantised_level(node: usize) -> u8 {
    (node as f32 * CMAP_STEP * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Detects the screen quadrilateral common to all colour samples and
/// returns its sub-pixel corners, counter-clockwise from the top left.
fn detect_screen(
    colours: &[Scalar],
    samples: &[Mat],
) -> Result<std::result::Result<Vec<Point2f>, CalibrationFailure>> {
    assert_eq!(samples.len(), colours.len());
    assert!(!samples.is_empty());

    // One mask per calibration colour, via Otsu on the absolute difference.
    let mut difference = Mat::default();
    let mut grey = Mat::default();
    let mut colour_masks = Vec::with_capacity(colours.len());
    for (sample, colour) in samples.iter().zip(colours) {
        let mut mask = Mat::default();
        core::absdiff(sample, colour, &mut difference)?;
        imgproc::cvt_color(&difference, &mut grey, imgproc::COLOR_BGR2GRAY, 0)?;
        imgproc::threshold(
            &grey,
            &mut mask,
            0.0,
            255.0,
            imgproc::THRESH_OTSU | imgproc::THRESH_BINARY_INV,
        )?;

        if config::SHOW_SCREEN_DETECT_MASKS {
            highgui::imshow(
                &format!("Mask Colour: ({},{},{})", colour[0], colour[1], colour[2]),
                &mask,
            )?;
            highgui::poll_key()?;
        }
        colour_masks.push(mask);
    }

    // Only the screen area survives the intersection of all masks.
    let mut mask =
        Mat::new_size_with_default(samples[0].size()?, CV_8UC1, Scalar::all(255.0))?;
    for colour_mask in &colour_masks {
        let mut intersection = Mat::default();
        core::bitwise_and(&mask, colour_mask, &mut intersection, &core::no_array())?;
        mask = intersection;
    }

    if config::SHOW_SCREEN_DETECT_MASKS {
        highgui::imshow("Screen Mask", &mask)?;
        highgui::poll_key()?;
    }

    // The screen region is assumed to be the largest external contour.
    let mut external_contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        &mask,
        &mut external_contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::default(),
    )?;

    let mut screen_contour = Vector::<Point>::new();
    let mut largest_area = 0.0;
    for contour in &external_contours {
        let area = imgproc::contour_area(&contour, false)?;
        if area > largest_area {
            largest_area = area;
            screen_contour = contour;
        }
    }
    if screen_contour.is_empty() {
        return Ok(Err(CalibrationFailure::ScreenNotFound(
            "no contour was detected".into(),
        )));
    }

    // A properly detected screen simplifies to exactly four vertices.
    let mut simplified = Vector::<Point>::new();
    imgproc::approx_poly_dp(&screen_contour, &mut simplified, 4.0, true)?;
    if simplified.len() != 4 {
        return Ok(Err(CalibrationFailure::ScreenNotFound(format!(
            "contour had {} vertices",
            simplified.len()
        ))));
    }

    // The whole screen must be visible, so the contour may not touch the
    // border of the image.
    let mut corners = Vector::<Point2f>::new();
    for vertex in &simplified {
        if vertex.x <= 0
            || vertex.y <= 0
            || vertex.x >= mask.cols() - 1
            || vertex.y >= mask.rows() - 1
        {
            return Ok(Err(CalibrationFailure::ScreenNotFound(
                "screen touches the border of the image".into(),
            )));
        }
        corners.push(Point2f::new(vertex.x as f32, vertex.y as f32));
    }
    imgproc::corner_sub_pix(
        &mask,
        &mut corners,
        Size::new(30, 30),
        Size::new(-1, -1),
        TermCriteria::new(core::TermCriteria_COUNT, 500, 0.0)?,
    )?;

    let ordered = order_corners([corners.get(0)?, corners.get(1)?, corners.get(2)?, corners.get(3)?]);
    Ok(Ok(ordered.to_vec()))
}

/// True when the screen contour covers at least `min_coverage` of the
/// working canvas area.
fn meets_coverage(contour: &[Point2f], min_coverage: f64, resolution: Size) -> Result<bool> {
    let contour: Vector<Point2f> = contour.iter().copied().collect();
    let area = imgproc::contour_area(&contour, false)?;
    Ok(area >= min_coverage * f64::from(resolution.area()))
}

/// Orders four corners counter-clockwise from the top left, by the quadrant
/// each corner occupies relative to the centroid.
fn order_corners(corners: [Point2f; 4]) -> [Point2f; 4] {
    let centroid = Point2f::new(
        0.25 * (corners[0].x + corners[1].x + corners[2].x + corners[3].x),
        0.25 * (corners[0].y + corners[1].y + corners[2].y + corners[3].y),
    );

    let mut ordered = [Point2f::default(); 4];
    for corner in corners {
        let index = if corner.x < centroid.x {
            if corner.y < centroid.y {
                0
            } else {
                1
            }
        } else if corner.y < centroid.y {
            3
        } else {
            2
        };
        ordered[index] = corner;
    }
    ordered
}

/// Locates the inner chessboard corners. The detector needs a border around
/// the pattern, so the area outside the screen contour is filled white.
fn detect_chessboard(
    screen_bounds: &[Point2f],
    chessboard_sample: &Mat,
    chessboard_size: Size,
) -> Result<Option<Vector<Point2f>>> {
    let inner_pattern_size = Size::new(chessboard_size.width - 1, chessboard_size.height - 1);

    let mut screen_contour = Vector::<Vector<Point>>::new();
    screen_contour.push(
        screen_bounds
            .iter()
            .map(|p| Point::new(p.x as i32, p.y as i32))
            .collect(),
    );

    let mut filled = Mat::new_size_with_default(
        chessboard_sample.size()?,
        CV_8UC3,
        Scalar::all(0.0),
    )?;
    imgproc::draw_contours(
        &mut filled,
        &screen_contour,
        -1,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::default(),
    )?;

    let mut inverted = Mat::default();
    core::bitwise_not(&filled, &mut inverted, &core::no_array())?;
    let mut bordered_sample = Mat::default();
    core::add(&inverted, chessboard_sample, &mut bordered_sample, &core::no_array(), -1)?;

    if config::SHOW_CHESSBOARD_DETECTION {
        highgui::imshow("Detection Pattern", &bordered_sample)?;
        highgui::poll_key()?;
    }

    let mut corners = Vector::<Point2f>::new();
    let corners_found = calib3d::find_chessboard_corners(
        &bordered_sample,
        inner_pattern_size,
        &mut corners,
        calib3d::CALIB_CB_ADAPTIVE_THRESH + calib3d::CALIB_CB_NORMALIZE_IMAGE,
    )?;

    if !corners_found {
        return Ok(None);
    }

    if config::SHOW_CHESSBOARD_DETECTION {
        calib3d::draw_chessboard_corners(
            &mut bordered_sample,
            inner_pattern_size,
            &corners,
            corners_found,
        )?;
        highgui::imshow("Chessboard Corners", &bordered_sample)?;
        highgui::poll_key()?;
    }

    Ok(Some(corners))
}

/// Shows several same-type images in one horizontally stitched window.
pub fn show_side_by_side(title: &str, images: &[&Mat]) -> Result<()> {
    let mut row = Vector::<Mat>::new();
    for image in images {
        row.push((*image).clone());
    }
    let mut container = Mat::default();
    core::hconcat(&row, &mut container)?;
    highgui::imshow(title, &container)?;
    highgui::poll_key()?;
    Ok(())
}

fn lerp3(v0: Vec3f, v1: Vec3f, x: f32) -> Vec3f {
    Vec3f::from([
        v0[0] + (v1[0] - v0[0]) * x,
        v0[1] + (v1[1] - v0[1]) * x,
        v0[2] + (v1[2] - v0[2]) * x,
    ])
}

fn blerp3(v00: Vec3f, v01: Vec3f, v11: Vec3f, v10: Vec3f, x: f32, y: f32) -> Vec3f {
    lerp3(lerp3(v00, v10, x), lerp3(v01, v11, x), y)
}

#[allow(clippy::too_many_arguments)]
fn tlerp3(
    v000: Vec3f,
    v010: Vec3f,
    v110: Vec3f,
    v100: Vec3f,
    v001: Vec3f,
    v011: Vec3f,
    v111: Vec3f,
    v101: Vec3f,
    x: f32,
    y: f32,
    z: f32,
) -> Vec3f {
    lerp3(
        blerp3(v000, v010, v110, v100, x, y),
        blerp3(v001, v011, v111, v101, x, y),
        z,
    )
}

/// Properties of a display whose photometric response is the identity:
/// every cube node maps to its own display colour under unit reflectance.
#[cfg(test)]
pub(crate) fn identity_properties(resolution: Size) -> ViewProperties {
    let mut colour_map = vec![Vec3f::default(); CMAP_VOLUME];
    for z in 0..CMAP_SIZE {
        for y in 0..CMAP_SIZE {
            for x in 0..CMAP_SIZE {
                colour_map[cube_index(x, y, z)] = Vec3f::from([
                    x as f32 * CMAP_STEP * 255.0,
                    y as f32 * CMAP_STEP * 255.0,
                    z as f32 * CMAP_STEP * 255.0,
                ]);
            }
        }
    }

    let width = resolution.width as f32;
    let height = resolution.height as f32;
    ViewProperties {
        output_resolution: resolution,
        view_homography: Mat::eye(3, 3, CV_64FC1).unwrap().to_mat().unwrap(),
        correction_map: Mat::new_size_with_default(resolution, CV_32FC2, Scalar::all(0.0))
            .unwrap(),
        screen_contour: vec![
            Point2f::new(0.0, 0.0),
            Point2f::new(0.0, height),
            Point2f::new(width, height),
            Point2f::new(width, 0.0),
        ],
        colour_map,
        reflectance_map: Mat::new_size_with_default(resolution, CV_32FC3, Scalar::all(1.0))
            .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_index_addresses_bgr_axes() {
        assert_eq!(cube_index(0, 0, 0), 0);
        assert_eq!(cube_index(1, 0, 0), 1);
        assert_eq!(cube_index(0, 1, 0), CMAP_SIZE);
        assert_eq!(cube_index(0, 0, 1), CMAP_SIZE * CMAP_SIZE);
        assert_eq!(cube_index(7, 7, 7), CMAP_VOLUME - 1);
    }

    #[test]
    fn tlerp_selects_corners_at_extremes() {
        let a = Vec3f::from([1.0, 2.0, 3.0]);
        let b = Vec3f::from([5.0, 6.0, 7.0]);
        let zero = Vec3f::default();

        let front = tlerp3(a, zero, zero, zero, b, zero, zero, zero, 0.0, 0.0, 0.0);
        assert_eq!(front, a);

        let back = tlerp3(a, zero, zero, zero, b, zero, zero, zero, 0.0, 0.0, 1.0);
        assert_eq!(back, b);
    }

    #[test]
    fn corner_ordering_is_quadrant_stable() {
        let tl = Point2f::new(10.0, 12.0);
        let bl = Point2f::new(8.0, 100.0);
        let br = Point2f::new(120.0, 104.0);
        let tr = Point2f::new(118.0, 9.0);

        // The same quad in several input orders always lands in the same slots.
        for corners in [[br, tl, tr, bl], [tl, bl, br, tr], [tr, br, bl, tl]] {
            let ordered = order_corners(corners);
            assert_eq!(ordered[0], tl);
            assert_eq!(ordered[1], bl);
            assert_eq!(ordered[2], br);
            assert_eq!(ordered[3], tr);
        }
    }

    #[test]
    fn predict_is_idempotent_at_cube_nodes() {
        let resolution = Size::new(16, 12);
        let calibrator = ViewCalibrator::from_context(&identity_properties(resolution));

        // Channels of 0 and 255 lie exactly on cube nodes.
        for colour in [
            Scalar::new(0.0, 0.0, 0.0, 0.0),
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            Scalar::new(255.0, 0.0, 0.0, 0.0),
            Scalar::new(0.0, 255.0, 0.0, 0.0),
        ] {
            let src = Mat::new_size_with_default(resolution, CV_8UC3, colour).unwrap();
            let mut dst = Mat::default();
            calibrator.predict(&src, &mut dst).unwrap();

            for pixel in dst.data_typed::<Vec3f>().unwrap() {
                assert!((pixel[0] - colour[0] as f32).abs() < 1e-3);
                assert!((pixel[1] - colour[1] as f32).abs() < 1e-3);
                assert!((pixel[2] - colour[2] as f32).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn predict_applies_reflectance_gain() {
        let resolution = Size::new(8, 8);
        let mut properties = identity_properties(resolution);
        properties.reflectance_map =
            Mat::new_size_with_default(resolution, CV_32FC3, Scalar::all(0.5)).unwrap();
        let calibrator = ViewCalibrator::from_context(&properties);

        let src = Mat::new_size_with_default(
            resolution,
            CV_8UC3,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
        )
        .unwrap();
        let mut dst = Mat::default();
        calibrator.predict(&src, &mut dst).unwrap();

        for pixel in dst.data_typed::<Vec3f>().unwrap() {
            assert!((pixel[0] - 127.5).abs() < 1e-3);
        }
    }

    #[test]
    fn ambient_intensity_is_mean_of_display_black() {
        let resolution = Size::new(8, 8);
        let mut properties = identity_properties(resolution);
        properties.colour_map[0] = Vec3f::from([30.0, 60.0, 90.0]);
        let calibrator = ViewCalibrator::from_context(&properties);
        assert!((calibrator.ambient_intensity() - 60.0).abs() < 1e-5);
    }

    #[test]
    fn correction_map_shifts_by_its_offsets() {
        let resolution = Size::new(32, 24);
        let mut properties = identity_properties(resolution);

        // A correction map holding (x+5, y+3) samples the source shifted.
        let mut map =
            Mat::new_size_with_default(resolution, CV_32FC2, Scalar::all(0.0)).unwrap();
        for y in 0..resolution.height {
            for x in 0..resolution.width {
                *map.at_2d_mut::<Vec2f>(y, x).unwrap() =
                    Vec2f::from([x as f32 + 5.0, y as f32 + 3.0]);
            }
        }
        properties.correction_map = map;
        let calibrator = ViewCalibrator::from_context(&properties);

        let mut src = Mat::new_size_with_default(resolution, CV_8UC1, Scalar::all(0.0)).unwrap();
        for y in 0..resolution.height {
            for x in 0..resolution.width {
                *src.at_2d_mut::<u8>(y, x).unwrap() = (x * 5 + y * 7) as u8;
            }
        }

        let mut dst = Mat::default();
        calibrator.correct(&src, &mut dst).unwrap();
        for y in 0..resolution.height - 3 {
            for x in 0..resolution.width - 5 {
                assert_eq!(
                    *dst.at_2d::<u8>(y, x).unwrap(),
                    *src.at_2d::<u8>(y + 3, x + 5).unwrap(),
                    "pixel ({x},{y})"
                );
            }
        }
    }

    #[test]
    fn undersized_screen_contours_are_rejected() {
        let resolution = Size::new(640, 480);
        let small = [
            Point2f::new(100.0, 100.0),
            Point2f::new(100.0, 150.0),
            Point2f::new(150.0, 150.0),
            Point2f::new(150.0, 100.0),
        ];
        // 2500 square pixels on a 307200 pixel canvas is under 10%.
        assert!(!meets_coverage(&small, 0.1, resolution).unwrap());

        let large = [
            Point2f::new(50.0, 50.0),
            Point2f::new(50.0, 430.0),
            Point2f::new(590.0, 430.0),
            Point2f::new(590.0, 50.0),
        ];
        assert!(meets_coverage(&large, 0.1, resolution).unwrap());
    }

    #[test]
    fn properties_survive_a_save_load_round_trip() {
        let resolution = Size::new(8, 6);
        let mut properties = identity_properties(resolution);
        properties.colour_map[42] = Vec3f::from([1.0, 2.0, 3.0]);

        let path = std::env::temp_dir().join("vtouch-view-properties.json");
        properties.save(&path).unwrap();
        let loaded = ViewProperties::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.output_resolution, resolution);
        assert_eq!(loaded.screen_contour, properties.screen_contour);
        assert_eq!(loaded.colour_map[42], properties.colour_map[42]);
        assert_eq!(
            loaded.correction_map.data_typed::<Vec2f>().unwrap(),
            properties.correction_map.data_typed::<Vec2f>().unwrap()
        );
        assert_eq!(
            loaded.reflectance_map.data_typed::<Vec3f>().unwrap(),
            properties.reflectance_map.data_typed::<Vec3f>().unwrap()
        );
    }
}
