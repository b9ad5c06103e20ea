//! Failure kinds surfaced by the pipeline.

use std::error::Error;
use std::fmt;

/// Unrecoverable pipeline failures. These surface to the top level and
/// terminate the program; everything else is handled where it occurs.
#[derive(Debug)]
pub enum PipelineError {
    /// The camera hardware could not be opened or queried.
    CameraUnavailable(i32),
    /// No display-capture handle could be obtained for the monitor.
    ScreenCaptureUnavailable(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::CameraUnavailable(id) => {
                write!(f, "failed to open webcam with hardware id {id}")
            }
            PipelineError::ScreenCaptureUnavailable(reason) => {
                write!(f, "failed to open screen capture: {reason}")
            }
        }
    }
}

impl Error for PipelineError {}

/// Reasons an interactive calibration pass must be re-run. These are
/// recovered locally by re-prompting the user, never by aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationFailure {
    /// The screen contour was missing, malformed or touching the border.
    ScreenNotFound(String),
    /// The projected chessboard corners could not be located.
    ChessboardNotFound,
    /// The screen contour covers too little of the camera view.
    LowCoverage,
}

impl CalibrationFailure {
    /// User-facing prompt shown on the calibration window before retrying.
    pub fn feedback(&self) -> &'static str {
        match self {
            CalibrationFailure::ScreenNotFound(_) | CalibrationFailure::ChessboardNotFound => {
                "Failed to find screen or chessboard corners"
            }
            CalibrationFailure::LowCoverage => "Please move the camera closer",
        }
    }
}

impl fmt::Display for CalibrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationFailure::ScreenNotFound(reason) => {
                write!(f, "screen detection failed: {reason}")
            }
            CalibrationFailure::ChessboardNotFound => {
                write!(f, "chessboard corners were not found")
            }
            CalibrationFailure::LowCoverage => {
                write!(f, "screen contour is below the minimum coverage")
            }
        }
    }
}
