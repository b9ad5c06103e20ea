//! Build-time configuration for the touchscreen pipeline.

// Host environment
pub const MONITOR_INDEX: usize = 0;
pub const WEBCAM_ID: i32 = 0;

// Program configuration
pub const WEBCAM_WIDTH: i32 = 640;
pub const WEBCAM_HEIGHT: i32 = 480;
pub const WEBCAM_FRAMERATE: i32 = 30;
pub const CALIB_SETTLE_TIME_MS: u64 = 1000;
pub const CALIB_OUTPUT_WIDTH: i32 = 640;
pub const CALIB_OUTPUT_HEIGHT: i32 = 480;
pub const CALIB_MIN_COVERAGE: f64 = 0.1;
pub const CHESSBOARD_COLS: i32 = 22;
pub const CHESSBOARD_ROWS: i32 = 18;
pub const CAPTURE_SAMPLES: i32 = 6;
pub const PREDICTION_DELAY: usize = 3;

// Calibration persistence. When the cache file exists and loading is
// enabled, the interactive calibration is skipped entirely.
pub const LOAD_SAVED_CALIBRATION: bool = false;
pub const CALIBRATION_CACHE_PATH: &str = "calibration.json";

// Debug configuration
pub const SHOW_RAW_WEBCAM_VIEW: bool = false;
pub const SHOW_AUTO_EXPOSURE_SAMPLES: bool = false;
pub const SHOW_CHESSBOARD_DETECTION: bool = false;
pub const SHOW_SCREEN_DETECT_MASKS: bool = false;
pub const SHOW_PHOTOMETRIC_SAMPLES: bool = false;
pub const SHOW_OUTPUT_PREDICTION: bool = false;
pub const SHOW_BACKSUB_OUTPUTS: bool = false;
pub const SHOW_TRACKING_OUTPUT: bool = false;
pub const SHOW_RATIO_PATCH: bool = false;

// Runtime controls
pub const AUTO_START_CALIBRATION: bool = false;
pub const SKIP_AUTO_EXPOSURE: bool = false;
pub const SHOW_LATENCIES: bool = false;
