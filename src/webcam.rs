//! Camera frame source.

use anyhow::{Context, Result};
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use crate::error::PipelineError;

/// A live camera stream with its negotiated properties.
///
/// The target size and framerate passed to [`Webcam::open`] are requests,
/// not guarantees; the fields reflect what the hardware actually granted.
pub struct Webcam {
    stream: VideoCapture,
    pub framerate: i32,
    pub latency_ms: i32,
    pub width: i32,
    pub height: i32,
}

impl Webcam {
    pub fn open(id: i32, target_size: Size, target_framerate: i32) -> Result<Self> {
        assert!(target_size.width > 0 && target_size.height > 0);
        assert!(target_framerate > 0);

        let mut stream = VideoCapture::new(id, videoio::CAP_ANY)
            .context("failed to construct the camera stream")?;
        if !stream.is_opened()? {
            return Err(PipelineError::CameraUnavailable(id).into());
        }

        stream.set(videoio::CAP_PROP_FPS, f64::from(target_framerate))?;
        stream.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(target_size.width))?;
        stream.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(target_size.height))?;

        let framerate = stream.get(videoio::CAP_PROP_FPS)? as i32;
        let width = stream.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = stream.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        if framerate <= 0 || width <= 0 || height <= 0 {
            return Err(PipelineError::CameraUnavailable(id).into());
        }

        Ok(Webcam {
            stream,
            framerate,
            latency_ms: (1000.0 / framerate as f32).round() as i32,
            width,
            height,
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_opened().unwrap_or(false)
    }

    /// Burns a buffered frame without decoding it.
    pub fn drop_frame(&mut self) -> Result<()> {
        self.stream.grab()?;
        Ok(())
    }

    pub fn next_frame(&mut self, dst: &mut Mat) -> Result<bool> {
        Ok(self.stream.read(dst)?)
    }

    /// Raw stream handle for exposure/focus/white-balance control.
    pub fn raw_mut(&mut self) -> &mut VideoCapture {
        &mut self.stream
    }
}
