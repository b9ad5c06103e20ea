//! Screen-content source: polling of the host display's framebuffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use xcap::Monitor;

use crate::error::PipelineError;

const CAPTURE_RATE_MS: u64 = 1000 / 60;

/// Source of the most recent framebuffer of a monitor, as an 8UC4 BGRA
/// image of the monitor's native size.
///
/// Callers must tolerate spurious repeats of the last frame.
pub trait ScreenSource: Send {
    /// Copies the most recent frame into `dst`. Returns `true` when a frame
    /// fresh since the previous read arrived within the timeout, `false`
    /// when the timeout expired first.
    fn read(&mut self, dst: &mut Mat, timeout_ms: u64) -> Result<bool>;
}

struct FrameSlot {
    frame: Mat,
    sequence: u64,
}

/// Monitor capture backed by a polling worker thread, so that reads are
/// cheap copies and never block on the capture backend itself.
pub struct ScreenCapture {
    slot: Arc<(Mutex<FrameSlot>, Condvar)>,
    run_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    last_sequence: u64,
}

impl ScreenCapture {
    /// Opens a capture stream for the monitor at `index` in the host's
    /// monitor enumeration.
    pub fn open_for_monitor(index: usize) -> Result<Self> {
        let monitors = Monitor::all()
            .map_err(|e| PipelineError::ScreenCaptureUnavailable(e.to_string()))?;
        let monitor = monitors.into_iter().nth(index).ok_or_else(|| {
            PipelineError::ScreenCaptureUnavailable(format!("no monitor at index {index}"))
        })?;

        log::info!(
            "Capturing monitor {} ({}x{})",
            monitor.name(),
            monitor.width(),
            monitor.height()
        );

        let slot = Arc::new((
            Mutex::new(FrameSlot { frame: Mat::default(), sequence: 0 }),
            Condvar::new(),
        ));
        let run_flag = Arc::new(AtomicBool::new(true));

        let worker_slot = Arc::clone(&slot);
        let worker_flag = Arc::clone(&run_flag);
        let worker = thread::Builder::new()
            .name("screen-capture".into())
            .spawn(move || capture_process(monitor, worker_slot, worker_flag))?;

        Ok(ScreenCapture {
            slot,
            run_flag,
            worker: Some(worker),
            last_sequence: 0,
        })
    }
}

impl ScreenSource for ScreenCapture {
    fn read(&mut self, dst: &mut Mat, timeout_ms: u64) -> Result<bool> {
        let (lock, condvar) = &*self.slot;
        let mut slot = lock.lock().unwrap();

        let deadline = Duration::from_millis(timeout_ms);
        let start = Instant::now();
        while slot.sequence == self.last_sequence {
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(remaining) => remaining,
                None => return Ok(false),
            };
            let (next, timeout) = condvar.wait_timeout(slot, remaining).unwrap();
            slot = next;
            if timeout.timed_out() && slot.sequence == self.last_sequence {
                return Ok(false);
            }
        }

        slot.frame.copy_to(dst)?;
        self.last_sequence = slot.sequence;
        Ok(true)
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn capture_process(
    monitor: Monitor,
    slot: Arc<(Mutex<FrameSlot>, Condvar)>,
    run_flag: Arc<AtomicBool>,
) {
    let mut bgra = Mat::default();
    while run_flag.load(Ordering::Relaxed) {
        let start = Instant::now();
        match monitor.capture_image() {
            Ok(image) => {
                if let Err(e) = image_to_bgra(image, &mut bgra) {
                    log::warn!("Dropping malformed screen frame: {e:#}");
                } else {
                    let (lock, condvar) = &*slot;
                    let mut slot = lock.lock().unwrap();
                    std::mem::swap(&mut slot.frame, &mut bgra);
                    slot.sequence += 1;
                    condvar.notify_all();
                }
            }
            Err(e) => log::warn!("Screen capture failed: {e}"),
        }

        if let Some(remaining) =
            Duration::from_millis(CAPTURE_RATE_MS).checked_sub(start.elapsed())
        {
            thread::sleep(remaining);
        }
    }
}

fn image_to_bgra(image: xcap::image::RgbaImage, dst: &mut Mat) -> Result<()> {
    let height = image.height() as i32;
    let data = image.into_raw();
    let rgba = Mat::from_slice(&data)?.reshape(4, height)?.try_clone()?;
    imgproc::cvt_color(&rgba, dst, imgproc::COLOR_RGBA2BGRA, 0)?;
    Ok(())
}
