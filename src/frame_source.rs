// src/frame_source.rs

use crate::types::{CameraConfig, Frame};
use anyhow::Result;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst},
};
use tracing::info;

/// Yields frames on demand. `Ok(None)` means the stream ended; both `None`
/// and `Err` terminate the detection session.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// Live camera or network stream via OpenCV.
pub struct CameraSource {
    cap: VideoCapture,
    fps: f64,
    width: i32,
    height: i32,
    current_frame: u64,
}

impl CameraSource {
    /// Open a device index ("0") or a stream URL ("rtsp://...").
    pub fn open(config: &CameraConfig) -> Result<Self> {
        info!("Opening camera source: {}", config.source);

        let cap = match config.source.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            Err(_) => VideoCapture::from_file(&config.source, videoio::CAP_ANY)?,
        };

        if !cap.is_opened()? {
            anyhow::bail!("Failed to open camera or stream: {}", config.source);
        }

        let mut fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        if !fps.is_finite() || fps <= 0.0 {
            fps = config.fallback_fps;
        }
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!("Stream properties: {}x{} @ {:.1} FPS", width, height, fps);

        Ok(Self {
            cap,
            fps,
            width,
            height,
            current_frame: 0,
        })
    }

}

impl FrameSource for CameraSource {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();

        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        self.current_frame += 1;
        let timestamp_ms = (self.current_frame as f64 / self.fps) * 1000.0;

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb_mat.data_bytes()?.to_vec();

        Ok(Some(Frame {
            data,
            width: self.width as usize,
            height: self.height as usize,
            timestamp_ms,
        }))
    }
}
