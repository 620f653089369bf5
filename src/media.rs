// src/media.rs
//
// Conditional media pipeline: when the judge escalates an event, the ring
// buffer snapshot is written to a working MP4, re-encoded to a portable
// H.264 + AAC file by an external ffmpeg process, and uploaded together
// with the annotated trigger frame. Every step is independently failable;
// working files are removed on success and failure alike.

use crate::types::{Frame, StorageConfig};
use anyhow::{Context, Result};
use opencv::{
    core::{self, Mat},
    imgcodecs, imgproc,
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait},
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, error, info};

// ============================================================================
// IMAGE HELPERS
// ============================================================================

/// Encode raw RGB bytes into a JPEG. Returns None on failure.
pub fn encode_rgb_to_jpeg(rgb_data: &[u8], width: usize, height: usize, quality: u8) -> Option<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};
    use std::io::Cursor;

    let expected_len = width * height * 3;
    if rgb_data.len() < expected_len {
        return None;
    }

    let img: RgbImage =
        ImageBuffer::from_raw(width as u32, height as u32, rgb_data[..expected_len].to_vec())?;

    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    if img.write_with_encoder(encoder).is_ok() {
        Some(buf.into_inner())
    } else {
        None
    }
}

/// Extract the bbox region from a frame, clamped to frame bounds.
/// Returns None when the clamped region is empty.
pub fn crop_region(frame: &Frame, bbox: &[f32; 4]) -> Option<(Vec<u8>, usize, usize)> {
    let x1 = (bbox[0].max(0.0) as usize).min(frame.width);
    let y1 = (bbox[1].max(0.0) as usize).min(frame.height);
    let x2 = (bbox[2].max(0.0) as usize).min(frame.width);
    let y2 = (bbox[3].max(0.0) as usize).min(frame.height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let (w, h) = (x2 - x1, y2 - y1);
    let mut out = Vec::with_capacity(w * h * 3);
    for y in y1..y2 {
        let row = (y * frame.width + x1) * 3;
        out.extend_from_slice(&frame.data[row..row + w * 3]);
    }
    Some((out, w, h))
}

/// Draw the detection box + label on a copy of the frame and write it as
/// the alert's trigger still.
pub fn save_alert_frame(frame: &Frame, bbox: &[f32; 4], label: &str, path: &Path) -> Result<()> {
    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;

    let mut output = Mat::default();
    imgproc::cvt_color(&mat, &mut output, imgproc::COLOR_RGB2BGR, 0)?;

    let red = core::Scalar::new(0.0, 0.0, 255.0, 0.0);
    let x1 = bbox[0].max(0.0) as i32;
    let y1 = bbox[1].max(0.0) as i32;
    let w = (bbox[2] - bbox[0]).max(1.0) as i32;
    let h = (bbox[3] - bbox[1]).max(1.0) as i32;

    imgproc::rectangle(
        &mut output,
        core::Rect::new(x1, y1, w, h),
        red,
        2,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::put_text(
        &mut output,
        label,
        core::Point::new(x1, (y1 - 10).max(14)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        red,
        2,
        imgproc::LINE_8,
        false,
    )?;

    let path_str = path
        .to_str()
        .context("Alert frame path is not valid UTF-8")?;
    if !imgcodecs::imwrite(path_str, &output, &core::Vector::new())? {
        anyhow::bail!("OpenCV refused to write {path_str}");
    }
    debug!("📸 Alert frame saved: {}", path.display());
    Ok(())
}

// ============================================================================
// SCOPED TEMP CLEANUP
// ============================================================================

/// Removes its file on drop unless disarmed. Keeps encode/upload failure
/// paths from leaking working files.
pub struct TempArtifact {
    path: PathBuf,
    armed: bool,
}

impl TempArtifact {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The file graduated to a real artifact; stop guarding it.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                error!("Failed to remove working file {}: {e}", self.path.display());
            }
        }
    }
}

// ============================================================================
// CLIP RECORDER
// ============================================================================

/// Materialize a buffer snapshot into a portable clip on disk.
pub trait ClipRecorder: Send + Sync {
    fn materialize(&self, frames: &[Frame], tag: &str) -> Result<PathBuf>;
}

pub struct OpenCvClipRecorder {
    videos_dir: PathBuf,
    fps: f64,
}

impl OpenCvClipRecorder {
    pub fn new(videos_dir: &str, fps: f64) -> Result<Self> {
        std::fs::create_dir_all(videos_dir)
            .with_context(|| format!("Cannot create videos directory {videos_dir}"))?;
        Ok(Self {
            videos_dir: PathBuf::from(videos_dir),
            fps,
        })
    }
}

impl ClipRecorder for OpenCvClipRecorder {
    fn materialize(&self, frames: &[Frame], tag: &str) -> Result<PathBuf> {
        if frames.is_empty() {
            anyhow::bail!("Frame buffer snapshot is empty");
        }

        let clip_path = self.videos_dir.join(format!("alerta_{tag}.mp4"));
        let encoded_path = self.videos_dir.join(format!("alerta_{tag}_encoded.mp4"));

        let raw_guard = TempArtifact::new(clip_path.clone());
        let encoded_guard = TempArtifact::new(encoded_path.clone());

        write_buffer_to_video(frames, &clip_path, self.fps)?;
        info!("🎬 Working clip saved: {}", clip_path.display());

        encode_portable(&clip_path, &encoded_path)?;

        // Replace the working file with the portable encode
        std::fs::remove_file(&clip_path).context("Failed to remove working clip")?;
        std::fs::rename(&encoded_path, &clip_path).context("Failed to promote encoded clip")?;
        raw_guard.disarm();
        encoded_guard.disarm();

        info!("🎬 Clip encoded: {}", clip_path.display());
        Ok(clip_path)
    }
}

fn write_buffer_to_video(frames: &[Frame], path: &Path, fps: f64) -> Result<()> {
    let width = frames[0].width as i32;
    let height = frames[0].height as i32;

    let path_str = path.to_str().context("Clip path is not valid UTF-8")?;
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer = VideoWriter::new(
        path_str,
        fourcc,
        fps,
        core::Size::new(width, height),
        true,
    )?;
    if !writer.is_opened()? {
        anyhow::bail!("Failed to open clip writer at {path_str}");
    }

    for frame in frames {
        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(3, height)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color(&mat, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
        writer.write(&bgr)?;
    }
    writer.release()?;
    Ok(())
}

/// Re-encode to H.264 + AAC via the external ffmpeg binary so the clip
/// plays everywhere the operators need it to.
fn encode_portable(input: &Path, output: &Path) -> Result<()> {
    let result = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-c:v", "libx264", "-crf", "23", "-preset", "fast"])
        .args(["-c:a", "aac"])
        .arg(output)
        .output()
        .context("Failed to launch ffmpeg")?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        anyhow::bail!("ffmpeg exited with {}: {tail}", result.status);
    }
    Ok(())
}

// ============================================================================
// ASSET UPLOADER
// ============================================================================

/// Pushes media to long-term storage and returns the public URL.
/// Fail-soft: any transport or server error yields None.
pub trait AssetUploader: Send + Sync {
    fn upload_video(&self, path: &Path) -> Option<String>;
    fn upload_frame(&self, path: &Path) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
}

pub struct HttpAssetUploader {
    http_client: reqwest::blocking::Client,
    upload_url: String,
    api_key: Option<String>,
}

impl HttpAssetUploader {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build upload HTTP client")?;

        Ok(Self {
            http_client,
            upload_url: config.upload_url.clone(),
            api_key: config.upload_api_key.clone(),
        })
    }

    fn upload(&self, path: &Path, resource_type: &'static str) -> Result<String> {
        let form = reqwest::blocking::multipart::Form::new()
            .text("resource_type", resource_type)
            .file("file", path)
            .context("Failed to read upload file")?;

        let mut request = self.http_client.post(&self.upload_url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().context("Upload request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Upload endpoint returned {}", response.status());
        }

        let parsed: UploadResponse = response
            .json()
            .context("Failed to parse upload response")?;
        Ok(parsed.secure_url)
    }
}

impl AssetUploader for HttpAssetUploader {
    fn upload_video(&self, path: &Path) -> Option<String> {
        match self.upload(path, "video") {
            Ok(url) => {
                info!("🎥 Video uploaded: {url}");
                Some(url)
            }
            Err(e) => {
                error!("❌ Video upload failed: {e:#}");
                None
            }
        }
    }

    fn upload_frame(&self, path: &Path) -> Option<String> {
        match self.upload(path, "image") {
            Ok(url) => {
                info!("🖼️  Frame uploaded: {url}");
                Some(url)
            }
            Err(e) => {
                error!("❌ Frame upload failed: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: usize, height: usize, fill: u8) -> Frame {
        Frame {
            data: vec![fill; width * height * 3],
            width,
            height,
            timestamp_ms: 0.0,
        }
    }

    #[test]
    fn test_temp_artifact_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("working.mp4");
        std::fs::write(&path, b"x").unwrap();

        {
            let _guard = TempArtifact::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_disarmed_artifact_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.mp4");
        std::fs::write(&path, b"x").unwrap();

        let guard = TempArtifact::new(path.clone());
        guard.disarm();
        assert!(path.exists());
    }

    #[test]
    fn test_crop_region_clamps_to_frame() {
        let f = frame(10, 10, 50);
        let (crop, w, h) = crop_region(&f, &[-5.0, -5.0, 4.0, 6.0]).unwrap();
        assert_eq!((w, h), (4, 6));
        assert_eq!(crop.len(), 4 * 6 * 3);
    }

    #[test]
    fn test_crop_region_rejects_empty_box() {
        let f = frame(10, 10, 0);
        assert!(crop_region(&f, &[8.0, 8.0, 3.0, 3.0]).is_none());
        assert!(crop_region(&f, &[20.0, 2.0, 30.0, 8.0]).is_none());
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg_magic() {
        let f = frame(16, 16, 120);
        let jpeg = encode_rgb_to_jpeg(&f.data, f.width, f.height, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_jpeg_encode_rejects_short_buffer() {
        assert!(encode_rgb_to_jpeg(&[0u8; 10], 16, 16, 85).is_none());
    }
}
