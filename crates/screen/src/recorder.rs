//! Screen recording
//!
//! Frames are scaled to the configured size and piped as raw RGB into an
//! ffmpeg process that encodes the video file.

use image::imageops::FilterType;
use image::DynamicImage;
use sightline_common::config::RecordingConfig;
use sightline_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

pub struct VideoRecorder {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    frames: u64,
}

impl VideoRecorder {
    /// Spawn the encoder writing to `path`
    pub fn start(config: &RecordingConfig, path: &Path) -> Result<Self> {
        let size = format!("{}x{}", config.width, config.height);
        let fps = config.fps.to_string();
        let mut child = Command::new(&config.ffmpeg)
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", size.as_str(), "-r", fps.as_str(), "-i", "-"])
            .args(["-c:v", config.codec.as_str()])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::infrastructure(format!("Cannot start video encoder {}: {}", config.ffmpeg, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::infrastructure("video encoder has no input pipe"))?;
        debug!("Recording {} at {} to {}", size, config.fps, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            width: config.width,
            height: config.height,
            child,
            stdin: Some(stdin),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one frame, scaling it to the video size
    pub async fn write_frame(&mut self, frame: &DynamicImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::infrastructure("video stream already closed"))?;

        let rgb = if frame.width() == self.width && frame.height() == self.height {
            frame.to_rgb8()
        } else {
            frame
                .resize_exact(self.width, self.height, FilterType::Triangle)
                .to_rgb8()
        };
        stdin.write_all(rgb.as_raw()).await?;
        self.frames += 1;
        Ok(())
    }

    /// Close the stream and wait for the encoder to finish the file
    pub async fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await.ok();
        }
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            warn!(
                "Video encoder exited with {} for {}: {}",
                output.status,
                self.path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        } else {
            debug!("Recorded {} frames to {}", self.frames, self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_encoder_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ..Default::default()
        };
        assert!(VideoRecorder::start(&config, &dir.path().join("out.ogv")).is_err());
    }
}
