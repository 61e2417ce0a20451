//! Screen capture and the privacy transform applied before staging.

use crate::config::Settings;
use image::imageops::FilterType;
use image::ImageOutputFormat;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Placeholder in a capture command line replaced by the output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture backend available: {0}")]
    Unavailable(String),
    #[error("capture command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Produces one encoded image of the display per call.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Runs an external screenshot tool that writes an image file.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandCapture {
    /// Parse a whitespace-separated command line. If no argument contains
    /// `{output}`, the output path is appended as the last argument.
    pub fn parse(command_line: &str, scratch_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        let mut args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER)) {
            args.push(OUTPUT_PLACEHOLDER.to_string());
        }
        Some(Self {
            program,
            args,
            scratch_dir: scratch_dir.into(),
        })
    }

    /// Platform screenshot tool, if one is known.
    pub fn platform_default(scratch_dir: impl Into<PathBuf>) -> Option<Self> {
        if cfg!(target_os = "macos") {
            Self::parse("screencapture -x -t png {output}", scratch_dir)
        } else {
            None
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ScreenCapture for CommandCapture {
    fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let output = self
            .scratch_dir
            .join(format!("capture_{}.png", uuid::Uuid::new_v4().simple()));
        let output_str = output.to_string_lossy();

        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &output_str))
            .collect();

        let result = Command::new(&self.program).args(&args).output();
        let bytes = match result {
            Ok(out) if out.status.success() => std::fs::read(&output).map_err(CaptureError::from),
            Ok(out) => Err(CaptureError::Command {
                command: self.command_line(),
                reason: format!(
                    "exit {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            }),
            Err(e) => Err(CaptureError::Command {
                command: self.command_line(),
                reason: e.to_string(),
            }),
        };
        remove_quietly(&output);
        bytes
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = ?path, error = %e, "could not remove capture scratch file");
        }
    }
}

/// Used when no capture tool is configured; every cycle is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCapture;

impl ScreenCapture for NoopCapture {
    fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        Err(CaptureError::Unavailable(
            "set capture_command in the settings file".to_string(),
        ))
    }
}

/// Pick the capture backend for the given settings.
pub fn capture_from_settings(
    settings: &Settings,
) -> std::sync::Arc<dyn ScreenCapture> {
    let scratch = settings.staging_path.join("scratch");
    let configured = settings
        .capture_command
        .as_deref()
        .and_then(|line| CommandCapture::parse(line, scratch.clone()));
    match configured.or_else(|| CommandCapture::platform_default(scratch)) {
        Some(capture) => std::sync::Arc::new(capture),
        None => std::sync::Arc::new(NoopCapture),
    }
}

/// Resize and optional blur, re-encoded as PNG.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrivacyTransform {
    pub width: u32,
    pub height: u32,
    /// Gaussian blur sigma; `None` leaves the image sharp
    pub blur_sigma: Option<f32>,
}

impl From<&Settings> for PrivacyTransform {
    fn from(settings: &Settings) -> Self {
        Self {
            width: settings.resize_width.max(1),
            height: settings.resize_height.max(1),
            blur_sigma: settings
                .blur_screenshots
                .then_some(settings.blur_sigma)
                .filter(|s| *s > 0.0),
        }
    }
}

impl PrivacyTransform {
    pub fn apply(&self, encoded: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let mut img = image::load_from_memory(encoded)?;
        img = img.resize_exact(self.width, self.height, FilterType::Lanczos3);
        if let Some(sigma) = self.blur_sigma {
            img = img.blur(sigma);
        }

        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)?;
        Ok(out)
    }
}
