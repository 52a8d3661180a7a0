//! Remote control channel
//!
//! Pointer, keyboard and framebuffer access to one remote display. The
//! shipped backend drives the `vncdo` command line client.

use async_trait::async_trait;
use image::DynamicImage;
use sightline_common::{Endpoint, Error, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::trace;

use crate::keys::KeyCode;

/// Pointer buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Middle,
    Right,
}

impl Button {
    /// VNC button number
    pub fn number(&self) -> u8 {
        match self {
            Button::Left => 1,
            Button::Middle => 2,
            Button::Right => 3,
        }
    }
}

#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn move_pointer(&self, x: u32, y: u32) -> Result<()>;

    async fn press_button(&self, button: Button) -> Result<()>;

    /// Press `keys` together; a single element is a plain key press
    async fn press_keys(&self, keys: &[KeyCode]) -> Result<()>;

    /// Save the current framebuffer to `path`
    async fn capture(&self, path: &Path) -> Result<()>;

    /// Capture and decode the current framebuffer
    async fn capture_frame(&self) -> Result<DynamicImage> {
        let file = tempfile::Builder::new()
            .prefix("sightline-")
            .suffix(".png")
            .tempfile()?;
        self.capture(file.path()).await?;
        let frame = image::open(file.path())
            .map_err(|e| Error::infrastructure(format!("Unreadable screen capture: {}", e)))?;
        Ok(frame)
    }
}

/// [`RemoteControl`] over the `vncdo` command line client
pub struct VncDoChannel {
    binary: String,
    server: String,
    password: Option<String>,
}

impl VncDoChannel {
    pub fn new(binary: impl Into<String>, endpoint: &Endpoint, password: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            // double colon: a port, not a display number
            server: format!("{}::{}", endpoint.host, endpoint.port),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        trace!("{} -s {} {}", self.binary, self.server, args.join(" "));

        let mut command = Command::new(&self.binary);
        command.arg("-s").arg(&self.server);
        if let Some(password) = &self.password {
            command.arg("-p").arg(password);
        }
        let output = command
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::infrastructure(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::infrastructure(format!(
                "vncdo {} on {} failed: {}",
                args.first().copied().unwrap_or(""),
                self.server,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteControl for VncDoChannel {
    async fn move_pointer(&self, x: u32, y: u32) -> Result<()> {
        self.run(&["move", &x.to_string(), &y.to_string()]).await
    }

    async fn press_button(&self, button: Button) -> Result<()> {
        self.run(&["click", &button.number().to_string()]).await
    }

    async fn press_keys(&self, keys: &[KeyCode]) -> Result<()> {
        match keys {
            [] => Ok(()),
            // `type` sends a character verbatim, `key` would split on '-'
            [KeyCode::Char(c)] => self.run(&["type", &c.to_string()]).await,
            _ => self.run(&["key", &combo_argument(keys)?]).await,
        }
    }

    async fn capture(&self, path: &Path) -> Result<()> {
        self.run(&["capture", &path.to_string_lossy()]).await
    }
}

/// `ctrl-alt-delete` style argument of `vncdo key`
fn combo_argument(keys: &[KeyCode]) -> Result<String> {
    keys.iter()
        .map(|key| match key {
            KeyCode::Key(k) => Ok(k.vnc_name()),
            KeyCode::Char('-') => Err(Error::usage("'-' cannot be part of a key combination")),
            KeyCode::Char(c) => Ok(c.to_string()),
        })
        .collect::<Result<Vec<_>>>()
        .map(|names| names.join("-"))
}
