//! Screen automation session
//!
//! A [`Session`] binds one remote display to one image catalog and turns
//! script intents ("wait for this screen", "click that button", "type
//! this") into captures, matches and input events.

use image::DynamicImage;
use sightline_common::config::{DisplayConfig, RecordingConfig};
use sightline_common::{Error, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::catalog::ImageCatalog;
use crate::channel::{Button, RemoteControl};
use crate::keys::KeyInput;
use crate::matcher::{MatchResult, TemplateMatcher};
use crate::recorder::VideoRecorder;
use crate::reference::ReferenceImage;

/// Timing of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub find_timeout: Duration,
    pub wait_timeout: Duration,
    pub typing_delay: Duration,
    pub double_click_gap: Duration,
    pub recording: RecordingConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&DisplayConfig::default(), &RecordingConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(display: &DisplayConfig, recording: &RecordingConfig) -> Self {
        Self {
            poll_interval: display.poll_interval(),
            find_timeout: display.find_timeout(),
            wait_timeout: display.wait_timeout(),
            typing_delay: display.typing_delay(),
            double_click_gap: display.double_click_gap(),
            recording: recording.clone(),
        }
    }
}

/// What to look for: one image or an ordered list of candidates
#[derive(Debug, Clone)]
pub enum Target {
    Image(Arc<ReferenceImage>),
    Name(String),
    Any(Vec<Target>),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Image(image) => write!(f, "{}", image.name()),
            Target::Name(name) => write!(f, "{}", name),
            Target::Any(targets) => {
                write!(f, "[")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", target)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<Arc<ReferenceImage>> for Target {
    fn from(image: Arc<ReferenceImage>) -> Self {
        Target::Image(image)
    }
}

impl<T: Into<Target>> From<Vec<T>> for Target {
    fn from(targets: Vec<T>) -> Self {
        Target::Any(targets.into_iter().map(Into::into).collect())
    }
}

/// Where a pointer action lands
#[derive(Debug, Clone)]
pub enum Position {
    Point(u32, u32),
    Match(MatchResult),
    /// Resolved with a `find` using the default timeout
    Target(Target),
}

impl From<(u32, u32)> for Position {
    fn from((x, y): (u32, u32)) -> Self {
        Position::Point(x, y)
    }
}

impl From<MatchResult> for Position {
    fn from(m: MatchResult) -> Self {
        Position::Match(m)
    }
}

impl From<&str> for Position {
    fn from(name: &str) -> Self {
        Position::Target(name.into())
    }
}

impl From<Target> for Position {
    fn from(target: Target) -> Self {
        Position::Target(target)
    }
}

/// Terminal state of one polling loop
#[derive(Debug)]
pub enum Poll {
    Found(MatchResult),
    TimedOut,
}

/// Automation bound to one remote display
pub struct Session {
    channel: Box<dyn RemoteControl>,
    matcher: Box<dyn TemplateMatcher>,
    catalog: ImageCatalog,
    settings: SessionSettings,
    recorder: Option<VideoRecorder>,
}

impl Session {
    pub fn new(
        channel: Box<dyn RemoteControl>,
        matcher: Box<dyn TemplateMatcher>,
        catalog: ImageCatalog,
        settings: SessionSettings,
    ) -> Self {
        Self {
            channel,
            matcher,
            catalog,
            settings,
            recorder: None,
        }
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    pub fn set_catalog(&mut self, catalog: ImageCatalog) {
        self.catalog = catalog;
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Catalog image by name
    pub fn image(&self, name: &str) -> Result<Arc<ReferenceImage>> {
        self.catalog
            .get(name)
            .ok_or_else(|| Error::usage(format!("no image named '{}' in the catalog", name)))
    }

    fn candidates(&self, target: &Target) -> Result<Vec<Arc<ReferenceImage>>> {
        match target {
            Target::Image(image) => Ok(vec![image.clone()]),
            Target::Name(name) => Ok(vec![self.image(name)?]),
            Target::Any(targets) => {
                if targets.is_empty() {
                    return Err(Error::usage("empty list of images to look for"));
                }
                let mut all = Vec::new();
                for target in targets {
                    all.extend(self.candidates(target)?);
                }
                Ok(all)
            }
        }
    }

    /// Capture until one of `candidates` is on screen or `timeout` elapses
    ///
    /// Every cycle takes exactly one capture and tests the candidates in
    /// order against it. Failing captures are retried like missing images;
    /// if not a single capture succeeds, the last capture error is returned.
    pub async fn poll(&mut self, candidates: &[Arc<ReferenceImage>], timeout: Duration) -> Result<Poll> {
        let deadline = Instant::now() + timeout;
        let mut captured = false;
        let mut last_error = None;

        loop {
            match self.channel.capture_frame().await {
                Ok(frame) => {
                    captured = true;
                    self.record(&frame).await;
                    let screen = frame.to_luma8();
                    for candidate in candidates {
                        if let Some(found) = self.matcher.find(&screen, candidate)? {
                            trace!("{} matched with {:.3}", candidate.name(), found.confidence);
                            return Ok(Poll::Found(found));
                        }
                    }
                }
                Err(e) => {
                    debug!("Screen capture failed: {}", e);
                    last_error = Some(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }

        match last_error {
            Some(e) if !captured => Err(e),
            _ => Ok(Poll::TimedOut),
        }
    }

    /// Find `target` on screen, waiting up to `timeout` (default: the find timeout)
    pub async fn find(&mut self, target: impl Into<Target>, timeout: Option<Duration>) -> Result<MatchResult> {
        let target = target.into();
        let timeout = timeout.unwrap_or(self.settings.find_timeout);
        let candidates = self.candidates(&target)?;

        match self.poll(&candidates, timeout).await? {
            Poll::Found(found) => {
                debug!("Found {} at ({}, {})", found.image.name(), found.x, found.y);
                Ok(found)
            }
            Poll::TimedOut => Err(Error::ImageNotFound {
                target: target.to_string(),
                timeout_secs: timeout.as_secs_f64(),
            }),
        }
    }

    /// Block until `target` is visible (default timeout: the wait timeout)
    pub async fn wait(&mut self, target: impl Into<Target>, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.settings.wait_timeout);
        self.find(target, Some(timeout)).await.map(|_| ())
    }

    async fn resolve(&mut self, position: Position) -> Result<(u32, u32)> {
        let (x, y) = match position {
            Position::Point(x, y) => return Ok((x, y)),
            Position::Match(found) => found.focus_point(),
            Position::Target(target) => self.find(target, None).await?.focus_point(),
        };
        Ok((x.max(0) as u32, y.max(0) as u32))
    }

    pub async fn click(&mut self, position: impl Into<Position>) -> Result<()> {
        self.pointer_action(position.into(), &[Button::Left]).await
    }

    pub async fn right_click(&mut self, position: impl Into<Position>) -> Result<()> {
        self.pointer_action(position.into(), &[Button::Right]).await
    }

    pub async fn double_click(&mut self, position: impl Into<Position>) -> Result<()> {
        self.pointer_action(position.into(), &[Button::Left, Button::Left])
            .await
    }

    pub async fn hover(&mut self, position: impl Into<Position>) -> Result<()> {
        self.pointer_action(position.into(), &[]).await
    }

    async fn pointer_action(&mut self, position: Position, buttons: &[Button]) -> Result<()> {
        let (x, y) = self.resolve(position).await?;
        self.channel.move_pointer(x, y).await?;
        for (i, button) in buttons.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.double_click_gap).await;
            }
            self.channel.press_button(*button).await?;
        }
        Ok(())
    }

    /// Type text, press one key or press a key combination
    pub async fn type_input(&mut self, input: &KeyInput) -> Result<()> {
        let presses = input.presses();
        for (i, keys) in presses.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.typing_delay).await;
            }
            self.channel.press_keys(keys).await?;
        }
        Ok(())
    }

    /// Shorthand for [`Session::type_input`] on a single token
    pub async fn type_text(&mut self, token: &str) -> Result<()> {
        self.type_input(&KeyInput::parse(token)).await
    }

    /// Save the current screen to `path` for diagnostics
    pub async fn log_screen(&mut self, path: &Path) -> Result<()> {
        self.channel.capture(path).await?;
        info!("Screen saved to {}", path.display());
        Ok(())
    }

    pub async fn sleep(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Record every further capture to `path`
    ///
    /// Returns false, leaving recording off, when the encoder cannot start.
    pub async fn set_recording(&mut self, path: &Path) -> bool {
        if let Some(previous) = self.recorder.take() {
            if let Err(e) = previous.finish().await {
                warn!("Closing previous recording failed: {}", e);
            }
        }
        match VideoRecorder::start(&self.settings.recording, path) {
            Ok(recorder) => {
                info!("Recording to {}", path.display());
                self.recorder = Some(recorder);
                true
            }
            Err(e) => {
                warn!("Recording disabled: {}", e);
                false
            }
        }
    }

    async fn record(&mut self, frame: &DynamicImage) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.write_frame(frame).await {
                warn!("Recording to {} stopped: {}", recorder.path().display(), e);
                if let Some(recorder) = self.recorder.take() {
                    recorder.finish().await.ok();
                }
            }
        }
    }

    /// Close the video stream, if any
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(recorder) = self.recorder.take() {
            recorder.finish().await?;
        }
        Ok(())
    }
}
