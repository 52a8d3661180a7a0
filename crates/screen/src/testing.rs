//! Scripted remote display for tests

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use parking_lot::Mutex;
use sightline_common::{Error, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channel::{Button, RemoteControl};
use crate::keys::KeyCode;

/// Input event received by a [`FakeChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Move(u32, u32),
    Press(Button),
    Keys(Vec<KeyCode>),
    Capture(PathBuf),
}

#[derive(Default)]
struct State {
    frames: VecDeque<DynamicImage>,
    current: Option<DynamicImage>,
    failing_captures: bool,
    captures: usize,
    actions: Vec<Action>,
}

/// Remote display showing a scripted sequence of frames
///
/// Each capture shows the next queued frame; once the queue is empty the
/// last frame stays on screen. Clones share state, so a test can keep a
/// handle after giving one to a session.
#[derive(Clone, Default)]
pub struct FakeChannel {
    state: Arc<Mutex<State>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A display that shows `frame` forever
    pub fn showing(frame: DynamicImage) -> Self {
        let channel = Self::new();
        channel.push_frame(frame);
        channel
    }

    pub fn push_frame(&self, frame: DynamicImage) {
        self.state.lock().frames.push_back(frame);
    }

    /// Make every capture fail until switched off again
    pub fn fail_captures(&self, fail: bool) {
        self.state.lock().failing_captures = fail;
    }

    /// Number of successful captures so far
    pub fn captures(&self) -> usize {
        self.state.lock().captures
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state.lock().actions.clone()
    }

    fn next_frame(&self) -> Result<DynamicImage> {
        let mut state = self.state.lock();
        if state.failing_captures {
            return Err(Error::infrastructure("display connection refused"));
        }
        if let Some(frame) = state.frames.pop_front() {
            state.current = Some(frame);
        }
        let frame = state
            .current
            .clone()
            .ok_or_else(|| Error::infrastructure("nothing on screen"))?;
        state.captures += 1;
        Ok(frame)
    }
}

#[async_trait]
impl RemoteControl for FakeChannel {
    async fn move_pointer(&self, x: u32, y: u32) -> Result<()> {
        self.state.lock().actions.push(Action::Move(x, y));
        Ok(())
    }

    async fn press_button(&self, button: Button) -> Result<()> {
        self.state.lock().actions.push(Action::Press(button));
        Ok(())
    }

    async fn press_keys(&self, keys: &[KeyCode]) -> Result<()> {
        self.state.lock().actions.push(Action::Keys(keys.to_vec()));
        Ok(())
    }

    async fn capture(&self, path: &Path) -> Result<()> {
        let frame = self.next_frame()?;
        frame.save(path)?;
        self.state.lock().actions.push(Action::Capture(path.to_path_buf()));
        Ok(())
    }

    async fn capture_frame(&self) -> Result<DynamicImage> {
        self.next_frame()
    }
}

/// Deterministic noise texture; different seeds do not correlate
pub fn pattern(width: u32, height: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let mut h = x
            .wrapping_mul(374_761_393)
            .wrapping_add(y.wrapping_mul(668_265_263))
            .wrapping_add(seed.wrapping_mul(2_246_822_519));
        h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
        Luma([(h ^ (h >> 16)) as u8])
    })
}

/// A grey screen with `parts` pasted at the given top-left corners
pub fn screen(width: u32, height: u32, parts: &[(&GrayImage, u32, u32)]) -> DynamicImage {
    let mut canvas = GrayImage::from_pixel(width, height, Luma([128]));
    for (part, x, y) in parts {
        image::imageops::replace(&mut canvas, *part, *x as i64, *y as i64);
    }
    DynamicImage::ImageLuma8(canvas)
}
