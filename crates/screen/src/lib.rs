//! Sightline Screen Automation
//!
//! Finds reference images on a remote display and drives its pointer and
//! keyboard. A [`Session`] is the entry point scripts work with.

pub mod catalog;
pub mod channel;
pub mod engine;
pub mod keys;
pub mod matcher;
pub mod recorder;
pub mod reference;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::ImageCatalog;
pub use channel::{Button, RemoteControl, VncDoChannel};
pub use engine::{Poll, Position, Session, SessionSettings, Target};
pub use keys::{Key, KeyCode, KeyInput};
pub use matcher::{MatchResult, NccMatcher, TemplateMatcher};
pub use recorder::VideoRecorder;
pub use reference::ReferenceImage;
