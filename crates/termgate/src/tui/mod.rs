//! Terminal UI for wire-protocol sessions.
//!
//! [`model::Model`] is the state machine, [`render::render`] turns it into a
//! [`render::Frame`], and [`keys::KeyDecoder`] turns raw input bytes into the
//! key events that drive it.

pub mod content;
pub mod keys;
pub mod model;
pub mod render;
pub mod typewriter;
pub mod viewport;

pub use keys::{Key, KeyDecoder};
pub use model::{Event, Model, ModelOptions, Screen, SessionContext, Tick};
pub use render::{Frame, encode_frame, render};
