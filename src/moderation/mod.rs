//! Adaptive completion queue moderation

pub mod config;
pub mod engine;

pub use config::ModerationConfig;
pub use engine::{CqModeration, ModerationInfo};
