//! Operational endpoints: health, metrics, dead-letter inspection and replay

pub mod dead_letters;
pub mod system;

pub use dead_letters::{get_dead_letter, list_dead_letters, replay_dead_letter};
pub use system::{health_check, in_flight, metrics_handler};
