//! Long-running online training with periodic checkpoints.

mod evaluate;
pub mod schedule;
mod stats;
mod trainer;

pub use evaluate::{evaluate, Evaluation};
pub use schedule::{save_interval, should_save, ProgressSchedule};
pub use stats::StatLog;
pub use trainer::{install_interrupt_handler, Termination, Trainer, TrainerState, DISTORTION_WINDOW};
