//! Worker registry, lifecycle and health supervision.

mod buffer;
mod events;
mod fleet;
mod health;
mod state;
mod worker;

pub use buffer::*;
pub use events::*;
pub use fleet::*;
pub use health::*;
pub use state::*;
pub use worker::{SpawnRequest, WorkerInfo};
