//! Worker process spawning and stream-json protocol handling.

mod classify;
mod events;
mod process;
mod stream;

pub use classify::*;
pub use events::*;
pub use process::*;
pub use stream::*;
