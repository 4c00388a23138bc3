//! User-side machinery: the per-process buffer, the runner that executes
//! one scenario invocation, the loop policies that drive it repeatedly, and
//! the scheduler that discovers new users (§4.2-§4.5).

pub mod buffer;
pub mod loops;
pub mod runner;
pub mod scheduler;

pub use buffer::UserBuffer;
pub use runner::UserCommands;
pub use scheduler::UserScheduler;
