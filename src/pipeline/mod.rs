pub mod acquirer;
pub mod queue;
pub mod saver;
pub mod schedule;

pub use acquirer::Acquirer;
pub use queue::{BoundedFrameQueue, QueueStats, DEFAULT_CAPACITY};
pub use saver::Saver;
pub use schedule::{StreamState, StreamView};
