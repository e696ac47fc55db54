pub mod controller;
pub mod events;
pub mod state;

pub use controller::{CloseOutcome, LoadOutcome, SessionOrchestrator, SessionSnapshot};
pub use events::{ChannelEvents, LogEvents, SessionEvent, SessionEvents};
pub use state::{SessionRef, SessionState, ViewerSession};
