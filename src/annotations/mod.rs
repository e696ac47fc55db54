pub mod store;
pub mod writer;

pub use store::AnnotationStore;
pub use writer::{AnnotationWriter, PendingEdit, SaveStatus, StatusListener, WritePolicy};
