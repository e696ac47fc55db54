pub mod annotation;
pub mod view;

pub use annotation::{Annotation, AnnotationKey, AnnotationKind, SaveOutcome};
pub use view::ViewRecord;
