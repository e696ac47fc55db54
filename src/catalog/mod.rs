pub mod archive;
pub mod client;
pub mod models;

pub use archive::{ArchiveApi, OrthancArchive};
pub use client::CatalogClient;
pub use models::{StudyDetail, StudyRecord};
