//! Chunked object storage.
//!
//! ```ignore
//! let id = objects.upload_file("report.pdf", None)?;
//! let bytes = objects.download(&id)?.read_to_end()?;
//! ```

mod client;
mod manifest;
mod reader;

pub use client::ObjectStore;
pub use manifest::ObjectManifest;
pub use reader::ObjectReader;
