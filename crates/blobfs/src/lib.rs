//! BlobFS - the remote object store seen by bufpond
//!
//! A blob is a named byte sequence that grows by staged appends made
//! visible with an explicit commit, and can be atomically renamed. Two
//! backends implement [`BlobStore`]:
//!
//! - [`MemoryBlobStore`] keeps everything in process, for tests and tools
//! - [`ObjectBlobStore`] maps the contract onto any `object_store` backend
//!
//! [`StoreRegistry`] resolves logical store names to shared handles.

pub mod error;
pub mod memory;
pub mod object;
pub mod registry;
pub mod store;
pub mod testing;

pub use error::{BlobError, ErrorClass, TransientKind, classify_message};
pub use memory::MemoryBlobStore;
pub use object::ObjectBlobStore;
pub use registry::StoreRegistry;
pub use store::{BlobStore, CreateMode, Result};
