//! A local block-blob store: a directory-rooted repository of fixed-size,
//! block-aligned binary objects ("blobs") together with their metadata,
//! inter-blob dependency graph, and backing block devices (loopback and
//! device-mapper).
//!
//! A client opens a [`store::Blobstore`], then creates or opens blobs
//! through it ([`blob`]); creation may trigger a scan, LRU revocation, and
//! loopback attachment. [`comp::clone`] composes a destination blob from a
//! declarative block map of other blobs, external devices, or the shared
//! zero device, either copying bytes in place or building a device-mapper
//! graph and recording the resulting dependency edges.
//!
//! Concurrency across threads and processes is mediated by the [`lock`]
//! registry; on-disk metadata is read and written through [`metadata`] at
//! paths resolved by [`path`]. [`scan`] walks a store to derive occupancy
//! and drive LRU revocation. [`adapters`] abstracts the external
//! collaborators (loopback, device-mapper, block copy) behind traits so the
//! rest of the crate can be exercised without root privileges.

pub mod adapters;
pub mod blob;
pub mod comp;
pub mod error;
pub mod id;
pub mod lock;
pub mod metadata;
pub mod path;
pub mod scan;
pub mod store;
mod tools;

pub use blob::{Blob, BlobFlags};
pub use comp::{BlockMapEntry, Relation, Source};
pub use error::{BlobstoreError, Result};
pub use lock::Timeout;
pub use metadata::{OpenParams, RevocationPolicy, SnapshotPolicy};
pub use path::Format;
pub use store::{Blobstore, GenericBlobstore};
