//! Cloud collaborators: metadata, compute, and object storage clients.
//!
//! Each is a trait with a `reqwest`-backed production implementation and an
//! in-memory fake for tests, grounded on the teacher's `async_trait`-based
//! service-trait convention.
pub mod compute;
pub mod metadata;
pub mod storage;

pub use compute::{ComputeClient, GceComputeClient, Instance, MonitorStatusWrite, RegionQuota, SerialOutput};
pub use metadata::{GceMetadataClient, MetadataClient};
pub use storage::{GcsStorageClient, StorageClient};
