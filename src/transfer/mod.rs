//! Background data movement.
//!
//! - [`blob_store`]: Async file I/O for backing files and the index snapshot
//! - [`worker_pool`]: Bounded pool that runs I/O and fetches off the control loop

pub mod blob_store;
pub mod worker_pool;
