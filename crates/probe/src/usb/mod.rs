//! USB subsystem
//!
//! Finds the vendor device, classifies its endpoints and manages the
//! claim/release lifecycle around its session:
//! - Endpoint classification by transfer type and direction
//! - Endpoint map building over the full descriptor tree
//! - Device matching on IDs and string descriptors
//! - Discovery, lifecycle management and the bulk read loop
//!
//! Every call into the host stack is synchronous and blocks the caller.

pub mod classify;
pub mod device;
pub mod discovery;
pub mod endpoints;
pub mod matcher;
pub mod transfers;

// Re-export public types
pub use classify::{Classification, classify};
pub use device::{ClaimPolicy, ClaimReport, LifecycleState, Readiness, VendorDevice};
pub use discovery::{discover, survey};
pub use endpoints::{EndpointInventory, EndpointMap, TransferEndpointSet, build_inventory};
pub use matcher::{DeviceIdentity, DeviceMatcher, MatchRejected};
pub use transfers::{BulkReader, PollReport, ReadLoopSettings, TransferOutcome, run_read_loop};
