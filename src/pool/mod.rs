//! Warm pools of pre-provisioned resources
//!
//! Creating a sandbox takes seconds; handing out one that was created ahead
//! of demand takes microseconds. A [`PoolManager`] keeps one pool per
//! category, resets resources between users, and resizes pools on
//! utilization.
//!
//! # Resource lifecycle
//!
//! | From | To |
//! |------|----|
//! | provisioning | available |
//! | available | acquired, expired, destroyed |
//! | acquired | released, destroyed |
//! | released | available (after a verified reset), destroyed |
//! | expired | destroyed |

pub mod manager;
pub mod podman;
pub mod provisioner;
pub mod resource;

pub use manager::{MaintenanceHandle, MaintenanceReport, PoolManager, PoolStats};
pub use podman::PodmanProvisioner;
pub use provisioner::Provisioner;
pub use resource::{Health, PooledResource, ResourceState};
