//! Sightline Machine Lifecycle
//!
//! Builds disposable virtual machines from descriptor templates, tracks
//! every object it creates and reclaims them on teardown or cleanup.

pub mod descriptor;
pub mod environment;
pub mod hypervisor;
pub mod virsh;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use environment::{CleanupReport, Environment, EnvironmentSettings, ManagedMachine, ManagedPool};
pub use hypervisor::{Connector, Hypervisor, VolumeHandle};
pub use virsh::{VirshConnector, VirshHypervisor};
