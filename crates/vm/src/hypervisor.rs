//! Hypervisor client boundary
//!
//! The lifecycle manager only ever talks to the hypervisor through these
//! traits. Objects are addressed by the names declared in their descriptors.

use async_trait::async_trait;
use sightline_common::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// A storage volume created inside a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub pool: String,
    pub name: String,
    pub path: PathBuf,
}

/// Operations the harness needs from a hypervisor connection
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Names of all storage pools
    async fn list_pools(&self) -> Result<Vec<String>>;

    /// Filesystem path a pool declares as its target
    async fn pool_target_path(&self, pool: &str) -> Result<PathBuf>;

    /// Create (and start) a pool, returning its name
    async fn create_pool(&self, descriptor: &str) -> Result<String>;

    async fn destroy_pool(&self, pool: &str) -> Result<()>;

    /// Names of the volumes in a pool
    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    async fn create_volume(&self, pool: &str, descriptor: &str) -> Result<VolumeHandle>;

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()>;

    /// Names of all machines, running or not
    async fn list_domains(&self) -> Result<Vec<String>>;

    /// Create and boot a machine, returning its name
    async fn create_domain(&self, descriptor: &str) -> Result<String>;

    /// Live descriptor of a running machine, including assigned ports
    async fn domain_xml(&self, domain: &str) -> Result<String>;

    async fn destroy_domain(&self, domain: &str) -> Result<()>;
}

/// Opens hypervisor connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>>;
}
