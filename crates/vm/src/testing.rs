//! In-memory hypervisor for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use sightline_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::descriptor;
use crate::hypervisor::{Connector, Hypervisor, VolumeHandle};

/// Machine template with an auto-assigned display port
pub const MACHINE_TEMPLATE: &str = "<domain type='kvm'>
  <name>alfa-{id}</name>
  <memory unit='MiB'>1024</memory>
  <devices>
    <disk type='file' device='disk'><source file='{disk_path}'/></disk>
    <disk type='file' device='cdrom'><source file='{boot_medium}'/></disk>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>
";

pub const STORAGE_TEMPLATE: &str = "<volume>
  <name>alfa-{id}.qcow2</name>
  <capacity unit='G'>8</capacity>
  <target><format type='qcow2'/></target>
</volume>
";

#[derive(Default)]
struct State {
    pools: BTreeMap<String, PathBuf>,
    volumes: BTreeMap<String, BTreeSet<String>>,
    domains: BTreeMap<String, String>,
    calls: Vec<String>,
    next_port: u16,
    fail_create_domain: bool,
    fail_destroy_domain: bool,
    refuse_destroy: BTreeSet<String>,
    create_domain_delay: Duration,
    strip_graphics: bool,
}

/// Records every call and keeps pools, volumes and machines in memory
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<State>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A pool that exists before the harness starts
    pub fn add_pool(&self, name: &str, path: impl Into<PathBuf>) {
        let mut state = self.state.lock();
        state.pools.insert(name.to_string(), path.into());
        state.volumes.entry(name.to_string()).or_default();
    }

    /// A machine the harness did not create
    pub fn add_foreign_domain(&self, name: &str) {
        self.state
            .lock()
            .domains
            .insert(name.to_string(), format!("<domain><name>{}</name></domain>", name));
    }

    pub fn add_foreign_volume(&self, pool: &str, name: &str) {
        self.state
            .lock()
            .volumes
            .entry(pool.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub fn fail_create_domain(&self, fail: bool) {
        self.state.lock().fail_create_domain = fail;
    }

    pub fn fail_destroy_domain(&self, fail: bool) {
        self.state.lock().fail_destroy_domain = fail;
    }

    /// Only this machine refuses to be destroyed
    pub fn fail_destroy(&self, domain: &str) {
        self.state.lock().refuse_destroy.insert(domain.to_string());
    }

    /// Machines appear only after `delay`, like a slow `virsh create`
    pub fn delay_create_domain(&self, delay: Duration) {
        self.state.lock().create_domain_delay = delay;
    }

    /// Started machines report no `<graphics>` element
    pub fn strip_graphics(&self, strip: bool) {
        self.state.lock().strip_graphics = strip;
    }

    pub fn domains(&self) -> Vec<String> {
        self.state.lock().domains.keys().cloned().collect()
    }

    pub fn volumes(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .volumes
            .get(pool)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pools(&self) -> Vec<String> {
        self.state.lock().pools.keys().cloned().collect()
    }

    /// Calls made so far, as `"operation target"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c == call)
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.pools())
    }

    async fn pool_target_path(&self, pool: &str) -> Result<PathBuf> {
        self.state
            .lock()
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", pool))
    }

    async fn create_pool(&self, xml: &str) -> Result<String> {
        let name = descriptor::declared_name(xml, "pool")?;
        let path = descriptor::pool_target_path(xml)
            .ok_or_else(|| Error::Template("pool descriptor has no target path".into()))?;
        self.record(format!("create_pool {}", name));

        let mut state = self.state.lock();
        if state.pools.contains_key(&name) {
            return Err(Error::already_exists("pool", &name));
        }
        state.pools.insert(name.clone(), PathBuf::from(path));
        state.volumes.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn destroy_pool(&self, pool: &str) -> Result<()> {
        self.record(format!("destroy_pool {}", pool));
        let mut state = self.state.lock();
        state
            .pools
            .remove(pool)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("pool", pool))
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        Ok(self.volumes(pool))
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeHandle> {
        let name = descriptor::declared_name(xml, "storage")?;
        self.record(format!("create_volume {}", name));

        let mut state = self.state.lock();
        let root = state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", pool))?;
        let volumes = state.volumes.entry(pool.to_string()).or_default();
        if !volumes.insert(name.clone()) {
            return Err(Error::already_exists("volume", &name));
        }

        Ok(VolumeHandle {
            pool: pool.to_string(),
            path: root.join(&name),
            name,
        })
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        self.record(format!("delete_volume {}", volume));
        let mut state = self.state.lock();
        let removed = state
            .volumes
            .get_mut(pool)
            .map_or(false, |v| v.remove(volume));
        if removed {
            Ok(())
        } else {
            Err(Error::not_found("volume", volume))
        }
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.domains())
    }

    async fn create_domain(&self, xml: &str) -> Result<String> {
        let name = descriptor::declared_name(xml, "machine")?;
        self.record(format!("create_domain {}", name));

        let delay = self.state.lock().create_domain_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_create_domain {
            return Err(Error::infrastructure("emulator exited unexpectedly"));
        }
        if state.domains.contains_key(&name) {
            return Err(Error::already_exists("domain", &name));
        }

        let live = if state.strip_graphics {
            format!("<domain><name>{}</name></domain>", name)
        } else {
            let port = 5900 + state.next_port;
            state.next_port += 1;
            xml.replace("port='-1'", &format!("port='{}'", port))
        };
        state.domains.insert(name.clone(), live);
        Ok(name)
    }

    async fn domain_xml(&self, domain: &str) -> Result<String> {
        self.state
            .lock()
            .domains
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::not_found("domain", domain))
    }

    async fn destroy_domain(&self, domain: &str) -> Result<()> {
        self.record(format!("destroy_domain {}", domain));
        let mut state = self.state.lock();
        if state.fail_destroy_domain || state.refuse_destroy.contains(domain) {
            return Err(Error::infrastructure("hypervisor refused to destroy the machine"));
        }
        state
            .domains
            .remove(domain)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("domain", domain))
    }
}

/// Hands out one shared [`FakeHypervisor`]
pub struct FakeConnector {
    hypervisor: Arc<FakeHypervisor>,
    refuse: bool,
}

impl FakeConnector {
    pub fn new(hypervisor: Arc<FakeHypervisor>) -> Self {
        Self {
            hypervisor,
            refuse: false,
        }
    }

    /// A connector whose every `open` fails
    pub fn refusing() -> Self {
        Self {
            hypervisor: FakeHypervisor::new(),
            refuse: true,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        if self.refuse {
            return Err(Error::infrastructure(format!("connection to {} refused", uri)));
        }
        Ok(self.hypervisor.clone())
    }
}
