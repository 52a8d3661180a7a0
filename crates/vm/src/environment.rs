//! Machine lifecycle management
//!
//! [`Environment`] owns the hypervisor connection, the storage pool shared by
//! every machine of a run, the identifier counter and the set of machines it
//! has started. Nothing else mutates that state; every machine it builds is
//! registered before the hypervisor is asked to create anything, so
//! [`Environment::clean_all`] can always reclaim it.
//!
//! Creations run in their own tasks. A build cancelled mid-creation leaves
//! its task tracked, and cleanup waits for it before reclaiming the machine.

use sightline_common::config::HypervisorConfig;
use sightline_common::{Endpoint, Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::descriptor::{self, TemplateVars, DEFAULT_POOL_TEMPLATE};
use crate::hypervisor::{Connector, Hypervisor, VolumeHandle};

/// Tunables of the lifecycle manager
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub pool_name: String,
    pub pool_template: String,
    pub first_id: u32,
    pub max_id_attempts: u32,
    /// Bound on waiting for an interrupted creation during cleanup
    pub settle_timeout: Duration,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            pool_name: "sightline-disks".to_string(),
            pool_template: DEFAULT_POOL_TEMPLATE.to_string(),
            first_id: 0,
            max_id_attempts: 32,
            settle_timeout: Duration::from_secs(30),
        }
    }
}

impl EnvironmentSettings {
    pub fn from_config(config: &HypervisorConfig) -> Result<Self> {
        let pool_template = match &config.pool_template {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                Error::InvalidConfig(format!("Cannot read pool template {}: {}", path.display(), e))
            })?,
            None => DEFAULT_POOL_TEMPLATE.to_string(),
        };
        Ok(Self {
            pool_name: config.pool_name.clone(),
            pool_template,
            first_id: config.first_id,
            max_id_attempts: config.max_id_attempts.max(1),
            settle_timeout: Duration::from_secs(config.settle_timeout_secs),
        })
    }
}

/// The storage pool of the current run
#[derive(Debug, Clone)]
pub struct ManagedPool {
    pub name: String,
    pub path: PathBuf,
    /// False when an identical pool already existed and was reused
    pub created: bool,
}

/// A machine built for one test
///
/// Deliberately not `Clone`: handing it to [`Environment::tear_down`]
/// consumes it.
#[derive(Debug)]
pub struct ManagedMachine {
    id: u32,
    domain: String,
    volume: VolumeHandle,
    endpoint: Endpoint,
}

impl ManagedMachine {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn volume(&self) -> &VolumeHandle {
        &self.volume
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Registered, creation in flight or not confirmed
    Reserved,
    Running,
    /// Machine gone, volume still to delete
    DomainDestroyed,
}

#[derive(Debug, Clone)]
struct MachineRecord {
    domain: String,
    pool: String,
    volume: String,
    stage: Stage,
}

/// What [`Environment::clean_all`] did
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    /// Machines fully reclaimed
    pub machines: usize,
    pub pool_destroyed: bool,
    /// One entry per object that could not be reclaimed
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.machines == 0 && !self.pool_destroyed && self.failures.is_empty()
    }
}

enum Attempt {
    Built(ManagedMachine),
    Collision(String),
}

/// Result of a creation task
enum Created {
    Volume(VolumeHandle),
    Domain,
}

/// Process-wide virtualization state of one run
pub struct Environment {
    connector: Box<dyn Connector>,
    settings: EnvironmentSettings,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    uri: Option<String>,
    pool: Option<ManagedPool>,
    next_id: u32,
    machines: BTreeMap<u32, MachineRecord>,
    /// Creation tasks not yet observed to finish, by machine id
    pending: BTreeMap<u32, JoinHandle<Result<Created>>>,
}

impl Environment {
    pub fn new(connector: Box<dyn Connector>, settings: EnvironmentSettings) -> Self {
        Self {
            next_id: settings.first_id,
            connector,
            settings,
            hypervisor: None,
            uri: None,
            pool: None,
            machines: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.hypervisor.is_some()
    }

    pub fn pool(&self) -> Option<&ManagedPool> {
        self.pool.as_ref()
    }

    /// Number of machines currently tracked
    pub fn managed_count(&self) -> usize {
        self.machines.len()
    }

    pub fn is_managed(&self, id: u32) -> bool {
        self.machines.contains_key(&id)
    }

    /// Identifier the next build will try first
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Open the hypervisor connection; later calls reuse it
    pub async fn connect(&mut self, uri: &str) -> Result<()> {
        if let Some(current) = &self.uri {
            if current != uri {
                warn!("Already connected to {}, ignoring {}", current, uri);
            }
            return Ok(());
        }

        let hypervisor = self.connector.open(uri).await.map_err(|e| match e {
            Error::Infrastructure(_) => e,
            other => Error::infrastructure(format!("Cannot connect to {}: {}", uri, other)),
        })?;
        info!("Connected to hypervisor {}", uri);

        self.hypervisor = Some(hypervisor);
        self.uri = Some(uri.to_string());
        Ok(())
    }

    fn hypervisor(&self) -> Result<Arc<dyn Hypervisor>> {
        self.hypervisor
            .clone()
            .ok_or_else(|| Error::infrastructure("not connected to a hypervisor"))
    }

    /// Make sure the run's storage pool rooted at `path` exists
    pub async fn ensure_pool(&mut self, path: &Path) -> Result<()> {
        let hv = self.hypervisor()?;

        if let Some(pool) = &self.pool {
            if pool.path == path {
                return Ok(());
            }
            return Err(Error::infrastructure(format!(
                "Pool {} is already rooted at {}; refusing to move it to {}",
                pool.name,
                pool.path.display(),
                path.display()
            )));
        }

        tokio::fs::create_dir_all(path).await.map_err(|e| {
            Error::infrastructure(format!("Cannot create pool directory {}: {}", path.display(), e))
        })?;

        let vars = TemplateVars::new()
            .set(&["name"], self.settings.pool_name.clone())
            .with_pool_path(path);
        let xml = descriptor::render(&self.settings.pool_template, &vars)?;
        let name = descriptor::declared_name(&xml, "pool")?;

        if hv.list_pools().await?.contains(&name) {
            let declared = hv.pool_target_path(&name).await?;
            if declared != path {
                return Err(Error::infrastructure(format!(
                    "Storage pool {} exists but is not managed (rooted at {}, expected {})",
                    name,
                    declared.display(),
                    path.display()
                )));
            }
            info!("Reusing existing storage pool {} at {}", name, path.display());
            self.pool = Some(ManagedPool {
                name,
                path: path.to_path_buf(),
                created: false,
            });
            return Ok(());
        }

        hv.create_pool(&xml).await.map_err(|e| {
            Error::infrastructure(format!("Creating storage pool {} failed: {}", name, e))
        })?;
        info!("Created storage pool {} at {}", name, path.display());

        self.pool = Some(ManagedPool {
            name,
            path: path.to_path_buf(),
            created: true,
        });
        Ok(())
    }

    /// Create a volume and a machine from the given templates
    ///
    /// Identifiers colliding with objects that already exist are skipped,
    /// never destroyed.
    pub async fn build(
        &mut self,
        machine_template: &str,
        storage_template: &str,
        boot_medium: &str,
    ) -> Result<ManagedMachine> {
        let hv = self.hypervisor()?;
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::infrastructure("no storage pool; ensure_pool must run first"))?;

        let first = self.next_id;
        for _ in 0..self.settings.max_id_attempts {
            let id = self.next_id;
            self.next_id += 1;

            match self
                .try_build(&hv, &pool, id, machine_template, storage_template, boot_medium)
                .await?
            {
                Attempt::Built(machine) => return Ok(machine),
                Attempt::Collision(what) => {
                    warn!("Identifier {} collides with existing {}; skipping it", id, what);
                }
            }
        }

        Err(Error::infrastructure(format!(
            "No free machine identifier in {}..{}: every candidate collides with an existing object",
            first, self.next_id
        )))
    }

    async fn try_build(
        &mut self,
        hv: &Arc<dyn Hypervisor>,
        pool: &ManagedPool,
        id: u32,
        machine_template: &str,
        storage_template: &str,
        boot_medium: &str,
    ) -> Result<Attempt> {
        let base = TemplateVars::new()
            .with_id(id)
            .with_pool_path(&pool.path)
            .with_boot_medium(boot_medium);

        let storage_xml = descriptor::render(storage_template, &base)?;
        let volume_name = descriptor::declared_name(&storage_xml, "storage")?;
        let predicted_disk = pool.path.join(&volume_name);
        let machine_xml =
            descriptor::render(machine_template, &base.clone().with_disk_path(&predicted_disk))?;
        let domain_name = descriptor::declared_name(&machine_xml, "machine")?;

        if hv.list_domains().await?.contains(&domain_name) {
            return Ok(Attempt::Collision(format!("machine {}", domain_name)));
        }
        if hv.list_volumes(&pool.name).await?.contains(&volume_name) {
            return Ok(Attempt::Collision(format!("volume {}", volume_name)));
        }

        self.machines.insert(
            id,
            MachineRecord {
                domain: domain_name.clone(),
                pool: pool.name.clone(),
                volume: volume_name.clone(),
                stage: Stage::Reserved,
            },
        );
        debug!("Reserved identifier {} for {} / {}", id, domain_name, volume_name);

        let task_hv = hv.clone();
        let pool_name = pool.name.clone();
        let created = self
            .create(id, async move {
                task_hv
                    .create_volume(&pool_name, &storage_xml)
                    .await
                    .map(Created::Volume)
            })
            .await;
        let volume = match created {
            Ok(Created::Volume(volume)) => volume,
            Ok(Created::Domain) => {
                return Err(Error::infrastructure(format!(
                    "Creating volume {} returned no volume",
                    volume_name
                )))
            }
            Err(e) => {
                self.machines.remove(&id);
                if e.is_already_exists() {
                    return Ok(Attempt::Collision(format!("volume {}", volume_name)));
                }
                return Err(Error::infrastructure(format!(
                    "Creating volume {} failed: {}",
                    volume_name, e
                )));
            }
        };

        let machine_xml = if volume.path != predicted_disk {
            descriptor::render(machine_template, &base.with_disk_path(&volume.path))?
        } else {
            machine_xml
        };

        let task_hv = hv.clone();
        let created = self
            .create(id, async move {
                task_hv.create_domain(&machine_xml).await.map(|_| Created::Domain)
            })
            .await;
        if let Err(e) = created {
            if let Some(record) = self.machines.get_mut(&id) {
                record.stage = Stage::DomainDestroyed;
            }
            match hv.delete_volume(&pool.name, &volume.name).await {
                Ok(()) => {
                    self.machines.remove(&id);
                }
                Err(de) => warn!("Volume {} left for final cleanup: {}", volume.name, de),
            }
            if e.is_already_exists() {
                return Ok(Attempt::Collision(format!("machine {}", domain_name)));
            }
            return Err(Error::infrastructure(format!(
                "Creating machine {} failed: {}",
                domain_name, e
            )));
        }

        if let Some(record) = self.machines.get_mut(&id) {
            record.stage = Stage::Running;
        }
        info!("Machine {} started (id {})", domain_name, id);

        let endpoint = match hv.domain_xml(&domain_name).await {
            Ok(xml) => descriptor::graphics_endpoint(&xml),
            Err(e) => Err(e),
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(de) = self.reclaim(hv, id).await {
                    warn!("Machine {} left for final cleanup: {}", domain_name, de);
                }
                return Err(Error::infrastructure(format!(
                    "Machine {} has no usable display endpoint: {}",
                    domain_name, e
                )));
            }
        };
        debug!("Machine {} displays at {}", domain_name, endpoint);

        Ok(Attempt::Built(ManagedMachine {
            id,
            domain: domain_name,
            volume,
            endpoint,
        }))
    }

    /// Run a creation for machine `id` in its own task
    ///
    /// The task stays tracked until it is observed to finish, so a caller
    /// cancelled here leaves it for [`Environment::clean_all`] to settle.
    async fn create<F>(&mut self, id: u32, creation: F) -> Result<Created>
    where
        F: Future<Output = Result<Created>> + Send + 'static,
    {
        let task = tokio::spawn(creation);
        let joined = self.pending.entry(id).or_insert(task).await;
        self.pending.remove(&id);
        joined.map_err(|e| Error::infrastructure(format!("Creation task failed: {}", e)))?
    }

    /// Wait for creations of interrupted builds; returns ids still in flight
    async fn settle_pending(&mut self, report: &mut CleanupReport) -> BTreeSet<u32> {
        let mut unsettled = BTreeSet::new();
        let pending = std::mem::take(&mut self.pending);
        for (id, task) in pending {
            let domain = self
                .machines
                .get(&id)
                .map(|r| r.domain.clone())
                .unwrap_or_else(|| format!("id {}", id));
            debug!("Waiting for the creation of {} to finish", domain);

            match tokio::time::timeout(self.settings.settle_timeout, task).await {
                Ok(Ok(Ok(Created::Domain))) => {
                    if let Some(record) = self.machines.get_mut(&id) {
                        record.stage = Stage::Running;
                    }
                }
                Ok(Ok(Ok(Created::Volume(_)))) => {}
                Ok(Ok(Err(e))) => debug!("Interrupted creation of {} failed: {}", domain, e),
                Ok(Err(e)) => warn!("Creation task of {} failed: {}", domain, e),
                Err(_) => {
                    warn!(
                        "Creation of {} still running after {:?}",
                        domain, self.settings.settle_timeout
                    );
                    report.failures.push(format!(
                        "machine {}: creation did not finish within {:?}",
                        domain, self.settings.settle_timeout
                    ));
                    unsettled.insert(id);
                }
            }
        }
        unsettled
    }

    /// Destroy a machine and its volume and stop tracking it
    pub async fn tear_down(&mut self, machine: ManagedMachine) -> Result<()> {
        if !self.machines.contains_key(&machine.id) {
            return Err(Error::usage(format!(
                "machine {} (id {}) is not managed; it was already torn down or cleaned up",
                machine.domain, machine.id
            )));
        }

        let hv = self.hypervisor()?;
        self.reclaim(&hv, machine.id).await.map_err(|e| {
            Error::infrastructure(format!("Tearing down {} failed: {}", machine.domain, e))
        })?;

        info!("Machine {} torn down", machine.domain);
        Ok(())
    }

    /// Destroy everything this environment still tracks
    ///
    /// Never fails: every tracked object is attempted and failures are
    /// collected in the report. Creations still in flight are awaited first.
    pub async fn clean_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let Some(hv) = self.hypervisor.clone() else {
            self.machines.clear();
            self.pending.clear();
            self.pool = None;
            return report;
        };

        let unsettled = self.settle_pending(&mut report).await;

        let ids: Vec<u32> = self.machines.keys().copied().collect();
        for id in ids {
            if unsettled.contains(&id) {
                continue;
            }
            let domain = self.machines[&id].domain.clone();
            match self.reclaim(&hv, id).await {
                Ok(()) => {
                    info!("Cleaned up machine {}", domain);
                    report.machines += 1;
                }
                Err(e) => {
                    warn!("Cleaning up machine {} failed: {}", domain, e);
                    report.failures.push(format!("machine {}: {}", domain, e));
                }
            }
        }
        self.machines.clear();

        if let Some(pool) = self.pool.take() {
            if pool.created {
                self.sweep_volumes(&hv, &pool.name, &mut report).await;
                match hv.destroy_pool(&pool.name).await {
                    Ok(()) => {
                        info!("Destroyed storage pool {}", pool.name);
                        report.pool_destroyed = true;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!("Destroying storage pool {} failed: {}", pool.name, e);
                        report.failures.push(format!("pool {}: {}", pool.name, e));
                    }
                }
            } else {
                debug!("Leaving reused storage pool {} in place", pool.name);
            }
        }

        report
    }

    /// Delete whatever volumes remain in a pool this run created
    async fn sweep_volumes(
        &self,
        hv: &Arc<dyn Hypervisor>,
        pool: &str,
        report: &mut CleanupReport,
    ) {
        let volumes = match hv.list_volumes(pool).await {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!("Listing volumes of {} failed: {}", pool, e);
                report.failures.push(format!("pool {}: {}", pool, e));
                return;
            }
        };
        for volume in volumes {
            match hv.delete_volume(pool, &volume).await {
                Ok(()) => debug!("Deleted leftover volume {}", volume),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("Deleting volume {} failed: {}", volume, e);
                    report.failures.push(format!("volume {}: {}", volume, e));
                }
            }
        }
    }

    /// Destroy a tracked machine and its volume; the record is dropped only
    /// once both are gone
    ///
    /// The volume is attempted even when destroying the machine fails.
    async fn reclaim(&mut self, hv: &Arc<dyn Hypervisor>, id: u32) -> Result<()> {
        let Some(record) = self.machines.get_mut(&id) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if record.stage != Stage::DomainDestroyed {
            match hv.destroy_domain(&record.domain).await {
                Ok(()) => record.stage = Stage::DomainDestroyed,
                Err(e) if e.is_not_found() => {
                    debug!("Machine {} already gone", record.domain);
                    record.stage = Stage::DomainDestroyed;
                }
                Err(e) => failures.push(format!("machine {}: {}", record.domain, e)),
            }
        }

        let volume_gone = match hv.delete_volume(&record.pool, &record.volume).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!("Volume {} already gone", record.volume);
                true
            }
            Err(e) => {
                failures.push(format!("volume {}: {}", record.volume, e));
                false
            }
        };

        if record.stage == Stage::DomainDestroyed && volume_gone {
            self.machines.remove(&id);
            return Ok(());
        }
        Err(Error::infrastructure(failures.join("; ")))
    }
}
