//! libvirt backend driven through the `virsh` command line
//!
//! Every call runs `virsh -c <uri> ...`; descriptors are handed over as
//! temporary files.

use async_trait::async_trait;
use sightline_common::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::descriptor;
use crate::hypervisor::{Connector, Hypervisor, VolumeHandle};

/// Opens [`VirshHypervisor`] connections
pub struct VirshConnector {
    binary: String,
}

impl VirshConnector {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Connector for VirshConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        let hypervisor = VirshHypervisor::new(self.binary.clone(), uri);

        // `virsh uri` fails unless the connection can actually be opened
        let canonical = hypervisor.run(&["uri"]).await.map_err(|e| {
            Error::infrastructure(format!("Cannot connect to hypervisor at {}: {}", uri, e))
        })?;
        debug!("Connected to hypervisor {}", canonical.trim());

        Ok(Arc::new(hypervisor))
    }
}

/// Hypervisor connection backed by `virsh`
pub struct VirshHypervisor {
    binary: String,
    uri: String,
}

impl VirshHypervisor {
    pub fn new(binary: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            uri: uri.into(),
        }
    }

    /// Run a virsh subcommand and return its stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        trace!("{} -c {} {}", self.binary, self.uri, args.join(" "));

        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::infrastructure(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(args.first().copied().unwrap_or(""), stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a subcommand whose last argument is a descriptor file
    async fn run_with_descriptor(&self, args: &[&str], descriptor: &str) -> Result<String> {
        let file = descriptor_file_in(&std::env::temp_dir(), descriptor)?;

        let path = file.path().to_string_lossy().into_owned();
        let mut full: Vec<&str> = args.to_vec();
        full.push(&path);
        self.run(&full).await
    }
}

/// Write a descriptor to a fresh temporary file under `dir`
fn descriptor_file_in(dir: &Path, descriptor: &str) -> Result<tempfile::NamedTempFile> {
    let failed = |e: std::io::Error| {
        Error::infrastructure(format!("Cannot write descriptor file in {}: {}", dir.display(), e))
    };

    let mut file = tempfile::Builder::new()
        .prefix("sightline-")
        .suffix(".xml")
        .tempfile_in(dir)
        .map_err(failed)?;
    file.write_all(descriptor.as_bytes()).map_err(failed)?;
    file.flush().map_err(failed)?;
    Ok(file)
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.run(&["pool-list", "--all", "--name"]).await?))
    }

    async fn pool_target_path(&self, pool: &str) -> Result<PathBuf> {
        let xml = self.run(&["pool-dumpxml", pool]).await?;
        descriptor::pool_target_path(&xml)
            .map(PathBuf::from)
            .ok_or_else(|| Error::infrastructure(format!("Pool {} declares no target path", pool)))
    }

    async fn create_pool(&self, xml: &str) -> Result<String> {
        let name = descriptor::declared_name(xml, "pool")?;
        self.run_with_descriptor(&["pool-create"], xml)
            .await
            .map_err(|e| rename_object(e, "pool", &name))?;
        Ok(name)
    }

    async fn destroy_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-destroy", pool]).await?;
        Ok(())
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        Ok(parse_volume_table(&self.run(&["vol-list", pool]).await?))
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<VolumeHandle> {
        let name = descriptor::declared_name(xml, "storage")?;
        self.run_with_descriptor(&["vol-create", pool], xml)
            .await
            .map_err(|e| rename_object(e, "volume", &name))?;

        let path = self.run(&["vol-path", "--pool", pool, &name]).await?;
        Ok(VolumeHandle {
            pool: pool.to_string(),
            name,
            path: PathBuf::from(path.trim()),
        })
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        self.run(&["vol-delete", "--pool", pool, volume])
            .await
            .map_err(|e| rename_object(e, "volume", volume))?;
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.run(&["list", "--all", "--name"]).await?))
    }

    async fn create_domain(&self, xml: &str) -> Result<String> {
        let name = descriptor::declared_name(xml, "machine")?;
        self.run_with_descriptor(&["create"], xml)
            .await
            .map_err(|e| rename_object(e, "domain", &name))?;
        Ok(name)
    }

    async fn domain_xml(&self, domain: &str) -> Result<String> {
        self.run(&["dumpxml", domain])
            .await
            .map_err(|e| rename_object(e, "domain", domain))
    }

    async fn destroy_domain(&self, domain: &str) -> Result<()> {
        self.run(&["destroy", domain])
            .await
            .map_err(|e| rename_object(e, "domain", domain))?;
        Ok(())
    }
}

/// Map virsh's stderr onto the error taxonomy
fn classify_failure(action: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") {
        Error::already_exists("object", stderr)
    } else if lower.contains("not found")
        || lower.contains("no domain with matching")
        || lower.contains("no storage pool with matching")
        || lower.contains("no storage vol with matching")
    {
        Error::not_found("object", stderr)
    } else {
        Error::infrastructure(format!("virsh {} failed: {}", action, stderr))
    }
}

/// Attach the object kind and name to lookup/collision errors
fn rename_object(err: Error, kind: &str, name: &str) -> Error {
    match err {
        Error::AlreadyExists { .. } => Error::already_exists(kind, name),
        Error::NotFound { .. } => Error::not_found(kind, name),
        other => other,
    }
}

/// Output of `--name` listings: one name per line
fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Output of `vol-list`: a header, a dashed rule, then `name path` rows
fn parse_volume_table(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_parse_name_list() {
        let out = "alfa-0\n alfa-1 \n\n";
        assert_eq!(parse_name_list(out), vec!["alfa-0", "alfa-1"]);
    }

    #[test]
    fn test_parse_volume_table() {
        let out = " Name          Path\n\
                   ------------------------------------------\n \
                   disk0.qcow2   /var/lib/pool/disk0.qcow2\n \
                   disk1.qcow2   /var/lib/pool/disk1.qcow2\n\n";
        assert_eq!(parse_volume_table(out), vec!["disk0.qcow2", "disk1.qcow2"]);
        assert!(parse_volume_table(" Name   Path\n-----------\n\n").is_empty());
    }

    #[test_case("error: operation failed: domain 'alfa-0' already exists with uuid x" => "exists" ; "domain collision")]
    #[test_case("error: Storage volume not found: no storage vol with matching path" => "missing" ; "volume missing")]
    #[test_case("error: failed to get domain 'x'\nerror: Domain not found" => "missing" ; "domain missing")]
    #[test_case("error: authentication failed: access denied" => "infra" ; "permission")]
    fn test_classify_failure(stderr: &str) -> &'static str {
        match classify_failure("create", stderr) {
            Error::AlreadyExists { .. } => "exists",
            Error::NotFound { .. } => "missing",
            Error::Infrastructure(_) => "infra",
            _ => "other",
        }
    }

    #[test]
    fn test_descriptor_file_in() {
        let dir = tempfile::tempdir().unwrap();
        let file = descriptor_file_in(dir.path(), "<pool/>").unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "<pool/>");

        let err = descriptor_file_in(&dir.path().join("missing"), "<pool/>").unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_rename_object() {
        let err = rename_object(Error::already_exists("object", "stderr"), "domain", "alfa-2");
        assert_eq!(err.to_string(), "Resource already exists: domain alfa-2");
    }
}
