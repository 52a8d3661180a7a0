//! Test descriptors
//!
//! Every directory directly below the tests directory that holds a
//! `test.yaml` is one test. Descriptors are loaded once, before any
//! machine is built, and never change afterwards.

use serde::Deserialize;
use sightline_common::{Error, Result};
use sightline_screen::Target;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::script::{ImageRef, Script, ScriptRegistry, Step, StepScript};

/// File marking a directory as a test
pub const DESCRIPTOR_FILE: &str = "test.yaml";

const DEFAULT_BOOT_TIMEOUT_SECS: f64 = 60.0;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    record: bool,
    machine: PathBuf,
    storage: PathBuf,
    boot_medium: String,
    #[serde(default = "default_images")]
    images: PathBuf,
    #[serde(default)]
    first_screen: Option<ImageRef>,
    #[serde(default = "default_boot_timeout")]
    boot_timeout_secs: f64,
    script: RawScript,
}

fn default_images() -> PathBuf {
    PathBuf::from("images")
}

fn default_boot_timeout() -> f64 {
    DEFAULT_BOOT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScript {
    #[serde(default)]
    steps: Option<Vec<Step>>,
    #[serde(default)]
    builtin: Option<String>,
}

/// Static definition of one scripted test
#[derive(Clone)]
pub struct TestDescriptor {
    pub name: String,
    /// Directory the descriptor was loaded from
    pub dir: PathBuf,
    pub record: bool,
    pub machine_template: String,
    pub storage_template: String,
    pub boot_medium: String,
    /// Image catalog directory
    pub images: PathBuf,
    /// Screen expected once the machine has booted
    pub first_screen: Option<Target>,
    pub boot_timeout: Duration,
    pub script: Arc<dyn Script>,
}

impl std::fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("record", &self.record)
            .field("boot_medium", &self.boot_medium)
            .field("images", &self.images)
            .finish_non_exhaustive()
    }
}

impl TestDescriptor {
    /// Load `<dir>/test.yaml` and the templates it references
    pub fn load(dir: &Path, registry: &ScriptRegistry) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::usage(format!("Cannot read {}: {}", path.display(), e)))?;
        let raw: RawDescriptor = serde_yaml::from_str(&content)
            .map_err(|e| Error::usage(format!("Invalid descriptor {}: {}", path.display(), e)))?;

        let name = match raw.name {
            Some(name) => name,
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::usage(format!("Cannot name the test in {}", dir.display())))?,
        };

        let script: Arc<dyn Script> = match (raw.script.steps, raw.script.builtin) {
            (Some(steps), None) => Arc::new(StepScript::new(steps)),
            (None, Some(builtin)) => registry.get(&builtin)?,
            _ => {
                return Err(Error::usage(format!(
                    "{}: script needs exactly one of `steps` or `builtin`",
                    path.display()
                )))
            }
        };

        let boot_timeout = Duration::try_from_secs_f64(raw.boot_timeout_secs).map_err(|_| {
            Error::usage(format!(
                "{}: boot_timeout_secs {} is not a valid duration",
                path.display(),
                raw.boot_timeout_secs
            ))
        })?;

        Ok(Self {
            machine_template: read_template(dir, &raw.machine)?,
            storage_template: read_template(dir, &raw.storage)?,
            boot_medium: raw.boot_medium,
            images: dir.join(raw.images),
            first_screen: raw.first_screen.as_ref().map(ImageRef::target),
            record: raw.record,
            dir: dir.to_path_buf(),
            boot_timeout,
            script,
            name,
        })
    }
}

fn read_template(dir: &Path, file: &Path) -> Result<String> {
    let path = dir.join(file);
    std::fs::read_to_string(&path)
        .map_err(|e| Error::usage(format!("Cannot read template {}: {}", path.display(), e)))
}

/// Load the flat, sorted list of tests below `root`
///
/// A non-empty `only` restricts the list to the named tests; naming a test
/// that does not exist is an error.
pub fn discover(root: &Path, registry: &ScriptRegistry, only: &[String]) -> Result<Vec<TestDescriptor>> {
    if !root.is_dir() {
        return Err(Error::usage(format!("{} is not a directory", root.display())));
    }

    let mut tests = Vec::new();
    let mut names = HashSet::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::usage(format!("Cannot scan {}: {}", root.display(), e)))?;
        if !entry.file_type().is_dir() || !entry.path().join(DESCRIPTOR_FILE).is_file() {
            continue;
        }

        let test = TestDescriptor::load(entry.path(), registry)?;
        if !names.insert(test.name.clone()) {
            return Err(Error::usage(format!(
                "Test name '{}' is used by more than one descriptor",
                test.name
            )));
        }
        debug!("Loaded test {} from {}", test.name, test.dir.display());
        tests.push(test);
    }

    if !only.is_empty() {
        if let Some(missing) = only.iter().find(|n| !names.contains(n.as_str())) {
            return Err(Error::usage(format!("No test named '{}' in {}", missing, root.display())));
        }
        tests.retain(|t| only.contains(&t.name));
    }

    info!("Found {} test(s) in {}", tests.len(), root.display());
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MACHINE: &str = "<domain><name>m-{id}</name></domain>";
    const STORAGE: &str = "<volume><name>m-{id}.qcow2</name></volume>";

    fn write_test(root: &Path, dir: &str, yaml: &str) {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("machine.xml"), MACHINE).unwrap();
        std::fs::write(dir.join("storage.xml"), STORAGE).unwrap();
        std::fs::write(dir.join(DESCRIPTOR_FILE), yaml).unwrap();
    }

    const STEPS: &str = r#"
machine: machine.xml
storage: storage.xml
boot_medium: /srv/iso/live.iso
script:
  steps:
    - { action: wait, image: grub }
"#;

    #[test]
    fn test_defaults_and_templates() {
        let root = tempfile::tempdir().unwrap();
        write_test(root.path(), "fedora", STEPS);

        let test = TestDescriptor::load(&root.path().join("fedora"), &ScriptRegistry::new()).unwrap();
        assert_eq!(test.name, "fedora");
        assert!(!test.record);
        assert_eq!(test.machine_template, MACHINE);
        assert_eq!(test.storage_template, STORAGE);
        assert_eq!(test.images, root.path().join("fedora").join("images"));
        assert_eq!(test.boot_timeout, Duration::from_secs(60));
        assert!(test.first_screen.is_none());
    }

    #[test]
    fn test_explicit_fields() {
        let root = tempfile::tempdir().unwrap();
        write_test(
            root.path(),
            "dir",
            r#"
name: fedora-install
record: true
machine: machine.xml
storage: storage.xml
boot_medium: /srv/iso/live.iso
images: shots
first_screen: [grub, grub_efi]
boot_timeout_secs: 120
script:
  builtin: capture
"#,
        );

        let test = TestDescriptor::load(&root.path().join("dir"), &ScriptRegistry::with_builtins()).unwrap();
        assert_eq!(test.name, "fedora-install");
        assert!(test.record);
        assert_eq!(test.images, root.path().join("dir").join("shots"));
        assert_eq!(test.first_screen.unwrap().to_string(), "[grub, grub_efi]");
        assert_eq!(test.boot_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_unknown_builtin_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_test(
            root.path(),
            "t",
            "machine: machine.xml\nstorage: storage.xml\nboot_medium: x.iso\nscript:\n  builtin: nope\n",
        );
        let err = TestDescriptor::load(&root.path().join("t"), &ScriptRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_script_needs_exactly_one_kind() {
        let root = tempfile::tempdir().unwrap();
        write_test(
            root.path(),
            "t",
            "machine: machine.xml\nstorage: storage.xml\nboot_medium: x.iso\nscript: {}\n",
        );
        assert!(TestDescriptor::load(&root.path().join("t"), &ScriptRegistry::new()).is_err());
    }

    #[test]
    fn test_missing_template_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_test(root.path(), "t", &STEPS.replace("machine.xml", "absent.xml"));
        assert!(TestDescriptor::load(&root.path().join("t"), &ScriptRegistry::new()).is_err());
    }

    #[test]
    fn test_discover_is_sorted_and_flat() {
        let root = tempfile::tempdir().unwrap();
        write_test(root.path(), "b-second", STEPS);
        write_test(root.path(), "a-first", STEPS);
        write_test(&root.path().join("nested"), "c-deeper", STEPS);
        std::fs::create_dir(root.path().join("not-a-test")).unwrap();

        let tests = discover(root.path(), &ScriptRegistry::new(), &[]).unwrap();
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a-first", "b-second"]);
    }

    #[test]
    fn test_discover_only() {
        let root = tempfile::tempdir().unwrap();
        write_test(root.path(), "a", STEPS);
        write_test(root.path(), "b", STEPS);

        let tests = discover(root.path(), &ScriptRegistry::new(), &["b".to_string()]).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "b");

        let err = discover(root.path(), &ScriptRegistry::new(), &["zzz".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let root = tempfile::tempdir().unwrap();
        let named = format!("name: same\n{}", STEPS);
        write_test(root.path(), "a", &named);
        write_test(root.path(), "b", &named);
        assert!(matches!(
            discover(root.path(), &ScriptRegistry::new(), &[]),
            Err(Error::Usage(_))
        ));
    }
}
