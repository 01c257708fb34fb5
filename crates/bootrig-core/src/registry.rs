//! The VM registry: a configuration-initialised context object owning every
//! VM a test script may drive.
//!
//! There is no process-wide singleton; scripts create a [`Harness`]
//! explicitly and hand it around. Dropping it force-cleans every VM so
//! hypervisor processes cannot outlive the script, uncaught errors included.

use std::ops::{Index, IndexMut};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::{DEFAULT_CONFIG_FILE, HarnessConfig, SOURCE_ROOT_ENV, VmConfig};
use crate::error::{HarnessError, Result};
use crate::vm::Vm;

/// Registry of configured VMs for one test-script run.
pub struct Harness {
    vms: Vec<Vm>,
    config: HarnessConfig,
}

impl Harness {
    /// Build the VM list from configuration. An empty `[[vm]]` list yields
    /// one default VM, so a minimal script can always take `&mut harness[0]`.
    /// No VMs are added or removed after this point.
    pub fn from_config(config: HarnessConfig) -> Self {
        let mut vm_configs = config.vms.clone();
        if vm_configs.is_empty() {
            vm_configs.push(VmConfig::default());
        }
        let vms: Vec<Vm> = vm_configs
            .into_iter()
            .map(|vm_config| Vm::new(vm_config, &config))
            .collect();

        info!(count = vms.len(), "harness initialised");
        Self { vms, config }
    }

    /// Resolve configuration the way standalone test scripts are invoked:
    /// [`SOURCE_ROOT_ENV`] names the root source tree (falling back to the
    /// current directory), and a `bootrig.toml` there is loaded when present.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var(SOURCE_ROOT_ENV)
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .map_err(HarnessError::Io)?;

        let path = root.join(DEFAULT_CONFIG_FILE);
        let mut config = if path.exists() {
            HarnessConfig::from_file(&path)?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            HarnessConfig::default()
        };
        config.build.source_root = root;

        Ok(Self::from_config(config))
    }

    /// The configuration the registry was initialised from.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// The VM at `index`.
    pub fn vm(&mut self, index: usize) -> Result<&mut Vm> {
        let count = self.vms.len();
        self.vms
            .get_mut(index)
            .ok_or_else(|| HarnessError::NotFound(format!("index {index} (of {count} VMs)")))
    }

    /// The VM named `name`.
    pub fn vm_by_name(&mut self, name: &str) -> Result<&mut Vm> {
        self.vms
            .iter_mut()
            .find(|vm| vm.name() == name)
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))
    }

    /// All VMs, for concurrent boot cycles via `split_at_mut`.
    pub fn vms_mut(&mut self) -> &mut [Vm] {
        &mut self.vms
    }

    /// Force-clean every VM. Best effort: failures in one VM never affect
    /// another, and nothing escalates out of teardown.
    pub fn teardown(&mut self) {
        for vm in &mut self.vms {
            vm.clean();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Index<usize> for Harness {
    type Output = Vm;

    fn index(&self, index: usize) -> &Vm {
        &self.vms[index]
    }
}

impl IndexMut<usize> for Harness {
    fn index_mut(&mut self, index: usize) -> &mut Vm {
        &mut self.vms[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmPhase;

    #[test]
    fn test_empty_config_yields_one_default_vm() {
        let mut harness = Harness::from_config(HarnessConfig::default());
        assert_eq!(harness.len(), 1);
        assert!(harness.vm(0).is_ok());
        assert!(harness.vm(1).is_err());
    }

    #[test]
    fn test_vms_built_from_config_entries() {
        let config = HarnessConfig {
            vms: vec![
                VmConfig {
                    name: "first".into(),
                    ..Default::default()
                },
                VmConfig {
                    name: "second".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut harness = Harness::from_config(config);

        assert_eq!(harness.len(), 2);
        assert_eq!(harness[0].name(), "first");
        assert_eq!(harness.vm_by_name("second").unwrap().name(), "second");
        assert!(matches!(
            harness.vm_by_name("third").unwrap_err(),
            HarnessError::NotFound(_)
        ));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut harness = Harness::from_config(HarnessConfig::default());
        harness.teardown();
        harness.teardown();
        assert_eq!(harness[0].phase(), VmPhase::Terminal);
    }
}
