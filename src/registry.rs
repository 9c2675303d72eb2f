//! Module registry: discovers, loads, unloads and tracks backend modules.
//!
//! A record's declared capability set and namespace list are fixed for the
//! whole load cycle. Namespace display names are restored from persisted
//! state so they stay stable across reloads. A module that fails to load is
//! remembered and skipped on later attempts instead of re-prompting the user
//! on every refresh.

use std::collections::HashSet;

use crate::config::{ModuleState, RegistryConfig, SettingsRef};
use crate::errors::{HostError, HostResult};
use crate::guard::Reentrancy;
use perch_plugin_api::{Module, ModuleInfo, Services};

/// How a module gets into the process: a name, the contract version it was
/// built against, and a factory producing the loaded instance.
pub struct ModuleDescriptor {
    pub name: String,
    pub contract_version: u32,
    pub create: Box<dyn FnOnce() -> Result<Box<dyn Module>, String>>,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        contract_version: u32,
        create: impl FnOnce() -> Result<Box<dyn Module>, String> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            contract_version,
            create: Box::new(create),
        }
    }
}

/// A namespace name as the router sees it: display text plus the per-module
/// index disambiguating multi-namespace modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceName {
    pub text: String,
    pub index: usize,
}

/// A module's menu contribution after loading: the module-scoped id plus the
/// host-assigned duplicate-free runtime id.
#[derive(Debug, Clone)]
pub struct LoadedMenuItem {
    pub module: String,
    pub module_id: u32,
    pub runtime_id: u32,
    pub title: String,
}

/// One loaded module and everything the host cached about it at load time.
pub struct ModuleRecord {
    pub name: String,
    pub info: ModuleInfo,
    pub contract_version: u32,
    /// Declared capability set; immutable for the load cycle.
    pub services: Services,
    /// Namespace display names in declaration order; immutable for the load
    /// cycle.
    pub namespaces: Vec<String>,
    pub menu_items: Vec<LoadedMenuItem>,
    pub enabled: bool,
    pub(crate) module: Box<dyn Module>,
    pub(crate) open_sessions: usize,
    pub(crate) pending_unload: bool,
}

impl ModuleRecord {
    pub fn open_sessions(&self) -> usize {
        self.open_sessions
    }

    pub(crate) fn module_mut(&mut self) -> &mut dyn Module {
        self.module.as_mut()
    }
}

/// The registry proper.
pub struct ModuleRegistry {
    records: Vec<ModuleRecord>,
    /// Names whose last load failed; skipped until the user intervenes.
    blocked: HashSet<String>,
    next_menu_id: u32,
    min_contract: u32,
}

impl ModuleRegistry {
    pub fn new(min_contract: u32) -> Self {
        Self {
            records: Vec::new(),
            blocked: HashSet::new(),
            next_menu_id: 1,
            min_contract,
        }
    }

    /// Load a module. Refuses contract versions below the host minimum and
    /// remembers failures so a bad module is not retried on every refresh.
    /// `persisted` restores display names and settings saved in an earlier
    /// run.
    pub fn load(
        &mut self,
        desc: ModuleDescriptor,
        persisted: Option<&ModuleState>,
    ) -> HostResult<&ModuleRecord> {
        if self.record_by_name(&desc.name).is_some() {
            return Err(HostError::LoadFailure {
                name: desc.name,
                reason: "already loaded".into(),
            });
        }
        if self.blocked.contains(&desc.name) {
            return Err(HostError::LoadFailure {
                name: desc.name,
                reason: "previous load failure remembered".into(),
            });
        }
        if desc.contract_version < self.min_contract {
            log::warn!(
                "refusing module '{}': contract v{} < host minimum v{}",
                desc.name,
                desc.contract_version,
                self.min_contract
            );
            self.blocked.insert(desc.name.clone());
            return Err(HostError::VersionMismatch {
                name: desc.name,
                found: desc.contract_version,
                min: self.min_contract,
            });
        }

        let mut module = match (desc.create)() {
            Ok(module) => module,
            Err(reason) => {
                log::warn!("module '{}' failed to load: {}", desc.name, reason);
                self.blocked.insert(desc.name.clone());
                return Err(HostError::LoadFailure {
                    name: desc.name,
                    reason,
                });
            }
        };

        let info = module.info().clone();
        let services = module.services();
        let mut namespaces = module.namespaces();

        // A persisted display name wins over the module's current one so the
        // name the user sees survives reloads.
        if let Some(state) = persisted {
            for (i, saved) in state.namespaces.iter().enumerate() {
                if i < namespaces.len() && !saved.is_empty() {
                    namespaces[i] = saved.clone();
                }
            }
            // The module only reads during restore; it gets a scratch view.
            let mut restored = state.settings.clone();
            module.load_settings(&SettingsRef::new(&mut restored));
        }

        let menu_items = module
            .menu_items()
            .into_iter()
            .map(|item| {
                let runtime_id = self.next_menu_id;
                self.next_menu_id += 1;
                LoadedMenuItem {
                    module: desc.name.clone(),
                    module_id: item.id,
                    runtime_id,
                    title: item.title,
                }
            })
            .collect();

        let enabled = persisted.map(|s| s.enabled).unwrap_or(true);
        log::info!(
            "loaded module '{}' (contract v{}, namespaces {:?})",
            desc.name,
            desc.contract_version,
            namespaces
        );
        self.records.push(ModuleRecord {
            name: desc.name,
            info,
            contract_version: desc.contract_version,
            services,
            namespaces,
            menu_items,
            enabled,
            module,
            open_sessions: 0,
            pending_unload: false,
        });
        Ok(self.records.last().expect("just pushed"))
    }

    /// Unload a module. Refuses while any of its sessions remain open; when a
    /// call into module code is in flight the unload is deferred until the
    /// guard unwinds (`Ok(false)`). With `ask_save` the module gets a chance
    /// to persist its settings into `config` first.
    pub fn unload(
        &mut self,
        name: &str,
        ask_save: bool,
        guard: &Reentrancy,
        config: &mut RegistryConfig,
    ) -> HostResult<bool> {
        let idx = self
            .records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| HostError::LoadFailure {
                name: name.to_string(),
                reason: "not loaded".into(),
            })?;

        if self.records[idx].open_sessions > 0 {
            return Err(HostError::SessionsOpen(name.to_string()));
        }
        if guard.in_region() {
            // Teardown while module code is on the stack would tear the
            // module table out from under it.
            self.records[idx].pending_unload = true;
            log::debug!("unload of '{}' deferred until the guard unwinds", name);
            return Ok(false);
        }

        let mut record = self.records.remove(idx);
        if ask_save {
            let state = config.module_mut(&record.name);
            record
                .module
                .save_settings(&mut SettingsRef::new(&mut state.settings));
        }
        // Keep the display names the user saw for the next load cycle.
        let state = config.module_mut(&record.name);
        state.namespaces = record.namespaces.clone();
        log::info!("unloaded module '{}'", record.name);
        Ok(true)
    }

    /// Unload everything that asked for it (via a deferred unload or the
    /// module's own "please unload me") once no module code is in flight.
    /// Returns the names unloaded.
    pub fn service_pending_unloads(
        &mut self,
        guard: &Reentrancy,
        config: &mut RegistryConfig,
    ) -> Vec<String> {
        if guard.in_region() {
            return Vec::new();
        }
        let pending: Vec<String> = self
            .records
            .iter()
            .filter(|r| (r.pending_unload || r.module.wants_unload()) && r.open_sessions == 0)
            .map(|r| r.name.clone())
            .collect();
        let mut unloaded = Vec::new();
        for name in pending {
            if matches!(self.unload(&name, true, guard, config), Ok(true)) {
                unloaded.push(name);
            }
        }
        unloaded
    }

    /// Resolve a namespace name, case-insensitively, to its owning module and
    /// the per-module namespace index. Collisions across modules resolve to
    /// the earliest-loaded module; within one load cycle the answer is
    /// stable.
    pub fn resolve_namespace(&self, name: &str) -> Option<(usize, NamespaceName)> {
        for (rec_idx, record) in self.records.iter().enumerate() {
            if !record.enabled {
                continue;
            }
            for (ns_idx, ns) in record.namespaces.iter().enumerate() {
                if ns.eq_ignore_ascii_case(name) {
                    return Some((
                        rec_idx,
                        NamespaceName {
                            text: ns.clone(),
                            index: ns_idx,
                        },
                    ));
                }
            }
        }
        None
    }

    /// All menu contributions in load order, each with its unique runtime id.
    pub fn enumerate_menu_items(&self) -> Vec<&LoadedMenuItem> {
        self.records
            .iter()
            .flat_map(|r| r.menu_items.iter())
            .collect()
    }

    pub fn record(&self, idx: usize) -> Option<&ModuleRecord> {
        self.records.get(idx)
    }

    pub(crate) fn record_mut(&mut self, idx: usize) -> Option<&mut ModuleRecord> {
        self.records.get_mut(idx)
    }

    pub fn record_by_name(&self, name: &str) -> Option<&ModuleRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub(crate) fn record_by_name_mut(&mut self, name: &str) -> Option<&mut ModuleRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleRecord> {
        self.records.iter_mut()
    }

    /// Was this module's last load attempt a remembered failure?
    pub fn is_blocked(&self, name: &str) -> bool {
        self.blocked.contains(name)
    }

    /// Forget a remembered load failure (user asked to retry).
    pub fn unblock(&mut self, name: &str) {
        self.blocked.remove(name);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn note_session_opened(&mut self, name: &str) {
        if let Some(record) = self.record_by_name_mut(name) {
            record.open_sessions += 1;
        }
    }

    pub(crate) fn note_session_closed(&mut self, name: &str) {
        if let Some(record) = self.record_by_name_mut(name) {
            debug_assert!(record.open_sessions > 0, "session count underflow");
            record.open_sessions = record.open_sessions.saturating_sub(1);
        }
    }
}
