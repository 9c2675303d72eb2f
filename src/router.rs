//! Namespace router and session dispatch.
//!
//! Parses `<namespace>:<remainder>` paths, resolves them to an open session
//! or an open request, gates every optional call on the session's capability
//! cache, and brackets every crossing into module code with the reentrancy
//! guard. Recoverable backend errors are translated here into ordinary
//! failed-operation results; the session stays open so the user can retry
//! without re-authenticating.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::RegistryConfig;
use crate::errors::{HostError, HostResult};
use crate::guard::Reentrancy;
use crate::handle::BackendHandle;
use crate::host::{HostBridge, HostRequest, LogSink, MessageSink};
use crate::notify::ChangeNotification;
use crate::panel::{PanelId, PanelTable};
use crate::registry::{ModuleDescriptor, ModuleRegistry};
use crate::session::{ClosePolicy, FsSession, SessionId};
use crate::timer::TimerQueue;
use perch_plugin_api::{
    AttrChange, CloseDecision, CloseReason, DropEffect, FileEntry, FsBackend, HostServices,
    MenuItem, Services,
};

/// A parsed `<namespace>:<remainder>` path. A bare name denotes the
/// namespace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsPath<'a> {
    pub namespace: &'a str,
    pub user_part: &'a str,
}

impl<'a> VfsPath<'a> {
    pub fn parse(path: &'a str) -> HostResult<Self> {
        let (namespace, user_part) = match path.split_once(':') {
            Some((ns, rest)) => (ns, rest),
            None => (path, ""),
        };
        if namespace.is_empty() {
            return Err(HostError::BadPath(path.to_string()));
        }
        Ok(Self {
            namespace,
            user_part,
        })
    }
}

/// Result of a close-or-detach negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    Detached,
    Refused,
}

/// The dispatch hub: registry, open-session table, panels, timers and the
/// notification fan-out, all driven from one logical host thread.
pub struct Router {
    registry: ModuleRegistry,
    sessions: Vec<FsSession>,
    panels: PanelTable,
    timers: TimerQueue,
    guard: Rc<Reentrancy>,
    config: RegistryConfig,
    sink: Box<dyn MessageSink>,
    cache_root: PathBuf,
    /// Creation-order counter; zero stays "uninitialized".
    next_session_id: SessionId,
}

impl Router {
    pub fn new(min_contract: u32) -> Self {
        Self::with_config(min_contract, RegistryConfig::default())
    }

    pub fn with_config(min_contract: u32, config: RegistryConfig) -> Self {
        Self {
            registry: ModuleRegistry::new(min_contract),
            sessions: Vec::new(),
            panels: PanelTable::new(),
            timers: TimerQueue::new(),
            guard: Reentrancy::new(),
            config,
            sink: Box::new(LogSink),
            cache_root: std::env::temp_dir().join("perch-cache"),
            next_session_id: 1,
        }
    }

    pub fn set_message_sink(&mut self, sink: Box<dyn MessageSink>) {
        self.sink = sink;
    }

    pub fn set_cache_root(&mut self, root: PathBuf) {
        self.cache_root = root;
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Guard nesting depth; zero between top-level host calls.
    pub fn guard_depth(&self) -> u32 {
        self.guard.depth()
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Load a module, restoring its persisted display names and settings.
    pub fn load_module(&mut self, desc: ModuleDescriptor) -> HostResult<()> {
        let persisted = self.config.module(&desc.name).cloned();
        self.registry.load(desc, persisted.as_ref())?;
        Ok(())
    }

    /// Unload a module; refused while it has open sessions, deferred while
    /// module code is in flight.
    pub fn unload_module(&mut self, name: &str, ask_save: bool) -> HostResult<bool> {
        self.registry
            .unload(name, ask_save, &self.guard, &mut self.config)
    }

    /// Menu contributions of all loaded modules, runtime ids included.
    pub fn menu_items(&self) -> Vec<&crate::registry::LoadedMenuItem> {
        self.registry.enumerate_menu_items()
    }

    // ------------------------------------------------------------------
    // Panels
    // ------------------------------------------------------------------

    pub fn set_panel_path(&mut self, panel: PanelId, path: impl Into<String>) {
        self.panels.set_path(panel, path);
    }

    /// Clear and return the panel's pending-refresh flag.
    pub fn take_panel_refresh(&mut self, panel: PanelId) -> bool {
        self.panels.take_refresh(panel)
    }

    pub fn panel_path(&self, panel: PanelId) -> Option<&str> {
        self.panels.path_of(panel)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open `path` for `panel`. If the remainder addresses a backend an open
    /// session of this panel (or the detached set) already holds, the router
    /// navigates that session in place instead of opening a second
    /// connection; the equivalence test is the backend's, not string
    /// equality.
    pub fn open_fs(&mut self, panel: PanelId, path: &str) -> HostResult<SessionId> {
        let parsed = VfsPath::parse(path)?;
        let (rec_idx, ns) = self
            .registry
            .resolve_namespace(parsed.namespace)
            .ok_or_else(|| HostError::UnknownNamespace(parsed.namespace.to_string()))?;
        let user_part = parsed.user_part.to_string();
        let record = self.registry.record(rec_idx).expect("just resolved");
        let module_name = record.name.clone();
        let contract_version = record.contract_version;
        let declared = record.services;

        if let Some(idx) = self.find_equivalent(&module_name, ns.index, &user_part, panel) {
            self.change_path_at(idx, ns.index, &user_part)?;
            let id = self.sessions[idx].id();
            self.sessions[idx].attach_to_panel(panel);
            let shown = self.full_path_of(idx);
            self.panels.set_path(panel, shown);
            log::debug!("routed '{}' to existing session {}", path, id);
            return Ok(id);
        }

        let backend = {
            let _region = self.guard.enter();
            self.registry
                .record_mut(rec_idx)
                .expect("just resolved")
                .module_mut()
                .open_session(ns.index)
        };
        let Some(backend) = backend else {
            return Err(HostError::Handshake {
                path: path.to_string(),
                reason: "module did not provide a session".into(),
            });
        };

        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.push(FsSession::new(
            id,
            module_name.clone(),
            ns,
            BackendHandle::new(backend, contract_version),
            declared,
        ));
        self.registry.note_session_opened(&module_name);
        let idx = self.sessions.len() - 1;

        // First path change doubles as the backend handshake. Failure
        // discards the Opening session; the caller sees an ordinary
        // navigation failure.
        let ns_index = self.sessions[idx].namespace().index;
        if let Err(e) = self.change_path_at(idx, ns_index, &user_part) {
            self.close_session_at(idx);
            return Err(HostError::Handshake {
                path: path.to_string(),
                reason: e.to_string(),
            });
        }

        self.sessions[idx].attach_to_panel(panel);
        let shown = self.full_path_of(idx);
        self.panels.set_path(panel, shown);
        log::info!("opened session {} for '{}'", id, path);
        Ok(id)
    }

    /// Navigate an open session within its namespace.
    pub fn change_path(&mut self, session: SessionId, user_part: &str) -> HostResult<()> {
        let idx = self.session_index(session)?;
        let ns_index = self.sessions[idx].namespace().index;
        self.change_path_at(idx, ns_index, user_part)
    }

    pub fn session(&self, id: SessionId) -> Option<&FsSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn detached_sessions(&self) -> impl Iterator<Item = &FsSession> {
        self.sessions.iter().filter(|s| s.is_detached())
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The negotiation: ask the session to close, or detach if the caller
    /// allows it. The backend may refuse; with `force` the refusal is
    /// advisory and the session closes regardless. Detach confirmation is
    /// the supplied policy's decision, not the state machine's.
    pub fn try_close_or_detach(
        &mut self,
        session: SessionId,
        force: bool,
        can_detach: bool,
        reason: CloseReason,
        policy: &mut dyn ClosePolicy,
    ) -> HostResult<CloseOutcome> {
        let idx = self.session_index(session)?;
        let (decision, current) = {
            let _region = self.guard.enter();
            let backend = self.sessions[idx]
                .handle
                .get_mut()
                .ok_or(HostError::NoSuchSession)?;
            let decision = backend.try_close_or_detach(force, can_detach, reason);
            (decision, backend.current_path())
        };

        match decision {
            CloseDecision::Close => {
                self.close_session_at(idx);
                Ok(CloseOutcome::Closed)
            }
            CloseDecision::Detach if can_detach => {
                if self.sessions[idx].is_detached() {
                    // Repeating the question without a state change in
                    // between keeps the answer, index included.
                    return Ok(CloseOutcome::Detached);
                }
                let module = self.sessions[idx].module().to_string();
                if policy.confirm_detach(&module, &current) {
                    let dup = self
                        .sessions
                        .iter()
                        .filter(|s| s.is_detached() && s.module() == module)
                        .count() as u32;
                    self.sessions[idx].detach(dup, current);
                    Ok(CloseOutcome::Detached)
                } else if force {
                    self.close_session_at(idx);
                    Ok(CloseOutcome::Closed)
                } else {
                    Ok(CloseOutcome::Refused)
                }
            }
            _ => {
                if force {
                    self.close_session_at(idx);
                    Ok(CloseOutcome::Closed)
                } else {
                    Ok(CloseOutcome::Refused)
                }
            }
        }
    }

    /// Tear a session down. The only path to Closed; the module's
    /// `close_session` runs exactly once and the session's timers are
    /// removed before it.
    pub fn close_fs(&mut self, session: SessionId) -> HostResult<()> {
        let idx = self.session_index(session)?;
        self.close_session_at(idx);
        Ok(())
    }

    /// Force-close everything at process shutdown. Refusing sessions are
    /// closed anyway; their pending timers are dropped, not fired.
    pub fn shutdown(&mut self) {
        while let Some(idx) = self.sessions.iter().position(|s| !s.is_closed()) {
            {
                // Advisory only; the answer cannot prevent the close.
                let _region = self.guard.enter();
                if let Some(backend) = self.sessions[idx].handle.get_mut() {
                    let _ = backend.try_close_or_detach(true, false, CloseReason::Shutdown);
                }
            }
            self.close_session_at(idx);
        }
        self.registry
            .service_pending_unloads(&self.guard, &mut self.config);
    }

    // ------------------------------------------------------------------
    // Gated panel operations
    // ------------------------------------------------------------------

    pub fn list_dir(&mut self, session: SessionId) -> HostResult<Vec<FileEntry>> {
        self.gated(session, Services::LIST, |b, h| b.list_dir(h))
    }

    pub fn delete(&mut self, session: SessionId, name: &str) -> HostResult<()> {
        let name = name.to_string();
        self.gated_mutation(session, Services::DELETE, move |b, h| b.delete(&name, h))
    }

    pub fn rename(&mut self, session: SessionId, from: &str, to: &str) -> HostResult<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.gated_mutation(session, Services::QUICK_RENAME, move |b, h| {
            b.rename(&from, &to, h)
        })
    }

    pub fn create_dir(&mut self, session: SessionId, name: &str) -> HostResult<()> {
        let name = name.to_string();
        self.gated_mutation(session, Services::CREATE_DIR, move |b, h| {
            b.create_dir(&name, h)
        })
    }

    pub fn copy_out(&mut self, session: SessionId, name: &str, target: &Path) -> HostResult<()> {
        let name = name.to_string();
        let target = target.to_path_buf();
        self.gated(session, Services::COPY_OUT, move |b, h| {
            b.copy_out(&name, &target, h)
        })
    }

    pub fn copy_in(&mut self, session: SessionId, source: &Path, name: &str) -> HostResult<()> {
        let source = source.to_path_buf();
        let name = name.to_string();
        self.gated_mutation(session, Services::COPY_IN, move |b, h| {
            b.copy_in(&source, &name, h)
        })
    }

    pub fn change_attributes(
        &mut self,
        session: SessionId,
        name: &str,
        change: AttrChange,
    ) -> HostResult<()> {
        let name = name.to_string();
        self.gated_mutation(session, Services::CHANGE_ATTRS, move |b, h| {
            b.change_attributes(&name, &change, h)
        })
    }

    pub fn show_info(&mut self, session: SessionId) -> HostResult<()> {
        self.gated(session, Services::SHOW_INFO, |b, h| b.show_info(h))
    }

    pub fn context_menu(&mut self, session: SessionId, name: &str) -> HostResult<Vec<MenuItem>> {
        let name = name.to_string();
        self.gated(session, Services::CONTEXT_MENU, move |b, _h| {
            b.context_menu(&name)
        })
    }

    pub fn execute_command_line(&mut self, session: SessionId, line: &str) -> HostResult<()> {
        let line = line.to_string();
        self.gated_mutation(session, Services::COMMAND_LINE, move |b, h| {
            b.execute_command_line(&line, h)
        })
    }

    /// Negotiated drag-and-drop effect; `DropEffect::None` when the session
    /// does not support negotiation.
    pub fn drop_effect(&mut self, session: SessionId, source: &str, target: &str) -> DropEffect {
        let Ok(idx) = self.session_index(session) else {
            return DropEffect::None;
        };
        if !self.sessions[idx].services().contains(Services::DROP_EFFECT) {
            return DropEffect::None;
        }
        let _region = self.guard.enter();
        match self.sessions[idx].handle.get() {
            Some(backend) => backend.drop_effect(source, target),
            None => DropEffect::None,
        }
    }

    /// Free space at the session's location; `None` when unsupported or
    /// unknown, never an error.
    pub fn free_space(&mut self, session: SessionId) -> Option<u64> {
        let idx = self.session_index(session).ok()?;
        if !self.sessions[idx].services().contains(Services::FREE_SPACE) {
            return None;
        }
        let _region = self.guard.enter();
        self.sessions[idx].handle.get()?.free_space()
    }

    // ------------------------------------------------------------------
    // Notifications & timers
    // ------------------------------------------------------------------

    /// Broadcast "path changed" to every loaded module and session that
    /// wants it, then mark every panel whose shown path overlaps. Completes
    /// before returning, so sequential mutations are observed in program
    /// order. Receivers must tolerate repeats.
    pub fn notify(&mut self, path: &str, include_subtree: bool) {
        let notification = ChangeNotification::new(path, include_subtree);
        {
            // Every loaded module hears about the change, declared interest
            // or not; the trait's default no-op makes that cheap.
            let _region = self.guard.enter();
            for record in self.registry.iter_mut() {
                record
                    .module_mut()
                    .path_changed(&notification.path, notification.include_subtree);
            }
            for session in self.sessions.iter_mut() {
                if let Some(backend) = session.handle.get_mut() {
                    backend.path_changed(&notification.path, notification.include_subtree);
                }
            }
        }
        for panel in self.panels.iter_mut() {
            if notification.covers(&panel.path) {
                panel.needs_refresh = true;
            }
        }
    }

    /// Service expired timers. Entries armed during this tick wait for the
    /// next one; a session re-arming a zero-delay timer cannot starve the
    /// host. Also honors deferred and module-requested unloads once no
    /// module code is in flight. Returns the number of timers dispatched.
    pub fn tick(&mut self, now: Instant) -> usize {
        let cutoff = self.timers.begin_tick();
        let mut fired = 0;
        while let Some((owner, tag)) = self.timers.pop_due(now, cutoff) {
            let Some(idx) = self.sessions.iter().position(|s| s.id() == owner) else {
                continue;
            };
            let _ = self.with_backend(idx, move |b, h| b.timer_fired(tag, h));
            fired += 1;
        }
        self.registry
            .service_pending_unloads(&self.guard, &mut self.config);
        fired
    }

    /// Earliest pending timer deadline, for the host loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session_index(&self, id: SessionId) -> HostResult<usize> {
        self.sessions
            .iter()
            .position(|s| s.id() == id)
            .ok_or(HostError::NoSuchSession)
    }

    /// Bracketed call into a session's backend. Host requests the backend
    /// queued during the call are applied after it returns, before this
    /// function does.
    fn with_backend<T>(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut dyn FsBackend, &mut dyn HostServices) -> T,
    ) -> HostResult<T> {
        let (module_name, owner) = {
            let session = self.sessions.get(idx).ok_or(HostError::NoSuchSession)?;
            (session.module().to_string(), session.id())
        };
        let (result, requests) = {
            let state = self.config.module_mut(&module_name);
            let mut bridge = HostBridge::new(
                &module_name,
                &mut state.settings,
                self.sink.as_mut(),
                &self.cache_root,
            );
            let backend = self.sessions[idx]
                .handle
                .get_mut()
                .ok_or(HostError::NoSuchSession)?;
            let region = self.guard.enter();
            let result = f(backend, &mut bridge);
            drop(region);
            (result, bridge.requests)
        };
        self.apply_requests(owner, requests);
        Ok(result)
    }

    fn apply_requests(&mut self, owner: SessionId, requests: Vec<HostRequest>) {
        let now = Instant::now();
        for request in requests {
            match request {
                HostRequest::PostChange {
                    path,
                    include_subtree,
                } => self.notify(&path, include_subtree),
                HostRequest::AddTimer { delay_ms, tag } => {
                    self.timers
                        .add(now, owner, Duration::from_millis(delay_ms), tag)
                }
                HostRequest::KillTimers { tag } => {
                    self.timers.kill(owner, tag);
                }
            }
        }
    }

    /// Capability-gated read call.
    fn gated<T>(
        &mut self,
        session: SessionId,
        need: Services,
        f: impl FnOnce(&mut dyn FsBackend, &mut dyn HostServices) -> perch_plugin_api::ModuleResult<T>,
    ) -> HostResult<T> {
        let idx = self.session_index(session)?;
        if !self.sessions[idx].services().contains(need) {
            return Err(HostError::NotSupported);
        }
        match self.with_backend(idx, f)? {
            Ok(value) => Ok(value),
            Err(e) => {
                // The session stays open; abilities may have narrowed with
                // the failure, so re-query before the next resolution.
                let _region = self.guard.enter();
                self.sessions[idx].refresh_services();
                Err(e.into())
            }
        }
    }

    /// Capability-gated mutation: on success the change is fanned out to
    /// every listener before returning.
    fn gated_mutation(
        &mut self,
        session: SessionId,
        need: Services,
        f: impl FnOnce(&mut dyn FsBackend, &mut dyn HostServices) -> perch_plugin_api::ModuleResult<()>,
    ) -> HostResult<()> {
        let idx = self.session_index(session)?;
        self.gated(session, need, f)?;
        let changed = self.full_path_of(idx);
        self.notify(&changed, true);
        Ok(())
    }

    fn change_path_at(&mut self, idx: usize, ns_index: usize, user_part: &str) -> HostResult<()> {
        let user = user_part.to_string();
        let result = self.with_backend(idx, move |b, h| b.change_path(ns_index, &user, h))?;
        {
            // Abilities are state-dependent; re-query after every path
            // change, successful or not.
            let _region = self.guard.enter();
            self.sessions[idx].refresh_services();
        }
        match result {
            Ok(()) => {
                self.sessions[idx].mark_connected();
                if let Some(panel) = self.sessions[idx].panel() {
                    let shown = self.full_path_of(idx);
                    self.panels.set_path(panel, shown);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `namespace:current_path` of an open session, for panel display and
    /// change notifications.
    fn full_path_of(&self, idx: usize) -> String {
        let session = &self.sessions[idx];
        let current = {
            let _region = self.guard.enter();
            session
                .handle
                .get()
                .map(|b| b.current_path())
                .unwrap_or_default()
        };
        format!("{}:{}", session.namespace().text, current)
    }

    /// Find an open session of this panel or the detached set that the
    /// backend considers "the same" as the requested path.
    fn find_equivalent(
        &self,
        module: &str,
        ns_index: usize,
        user_part: &str,
        panel: PanelId,
    ) -> Option<usize> {
        let _region = self.guard.enter();
        self.sessions.iter().position(|s| {
            s.module() == module
                && (s.is_detached() || s.panel() == Some(panel))
                && s.handle
                    .get()
                    .is_some_and(|b| b.is_our_path(ns_index, user_part))
        })
    }

    fn close_session_at(&mut self, idx: usize) {
        let id = self.sessions[idx].id();
        let module_name = self.sessions[idx].module().to_string();
        self.sessions[idx].begin_close();
        // No dangling callbacks after close.
        self.timers.kill(id, None);
        if let Some(backend) = self.sessions[idx].handle.invalidate() {
            let _region = self.guard.enter();
            if let Some(record) = self.registry.record_by_name_mut(&module_name) {
                record.module_mut().close_session(backend);
            }
        }
        self.sessions[idx].finish_close();
        self.sessions.remove(idx);
        self.registry.note_session_closed(&module_name);
        log::debug!("session {} closed", id);
    }
}
