//! Open backend sessions and their lifecycle.
//!
//! A session moves Opening → InPanel ⇄ Detached → Closing → Closed. It is
//! owned by exactly one panel or by the detached set, never both; the sum
//! type makes the double-ownership state unrepresentable. Closed is terminal.

use crate::handle::BackendHandle;
use crate::panel::PanelId;
use crate::registry::NamespaceName;
use perch_plugin_api::Services;

/// Creation-order counter value; doubles as the session's identity for the
/// timer queue and distinguishes otherwise-identical sessions.
pub type SessionId = u64;

/// Who owns an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    /// Shown in a panel.
    InPanel(PanelId),
    /// Kept alive without being shown anywhere.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, backend object requested, nothing listed yet.
    Opening,
    /// Live and owned.
    Active(SessionOwner),
    /// Close negotiation succeeded; teardown in progress.
    Closing,
    /// Terminal. No later operation succeeds.
    Closed,
}

/// Decide close-negotiation questions the state machine itself cannot answer.
/// The host UI supplies the real implementation; tests use canned answers.
pub trait ClosePolicy {
    /// May this session move to the detached set instead of closing?
    fn confirm_detach(&mut self, _module: &str, _path: &str) -> bool {
        true
    }
}

/// Detach whenever the backend asks for it.
pub struct DefaultClosePolicy;

impl ClosePolicy for DefaultClosePolicy {}

/// One open instance of a backend namespace.
pub struct FsSession {
    id: SessionId,
    /// Owning module name.
    module: String,
    /// Namespace this session was opened under.
    ns: NamespaceName,
    pub(crate) handle: BackendHandle,
    /// Capability cache; refreshed on creation and after every path change.
    services: Services,
    /// Declared set of the owning module; the cache never exceeds it.
    declared: Services,
    state: SessionState,
    /// Session allocated but the backend handshake not yet performed; the
    /// first path change performs it lazily.
    pending_connect: bool,
    /// Disambiguates duplicates within the detached set.
    detach_index: u32,
    /// Where to resume when the session is re-attached to a panel.
    resume_path: Option<String>,
}

impl FsSession {
    pub(crate) fn new(
        id: SessionId,
        module: String,
        ns: NamespaceName,
        handle: BackendHandle,
        declared: Services,
    ) -> Self {
        Self {
            id,
            module,
            ns,
            handle,
            services: declared,
            declared,
            state: SessionState::Opening,
            pending_connect: true,
            detach_index: 0,
            resume_path: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.ns
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn is_detached(&self) -> bool {
        self.state == SessionState::Active(SessionOwner::Detached)
    }

    pub fn panel(&self) -> Option<PanelId> {
        match self.state {
            SessionState::Active(SessionOwner::InPanel(id)) => Some(id),
            _ => None,
        }
    }

    /// Current capability cache.
    pub fn services(&self) -> Services {
        self.services
    }

    pub fn pending_connect(&self) -> bool {
        self.pending_connect
    }

    pub fn detach_index(&self) -> u32 {
        self.detach_index
    }

    pub fn resume_path(&self) -> Option<&str> {
        self.resume_path.as_deref()
    }

    /// Re-query the backend's current abilities. The cache never exceeds the
    /// module's declared set; state-dependent backends can only narrow it.
    pub(crate) fn refresh_services(&mut self) {
        if let Some(backend) = self.handle.get() {
            let fresh = backend.services() & self.declared;
            if fresh != self.services {
                log::debug!(
                    "session {}: capability cache {:?} -> {:?}",
                    self.id,
                    self.services,
                    fresh
                );
            }
            self.services = fresh;
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        self.pending_connect = false;
    }

    /// Opening or Detached session lands in a panel.
    pub(crate) fn attach_to_panel(&mut self, panel: PanelId) {
        debug_assert!(matches!(
            self.state,
            SessionState::Opening | SessionState::Active(_)
        ));
        self.state = SessionState::Active(SessionOwner::InPanel(panel));
        self.resume_path = None;
    }

    /// Move into the detached set, remembering where to resume.
    pub(crate) fn detach(&mut self, detach_index: u32, resume_path: String) {
        debug_assert!(matches!(self.state, SessionState::Active(_)));
        self.state = SessionState::Active(SessionOwner::Detached);
        self.detach_index = detach_index;
        self.resume_path = Some(resume_path);
    }

    pub(crate) fn begin_close(&mut self) {
        self.state = SessionState::Closing;
    }

    pub(crate) fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::BackendHandle;
    use perch_plugin_api::{
        CloseDecision, CloseReason, FsBackend, HostServices, ModuleResult, CONTRACT_VERSION,
    };

    struct Narrowing {
        now: std::rc::Rc<std::cell::Cell<Services>>,
    }

    impl FsBackend for Narrowing {
        fn change_path(
            &mut self,
            _ns_index: usize,
            _user_part: &str,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn current_path(&self) -> String {
            "/".into()
        }
        fn services(&self) -> Services {
            self.now.get()
        }
        fn is_our_path(&self, _ns_index: usize, _user_part: &str) -> bool {
            true
        }
        fn list_dir(
            &mut self,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<Vec<perch_plugin_api::FileEntry>> {
            Ok(Vec::new())
        }
        fn delete(&mut self, _name: &str, _host: &mut dyn HostServices) -> ModuleResult<()> {
            Ok(())
        }
        fn rename(
            &mut self,
            _from: &str,
            _to: &str,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn create_dir(&mut self, _name: &str, _host: &mut dyn HostServices) -> ModuleResult<()> {
            Ok(())
        }
        fn copy_out(
            &mut self,
            _name: &str,
            _target: &std::path::Path,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn copy_in(
            &mut self,
            _source: &std::path::Path,
            _name: &str,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn change_attributes(
            &mut self,
            _name: &str,
            _change: &perch_plugin_api::AttrChange,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn try_close_or_detach(
            &mut self,
            _force: bool,
            _can_detach: bool,
            _reason: CloseReason,
        ) -> CloseDecision {
            CloseDecision::Close
        }
    }

    fn session(
        backend_services: Services,
        declared: Services,
    ) -> (FsSession, std::rc::Rc<std::cell::Cell<Services>>) {
        let now = std::rc::Rc::new(std::cell::Cell::new(backend_services));
        let session = FsSession::new(
            1,
            "stub".into(),
            NamespaceName {
                text: "stub".into(),
                index: 0,
            },
            BackendHandle::new(Box::new(Narrowing { now: now.clone() }), CONTRACT_VERSION),
            declared,
        );
        (session, now)
    }

    #[test]
    fn test_lifecycle_states() {
        let (mut s, _now) = session(Services::LIST, Services::LIST);
        assert_eq!(s.state(), SessionState::Opening);
        assert!(s.pending_connect());

        s.attach_to_panel(0);
        assert_eq!(s.panel(), Some(0));
        assert!(!s.is_detached());

        s.detach(0, "server/a".into());
        assert!(s.is_detached());
        assert_eq!(s.panel(), None);
        assert_eq!(s.resume_path(), Some("server/a"));

        s.attach_to_panel(1);
        assert_eq!(s.panel(), Some(1));
        assert_eq!(s.resume_path(), None);

        s.begin_close();
        s.finish_close();
        assert!(s.is_closed());
    }

    #[test]
    fn test_capability_cache_never_exceeds_declared() {
        let (mut s, _now) = session(
            Services::LIST | Services::DELETE | Services::COMMAND_LINE,
            Services::LIST | Services::DELETE,
        );
        s.refresh_services();
        assert_eq!(s.services(), Services::LIST | Services::DELETE);
    }

    #[test]
    fn test_capability_cache_shrinks_with_backend_state() {
        let declared = Services::LIST | Services::DELETE;
        let (mut s, now) = session(declared, declared);
        s.refresh_services();
        assert_eq!(s.services(), declared);

        // Connection degraded; the backend now reports listing only.
        now.set(Services::LIST);
        s.refresh_services();
        assert_eq!(s.services(), Services::LIST);
    }
}
