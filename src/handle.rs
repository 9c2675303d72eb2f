//! Owned backend handle tagged with the contract version it was built against.
//!
//! An invalidated handle becomes a distinct empty variant; nothing in the host
//! can reach a torn-down backend through it. A debug-only open-handle counter
//! catches sessions that were dropped without a proper close.

use perch_plugin_api::FsBackend;

// Single host thread by design, so the counter is per-thread; that also
// keeps it deterministic when tests run in parallel.
#[cfg(debug_assertions)]
thread_local! {
    static OPEN_HANDLES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Number of live backend handles on this thread. Debug builds only; tests
/// assert it returns to its baseline to catch leaked sessions.
#[cfg(debug_assertions)]
pub fn open_handle_count() -> usize {
    OPEN_HANDLES.with(|c| c.get())
}

/// A backend interface owned by exactly one session.
pub struct BackendHandle {
    inner: Option<Box<dyn FsBackend>>,
    contract_version: u32,
}

impl BackendHandle {
    pub fn new(backend: Box<dyn FsBackend>, contract_version: u32) -> Self {
        #[cfg(debug_assertions)]
        OPEN_HANDLES.with(|c| c.set(c.get() + 1));
        Self {
            inner: Some(backend),
            contract_version,
        }
    }

    /// Contract version the owning module was loaded under.
    pub fn contract_version(&self) -> u32 {
        self.contract_version
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&dyn FsBackend> {
        self.inner.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut (dyn FsBackend + 'static)> {
        self.inner.as_deref_mut()
    }

    /// Take the backend out for teardown. The handle stays behind as the
    /// empty variant; any later access sees `None` rather than a dangling
    /// reference.
    pub fn invalidate(&mut self) -> Option<Box<dyn FsBackend>> {
        let taken = self.inner.take();
        #[cfg(debug_assertions)]
        if taken.is_some() {
            OPEN_HANDLES.with(|c| c.set(c.get() - 1));
        }
        taken
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        if self.inner.is_some() {
            OPEN_HANDLES.with(|c| c.set(c.get() - 1));
            log::warn!("backend handle dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_plugin_api::{CloseDecision, CloseReason, HostServices, ModuleResult, Services};

    struct NullBackend;

    impl FsBackend for NullBackend {
        fn change_path(
            &mut self,
            _ns_index: usize,
            _user_part: &str,
            _host: &mut dyn HostServices,
        ) -> ModuleResult<()> {
            Ok(())
        }
        fn current_path(&self) -> String {
            String::new()
        }
        fn services(&self) -> Services {
            Services::empty()
        }
        fn is_our_path(&self, _ns_index: usize, _user_part: &str) -> bool {
            false
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

    #[test]
    fn test_invalidate_leaves_empty_variant() {
        let mut handle = BackendHandle::new(Box::new(NullBackend), 4);
        assert!(handle.is_valid());
        assert_eq!(handle.contract_version(), 4);

        let backend = handle.invalidate();
        assert!(backend.is_some());
        assert!(!handle.is_valid());
        assert!(handle.get().is_none());
        assert!(handle.get_mut().is_none());

        // Second invalidate is a no-op, not a double free.
        assert!(handle.invalidate().is_none());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_open_handle_count_tracks_lifecycle() {
        let baseline = open_handle_count();

        let mut handle = BackendHandle::new(Box::new(NullBackend), 4);
        assert_eq!(open_handle_count(), baseline + 1);

        // Invalidate decrements once; repeating it must not go below baseline.
        handle.invalidate();
        assert_eq!(open_handle_count(), baseline);
        handle.invalidate();
        assert_eq!(open_handle_count(), baseline);
        drop(handle);
        assert_eq!(open_handle_count(), baseline);

        // Dropping a still-valid handle also releases its count.
        let leaked = BackendHandle::new(Box::new(NullBackend), 4);
        assert_eq!(open_handle_count(), baseline + 1);
        drop(leaked);
        assert_eq!(open_handle_count(), baseline);
    }
}
