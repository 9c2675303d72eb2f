//! Perch Module API
//!
//! This crate defines the binary contract between the Perch host and its
//! filesystem modules. A module serves one or more **namespaces** (virtual
//! roots such as a disk, an archive, or a remote server) and hands the host
//! stateful **backend sessions** opened under those namespaces.
//!
//! The contract is versioned: a module reports the [`CONTRACT_VERSION`] it was
//! built against in its descriptor, and the host refuses anything older than
//! its own minimum instead of guessing compatibility.
//!
//! All buffers passed into backend calls are host-owned borrows; a module must
//! not retain them past the call.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bitflags::bitflags;

/// Contract version this crate describes. Bump on any breaking change to the
/// traits or data types below.
pub const CONTRACT_VERSION: u32 = 4;

// ============================================================================
// SERVICES (capability set)
// ============================================================================

bitflags! {
    /// Set of optional operations a module or an open session supports.
    ///
    /// The host consults this set before every optional call and substitutes a
    /// "not supported" outcome instead of invoking an operation the backend
    /// never implemented. A session's set is re-queried after every path
    /// change, so it can shrink when abilities are state-dependent (e.g. a
    /// protocol that loses write access after re-authentication).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Services: u32 {
        /// Directory listing.
        const LIST          = 0x0000_0001;
        /// Delete files and directories.
        const DELETE        = 0x0000_0002;
        /// In-place rename.
        const QUICK_RENAME  = 0x0000_0004;
        /// Create a directory.
        const CREATE_DIR    = 0x0000_0008;
        /// Copy from the namespace out to local disk.
        const COPY_OUT      = 0x0000_0010;
        /// Copy from local disk into the namespace.
        const COPY_IN       = 0x0000_0020;
        /// Change attributes (mtime, permissions).
        const CHANGE_ATTRS  = 0x0000_0040;
        /// Session info dialog content.
        const SHOW_INFO     = 0x0000_0080;
        /// Per-entry context menu items.
        const CONTEXT_MENU  = 0x0000_0100;
        /// Command-line execution inside the namespace.
        const COMMAND_LINE  = 0x0000_0200;
        /// Drag-and-drop effect negotiation.
        const DROP_EFFECT   = 0x0000_0400;
        /// Free-space reporting.
        const FREE_SPACE    = 0x0000_0800;
    }
}

// ============================================================================
// MODULE METADATA
// ============================================================================

/// Identity of a module, reported once by the loaded instance.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Module name (e.g. "Remote Transfer").
    pub name: String,
    /// Module's own version string, independent of the contract version.
    pub version: String,
    /// Short description.
    pub description: String,
    /// Icon character for menus and panel headers.
    pub icon: Option<char>,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            icon: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_icon(mut self, icon: char) -> Self {
        self.icon = Some(icon);
        self
    }
}

/// A menu contribution declared by a module.
///
/// `id` is module-scoped; the host assigns every loaded item a separate
/// duplicate-free runtime id before it reaches any menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub id: u32,
    pub title: String,
}

impl MenuItem {
    pub fn new(id: u32, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
        }
    }
}

// ============================================================================
// FILE ENTRY
// ============================================================================

/// A single file or directory entry returned by a backend listing.
///
/// `path` is the entry's user part within the namespace, not a local path.
#[derive(Clone, Debug)]
pub struct FileEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Namespace-relative path of the entry.
    pub path: String,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, when the backend knows it.
    pub modified: Option<SystemTime>,
    /// Whether this is a hidden entry.
    pub is_hidden: bool,
    /// Unix permission bits (0 if not available).
    pub permissions: u32,
}

impl FileEntry {
    pub fn new(name: String, path: String, is_dir: bool, size: u64) -> Self {
        Self {
            name,
            path,
            is_dir,
            size,
            modified: None,
            is_hidden: false,
            permissions: 0,
        }
    }

    /// Create a directory entry.
    pub fn directory(name: String, path: String) -> Self {
        Self::new(name, path, true, 0)
    }

    /// Create a file entry.
    pub fn file(name: String, path: String, size: u64) -> Self {
        Self::new(name, path, false, size)
    }

    pub fn with_modified(mut self, time: Option<SystemTime>) -> Self {
        self.modified = time;
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.is_hidden = hidden;
        self
    }

    pub fn with_permissions(mut self, perms: u32) -> Self {
        self.permissions = perms;
        self
    }
}

/// Requested attribute change for [`FsBackend::change_attributes`].
/// `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChange {
    pub modified: Option<SystemTime>,
    pub permissions: Option<u32>,
}

/// Drag-and-drop effect a backend negotiates for a source/target pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropEffect {
    None,
    Copy,
    Move,
}

// ============================================================================
// CLOSE / DETACH NEGOTIATION
// ============================================================================

/// Why the host is asking a session to close or detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The panel is navigating somewhere outside this session.
    Navigation,
    /// The owning module is being unloaded.
    ModuleUnload,
    /// The host process is shutting down.
    Shutdown,
}

/// A session's answer to a close-or-detach request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Close now; the host will tear the session down.
    Close,
    /// Keep the session alive in the detached set; the host stores the
    /// current path as the resume path.
    Detach,
    /// Neither. The host may still force-close at process shutdown.
    Refuse,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors reported by modules and their backend sessions.
#[derive(Debug, Clone)]
pub enum ModuleError {
    /// Connection failed or dropped.
    Connection(String),
    /// Authentication failed.
    Auth(String),
    /// Path or entry not found.
    NotFound(String),
    /// Permission denied.
    PermissionDenied(String),
    /// The backend does not implement this operation in its current state.
    NotSupported(String),
    /// Generic error.
    Other(String),
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::Connection(s) => write!(f, "Connection error: {}", s),
            ModuleError::Auth(s) => write!(f, "Authentication error: {}", s),
            ModuleError::NotFound(s) => write!(f, "Not found: {}", s),
            ModuleError::PermissionDenied(s) => write!(f, "Permission denied: {}", s),
            ModuleError::NotSupported(s) => write!(f, "Not supported: {}", s),
            ModuleError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ModuleError {}

// ============================================================================
// HOST SERVICES
// ============================================================================

/// Severity of a message a module sends toward the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Key-value settings scoped to one module, persisted by the host.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

/// Services the host exposes to backend code for the duration of one call.
///
/// Mutating requests (notifications, timers, setting writes) may be applied by
/// the host after the call returns, but always before the triggering host
/// operation completes. A backend must not retain this reference.
pub trait HostServices {
    /// Announce that `path` (plus its subtree when `include_subtree`) changed.
    fn post_change(&mut self, path: &str, include_subtree: bool);

    /// Ask the host to call [`FsBackend::timer_fired`] with `tag` after
    /// `delay_ms` milliseconds.
    fn add_timer(&mut self, delay_ms: u64, tag: u32);

    /// Cancel this session's timers; all of them when `tag` is `None`,
    /// otherwise only those with a matching tag.
    fn kill_timers(&mut self, tag: Option<u32>);

    /// Read a value from the module's persisted settings.
    fn setting(&self, key: &str) -> Option<String>;

    /// Write a value into the module's persisted settings.
    fn set_setting(&mut self, key: &str, value: &str);

    /// A per-module scratch directory for temporary files. `None` when the
    /// host cannot provide one.
    fn temp_cache_dir(&mut self) -> Option<PathBuf>;

    /// Send a message toward the user through the host's message sink.
    fn message(&mut self, level: MessageLevel, text: &str);
}

// ============================================================================
// MODULE TRAITS
// ============================================================================

/// A loaded module: factory for backend sessions plus module-wide hooks.
pub trait Module {
    /// Module identity.
    fn info(&self) -> &ModuleInfo;

    /// Ordered namespace names this module serves. Queried once at load; the
    /// result must not change for the remainder of the load cycle.
    fn namespaces(&self) -> Vec<String>;

    /// Operations the module implements. Queried once at load.
    fn services(&self) -> Services;

    /// Menu contributions, in display order.
    fn menu_items(&self) -> Vec<MenuItem> {
        Vec::new()
    }

    /// Instantiate a backend session for the namespace at `ns_index`.
    /// `None` means the session could not be created; the host treats that as
    /// an ordinary navigation failure.
    fn open_session(&mut self, ns_index: usize) -> Option<Box<dyn FsBackend>>;

    /// Tear down a backend session. Called exactly once per session the host
    /// closes, including force-close at shutdown.
    fn close_session(&mut self, backend: Box<dyn FsBackend>);

    /// A path changed somewhere in the host. Delivery is at-least-once, so
    /// cache invalidation here must be idempotent.
    fn path_changed(&mut self, _path: &str, _include_subtree: bool) {}

    /// Restore module settings. Called after load.
    fn load_settings(&mut self, _store: &dyn SettingsStore) {}

    /// Persist module settings. Called before unload when the host offers it.
    fn save_settings(&mut self, _store: &mut dyn SettingsStore) {}

    /// A module may ask to be unloaded; the host honors this once no call into
    /// the module is in flight and no session remains open.
    fn wants_unload(&self) -> bool {
        false
    }
}

/// One open, stateful instance of a namespace.
pub trait FsBackend {
    /// Navigate to `user_part` under the namespace at `ns_index`. The first
    /// call performs any deferred connection handshake.
    fn change_path(
        &mut self,
        ns_index: usize,
        user_part: &str,
        host: &mut dyn HostServices,
    ) -> ModuleResult<()>;

    /// Current location as a namespace user part.
    fn current_path(&self) -> String;

    /// Operations currently available. Re-queried by the host after every
    /// path change; may only be narrower than the module's declared set.
    fn services(&self) -> Services;

    /// Equivalence test: does `user_part` under `ns_index` address the same
    /// open backend as this session? Compared over a normalized connection
    /// descriptor (e.g. the server part of `name://server/dir`), not string
    /// equality of the whole path.
    fn is_our_path(&self, ns_index: usize, user_part: &str) -> bool;

    /// List the current location.
    fn list_dir(&mut self, host: &mut dyn HostServices) -> ModuleResult<Vec<FileEntry>>;

    /// Delete an entry at the current location.
    fn delete(&mut self, name: &str, host: &mut dyn HostServices) -> ModuleResult<()>;

    /// Rename an entry at the current location.
    fn rename(&mut self, from: &str, to: &str, host: &mut dyn HostServices) -> ModuleResult<()>;

    /// Create a directory at the current location.
    fn create_dir(&mut self, name: &str, host: &mut dyn HostServices) -> ModuleResult<()>;

    /// Copy an entry out of the namespace to a local target.
    fn copy_out(
        &mut self,
        name: &str,
        target: &Path,
        host: &mut dyn HostServices,
    ) -> ModuleResult<()>;

    /// Copy a local file into the namespace under `name`.
    fn copy_in(
        &mut self,
        source: &Path,
        name: &str,
        host: &mut dyn HostServices,
    ) -> ModuleResult<()>;

    /// Apply an attribute change to an entry.
    fn change_attributes(
        &mut self,
        name: &str,
        change: &AttrChange,
        host: &mut dyn HostServices,
    ) -> ModuleResult<()>;

    /// Produce session info for the user (connection details, statistics).
    fn show_info(&mut self, _host: &mut dyn HostServices) -> ModuleResult<()> {
        Ok(())
    }

    /// Context menu items for an entry.
    fn context_menu(&mut self, _name: &str) -> ModuleResult<Vec<MenuItem>> {
        Ok(Vec::new())
    }

    /// Run a command line inside the namespace.
    fn execute_command_line(
        &mut self,
        line: &str,
        _host: &mut dyn HostServices,
    ) -> ModuleResult<()> {
        Err(ModuleError::NotSupported(line.to_string()))
    }

    /// Negotiate a drag-and-drop effect for a source/target pair.
    fn drop_effect(&self, _source: &str, _target: &str) -> DropEffect {
        DropEffect::Copy
    }

    /// Free space at the current location, if known.
    fn free_space(&self) -> Option<u64> {
        None
    }

    /// The host asks: close, or would you rather detach?
    ///
    /// With `force` set the answer is advisory; the host closes regardless.
    fn try_close_or_detach(
        &mut self,
        force: bool,
        can_detach: bool,
        reason: CloseReason,
    ) -> CloseDecision;

    /// A timer armed through [`HostServices::add_timer`] expired.
    fn timer_fired(&mut self, _tag: u32, _host: &mut dyn HostServices) {}

    /// A path changed somewhere in the host. Idempotent, like
    /// [`Module::path_changed`].
    fn path_changed(&mut self, _path: &str, _include_subtree: bool) {}
}
