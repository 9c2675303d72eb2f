//! Perch — module hosting and virtual-filesystem dispatch.
//!
//! Perch lets a dual-pane file manager treat archives, remote servers and
//! other virtual trees as first-class panel content. Filesystem modules are
//! loaded against a versioned contract (the `perch-plugin-api` crate), each
//! serving one or more namespaces; the [`router::Router`] resolves
//! `namespace:rest` paths to stateful backend sessions, gates every optional
//! operation on a capability set, and keeps sessions alive in a detached set
//! when closing them would discard a connection worth keeping.
//!
//! Everything runs on one logical host thread. Calls into module code are
//! bracketed by a reentrancy guard so teardown never runs while module code
//! is on the stack; timers and change notifications are serviced from the
//! host's own tick.

pub mod config;
pub mod errors;
pub mod guard;
pub mod handle;
pub mod host;
pub mod modules;
pub mod notify;
pub mod panel;
pub mod registry;
pub mod router;
pub mod session;
pub mod timer;

pub use errors::{HostError, HostResult};
pub use host::{LogSink, MessageSink};
pub use panel::PanelId;
pub use registry::{ModuleDescriptor, ModuleRegistry, NamespaceName};
pub use router::{CloseOutcome, Router, VfsPath};
pub use session::{
    ClosePolicy, DefaultClosePolicy, FsSession, SessionId, SessionOwner, SessionState,
};

pub use perch_plugin_api as api;
