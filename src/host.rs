//! Host services handed to backend code.
//!
//! A [`HostBridge`] lives for exactly one bracketed call into a module.
//! Reads (settings) are answered immediately; mutating requests are queued
//! and applied by the router after the backend returns, still inside the
//! triggering host operation. That keeps every mutation of host tables on
//! the host side of the reentrancy guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use perch_plugin_api::{HostServices, MessageLevel};

/// Where module messages for the user end up. The UI supplies the real sink;
/// the default forwards to the log.
pub trait MessageSink {
    fn message(&mut self, level: MessageLevel, text: &str);
}

/// Default sink: route module messages into the host log.
#[derive(Debug, Default)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn message(&mut self, level: MessageLevel, text: &str) {
        match level {
            MessageLevel::Info => log::info!("module: {}", text),
            MessageLevel::Warning => log::warn!("module: {}", text),
            MessageLevel::Error => log::error!("module: {}", text),
        }
    }
}

/// A mutating request a backend made during a call, applied after it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostRequest {
    PostChange { path: String, include_subtree: bool },
    AddTimer { delay_ms: u64, tag: u32 },
    KillTimers { tag: Option<u32> },
}

/// Concrete [`HostServices`] for one call into one module.
pub(crate) struct HostBridge<'a> {
    module: &'a str,
    settings: &'a mut HashMap<String, String>,
    sink: &'a mut dyn MessageSink,
    cache_root: &'a Path,
    pub(crate) requests: Vec<HostRequest>,
}

impl<'a> HostBridge<'a> {
    pub(crate) fn new(
        module: &'a str,
        settings: &'a mut HashMap<String, String>,
        sink: &'a mut dyn MessageSink,
        cache_root: &'a Path,
    ) -> Self {
        Self {
            module,
            settings,
            sink,
            cache_root,
            requests: Vec::new(),
        }
    }
}

impl HostServices for HostBridge<'_> {
    fn post_change(&mut self, path: &str, include_subtree: bool) {
        self.requests.push(HostRequest::PostChange {
            path: path.to_string(),
            include_subtree,
        });
    }

    fn add_timer(&mut self, delay_ms: u64, tag: u32) {
        self.requests.push(HostRequest::AddTimer { delay_ms, tag });
    }

    fn kill_timers(&mut self, tag: Option<u32>) {
        self.requests.push(HostRequest::KillTimers { tag });
    }

    fn setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }

    fn set_setting(&mut self, key: &str, value: &str) {
        self.settings.insert(key.to_string(), value.to_string());
    }

    fn temp_cache_dir(&mut self) -> Option<PathBuf> {
        let dir = self.cache_root.join(self.module);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                log::warn!("temp cache for '{}' unavailable: {}", self.module, e);
                None
            }
        }
    }

    fn message(&mut self, level: MessageLevel, text: &str) {
        self.sink.message(level, text);
    }
}
