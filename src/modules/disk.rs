//! Local filesystem module
//!
//! The built-in `disk:` namespace. It goes through the same registry,
//! capability gating and session lifecycle as any external module, which
//! keeps the dispatch paths honest and gives tests a real backend without
//! a network.

use std::fs;
use std::path::{Path, PathBuf};

use perch_plugin_api::{
    AttrChange, CloseDecision, CloseReason, FileEntry, FsBackend, HostServices, Module,
    ModuleError, ModuleInfo, ModuleResult, Services,
};

const DISK_SERVICES: Services = Services::LIST
    .union(Services::DELETE)
    .union(Services::QUICK_RENAME)
    .union(Services::CREATE_DIR)
    .union(Services::COPY_OUT)
    .union(Services::COPY_IN)
    .union(Services::CHANGE_ATTRS)
    .union(Services::FREE_SPACE);

/// Module serving the local filesystem under the `disk` namespace.
#[derive(Debug)]
pub struct DiskModule {
    info: ModuleInfo,
}

impl Default for DiskModule {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskModule {
    pub fn new() -> Self {
        Self {
            info: ModuleInfo::new("Local Disk", env!("CARGO_PKG_VERSION"))
                .with_description("Local filesystem")
                .with_icon('💾'),
        }
    }
}

impl Module for DiskModule {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    fn namespaces(&self) -> Vec<String> {
        vec!["disk".to_string()]
    }

    fn services(&self) -> Services {
        DISK_SERVICES
    }

    fn open_session(&mut self, _ns_index: usize) -> Option<Box<dyn FsBackend>> {
        Some(Box::new(DiskBackend {
            cwd: PathBuf::from("/"),
        }))
    }

    fn close_session(&mut self, _backend: Box<dyn FsBackend>) {}
}

/// One open view into the local tree.
#[derive(Debug)]
pub struct DiskBackend {
    cwd: PathBuf,
}

fn map_io(e: std::io::Error, path: &Path) -> ModuleError {
    let what = format!("{}: {}", path.display(), e);
    match e.kind() {
        std::io::ErrorKind::NotFound => ModuleError::NotFound(what),
        std::io::ErrorKind::PermissionDenied => ModuleError::PermissionDenied(what),
        _ => ModuleError::Other(what),
    }
}

impl FsBackend for DiskBackend {
    fn change_path(
        &mut self,
        _ns_index: usize,
        user_part: &str,
        _host: &mut dyn HostServices,
    ) -> ModuleResult<()> {
        let target = if user_part.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(user_part)
        };
        let meta = fs::metadata(&target).map_err(|e| map_io(e, &target))?;
        if !meta.is_dir() {
            return Err(ModuleError::NotFound(format!(
                "{}: not a directory",
                target.display()
            )));
        }
        self.cwd = target;
        Ok(())
    }

    fn current_path(&self) -> String {
        self.cwd.to_string_lossy().into_owned()
    }

    fn services(&self) -> Services {
        DISK_SERVICES
    }

    fn is_our_path(&self, _ns_index: usize, _user_part: &str) -> bool {
        // One local tree; every disk path is reachable from any session.
        true
    }

    fn list_dir(&mut self, _host: &mut dyn HostServices) -> ModuleResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let iter = fs::read_dir(&self.cwd).map_err(|e| map_io(e, &self.cwd))?;
        for entry in iter {
            let entry = entry.map_err(|e| map_io(e, &self.cwd))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path().to_string_lossy().into_owned();
            // An entry whose metadata vanished mid-listing is skipped, not
            // fatal.
            let Ok(meta) = entry.metadata() else { continue };
            let mut item = if meta.is_dir() {
                FileEntry::directory(name.clone(), path)
            } else {
                FileEntry::file(name.clone(), path, meta.len())
            };
            item = item
                .with_modified(meta.modified().ok())
                .with_hidden(name.starts_with('.'));
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                item = item.with_permissions(meta.permissions().mode());
            }
            entries.push(item);
        }
        Ok(entries)
    }

    fn delete(&mut self, name: &str, _host: &mut dyn HostServices) -> ModuleResult<()> {
        let target = self.cwd.join(name);
        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        result.map_err(|e| map_io(e, &target))
    }

    fn rename(&mut self, from: &str, to: &str, _host: &mut dyn HostServices) -> ModuleResult<()> {
        let source = self.cwd.join(from);
        fs::rename(&source, self.cwd.join(to)).map_err(|e| map_io(e, &source))
    }

    fn create_dir(&mut self, name: &str, _host: &mut dyn HostServices) -> ModuleResult<()> {
        let target = self.cwd.join(name);
        fs::create_dir(&target).map_err(|e| map_io(e, &target))
    }

    fn copy_out(
        &mut self,
        name: &str,
        target: &Path,
        _host: &mut dyn HostServices,
    ) -> ModuleResult<()> {
        let source = self.cwd.join(name);
        copy_preserving_mtime(&source, target)
    }

    fn copy_in(
        &mut self,
        source: &Path,
        name: &str,
        _host: &mut dyn HostServices,
    ) -> ModuleResult<()> {
        copy_preserving_mtime(source, &self.cwd.join(name))
    }

    fn change_attributes(
        &mut self,
        name: &str,
        change: &AttrChange,
        _host: &mut dyn HostServices,
    ) -> ModuleResult<()> {
        let target = self.cwd.join(name);
        if let Some(mtime) = change.modified {
            let file = fs::File::options()
                .write(true)
                .open(&target)
                .map_err(|e| map_io(e, &target))?;
            file.set_modified(mtime).map_err(|e| map_io(e, &target))?;
        }
        #[cfg(unix)]
        if let Some(mode) = change.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .map_err(|e| map_io(e, &target))?;
        }
        Ok(())
    }

    fn free_space(&self) -> Option<u64> {
        free_space_at(&self.cwd)
    }

    fn try_close_or_detach(
        &mut self,
        _force: bool,
        _can_detach: bool,
        _reason: CloseReason,
    ) -> CloseDecision {
        // Nothing worth keeping alive; there is no connection to lose.
        CloseDecision::Close
    }
}

fn copy_preserving_mtime(from: &Path, to: &Path) -> ModuleResult<()> {
    fs::copy(from, to).map_err(|e| map_io(e, from))?;
    // Permissions are already carried over by fs::copy on Unix.
    if let Ok(meta) = fs::metadata(from) {
        if let Ok(mtime) = meta.modified() {
            if let Ok(file) = fs::File::options().write(true).open(to) {
                let _ = file.set_modified(mtime);
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn free_space_at(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = CString::new(path.as_os_str().as_bytes()).ok()?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(path_cstr.as_ptr(), &mut stat) == 0 {
            Some(stat.f_bavail as u64 * stat.f_frsize as u64)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn free_space_at(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_plugin_api::MessageLevel;

    struct NullHost;

    impl HostServices for NullHost {
        fn post_change(&mut self, _path: &str, _include_subtree: bool) {}
        fn add_timer(&mut self, _delay_ms: u64, _tag: u32) {}
        fn kill_timers(&mut self, _tag: Option<u32>) {}
        fn setting(&self, _key: &str) -> Option<String> {
            None
        }
        fn set_setting(&mut self, _key: &str, _value: &str) {}
        fn temp_cache_dir(&mut self) -> Option<PathBuf> {
            None
        }
        fn message(&mut self, _level: MessageLevel, _text: &str) {}
    }

    fn backend_at(dir: &Path) -> DiskBackend {
        let mut backend = DiskBackend {
            cwd: PathBuf::from("/"),
        };
        backend
            .change_path(0, dir.to_str().unwrap(), &mut NullHost)
            .unwrap();
        backend
    }

    #[test]
    fn test_list_and_mutate() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"abc").unwrap();
        fs::write(tmp.path().join(".hidden"), b"").unwrap();

        let mut backend = backend_at(tmp.path());
        let mut entries = backend.list_dir(&mut NullHost).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_hidden);
        assert_eq!(entries[1].size, 3);

        backend.create_dir("sub", &mut NullHost).unwrap();
        backend.rename("a.txt", "b.txt", &mut NullHost).unwrap();
        assert!(tmp.path().join("b.txt").exists());

        backend.delete("sub", &mut NullHost).unwrap();
        backend.delete(".hidden", &mut NullHost).unwrap();
        assert_eq!(backend.list_dir(&mut NullHost).unwrap().len(), 1);
    }

    #[test]
    fn test_change_path_to_missing_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = backend_at(tmp.path());
        let gone = tmp.path().join("gone");
        let err = backend
            .change_path(0, gone.to_str().unwrap(), &mut NullHost)
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotFound(_)));
        // Still at the old location.
        assert_eq!(backend.current_path(), tmp.path().to_string_lossy());
    }

    #[test]
    fn test_copy_round_trip_preserves_mtime() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("data.bin");
        fs::write(&src, b"payload").unwrap();
        let mtime = fs::metadata(&src).unwrap().modified().unwrap();

        let mut backend = backend_at(dst_dir.path());
        backend.copy_in(&src, "data.bin", &mut NullHost).unwrap();
        let copied = dst_dir.path().join("data.bin");
        assert_eq!(fs::read(&copied).unwrap(), b"payload");
        assert_eq!(fs::metadata(&copied).unwrap().modified().unwrap(), mtime);

        let out = src_dir.path().join("back.bin");
        backend.copy_out("data.bin", &out, &mut NullHost).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"payload");
    }

    #[cfg(unix)]
    #[test]
    fn test_change_attributes_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), b"x").unwrap();
        let mut backend = backend_at(tmp.path());
        backend
            .change_attributes(
                "f",
                &AttrChange {
                    modified: None,
                    permissions: Some(0o600),
                },
                &mut NullHost,
            )
            .unwrap();
        let mode = fs::metadata(tmp.path().join("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_free_space_reported_on_unix() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend_at(tmp.path());
        if cfg!(unix) {
            assert!(backend.free_space().is_some());
        }
    }

    #[test]
    fn test_module_descriptor_shape() {
        let mut module = DiskModule::new();
        assert_eq!(module.namespaces(), vec!["disk"]);
        assert!(module.services().contains(Services::LIST | Services::FREE_SPACE));
        let backend = module.open_session(0).unwrap();
        assert!(backend.is_our_path(0, "/anything"));
        module.close_session(backend);
    }
}
