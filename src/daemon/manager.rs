//! Service manager: single authority for the name -> Process registry and
//! for sequencing lifecycle operations against the store.
//!
//! Locking: the registry `RwLock` is held only for map lookup/mutation.
//! Every lifecycle transition locks the per-service cell for its full
//! duration, so operations racing on the same name are serialized while
//! unrelated services stay unaffected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sysinfo::System;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{GpmError, Result};
use crate::paths::Paths;
use crate::platform;
use crate::service::{Service, Status, DEFAULT_VERSION};
use crate::store::ServiceStore;

use super::process::Process;

/// Registry entry: the per-service lock serializing lifecycle transitions.
pub struct ServiceCell {
    pub process: tokio::sync::Mutex<Process>,
}

impl ServiceCell {
    fn new(service: Service) -> Arc<Self> {
        Arc::new(Self {
            process: tokio::sync::Mutex::new(Process::new(service)),
        })
    }
}

pub struct ServiceManager {
    paths: Paths,
    store: Arc<dyn ServiceStore>,
    registry: RwLock<HashMap<String, Arc<ServiceCell>>>,
    system: Mutex<System>,
}

impl ServiceManager {
    pub fn new(paths: Paths, store: Arc<dyn ServiceStore>) -> Self {
        Self {
            paths,
            store,
            registry: RwLock::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    /// Load all persisted services and reconcile with persisted intent:
    /// anything recorded as running is started again, best-effort.
    pub async fn init(&self) -> Result<()> {
        let services = self.store.find_all()?;
        for mut service in services {
            let was_running = service.status.is_running();
            service.clear_runtime();
            if was_running {
                service.status = Status::Init;
            }
            let name = service.name.clone();
            let cell = ServiceCell::new(service);
            self.registry
                .write()
                .await
                .insert(name.clone(), Arc::clone(&cell));

            if was_running {
                let mut process = cell.process.lock().await;
                if let Err(e) = process.start(&self.paths) {
                    warn!("Reconciliation start of '{}' failed: {}", name, e);
                }
                self.store.update(&process.service)?;
            }
        }
        info!(
            "Loaded {} service(s) from store",
            self.registry.read().await.len()
        );
        Ok(())
    }

    pub(crate) async fn cell(&self, name: &str) -> Result<Arc<ServiceCell>> {
        self.registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GpmError::NotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.registry.read().await.contains_key(name)
    }

    /// Registry cells snapshot, for the reaper loop.
    pub async fn cells(&self) -> Vec<(String, Arc<ServiceCell>)> {
        self.registry
            .read()
            .await
            .iter()
            .map(|(name, cell)| (name.clone(), Arc::clone(cell)))
            .collect()
    }

    /// Create and register a new service. Fails with `Conflict` on a
    /// duplicate name; validation errors are rejected before any side effect.
    pub async fn create(&self, mut service: Service) -> Result<Service> {
        service.validate()?;
        if service.version.is_empty() {
            service.version = DEFAULT_VERSION.to_string();
        }
        if let Some(attr) = &mut service.sys_proc_attr {
            platform::resolve_credentials(attr)?;
        }
        service.status = Status::Init;
        service.clear_runtime();
        let now = chrono::Utc::now().timestamp();
        service.creation_ts = now;
        service.update_ts = now;

        let mut registry = self.registry.write().await;
        if registry.contains_key(&service.name) {
            return Err(GpmError::Conflict(format!(
                "service '{}' already exists",
                service.name
            )));
        }
        let created = self.store.create(&service)?;
        registry.insert(created.name.clone(), ServiceCell::new(created.clone()));
        info!("Created service '{}' ({})", created.name, created.version);
        Ok(created)
    }

    /// Merge-patch edit. The patched spec is resolved and validated on a
    /// copy first; nothing stops, mutates or persists until that succeeds,
    /// so a rejected patch leaves registry, store and process untouched.
    /// A running service is stopped and restarted around the commit.
    pub async fn edit(&self, patch: Service) -> Result<Service> {
        if patch.name.is_empty() {
            return Err(GpmError::BadRequest("service name is required".into()));
        }
        let cell = self.cell(&patch.name).await?;
        let mut process = cell.process.lock().await;

        let mut updated = process.service.clone();
        updated.apply_patch(&patch);
        if let Some(attr) = &mut updated.sys_proc_attr {
            platform::resolve_credentials(attr)?;
        }
        updated.update_ts = chrono::Utc::now().timestamp();

        let was_running = process.has_live_handle();
        if was_running {
            process.stop().await?;
            updated.status = Status::Stopped;
            updated.clear_runtime();
        }
        process.service = updated;

        if was_running {
            if let Err(e) = process.start(&self.paths) {
                warn!("Restart after edit of '{}' failed: {}", patch.name, e);
            }
        }
        self.store.update(&process.service)?;
        Ok(process.service.clone())
    }

    /// Start the service. An OS-level spawn failure is surfaced as a
    /// `failed` snapshot with `msg` set, not as a call failure.
    pub async fn start(&self, name: &str) -> Result<Service> {
        let cell = self.cell(name).await?;
        let mut process = cell.process.lock().await;
        if let Err(e) = process.start(&self.paths) {
            warn!("Start of '{}' failed: {}", name, e);
        }
        self.store.update(&process.service)?;
        Ok(process.service.clone())
    }

    /// Stop the service. Fails with a not-found kind when no live process
    /// handle is tracked; `pid` stays 0 either way.
    pub async fn stop(&self, name: &str) -> Result<Service> {
        let cell = self.cell(name).await?;
        let mut process = cell.process.lock().await;
        process.stop().await?;
        self.store.update(&process.service)?;
        Ok(process.service.clone())
    }

    /// Stop followed unconditionally by start. Best-effort, not strict
    /// two-phase: a stop failure does not prevent the start.
    pub async fn restart(&self, name: &str) -> Result<Service> {
        let cell = self.cell(name).await?;
        let mut process = cell.process.lock().await;
        if let Err(e) = process.stop().await {
            warn!("Stop during restart of '{}': {}", name, e);
        }
        if let Err(e) = process.start(&self.paths) {
            warn!("Start during restart of '{}' failed: {}", name, e);
        }
        self.store.update(&process.service)?;
        Ok(process.service.clone())
    }

    /// Delete cascades: registry entry, store record, and, only when
    /// `install_flag` is set, the installed directory tree behind the
    /// versioned symlink.
    pub async fn delete(&self, name: &str) -> Result<Service> {
        let cell = self.cell(name).await?;
        let mut process = cell.process.lock().await;

        if process.has_live_handle() {
            if let Err(e) = process.stop().await {
                warn!("Stop during delete of '{}': {}", name, e);
            }
        }
        let service = process.service.clone();

        self.registry.write().await.remove(name);
        self.store.delete(name)?;

        if service.install_flag {
            self.remove_installed_tree(name);
        }
        info!("Deleted service '{}'", name);
        Ok(service)
    }

    fn remove_installed_tree(&self, name: &str) {
        let link = self.paths.version_link(name);
        match std::fs::read_link(&link) {
            Ok(target) => {
                if let Err(e) = std::fs::remove_dir_all(&target) {
                    warn!("Failed to remove '{}': {}", target.display(), e);
                }
                if let Err(e) = std::fs::remove_file(&link) {
                    warn!("Failed to remove link '{}': {}", link.display(), e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to resolve link '{}': {}", link.display(), e),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Service> {
        let cell = self.cell(name).await?;
        let process = cell.process.lock().await;
        let mut system = self.system.lock().expect("system sampler lock poisoned");
        Ok(process.snapshot(&mut system))
    }

    /// All services with live stats overlaid, sorted by name, plus total.
    pub async fn list(&self) -> Result<(Vec<Service>, u64)> {
        let cells = self.cells().await;
        let mut services = Vec::with_capacity(cells.len());
        for (_, cell) in cells {
            let process = cell.process.lock().await;
            let mut system = self.system.lock().expect("system sampler lock poisoned");
            services.push(process.snapshot(&mut system));
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));
        let total = services.len() as u64;
        Ok((services, total))
    }

    /// Stop every running service at daemon shutdown. With `graceful` each
    /// child gets the SIGTERM window; without it everything is killed
    /// outright.
    pub async fn stop_all(&self, graceful: bool) {
        for (name, cell) in self.cells().await {
            let mut process = cell.process.lock().await;
            if process.has_live_handle() {
                let stopped = if graceful {
                    process.stop().await
                } else {
                    process.kill().await
                };
                if let Err(e) = stopped {
                    warn!("Failed to stop service '{}': {}", name, e);
                }
                if let Err(e) = self.store.update(&process.service) {
                    warn!("Failed to persist '{}' on shutdown: {}", name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use tempfile::TempDir;

    fn manager() -> (TempDir, ServiceManager) {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let store = Arc::new(FileStore::new(paths.clone()));
        (tmp, ServiceManager::new(paths, store))
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("svc-a", "/bin/true"))
            .await
            .unwrap();
        let err = manager
            .create(Service::new("svc-a", "/bin/true"))
            .await
            .unwrap_err();
        assert!(matches!(err, GpmError::Conflict(_)));

        let (list, total) = manager.list().await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(list[0].name, "svc-a");
    }

    #[tokio::test]
    async fn create_defaults_version() {
        let (_tmp, manager) = manager();
        let svc = manager
            .create(Service::new("svc-a", "/bin/true").version(""))
            .await
            .unwrap();
        assert_eq!(svc.version, DEFAULT_VERSION);
        assert_eq!(svc.status, Status::Init);
    }

    #[tokio::test]
    async fn validation_happens_before_any_side_effect() {
        let (_tmp, manager) = manager();
        let err = manager.create(Service::new("svc-a", "")).await.unwrap_err();
        assert!(matches!(err, GpmError::BadRequest(_)));
        assert!(!manager.contains("svc-a").await);
        assert!(manager.store().find_by_name("svc-a").is_err());
    }

    #[tokio::test]
    async fn stop_of_not_running_service_is_not_found_twice() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("svc-a", "/bin/true"))
            .await
            .unwrap();
        for _ in 0..2 {
            let err = manager.stop("svc-a").await.unwrap_err();
            assert!(matches!(err, GpmError::ProcessNotFound(_)));
        }
        assert_eq!(manager.get("svc-a").await.unwrap().pid, 0);
    }

    #[tokio::test]
    async fn lifecycle_ops_on_unknown_service_are_not_found() {
        let (_tmp, manager) = manager();
        assert!(matches!(
            manager.start("ghost").await,
            Err(GpmError::NotFound(_))
        ));
        assert!(matches!(
            manager.delete("ghost").await,
            Err(GpmError::NotFound(_))
        ));
        assert!(matches!(
            manager.get("ghost").await,
            Err(GpmError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_sets_pid_and_stop_clears_it() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("sleeper", "/bin/sleep").args(["30"]))
            .await
            .unwrap();

        let started = manager.start("sleeper").await.unwrap();
        assert_eq!(started.status, Status::Running);
        assert!(started.pid > 0);
        assert_eq!(manager.get("sleeper").await.unwrap().status, Status::Running);

        let stopped = manager.stop("sleeper").await.unwrap();
        assert_eq!(stopped.status, Status::Stopped);
        assert_eq!(stopped.pid, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_failure_is_a_failed_snapshot_not_an_error() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("broken", "/no/such/binary"))
            .await
            .unwrap();
        let snapshot = manager.start("broken").await.unwrap();
        assert_eq!(snapshot.status, Status::Failed);
        assert!(!snapshot.msg.is_empty());
        // The failure is persisted too
        let persisted = manager.store().find_by_name("broken").unwrap();
        assert_eq!(persisted.status, Status::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn edit_stops_applies_patch_and_restarts_if_running() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("sleeper", "/bin/sleep").args(["30"]))
            .await
            .unwrap();
        manager.start("sleeper").await.unwrap();
        let before = manager.get("sleeper").await.unwrap();

        let patch = Service::new("sleeper", "").args(["60"]);
        let edited = manager.edit(patch).await.unwrap();
        assert_eq!(edited.args, vec!["60"]);
        assert_eq!(edited.status, Status::Running);
        assert_ne!(edited.pid, before.pid);

        manager.stop("sleeper").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejected_edit_leaves_memory_store_and_process_untouched() {
        use crate::service::SysProcAttr;

        let (_tmp, manager) = manager();
        manager
            .create(Service::new("sleeper", "/bin/sleep").args(["30"]))
            .await
            .unwrap();
        let before = manager.start("sleeper").await.unwrap();

        let mut patch = Service::new("sleeper", "/bin/false");
        patch.sys_proc_attr = Some(SysProcAttr {
            user: Some("gpmd-no-such-user".into()),
            ..Default::default()
        });
        let err = manager.edit(patch).await.unwrap_err();
        assert!(matches!(err, GpmError::BadRequest(_)));

        // The registry copy, the store record and the running process all
        // still reflect the pre-edit spec
        let current = manager.get("sleeper").await.unwrap();
        assert_eq!(current.bin, "/bin/sleep");
        assert_eq!(current.status, Status::Running);
        assert_eq!(current.pid, before.pid);
        assert_eq!(
            manager.store().find_by_name("sleeper").unwrap().bin,
            "/bin/sleep"
        );

        manager.stop("sleeper").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_graceful_stop_all_kills_running_services() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("sleeper", "/bin/sleep").args(["30"]))
            .await
            .unwrap();
        manager.start("sleeper").await.unwrap();

        manager.stop_all(false).await;

        let svc = manager.get("sleeper").await.unwrap();
        assert_eq!(svc.status, Status::Stopped);
        assert_eq!(svc.pid, 0);
        let persisted = manager.store().find_by_name("sleeper").unwrap();
        assert_eq!(persisted.status, Status::Stopped);
    }

    #[tokio::test]
    async fn edit_does_not_start_a_stopped_service() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("svc-a", "/bin/true"))
            .await
            .unwrap();
        let edited = manager
            .edit(Service::new("svc-a", "/bin/false"))
            .await
            .unwrap();
        assert_eq!(edited.bin, "/bin/false");
        assert_eq!(edited.pid, 0);
        assert_ne!(edited.status, Status::Running);
    }

    #[tokio::test]
    async fn delete_removes_registry_and_store_record() {
        let (_tmp, manager) = manager();
        manager
            .create(Service::new("svc-a", "/bin/true"))
            .await
            .unwrap();
        manager.delete("svc-a").await.unwrap();
        assert!(!manager.contains("svc-a").await);
        assert!(manager.store().find_by_name("svc-a").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_with_install_flag_removes_versioned_tree() {
        let (tmp, manager) = manager();
        let target = tmp.path().join("web_v1");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("app.bin"), b"x").unwrap();
        std::os::unix::fs::symlink(&target, tmp.path().join("web")).unwrap();

        manager
            .create(Service::new("web", "/bin/true").install_flag(true))
            .await
            .unwrap();
        manager.delete("web").await.unwrap();

        assert!(!target.exists());
        assert!(std::fs::symlink_metadata(tmp.path().join("web")).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn init_restarts_services_persisted_as_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let store = Arc::new(FileStore::new(paths.clone()));

        let mut svc = Service::new("sleeper", "/bin/sleep").args(["30"]);
        svc.status = Status::Running;
        svc.pid = 99999; // stale pid from a previous daemon run
        store.create(&svc).unwrap();

        let manager = ServiceManager::new(paths, store);
        manager.init().await.unwrap();

        let loaded = manager.get("sleeper").await.unwrap();
        assert_eq!(loaded.status, Status::Running);
        assert!(loaded.pid > 0);
        assert_ne!(loaded.pid, 99999);
        manager.stop("sleeper").await.unwrap();
    }
}
