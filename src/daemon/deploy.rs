//! Versioned deployment engine: turns a received package into a new,
//! independently-rollbackable on-disk version of a service, and manages
//! switching between versions.
//!
//! A service's logical working directory is never a real directory: each
//! version materializes as a `<name>_<version>` sibling and `<name>` is a
//! symlink to the active one. Activation is a symlink repoint, so rollback
//! moves no data and the previous version's files stay on disk. The archive
//! is always extracted fully into the sibling before the link is repointed,
//! keeping the live link valid if extraction dies partway.

use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{info, warn};

use crate::error::{GpmError, Result};
use crate::service::{Service, ServiceVersion, Status};

use super::manager::ServiceManager;
use super::transfer::PackageSink;

pub struct DeployEngine {
    manager: Arc<ServiceManager>,
}

impl DeployEngine {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    /// Validate an install spec and open the package sink. Rejected before
    /// any file is created when the spec is malformed or the name is taken.
    pub async fn begin_install(&self, service: &Service) -> Result<PackageSink> {
        service.validate()?;
        if self.manager.contains(&service.name).await {
            return Err(GpmError::Conflict(format!(
                "service '{}' already exists",
                service.name
            )));
        }
        let version = if service.version.is_empty() {
            crate::service::DEFAULT_VERSION
        } else {
            &service.version
        };
        let package = self.manager.paths().package_file(&service.name, version);
        PackageSink::create(package).await
    }

    /// Finalize an install after full package receipt: extract into the
    /// versioned sibling, repoint the symlink, then create the service
    /// record. No record exists unless everything succeeded; a partial
    /// package file may remain on failure.
    pub async fn finish_install(&self, mut service: Service, package: &Path) -> Result<Service> {
        if service.version.is_empty() {
            service.version = crate::service::DEFAULT_VERSION.to_string();
        }
        let paths = self.manager.paths();
        let target = paths.version_dir(&service.name, &service.version);
        extract_tar_gz(package, &target)?;

        let link = paths.version_link(&service.name);
        swap_symlink(&link, &target)?;

        service.dir = link.to_string_lossy().to_string();
        service.install_flag = true;
        let created = self.manager.create(service).await?;
        info!(
            "Installed service '{}' version {}",
            created.name, created.version
        );
        Ok(created)
    }

    /// Validate upgrade preconditions and open the package sink.
    pub async fn begin_upgrade(&self, name: &str, version: &str) -> Result<PackageSink> {
        if version.is_empty() {
            return Err(GpmError::BadRequest("upgrade version is required".into()));
        }
        let current = self.manager.get(name).await?;
        if current.version == version {
            return Err(GpmError::Conflict(format!(
                "service '{name}' is already at version {version}"
            )));
        }
        let package = self.manager.paths().package_file(name, version);
        PackageSink::create(package).await
    }

    /// Finalize an upgrade: stop if running, extract into the new sibling,
    /// repoint, append the version marker, persist, restart if it had been
    /// running. Holds the per-service lock for the whole sequence.
    pub async fn finish_upgrade(
        &self,
        name: &str,
        version: &str,
        package: &Path,
    ) -> Result<Service> {
        let cell = self.manager.cell(name).await?;
        let mut process = cell.process.lock().await;

        // Captured before the swap so the correct target is restarted.
        let was_running = process.has_live_handle();
        if was_running {
            process.stop().await?;
        }
        process.service.status = Status::Upgrading;
        self.manager.store().update(&process.service)?;

        let paths = self.manager.paths();
        let target = paths.version_dir(name, version);
        let link = paths.version_link(name);
        let switched =
            extract_tar_gz(package, &target).and_then(|()| swap_symlink(&link, &target));
        if let Err(e) = switched {
            process.service.status = Status::Failed;
            process.service.msg = format!("upgrade to {version} failed: {e}");
            self.manager.store().update(&process.service)?;
            return Err(e);
        }

        self.manager.store().append_version(&ServiceVersion {
            name: name.to_string(),
            version: version.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        })?;

        process.service.version = version.to_string();
        process.service.dir = link.to_string_lossy().to_string();
        process.service.status = Status::Stopped;
        process.service.msg.clear();
        process.service.update_ts = chrono::Utc::now().timestamp();

        if was_running {
            if let Err(e) = process.start(paths) {
                warn!("Restart after upgrade of '{}' failed: {}", name, e);
            }
        }
        self.manager.store().update(&process.service)?;
        info!("Upgraded service '{}' to {}", name, version);
        Ok(process.service.clone())
    }

    /// Repoint the symlink at an already-existing sibling from a prior
    /// install/upgrade. No extraction happens; the target directory must
    /// exist and the version must be in the recorded history.
    pub async fn rollback(&self, name: &str, version: &str) -> Result<Service> {
        let history = self.manager.store().list_versions(name)?;
        if !history.iter().any(|v| v.version == version) {
            return Err(GpmError::NotFound(format!(
                "version '{version}' of service '{name}' was never installed"
            )));
        }
        let paths = self.manager.paths().clone();
        let target = paths.version_dir(name, version);
        if !target.is_dir() {
            return Err(GpmError::NotFound(format!(
                "version directory '{}' is gone",
                target.display()
            )));
        }

        let cell = self.manager.cell(name).await?;
        let mut process = cell.process.lock().await;

        let was_running = process.has_live_handle();
        if was_running {
            process.stop().await?;
        }

        swap_symlink(&paths.version_link(name), &target)?;

        process.service.version = version.to_string();
        process.service.update_ts = chrono::Utc::now().timestamp();

        if was_running {
            if let Err(e) = process.start(&paths) {
                warn!("Restart after rollback of '{}' failed: {}", name, e);
            }
        }
        self.manager.store().update(&process.service)?;
        info!("Rolled back service '{}' to {}", name, version);
        Ok(process.service.clone())
    }

    /// Prune a version's on-disk sibling and history entry. The active
    /// version cannot be forgotten.
    pub async fn forget(&self, name: &str, version: &str) -> Result<()> {
        let current = self.manager.get(name).await?;
        if current.version == version {
            return Err(GpmError::Conflict(format!(
                "version {version} is the active version of '{name}'"
            )));
        }
        let target = self.manager.paths().version_dir(name, version);
        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        }
        self.manager.store().remove_version(name, version)?;
        info!("Forgot version {} of service '{}'", version, name);
        Ok(())
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<ServiceVersion>> {
        self.manager.store().list_versions(name)
    }
}

/// Decompress a gzip'd tar archive entry-by-entry into `dest`, creating
/// intermediate path segments on demand.
pub fn extract_tar_gz(package: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(package)?;
    let tar = GzDecoder::new(file);
    let mut archive = Archive::new(tar);

    std::fs::create_dir_all(dest)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        // unpack_in refuses entries that would land outside dest
        if !entry.unpack_in(dest)? {
            let rel = entry.path()?.into_owned();
            return Err(GpmError::BadRequest(format!(
                "package entry '{}' escapes the target directory",
                rel.display()
            )));
        }
    }
    Ok(())
}

/// Atomically-ish replace `link` to point at `target`.
fn swap_symlink(link: &Path, target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(_) => std::fs::remove_file(link)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::Chunk;
    use crate::paths::Paths;
    use crate::store::FileStore;
    use tempfile::TempDir;

    fn engine() -> (TempDir, DeployEngine, Arc<ServiceManager>) {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let store = Arc::new(FileStore::new(paths.clone()));
        let manager = Arc::new(ServiceManager::new(paths, store));
        (tmp, DeployEngine::new(Arc::clone(&manager)), manager)
    }

    fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            // set_path refuses `..`, which the escape test needs in its archive
            header.as_gnu_mut().unwrap().name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    async fn stream_package(mut sink: PackageSink, bytes: &[u8]) -> std::path::PathBuf {
        for part in bytes.chunks(1024) {
            sink.push(&Chunk::data(part.to_vec())).await.unwrap();
        }
        sink.push(&Chunk::terminal(Vec::new())).await.unwrap();
        sink.path().to_path_buf()
    }

    async fn install(
        engine: &DeployEngine,
        name: &str,
        version: &str,
        files: &[(&str, &[u8])],
    ) -> Service {
        let spec = Service::new(name, format!("/opt/{name}/{name}")).version(version);
        let sink = engine.begin_install(&spec).await.unwrap();
        let package = stream_package(sink, &tar_gz_bytes(files)).await;
        engine.finish_install(spec, &package).await.unwrap()
    }

    async fn upgrade(
        engine: &DeployEngine,
        name: &str,
        version: &str,
        files: &[(&str, &[u8])],
    ) -> Service {
        let sink = engine.begin_upgrade(name, version).await.unwrap();
        let package = stream_package(sink, &tar_gz_bytes(files)).await;
        engine.finish_upgrade(name, version, &package).await.unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_extracts_and_activates_version() {
        let (tmp, engine, manager) = engine();
        let svc = install(
            &engine,
            "web",
            "v1",
            &[("web", b"binary-v1"), ("conf/web.conf", b"port=80")],
        )
        .await;

        assert_eq!(svc.status, Status::Init); // no auto-start
        assert!(svc.install_flag);

        let link = tmp.path().join("web");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            tmp.path().join("web_v1")
        );
        assert_eq!(std::fs::read(link.join("web")).unwrap(), b"binary-v1");
        assert_eq!(
            std::fs::read(link.join("conf/web.conf")).unwrap(),
            b"port=80"
        );
        assert!(manager.contains("web").await);
    }

    #[tokio::test]
    async fn install_duplicate_name_is_rejected_before_any_write() {
        let (tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;

        let err = engine
            .begin_install(&Service::new("web", "/opt/web/web").version("v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GpmError::Conflict(_)));
        assert!(!tmp.path().join("packages/web/web-v2.tar.gz").exists());
    }

    #[tokio::test]
    async fn install_malformed_spec_is_bad_request() {
        let (_tmp, engine, _manager) = engine();
        let err = engine
            .begin_install(&Service::new("web", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, GpmError::BadRequest(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upgrade_repoints_link_and_keeps_old_files() {
        let (tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;
        let svc = upgrade(&engine, "web", "v2", &[("web", b"v2")]).await;

        assert_eq!(svc.version, "v2");
        assert_eq!(
            std::fs::read_link(tmp.path().join("web")).unwrap(),
            tmp.path().join("web_v2")
        );
        // v1 files retained on disk for later rollback
        assert_eq!(
            std::fs::read(tmp.path().join("web_v1/web")).unwrap(),
            b"v1"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_history_is_monotonic_with_no_duplicates() {
        let (_tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;
        upgrade(&engine, "web", "v2", &[("web", b"v2")]).await;
        upgrade(&engine, "web", "v3", &[("web", b"v3")]).await;

        let versions = engine.list_versions("web").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        let mut names: Vec<_> = versions.iter().map(|v| v.version.clone()).collect();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn extraction_rejects_entries_that_escape_the_target() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("evil.tar.gz");
        std::fs::write(&pkg, tar_gz_bytes(&[("../evil.txt", b"x")])).unwrap();

        let dest = tmp.path().join("root/web_v1");
        let err = extract_tar_gz(&pkg, &dest).unwrap_err();
        assert!(matches!(err, GpmError::BadRequest(_)));
        assert!(!tmp.path().join("root/evil.txt").exists());
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_upgrade_is_marked_failed_not_stuck_upgrading() {
        let (tmp, engine, manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;

        let sink = engine.begin_upgrade("web", "v2").await.unwrap();
        let package = stream_package(sink, b"not a gzip archive").await;
        engine.finish_upgrade("web", "v2", &package).await.unwrap_err();

        let persisted = manager.store().find_by_name("web").unwrap();
        assert_eq!(persisted.status, Status::Failed);
        assert!(!persisted.msg.is_empty());
        assert_eq!(persisted.version, "v1");
        // the live link still points at the old version
        assert_eq!(
            std::fs::read_link(tmp.path().join("web")).unwrap(),
            tmp.path().join("web_v1")
        );
    }

    #[tokio::test]
    async fn upgrade_to_same_version_conflicts() {
        let (_tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;
        let err = engine.begin_upgrade("web", "v1").await.unwrap_err();
        assert!(matches!(err, GpmError::Conflict(_)));
    }

    #[tokio::test]
    async fn upgrade_of_unknown_service_is_not_found() {
        let (_tmp, engine, _manager) = engine();
        let err = engine.begin_upgrade("ghost", "v2").await.unwrap_err();
        assert!(matches!(err, GpmError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rollback_requires_known_version_and_leaves_link_untouched() {
        let (tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;

        let err = engine.rollback("web", "v9.9.9").await.unwrap_err();
        assert!(matches!(err, GpmError::NotFound(_)));
        assert_eq!(
            std::fs::read_link(tmp.path().join("web")).unwrap(),
            tmp.path().join("web_v1")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rollback_repoints_to_prior_version_without_reupload() {
        let (tmp, engine, manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;
        upgrade(&engine, "web", "v2", &[("web", b"v2")]).await;

        let svc = engine.rollback("web", "v1").await.unwrap();
        assert_eq!(svc.version, "v1");
        assert_eq!(
            std::fs::read_link(tmp.path().join("web")).unwrap(),
            tmp.path().join("web_v1")
        );
        assert_eq!(manager.get("web").await.unwrap().version, "v1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forget_prunes_sibling_and_history_but_never_the_active_version() {
        let (tmp, engine, _manager) = engine();
        install(&engine, "web", "v1", &[("web", b"v1")]).await;
        upgrade(&engine, "web", "v2", &[("web", b"v2")]).await;

        let err = engine.forget("web", "v2").await.unwrap_err();
        assert!(matches!(err, GpmError::Conflict(_)));

        engine.forget("web", "v1").await.unwrap();
        assert!(!tmp.path().join("web_v1").exists());
        let versions = engine.list_versions("web").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "v2");
    }
}
