//! JSON-file store backend: one record file per service plus a directory of
//! version marker files.

use std::fs;

use tracing::{debug, warn};

use crate::error::{GpmError, Result};
use crate::paths::Paths;
use crate::service::{Service, ServiceVersion};

use super::ServiceStore;

pub struct FileStore {
    paths: Paths,
}

impl FileStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    fn load(&self, name: &str) -> Result<Service> {
        let path = self.paths.service_record(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GpmError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, service: &Service) -> Result<()> {
        let path = self.paths.service_record(&service.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(service)?;
        fs::write(&path, raw)?;
        Ok(())
    }
}

impl ServiceStore for FileStore {
    fn find_all(&self) -> Result<Vec<Service>> {
        let dir = self.paths.services_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut services = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.load(&name) {
                Ok(service) => services.push(service),
                Err(e) => {
                    // A broken record must not make the daemon unbootable.
                    warn!("Skipping unreadable service record '{}': {}", name, e);
                }
            }
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    fn find_by_name(&self, name: &str) -> Result<Service> {
        self.load(name)
    }

    fn create(&self, service: &Service) -> Result<Service> {
        let record = self.paths.service_record(&service.name);
        if record.exists() {
            return Err(GpmError::Conflict(format!(
                "service '{}' already exists",
                service.name
            )));
        }
        self.save(service)?;
        fs::create_dir_all(self.paths.versions_dir(&service.name))?;
        fs::create_dir_all(self.paths.logs_dir(&service.name))?;
        fs::create_dir_all(self.paths.packages_dir(&service.name))?;
        self.append_version(&ServiceVersion {
            name: service.name.clone(),
            version: service.version.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        })?;
        debug!("Created service record '{}'", service.name);
        Ok(service.clone())
    }

    fn update(&self, service: &Service) -> Result<Service> {
        if !self.paths.service_record(&service.name).exists() {
            return Err(GpmError::NotFound(service.name.clone()));
        }
        self.save(service)?;
        Ok(service.clone())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let dir = self.paths.service_dir(name);
        if !dir.exists() {
            return Err(GpmError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        debug!("Deleted service record '{}'", name);
        Ok(())
    }

    fn list_versions(&self, name: &str) -> Result<Vec<ServiceVersion>> {
        let dir = self.paths.versions_dir(name);
        if !dir.exists() {
            return Err(GpmError::NotFound(name.to_string()));
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let marker = entry.file_name().to_string_lossy().to_string();
            match ServiceVersion::parse_marker(name, &marker) {
                Some(v) => versions.push(v),
                None => warn!("Ignoring malformed version marker '{}'", marker),
            }
        }
        versions.sort_by_key(|v| v.timestamp);
        Ok(versions)
    }

    fn append_version(&self, version: &ServiceVersion) -> Result<()> {
        let dir = self.paths.versions_dir(&version.name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(version.marker_name()), b"")?;
        Ok(())
    }

    fn remove_version(&self, name: &str, version: &str) -> Result<()> {
        let dir = self.paths.versions_dir(name);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let marker = entry.file_name().to_string_lossy().to_string();
            if let Some(v) = ServiceVersion::parse_marker(name, &marker) {
                if v.version == version {
                    fs::remove_file(entry.path())?;
                    return Ok(());
                }
            }
        }
        Err(GpmError::NotFound(format!("{name}@{version}")))
    }
}
