//! Persistence boundary for service records and version history.

mod file;

pub use file::FileStore;

use crate::error::Result;
use crate::service::{Service, ServiceVersion};

/// Store interface consumed by the manager and the deployment engine.
///
/// `create` is also responsible for preparing the service's log and package
/// directories and appending the first version marker; `delete` removes the
/// record and the marker history but not the installed trees (the manager
/// decides that based on `install_flag`).
pub trait ServiceStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<Service>>;
    fn find_by_name(&self, name: &str) -> Result<Service>;
    fn create(&self, service: &Service) -> Result<Service>;
    fn update(&self, service: &Service) -> Result<Service>;
    fn delete(&self, name: &str) -> Result<()>;
    /// Version history sorted ascending by timestamp. Append-only.
    fn list_versions(&self, name: &str) -> Result<Vec<ServiceVersion>>;
    fn append_version(&self, version: &ServiceVersion) -> Result<()>;
    fn remove_version(&self, name: &str, version: &str) -> Result<()>;
}
