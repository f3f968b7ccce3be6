//! On-disk layout for one daemon root directory.
//!
//! ```text
//! <root>/services/<name>/<name>.json                     service record
//! <root>/services/<name>/versions/<version>@<timestamp>  marker files
//! <root>/logs/<name>/<name>.log                          stable symlink to dated log
//! <root>/packages/<name>/<name>-<version>.tar.gz         uploaded packages
//! <root>/<name>            (symlink) -> <root>/<name>_<version>
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.services_dir().join(name)
    }

    pub fn service_record(&self, name: &str) -> PathBuf {
        self.service_dir(name).join(format!("{name}.json"))
    }

    pub fn versions_dir(&self, name: &str) -> PathBuf {
        self.service_dir(name).join("versions")
    }

    pub fn logs_dir(&self, name: &str) -> PathBuf {
        self.root.join("logs").join(name)
    }

    /// Stable log path; a symlink replaced on every start to point at the
    /// current dated log file.
    pub fn log_link(&self, name: &str) -> PathBuf {
        self.logs_dir(name).join(format!("{name}.log"))
    }

    pub fn dated_log(&self, name: &str, date: &str) -> PathBuf {
        self.logs_dir(name).join(format!("{name}-{date}.log"))
    }

    pub fn packages_dir(&self, name: &str) -> PathBuf {
        self.root.join("packages").join(name)
    }

    pub fn package_file(&self, name: &str, version: &str) -> PathBuf {
        self.packages_dir(name).join(format!("{name}-{version}.tar.gz"))
    }

    /// The service's logical working directory. Never a real directory: a
    /// symlink pointing at the active versioned sibling.
    pub fn version_link(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The real directory holding one installed version's files.
    pub fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(format!("{name}_{version}"))
    }
}
