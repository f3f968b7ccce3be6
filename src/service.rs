//! Durable service record and the transient types derived from it.
//!
//! `Service` is both the on-disk record (serde/JSON) and the wire snapshot
//! (rkyv), so it carries both derive sets. Runtime fields (`pid`, `status`,
//! `stat`, ...) are persisted for reconciliation at daemon startup but are
//! recomputed on every read; they are never the source of truth.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{GpmError, Result};

pub const DEFAULT_VERSION: &str = "v0.0.1";

/// Lifecycle state of a service.
#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
)]
#[rkyv(derive(Debug))]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Init,
    Running,
    Stopped,
    Failed,
    Upgrading,
}

impl Status {
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Upgrading => "upgrading",
        }
    }
}

/// Log retention/rotation policy.
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Default,
)]
#[rkyv(derive(Debug))]
pub struct LogPolicy {
    /// Retention in days; 0 means keep forever.
    #[serde(default)]
    pub expire_days: u32,
    /// Rotation threshold in bytes; 0 means never rotate by size.
    #[serde(default)]
    pub max_size: u64,
}

/// Process credential attributes, resolved from names to numeric ids at
/// creation time on unix.
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Default,
)]
#[rkyv(derive(Debug))]
pub struct SysProcAttr {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub chroot: Option<String>,
}

impl SysProcAttr {
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.group.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.chroot.is_none()
    }
}

/// Live resource sample for a running process. Zeroed when not running.
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, Default,
)]
#[rkyv(derive(Debug))]
pub struct ResourceStat {
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory: u64,
    pub mem_percent: f32,
}

/// The durable record for one managed program.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct Service {
    pub name: String,
    /// Executable path.
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Logical working directory; on disk this is the versioned symlink.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub sys_proc_attr: Option<SysProcAttr>,
    #[serde(default)]
    pub log: LogPolicy,
    #[serde(default)]
    pub version: String,
    /// Whether the directory tree was installed by gpmd and should be
    /// deleted when the service is deleted.
    #[serde(default)]
    pub install_flag: bool,
    #[serde(default)]
    pub auto_restart: bool,

    // Runtime/derived fields, recomputed on read.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub stat: ResourceStat,
    #[serde(default)]
    pub creation_ts: i64,
    #[serde(default)]
    pub update_ts: i64,
    #[serde(default)]
    pub start_ts: i64,
}

impl Service {
    pub fn new(name: impl Into<String>, bin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bin: bin.into(),
            args: Vec::new(),
            dir: String::new(),
            env: Vec::new(),
            sys_proc_attr: None,
            log: LogPolicy::default(),
            version: DEFAULT_VERSION.to_string(),
            install_flag: false,
            auto_restart: false,
            pid: 0,
            status: Status::Init,
            msg: String::new(),
            stat: ResourceStat::default(),
            creation_ts: 0,
            update_ts: 0,
            start_ts: 0,
        }
    }

    /// Field validation applied before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GpmError::BadRequest("service name is required".into()));
        }
        if self.name.contains('/') || self.name.contains("..") {
            return Err(GpmError::BadRequest(format!(
                "invalid service name '{}'",
                self.name
            )));
        }
        if self.bin.is_empty() {
            return Err(GpmError::BadRequest("service bin is required".into()));
        }
        Ok(())
    }

    /// Merge-patch: only non-empty fields of `patch` are applied. The
    /// immutable `name` key is never touched. There is no way to unset a
    /// field, matching merge semantics rather than replace semantics.
    pub fn apply_patch(&mut self, patch: &Service) {
        if !patch.bin.is_empty() {
            self.bin = patch.bin.clone();
        }
        if !patch.args.is_empty() {
            self.args = patch.args.clone();
        }
        if !patch.dir.is_empty() {
            self.dir = patch.dir.clone();
        }
        if !patch.env.is_empty() {
            self.env = patch.env.clone();
        }
        if let Some(attr) = &patch.sys_proc_attr {
            if !attr.is_empty() {
                self.sys_proc_attr = Some(attr.clone());
            }
        }
        if patch.log.expire_days != 0 {
            self.log.expire_days = patch.log.expire_days;
        }
        if patch.log.max_size != 0 {
            self.log.max_size = patch.log.max_size;
        }
        if !patch.version.is_empty() {
            self.version = patch.version.clone();
        }
        if patch.auto_restart {
            self.auto_restart = true;
        }
    }

    /// Reset runtime fields to the not-running state.
    pub fn clear_runtime(&mut self) {
        self.pid = 0;
        self.stat = ResourceStat::default();
        self.start_ts = 0;
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn install_flag(mut self, install_flag: bool) -> Self {
        self.install_flag = install_flag;
        self
    }
}

/// One install/upgrade event. Append-only history derived from marker files
/// named `<version>@<YYYYMMDDHHMMSS>`.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct ServiceVersion {
    pub name: String,
    pub version: String,
    /// Unix seconds of the install/upgrade event.
    pub timestamp: i64,
}

impl ServiceVersion {
    pub const MARKER_FORMAT: &'static str = "%Y%m%d%H%M%S";

    pub fn marker_name(&self) -> String {
        let ts = chrono::DateTime::from_timestamp(self.timestamp, 0)
            .unwrap_or_default()
            .format(Self::MARKER_FORMAT);
        format!("{}@{}", self.version, ts)
    }

    pub fn parse_marker(name: &str, marker: &str) -> Option<Self> {
        let (version, ts) = marker.rsplit_once('@')?;
        if version.is_empty() {
            return None;
        }
        let dt = chrono::NaiveDateTime::parse_from_str(ts, Self::MARKER_FORMAT).ok()?;
        Some(Self {
            name: name.to_string(),
            version: version.to_string(),
            timestamp: dt.and_utc().timestamp(),
        })
    }
}
