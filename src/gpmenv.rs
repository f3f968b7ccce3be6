use std::path::PathBuf;

/// Environment variables recognised by the daemon.
pub const ENV_ROOT_DIR: &str = "GPMD_ROOT_DIR";
pub const ENV_SOCKET: &str = "GPMD_SOCKET";
pub const ENV_PID: &str = "GPMD_PID";
pub const ENV_TCP_PORT: &str = "GPMD_TCP_PORT";

const DEFAULT_TCP_PORT: u16 = 7476;

const GPMD_SUBDIR: &str = ".gpmd";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Daemon root directory ($GPMD_ROOT_DIR or ~/.gpmd).
///
/// Everything the daemon persists lives under this directory: service
/// records, version markers, logs, packages and the versioned service trees.
pub fn root_dir() -> PathBuf {
    let dir = env_opt(ENV_ROOT_DIR).map(PathBuf::from).unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(GPMD_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved root directory");
    dir
}

/// Control socket path ($GPMD_SOCKET or <root>/gpmd.sock).
pub fn socket_path() -> PathBuf {
    env_opt(ENV_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| root_dir().join("gpmd.sock"))
}

/// Daemon pid file path ($GPMD_PID or <root>/gpmd.pid).
pub fn pid_path() -> PathBuf {
    env_opt(ENV_PID)
        .map(PathBuf::from)
        .unwrap_or_else(|| root_dir().join("gpmd.pid"))
}

/// Loopback TCP port used where unix sockets are unavailable
/// ($GPMD_TCP_PORT or 7476).
pub fn tcp_port() -> u16 {
    env_opt(ENV_TCP_PORT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_root() {
        // Not overriding env here: whatever root resolves to, the socket and
        // pid defaults must be its children unless explicitly overridden.
        if env_opt(ENV_SOCKET).is_none() {
            assert!(socket_path().starts_with(root_dir()));
        }
        if env_opt(ENV_PID).is_none() {
            assert!(pid_path().starts_with(root_dir()));
        }
    }
}
