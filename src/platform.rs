//! Platform process policy: credential resolution and spawn attributes.
//!
//! On unix the `{user, group}` names of a `SysProcAttr` are resolved to
//! numeric ids once, at service creation time; at spawn time `chroot`,
//! `setgid` and `setuid` are applied after fork, before exec. On windows the
//! only policy is the hidden-window creation flag.

use crate::error::Result;
use crate::service::SysProcAttr;

/// Resolve `user`/`group` names into `uid`/`gid`. Explicit numeric ids in
/// the attribute win over name lookups.
#[cfg(unix)]
pub fn resolve_credentials(attr: &mut SysProcAttr) -> Result<()> {
    use crate::error::GpmError;

    if attr.uid.is_none() {
        if let Some(user) = &attr.user {
            let entry = nix::unistd::User::from_name(user)
                .map_err(|e| GpmError::Internal(format!("user lookup failed: {e}")))?
                .ok_or_else(|| GpmError::BadRequest(format!("unknown user '{user}'")))?;
            attr.uid = Some(entry.uid.as_raw());
            if attr.gid.is_none() && attr.group.is_none() {
                attr.gid = Some(entry.gid.as_raw());
            }
        }
    }
    if attr.gid.is_none() {
        if let Some(group) = &attr.group {
            let entry = nix::unistd::Group::from_name(group)
                .map_err(|e| GpmError::Internal(format!("group lookup failed: {e}")))?
                .ok_or_else(|| GpmError::BadRequest(format!("unknown group '{group}'")))?;
            attr.gid = Some(entry.gid.as_raw());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn resolve_credentials(_attr: &mut SysProcAttr) -> Result<()> {
    Ok(())
}

/// Apply spawn-time attributes to a command.
#[cfg(unix)]
pub fn apply_spawn_attrs(cmd: &mut tokio::process::Command, attr: &SysProcAttr) {
    let chroot = attr.chroot.clone();
    let uid = attr.uid;
    let gid = attr.gid;

    if chroot.is_none() && uid.is_none() && gid.is_none() {
        return;
    }

    // Runs after fork, before exec. Ordering matters: chroot while still
    // privileged, drop the group before the user.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(root) = &chroot {
                nix::unistd::chroot(root.as_str()).map_err(std::io::Error::from)?;
                std::env::set_current_dir("/")?;
            }
            if let Some(gid) = gid {
                nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                    .map_err(std::io::Error::from)?;
            }
            if let Some(uid) = uid {
                nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                    .map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
pub fn apply_spawn_attrs(cmd: &mut tokio::process::Command, _attr: &SysProcAttr) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
pub fn apply_spawn_attrs(_cmd: &mut tokio::process::Command, _attr: &SysProcAttr) {}

/// Signal-0 probe: is a pid alive (and visible to us)?
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_keeps_explicit_ids() {
        let mut attr = SysProcAttr {
            uid: Some(1234),
            gid: Some(1234),
            user: Some("root".into()),
            ..Default::default()
        };
        resolve_credentials(&mut attr).unwrap();
        assert_eq!(attr.uid, Some(1234));
        assert_eq!(attr.gid, Some(1234));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_unknown_user_is_bad_request() {
        use crate::error::GpmError;
        let mut attr = SysProcAttr {
            user: Some("gpmd-no-such-user".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_credentials(&mut attr),
            Err(GpmError::BadRequest(_))
        ));
    }
}
