//! Process introspection and signalling.
//!
//! Jobs run in their own process group, so termination targets the group
//! and reaches everything the shell spawned.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{Pid, Uid, User};
use sysinfo::System;

use crate::error::{BatchError, Result};

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

/// Whether a process with this pid exists (zombies included).
pub fn pid_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(to_pid(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Parent pid of a live process.
pub fn parent_pid(pid: u32) -> Option<u32> {
    let mut system = System::new();
    let sys_pid = sysinfo::Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return None;
    }
    system
        .process(sys_pid)
        .and_then(|p| p.parent())
        .map(|p| p.as_u32())
}

/// True when `pid` is alive and still a child of `parent`. Guards against a
/// recycled pid being mistaken for the original process.
pub fn is_child_of(pid: u32, parent: u32) -> bool {
    pid_exists(pid) && parent_pid(pid) == Some(parent)
}

/// Send SIGTERM to the process group led by `pid`, or to the process alone if
/// it leads no group.
pub fn terminate(pid: u32) -> Result<()> {
    send(pid, Signal::SIGTERM)
}

/// Send SIGKILL to the process group led by `pid`, or to the process alone.
pub fn force_kill(pid: u32) -> Result<()> {
    send(pid, Signal::SIGKILL)
}

fn send(pid: u32, signal: Signal) -> Result<()> {
    match killpg(to_pid(pid), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            kill(to_pid(pid), signal).map_err(|source| BatchError::Signal { pid, source })
        }
        Err(source) => Err(BatchError::Signal { pid, source }),
    }
}

/// Login name of the user running this process.
pub fn current_user() -> String {
    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| Uid::current().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_exists() {
        assert!(pid_exists(std::process::id()));
        assert!(!pid_exists(0));
    }

    #[test]
    fn parent_of_child_is_us() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let pid = child.id();

        assert_eq!(parent_pid(pid), Some(std::process::id()));
        assert!(is_child_of(pid, std::process::id()));
        assert!(!is_child_of(pid, 1));

        terminate(pid).unwrap();
        child.wait().unwrap();
        assert!(!pid_exists(pid));
    }

    #[test]
    fn current_user_is_not_empty() {
        assert!(!current_user().is_empty());
    }
}
