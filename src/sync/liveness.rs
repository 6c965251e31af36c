//! Process liveness probing for lock holders

use std::fmt;

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

/// Answers whether the process holding a lock is still running
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    /// Whether `pid` names a live process
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)`
///
/// `ESRCH` means the process is gone; `EPERM` means it exists under another
/// user. A recycled pid reads as alive, so such a lock is only reclaimed once
/// the new owner exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }
}

/// Probe reporting every holder as dead
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeDead;

impl ProcessProbe for AssumeDead {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Probe reporting every holder as alive
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAlive;

impl ProcessProbe for AssumeAlive {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Pid of the calling process
pub fn current_pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        assert!(OsProbe.is_alive(current_pid()));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!OsProbe.is_alive(pid));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!OsProbe.is_alive(0));
        assert!(!OsProbe.is_alive(u32::MAX));
    }
}
