// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Syscall allowlist for the daemon.
//!
//! The daemon's steady state is small: socket traffic, the two xen
//! device fds, grant mmaps and the event loop. Everything it legally
//! does after startup is listed here; how strangers are treated is up
//! to the configured mode.

use seccompiler::{BpfProgram, Error, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use crate::config::SeccompMode;

#[cfg(target_arch = "x86_64")]
const ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const ARCH: TargetArch = TargetArch::aarch64;

fn daemon_rules() -> Vec<(i64, Vec<SeccompRule>)> {
    vec![
        (libc::SYS_brk, vec![]),
        (libc::SYS_clock_gettime, vec![]),
        (libc::SYS_clock_nanosleep, vec![]),
        (libc::SYS_close, vec![]),
        (libc::SYS_connect, vec![]),
        (libc::SYS_epoll_create1, vec![]),
        (libc::SYS_epoll_ctl, vec![]),
        (libc::SYS_epoll_pwait, vec![]),
        #[cfg(target_arch = "x86_64")]
        (libc::SYS_epoll_wait, vec![]),
        (libc::SYS_exit, vec![]),
        (libc::SYS_exit_group, vec![]),
        (libc::SYS_fcntl, vec![]),
        (libc::SYS_fstat, vec![]),
        (libc::SYS_futex, vec![]),
        (libc::SYS_getrandom, vec![]),
        (libc::SYS_ioctl, vec![]),
        (libc::SYS_lseek, vec![]),
        (libc::SYS_madvise, vec![]),
        (libc::SYS_mmap, vec![]),
        (libc::SYS_mprotect, vec![]),
        (libc::SYS_mremap, vec![]),
        (libc::SYS_munmap, vec![]),
        (libc::SYS_nanosleep, vec![]),
        (libc::SYS_newfstatat, vec![]),
        (libc::SYS_openat, vec![]),
        #[cfg(target_arch = "x86_64")]
        (libc::SYS_poll, vec![]),
        (libc::SYS_ppoll, vec![]),
        (libc::SYS_read, vec![]),
        (libc::SYS_recvfrom, vec![]),
        (libc::SYS_restart_syscall, vec![]),
        (libc::SYS_rt_sigaction, vec![]),
        (libc::SYS_rt_sigprocmask, vec![]),
        (libc::SYS_rt_sigreturn, vec![]),
        (libc::SYS_sched_yield, vec![]),
        (libc::SYS_sendto, vec![]),
        (libc::SYS_sigaltstack, vec![]),
        (libc::SYS_socket, vec![]),
        (libc::SYS_statx, vec![]),
        (libc::SYS_write, vec![]),
        (libc::SYS_writev, vec![]),
    ]
}

/// Build the filter program for the configured mode. An empty program
/// means nothing should be installed.
pub fn get_seccomp_filter(mode: SeccompMode) -> Result<BpfProgram, Error> {
    let action = match mode {
        SeccompMode::Off => return Ok(vec![]),
        SeccompMode::Log => SeccompAction::Log,
        SeccompMode::On => SeccompAction::Trap,
    };
    SeccompFilter::new(
        daemon_rules().into_iter().collect(),
        action,
        SeccompAction::Allow,
        ARCH,
    )
    .and_then(TryInto::try_into)
    .map_err(Error::Backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_build() {
        assert!(get_seccomp_filter(SeccompMode::Off).unwrap().is_empty());
        assert!(!get_seccomp_filter(SeccompMode::On).unwrap().is_empty());
        assert!(!get_seccomp_filter(SeccompMode::Log).unwrap().is_empty());
    }

    #[test]
    fn test_no_duplicate_syscalls() {
        let rules = daemon_rules();
        let unique: std::collections::BTreeSet<i64> =
            rules.iter().map(|(nr, _)| *nr).collect();
        assert_eq!(unique.len(), rules.len());
    }
}
