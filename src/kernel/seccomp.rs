// Syscall filtering
// A deny-list BPF program built in the parent and installed in the child
// after no_new_privs. The interpreter guard is the primary control; the
// filter catches whatever reaches the kernel anyway.

use crate::config::types::{Capability, CapabilitySet, Result, SandboxError};
use std::io;

// Classic BPF opcodes (linux/filter.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// Return actions (linux/seccomp.h).
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// Offsets into struct seccomp_data.
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xC000_003E;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xC000_00B7;

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const ALWAYS_DENIED: &[libc::c_long] = &[
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_userfaultfd,
    libc::SYS_open_by_handle_at,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_kexec_load,
    libc::SYS_reboot,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
];

const NETWORK: &[libc::c_long] = &[
    libc::SYS_socket,
    libc::SYS_socketpair,
    libc::SYS_connect,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_accept,
    libc::SYS_accept4,
];

#[cfg(target_arch = "x86_64")]
const PROCESS_CREATION: &[libc::c_long] = &[libc::SYS_clone, libc::SYS_fork, libc::SYS_vfork];
#[cfg(target_arch = "aarch64")]
const PROCESS_CREATION: &[libc::c_long] = &[libc::SYS_clone];

/// A compiled seccomp program, ready to install.
pub struct SeccompFilter {
    program: Vec<libc::sock_filter>,
}

impl SeccompFilter {
    /// Build the filter for a run. Syscalls covered by a granted capability
    /// are left alone.
    pub fn for_capabilities(granted: &CapabilitySet) -> Result<Self> {
        if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            return Err(SandboxError::Seccomp(
                "syscall filter is only built for x86_64 and aarch64".to_string(),
            ));
        }

        let mut killed: Vec<libc::c_long> = ALWAYS_DENIED.to_vec();
        if !granted.allows(Capability::Network) {
            killed.extend_from_slice(NETWORK);
        }
        let deny_processes = !granted.allows(Capability::Subprocess);
        if deny_processes {
            killed.extend_from_slice(PROCESS_CREATION);
        }

        let mut program = Vec::with_capacity(killed.len() * 2 + 10);
        program.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH));
        program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_CURRENT, 1, 0));
        program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        program.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));

        #[cfg(target_arch = "x86_64")]
        {
            program.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        }

        if deny_processes {
            // glibc falls back to clone when clone3 is unavailable.
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_clone3 as u32, 0, 1));
            program.push(stmt(
                BPF_RET | BPF_K,
                SECCOMP_RET_ERRNO | libc::ENOSYS as u32,
            ));
        }

        for nr in killed {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        }
        program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

        if program.len() > u16::MAX as usize {
            return Err(SandboxError::Seccomp("filter program too long".to_string()));
        }
        Ok(Self { program })
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Install the filter on the calling thread. Requires no_new_privs
    /// (or CAP_SYS_ADMIN). Async-signal-safe.
    pub fn install(&self) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: `prog` points into `self.program`, which outlives the
        // call; the kernel copies the program.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}
