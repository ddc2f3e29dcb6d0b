//! Seccomp-BPF filter programs for the two sandbox roles.
//!
//! ## Filter Structure
//!
//! ```text
//! load arch      ── not native ──► KILL
//! load nr
//! socket, socketpair ──► socket handler                    [renderer]
//!                        (AF_UNIX stream/seqpacket only, else KILL)
//! clone  ──► clone handler (CLONE_THREAD only, else KILL)   [renderer]
//! nr ∈ enosys ──► ERRNO(ENOSYS)
//! nr ∈ eacces ──► ERRNO(EACCES)
//! nr ∈ kill   ──► KILL_PROCESS
//! ALLOW
//! ```
//!
//! Each role is a deny list over an allow-by-default base, hardened with
//! argument checks where a syscall is needed in one form and fatal in
//! another. `clone3` cannot be inspected (flags live behind a pointer) and
//! answers ENOSYS so libc falls back to `clone`. Unix datagram sockets are
//! refused: `sendto`/`sendmsg` on one can name a filesystem socket without
//! `connect`, and the address is out of reach of the filter.
//!
//! The filter is permanent once installed and is inherited across fork and
//! exec. Killed processes die with SIGSYS.

use std::collections::HashMap;
use std::io;

use super::SandboxRole;

// Seccomp constants
const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_AND: u16 = 0x50;
const BPF_K: u16 = 0x00;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;

// seccomp_data offsets; args are 64-bit, low word first on little-endian targets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS_0: u32 = 16;
const OFFSET_ARGS_1: u32 = 24;

const CLONE_THREAD: u32 = 0x0001_0000;
const AF_UNIX: u32 = 1;
const SOCK_STREAM: u32 = 1;
const SOCK_SEQPACKET: u32 = 5;
// SOCK_NONBLOCK and SOCK_CLOEXEC sit above the type bits
const SOCK_TYPE_MASK: u32 = 0xf;

/// One BPF instruction (`struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    /// Opcode.
    pub code: u16,
    /// Jump offset if true.
    pub jt: u8,
    /// Jump offset if false.
    pub jf: u8,
    /// Operand.
    pub k: u32,
}

impl SockFilter {
    /// Non-jump instruction.
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    /// Conditional jump.
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

/// Syscalls always fatal in the rendering worker: network servers and
/// clients, process creation, tracing, host kernel state, filesystem
/// mutation, filter tampering.
fn renderer_kill_list() -> Vec<libc::c_long> {
    let mut list = vec![
        // network: only the inherited control socketpair may be used
        libc::SYS_connect,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_accept,
        libc::SYS_accept4,
        // process creation
        libc::SYS_execve,
        libc::SYS_execveat,
        // signals and tracing
        libc::SYS_kill,
        libc::SYS_tkill,
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        // credentials and personality
        libc::SYS_capset,
        libc::SYS_personality,
        libc::SYS_vhangup,
        // filesystem namespace
        libc::SYS_pivot_root,
        libc::SYS_chroot,
        libc::SYS_acct,
        libc::SYS_sync,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_unshare,
        // host state
        libc::SYS_reboot,
        libc::SYS_sethostname,
        libc::SYS_setdomainname,
        libc::SYS_kexec_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        // vm bits
        libc::SYS_mbind,
        libc::SYS_set_mempolicy,
        libc::SYS_get_mempolicy,
        libc::SYS_move_pages,
        libc::SYS_splice,
        libc::SYS_tee,
        libc::SYS_vmsplice,
        // kernel keyring
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_keyctl,
        // watches and profiling
        libc::SYS_inotify_init1,
        libc::SYS_inotify_add_watch,
        libc::SYS_inotify_rm_watch,
        libc::SYS_fanotify_init,
        libc::SYS_fanotify_mark,
        libc::SYS_perf_event_open,
        // no further fiddling
        libc::SYS_seccomp,
        libc::SYS_bpf,
        // filesystem mutation, by path or through a pre-opened descriptor
        libc::SYS_unlinkat,
        libc::SYS_renameat,
        libc::SYS_renameat2,
        libc::SYS_mkdirat,
        libc::SYS_mknodat,
        libc::SYS_symlinkat,
        libc::SYS_linkat,
        libc::SYS_truncate,
        libc::SYS_utimensat,
        libc::SYS_fchmod,
        libc::SYS_fchmodat,
        libc::SYS_fchown,
        libc::SYS_fchownat,
        libc::SYS_setxattr,
        libc::SYS_lsetxattr,
        libc::SYS_fsetxattr,
        libc::SYS_removexattr,
        libc::SYS_lremovexattr,
        libc::SYS_fremovexattr,
        libc::SYS_name_to_handle_at,
        libc::SYS_open_by_handle_at,
        libc::SYS_quotactl,
    ];
    #[cfg(target_arch = "x86_64")]
    list.extend_from_slice(&[
        libc::SYS_fork,
        libc::SYS_vfork,
        libc::SYS_uselib,
        libc::SYS_modify_ldt,
        libc::SYS_inotify_init,
        libc::SYS_unlink,
        libc::SYS_rename,
        libc::SYS_mkdir,
        libc::SYS_mknod,
        libc::SYS_rmdir,
        libc::SYS_utime,
        libc::SYS_utimes,
        libc::SYS_futimesat,
        libc::SYS_symlink,
        libc::SYS_link,
        libc::SYS_chmod,
        libc::SYS_chown,
        libc::SYS_lchown,
    ]);
    list
}

/// Opening files fails softly in the rendering worker; it may only use
/// descriptors opened before lockdown.
fn renderer_eacces_list() -> Vec<libc::c_long> {
    let mut list = vec![libc::SYS_openat, libc::SYS_openat2];
    #[cfg(target_arch = "x86_64")]
    list.extend_from_slice(&[libc::SYS_open, libc::SYS_creat]);
    list
}

/// Syscalls fatal in the supervising process. It keeps network access and
/// process creation but never needs to touch host-global kernel state.
fn supervisor_kill_list() -> Vec<libc::c_long> {
    let mut list = vec![
        libc::SYS_ptrace,
        libc::SYS_process_vm_writev,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
        libc::SYS_acct,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_reboot,
        libc::SYS_sethostname,
        libc::SYS_setdomainname,
        libc::SYS_kexec_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_keyctl,
        libc::SYS_bpf,
        libc::SYS_perf_event_open,
        libc::SYS_fanotify_init,
    ];
    #[cfg(target_arch = "x86_64")]
    list.extend_from_slice(&[libc::SYS_uselib, libc::SYS_modify_ldt]);
    list
}

/// Rules for one role.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Syscalls that kill the process.
    pub kill: Vec<libc::c_long>,
    /// Syscalls that fail with ENOSYS.
    pub enosys: Vec<libc::c_long>,
    /// Syscalls that fail with EACCES.
    pub eacces: Vec<libc::c_long>,
    /// Restrict `socket` and `socketpair` to connection-oriented `AF_UNIX`.
    pub unix_streams_only: bool,
    /// Restrict `clone` to thread creation.
    pub threads_only: bool,
}

impl FilterSpec {
    /// Rules for `role`.
    pub fn for_role(role: SandboxRole) -> Self {
        match role {
            SandboxRole::Renderer => Self {
                kill: renderer_kill_list(),
                enosys: vec![libc::SYS_clone3],
                eacces: renderer_eacces_list(),
                unix_streams_only: true,
                threads_only: true,
            },
            SandboxRole::Supervisor => Self {
                kill: supervisor_kill_list(),
                ..Self::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Label {
    Allow,
    Kill,
    Enosys,
    Eacces,
    SocketHandler,
    CloneHandler,
}

/// BPF program under construction. Forward jumps name a label and are
/// resolved in [`Program::finish`].
#[derive(Debug, Default)]
struct Program {
    insns: Vec<SockFilter>,
    jumps: Vec<(usize, Label)>,
    labels: HashMap<Label, usize>,
}

impl Program {
    fn stmt(&mut self, code: u16, k: u32) {
        self.insns.push(SockFilter::stmt(code, k));
    }

    /// `if A == k goto label`.
    fn jeq_to(&mut self, k: u32, label: Label) {
        self.jumps.push((self.insns.len(), label));
        self.insns.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, k, 0, 0));
    }

    fn label(&mut self, label: Label) {
        self.labels.insert(label, self.insns.len());
    }

    fn finish(mut self) -> io::Result<Vec<SockFilter>> {
        for (at, label) in &self.jumps {
            let target = self.labels.get(label).copied().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unresolved label {label:?}"))
            })?;
            let offset = u8::try_from(target - at - 1).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "seccomp filter jump out of range")
            })?;
            self.insns[*at].jt = offset;
        }
        Ok(self.insns)
    }
}

/// Build the filter program for `profile`.
pub fn build_filter(profile: &FilterSpec) -> io::Result<Vec<SockFilter>> {
    let mut p = Program::default();

    // === Architecture check ===
    p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH);
    p.insns.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0));
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);

    // === Dispatch on syscall number ===
    p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR);
    if profile.unix_streams_only {
        p.jeq_to(libc::SYS_socket as u32, Label::SocketHandler);
        p.jeq_to(libc::SYS_socketpair as u32, Label::SocketHandler);
    }
    if profile.threads_only {
        p.jeq_to(libc::SYS_clone as u32, Label::CloneHandler);
    }
    for &nr in &profile.enosys {
        p.jeq_to(nr as u32, Label::Enosys);
    }
    for &nr in &profile.eacces {
        p.jeq_to(nr as u32, Label::Eacces);
    }
    for &nr in &profile.kill {
        p.jeq_to(nr as u32, Label::Kill);
    }

    p.label(Label::Allow);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
    p.label(Label::Kill);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);
    p.label(Label::Enosys);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::ENOSYS as u32);
    p.label(Label::Eacces);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::EACCES as u32);

    // === Socket handler: domain (args[0]) must be AF_UNIX, type (args[1])
    // SOCK_STREAM or SOCK_SEQPACKET ===
    p.label(Label::SocketHandler);
    p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_0);
    p.insns.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AF_UNIX, 1, 0));
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);
    p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_1);
    p.stmt(BPF_ALU | BPF_AND | BPF_K, SOCK_TYPE_MASK);
    p.insns.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, SOCK_STREAM, 2, 0));
    p.insns.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, SOCK_SEQPACKET, 1, 0));
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);

    // === Clone handler: flags (args[0]) must include CLONE_THREAD ===
    p.label(Label::CloneHandler);
    p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_0);
    p.insns.push(SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, CLONE_THREAD, 0, 1));
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
    p.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);

    p.finish()
}

/// Whether the kernel supports seccomp filters.
pub fn available() -> bool {
    // SAFETY: PR_GET_SECCOMP takes no pointer arguments.
    let mode = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    mode >= 0
}

/// Install `filter` on every thread of the calling process.
///
/// Sets `PR_SET_NO_NEW_PRIVS` first. Falls back to `prctl(PR_SET_SECCOMP)`
/// (calling thread only) on kernels without the `seccomp` syscall.
pub fn install(filter: &[SockFilter]) -> io::Result<()> {
    let len = libc::c_ushort::try_from(filter.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seccomp filter too long"))?;
    let prog = SockFprog { len, filter: filter.as_ptr() };

    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `prog` points at `filter`, which outlives the call; the kernel
    // copies the program before returning.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC,
            &prog as *const SockFprog,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err);
    }

    // SAFETY: as above; PR_SET_SECCOMP copies the program.
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const SockFprog,
            0,
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_starts_with_arch_check() {
        let filter = build_filter(&FilterSpec::for_role(SandboxRole::Renderer)).unwrap();
        assert_eq!(filter[0], SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
        assert_eq!(filter[1].k, AUDIT_ARCH_NATIVE);
        assert_eq!(filter[2].k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_kill_jumps_land_on_kill_return() {
        let profile = FilterSpec::for_role(SandboxRole::Renderer);
        let filter = build_filter(&profile).unwrap();
        let listen = filter
            .iter()
            .position(|i| i.code == BPF_JMP | BPF_JEQ | BPF_K && i.k == libc::SYS_listen as u32)
            .unwrap();
        let target = listen + 1 + filter[listen].jt as usize;
        assert_eq!(filter[target], SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
    }

    #[test]
    fn test_clone3_answers_enosys() {
        let filter = build_filter(&FilterSpec::for_role(SandboxRole::Renderer)).unwrap();
        let at = filter
            .iter()
            .position(|i| i.code == BPF_JMP | BPF_JEQ | BPF_K && i.k == libc::SYS_clone3 as u32)
            .unwrap();
        let target = at + 1 + filter[at].jt as usize;
        assert_eq!(filter[target].k, SECCOMP_RET_ERRNO | libc::ENOSYS as u32);
    }

    #[test]
    fn test_socket_handler_checks_af_unix() {
        let filter = build_filter(&FilterSpec::for_role(SandboxRole::Renderer)).unwrap();
        let at = filter
            .iter()
            .position(|i| i.code == BPF_JMP | BPF_JEQ | BPF_K && i.k == libc::SYS_socket as u32)
            .unwrap();
        let handler = at + 1 + filter[at].jt as usize;
        assert_eq!(filter[handler].k, OFFSET_ARGS_0);
        assert_eq!(filter[handler + 1].k, AF_UNIX);
    }

    /// Run `filter` over one syscall the way the kernel would.
    fn evaluate(filter: &[SockFilter], nr: libc::c_long, args: [u64; 2]) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = filter[pc];
            pc += 1;
            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    acc = match insn.k {
                        OFFSET_SYSCALL_NR => nr as u32,
                        OFFSET_ARCH => AUDIT_ARCH_NATIVE,
                        OFFSET_ARGS_0 => args[0] as u32,
                        OFFSET_ARGS_1 => args[1] as u32,
                        other => panic!("unexpected load offset {other}"),
                    };
                }
                c if c == BPF_ALU | BPF_AND | BPF_K => acc &= insn.k,
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += usize::from(if acc == insn.k { insn.jt } else { insn.jf });
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    pc += usize::from(if acc & insn.k != 0 { insn.jt } else { insn.jf });
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    fn renderer() -> Vec<SockFilter> {
        build_filter(&FilterSpec::for_role(SandboxRole::Renderer)).unwrap()
    }

    #[test]
    fn test_renderer_sockets_limited_to_unix_streams() {
        let f = renderer();
        let unix = libc::AF_UNIX as u64;
        let cloexec = libc::SOCK_CLOEXEC as u64;
        for nr in [libc::SYS_socket, libc::SYS_socketpair] {
            assert_eq!(evaluate(&f, nr, [unix, libc::SOCK_STREAM as u64 | cloexec]), SECCOMP_RET_ALLOW);
            assert_eq!(evaluate(&f, nr, [unix, libc::SOCK_SEQPACKET as u64]), SECCOMP_RET_ALLOW);
            assert_eq!(evaluate(&f, nr, [unix, libc::SOCK_DGRAM as u64 | cloexec]), SECCOMP_RET_KILL_PROCESS);
            assert_eq!(evaluate(&f, nr, [unix, libc::SOCK_RAW as u64]), SECCOMP_RET_KILL_PROCESS);
            assert_eq!(
                evaluate(&f, nr, [libc::AF_INET as u64, libc::SOCK_STREAM as u64]),
                SECCOMP_RET_KILL_PROCESS
            );
        }
    }

    #[test]
    fn test_renderer_refuses_path_mutation() {
        let f = renderer();
        for nr in [
            libc::SYS_truncate,
            libc::SYS_utimensat,
            libc::SYS_mknodat,
            libc::SYS_setxattr,
            libc::SYS_lsetxattr,
            libc::SYS_removexattr,
            libc::SYS_lremovexattr,
            libc::SYS_unlinkat,
            libc::SYS_renameat2,
            libc::SYS_fchmod,
        ] {
            assert_eq!(evaluate(&f, nr, [0, 0]), SECCOMP_RET_KILL_PROCESS, "syscall {nr}");
        }
        assert_eq!(evaluate(&f, libc::SYS_openat, [0, 0]), SECCOMP_RET_ERRNO | libc::EACCES as u32);
        assert_eq!(evaluate(&f, libc::SYS_read, [0, 0]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_renderer_clone_needs_thread_flag() {
        let f = renderer();
        let thread_flags = (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as u64;
        assert_eq!(evaluate(&f, libc::SYS_clone, [thread_flags, 0]), SECCOMP_RET_ALLOW);
        assert_eq!(evaluate(&f, libc::SYS_clone, [libc::SIGCHLD as u64, 0]), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_supervisor_keeps_network_and_spawn() {
        let profile = FilterSpec::for_role(SandboxRole::Supervisor);
        assert!(!profile.unix_streams_only);
        assert!(!profile.threads_only);
        for nr in [libc::SYS_socket, libc::SYS_connect, libc::SYS_execve, libc::SYS_clone, libc::SYS_seccomp] {
            assert!(!profile.kill.contains(&nr));
        }
        assert!(profile.kill.contains(&libc::SYS_mount));
    }

    #[test]
    fn test_program_fits_jump_range() {
        for role in [SandboxRole::Renderer, SandboxRole::Supervisor] {
            assert!(build_filter(&FilterSpec::for_role(role)).is_ok());
        }
    }
}
