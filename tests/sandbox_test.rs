//! Integration tests for the syscall sandbox.
//!
//! A filter cannot be removed once installed, so every lockdown runs in a
//! child: the test binary re-executes itself with `COLLABD_SANDBOX_CASE`
//! set, the case test performs the lockdown and reports through its exit
//! status.

#![cfg(target_os = "linux")]

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus};

use collabd::sandbox::rlimit::{self, Resource};
use collabd::sandbox::{self, SandboxRole};

const CASE_ENV: &str = "COLLABD_SANDBOX_CASE";
const TARGET_ENV: &str = "COLLABD_SANDBOX_TARGET";

/// Child exit code when this host has no seccomp.
const SKIP: i32 = 77;

fn run_case(case: &str) -> Option<ExitStatus> {
    run_case_on(case, None)
}

fn run_case_on(case: &str, target: Option<&Path>) -> Option<ExitStatus> {
    let exe = std::env::current_exe().unwrap();
    let mut cmd = Command::new(exe);
    cmd.args(["--exact", "sandbox_case", "--nocapture", "--test-threads=1"])
        .env(CASE_ENV, case);
    if let Some(target) = target {
        cmd.env(TARGET_ENV, target);
    }
    let status = cmd.status().unwrap();
    if status.code() == Some(SKIP) {
        eprintln!("seccomp unavailable, skipping {case}");
        return None;
    }
    Some(status)
}

fn target_path() -> CString {
    let target = std::env::var_os(TARGET_ENV).unwrap();
    CString::new(target.as_bytes()).unwrap()
}

/// Exit code for a filesystem call that came back instead of killing us.
fn refusal_code(rc: libc::c_int) -> i32 {
    let errno = std::io::Error::last_os_error().raw_os_error();
    if rc != 0 && matches!(errno, Some(libc::EACCES | libc::EPERM)) {
        0
    } else {
        5
    }
}

/// Entry point of the re-executed child. A no-op in the normal test run.
#[test]
fn sandbox_case() {
    let Ok(case) = std::env::var(CASE_ENV) else {
        return;
    };
    let code = match case.as_str() {
        "renderer-inet" => {
            if !sandbox::lockdown(SandboxRole::Renderer) {
                std::process::exit(SKIP);
            }
            // SAFETY: plain syscall, no pointers.
            unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            1
        }
        "renderer-allowed" => {
            if !sandbox::lockdown(SandboxRole::Renderer) {
                std::process::exit(SKIP);
            }
            let pair_ok = UnixStream::pair().is_ok();
            let open_denied = matches!(
                std::fs::File::open("/dev/null"),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied
            );
            let thread_ok = std::thread::spawn(|| 7).join().ok() == Some(7);
            if pair_ok && open_denied && thread_ok {
                0
            } else {
                2
            }
        }
        "supervisor-network" => {
            if !sandbox::lockdown(SandboxRole::Supervisor) {
                std::process::exit(SKIP);
            }
            let bound = std::net::TcpListener::bind("127.0.0.1:0").is_ok();
            let spawned = Command::new("/bin/sh").args(["-c", "exit 0"]).status().map(|s| s.success());
            if bound && matches!(spawned, Ok(true)) {
                0
            } else {
                3
            }
        }
        "renderer-unix-dgram" => {
            if !sandbox::lockdown(SandboxRole::Renderer) {
                std::process::exit(SKIP);
            }
            let _ = UnixDatagram::unbound();
            6
        }
        mutation if mutation.starts_with("renderer-fs-") => {
            let path = target_path();
            let mut moved = path.as_bytes().to_vec();
            moved.extend_from_slice(b".moved");
            let moved = CString::new(moved).unwrap();
            if !sandbox::lockdown(SandboxRole::Renderer) {
                std::process::exit(SKIP);
            }
            // SAFETY: `path` and `moved` are NUL-terminated and outlive the call.
            let rc = unsafe {
                match mutation {
                    "renderer-fs-truncate" => libc::truncate(path.as_ptr(), 0),
                    "renderer-fs-unlink" => libc::unlink(path.as_ptr()),
                    "renderer-fs-rename" => libc::rename(path.as_ptr(), moved.as_ptr()),
                    "renderer-fs-utimensat" => {
                        libc::utimensat(libc::AT_FDCWD, path.as_ptr(), std::ptr::null(), 0)
                    }
                    "renderer-fs-chmod" => libc::chmod(path.as_ptr(), 0o777),
                    _ => std::process::exit(99),
                }
            };
            refusal_code(rc)
        }
        "limit-cpu" => {
            let recognized = rlimit::handle_directive_line("limit_cpu 30");
            if recognized && rlimit::current(Resource::CpuTime) == Some(30) {
                0
            } else {
                4
            }
        }
        _ => 99,
    };
    std::process::exit(code);
}

#[test]
fn test_renderer_dies_on_inet_socket() {
    let Some(status) = run_case("renderer-inet") else {
        return;
    };
    assert_eq!(status.signal(), Some(libc::SIGSYS), "child exited with {status:?}");
}

#[test]
fn test_renderer_keeps_unix_sockets_and_threads() {
    let Some(status) = run_case("renderer-allowed") else {
        return;
    };
    assert_eq!(status.code(), Some(0), "child exited with {status:?}");
}

#[test]
fn test_renderer_dies_on_unix_datagram_socket() {
    let Some(status) = run_case("renderer-unix-dgram") else {
        return;
    };
    assert_eq!(status.signal(), Some(libc::SIGSYS), "child exited with {status:?}");
}

#[test]
fn test_renderer_cannot_modify_files_by_path() {
    const BODY: &[u8] = b"document body";
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("victim.odt");

    for case in [
        "renderer-fs-truncate",
        "renderer-fs-unlink",
        "renderer-fs-rename",
        "renderer-fs-utimensat",
        "renderer-fs-chmod",
    ] {
        std::fs::write(&victim, BODY).unwrap();
        let before = std::fs::metadata(&victim).unwrap();
        let Some(status) = run_case_on(case, Some(&victim)) else {
            return;
        };
        assert!(
            status.signal() == Some(libc::SIGSYS) || status.code() == Some(0),
            "{case} exited with {status:?}"
        );

        let after = std::fs::metadata(&victim).unwrap_or_else(|e| panic!("{case} removed the file: {e}"));
        assert_eq!(std::fs::read(&victim).unwrap(), BODY, "{case} changed the contents");
        assert_eq!(after.modified().unwrap(), before.modified().unwrap(), "{case} touched the mtime");
        assert_eq!(after.permissions(), before.permissions(), "{case} changed the mode");
        assert!(!dir.path().join("victim.odt.moved").exists(), "{case} renamed the file");
    }
}

#[test]
fn test_supervisor_keeps_network_and_spawn() {
    let Some(status) = run_case("supervisor-network") else {
        return;
    };
    assert_eq!(status.code(), Some(0), "child exited with {status:?}");
}

#[test]
fn test_cpu_limit_applies_in_child() {
    let status = run_case("limit-cpu").unwrap();
    assert_eq!(status.code(), Some(0), "child exited with {status:?}");
}

#[test]
fn test_unrelated_command_is_not_a_limit() {
    assert!(!rlimit::handle_setrlimit_command(&["setconfig", "chunk_size", "1024"]));
    assert!(!rlimit::handle_setrlimit_command(&["limit_cpu"]));
    assert!(!rlimit::handle_directive_line(""));
}
