//! Syscall sandbox.
//!
//! [`lockdown`] installs the seccomp filter for a [`SandboxRole`] on the
//! calling process. It must run exactly once, after everything the process
//! needs has been opened and before the first untrusted byte is parsed. The
//! effect is irreversible: a denied syscall kills the process with SIGSYS.
//!
//! [`rlimit::handle_setrlimit_command`] applies the resource-limit half of a
//! profile from `limit_<resource> <value>` directives.
//!
//! Whether an unavailable sandbox is acceptable is the caller's decision;
//! [`enforce`] implements the usual policy (fatal when required, warning
//! otherwise).

pub mod rlimit;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub mod seccomp;

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Sandbox profile of a process. Fixed at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxRole {
    /// The front-end process: keeps network and process spawn.
    Supervisor,
    /// A document worker: no network, no process spawn, no new files.
    Renderer,
}

impl fmt::Display for SandboxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervisor => write!(f, "supervisor"),
            Self::Renderer => write!(f, "renderer"),
        }
    }
}

impl FromStr for SandboxRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "renderer" => Ok(Self::Renderer),
            other => Err(format!("unknown sandbox role: {other}")),
        }
    }
}

/// Install the syscall filter for `role` on the calling process.
///
/// Returns `false` if the host has no usable mechanism (non-Linux, an
/// unsupported architecture, seccomp compiled out, or the kernel refused the
/// filter). On `true` the filter is active on every thread.
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn lockdown(role: SandboxRole) -> bool {
    if !seccomp::available() {
        log::warn!("[sandbox] seccomp is not available on this kernel");
        return false;
    }
    let filter = match seccomp::build_filter(&seccomp::FilterSpec::for_role(role)) {
        Ok(f) => f,
        Err(e) => {
            log::error!("[sandbox] Failed to build {role} filter: {e}");
            return false;
        }
    };
    match seccomp::install(&filter) {
        Ok(()) => {
            log::info!("[sandbox] Locked down as {role} ({} instructions)", filter.len());
            true
        }
        Err(e) => {
            log::warn!("[sandbox] Failed to install {role} filter: {e}");
            false
        }
    }
}

/// Install the syscall filter for `role` on the calling process.
///
/// Always `false` on this platform.
#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub fn lockdown(role: SandboxRole) -> bool {
    log::warn!("[sandbox] No syscall sandbox on this platform; {role} runs unconfined");
    false
}

/// Run [`lockdown`] and apply the availability policy.
///
/// # Errors
///
/// [`Error::SandboxUnavailable`] if the sandbox could not be installed and
/// `required` is set. Otherwise an unavailable sandbox is logged and ignored.
pub fn enforce(role: SandboxRole, required: bool) -> Result<(), Error> {
    if lockdown(role) {
        return Ok(());
    }
    if required {
        return Err(Error::SandboxUnavailable(format!("{role} lockdown failed")));
    }
    log::warn!("[sandbox] Continuing without {role} sandbox (not required in this environment)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_through_str() {
        for role in [SandboxRole::Supervisor, SandboxRole::Renderer] {
            assert_eq!(role.to_string().parse::<SandboxRole>().unwrap(), role);
        }
        assert!("root".parse::<SandboxRole>().is_err());
    }
}
