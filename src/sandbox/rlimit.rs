//! Resource-limit directives.
//!
//! A directive is a whitespace-tokenized command, either bare or in the
//! `setconfig` form used on the worker command line:
//!
//! ```text
//! limit_virt_mem_mb 2048
//! setconfig limit_num_open_files 512
//! ```
//!
//! | Directive | Resource | Unit |
//! |-----------|----------|------|
//! | `limit_virt_mem_mb` | `RLIMIT_AS` | MiB |
//! | `limit_as` | `RLIMIT_AS` | bytes |
//! | `limit_stack_mem_kb` | `RLIMIT_STACK` | KiB |
//! | `limit_file_size_mb` | `RLIMIT_FSIZE` | MiB |
//! | `limit_num_open_files`, `limit_nofile` | `RLIMIT_NOFILE` | files |
//! | `limit_cpu` | `RLIMIT_CPU` | seconds |
//! | `limit_core` | `RLIMIT_CORE` | bytes |
//!
//! A value `<= 0` means unlimited. Soft and hard limits are set together, so
//! a lowered limit cannot be raised again by the process.

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RawResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RawResource = libc::c_int;

/// A resource a directive can limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Virtual address space.
    AddressSpace,
    /// Stack size.
    Stack,
    /// Largest file the process may create.
    FileSize,
    /// Open file descriptors.
    OpenFiles,
    /// CPU time.
    CpuTime,
    /// Core dump size.
    CoreSize,
}

impl Resource {
    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::AddressSpace => "RLIMIT_AS",
            Self::Stack => "RLIMIT_STACK",
            Self::FileSize => "RLIMIT_FSIZE",
            Self::OpenFiles => "RLIMIT_NOFILE",
            Self::CpuTime => "RLIMIT_CPU",
            Self::CoreSize => "RLIMIT_CORE",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Self::OpenFiles => "files",
            Self::CpuTime => "seconds",
            _ => "bytes",
        }
    }

    fn raw(self) -> RawResource {
        let raw = match self {
            Self::AddressSpace => libc::RLIMIT_AS,
            Self::Stack => libc::RLIMIT_STACK,
            Self::FileSize => libc::RLIMIT_FSIZE,
            Self::OpenFiles => libc::RLIMIT_NOFILE,
            Self::CpuTime => libc::RLIMIT_CPU,
            Self::CoreSize => libc::RLIMIT_CORE,
        };
        raw as RawResource
    }
}

/// Map a directive name to its resource and the multiplier from the
/// directive's unit to the kernel's.
fn lookup(name: &str) -> Option<(Resource, u64)> {
    let entry = match name {
        "limit_virt_mem_mb" => (Resource::AddressSpace, 1024 * 1024),
        "limit_as" => (Resource::AddressSpace, 1),
        "limit_stack_mem_kb" => (Resource::Stack, 1024),
        "limit_file_size_mb" => (Resource::FileSize, 1024 * 1024),
        "limit_num_open_files" | "limit_nofile" => (Resource::OpenFiles, 1),
        "limit_cpu" => (Resource::CpuTime, 1),
        "limit_core" => (Resource::CoreSize, 1),
        _ => return None,
    };
    Some(entry)
}

/// A parsed directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDirective {
    /// Limited resource.
    pub resource: Resource,
    /// Limit in kernel units; `None` is unlimited.
    pub limit: Option<u64>,
}

/// Parse a directive.
///
/// `None` if the tokens are not a limit directive at all. `Some(Err)` if they
/// are one but the value is malformed.
pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Option<Result<LimitDirective, String>> {
    let tokens: Vec<&str> = tokens.iter().map(AsRef::as_ref).collect();
    let (name, value) = match tokens.as_slice() {
        ["setconfig", name, value] | [name, value] => (*name, *value),
        _ => return None,
    };
    let (resource, scale) = lookup(name)?;
    let parsed = match value.parse::<i64>() {
        Ok(v) => v,
        Err(e) => return Some(Err(format!("{name}: invalid value {value:?}: {e}"))),
    };
    let limit = if parsed <= 0 {
        None
    } else {
        Some((parsed as u64).saturating_mul(scale))
    };
    Some(Ok(LimitDirective { resource, limit }))
}

/// Apply a limit directive to the calling process.
///
/// Returns whether the tokens were recognized as a limit directive,
/// independent of whether applying it succeeded. Failures are logged.
pub fn handle_setrlimit_command<S: AsRef<str>>(tokens: &[S]) -> bool {
    match parse(tokens) {
        None => false,
        Some(Err(msg)) => {
            log::warn!("[sandbox] Ignoring limit directive: {msg}");
            true
        }
        Some(Ok(directive)) => {
            apply(directive);
            true
        }
    }
}

/// Apply a whitespace-separated directive line. Same return value as
/// [`handle_setrlimit_command`].
pub fn handle_directive_line(line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    handle_setrlimit_command(&tokens)
}

fn describe(limit: u64, unit: &str) -> String {
    if limit == libc::RLIM_INFINITY {
        "unlimited".to_string()
    } else {
        format!("{limit} {unit}")
    }
}

fn apply(directive: LimitDirective) {
    let resource = directive.resource;
    let lim = directive.limit.unwrap_or(libc::RLIM_INFINITY);
    let wanted = describe(lim, resource.unit());

    if resource == Resource::FileSize {
        // Oversized writes fail with EFBIG instead of killing the process.
        // SAFETY: installing SIG_IGN has no handler code to race with.
        unsafe { libc::signal(libc::SIGXFSZ, libc::SIG_IGN) };
    }

    let rlim = libc::rlimit { rlim_cur: lim, rlim_max: lim };
    // SAFETY: rlim is valid, resource is a valid constant.
    if unsafe { libc::setrlimit(resource.raw(), &rlim) } != 0 {
        log::warn!(
            "[sandbox] Failed to set {} to {wanted}: {}",
            resource.name(),
            std::io::Error::last_os_error()
        );
    }

    match current(resource) {
        Some(effective) => log::info!(
            "[sandbox] {} is {} after setting it to {wanted}",
            resource.name(),
            describe(effective, resource.unit())
        ),
        None => log::warn!("[sandbox] Failed to read back {}", resource.name()),
    }
}

/// Current hard limit of `resource`; `RLIM_INFINITY` when unlimited.
pub fn current(resource: Resource) -> Option<u64> {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: rlim is a valid out-pointer.
    if unsafe { libc::getrlimit(resource.raw(), &mut rlim) } == 0 {
        Some(rlim.rlim_max)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_and_setconfig_forms() {
        assert_eq!(
            parse(&["limit_cpu", "30"]),
            Some(Ok(LimitDirective { resource: Resource::CpuTime, limit: Some(30) }))
        );
        assert_eq!(
            parse(&["setconfig", "limit_virt_mem_mb", "2"]),
            Some(Ok(LimitDirective { resource: Resource::AddressSpace, limit: Some(2 * 1024 * 1024) }))
        );
    }

    #[test]
    fn test_non_positive_means_unlimited() {
        assert_eq!(
            parse(&["limit_nofile", "0"]),
            Some(Ok(LimitDirective { resource: Resource::OpenFiles, limit: None }))
        );
        assert_eq!(
            parse(&["limit_core", "-1"]),
            Some(Ok(LimitDirective { resource: Resource::CoreSize, limit: None }))
        );
    }

    #[test]
    fn test_unrelated_commands_are_not_recognized() {
        assert_eq!(parse(&["save", "now"]), None);
        assert_eq!(parse(&["limit_cpu"]), None);
        assert_eq!(parse(&["setconfig", "limit_bogus", "1"]), None);
        assert!(!handle_setrlimit_command(&["hello", "world"]));
        assert!(!handle_directive_line(""));
    }

    #[test]
    fn test_bad_value_is_recognized_but_not_applied() {
        assert!(matches!(parse(&["limit_cpu", "soon"]), Some(Err(_))));
        assert!(handle_setrlimit_command(&["limit_cpu", "soon"]));
    }

    #[test]
    fn test_raising_to_current_limit_is_harmless() {
        // Re-applying the current hard limit never lowers anything for the test run.
        let nofile = current(Resource::OpenFiles).unwrap();
        let line = if nofile == libc::RLIM_INFINITY {
            "limit_nofile 0".to_string()
        } else {
            format!("limit_nofile {nofile}")
        };
        assert!(handle_directive_line(&line));
        assert_eq!(current(Resource::OpenFiles), Some(nofile));
    }
}
