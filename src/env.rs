//! Runtime environment detection.
//!
//! A single source of truth for the runtime environment (test, development,
//! production), read from the `COLLABD_ENV` environment variable.
//!
//! # Usage
//!
//! ```rust
//! use collabd::env::Environment;
//!
//! if Environment::current().sandbox_required() {
//!     // refuse to run workers without seccomp
//! }
//! ```
//!
//! # Environment Variable
//!
//! Set `COLLABD_ENV` to one of:
//! - `test` - Test mode (sandbox optional, short timers allowed, allow-all auth)
//! - `development` or `dev` - Development mode (sandbox optional)
//! - (anything else or unset) - Production mode

/// Environment variable holding the runtime environment name.
pub const ENV_VAR: &str = "COLLABD_ENV";

/// Runtime environment for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment.
    Test,
}

impl Environment {
    /// Detect current environment from `COLLABD_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var(ENV_VAR).ok().as_deref())
    }

    /// Map a raw variable value to an environment. Unknown values mean production.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("development") | Some("dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    /// Returns `true` if this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }

    /// Whether an unavailable syscall sandbox must abort startup.
    ///
    /// Only production treats a missing sandbox as fatal; development and
    /// test builds log a warning and carry on unsandboxed.
    #[must_use]
    pub fn sandbox_required(self) -> bool {
        self.is_production()
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience function to check if running in test mode.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_values() {
        assert_eq!(Environment::parse(Some("test")), Environment::Test);
        assert_eq!(Environment::parse(Some("dev")), Environment::Development);
        assert_eq!(Environment::parse(Some("development")), Environment::Development);
    }

    #[test]
    fn test_unknown_or_unset_is_production() {
        assert_eq!(Environment::parse(None), Environment::Production);
        assert_eq!(Environment::parse(Some("staging")), Environment::Production);
        assert_eq!(Environment::parse(Some("")), Environment::Production);
    }

    #[test]
    fn test_sandbox_required_only_in_production() {
        assert!(Environment::Production.sandbox_required());
        assert!(!Environment::Development.sandbox_required());
        assert!(!Environment::Test.sandbox_required());
    }

    #[test]
    fn test_display() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Test.to_string(), "test");
    }
}
