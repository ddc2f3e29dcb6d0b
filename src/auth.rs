//! Session authorization.
//!
//! The broker asks an [`Authorizer`] whether a token may open a document and
//! whether the resulting session is view-only. Real deployments plug in their
//! own check; two simple implementations ship here.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthDecision {
    /// Whether the session may attach.
    pub allowed: bool,
    /// Whether the session may only observe.
    pub view_only: bool,
}

impl AuthDecision {
    /// Full edit access.
    pub const EDIT: Self = Self { allowed: true, view_only: false };
    /// Read-only access.
    pub const VIEW: Self = Self { allowed: true, view_only: true };
    /// Access denied.
    pub const DENY: Self = Self { allowed: false, view_only: false };
}

/// Decides whether `token` may open `document`.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Check a token against a document identifier.
    fn authorize(&self, document: &str, token: &str) -> AuthDecision;
}

/// Accepts every token with edit access. Development and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _document: &str, _token: &str) -> AuthDecision {
        AuthDecision::EDIT
    }
}

/// What a configured token grants.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TokenGrant {
    /// Documents the token may open. Empty means any document.
    pub documents: Vec<String>,
    /// Sessions opened with this token are view-only.
    pub view_only: bool,
}

/// Static token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    grants: HashMap<String, TokenGrant>,
}

impl TokenAuthorizer {
    /// Build from a token → grant table.
    pub fn new(grants: HashMap<String, TokenGrant>) -> Self {
        Self { grants }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, document: &str, token: &str) -> AuthDecision {
        let Some(grant) = self.grants.get(token) else {
            return AuthDecision::DENY;
        };
        if !grant.documents.is_empty() && !grant.documents.iter().any(|d| d == document) {
            return AuthDecision::DENY;
        }
        if grant.view_only {
            AuthDecision::VIEW
        } else {
            AuthDecision::EDIT
        }
    }
}
