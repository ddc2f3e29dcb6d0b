//! Document engine seam inside the worker.
//!
//! The real rendering engine is an external collaborator. The worker loop
//! only needs it to turn session payloads into outgoing payloads; this trait
//! is that contract, and [`EchoRenderer`] is the engine the worker ships with.

/// A payload the engine wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Target session; [`crate::relay::protocol::BROADCAST`] for all.
    pub session: u32,
    /// Opaque payload.
    pub data: Vec<u8>,
}

/// The document engine driven by the worker loop.
pub trait Renderer {
    /// A session attached.
    fn session_joined(&mut self, session: u32, view_only: bool) -> Vec<Outgoing>;

    /// A session detached.
    fn session_left(&mut self, session: u32);

    /// A session sent a payload. Called in per-session send order.
    fn handle_message(&mut self, session: u32, data: &[u8]) -> Vec<Outgoing>;

    /// Persist the document. Returns whether it succeeded.
    fn save(&mut self) -> bool;
}

/// Engine that serializes edits and broadcasts each one to every session
/// as `<session>:<payload>`.
#[derive(Debug, Default)]
pub struct EchoRenderer {
    document_id: String,
    content_len: usize,
    sessions: Vec<u32>,
    edits: u64,
    saved_edits: u64,
}

impl EchoRenderer {
    /// Create an engine for `document_id` loaded from `content`.
    pub fn new(document_id: impl Into<String>, content: &[u8]) -> Self {
        Self {
            document_id: document_id.into(),
            content_len: content.len(),
            ..Self::default()
        }
    }

    /// Edits applied since load.
    pub fn edits(&self) -> u64 {
        self.edits
    }
}

impl Renderer for EchoRenderer {
    fn session_joined(&mut self, session: u32, view_only: bool) -> Vec<Outgoing> {
        if !self.sessions.contains(&session) {
            self.sessions.push(session);
        }
        log::debug!(
            "[worker] {}: session {session} joined (view_only={view_only}, {} bytes loaded)",
            self.document_id,
            self.content_len
        );
        Vec::new()
    }

    fn session_left(&mut self, session: u32) {
        self.sessions.retain(|s| *s != session);
    }

    fn handle_message(&mut self, session: u32, data: &[u8]) -> Vec<Outgoing> {
        self.edits += 1;
        let mut out = format!("{session}:").into_bytes();
        out.extend_from_slice(data);
        vec![Outgoing { session: crate::relay::protocol::BROADCAST, data: out }]
    }

    fn save(&mut self) -> bool {
        log::info!(
            "[worker] {}: saved ({} edits since last save)",
            self.document_id,
            self.edits - self.saved_edits
        );
        self.saved_edits = self.edits;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_broadcasts_with_sender_prefix() {
        let mut r = EchoRenderer::new("doc", b"");
        let out = r.handle_message(7, b"hello");
        assert_eq!(out, vec![Outgoing { session: 0, data: b"7:hello".to_vec() }]);
        assert_eq!(r.edits(), 1);
    }

    #[test]
    fn test_save_resets_edit_window() {
        let mut r = EchoRenderer::new("doc", b"abc");
        r.handle_message(1, b"x");
        assert!(r.save());
        assert_eq!(r.saved_edits, 1);
    }
}
