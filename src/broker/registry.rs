//! Top-level document → broker map.
//!
//! One coarse lock guards the map and is held only for lookup and insert.
//! Each broker is pinned to one document engine, chosen round-robin when the
//! broker is created; everything else about the broker happens on that
//! engine's thread.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::{BrokerState, BrokerSummary, DocumentBroker, SharedBroker};
use crate::auth::AuthDecision;
use crate::context::ProcessContext;
use crate::error::Error;
use crate::poll::{PollContext, PollHandle};
use crate::relay::protocol::{DisconnectReason, Frame};
use crate::socket::Stream;

/// A client that sent a valid join and is waiting to be admitted.
#[derive(Debug)]
pub struct PendingJoin {
    /// Requested document.
    pub document: String,
    /// Authorization outcome for the join token.
    pub decision: AuthDecision,
    /// The client connection.
    pub stream: Stream,
    /// Bytes received after the join frame.
    pub leftover: Vec<u8>,
}

#[derive(Debug)]
struct Entry {
    broker: SharedBroker,
    engine: PollHandle,
}

#[derive(Debug)]
struct Inner {
    process: Arc<ProcessContext>,
    engines: Vec<PollHandle>,
    next_engine: AtomicUsize,
    brokers: Mutex<HashMap<String, Entry>>,
}

/// Shared registry of open documents.
#[derive(Debug, Clone)]
pub struct BrokerRegistry {
    inner: Arc<Inner>,
}

impl BrokerRegistry {
    /// Create a registry placing brokers on `engines`.
    ///
    /// # Panics
    ///
    /// If `engines` is empty.
    pub fn new(process: Arc<ProcessContext>, engines: Vec<PollHandle>) -> Self {
        assert!(!engines.is_empty(), "broker registry needs at least one engine");
        Self {
            inner: Arc::new(Inner {
                process,
                engines,
                next_engine: AtomicUsize::new(0),
                brokers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Hand a joined client to the broker for its document, creating the
    /// broker if there is none. Safe to call from any thread.
    pub fn dispatch(&self, join: PendingJoin) {
        self.dispatch_inner(join, false);
    }

    fn dispatch_inner(&self, join: PendingJoin, retried: bool) {
        let (broker, engine, created) = self.lookup_or_create(&join.document);
        let document = join.document.clone();

        if created {
            let registry = self.clone();
            let broker = Arc::clone(&broker);
            let accepted = engine.add_callback(move |ctx| registry.start_broker(ctx, broker, document));
            if !accepted {
                log::warn!("[registry] Engine {} is stopped", engine.name());
            }
        }

        let registry = self.clone();
        let pending = Arc::new(Mutex::new(Some(join)));
        let slot = Arc::clone(&pending);
        let accepted = engine.add_callback(move |ctx| {
            if let Some(join) = slot.lock().expect("pending join mutex poisoned").take() {
                registry.admit(ctx, &broker, join, retried);
            }
        });
        if !accepted {
            if let Some(join) = pending.lock().expect("pending join mutex poisoned").take() {
                reject(join.stream, &Error::rejected(DisconnectReason::ServerShuttingDown, "server is shutting down"));
            }
        }
    }

    fn lookup_or_create(&self, document: &str) -> (SharedBroker, PollHandle, bool) {
        let mut brokers = self.inner.brokers.lock().expect("broker registry mutex poisoned");
        if let Some(entry) = brokers.get(document) {
            return (Arc::clone(&entry.broker), entry.engine.clone(), false);
        }
        let index = self.inner.next_engine.fetch_add(1, Ordering::Relaxed) % self.inner.engines.len();
        let engine = self.inner.engines[index].clone();
        let broker = DocumentBroker::create(Arc::clone(&self.inner.process), document, Instant::now());
        log::info!("[registry] Opening {document} on engine {}", engine.name());
        brokers.insert(
            document.to_string(),
            Entry {
                broker: Arc::clone(&broker),
                engine: engine.clone(),
            },
        );
        (broker, engine, true)
    }

    /// Runs on the broker's engine: spawn its worker and install its tick.
    fn start_broker(&self, ctx: &mut PollContext, broker: SharedBroker, document: String) {
        broker.lock().expect("broker mutex poisoned").start(ctx);

        let registry = self.clone();
        ctx.add_housekeeping(move |ctx| {
            let destroyed = {
                let mut b = broker.lock().expect("broker mutex poisoned");
                b.tick(ctx);
                b.state() == BrokerState::Destroyed
            };
            if destroyed {
                registry.retire(&document, &broker);
            }
            !destroyed
        });
    }

    /// Runs on the broker's engine: admit, or reject with a reason. A broker
    /// that started unloading in the meantime is retired and the join is
    /// retried once against a fresh broker. If that one is unloading too
    /// because its worker failed, the client is told why.
    fn admit(&self, ctx: &mut PollContext, broker: &SharedBroker, join: PendingJoin, retried: bool) {
        let mut b = broker.lock().expect("broker mutex poisoned");
        match b.check_admission(join.decision) {
            Ok(()) => {
                if let Err(e) = b.add_session(ctx, join.stream, &join.leftover, join.decision) {
                    log::warn!("[registry] Could not attach client to {}: {e}", join.document);
                }
            }
            Err(e) if e.disconnect_reason() == DisconnectReason::DocumentUnloading && !retried => {
                drop(b);
                self.retire(&join.document, broker);
                self.dispatch_inner(join, true);
            }
            Err(e) => {
                let e = match b.unload_cause() {
                    Some((reason, message)) if e.disconnect_reason() == DisconnectReason::DocumentUnloading => {
                        Error::rejected(reason, message)
                    }
                    _ => e,
                };
                log::info!("[registry] Rejected join for {}: {e}", join.document);
                reject(join.stream, &e);
            }
        }
    }

    /// Drop `broker` from the map if it is still the entry for `document`.
    fn retire(&self, document: &str, broker: &SharedBroker) {
        let mut brokers = self.inner.brokers.lock().expect("broker registry mutex poisoned");
        if brokers.get(document).is_some_and(|e| Arc::ptr_eq(&e.broker, broker)) {
            brokers.remove(document);
            log::debug!("[registry] Retired broker for {document}");
        }
    }

    /// Number of documents with a broker.
    pub fn len(&self) -> usize {
        self.inner.brokers.lock().expect("broker registry mutex poisoned").len()
    }

    /// Whether no document is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The broker currently serving `document`.
    pub fn get(&self, document: &str) -> Option<SharedBroker> {
        let brokers = self.inner.brokers.lock().expect("broker registry mutex poisoned");
        brokers.get(document).map(|e| Arc::clone(&e.broker))
    }

    /// Per-document snapshot, sorted by document.
    pub fn summaries(&self) -> Vec<BrokerSummary> {
        let brokers: Vec<SharedBroker> = {
            let map = self.inner.brokers.lock().expect("broker registry mutex poisoned");
            map.values().map(|e| Arc::clone(&e.broker)).collect()
        };
        let mut out: Vec<BrokerSummary> = brokers
            .iter()
            .map(|b| b.lock().expect("broker mutex poisoned").summary())
            .collect();
        out.sort_by(|a, b| a.document.cmp(&b.document));
        out
    }

    /// Ask every broker to disconnect its sessions with `reason` and unload.
    pub fn close_all(&self, reason: DisconnectReason) {
        let entries: Vec<(SharedBroker, PollHandle)> = {
            let map = self.inner.brokers.lock().expect("broker registry mutex poisoned");
            map.values().map(|e| (Arc::clone(&e.broker), e.engine.clone())).collect()
        };
        for (broker, engine) in entries {
            engine.add_callback(move |ctx| {
                broker.lock().expect("broker mutex poisoned").close_all(ctx, reason);
            });
        }
    }
}

/// Tell a client why it was not admitted and close it.
pub(crate) fn reject(mut stream: Stream, err: &Error) {
    let notice = Frame::error(err.disconnect_reason(), err.to_string());
    if let Err(e) = stream.write_all(&notice.encode()) {
        log::debug!("[registry] Could not deliver rejection: {e}");
    }
    stream.shutdown();
}
