//! # Engine Gate
//!
//! Single-slot, first-come-first-served admission to the recognition engine.
//!
//! ## How exclusivity is enforced:
//! The gate owns the engine behind a `tokio::sync::Mutex`, whose waiters are queued
//! and woken in the order they called `lock()`. `acquire()` hands out an
//! [`EnginePermit`] wrapping the owned guard; the permit is the only way to reach
//! the engine, and dropping it is the release. There is no separate release call to
//! forget, so every exit path (normal, error, panic, cancelled future) gives the
//! token back.
//!
//! ## Poisoning:
//! After a fatal engine failure the gate is poisoned. Queued and future acquirers get
//! [`GateError::Poisoned`] instead of the engine, and [`EngineGate::poisoned`]
//! resolves so the process can shut down.

use crate::error::GateError;
use crate::transcription::RecognitionEngine;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, error};
use uuid::Uuid;

type BoxedEngine = Box<dyn RecognitionEngine>;

/// Exclusive-access scheduler owning the process-wide engine instance.
pub struct EngineGate {
    engine: Arc<Mutex<BoxedEngine>>,
    held: AtomicBool,
    waiting: AtomicUsize,
    poisoned: AtomicBool,
    poison_reason: StdMutex<Option<String>>,
    poison_notify: Notify,
}

impl EngineGate {
    /// Create the gate around the engine. Called once at startup.
    pub fn new(engine: BoxedEngine) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(Mutex::new(engine)),
            held: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
            poison_reason: StdMutex::new(None),
            poison_notify: Notify::new(),
        })
    }

    /// Wait, without a deadline, until the token is free and take it.
    pub async fn acquire(self: &Arc<Self>, session_id: Uuid) -> Result<EnginePermit, GateError> {
        self.acquire_inner(session_id, None).await
    }

    /// Like [`acquire`](Self::acquire), but give up once `deadline` has elapsed.
    ///
    /// A waiter that times out leaves the queue without disturbing the order of the others.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        session_id: Uuid,
        deadline: Duration,
    ) -> Result<EnginePermit, GateError> {
        self.acquire_inner(session_id, Some(deadline)).await
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        session_id: Uuid,
        deadline: Option<Duration>,
    ) -> Result<EnginePermit, GateError> {
        if let Some(reason) = self.poison_reason() {
            return Err(GateError::Poisoned(reason));
        }

        let queued_at = Instant::now();
        let waiting = WaitingGuard::enter(&self.waiting);
        let lock = Arc::clone(&self.engine).lock_owned();
        let guard = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, lock)
                .await
                .map_err(|_| GateError::Timeout(deadline))?,
            None => lock.await,
        };
        drop(waiting);

        // Checked again after the wait: the previous holder may have poisoned the gate.
        // Returning drops the guard, which passes the token to the next waiter in line.
        if let Some(reason) = self.poison_reason() {
            return Err(GateError::Poisoned(reason));
        }

        let already_held = self.held.swap(true, Ordering::SeqCst);
        debug_assert!(!already_held, "engine gate handed out twice");

        debug!(
            session_id = %session_id,
            waited_ms = queued_at.elapsed().as_millis() as u64,
            "engine gate acquired"
        );

        Ok(EnginePermit {
            guard,
            gate: Arc::clone(self),
            session_id,
            acquired_at: Instant::now(),
        })
    }

    /// Whether some session currently holds the token.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Number of sessions blocked in `acquire`.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Mark the engine unusable. Only the first reason is kept.
    pub fn poison(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.poison_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        self.poisoned.store(true, Ordering::SeqCst);
        error!(reason = %reason, "engine gate poisoned");
        self.poison_notify.notify_waiters();
    }

    /// Resolves with the poison reason once the gate is poisoned.
    pub async fn poisoned(&self) -> String {
        loop {
            // Registered before the check so a concurrent `poison` cannot slip between them.
            let notified = self.poison_notify.notified();
            if let Some(reason) = self.poison_reason() {
                return reason;
            }
            notified.await;
        }
    }

    fn poison_reason(&self) -> Option<String> {
        if !self.is_poisoned() {
            return None;
        }
        self.poison_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for EngineGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineGate")
            .field("held", &self.is_held())
            .field("waiting", &self.waiting())
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

/// Counts a task as waiting for as long as it sits in `acquire`, including when the
/// wait is abandoned by a timeout or a dropped future.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The gate token. Dereferences to the engine; dropping it releases the gate.
pub struct EnginePermit {
    guard: OwnedMutexGuard<BoxedEngine>,
    gate: Arc<EngineGate>,
    session_id: Uuid,
    acquired_at: Instant,
}

impl EnginePermit {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Poison the gate while still holding it, so the next waiter in line is refused.
    pub fn poison(&self, reason: impl Into<String>) {
        self.gate.poison(reason);
    }
}

impl Deref for EnginePermit {
    type Target = dyn RecognitionEngine;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for EnginePermit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for EnginePermit {
    fn drop(&mut self) {
        // A panic inside an engine call leaves the engine in an unknown state.
        if std::thread::panicking() {
            self.gate.poison(format!("engine panicked during session {}", self.session_id));
        }
        // Cleared before the guard field drops, so the next holder never sees it set.
        self.gate.held.store(false, Ordering::SeqCst);
        debug!(
            session_id = %self.session_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "engine gate released"
        );
    }
}

impl fmt::Debug for EnginePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePermit")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
