//! Dispatcher: the set of contexts of one runtime and what they share
//!
//! The dispatcher owns every [`Context`], the I/O backend all listeners
//! poll through, the poll lock that elects a single poller, the epoch
//! collector for sink reclamation and the table that keeps registered
//! sinks alive. Contexts point back at it, so it is always built inside
//! an `Arc` and never moves.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use weave_core::constants::CALL_ARGS;
use weave_core::{kdebug, ContextState, EpochCollector, SpinLock, WeaveError, WeaveResult};

use crate::backend::{self, EventBackend, Interest};
use crate::call::CallRoutine;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::sink::{EventSink, SinkHandler};
use crate::tls;

pub struct Dispatcher {
    config: RuntimeConfig,
    contexts: Box<[Context]>,
    backend: Box<dyn EventBackend>,
    epoch: EpochCollector,
    poll_lock: SpinLock<()>,
    /// Registered sinks by token
    sinks: Mutex<HashMap<usize, Arc<EventSink>>>,
    me: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Validate `config` and build contexts on the platform backend
    pub fn new(config: RuntimeConfig) -> WeaveResult<Arc<Self>> {
        config.validate()?;
        let backend = backend::platform_backend()?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build on a caller-chosen backend; `config` must be valid
    pub fn with_backend(config: RuntimeConfig, backend: Box<dyn EventBackend>) -> Arc<Self> {
        kdebug!("dispatcher: {} contexts on {}", config.contexts, backend.name());
        Arc::new_cyclic(|me: &Weak<Dispatcher>| {
            let ptr = me.as_ptr();
            let contexts = (0..config.contexts as u32).map(|i| Context::new(i, ptr, &config)).collect();
            Dispatcher {
                epoch: EpochCollector::new(config.contexts),
                contexts,
                backend,
                poll_lock: SpinLock::new(()),
                sinks: Mutex::new(HashMap::new()),
                me: me.clone(),
                config,
            }
        })
    }

    #[inline]
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Context at `index`; panics when out of range
    #[inline]
    pub fn context(&self, index: u32) -> &Context {
        &self.contexts[index as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn backend(&self) -> &dyn EventBackend {
        &*self.backend
    }

    #[inline]
    pub fn epoch(&self) -> &EpochCollector {
        &self.epoch
    }

    #[inline]
    pub(crate) fn poll_lock(&self) -> &SpinLock<()> {
        &self.poll_lock
    }

    /// Register `fd` (ownership passes to the sink) with context `owner`
    pub fn register(
        &self,
        owner: u32,
        fd: RawFd,
        interest: Interest,
        pinned: bool,
        handler: Option<Arc<dyn SinkHandler>>,
    ) -> WeaveResult<Arc<EventSink>> {
        if owner as usize >= self.len() {
            return Err(WeaveError::WrongContext);
        }
        let sink = EventSink::new(owner, fd, interest, pinned, handler, self.me.clone());
        let token = sink.token();
        self.sinks_locked().insert(token, sink.clone());
        if let Err(e) = self.backend.register(fd, token, interest) {
            self.sinks_locked().remove(&token);
            return Err(e.into());
        }
        Ok(sink)
    }

    /// Drop the table's reference to a retired sink. False while an
    /// event for it is still in flight.
    pub(crate) fn free_sink(&self, token: usize) -> bool {
        let mut sinks = self.sinks_locked();
        match sinks.get(&token) {
            Some(sink) if sink.in_flight() => false,
            Some(_) => {
                sinks.remove(&token);
                true
            }
            None => true,
        }
    }

    pub fn sinks_registered(&self) -> usize {
        self.sinks_locked().len()
    }

    fn sinks_locked(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Arc<EventSink>>> {
        self.sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask every context to stop
    pub fn stop(&self) {
        for ctx in self.contexts.iter() {
            ctx.stop();
        }
    }

    /// Run a routine on some context that is not busy, from any thread.
    ///
    /// From one of this dispatcher's contexts this is [`Context::post`]:
    /// with every peer running, the routine runs in place. A foreign
    /// thread has no context to run it on, so it queues on context 0.
    pub fn post(&self, routine: CallRoutine, args: [usize; CALL_ARGS]) {
        if let Some(me) = tls::context().filter(|c| core::ptr::eq(c.dispatcher(), self)) {
            me.post(routine, args);
            return;
        }
        let target = self
            .contexts
            .iter()
            .find(|c| c.status().state() != ContextState::Running)
            .unwrap_or(&self.contexts[0]);
        target.call(routine, args);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("contexts", &self.contexts.len())
            .field("backend", &self.backend.name())
            .field("epoch", &self.epoch.global())
            .field("sinks", &self.sinks_registered())
            .finish()
    }
}
