//! Async call layer
//!
//! A call is a routine pointer plus six machine words, copied by value
//! into the target context's ring and executed there by
//! [`Context::handle_calls`]. Nothing is allocated per call.
//!
//! Wakeup protocol (see `weave_core::status`):
//!
//! ```text
//!   consumer (target)                     producer (caller)
//!   publish(Waiting|Polling, head)        pos = ring.enqueue(frame)
//!   fence(SeqCst)                         fence(SeqCst)
//!   re-check ring; sleep if empty         status == sleeping @ pos ? wake
//! ```
//!
//! `call_N` retries until the ring accepts the frame, `trycall_N` gives
//! up with [`WeaveError::RingFull`], and `post_N` picks any peer that is
//! not running (or runs the routine in place when every peer is busy).

use std::fmt;

use weave_core::constants::CALL_ARGS;
use weave_core::{ContextState, WeaveError, WeaveResult};

use crate::context::{Context, Counters};
use crate::parking::ContextParking;
use crate::tls;

/// A routine executed on the target context
pub type CallRoutine = fn(&Context, &[usize; CALL_ARGS]);

/// One ring slot's payload
#[derive(Clone, Copy)]
pub struct CallFrame {
    pub routine: CallRoutine,
    pub args: [usize; CALL_ARGS],
}

impl fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallFrame({:p}, {:x?})", self.routine as *const (), self.args)
    }
}

/// Widen up to six words into a full argument array
#[inline]
pub fn pack<const N: usize>(words: [usize; N]) -> [usize; CALL_ARGS] {
    const { assert!(N <= CALL_ARGS) };
    let mut args = [0; CALL_ARGS];
    args[..N].copy_from_slice(&words);
    args
}

/// What a caller does while the target's ring is full
fn ring_full_backoff() {
    match tls::context() {
        Some(me) => {
            // Drain our own ring so two contexts calling each other
            // cannot both sit on full rings.
            if !me.in_calls.get() {
                me.handle_calls();
            }
            me.strand().yield_now();
            std::thread::yield_now();
        }
        None => std::thread::yield_now(),
    }
}

impl Context {
    /// Enqueue a call, waiting for ring space as long as needed
    pub fn call(&self, routine: CallRoutine, args: [usize; CALL_ARGS]) {
        let mut frame = CallFrame { routine, args };
        loop {
            match self.calls.try_enqueue(frame) {
                Ok(pos) => {
                    self.notify(pos);
                    return;
                }
                Err(back) => {
                    frame = back;
                    ring_full_backoff();
                }
            }
        }
    }

    /// Enqueue a call if the ring has room
    pub fn trycall(&self, routine: CallRoutine, args: [usize; CALL_ARGS]) -> WeaveResult<()> {
        match self.calls.try_enqueue(CallFrame { routine, args }) {
            Ok(pos) => {
                self.notify(pos);
                Ok(())
            }
            Err(_) => Err(WeaveError::RingFull),
        }
    }

    /// Wake the owner if it went to sleep waiting for position `pos`
    fn notify(&self, pos: usize) {
        match self.status.wakeup_needed(pos) {
            Some(ContextState::Polling) => {
                if let Err(e) = self.dispatcher().backend().notify() {
                    weave_core::kerror!("backend notify failed: {}", e);
                }
            }
            Some(ContextState::Waiting) => self.parker.unpark(),
            _ => {}
        }
    }

    /// Run every call queued so far, in arrival order. Owner only;
    /// a nested invocation returns 0.
    pub fn handle_calls(&self) -> usize {
        self.debug_assert_owner();
        if self.in_calls.replace(true) {
            return 0;
        }
        let mut handled = 0;
        while let Some(frame) = self.calls.try_dequeue() {
            (frame.routine)(self, &frame.args);
            handled += 1;
        }
        self.in_calls.set(false);
        if handled > 0 {
            Counters::add(&self.counters.calls, handled as u64);
        }
        handled
    }

    /// Send to the first peer that is not running, or run in place
    pub fn post(&self, routine: CallRoutine, args: [usize; CALL_ARGS]) {
        match self.peers().find(|p| p.status.state() != ContextState::Running) {
            Some(peer) => peer.call(routine, args),
            None => routine(self, &args),
        }
    }
}

fn current_context() -> WeaveResult<&'static Context> {
    tls::context().ok_or(WeaveError::NotOnContext)
}

macro_rules! call_family {
    ($( $call:ident, $trycall:ident, $post:ident => [$($a:ident),*]; )*) => {
        $(
            #[inline]
            pub fn $call(target: &Context, routine: CallRoutine $(, $a: usize)*) {
                target.call(routine, pack([$($a),*]));
            }

            #[inline]
            pub fn $trycall(target: &Context, routine: CallRoutine $(, $a: usize)*) -> WeaveResult<()> {
                target.trycall(routine, pack([$($a),*]))
            }

            /// Run on any non-running peer of the calling context
            #[inline]
            pub fn $post(routine: CallRoutine $(, $a: usize)*) -> WeaveResult<()> {
                current_context()?.post(routine, pack([$($a),*]));
                Ok(())
            }
        )*
    };
}

call_family! {
    call_0, trycall_0, post_0 => [];
    call_1, trycall_1, post_1 => [a0];
    call_2, trycall_2, post_2 => [a0, a1];
    call_3, trycall_3, post_3 => [a0, a1, a2];
    call_4, trycall_4, post_4 => [a0, a1, a2, a3];
    call_5, trycall_5, post_5 => [a0, a1, a2, a3, a4];
    call_6, trycall_6, post_6 => [a0, a1, a2, a3, a4, a5];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    static SUM: AtomicUsize = AtomicUsize::new(0);

    fn add_args(_ctx: &Context, args: &[usize; CALL_ARGS]) {
        SUM.fetch_add(args.iter().sum(), Ordering::SeqCst);
    }

    fn dispatcher(contexts: usize, queue: usize) -> Arc<Dispatcher> {
        Dispatcher::new(
            RuntimeConfig::new()
                .contexts(contexts)
                .async_queue_size(queue)
                .workers_min(0)
                .stack_size(64 * 1024),
        )
        .unwrap()
    }

    #[test]
    fn test_pack_widths() {
        assert_eq!(pack([]), [0; 6]);
        assert_eq!(pack([1, 2, 3]), [1, 2, 3, 0, 0, 0]);
        assert_eq!(pack([1, 2, 3, 4, 5, 6]), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_every_arity_delivers() {
        let d = dispatcher(1, 64);
        let ctx = d.context(0);
        SUM.store(0, Ordering::SeqCst);
        call_0(ctx, add_args);
        call_1(ctx, add_args, 1);
        call_2(ctx, add_args, 1, 1);
        call_3(ctx, add_args, 1, 1, 1);
        call_4(ctx, add_args, 1, 1, 1, 1);
        call_5(ctx, add_args, 1, 1, 1, 1, 1);
        call_6(ctx, add_args, 1, 1, 1, 1, 1, 1);
        let _a = ctx.attach();
        assert_eq!(ctx.handle_calls(), 7);
        assert_eq!(SUM.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_trycall_reports_full() {
        let d = dispatcher(1, 2);
        let ctx = d.context(0);
        assert!(trycall_1(ctx, add_args, 0).is_ok());
        assert!(trycall_1(ctx, add_args, 0).is_ok());
        assert_eq!(trycall_1(ctx, add_args, 0), Err(WeaveError::RingFull));
        let _a = ctx.attach();
        assert_eq!(ctx.handle_calls(), 2);
        assert!(trycall_1(ctx, add_args, 0).is_ok());
    }

    static ORDER: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    fn record(_ctx: &Context, args: &[usize; CALL_ARGS]) {
        ORDER.lock().unwrap().push((args[0], args[1]));
    }

    /// Per-producer order is preserved and every call arrives exactly once
    #[test]
    fn test_producers_exactly_once_in_order() {
        const PRODUCERS: usize = 4;
        const PER: usize = 2_000;
        let d = dispatcher(1, 64);
        ORDER.lock().unwrap().clear();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let d = d.clone();
                thread::spawn(move || {
                    for i in 0..PER {
                        call_2(d.context(0), record, p, i);
                    }
                })
            })
            .collect();

        let ctx = d.context(0);
        let _a = ctx.attach();
        let mut got = 0;
        while got < PRODUCERS * PER {
            got += ctx.handle_calls();
            thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }

        let order = ORDER.lock().unwrap();
        assert_eq!(order.len(), PRODUCERS * PER);
        let mut next = [0usize; PRODUCERS];
        for &(p, i) in order.iter() {
            assert_eq!(i, next[p], "producer {} out of order", p);
            next[p] += 1;
        }
    }

    static POSTED_ON: AtomicUsize = AtomicUsize::new(usize::MAX);

    fn where_am_i(ctx: &Context, _args: &[usize; CALL_ARGS]) {
        POSTED_ON.store(ctx.index() as usize, Ordering::SeqCst);
    }

    #[test]
    fn test_post_prefers_idle_peer_else_runs_inline() {
        let d = dispatcher(2, 16);
        // Context 1 publishes a sleeping state; context 0 posts to it.
        d.context(1).status.publish(ContextState::Waiting, 0);
        {
            let _a = d.context(0).attach();
            post_0(where_am_i).unwrap();
        }
        {
            let _a = d.context(1).attach();
            d.context(1).handle_calls();
        }
        assert_eq!(POSTED_ON.load(Ordering::SeqCst), 1);

        // Every peer running: the routine runs on the caller.
        d.context(1).status.set_running();
        {
            let _a = d.context(0).attach();
            post_0(where_am_i).unwrap();
        }
        assert_eq!(POSTED_ON.load(Ordering::SeqCst), 0);

        assert_eq!(post_0(where_am_i), Err(WeaveError::NotOnContext));
    }

    /// A context that sleeps on its parker is woken by a call
    #[test]
    fn test_call_wakes_waiting_context() {
        let d = dispatcher(1, 16);
        let sleeper = {
            let d = d.clone();
            thread::spawn(move || {
                let ctx = d.context(0);
                let _a = ctx.attach();
                let stamp = ctx.calls.dequeue_stamp();
                ctx.status.publish(ContextState::Waiting, stamp);
                if !ctx.calls.has_ready() {
                    while !ctx.parker.park(Some(std::time::Duration::from_secs(10))) {
                        if ctx.calls.has_ready() {
                            break;
                        }
                    }
                }
                ctx.status.set_running();
                ctx.handle_calls()
            })
        };
        thread::sleep(std::time::Duration::from_millis(30));
        SUM.store(0, Ordering::SeqCst);
        call_1(d.context(0), add_args, 0);
        assert_eq!(sleeper.join().unwrap(), 1);
    }
}
