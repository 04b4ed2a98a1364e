//! Callback-driven event loop over the WASI `poll_oneoff` primitive.
//!
//! The loop multiplexes three event sources through one bounded wait per
//! tick: fd readiness (batched subscriptions), absolute-time timers (an
//! intrusive min-heap whose minimum bounds the wait via batch slot 0), and
//! cross-thread async wakeups (a pair of flags per notification).
//!
//! # Safety / Ownership
//!
//! [`Completion`] values must have a stable address while the loop holds
//! them: from [`Loop::add`] until the terminal callback returns
//! [`CallbackAction::Disarm`]. The loop identifies completions in poll
//! events via `userdata` (`Completion*` cast to `u64`).
//!
//! All loop operations except [`Loop::async_notify`] must run on the thread
//! that owns the loop; callbacks run inline on that thread from within
//! [`Loop::tick`].

mod batch;
mod completion;
mod host;

use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::io;

use crate::stdx::{Heap, Queue};

pub use batch::Batch;
pub use completion::{
    AcceptError, AsyncError, Callback, CallbackAction, CancelError, CloseError, Completion,
    INLINE_BUFFER_LEN, OpResult, Operation, ReadBuffer, ReadError, ShutdownError, ShutdownHow,
    State, Timer, TimerTrigger, WriteBuffer, WriteError, noop_callback,
};

use completion::{LoopTag, TimerTag};

/// How much of the pending work one `run` call processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Drain whatever is ready and return without waiting.
    NoWait,
    /// Wait until at least one completion has been dispatched.
    Once,
    /// Tick until the loop owns no completions (or is stopped).
    UntilDone,
}

/// The event loop. See the module docs for the ownership rules.
pub struct Loop {
    /// Completions added but not yet routed by `start`. Not counted in
    /// `active`.
    submissions: Queue<Completion, LoopTag>,
    /// Parked `async_wait` completions.
    async_waiters: Queue<Completion, LoopTag>,
    /// Pending timers, keyed by absolute monotonic deadline.
    timers: Heap<Timer, TimerTag>,
    /// Subscriptions for this tick's poll; slot 0 is the clock.
    batch: Batch,
    /// Completions owned by the loop and not yet dispatched: in the batch,
    /// the timer heap, or the async waiter list.
    active: usize,
    /// Loop-wide wakeup: makes the next poll return promptly. The per-waiter
    /// flag on each completion identifies which waiter to retire.
    wakeup: AtomicBool,
    stopped: bool,
}

impl Loop {
    /// Creates an empty loop. `entries` sizes the timer heap's backing
    /// storage and is otherwise advisory.
    pub fn new(entries: u32) -> Self {
        Self {
            submissions: Queue::init(),
            async_waiters: Queue::init(),
            timers: Heap::with_capacity(entries as usize),
            batch: Batch::new(),
            active: 0,
            wakeup: AtomicBool::new(false),
            stopped: false,
        }
    }

    /// True when the loop owns no completions and nothing awaits submission.
    #[inline]
    pub fn done(&self) -> bool {
        self.active == 0 && self.submissions.is_empty()
    }

    /// Stops the loop: the current tick dispatches nothing further and
    /// `run(UntilDone)` returns even while completions are still owned.
    pub fn stop(&mut self) {
        log::debug!("loop stopped with {} active completions", self.active);
        self.stopped = true;
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Hands a completion to the loop. Never blocks; routing happens at the
    /// next tick's submission drain. Loop-thread only.
    ///
    /// # Panics
    ///
    /// Panics if the completion is not in the `Dead` state.
    pub fn add(&mut self, completion: &mut Completion) {
        assert!(completion.is_dead(), "add: completion still in use");
        assert!(!completion.link.is_linked());

        completion.state = State::Adding;
        self.submissions.push(completion);
    }

    /// Initializes `completion` as a timer firing `next_ms` milliseconds from
    /// now and adds it.
    ///
    /// # Panics
    ///
    /// Panics if the completion is not in the `Dead` state.
    pub fn timer(
        &mut self,
        completion: &mut Completion,
        next_ms: u64,
        userdata: *mut c_void,
        callback: Callback,
    ) -> io::Result<()> {
        assert!(completion.is_dead(), "timer: completion still in use");

        let now = host::clock_now()?;
        let deadline_ns = now.saturating_add(next_ms.saturating_mul(host::NS_PER_MS));

        completion.op = Operation::Timer(Timer::new(deadline_ns));
        completion.userdata = userdata;
        completion.callback = callback;

        self.add(completion);
        Ok(())
    }

    /// Wakes an `async_wait` completion. The only loop operation that is safe
    /// from any thread; idempotent and lock-free. Calling it N times before
    /// the next tick yields exactly one dispatch.
    ///
    /// # Panics
    ///
    /// Panics if the completion's operation is not `async_wait`.
    pub fn async_notify(&self, completion: &Completion) {
        assert!(matches!(completion.op, Operation::AsyncWait));

        // Per-waiter flag first: when the loop observes the loop-wide flag,
        // the waiter to retire is already identifiable.
        completion.wakeup.store(true, Ordering::SeqCst);
        self.wakeup.store(true, Ordering::SeqCst);
    }

    /// Runs the loop in the given mode.
    pub fn run(&mut self, mode: RunMode) -> io::Result<()> {
        match mode {
            RunMode::NoWait => self.tick(0),
            RunMode::Once => self.tick(1),
            RunMode::UntilDone => {
                while !self.done() && !self.stopped {
                    self.tick(1)?;
                }
                Ok(())
            }
        }
    }

    /// Advances the loop, dispatching at least `wait` completions (0 means
    /// "drain whatever is ready and return").
    ///
    /// Only unrecoverable host failures (clock, poll) return an error; every
    /// per-operation error is delivered through its completion's callback.
    pub fn tick(&mut self, wait: u32) -> io::Result<()> {
        // Drain a local copy of the submission FIFO: callbacks may add more
        // work, which must wait for the next tick rather than extend this
        // drain forever.
        let mut queued = self.submissions.take();
        while let Some(mut ptr) = queued.pop() {
            // SAFETY: queued completions are loaned to the loop with stable
            // addresses.
            let completion = unsafe { ptr.as_mut() };
            match completion.state() {
                State::Adding => self.start(completion),
                // A cancellation raced this submission; finalize it now that
                // it is unlinked.
                State::Deleting => completion.state = State::Dead,
                _ => {}
            }
        }

        if self.active == 0 {
            return Ok(());
        }

        let mut wait_rem = wait as usize;
        while self.active > 0 && (wait == 0 || wait_rem > 0) {
            if self.stopped {
                break;
            }

            let now = host::clock_now()?;

            // Expired timers fire first, in deadline order.
            loop {
                let Some(min) = self.timers.peek() else { break };
                // SAFETY: heap entries are timers embedded in loaned
                // completions.
                let (deadline_ns, completion_ptr) = {
                    let timer = unsafe { min.as_ref() };
                    (timer.deadline_ns(), timer.completion)
                };
                if !(deadline_ns < now) {
                    break;
                }

                let removed = self.timers.delete_min();
                assert!(removed == Some(min));
                assert!(!completion_ptr.is_null());

                // SAFETY: the back-pointer was set when the timer started.
                let completion = unsafe { &mut *completion_ptr };
                assert!(completion.state() == State::Active);

                completion.state = State::Dead;
                self.active -= 1;
                wait_rem = wait_rem.saturating_sub(1);

                let action = (completion.callback)(
                    completion.userdata,
                    self,
                    completion_ptr,
                    OpResult::Timer(TimerTrigger::Expiration),
                );
                match action {
                    // SAFETY: a rearmed completion stays loaned out.
                    CallbackAction::Rearm => self.start(unsafe { &mut *completion_ptr }),
                    CallbackAction::Disarm => {}
                }
            }

            // Then async waiters whose notification has arrived.
            if !self.async_waiters.is_empty() && self.wakeup.swap(false, Ordering::SeqCst) {
                let mut waiters = self.async_waiters.take();
                log::trace!("tick: servicing {} async waiters", waiters.len());

                while let Some(mut ptr) = waiters.pop() {
                    // SAFETY: waiters are loaned completions.
                    let completion = unsafe { ptr.as_mut() };
                    assert!(completion.state() == State::Active);

                    if !completion.wakeup.load(Ordering::SeqCst) {
                        // Not this waiter; park it again.
                        self.async_waiters.push(completion);
                        continue;
                    }

                    // Clear before dispatch so a rearmed waiter waits for a
                    // fresh notification.
                    completion.wakeup.store(false, Ordering::SeqCst);
                    completion.state = State::Dead;
                    self.active -= 1;

                    let completion_ptr = ptr.as_ptr();
                    let action = (completion.callback)(
                        completion.userdata,
                        self,
                        completion_ptr,
                        OpResult::AsyncWait(Ok(())),
                    );
                    match action {
                        // SAFETY: a rearmed completion stays loaned out.
                        CallbackAction::Rearm => self.start(unsafe { &mut *completion_ptr }),
                        CallbackAction::Disarm => {}
                    }
                }
            }

            if self.active == 0 {
                break;
            }

            // Slot 0 bounds the wait: the earliest timer deadline while this
            // tick still needs to wait, else `now` as a zero-timeout probe
            // (the host returns promptly for a past absolute deadline).
            let deadline_ns = match self.timers.peek() {
                // SAFETY: heap entries are loaned timers.
                Some(min) if wait_rem > 0 => unsafe { min.as_ref() }.deadline_ns(),
                _ => now,
            };
            self.batch.set_clock(host::clock_subscription(deadline_ns));

            let mut events = [MaybeUninit::<wasi::Event>::uninit(); Batch::CAPACITY];
            let n = host::poll(self.batch.slots(), &mut events)?;
            log::trace!(
                "tick: poll returned {n} events for {} subscriptions",
                self.batch.len()
            );

            for slot in events[..n].iter() {
                // SAFETY: the host initialized the first `n` events.
                let event = unsafe { *slot.as_ptr() };
                if event.userdata == 0 {
                    // The loop's own clock slot.
                    continue;
                }

                let completion_ptr = event.userdata as usize as *mut Completion;
                // SAFETY: userdata of every user subscription is the address
                // of a loaned completion.
                let completion = unsafe { &mut *completion_ptr };
                assert!(completion.state() == State::Active);
                assert!(completion.batch_idx > 0);

                completion.state = State::InProgress;
                self.batch.put(completion);
                self.active -= 1;

                // Readiness has fired; run the blocking half now.
                let result = completion.perform();
                completion.state = State::Dead;

                let action =
                    (completion.callback)(completion.userdata, self, completion_ptr, result);
                match action {
                    // SAFETY: a rearmed completion stays loaned out.
                    CallbackAction::Rearm => self.start(unsafe { &mut *completion_ptr }),
                    CallbackAction::Disarm => {}
                }
            }

            if wait == 0 {
                break;
            }
            wait_rem = wait_rem.saturating_sub(n);
        }

        #[cfg(debug_assertions)]
        self.check_invariants();

        Ok(())
    }

    /// Routes a drained (or rearmed) completion into its per-kind structure,
    /// or completes it synchronously.
    fn start(&mut self, completion: &mut Completion) {
        assert!(!completion.link.is_linked());

        enum Route {
            Cancel(NonNull<Completion>),
            Io,
            Shutdown(wasi::Fd, ShutdownHow),
            Close(wasi::Fd),
            Timer,
            AsyncWait,
        }

        let route = match completion.op {
            Operation::Cancel { target } => Route::Cancel(target),
            Operation::Accept { .. }
            | Operation::Read { .. }
            | Operation::Write { .. }
            | Operation::Recv { .. }
            | Operation::Send { .. } => Route::Io,
            Operation::Shutdown { fd, how } => Route::Shutdown(fd, how),
            Operation::Close { fd } => Route::Close(fd),
            Operation::Timer(_) => Route::Timer,
            Operation::AsyncWait => Route::AsyncWait,
        };

        let sync_result = match route {
            Route::Io => match self.batch.get(completion) {
                Ok(slot) => {
                    *slot = completion.subscription();
                    None
                }
                Err(batch::BatchFull) => {
                    log::debug!("start: batch full, refusing submission synchronously");
                    Some(completion.batch_full_result())
                }
            },
            Route::Timer => {
                let completion_ptr = completion as *mut Completion;
                let Operation::Timer(timer) = &mut completion.op else {
                    unreachable!()
                };
                timer.completion = completion_ptr;
                self.timers.insert(timer);
                None
            }
            Route::AsyncWait => {
                self.async_waiters.push(completion);
                None
            }
            Route::Shutdown(fd, how) => Some(OpResult::Shutdown(
                host::shutdown(fd, how.sdflags()).map_err(ShutdownError::Unexpected),
            )),
            Route::Close(fd) => Some(OpResult::Close(
                host::close(fd).map_err(CloseError::Unexpected),
            )),
            Route::Cancel(target) => {
                // SAFETY: cancel targets are loaned completions.
                if matches!(unsafe { target.as_ref() }.op, Operation::Cancel { .. }) {
                    Some(OpResult::Cancel(Err(CancelError::InvalidOp)))
                } else {
                    self.stop_completion(target);
                    Some(OpResult::Cancel(Ok(())))
                }
            }
        };

        match sync_result {
            None => {
                completion.state = State::Active;
                self.active += 1;
            }
            Some(result) => {
                // Synchronous completion: deliver now. A rearm goes through
                // `add`, deferring to the next tick rather than re-entering
                // this frame.
                completion.state = State::Dead;
                let completion_ptr = completion as *mut Completion;
                let action =
                    (completion.callback)(completion.userdata, self, completion_ptr, result);
                match action {
                    // SAFETY: a rearmed completion stays loaned out.
                    CallbackAction::Rearm => self.add(unsafe { &mut *completion_ptr }),
                    CallbackAction::Disarm => {}
                }
            }
        }
    }

    /// Cancels a target completion. Only timers receive a cancellation
    /// callback; a target that already fired is left untouched (its result
    /// stands). Cancelling in-flight I/O or async waiters is not supported:
    /// a still-queued submission is withdrawn, an active one is left alone.
    fn stop_completion(&mut self, target: NonNull<Completion>) {
        let target_ptr = target.as_ptr();
        // SAFETY: cancel targets are loaned completions with stable addresses.
        let completion = unsafe { &mut *target_ptr };
        let state = completion.state;

        match &mut completion.op {
            Operation::Timer(timer) => {
                let was_inserted = timer.link.is_inserted();
                if was_inserted {
                    self.timers.remove(timer);
                }

                match state {
                    State::Active => {
                        assert!(was_inserted);
                        self.active -= 1;
                        completion.state = State::Dead;
                    }
                    State::Adding => {
                        // Still in the submission FIFO; the drain unlinks and
                        // finalizes it.
                        assert!(!was_inserted);
                        completion.state = State::Deleting;
                    }
                    // Already fired or already cancelled; nothing to deliver.
                    State::Dead | State::Deleting | State::InProgress => return,
                }

                log::debug!("cancelled timer with deadline {}ns", timer.deadline_ns());

                let action = (completion.callback)(
                    completion.userdata,
                    self,
                    target_ptr,
                    OpResult::Timer(TimerTrigger::Cancel),
                );
                match action {
                    CallbackAction::Rearm => match state {
                        // Eligible again within this tick.
                        // SAFETY: a rearmed completion stays loaned out.
                        State::Active => self.start(unsafe { &mut *target_ptr }),
                        // Still linked in the submission FIFO: restore it so
                        // the drain starts it normally.
                        State::Adding => completion.state = State::Adding,
                        _ => unreachable!(),
                    },
                    CallbackAction::Disarm => {}
                }
            }
            _ => {
                if state == State::Adding {
                    completion.state = State::Deleting;
                }
            }
        }
    }

    /// active must account for exactly the completions parked in the loop's
    /// per-kind structures.
    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        assert!(
            self.active
                == self.timers.len()
                    + self.async_waiters.len() as usize
                    + (self.batch.len() - 1)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_loop_is_done() {
        let ev_loop = Loop::new(16);

        assert!(ev_loop.done());
        assert!(!ev_loop.stopped());
        assert!(ev_loop.active == 0);
    }

    #[test]
    fn add_parks_in_submissions() {
        let mut ev_loop = Loop::new(16);
        let mut c = Completion::new(Operation::AsyncWait, core::ptr::null_mut(), noop_callback);

        ev_loop.add(&mut c);

        assert!(c.state() == State::Adding);
        assert!(!ev_loop.done());
        assert!(ev_loop.active == 0); // Not counted until started.
        assert!(ev_loop.submissions.contains(&c));
    }

    #[test]
    #[should_panic(expected = "add: completion still in use")]
    fn add_twice_panics() {
        let mut ev_loop = Loop::new(16);
        let mut c = Completion::new(Operation::AsyncWait, core::ptr::null_mut(), noop_callback);

        ev_loop.add(&mut c);
        ev_loop.add(&mut c);
    }

    #[test]
    fn async_notify_sets_both_flags() {
        let ev_loop = Loop::new(16);
        let c = Completion::new(Operation::AsyncWait, core::ptr::null_mut(), noop_callback);

        ev_loop.async_notify(&c);
        ev_loop.async_notify(&c); // Idempotent.

        assert!(c.wakeup.load(Ordering::SeqCst));
        assert!(ev_loop.wakeup.load(Ordering::SeqCst));
    }
}
