//! Event timers
//!
//! The scheduled timers form a delta queue sorted by expiration time. Each
//! node stores the number of ticks between its predecessor's expiration (or
//! the reference point, for the first node) and its own. The reference point
//! is the counter value observed by the last reconciliation.
//!
//! ```text
//!              reference
//!                  │◀─ 3 ─▶│◀─ 0 ─▶│◀────── 2 ──────▶│
//!  counter ────────┼───────┼───────┼─────────────────┼────────▶
//!                          B       C                 A
//! ```
//!
//! Compare is programmed to fire at the first node's expiration. A first
//! node that is one lap or more away is approached `period - 1` ticks at a
//! time.
use core::fmt;

use crate::{
    cfg::RtcOptionsExt,
    error::{
        CreateTimerError, DeleteTimerError, NoAccessError, QueueOverflowError, StartTimerError,
        StopTimerError,
    },
    klock::{self, CpuLockTokenRefMut},
    pool::{Handle, Link, Pool, PoolPtr},
    tick,
    utils::Init,
    Callback, Rtc, RtcTraits, UTicks,
};


/// The behavior of a timer, supplied to [`Rtc::start_timer`].
#[derive(Clone, Copy)]
pub struct TimerSettings {
    /// The number of ticks until expiration.
    pub interval: UTicks,
    /// Reschedule the timer with the same interval when it expires.
    pub repeat: bool,
    pub callback: &'static dyn Callback,
    /// The value passed to `callback`.
    pub param: usize,
}

impl fmt::Debug for TimerSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerSettings")
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("callback", &(self.callback as *const dyn Callback))
            .field("param", &self.param)
            .finish()
    }
}

/// Identifies a timer created by [`Rtc::create_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(Handle);

#[derive(Clone, Copy)]
struct TimerNode {
    /// While linked, the ticks between the predecessor's expiration and this
    /// timer's expiration. Otherwise, the ticks until expiration when the
    /// timer is resumed.
    ticks_remaining: UTicks,
    /// `0` for a one-shot timer.
    ticks_reload: UTicks,
    callback: Option<&'static dyn Callback>,
    param: usize,
    next: Option<PoolPtr>,
}

impl Init for TimerNode {
    const INIT: Self = Self {
        ticks_remaining: 0,
        ticks_reload: 0,
        callback: None,
        param: 0,
        next: None,
    };
}

impl Link for TimerNode {
    fn next(&self) -> Option<PoolPtr> {
        self.next
    }
    fn set_next(&mut self, next: Option<PoolPtr>) {
        self.next = next;
    }
}

impl fmt::Debug for TimerNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerNode")
            .field("ticks_remaining", &self.ticks_remaining)
            .field("ticks_reload", &self.ticks_reload)
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}

/// What to do with the Compare register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareAction {
    /// No timers are scheduled.
    Disable,
    /// The first timer has expired.
    Pend,
    Set(UTicks),
}

/// The timer pool and the delta queue, protected by CPU Lock.
pub(crate) struct TimerQueue<const N: usize> {
    timers: Pool<TimerNode, N>,
    first: Option<PoolPtr>,
    reference: UTicks,
}

impl<const N: usize> Init for TimerQueue<N> {
    const INIT: Self = Self {
        timers: Init::INIT,
        first: None,
        reference: 0,
    };
}

impl<const N: usize> fmt::Debug for TimerQueue<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("reference", &self.reference)
            .field("timers", &self.timers)
            .field("first", &self.first)
            .finish()
    }
}

impl<const N: usize> TimerQueue<N> {
    /// Release every timer and set the reference point.
    pub(crate) fn reset(&mut self, reference: UTicks) {
        self.timers.clear();
        self.first = None;
        self.reference = reference;
    }

    fn create(&mut self) -> Result<TimerId, QueueOverflowError> {
        self.timers
            .allocate(TimerNode::INIT)
            .map(TimerId)
            .ok_or(QueueOverflowError::QueueOverflow)
    }

    fn delete(&mut self, id: TimerId) {
        self.timers.release(id.0);
    }

    fn ptr(&self, id: TimerId) -> Result<PoolPtr, NoAccessError> {
        self.timers
            .get(id.0)
            .map(|_| id.0.ptr())
            .ok_or(NoAccessError::NoAccess)
    }

    fn configure(&mut self, ptr: PoolPtr, settings: &TimerSettings) {
        let timer = self.timers.at_mut(ptr);
        timer.ticks_remaining = settings.interval;
        timer.ticks_reload = if settings.repeat { settings.interval } else { 0 };
        timer.callback = Some(settings.callback);
        timer.param = settings.param;
        timer.next = None;
    }

    /// Apply the ticks elapsed since the reference point to the first timer
    /// and move the reference point to `reading`.
    pub(crate) fn reconcile(&mut self, reading: UTicks, period: UTicks, from_compare_isr: bool) {
        let elapsed = tick::elapsed_ticks(self.reference, reading, period, from_compare_isr);
        if let Some(first) = self.first {
            let timer = self.timers.at_mut(first);
            timer.ticks_remaining = timer.ticks_remaining.saturating_sub(elapsed);
        }
        self.reference = reading;
        log::trace!("reconcile: reading = {reading}, elapsed = {elapsed}");
    }

    /// Move the reference point without accounting for elapsed time. Used
    /// when the counter is overwritten.
    pub(crate) fn rebase(&mut self, reference: UTicks) {
        self.reference = reference;
    }

    /// Insert an unlinked timer into the queue. Its `ticks_remaining` is
    /// taken as relative to the reference point.
    ///
    /// A timer is placed after the timers expiring at the same tick.
    fn insert(&mut self, ptr: PoolPtr) {
        let mut remaining = self.timers.at(ptr).ticks_remaining;
        let mut prev = None;
        let mut cursor = self.first;

        while let Some(current) = cursor {
            let node = self.timers.at_mut(current);
            if remaining < node.ticks_remaining {
                node.ticks_remaining -= remaining;
                break;
            }
            remaining -= node.ticks_remaining;
            prev = cursor;
            cursor = node.next;
        }

        self.timers.at_mut(ptr).ticks_remaining = remaining;
        self.timers.insert_after(&mut self.first, prev, ptr);
    }

    /// Remove a timer from the queue, converting its `ticks_remaining` to
    /// the ticks until expiration. Return `false` if it wasn't linked.
    fn unlink(&mut self, ptr: PoolPtr) -> bool {
        let offset: UTicks = self
            .timers
            .iter(self.first)
            .take_while(|&(p, _)| p != ptr)
            .map(|(_, timer)| timer.ticks_remaining)
            .sum();

        let next = self.timers.at(ptr).next;

        if self.timers.unlink(&mut self.first, ptr).is_none() {
            return false;
        }

        let timer = self.timers.at_mut(ptr);
        let delta = timer.ticks_remaining;
        timer.ticks_remaining = delta + offset;
        if let Some(next) = next {
            self.timers.at_mut(next).ticks_remaining += delta;
        }
        true
    }

    /// Get the number of ticks until the timer expires, relative to the
    /// reference point. Return `None` if it's not scheduled.
    fn remaining(&self, ptr: PoolPtr) -> Option<UTicks> {
        let mut sum: UTicks = 0;
        for (p, timer) in self.timers.iter(self.first) {
            sum += timer.ticks_remaining;
            if p == ptr {
                return Some(sum);
            }
        }
        None
    }

    /// Detach the first timer if it has expired, rescheduling it if it's
    /// periodic. Return its callback and parameter.
    fn pop_expired(&mut self) -> Option<(Option<&'static dyn Callback>, usize)> {
        let first = self.first?;
        let timer = *self.timers.at(first);
        if timer.ticks_remaining != 0 {
            return None;
        }

        self.unlink(first);

        if timer.ticks_reload != 0 {
            self.timers.at_mut(first).ticks_remaining = timer.ticks_reload;
            self.insert(first);
        }

        Some((timer.callback, timer.param))
    }

    pub(crate) fn compare_action(&self, period: UTicks) -> CompareAction {
        let Some(first) = self.first else {
            return CompareAction::Disable;
        };
        match self.timers.at(first).ticks_remaining {
            0 => CompareAction::Pend,
            // Never at the reference itself, where a reconciliation made on
            // the same tick would see no time elapsed
            remaining => CompareAction::Set((self.reference + remaining.min(period - 1)) % period),
        }
    }
}

/// Reprogram Compare for the first timer in the queue.
pub(crate) fn program_compare<Traits: RtcTraits, const NUM_TIMERS: usize>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    timers: &klock::CpuLockCell<Traits, TimerQueue<NUM_TIMERS>>,
) {
    let cfg = Traits::CFG;
    let action = timers.read(&*lock).compare_action(cfg.period);
    log::trace!("program_compare: {action:?}");

    // Safety: CPU Lock active
    unsafe {
        match action {
            CompareAction::Disable => Traits::disable_compare_interrupt(),
            CompareAction::Pend => {
                Traits::pend_compare_interrupt();
                Traits::enable_compare_interrupt(cfg.compare_level);
            }
            CompareAction::Set(value) => {
                Traits::set_compare(value);
                Traits::enable_compare_interrupt(cfg.compare_level);
            }
        }
    }
}

/// Read the counter and reconcile the queue with it.
fn reconcile<Traits: RtcTraits, const NUM_TIMERS: usize>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timers: &klock::CpuLockCell<Traits, TimerQueue<NUM_TIMERS>>,
    from_compare_isr: bool,
) {
    // Safety: CPU Lock active
    let reading = unsafe { Traits::counter() };
    timers
        .write(&mut *lock)
        .reconcile(reading, Traits::CFG.period, from_compare_isr);
}

impl<Traits: RtcTraits, const NUM_ALARMS: usize, const NUM_TIMERS: usize>
    Rtc<Traits, NUM_ALARMS, NUM_TIMERS>
{
    /// Allocate a timer. It stays unscheduled until [`Self::start_timer`] is
    /// called with settings.
    pub fn create_timer(&self) -> Result<TimerId, CreateTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let id = self.timers.write(&mut *lock).create()?;
        log::trace!("create_timer() = {id:?}");
        Ok(id)
    }

    /// Stop and release a timer. `id` becomes stale.
    pub fn delete_timer(&self, id: TimerId) -> Result<(), DeleteTimerError> {
        tick::wait_sync::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let ptr = self.timers.read(&*lock).ptr(id)?;

        stop_timer(lock.borrow_mut(), &self.timers, ptr);
        self.timers.write(&mut *lock).delete(id);
        log::trace!("delete_timer({id:?})");
        Ok(())
    }

    /// Schedule a timer.
    ///
    /// With `Some(settings)`, the timer is (re)configured and expires after
    /// `settings.interval` ticks. With `None`, a stopped timer resumes with
    /// the time it had remaining when it was stopped.
    ///
    /// A timer that is already scheduled is unlinked first, so this can be
    /// used to restart it.
    pub fn start_timer(
        &self,
        id: TimerId,
        settings: Option<&TimerSettings>,
    ) -> Result<(), StartTimerError> {
        tick::wait_sync::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let ptr = self.timers.read(&*lock).ptr(id)?;

        reconcile(lock.borrow_mut(), &self.timers, false);

        let timers = self.timers.write(&mut *lock);
        timers.unlink(ptr);
        if let Some(settings) = settings {
            timers.configure(ptr, settings);
        }
        timers.insert(ptr);
        log::trace!("start_timer({id:?}, {settings:?}): {timers:?}");

        program_compare(lock.borrow_mut(), &self.timers);
        Ok(())
    }

    /// Unschedule a timer, preserving its remaining time for
    /// [`Self::start_timer`]`(id, None)`. Stopping an unscheduled timer has no
    /// effect.
    pub fn stop_timer(&self, id: TimerId) -> Result<(), StopTimerError> {
        tick::wait_sync::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let ptr = self.timers.read(&*lock).ptr(id)?;

        stop_timer(lock.borrow_mut(), &self.timers, ptr);
        log::trace!("stop_timer({id:?})");
        Ok(())
    }

    /// Get the number of ticks until a timer expires. Return `None` if it's
    /// not scheduled.
    pub fn timer_remaining(&self, id: TimerId) -> Result<Option<UTicks>, StopTimerError> {
        tick::wait_sync::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;
        let ptr = self.timers.read(&*lock).ptr(id)?;

        reconcile(lock.borrow_mut(), &self.timers, false);
        program_compare(lock.borrow_mut(), &self.timers);

        Ok(self.timers.read(&*lock).remaining(ptr))
    }

    /// The Compare interrupt handler. Dispatches every expired timer.
    ///
    /// The callbacks are called with CPU Lock inactive. The queue is
    /// reconciled again after each callback, so timers that expire meanwhile
    /// are dispatched in the same invocation.
    pub fn handle_compare(&self) {
        tick::wait_sync::<Traits>();
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            log::warn!("handle_compare: called with CPU Lock active");
            return;
        };

        reconcile(lock.borrow_mut(), &self.timers, true);

        loop {
            let expired = self.timers.write(&mut *lock).pop_expired();
            program_compare(lock.borrow_mut(), &self.timers);

            let Some((callback, param)) = expired else {
                break;
            };

            drop(lock);
            log::trace!("handle_compare: dispatching timer ({param})");
            if let Some(callback) = callback {
                callback.call(param);
            }

            tick::wait_sync::<Traits>();
            lock = match klock::lock_cpu::<Traits>() {
                Ok(lock) => lock,
                Err(_) => {
                    log::warn!("handle_compare: a callback returned with CPU Lock active");
                    return;
                }
            };
            reconcile(lock.borrow_mut(), &self.timers, false);
        }
    }
}

/// The core portion of [`Rtc::stop_timer`].
fn stop_timer<Traits: RtcTraits, const NUM_TIMERS: usize>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timers: &klock::CpuLockCell<Traits, TimerQueue<NUM_TIMERS>>,
    ptr: PoolPtr,
) {
    reconcile(lock.borrow_mut(), timers, false);
    if timers.write(&mut *lock).unlink(ptr) {
        program_compare(lock.borrow_mut(), timers);
    }
}
