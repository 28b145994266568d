#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
use core::{fmt, marker::PhantomData};

pub mod utils;

pub mod cfg;
pub mod error;
mod klock;
mod pool;
mod tick;

#[cfg(feature = "calendar")]
pub mod calendar;
#[cfg(feature = "timer")]
pub mod timer;

use self::{cfg::RtcOptionsExt, error::*, utils::Init};

#[doc(no_inline)]
pub use self::cfg::{ClockSource, InterruptLevel, Prescaler, RtcCfg, RtcOptions};

/// Unsigned integer type representing a tick count of the RTC counter.
pub type UTicks = u32;

/// Implemented by a port. Provides the atomic section the engine uses to
/// guard its shared state.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// masking the RTC interrupts while CPU Lock is active.
///
/// These methods are only meant to be called by the engine.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Enter a CPU Lock state, masking the Overflow and Compare interrupts.
    ///
    /// Return `false` without doing anything if CPU Lock is already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave a CPU Lock state. Interrupts that became pending while the lock
    /// was held are taken immediately.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;
}

/// Implemented by a port. Provides access to the RTC peripheral: a counter
/// that counts `0..period` and wraps, one compare register, and the two
/// interrupts (Overflow, Compare) raised by them.
///
/// # Safety
///
/// These methods are only meant to be called by the engine. Except for
/// [`Self::is_sync_busy`], they are only called with CPU Lock active.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortRtc: PortThreading {
    /// Read the current counter value.
    ///
    /// The engine waits for [`Self::is_sync_busy`] to return `false` before
    /// calling this.
    unsafe fn counter() -> UTicks;

    /// Overwrite the counter value.
    unsafe fn set_counter(value: UTicks);

    /// Set the number of ticks in one counter lap. The counter wraps to zero
    /// and raises Overflow when it reaches this value.
    unsafe fn set_period(period: UTicks);

    /// Set the counter value at which Compare is raised.
    ///
    /// A Compare request that is pending at this point must be discarded.
    /// It belongs to the previous threshold, and the engine has already
    /// accounted for the ticks up to the current reading.
    unsafe fn set_compare(value: UTicks);

    /// Attach the clock source and start the prescaler.
    unsafe fn start_counter();

    /// Stop the prescaler and detach the clock source.
    unsafe fn stop_counter();

    /// Discard pending Overflow and Compare requests.
    unsafe fn clear_pending_interrupts();

    unsafe fn enable_overflow_interrupt(level: InterruptLevel);
    unsafe fn disable_overflow_interrupt();
    unsafe fn enable_compare_interrupt(level: InterruptLevel);

    /// Mask Compare and discard a pending Compare request.
    unsafe fn disable_compare_interrupt();

    /// Make Compare pending so that its handler runs as soon as the
    /// interrupt is unmasked.
    unsafe fn pend_compare_interrupt();

    /// Return `true` if a write to the peripheral has not yet propagated to
    /// the counter's clock domain.
    fn is_sync_busy() -> bool;
}

/// The set of traits the engine needs from a system type.
pub trait RtcTraits: PortRtc + RtcOptions {}
impl<T: PortRtc + RtcOptions> RtcTraits for T {}

/// A capability invoked by the engine when an alarm matches or a timer
/// expires.
///
/// `call` runs in interrupt context with CPU Lock inactive. It must not
/// block.
pub trait Callback: Send + Sync {
    fn call(&self, param: usize);
}

impl Callback for fn(usize) {
    #[inline]
    fn call(&self, param: usize) {
        self(param)
    }
}

/// The RTC engine. Multiplexes a calendar with recurring alarms and a set of
/// software timers onto one RTC peripheral.
///
/// `NUM_ALARMS` and `NUM_TIMERS` specify the capacities of the alarm and
/// timer pools.
///
/// The intended use is to place it in a `static` and call
/// [`Self::handle_overflow`] and [`Self::handle_compare`] from the port's
/// interrupt handlers:
///
/// ```rust,ignore
/// static RTC: Rtc<SystemTraits> = Rtc::new();
///
/// fn rtc_overflow_handler() {
///     RTC.handle_overflow();
/// }
/// ```
pub struct Rtc<Traits, const NUM_ALARMS: usize = 8, const NUM_TIMERS: usize = 8> {
    #[cfg(feature = "calendar")]
    calendar: klock::CpuLockCell<Traits, calendar::CalendarState<NUM_ALARMS>>,
    #[cfg(feature = "timer")]
    timers: klock::CpuLockCell<Traits, timer::TimerQueue<NUM_TIMERS>>,
    _phantom: PhantomData<Traits>,
}

impl<Traits, const NUM_ALARMS: usize, const NUM_TIMERS: usize> Init
    for Rtc<Traits, NUM_ALARMS, NUM_TIMERS>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits, const NUM_ALARMS: usize, const NUM_TIMERS: usize> Rtc<Traits, NUM_ALARMS, NUM_TIMERS> {
    /// Construct an `Rtc` in the uninitialized state.
    pub const fn new() -> Self {
        Self {
            #[cfg(feature = "calendar")]
            calendar: klock::CpuLockCell::new(calendar::CalendarState::INIT),
            #[cfg(feature = "timer")]
            timers: klock::CpuLockCell::new(timer::TimerQueue::INIT),
            _phantom: PhantomData,
        }
    }
}

impl<Traits: RtcTraits, const NUM_ALARMS: usize, const NUM_TIMERS: usize>
    Rtc<Traits, NUM_ALARMS, NUM_TIMERS>
{
    /// Program the peripheral for a one-minute counter lap and reset the
    /// engine state.
    ///
    /// The calendar is set to 2000-01-01 00:00 with DST not observed, and
    /// every alarm and timer is released (their handles become stale).
    pub fn init(&self) -> Result<(), InitError> {
        let cfg = Traits::CFG;
        log::debug!(
            "init: {:?} / {:?} = {} ticks/s, period = {} ticks",
            cfg.clock_source,
            cfg.prescaler,
            cfg.ticks_per_second,
            cfg.period,
        );

        let mut lock = klock::lock_cpu::<Traits>()?;

        // Safety: CPU Lock active
        unsafe {
            Traits::stop_counter();
            Traits::disable_overflow_interrupt();
            Traits::disable_compare_interrupt();
            Traits::set_period(cfg.period);
            Traits::set_counter(0);
            Traits::clear_pending_interrupts();
        }

        #[cfg(feature = "calendar")]
        {
            self.calendar.write(&mut *lock).reset();

            // Safety: CPU Lock active
            unsafe { Traits::enable_overflow_interrupt(cfg.overflow_level) };
        }

        #[cfg(feature = "timer")]
        self.timers.write(&mut *lock).reset(0);

        // Safety: CPU Lock active
        unsafe { Traits::start_counter() };

        drop(lock);
        tick::wait_sync::<Traits>();

        Ok(())
    }

    /// Stop the counter, detach the clock source, and disable both
    /// interrupts.
    ///
    /// Scheduled timers and registered alarms stay where they are but will
    /// not fire until [`Self::init`] is called again, which releases them.
    pub fn uninit(&self) -> Result<(), InitError> {
        log::debug!("uninit");
        let _lock = klock::lock_cpu::<Traits>()?;

        // Safety: CPU Lock active
        unsafe {
            Traits::stop_counter();
            Traits::disable_overflow_interrupt();
            Traits::disable_compare_interrupt();
        }

        Ok(())
    }
}

impl<Traits: PortThreading, const NUM_ALARMS: usize, const NUM_TIMERS: usize> fmt::Debug
    for Rtc<Traits, NUM_ALARMS, NUM_TIMERS>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("Rtc");
        #[cfg(feature = "calendar")]
        s.field("calendar", &self.calendar);
        #[cfg(feature = "timer")]
        s.field("timers", &self.timers);
        s.finish()
    }
}
