#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use xmrtc_kernel::{cfg::MAX_PERIOD, InterruptLevel, UTicks};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate xmrtc_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: xmrtc_kernel::PortRtc {
    fn port_state() -> &'static State;
}

/// A snapshot of the simulated peripheral's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub counter: UTicks,
    pub period: UTicks,
    pub compare: UTicks,
    /// The clock source is attached and the prescaler is running.
    pub running: bool,
    /// `Off` if the interrupt is disabled.
    pub overflow_level: InterruptLevel,
    /// `Off` if the interrupt is disabled.
    pub compare_level: InterruptLevel,
    pub overflow_pending: bool,
    pub compare_pending: bool,
    /// A register write hasn't propagated yet. Cleared by the next poll or
    /// tick.
    pub sync_busy: bool,
}

impl Registers {
    const RESET: Self = Self {
        counter: 0,
        period: MAX_PERIOD,
        compare: 0,
        running: false,
        overflow_level: InterruptLevel::Off,
        compare_level: InterruptLevel::Off,
        overflow_pending: false,
        compare_pending: false,
        sync_busy: false,
    };

    /// Advance the counter by one tick.
    fn tick(&mut self) {
        self.sync_busy = false;
        if !self.running {
            return;
        }

        self.counter += 1;
        if self.counter >= self.period {
            self.counter = 0;
            self.overflow_pending = true;
        }
        if self.counter == self.compare {
            self.compare_pending = true;
        }
    }

    /// Choose the interrupt to take next and clear its pending flag.
    ///
    /// The higher level wins. Compare wins a tie.
    fn take_pending(&mut self) -> Option<Interrupt> {
        let level = |pending: bool, level: InterruptLevel| {
            (pending && level != InterruptLevel::Off).then_some(level)
        };
        let compare = level(self.compare_pending, self.compare_level);
        let overflow = level(self.overflow_pending, self.overflow_level);

        let taken = match (compare, overflow) {
            (Some(c), Some(o)) if o > c => Interrupt::Overflow,
            (Some(_), _) => Interrupt::Compare,
            (None, Some(_)) => Interrupt::Overflow,
            (None, None) => return None,
        };

        match taken {
            Interrupt::Overflow => self.overflow_pending = false,
            Interrupt::Compare => self.compare_pending = false,
        }
        Some(taken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Overflow,
    Compare,
}

#[derive(Clone, Copy)]
struct Handlers {
    overflow: Option<fn()>,
    compare: Option<fn()>,
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    regs: SpinMutex<Registers>,
    handlers: SpinMutex<Handlers>,
    cpu_lock: AtomicBool,
    /// An interrupt handler is running. Interrupts don't nest.
    in_handler: AtomicBool,
}

impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            regs: SpinMutex::new(Registers::RESET),
            handlers: SpinMutex::new(Handlers {
                overflow: None,
                compare: None,
            }),
            cpu_lock: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
        }
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        let entered = self
            .cpu_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        log::trace!("try_enter_cpu_lock() = {entered}");
        entered
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("leave_cpu_lock");
        let was_active = self.cpu_lock.swap(false, Ordering::Release);
        assert!(was_active);

        self.dispatch::<Traits>();
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    /// Access the registers. Everything but polling the sync flag requires
    /// CPU Lock.
    fn regs_locked(&self) -> spin::MutexGuard<'_, Registers> {
        assert!(
            self.cpu_lock.load(Ordering::Relaxed),
            "register access without CPU Lock"
        );
        self.regs.lock()
    }

    pub unsafe fn counter<Traits: PortInstance>(&self) -> UTicks {
        self.regs_locked().counter
    }

    pub unsafe fn set_counter<Traits: PortInstance>(&self, value: UTicks) {
        log::trace!("set_counter({value})");
        let mut regs = self.regs_locked();
        assert!(value < regs.period, "counter out of range");
        regs.counter = value;
        regs.sync_busy = true;
    }

    pub unsafe fn set_period<Traits: PortInstance>(&self, period: UTicks) {
        log::trace!("set_period({period})");
        assert!((1..=MAX_PERIOD).contains(&period), "period out of range");
        let mut regs = self.regs_locked();
        regs.period = period;
        regs.counter %= period;
        regs.sync_busy = true;
    }

    pub unsafe fn set_compare<Traits: PortInstance>(&self, value: UTicks) {
        log::trace!("set_compare({value})");
        let mut regs = self.regs_locked();
        regs.compare = value;
        regs.compare_pending = false;
        regs.sync_busy = true;
    }

    pub unsafe fn start_counter<Traits: PortInstance>(&self) {
        log::trace!("start_counter");
        let mut regs = self.regs_locked();
        regs.running = true;
        regs.sync_busy = true;
    }

    pub unsafe fn stop_counter<Traits: PortInstance>(&self) {
        log::trace!("stop_counter");
        let mut regs = self.regs_locked();
        regs.running = false;
        regs.sync_busy = true;
    }

    pub unsafe fn clear_pending_interrupts<Traits: PortInstance>(&self) {
        let mut regs = self.regs_locked();
        regs.overflow_pending = false;
        regs.compare_pending = false;
    }

    pub unsafe fn enable_overflow_interrupt<Traits: PortInstance>(&self, level: InterruptLevel) {
        log::trace!("enable_overflow_interrupt({level:?})");
        self.regs_locked().overflow_level = level;
    }

    pub unsafe fn disable_overflow_interrupt<Traits: PortInstance>(&self) {
        log::trace!("disable_overflow_interrupt");
        self.regs_locked().overflow_level = InterruptLevel::Off;
    }

    pub unsafe fn enable_compare_interrupt<Traits: PortInstance>(&self, level: InterruptLevel) {
        log::trace!("enable_compare_interrupt({level:?})");
        self.regs_locked().compare_level = level;
    }

    pub unsafe fn disable_compare_interrupt<Traits: PortInstance>(&self) {
        log::trace!("disable_compare_interrupt");
        let mut regs = self.regs_locked();
        regs.compare_level = InterruptLevel::Off;
        regs.compare_pending = false;
    }

    pub unsafe fn pend_compare_interrupt<Traits: PortInstance>(&self) {
        log::trace!("pend_compare_interrupt");
        self.regs_locked().compare_pending = true;
    }

    pub fn is_sync_busy<Traits: PortInstance>(&self) -> bool {
        core::mem::take(&mut self.regs.lock().sync_busy)
    }

    /// Take pending interrupts until none is left.
    fn dispatch<Traits: PortInstance>(&self) {
        if self.cpu_lock.load(Ordering::Relaxed) {
            return;
        }
        if self.in_handler.swap(true, Ordering::Acquire) {
            // Taken by the outer `dispatch` when the handler returns
            return;
        }

        loop {
            // The guard must be gone before the handler runs
            let Some(interrupt) = self.regs.lock().take_pending() else {
                break;
            };
            let handlers = *self.handlers.lock();
            let handler = match interrupt {
                Interrupt::Overflow => handlers.overflow,
                Interrupt::Compare => handlers.compare,
            };

            log::trace!("taking {interrupt:?}");
            match handler {
                Some(handler) => handler(),
                None => log::warn!("{interrupt:?} has no handler"),
            }

            assert!(
                !self.cpu_lock.load(Ordering::Relaxed),
                "{interrupt:?} handler returned with CPU Lock active"
            );
        }

        self.in_handler.store(false, Ordering::Release);
    }
}

/// Register the functions called when Overflow and Compare are taken.
///
/// They normally forward to [`xmrtc_kernel::Rtc::handle_overflow`] and
/// [`xmrtc_kernel::Rtc::handle_compare`].
pub fn bind_interrupts<Traits: PortInstance>(overflow: fn(), compare: fn()) {
    *Traits::port_state().handlers.lock() = Handlers {
        overflow: Some(overflow),
        compare: Some(compare),
    };
}

/// Feed `ticks` clock cycles to the counter, taking interrupts as they
/// occur.
///
/// Must not be called from an interrupt handler or with CPU Lock active.
pub fn advance<Traits: PortInstance>(ticks: u32) {
    let state = Traits::port_state();
    assert!(
        !state.cpu_lock.load(Ordering::Relaxed) && !state.in_handler.load(Ordering::Relaxed),
        "advance called from a handler or with CPU Lock active"
    );
    log::trace!("advance({ticks})");

    for _ in 0..ticks {
        state.regs.lock().tick();
        state.dispatch::<Traits>();
    }
}

/// Get a snapshot of the registers.
pub fn registers<Traits: PortInstance>() -> Registers {
    *Traits::port_state().regs.lock()
}

/// Take a CPU Lock from outside the engine, as an application would by
/// masking interrupts. Interrupts raised meanwhile are taken when the
/// returned guard is dropped.
///
/// Returns `None` if CPU Lock is already active.
pub fn lock_cpu<Traits: PortInstance>() -> Option<impl Sized> {
    struct Guard<Traits: PortInstance>(core::marker::PhantomData<Traits>);

    impl<Traits: PortInstance> Drop for Guard<Traits> {
        fn drop(&mut self) {
            // Safety: CPU Lock active, owned by this guard
            unsafe { Traits::port_state().leave_cpu_lock::<Traits>() };
        }
    }

    // Safety: Paired with `leave_cpu_lock` by `Guard`
    unsafe { Traits::port_state().try_enter_cpu_lock::<Traits>() }
        .then(|| Guard::<Traits>(core::marker::PhantomData))
}

/// Initialize `env_logger`, ignoring an already-installed logger.
pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// Define a system type backed by a simulated RTC peripheral.
///
/// The system type still needs an implementation of
/// [`xmrtc_kernel::RtcOptions`].
///
/// ```rust,ignore
/// xmrtc_port_std::use_port!(unsafe struct SystemTraits);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::xmrtc_kernel::{InterruptLevel, PortRtc, PortThreading, UTicks};
            use $crate::{State, PortInstance};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }
            }

            unsafe impl PortRtc for $SystemTraits {
                unsafe fn counter() -> UTicks {
                    unsafe { PORT_STATE.counter::<Self>() }
                }

                unsafe fn set_counter(value: UTicks) {
                    unsafe { PORT_STATE.set_counter::<Self>(value) }
                }

                unsafe fn set_period(period: UTicks) {
                    unsafe { PORT_STATE.set_period::<Self>(period) }
                }

                unsafe fn set_compare(value: UTicks) {
                    unsafe { PORT_STATE.set_compare::<Self>(value) }
                }

                unsafe fn start_counter() {
                    unsafe { PORT_STATE.start_counter::<Self>() }
                }

                unsafe fn stop_counter() {
                    unsafe { PORT_STATE.stop_counter::<Self>() }
                }

                unsafe fn clear_pending_interrupts() {
                    unsafe { PORT_STATE.clear_pending_interrupts::<Self>() }
                }

                unsafe fn enable_overflow_interrupt(level: InterruptLevel) {
                    unsafe { PORT_STATE.enable_overflow_interrupt::<Self>(level) }
                }

                unsafe fn disable_overflow_interrupt() {
                    unsafe { PORT_STATE.disable_overflow_interrupt::<Self>() }
                }

                unsafe fn enable_compare_interrupt(level: InterruptLevel) {
                    unsafe { PORT_STATE.enable_compare_interrupt::<Self>(level) }
                }

                unsafe fn disable_compare_interrupt() {
                    unsafe { PORT_STATE.disable_compare_interrupt::<Self>() }
                }

                unsafe fn pend_compare_interrupt() {
                    unsafe { PORT_STATE.pend_compare_interrupt::<Self>() }
                }

                fn is_sync_busy() -> bool {
                    PORT_STATE.is_sync_busy::<Self>()
                }
            }
        }
    };
}
