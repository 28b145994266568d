//! Calendar engine
//!
//! The calendar keeps a broken-down date/time with minute resolution. The
//! Overflow interrupt, raised once per counter lap (one minute), advances it.
//! Seconds are not stored; they're derived from the live counter value.
//!
//! # Daylight Saving Time
//!
//! When DST is observed, the US rule is applied whenever the hour advances
//! without a day rollover:
//!
//!  - On the second Sunday in March, 02:00 becomes 03:00.
//!  - On the first Sunday in November, 02:00 becomes 01:00.
//!
//! # Alarms
//!
//! Alarms recur on a set of days of the week at a fixed hour and minute.
//! After the clock advances, every registered alarm is checked once, in the
//! list order (most recently added first), and the matching ones are
//! dispatched.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    cfg::RtcOptionsExt,
    error::{
        AddAlarmError, GetTimeError, QueueOverflowError, RemoveAlarmError, SetTimeError,
    },
    klock,
    pool::{Handle, Link, Pool, PoolPtr},
    tick,
    utils::Init,
    Callback, Rtc, RtcTraits, UTicks,
};


/// Day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DayOfWeek {
    Sunday = 0,
    Monday = 1,
    Tuesday = 2,
    Wednesday = 3,
    Thursday = 4,
    Friday = 5,
    Saturday = 6,
}

impl DayOfWeek {
    const ALL: [Self; 7] = [
        Self::Sunday,
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
    ];

    /// Construct a `DayOfWeek` from its index (`0` = Sunday).
    pub const fn from_index(index: u8) -> Option<Self> {
        if index < 7 {
            Some(Self::ALL[index as usize])
        } else {
            None
        }
    }

    /// Get the following day.
    pub const fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % 7]
    }

    /// Get a [`DayMask`] containing only `self`.
    pub const fn mask(self) -> DayMask {
        DayMask::from_bits_truncate(1 << self as u8)
    }
}

bitflags::bitflags! {
    /// A set of days of the week. Bit 0 represents Sunday.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DayMask: u8 {
        const SUNDAY = 1 << 0;
        const MONDAY = 1 << 1;
        const TUESDAY = 1 << 2;
        const WEDNESDAY = 1 << 3;
        const THURSDAY = 1 << 4;
        const FRIDAY = 1 << 5;
        const SATURDAY = 1 << 6;

        const WEEKDAYS = Self::MONDAY.bits()
            | Self::TUESDAY.bits()
            | Self::WEDNESDAY.bits()
            | Self::THURSDAY.bits()
            | Self::FRIDAY.bits();
        const WEEKENDS = Self::SATURDAY.bits() | Self::SUNDAY.bits();
        const EVERY_DAY = Self::WEEKDAYS.bits() | Self::WEEKENDS.bits();
    }
}

/// A broken-down date/time.
///
/// `day` must be valid for `month` and `year`. This is not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalendarTime {
    pub year: u16,
    /// `1..=12`
    pub month: u8,
    /// `1..=days_in_month(month, year)`
    pub day: u8,
    /// `None` if unknown. [`Rtc::set_time`] computes it from the date in this
    /// case.
    pub dayofweek: Option<DayOfWeek>,
    /// `0..=23`
    pub hour: u8,
    /// `0..=59`
    pub minute: u8,
    /// `0..=59`. Derived from the counter value.
    pub second: u8,
}

impl CalendarTime {
    /// The time the calendar is set to by [`Rtc::init`]: 2000-01-01 00:00:00,
    /// a Saturday.
    pub const EPOCH: Self = Clock::EPOCH.to_time(0);
}

/// The daylight saving time state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DstState {
    /// The US DST rule applies.
    pub observed: bool,
    /// DST is currently in effect.
    pub active: bool,
}

/// A recurring alarm.
#[derive(Clone, Copy)]
pub struct Alarm {
    /// The days of the week on which the alarm fires.
    pub days: DayMask,
    pub hour: u8,
    pub minute: u8,
    pub callback: &'static dyn Callback,
    /// The value passed to `callback`.
    pub param: usize,
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("days", &self.days)
            .field("hour", &self.hour)
            .field("minute", &self.minute)
            .field("callback", &(self.callback as *const dyn Callback))
            .field("param", &self.param)
            .finish()
    }
}

/// Identifies a registered [`Alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(Handle);

/// Return `true` if `year` is a leap year in the Gregorian calendar.
pub const fn is_leap_year(year: u16) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Get the number of days in `month` (`1..=12`) of `year`.
pub const fn days_in_month(month: u8, year: u16) -> u8 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Calculate the day of the week of a date in the proleptic Gregorian
/// calendar.
pub const fn day_of_week(year: u16, month: u8, day: u8) -> DayOfWeek {
    const MONTH_OFFSETS: [u32; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];

    // January and February count as the last months of the previous year.
    // Adding 400 years (exactly 20871 weeks) keeps year 0 from underflowing.
    let y = year as u32 + 400 - (month < 3) as u32;
    let index =
        (y + y / 4 - y / 100 + y / 400 + MONTH_OFFSETS[month as usize - 1] + day as u32) % 7;

    DayOfWeek::ALL[index as usize]
}

/// The calendar fields maintained by the Overflow handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Clock {
    pub(crate) year: u16,
    pub(crate) month: u8,
    pub(crate) day: u8,
    pub(crate) dayofweek: DayOfWeek,
    pub(crate) hour: u8,
    pub(crate) minute: u8,
}

impl Clock {
    const EPOCH: Self = Self {
        year: 2000,
        month: 1,
        day: 1,
        dayofweek: day_of_week(2000, 1, 1),
        hour: 0,
        minute: 0,
    };

    pub(crate) const fn from_time(time: &CalendarTime) -> Self {
        Self {
            year: time.year,
            month: time.month,
            day: time.day,
            dayofweek: match time.dayofweek {
                Some(x) => x,
                None => day_of_week(time.year, time.month, time.day),
            },
            hour: time.hour,
            minute: time.minute,
        }
    }

    pub(crate) const fn to_time(self, second: u8) -> CalendarTime {
        CalendarTime {
            year: self.year,
            month: self.month,
            day: self.day,
            dayofweek: Some(self.dayofweek),
            hour: self.hour,
            minute: self.minute,
            second,
        }
    }

    /// Advance the clock by one minute.
    pub(crate) fn advance_minute(&mut self, dst: &mut DstState) {
        if self.minute < 59 {
            self.minute += 1;
            return;
        }

        self.minute = 0;
        if self.hour < 23 {
            self.hour += 1;
            if dst.observed {
                self.adjust_for_dst(dst);
            }
        } else {
            self.hour = 0;
            self.advance_day();
        }
    }

    fn advance_day(&mut self) {
        self.dayofweek = self.dayofweek.next();

        if self.day < days_in_month(self.month, self.year) {
            self.day += 1;
            return;
        }

        self.day = 1;
        if self.month < 12 {
            self.month += 1;
        } else {
            self.month = 1;
            self.year = self.year.wrapping_add(1);
        }
    }

    /// Apply the US DST rule. Called when the hour has just advanced.
    fn adjust_for_dst(&mut self, dst: &mut DstState) {
        if self.dayofweek != DayOfWeek::Sunday || self.hour != 2 {
            return;
        }

        if !dst.active {
            // The second Sunday in March, 02:00 -> 03:00
            if self.month == 3 && (8..=14).contains(&self.day) {
                self.hour = 3;
                dst.active = true;
                log::debug!("entering DST");
            }
        } else {
            // The first Sunday in November, 02:00 -> 01:00
            if self.month == 11 && (1..=7).contains(&self.day) {
                self.hour = 1;
                dst.active = false;
                log::debug!("leaving DST");
            }
        }
    }
}

#[derive(Clone, Copy)]
struct AlarmNode {
    alarm: Alarm,
    next: Option<PoolPtr>,
}

impl Link for AlarmNode {
    fn next(&self) -> Option<PoolPtr> {
        self.next
    }
    fn set_next(&mut self, next: Option<PoolPtr>) {
        self.next = next;
    }
}

impl fmt::Debug for AlarmNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.alarm.fmt(f)
    }
}

/// The callbacks of the alarms that matched in one Overflow.
pub(crate) type FiredAlarms<const N: usize> = ArrayVec<(&'static dyn Callback, usize), N>;

/// The calendar state, protected by CPU Lock.
pub(crate) struct CalendarState<const N: usize> {
    pub(crate) clock: Clock,
    pub(crate) dst: DstState,
    alarms: Pool<AlarmNode, N>,
    first_alarm: Option<PoolPtr>,
}

impl<const N: usize> Init for CalendarState<N> {
    const INIT: Self = Self {
        clock: Clock::EPOCH,
        dst: DstState {
            observed: false,
            active: false,
        },
        alarms: Init::INIT,
        first_alarm: None,
    };
}

impl<const N: usize> fmt::Debug for CalendarState<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CalendarState")
            .field("clock", &self.clock)
            .field("dst", &self.dst)
            .field(
                "alarms",
                &DebugList(|f: &mut fmt::Formatter| {
                    f.debug_list()
                        .entries(self.alarms.iter(self.first_alarm).map(|(_, node)| node))
                        .finish()
                }),
            )
            .finish()
    }
}

struct DebugList<F>(F);

impl<F: Fn(&mut fmt::Formatter) -> fmt::Result> fmt::Debug for DebugList<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl<const N: usize> CalendarState<N> {
    /// Reset the clock to the epoch, stop observing DST, and release every
    /// alarm.
    pub(crate) fn reset(&mut self) {
        self.clock = Clock::EPOCH;
        self.dst = DstState::default();
        self.alarms.clear();
        self.first_alarm = None;
    }

    pub(crate) fn add_alarm(&mut self, alarm: Alarm) -> Result<AlarmId, QueueOverflowError> {
        let handle = self
            .alarms
            .allocate(AlarmNode { alarm, next: None })
            .ok_or(QueueOverflowError::QueueOverflow)?;
        self.alarms.push_front(&mut self.first_alarm, handle.ptr());
        Ok(AlarmId(handle))
    }

    /// Unlink and release an alarm. Do nothing if `id` is stale.
    pub(crate) fn remove_alarm(&mut self, id: AlarmId) {
        if self.alarms.get(id.0).is_none() {
            return;
        }
        self.alarms.unlink(&mut self.first_alarm, id.0.ptr());
        self.alarms.release(id.0);
    }

    /// Advance the clock by one minute and collect the alarms that match the
    /// new time.
    pub(crate) fn advance_minute(&mut self) -> FiredAlarms<N> {
        self.clock.advance_minute(&mut self.dst);
        self.matching_alarms()
    }

    fn matching_alarms(&self) -> FiredAlarms<N> {
        let today = self.clock.dayofweek.mask();
        self.alarms
            .iter(self.first_alarm)
            .map(|(_, node)| &node.alarm)
            .filter(|alarm| {
                alarm.days.intersects(today)
                    && alarm.hour == self.clock.hour
                    && alarm.minute == self.clock.minute
            })
            .map(|alarm| (alarm.callback, alarm.param))
            .collect()
    }
}

impl<Traits: RtcTraits, const NUM_ALARMS: usize, const NUM_TIMERS: usize>
    Rtc<Traits, NUM_ALARMS, NUM_TIMERS>
{
    /// Set the calendar time.
    ///
    /// If `time.dayofweek` is `None`, it's calculated from the date. The
    /// counter is rewritten to represent `time.second`. Scheduled timers keep
    /// their remaining time.
    pub fn set_time(&self, time: &CalendarTime) -> Result<(), SetTimeError> {
        let cfg = Traits::CFG;
        let clock = Clock::from_time(time);
        let counter = UTicks::from(time.second.min(59)) * cfg.ticks_per_second;
        log::debug!("set_time({clock:?}, counter = {counter})");

        tick::wait_sync::<Traits>();
        let mut lock = klock::lock_cpu::<Traits>()?;

        #[cfg(feature = "timer")]
        {
            // Safety: CPU Lock active
            let reading = unsafe { Traits::counter() };
            self.timers
                .write(&mut *lock)
                .reconcile(reading, cfg.period, false);
        }

        // Safety: CPU Lock active
        unsafe {
            Traits::disable_overflow_interrupt();
            Traits::disable_compare_interrupt();
            Traits::stop_counter();
            Traits::set_counter(counter);
        }

        self.calendar.write(&mut *lock).clock = clock;

        #[cfg(feature = "timer")]
        {
            self.timers.write(&mut *lock).rebase(counter);
            crate::timer::program_compare(lock.borrow_mut(), &self.timers);
        }

        // Safety: CPU Lock active
        unsafe {
            Traits::enable_overflow_interrupt(cfg.overflow_level);
            Traits::start_counter();
        }

        drop(lock);
        tick::wait_sync::<Traits>();

        Ok(())
    }

    /// Get the calendar time.
    pub fn time(&self) -> Result<CalendarTime, GetTimeError> {
        let cfg = Traits::CFG;

        tick::wait_sync::<Traits>();
        let lock = klock::lock_cpu::<Traits>()?;

        // Safety: CPU Lock active
        let counter = unsafe { Traits::counter() };
        let clock = self.calendar.read(&*lock).clock;
        drop(lock);

        let second = (counter / cfg.ticks_per_second).min(59) as u8;
        Ok(clock.to_time(second))
    }

    /// Set the daylight saving time state.
    pub fn set_dst(&self, observed: bool, active: bool) -> Result<(), SetTimeError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.calendar.write(&mut *lock).dst = DstState { observed, active };
        Ok(())
    }

    /// Get the daylight saving time state.
    pub fn dst(&self) -> Result<DstState, GetTimeError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.calendar.read(&*lock).dst)
    }

    /// Register an alarm. It's inserted at the front of the alarm list, so
    /// it's checked before the alarms registered earlier.
    pub fn add_alarm(&self, alarm: Alarm) -> Result<AlarmId, AddAlarmError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let id = self.calendar.write(&mut *lock).add_alarm(alarm)?;
        log::trace!("add_alarm({alarm:?}) = {id:?}");
        Ok(id)
    }

    /// Unregister an alarm. Removing an alarm that is not registered is a
    /// no-op.
    pub fn remove_alarm(&self, id: AlarmId) -> Result<(), RemoveAlarmError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.calendar.write(&mut *lock).remove_alarm(id);
        log::trace!("remove_alarm({id:?})");
        Ok(())
    }

    /// The Overflow interrupt handler. Advances the calendar by one minute
    /// and dispatches the matching alarms.
    ///
    /// The matching alarms are determined before any of them is called, so
    /// an alarm added or removed by a callback doesn't affect the current
    /// minute.
    pub fn handle_overflow(&self) {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            log::warn!("handle_overflow: called with CPU Lock active");
            return;
        };

        let calendar = self.calendar.write(&mut *lock);
        let fired = calendar.advance_minute();
        log::trace!(
            "overflow: {:?}, {} alarm(s) matched",
            calendar.clock,
            fired.len()
        );
        drop(lock);

        for (callback, param) in fired {
            callback.call(param);
        }
    }
}
