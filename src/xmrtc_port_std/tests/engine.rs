//! Runs the engine on the simulated peripheral.
//!
//! Every test case gets its own system type and `Rtc` instance. The counter
//! runs at 1 tick/s, so one lap is 60 ticks.
use std::sync::Mutex;
use xmrtc_kernel::{
    calendar::{Alarm, CalendarTime, DayMask, DayOfWeek, DstState},
    error::*,
    timer::{TimerId, TimerSettings},
    Callback, ClockSource, InterruptLevel, Prescaler, Rtc, RtcOptions, UTicks,
};

fn settings(
    interval: UTicks,
    repeat: bool,
    callback: &'static dyn Callback,
    param: usize,
) -> TimerSettings {
    TimerSettings {
        interval,
        repeat,
        callback,
        param,
    }
}

fn alarm(days: DayMask, hour: u8, minute: u8, callback: &'static dyn Callback, param: usize) -> Alarm {
    Alarm {
        days,
        hour,
        minute,
        callback,
        param,
    }
}

fn date_time(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> CalendarTime {
    CalendarTime {
        year,
        month,
        day,
        dayofweek: None,
        hour,
        minute,
        second,
    }
}

macro_rules! rtc_tests {
    (
        $(
            $(#[doc = $doc:literal])*
            fn $name:ident() $( where OVERFLOW_LEVEL = $overflow_level:ident )? $body:block
        )*
    ) => {$(
        $(#[doc = $doc])*
        mod $name {
            #[allow(unused_imports)]
            use super::*;

            xmrtc_port_std::use_port!(unsafe struct SystemTraits);

            impl RtcOptions for SystemTraits {
                const CLOCK_SOURCE: ClockSource = ClockSource::Tosc1024Hz;
                const PRESCALER: Prescaler = Prescaler::Div1024;
                $( const OVERFLOW_LEVEL: InterruptLevel = InterruptLevel::$overflow_level; )?
            }

            static RTC: Rtc<SystemTraits, 4, 4> = Rtc::new();

            static EVENTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

            /// Records `param` in `EVENTS`.
            struct Record;

            impl Callback for Record {
                fn call(&self, param: usize) {
                    EVENTS.lock().unwrap().push(param);
                }
            }

            #[allow(dead_code)]
            static RECORD: Record = Record;

            #[allow(dead_code)]
            fn take_events() -> Vec<usize> {
                std::mem::take(&mut *EVENTS.lock().unwrap())
            }

            /// Advance the counter one tick at a time. Return `(tick, param)`
            /// for every callback, where `tick` counts from `1`.
            #[allow(dead_code)]
            fn tick(ticks: u32) -> Vec<(u32, usize)> {
                let mut fired = Vec::new();
                for t in 1..=ticks {
                    xmrtc_port_std::advance::<SystemTraits>(1);
                    fired.extend(take_events().into_iter().map(|param| (t, param)));
                }
                fired
            }

            #[test]
            fn run() {
                xmrtc_port_std::init_logger();
                xmrtc_port_std::bind_interrupts::<SystemTraits>(
                    || RTC.handle_overflow(),
                    || RTC.handle_compare(),
                );
                RTC.init().unwrap();
                $body
            }
        }
    )*};
}

rtc_tests! {
    /// `init` programs a one-minute lap and `uninit` stops everything.
    fn init_and_uninit() {
        let regs = xmrtc_port_std::registers::<SystemTraits>();
        assert_eq!(regs.period, 60);
        assert_eq!(regs.counter, 0);
        assert!(regs.running);
        assert_eq!(regs.overflow_level, InterruptLevel::Low);
        assert_eq!(regs.compare_level, InterruptLevel::Off);

        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(10, false, &RECORD, 1))).unwrap();
        assert_eq!(
            xmrtc_port_std::registers::<SystemTraits>().compare_level,
            InterruptLevel::Medium
        );

        RTC.uninit().unwrap();
        let regs = xmrtc_port_std::registers::<SystemTraits>();
        assert!(!regs.running);
        assert_eq!(regs.overflow_level, InterruptLevel::Off);
        assert_eq!(regs.compare_level, InterruptLevel::Off);

        assert_eq!(tick(120), [] as [(u32, usize); 0]);
        assert_eq!(RTC.time().unwrap(), CalendarTime::EPOCH);

        // Re-initialization releases every timer
        RTC.init().unwrap();
        assert_eq!(RTC.start_timer(a, None), Err(StartTimerError::NoAccess));
    }

    /// The calendar starts at the epoch and advances once per lap.
    fn calendar_runs_from_epoch() {
        assert_eq!(RTC.time().unwrap(), CalendarTime::EPOCH);

        tick(59);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                second: 59,
                ..CalendarTime::EPOCH
            }
        );

        tick(1);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                minute: 1,
                ..CalendarTime::EPOCH
            }
        );

        xmrtc_port_std::advance::<SystemTraits>(24 * 3600 - 60);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                dayofweek: Some(DayOfWeek::Sunday),
                ..date_time(2000, 1, 2, 0, 0, 0)
            }
        );
    }

    /// `set_time` derives the day of the week and the counter value.
    fn set_time_rolls_over_year() {
        RTC.set_time(&date_time(2021, 12, 31, 23, 59, 30)).unwrap();
        assert_eq!(xmrtc_port_std::registers::<SystemTraits>().counter, 30);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                dayofweek: Some(DayOfWeek::Friday),
                ..date_time(2021, 12, 31, 23, 59, 30)
            }
        );

        tick(30);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                dayofweek: Some(DayOfWeek::Saturday),
                ..date_time(2022, 1, 1, 0, 0, 0)
            }
        );
    }

    /// Alarms fire on the matching days of the week only.
    fn alarms() {
        // A Monday
        RTC.set_time(&date_time(2021, 6, 14, 7, 29, 0)).unwrap();
        RTC.add_alarm(alarm(DayMask::MONDAY, 7, 30, &RECORD, 1)).unwrap();
        RTC.add_alarm(alarm(DayMask::WEEKENDS, 7, 30, &RECORD, 2)).unwrap();
        let every_day = RTC
            .add_alarm(alarm(DayMask::EVERY_DAY, 7, 31, &RECORD, 3))
            .unwrap();

        assert_eq!(tick(60), [(60, 1)]);
        assert_eq!(tick(60), [(60, 3)]);

        RTC.remove_alarm(every_day).unwrap();
        // Removing it again is a no-op
        RTC.remove_alarm(every_day).unwrap();

        // Saturday, 07:29
        xmrtc_port_std::advance::<SystemTraits>(5 * 24 * 3600 - 120);
        assert_eq!(take_events(), [] as [usize; 0]);
        assert_eq!(
            RTC.time().unwrap(),
            CalendarTime {
                dayofweek: Some(DayOfWeek::Saturday),
                ..date_time(2021, 6, 19, 7, 29, 0)
            }
        );
        assert_eq!(tick(60), [(60, 2)]);
    }

    /// The alarm pool has a fixed capacity.
    fn alarm_pool_overflow() {
        let ids: Vec<_> = (0..4)
            .map(|i| RTC.add_alarm(alarm(DayMask::SUNDAY, 0, 0, &RECORD, i)).unwrap())
            .collect();
        assert_eq!(
            RTC.add_alarm(alarm(DayMask::SUNDAY, 0, 0, &RECORD, 4)),
            Err(AddAlarmError::QueueOverflow)
        );

        RTC.remove_alarm(ids[2]).unwrap();
        RTC.add_alarm(alarm(DayMask::SUNDAY, 0, 0, &RECORD, 4)).unwrap();
    }

    /// The clock springs forward and falls back on the US DST dates.
    fn daylight_saving_time() {
        RTC.set_dst(true, false).unwrap();

        RTC.set_time(&date_time(2021, 3, 14, 1, 59, 0)).unwrap();
        tick(60);
        assert_eq!(RTC.time().unwrap().hour, 3);
        assert_eq!(
            RTC.dst().unwrap(),
            DstState {
                observed: true,
                active: true
            }
        );

        RTC.set_time(&date_time(2021, 11, 7, 1, 59, 0)).unwrap();
        tick(60);
        assert_eq!(RTC.time().unwrap().hour, 1);
        assert!(!RTC.dst().unwrap().active);

        // The repeated hour doesn't fall back again
        tick(3600);
        assert_eq!(RTC.time().unwrap().hour, 2);
    }

    /// Timers fire in order of expiration, ties in the order they were
    /// started.
    fn timers_fire_in_order() {
        let [a, b, c] = [(); 3].map(|()| RTC.create_timer().unwrap());
        RTC.start_timer(a, Some(&settings(5, false, &RECORD, 0xa))).unwrap();
        RTC.start_timer(b, Some(&settings(3, false, &RECORD, 0xb))).unwrap();
        RTC.start_timer(c, Some(&settings(3, false, &RECORD, 0xc))).unwrap();

        assert_eq!(tick(10), [(3, 0xb), (3, 0xc), (5, 0xa)]);
        assert_eq!(
            xmrtc_port_std::registers::<SystemTraits>().compare_level,
            InterruptLevel::Off
        );
        assert_eq!(RTC.timer_remaining(a), Ok(None));
    }

    /// A stopped timer keeps its remaining time and doesn't disturb the
    /// others.
    fn stop_and_resume() {
        let [a, b] = [(); 2].map(|()| RTC.create_timer().unwrap());
        RTC.start_timer(a, Some(&settings(10, false, &RECORD, 0xa))).unwrap();
        RTC.start_timer(b, Some(&settings(15, false, &RECORD, 0xb))).unwrap();
        tick(4);

        RTC.stop_timer(a).unwrap();
        assert_eq!(RTC.timer_remaining(a), Ok(None));
        assert_eq!(RTC.timer_remaining(b), Ok(Some(11)));

        // No effect
        RTC.stop_timer(a).unwrap();

        assert_eq!(tick(20), [(11, 0xb)]);

        RTC.start_timer(a, None).unwrap();
        assert_eq!(RTC.timer_remaining(a), Ok(Some(6)));
        assert_eq!(tick(10), [(6, 0xa)]);
    }

    /// A periodic timer is rescheduled with its interval.
    fn periodic_timer() {
        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(7, true, &RECORD, 1))).unwrap();
        assert_eq!(
            tick(35),
            [(7, 1), (14, 1), (21, 1), (28, 1), (35, 1)]
        );

        RTC.stop_timer(a).unwrap();
        assert_eq!(tick(20), [] as [(u32, usize); 0]);
    }

    /// An interval longer than one lap is approached in steps shorter than a
    /// lap.
    fn long_timer() {
        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(150, false, &RECORD, 1))).unwrap();
        assert_eq!(tick(200), [(150, 1)]);
        assert_eq!(RTC.time().unwrap().minute, 3);
    }

    /// A zero interval expires immediately.
    fn zero_interval() {
        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(0, false, &RECORD, 1))).unwrap();
        assert_eq!(take_events(), [1]);
    }

    /// Restarting a running timer rearms it.
    fn restart() {
        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(10, false, &RECORD, 1))).unwrap();
        tick(6);
        RTC.start_timer(a, Some(&settings(10, false, &RECORD, 2))).unwrap();
        assert_eq!(tick(20), [(10, 2)]);
    }

    /// A callback may start another timer.
    fn callback_starts_timer() {
        static NEXT: Mutex<Option<TimerId>> = Mutex::new(None);

        struct Chain;

        impl Callback for Chain {
            fn call(&self, param: usize) {
                RECORD.call(param);
                if let Some(id) = *NEXT.lock().unwrap() {
                    RTC.start_timer(id, Some(&settings(4, false, &RECORD, 0xb)))
                        .unwrap();
                }
            }
        }

        static CHAIN: Chain = Chain;

        let [a, b] = [(); 2].map(|()| RTC.create_timer().unwrap());
        *NEXT.lock().unwrap() = Some(b);
        RTC.start_timer(a, Some(&settings(3, false, &CHAIN, 0xa))).unwrap();
        assert_eq!(tick(10), [(3, 0xa), (7, 0xb)]);
    }

    /// Overflow outranks Compare. An alarm that stops the first timer on the
    /// tick its Compare matches cancels it, and the next timer stays on
    /// schedule.
    fn alarm_stops_timer_on_lap_boundary() where OVERFLOW_LEVEL = High {
        static FIRST: Mutex<Option<TimerId>> = Mutex::new(None);

        struct StopFirst;

        impl Callback for StopFirst {
            fn call(&self, param: usize) {
                RECORD.call(param);
                if let Some(id) = *FIRST.lock().unwrap() {
                    RTC.stop_timer(id).unwrap();
                }
            }
        }

        static STOP_FIRST: StopFirst = StopFirst;

        let [a, b] = [(); 2].map(|()| RTC.create_timer().unwrap());
        *FIRST.lock().unwrap() = Some(a);
        RTC.add_alarm(alarm(DayMask::EVERY_DAY, 0, 1, &STOP_FIRST, 0x1)).unwrap();
        RTC.start_timer(a, Some(&settings(60, false, &RECORD, 0xa))).unwrap();
        RTC.start_timer(b, Some(&settings(90, false, &RECORD, 0xb))).unwrap();

        assert_eq!(tick(100), [(60, 0x1), (90, 0xb)]);
        assert_eq!(RTC.timer_remaining(a), Ok(None));
        assert_eq!(RTC.timer_remaining(b), Ok(None));
    }

    /// Timers keep their remaining time when the counter is rewritten by
    /// `set_time`.
    fn set_time_keeps_timers() {
        let a = RTC.create_timer().unwrap();
        RTC.start_timer(a, Some(&settings(30, false, &RECORD, 1))).unwrap();
        tick(10);

        RTC.set_time(&CalendarTime {
            second: 45,
            ..CalendarTime::EPOCH
        })
        .unwrap();
        assert_eq!(RTC.timer_remaining(a), Ok(Some(20)));

        assert_eq!(tick(25), [(20, 1)]);
        let time = RTC.time().unwrap();
        assert_eq!((time.minute, time.second), (1, 10));
    }

    /// Stale handles are rejected, and deleting a scheduled timer cancels it.
    fn timer_handles() {
        let a = RTC.create_timer().unwrap();
        RTC.delete_timer(a).unwrap();
        assert_eq!(RTC.start_timer(a, None), Err(StartTimerError::NoAccess));
        assert_eq!(RTC.stop_timer(a), Err(StopTimerError::NoAccess));
        assert_eq!(RTC.timer_remaining(a), Err(StopTimerError::NoAccess));
        assert_eq!(RTC.delete_timer(a), Err(DeleteTimerError::NoAccess));

        let ids: Vec<_> = (0..4).map(|_| RTC.create_timer().unwrap()).collect();
        assert_eq!(RTC.create_timer(), Err(CreateTimerError::QueueOverflow));
        assert!(!ids.contains(&a));

        RTC.start_timer(ids[0], Some(&settings(5, false, &RECORD, 1))).unwrap();
        RTC.delete_timer(ids[0]).unwrap();
        assert_eq!(tick(10), [] as [(u32, usize); 0]);
    }

    /// Every operation fails while CPU Lock is held.
    fn bad_context() {
        let a = RTC.create_timer().unwrap();

        let lock = xmrtc_port_std::lock_cpu::<SystemTraits>().unwrap();
        assert!(xmrtc_port_std::lock_cpu::<SystemTraits>().is_none());

        assert_eq!(RTC.init(), Err(InitError::BadContext));
        assert_eq!(RTC.time(), Err(GetTimeError::BadContext));
        assert_eq!(
            RTC.set_time(&CalendarTime::EPOCH),
            Err(SetTimeError::BadContext)
        );
        assert_eq!(RTC.dst(), Err(GetTimeError::BadContext));
        assert_eq!(
            RTC.add_alarm(alarm(DayMask::SUNDAY, 0, 0, &RECORD, 0)),
            Err(AddAlarmError::BadContext)
        );
        assert_eq!(RTC.create_timer(), Err(CreateTimerError::BadContext));
        assert_eq!(RTC.start_timer(a, None), Err(StartTimerError::BadContext));
        assert_eq!(RTC.stop_timer(a), Err(StopTimerError::BadContext));
        assert_eq!(RTC.delete_timer(a), Err(DeleteTimerError::BadContext));

        drop(lock);
        assert_eq!(RTC.time(), Ok(CalendarTime::EPOCH));
        RTC.delete_timer(a).unwrap();
    }
}
