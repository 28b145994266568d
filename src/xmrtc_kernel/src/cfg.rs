//! Static configuration of the RTC peripheral
use core::fmt;

use crate::UTicks;

/// The largest counter lap the 16-bit period register can express.
pub const MAX_PERIOD: UTicks = 0x1_0000;

/// The clock source feeding the RTC prescaler.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClockSource {
    /// 1 kHz from the internal ultra low power oscillator
    Ulp1kHz,
    /// 1.024 kHz from the external 32.768 kHz crystal oscillator
    Tosc1024Hz,
    /// 1.024 kHz from the internal 32.768 kHz RC oscillator
    RcOsc1024Hz,
    /// 32.768 kHz from the external crystal oscillator
    Tosc32kHz,
    /// 32.768 kHz from the internal RC oscillator
    RcOsc32kHz,
}

impl ClockSource {
    /// Get the frequency of the clock source, measured in hertz.
    pub const fn frequency(self) -> u32 {
        match self {
            Self::Ulp1kHz => 1000,
            Self::Tosc1024Hz | Self::RcOsc1024Hz => 1024,
            Self::Tosc32kHz | Self::RcOsc32kHz => 32768,
        }
    }
}

/// The division ratio of the RTC prescaler.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Prescaler {
    Div1,
    Div2,
    Div8,
    Div16,
    Div64,
    Div256,
    Div1024,
}

impl Prescaler {
    pub const fn divisor(self) -> u32 {
        match self {
            Self::Div1 => 1,
            Self::Div2 => 2,
            Self::Div8 => 8,
            Self::Div16 => 16,
            Self::Div64 => 64,
            Self::Div256 => 256,
            Self::Div1024 => 1024,
        }
    }
}

/// Interrupt priority level. `Off` leaves the interrupt masked even when
/// the engine enables it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum InterruptLevel {
    Off,
    Low,
    Medium,
    High,
}

/// Implemented by an application on its system type to configure the RTC.
pub trait RtcOptions {
    const CLOCK_SOURCE: ClockSource;
    const PRESCALER: Prescaler;

    /// The level of the Overflow interrupt, which drives the calendar.
    const OVERFLOW_LEVEL: InterruptLevel = InterruptLevel::Low;

    /// The level of the Compare interrupt, which drives the timers.
    const COMPARE_LEVEL: InterruptLevel = InterruptLevel::Medium;
}

/// Error type for [`RtcCfg::new`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CfgError {
    /// The prescaler doesn't divide the clock frequency evenly, so a second
    /// is not an integral number of ticks.
    NonIntegralTickRate,
    /// One minute doesn't fit in the period register.
    PeriodOutOfRange,
}

impl CfgError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NonIntegralTickRate => {
                "the prescaler must divide the clock source frequency evenly"
            }
            Self::PeriodOutOfRange => {
                "one minute measured in ticks must be in range `1..=0x10000`; \
                choose a larger prescaler"
            }
        }
    }

    pub const fn panic(self) -> ! {
        match self {
            Self::NonIntegralTickRate => {
                panic!("the prescaler must divide the clock source frequency evenly")
            }
            Self::PeriodOutOfRange => panic!(
                "one minute measured in ticks must be in range `1..=0x10000`; \
                choose a larger prescaler"
            ),
        }
    }
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parameters derived from [`RtcOptions`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RtcCfg {
    pub clock_source: ClockSource,
    pub prescaler: Prescaler,
    pub overflow_level: InterruptLevel,
    pub compare_level: InterruptLevel,
    /// The counter frequency.
    pub ticks_per_second: UTicks,
    /// The length of one counter lap (one minute), measured in ticks.
    pub period: UTicks,
}

impl RtcCfg {
    /// Validate the options and derive the counter parameters.
    pub const fn new(
        clock_source: ClockSource,
        prescaler: Prescaler,
        overflow_level: InterruptLevel,
        compare_level: InterruptLevel,
    ) -> Result<Self, CfgError> {
        let clock = clock_source.frequency();
        let divisor = prescaler.divisor();

        if clock % divisor != 0 {
            return Err(CfgError::NonIntegralTickRate);
        }

        let ticks_per_second = clock / divisor;
        let period = ticks_per_second * 60;

        if period == 0 || period > MAX_PERIOD {
            return Err(CfgError::PeriodOutOfRange);
        }

        Ok(Self {
            clock_source,
            prescaler,
            overflow_level,
            compare_level,
            ticks_per_second,
            period,
        })
    }
}

/// Provides the validated [`RtcCfg`] for a system type.
pub(crate) trait RtcOptionsExt: RtcOptions {
    const CFG: RtcCfg;
}

impl<T: RtcOptions + ?Sized> RtcOptionsExt for T {
    const CFG: RtcCfg = match RtcCfg::new(
        T::CLOCK_SOURCE,
        T::PRESCALER,
        T::OVERFLOW_LEVEL,
        T::COMPARE_LEVEL,
    ) {
        Ok(x) => x,
        Err(e) => e.panic(),
    };
}
