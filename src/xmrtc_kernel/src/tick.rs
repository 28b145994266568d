//! Tick accounting on the wrapping RTC counter
use crate::{PortRtc, UTicks};

/// Busy-wait until register writes have propagated to the counter.
///
/// Must not be called with CPU Lock active.
pub(crate) fn wait_sync<Traits: PortRtc>() {
    while Traits::is_sync_busy() {
        core::hint::spin_loop();
    }
}

/// Calculate the number of ticks elapsed since `reference`, given a new
/// counter reading.
///
/// The counter counts `0..period`, so a reading smaller than the reference
/// means it wrapped once. An equal reading is ambiguous: it's counted as a
/// full lap in the Compare handler and as no time at all elsewhere. Compare
/// thresholds are kept short of a full lap, so the Compare handler only sees
/// one when the first timer has already expired.
pub(crate) fn elapsed_ticks(
    reference: UTicks,
    reading: UTicks,
    period: UTicks,
    from_compare_isr: bool,
) -> UTicks {
    use core::cmp::Ordering;
    match reading.cmp(&reference) {
        Ordering::Greater => reading - reference,
        Ordering::Less => (period - reference) + reading,
        Ordering::Equal if from_compare_isr => period,
        Ordering::Equal => 0,
    }
}
