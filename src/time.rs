//! Presentation clock handling.
//!
//! Page-flip completion events carry timestamps in the clock domain the
//! driver was built for, which is not necessarily the monotonic clock the
//! compositor schedules rendering with. [`convert_timestamp`] translates
//! between the two domains without relying on cross-domain epoch
//! arithmetic: both clocks are sampled "now", the age of the timestamp is
//! computed in the source domain and re-applied in the target domain.

use std::mem::MaybeUninit;
use std::time::Duration;

/// The clock domain a device delivers its timestamps in.
///
/// Probed once at device initialization from
/// [`DriverCapability::MonotonicTimestamp`](drm::DriverCapability).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    /// `CLOCK_MONOTONIC` timestamps
    Monotonic,
    /// `CLOCK_REALTIME` timestamps
    Realtime,
}

impl ClockDomain {
    /// The unix clock id of this domain
    pub fn id(self) -> libc::clockid_t {
        match self {
            ClockDomain::Monotonic => libc::CLOCK_MONOTONIC,
            ClockDomain::Realtime => libc::CLOCK_REALTIME,
        }
    }

    /// Samples the current time of this clock as a duration since its epoch
    pub fn now(self) -> Duration {
        let mut tp = MaybeUninit::zeroed();
        // clock_gettime on a constant, valid clock id cannot fail
        let tp = unsafe {
            libc::clock_gettime(self.id(), tp.as_mut_ptr());
            tp.assume_init()
        };
        Duration::new(tp.tv_sec.max(0) as u64, tp.tv_nsec as u32)
    }
}

/// Converts `timestamp` from the `source` clock domain into the `target` one.
///
/// Identical domains are the identity transform. The conversion tolerates
/// drift between event arrival and sampling, the error is bounded by the
/// time between the two `now` samples.
pub fn convert_timestamp(source: ClockDomain, target: ClockDomain, timestamp: Duration) -> Duration {
    if source == target {
        return timestamp;
    }
    convert_with_reference(timestamp, source.now(), target.now())
}

fn convert_with_reference(timestamp: Duration, source_now: Duration, target_now: Duration) -> Duration {
    let age = source_now.saturating_sub(timestamp);
    target_now.saturating_sub(age)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identical_domains_are_identity() {
        let ts = Duration::new(1234, 5678);
        assert_eq!(convert_timestamp(ClockDomain::Monotonic, ClockDomain::Monotonic, ts), ts);
        assert_eq!(convert_timestamp(ClockDomain::Realtime, ClockDomain::Realtime, ts), ts);
    }

    #[test]
    fn fixed_delta_between_domains() {
        // realtime runs exactly 1000s ahead of monotonic
        let delta = Duration::from_secs(1000);
        let source_now = Duration::from_secs(2000);
        let target_now = source_now + delta;

        // an event 16ms in the past keeps its age across domains
        let ts = source_now - Duration::from_millis(16);
        let converted = convert_with_reference(ts, source_now, target_now);
        assert_eq!(converted, target_now - Duration::from_millis(16));
    }

    #[test]
    fn repeated_conversion_converges() {
        let delta = Duration::from_secs(77);
        let mut source_now = Duration::from_secs(500);
        for frame in 0..120u64 {
            source_now += Duration::from_micros(16_667);
            let ts = source_now - Duration::from_millis(1);
            let converted = convert_with_reference(ts, source_now, source_now + delta);
            let expected = ts + delta;
            assert_eq!(converted, expected, "frame {}", frame);
        }
    }

    #[test]
    fn future_timestamp_saturates() {
        let source_now = Duration::from_secs(10);
        let target_now = Duration::from_secs(5);
        // timestamp slightly ahead of "now" clamps to no age
        let ts = source_now + Duration::from_millis(2);
        assert_eq!(convert_with_reference(ts, source_now, target_now), target_now);
    }
}
