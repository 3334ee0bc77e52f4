use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Half-open interval `[start, end)`. Back-to-back slots do not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Non-panicking constructor for untrusted input; `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Anything scheduled on a span.
pub trait Scheduled {
    fn span(&self) -> Span;
}

impl Scheduled for Span {
    fn span(&self) -> Span {
        *self
    }
}

/// Source of "now". Injected so window filters are deterministic under test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Returns `None` for empty or inverted ranges.
pub fn duration(span: &Span) -> Option<Ms> {
    let d = span.duration_ms();
    (d > 0).then_some(d)
}

/// True iff `span.start` lies in `[now, now + weeks * 7d]`.
pub fn within_window(span: &Span, clock: &dyn Clock, weeks: u32) -> bool {
    let now = clock.now_ms();
    let horizon = now.saturating_add(WEEK_MS.saturating_mul(weeks as Ms));
    now <= span.start && span.start <= horizon
}

/// Stable ascending sort by span start.
pub fn chronological_order<T: Scheduled>(mut items: Vec<T>) -> Vec<T> {
    items.sort_by_key(|i| i.span().start);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn nested_span_overlaps() {
        let outer = Span::new(0, 1000);
        let inner = Span::new(400, 500);
        assert!(overlaps(&outer, &inner));
        assert!(overlaps(&inner, &outer));
    }

    #[test]
    fn checked_rejects_empty_and_inverted() {
        assert!(Span::checked(10, 10).is_none());
        assert!(Span::checked(20, 10).is_none());
        assert_eq!(Span::checked(10, 20), Some(Span::new(10, 20)));
    }

    #[test]
    fn duration_positive_only() {
        assert_eq!(duration(&Span::new(0, HOUR_MS)), Some(HOUR_MS));
        let inverted = Span { start: 5, end: 1 };
        assert_eq!(duration(&inverted), None);
        let empty = Span { start: 5, end: 5 };
        assert_eq!(duration(&empty), None);
    }

    #[test]
    fn window_bounds_inclusive() {
        let clock = FixedClock::new(1_000);
        let at_now = Span::new(1_000, 2_000);
        let at_horizon = Span::new(1_000 + WEEK_MS, 2_000 + WEEK_MS);
        let past_horizon = Span::new(1_001 + WEEK_MS, 2_000 + WEEK_MS);
        let started = Span::new(999, 5_000);

        assert!(within_window(&at_now, &clock, 1));
        assert!(within_window(&at_horizon, &clock, 1));
        assert!(!within_window(&past_horizon, &clock, 1));
        assert!(within_window(&past_horizon, &clock, 2));
        assert!(!within_window(&started, &clock, 2));
    }

    #[test]
    fn window_follows_clock() {
        let clock = FixedClock::new(0);
        let span = Span::new(10 * DAY_MS, 10 * DAY_MS + HOUR_MS);
        assert!(!within_window(&span, &clock, 1));
        clock.advance(4 * DAY_MS);
        assert!(within_window(&span, &clock, 1));
        clock.set(11 * DAY_MS);
        assert!(!within_window(&span, &clock, 1));
    }

    #[test]
    fn chronological_order_is_stable() {
        #[derive(Debug, PartialEq)]
        struct Tagged(Span, &'static str);
        impl Scheduled for Tagged {
            fn span(&self) -> Span {
                self.0
            }
        }

        let sorted = chronological_order(vec![
            Tagged(Span::new(300, 400), "c"),
            Tagged(Span::new(100, 200), "a1"),
            Tagged(Span::new(100, 150), "a2"),
            Tagged(Span::new(200, 300), "b"),
        ]);
        let tags: Vec<_> = sorted.iter().map(|t| t.1).collect();
        assert_eq!(tags, vec!["a1", "a2", "b", "c"]);
    }

    fn span_strategy() -> impl Strategy<Value = Span> {
        (0i64..10_000, 1i64..5_000).prop_map(|(start, len)| Span::new(start, start + len))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn overlap_is_symmetric(a in span_strategy(), b in span_strategy()) {
            prop_assert_eq!(overlaps(&a, &b), overlaps(&b, &a));
        }

        #[test]
        fn non_empty_span_overlaps_itself(a in span_strategy()) {
            prop_assert!(overlaps(&a, &a));
        }

        #[test]
        fn adjacent_spans_never_overlap(a in span_strategy(), len in 1i64..5_000) {
            let next = Span::new(a.end, a.end + len);
            prop_assert!(!overlaps(&a, &next));
        }
    }
}
