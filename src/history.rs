//! Per-day aggregation of recorded price points, the input for trend charts.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};

use crate::entity::PricePoint;

/// Start of the window covering the last `weeks` weeks.
pub fn window_start(now: OffsetDateTime, weeks: u32) -> OffsetDateTime {
    now - Duration::weeks(i64::from(weeks))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub day: Date,
    pub low: Decimal,
    pub high: Decimal,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyHistory {
    /// Ascending by day, UTC.
    pub days: Vec<DaySummary>,
    pub points: usize,
}

impl DailyHistory {
    pub fn from_points(points: &[PricePoint]) -> Self {
        let mut days: BTreeMap<Date, DaySummary> = BTreeMap::new();
        for p in points {
            let day = p.timestamp.date();
            days.entry(day)
                .and_modify(|d| {
                    d.low = d.low.min(p.price);
                    d.high = d.high.max(p.price);
                    d.samples += 1;
                })
                .or_insert(DaySummary {
                    day,
                    low: p.price,
                    high: p.price,
                    samples: 1,
                });
        }
        Self {
            days: days.into_values().collect(),
            points: points.len(),
        }
    }

    pub fn best_price(&self) -> Option<Decimal> {
        self.days.iter().map(|d| d.low).min()
    }

    pub fn worst_price(&self) -> Option<Decimal> {
        self.days.iter().map(|d| d.high).max()
    }

    /// A trend line needs more than three points spread over more than three days.
    pub fn is_chartable(&self) -> bool {
        self.points > 3 && self.days.len() > 3
    }

    /// Suggested y-axis bounds: headroom below the best price, a little above the worst.
    pub fn axis_bounds(&self) -> Option<(Decimal, Decimal)> {
        let (best, worst) = (self.best_price()?, self.worst_price()?);
        let spread = worst - best;
        Some((best - spread * Decimal::TWO, worst + spread / Decimal::TWO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKey, EntityKind};
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn point(at: OffsetDateTime, price: Decimal) -> PricePoint {
        PricePoint {
            key: EntityKey::new(EntityKind::Product, 1),
            price,
            timestamp: at,
        }
    }

    #[test]
    fn groups_by_day_with_low_and_high() {
        let h = DailyHistory::from_points(&[
            point(datetime!(2024-03-01 08:00 UTC), dec!(10)),
            point(datetime!(2024-03-01 20:00 UTC), dec!(12)),
            point(datetime!(2024-03-02 09:30 UTC), dec!(9.5)),
        ]);
        assert_eq!(h.days.len(), 2);
        assert_eq!(h.days[0].low, dec!(10));
        assert_eq!(h.days[0].high, dec!(12));
        assert_eq!(h.days[0].samples, 2);
        assert_eq!(h.best_price(), Some(dec!(9.5)));
        assert_eq!(h.worst_price(), Some(dec!(12)));
        assert_eq!(h.axis_bounds(), Some((dec!(4.5), dec!(13.25))));
    }

    #[test]
    fn short_histories_are_not_charted() {
        let three_days = DailyHistory::from_points(&[
            point(datetime!(2024-03-01 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-02 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-03 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-03 09:00 UTC), dec!(1)),
        ]);
        assert!(!three_days.is_chartable());

        let four_days = DailyHistory::from_points(&[
            point(datetime!(2024-03-01 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-02 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-03 08:00 UTC), dec!(1)),
            point(datetime!(2024-03-04 08:00 UTC), dec!(1)),
        ]);
        assert!(four_days.is_chartable());
    }

    #[test]
    fn empty_history_has_no_extremes() {
        let h = DailyHistory::from_points(&[]);
        assert_eq!(h.best_price(), None);
        assert_eq!(h.axis_bounds(), None);
        assert!(!h.is_chartable());
    }

    #[test]
    fn window_counts_whole_weeks() {
        let now = datetime!(2024-03-15 12:00 UTC);
        assert_eq!(window_start(now, 2), datetime!(2024-03-01 12:00 UTC));
    }
}
