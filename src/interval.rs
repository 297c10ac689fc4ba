//! Calendar date intervals usable as task parameters.
//!
//! A pipeline that aggregates daily partitions usually takes its window as a
//! single parameter, for example "the ISO week containing 2018-03-07". The
//! interval renders to a short stable text (`2018-W10`), which is what ends up
//! in the salted version and, usually, in the output path.

use std::fmt::{self, Display};

use chrono::{Datelike, Days, Months, NaiveDate};

/// How an interval was defined, which decides how it is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntervalKind {
    /// A single day.
    Date,
    /// An ISO 8601 week, Monday through Sunday.
    Week,
    /// A calendar month.
    Month,
    /// A calendar year.
    Year,
    /// Arbitrary range.
    Custom,
}

/// A contiguous, non-empty range of calendar days. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateInterval {
    start: NaiveDate,
    end: NaiveDate,
    kind: IntervalKind,
}

impl DateInterval {
    pub fn date(date: NaiveDate) -> Option<Self> {
        Some(Self {
            start: date,
            end: date.checked_add_days(Days::new(1))?,
            kind: IntervalKind::Date,
        })
    }

    /// The ISO week containing `date`.
    pub fn week_of(date: NaiveDate) -> Option<Self> {
        let back = date.weekday().num_days_from_monday();
        let start = date.checked_sub_days(Days::new(back.into()))?;
        Some(Self {
            start,
            end: start.checked_add_days(Days::new(7))?,
            kind: IntervalKind::Week,
        })
    }

    /// The calendar month containing `date`.
    pub fn month_of(date: NaiveDate) -> Option<Self> {
        let start = date.with_day(1)?;
        Some(Self {
            start,
            end: start.checked_add_months(Months::new(1))?,
            kind: IntervalKind::Month,
        })
    }

    /// The calendar year containing `date`.
    pub fn year_of(date: NaiveDate) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(date.year(), 1, 1)?;
        Some(Self {
            start,
            end: start.checked_add_months(Months::new(12))?,
            kind: IntervalKind::Year,
        })
    }

    /// Returns `None` if `end` is not strictly after `start`.
    pub fn custom(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self {
            start,
            end,
            kind: IntervalKind::Custom,
        })
    }

    pub fn kind(&self) -> IntervalKind {
        self.kind
    }

    /// First day of the interval.
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// First day after the interval.
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// All days of the interval in ascending order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |date| *date < end)
    }
}

impl Display for DateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start;
        match self.kind {
            IntervalKind::Date => write!(f, "{}", start.format("%Y-%m-%d")),
            IntervalKind::Week => {
                let iso = start.iso_week();
                write!(f, "{:04}-W{:02}", iso.year(), iso.week())
            }
            IntervalKind::Month => write!(f, "{}", start.format("%Y-%m")),
            IntervalKind::Year => write!(f, "{:04}", start.year()),
            IntervalKind::Custom => write!(
                f,
                "{}-{}",
                start.format("%Y-%m-%d"),
                self.end.format("%Y-%m-%d")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn week_of_wednesday() {
        let week = DateInterval::week_of(ymd(2018, 3, 7)).unwrap();
        assert_eq!(week.to_string(), "2018-W10");
        assert_eq!(week.start(), ymd(2018, 3, 5));
        assert_eq!(week.end(), ymd(2018, 3, 12));

        let dates: Vec<_> = week.dates().collect();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[0], ymd(2018, 3, 5));
        assert_eq!(dates[6], ymd(2018, 3, 11));
    }

    #[test]
    fn week_crossing_year_boundary() {
        // 2021-01-01 is a Friday, it belongs to 2020-W53
        let week = DateInterval::week_of(ymd(2021, 1, 1)).unwrap();
        assert_eq!(week.to_string(), "2020-W53");
        assert!(week.contains(ymd(2020, 12, 28)));
        assert!(week.contains(ymd(2021, 1, 3)));
        assert!(!week.contains(ymd(2021, 1, 4)));
    }

    #[test]
    fn same_week_from_any_day() {
        let monday = DateInterval::week_of(ymd(2018, 3, 5)).unwrap();
        let sunday = DateInterval::week_of(ymd(2018, 3, 11)).unwrap();
        assert_eq!(monday, sunday);
    }

    #[test]
    fn month_and_year() {
        let feb = DateInterval::month_of(ymd(2020, 2, 14)).unwrap();
        assert_eq!(feb.to_string(), "2020-02");
        assert_eq!(feb.dates().count(), 29);

        let year = DateInterval::year_of(ymd(2019, 7, 1)).unwrap();
        assert_eq!(year.to_string(), "2019");
        assert_eq!(year.dates().count(), 365);
    }

    #[test]
    fn custom_range_is_end_exclusive() {
        assert!(DateInterval::custom(ymd(2018, 3, 5), ymd(2018, 3, 5)).is_none());

        let range = DateInterval::custom(ymd(2018, 3, 5), ymd(2018, 3, 8)).unwrap();
        assert_eq!(range.to_string(), "2018-03-05-2018-03-08");
        assert_eq!(range.dates().count(), 3);
    }

    #[test]
    fn single_date() {
        let day = DateInterval::date(ymd(2018, 3, 1)).unwrap();
        assert_eq!(day.to_string(), "2018-03-01");
        assert_eq!(day.dates().collect::<Vec<_>>(), vec![ymd(2018, 3, 1)]);
    }
}
