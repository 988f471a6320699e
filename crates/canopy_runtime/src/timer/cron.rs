//! Cron schedule expressions.
//!
//! Six fields, `second minute hour day-of-month month day-of-week`, or five
//! with the seconds field omitted (treated as `0`). Each field accepts `*`,
//! single values, `a-b` ranges, `,` lists and a `/step` suffix. The two day
//! fields also accept `?` as a synonym for `*`. Day-of-week runs `0-6` from
//! Sunday; `7` is accepted as Sunday too.
//!
//! Both day fields must match for a date to be selected.

use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },
    #[error("invalid step in {field}: {value:?}")]
    InvalidStep { field: &'static str, value: String },
}

struct Bounds {
    name: &'static str,
    min: u32,
    max: u32,
}

const SECONDS: Bounds = Bounds { name: "second", min: 0, max: 59 };
const MINUTES: Bounds = Bounds { name: "minute", min: 0, max: 59 };
const HOURS: Bounds = Bounds { name: "hour", min: 0, max: 23 };
const DAYS_OF_MONTH: Bounds = Bounds { name: "day-of-month", min: 1, max: 31 };
const MONTHS: Bounds = Bounds { name: "month", min: 1, max: 12 };
const DAYS_OF_WEEK: Bounds = Bounds { name: "day-of-week", min: 0, max: 7 };

/// A parsed schedule. Each field is a bit set of the values it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpr {
    sec: u64,
    min: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            6 => (parse_field(fields[0], &SECONDS, false)?, &fields[1..]),
            5 => (1 << 0, &fields[..]),
            n => return Err(CronError::FieldCount(n)),
        };

        let mut dow = parse_field(rest[4], &DAYS_OF_WEEK, true)?;
        if dow & (1 << 7) != 0 {
            dow = (dow | 1) & !(1 << 7);
        }

        Ok(Self {
            sec,
            min: parse_field(rest[0], &MINUTES, false)?,
            hour: parse_field(rest[1], &HOURS, false)?,
            dom: parse_field(rest[2], &DAYS_OF_MONTH, true)?,
            month: parse_field(rest[3], &MONTHS, false)?,
            dow,
        })
    }

    /// First matching instant strictly after `after`, searching through the
    /// end of the following year.
    pub fn next(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let year_limit = t.year() + 1;

        loop {
            if t.year() > year_limit {
                return None;
            }
            if !matches(self.month, t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !matches(self.dom, t.day()) || !matches(self.dow, t.weekday().num_days_from_sunday()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !matches(self.hour, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !matches(self.min, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !matches(self.sec, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn matches(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_value(raw: &str, bounds: &Bounds) -> Result<u32, CronError> {
    let value: u32 = raw.parse().map_err(|_| CronError::InvalidValue {
        field: bounds.name,
        value: raw.to_string(),
    })?;
    if value < bounds.min || value > bounds.max {
        return Err(CronError::OutOfRange {
            field: bounds.name,
            value,
            min: bounds.min,
            max: bounds.max,
        });
    }
    Ok(value)
}

fn parse_field(field: &str, bounds: &Bounds, allow_any: bool) -> Result<u64, CronError> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| CronError::InvalidStep {
                    field: bounds.name,
                    value: part.to_string(),
                })?;
                if step == 0 {
                    return Err(CronError::InvalidStep { field: bounds.name, value: part.to_string() });
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = match range {
            "*" => (bounds.min, bounds.max),
            "?" if allow_any => (bounds.min, bounds.max),
            _ => match range.split_once('-') {
                Some((a, b)) => (parse_value(a, bounds)?, parse_value(b, bounds)?),
                // `5/15` means every 15 starting at 5
                None if step.is_some() => (parse_value(range, bounds)?, bounds.max),
                None => {
                    let v = parse_value(range, bounds)?;
                    (v, v)
                }
            },
        };
        if start > end {
            return Err(CronError::InvalidValue { field: bounds.name, value: part.to_string() });
        }

        let step = step.unwrap_or(1);
        let mut v = start;
        while v <= end {
            bits |= 1 << v;
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, s).unwrap()
    }

    #[test]
    fn every_second_advances_by_one() {
        let expr = CronExpr::parse("* * * * * *").unwrap();
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 1, 1, 0, 0, 1)));
    }

    #[test]
    fn five_fields_fire_on_the_minute() {
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        assert_eq!(expr.next(at(2024, 3, 10, 1, 0, 0)), Some(at(2024, 3, 10, 2, 30, 0)));
        assert_eq!(expr.next(at(2024, 3, 10, 2, 30, 0)), Some(at(2024, 3, 11, 2, 30, 0)));
    }

    #[test]
    fn steps_lists_and_ranges() {
        let expr = CronExpr::parse("*/15 0 9-10 * * 1,3").unwrap();
        // 2024-01-01 was a Monday
        assert_eq!(expr.next(at(2024, 1, 1, 9, 0, 50)), Some(at(2024, 1, 1, 10, 0, 0)));
        assert_eq!(expr.next(at(2024, 1, 1, 10, 0, 45)), Some(at(2024, 1, 3, 9, 0, 0)));
    }

    #[test]
    fn both_day_fields_must_match() {
        // 13th falling on a Friday; the next one after 2024-01-01 is 2024-09-13
        let expr = CronExpr::parse("0 0 0 13 * 5").unwrap();
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 9, 13, 0, 0, 0)));
    }

    #[test]
    fn sunday_as_seven_and_question_mark() {
        let a = CronExpr::parse("0 0 12 ? * 7").unwrap();
        let b = CronExpr::parse("0 0 12 * * 0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn impossible_dates_give_up() {
        let expr = CronExpr::parse("0 0 0 30 2 *").unwrap();
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn oversized_step_keeps_only_the_start() {
        let expr = CronExpr::parse("1/4294967295 * * * * *").unwrap();
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 1, 1, 0, 0, 1)));
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 1)), Some(at(2024, 1, 1, 0, 1, 1)));

        let expr = CronExpr::parse("0 */4294967295 * * * *").unwrap();
        assert_eq!(expr.next(at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 1, 1, 1, 0, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(CronExpr::parse("* * *"), Err(CronError::FieldCount(3)));
        assert!(matches!(
            CronExpr::parse("61 * * * * *"),
            Err(CronError::OutOfRange { field: "second", value: 61, .. })
        ));
        assert!(matches!(CronExpr::parse("*/0 * * * * *"), Err(CronError::InvalidStep { .. })));
        assert!(matches!(CronExpr::parse("? * * * * *"), Err(CronError::InvalidValue { .. })));
        assert!(matches!(CronExpr::parse("5-2 * * * * *"), Err(CronError::InvalidValue { .. })));
    }
}
