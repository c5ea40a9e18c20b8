//! Five-field cron expressions (`min hour dom mon dow`), minute resolution.
//!
//! Matching follows the classic vixie rules: when both day-of-month and
//! day-of-week are restricted, a day matches if either does; `7` is accepted
//! as an alias for Sunday.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 cron fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {text:?}")]
    Field { field: &'static str, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_any: bool,
    dow_any: bool,
}

impl CronExpr {
    pub fn parse(text: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], 0, 59, "minute")? as u64;
        let hours = parse_field(fields[1], 0, 23, "hour")? as u32;
        let dom = parse_field(fields[2], 1, 31, "day-of-month")? as u32;
        let months = parse_field(fields[3], 1, 12, "month")? as u16;
        let raw_dow = parse_field(fields[4], 0, 7, "day-of-week")?;
        // 7 is Sunday, same as 0.
        let dow = ((raw_dow & 0x7f) | (raw_dow >> 7 & 1)) as u8;

        Ok(Self {
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_any: fields[2].trim() == "*",
            dow_any: fields[4].trim() == "*",
        })
    }

    /// First matching instant strictly after `after`, truncated to the
    /// minute. Returns `None` only for expressions that cannot fire within
    /// roughly five years (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        let horizon = after + Duration::days(366 * 5);

        while t <= horizon {
            if self.months >> t.month() & 1 == 0 {
                let (year, month) = match t.month() {
                    12 => (t.year() + 1, 1),
                    m => (t.year(), m + 1),
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if self.hours >> t.hour() & 1 == 0 {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if self.minutes >> t.minute() & 1 == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = self.dom >> t.day() & 1 == 1;
        let dow_ok = self.dow >> t.weekday().num_days_from_sunday() & 1 == 1;
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (true, false) => dow_ok,
            (false, true) => dom_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }
}

fn parse_field(text: &str, min: u32, max: u32, field: &'static str) -> Result<u128, CronError> {
    let invalid = || CronError::Field {
        field,
        text: text.to_string(),
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    let mut mask: u128 = 0;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                lo.parse().map_err(|_| invalid())?,
                hi.parse().map_err(|_| invalid())?,
            )
        } else {
            let v: u32 = range.parse().map_err(|_| invalid())?;
            // `N/step` means N to the field maximum, stepped.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid());
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u128 << v;
            v += step;
        }
    }
    Ok(mask)
}
