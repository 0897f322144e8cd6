//! Hand-rolled 5-field cron engine (§4.9), timezone-aware via `chrono-tz` rather
//! than the system local offset.

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use chrono_tz::Tz;

use g2_core::{Error, Result};

#[derive(Clone, Debug)]
pub struct CronExpr {
    min: Field,
    hour: Field,
    dom: Field,
    mon: Field,
    dow: Field,
}

#[derive(Clone, Debug)]
struct Field {
    min: u32,
    max: u32,
    allowed: Vec<bool>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts = expr
            .split_whitespace()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "cron expression must have 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            min: Field::parse(parts[0], 0, 59, false)?,
            hour: Field::parse(parts[1], 0, 23, false)?,
            dom: Field::parse(parts[2], 1, 31, false)?,
            mon: Field::parse(parts[3], 1, 12, false)?,
            dow: Field::parse(parts[4], 0, 6, true)?,
        })
    }

    fn matches(&self, dt: DateTime<Tz>) -> bool {
        if !self.min.contains(dt.minute()) {
            return false;
        }
        if !self.hour.contains(dt.hour()) {
            return false;
        }
        if !self.mon.contains(dt.month()) {
            return false;
        }

        let dom_any = self.dom.is_any();
        let dow_any = self.dow.is_any();
        let dom_match = self.dom.contains(dt.day());
        let dow_match = self.dow.contains(dt.weekday().num_days_from_sunday());

        match (dom_any, dow_any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// Next occurrence strictly after `now`, in `tz`. `None` if the expression
    /// names an impossible combination (e.g. Feb 30th).
    pub fn next_after(&self, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut t = (now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        let max_iters = 366usize * 24 * 60;
        for _ in 0..max_iters {
            if self.matches(t) {
                return Some(t);
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32, allow_7_as_0: bool) -> Result<Self> {
        let raw = raw.trim();
        let mut allowed = vec![false; (max + 1) as usize];

        if raw == "*" {
            for v in min..=max {
                allowed[v as usize] = true;
            }
            return Ok(Self { min, max, allowed });
        }

        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (base, step) = if let Some((a, b)) = part.split_once('/') {
                let step: u32 = b
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid cron step: {b}")))?;
                if step == 0 {
                    return Err(Error::Config("cron step must be > 0".to_string()));
                }
                (a.trim(), Some(step))
            } else {
                (part, None)
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                (
                    parse_u32(a.trim(), allow_7_as_0)?,
                    parse_u32(b.trim(), allow_7_as_0)?,
                )
            } else {
                let a = parse_u32(base.trim(), allow_7_as_0)?;
                if step.is_some() {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            let start = start.max(min);
            let end = end.min(max);
            if start > end {
                return Err(Error::Config(format!("invalid cron range: {base}")));
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                allowed[v as usize] = true;
                v = v.saturating_add(step);
            }
        }

        Ok(Self { min, max, allowed })
    }

    fn contains(&self, v: u32) -> bool {
        if v < self.min || v > self.max {
            return false;
        }
        self.allowed.get(v as usize).copied().unwrap_or(false)
    }

    fn is_any(&self) -> bool {
        (self.min..=self.max).all(|v| self.allowed[v as usize])
    }
}

fn parse_u32(s: &str, allow_7_as_0: bool) -> Result<u32> {
    let mut v: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid cron field value: {s}")))?;
    if allow_7_as_0 && v == 7 {
        v = 0;
    }
    Ok(v)
}

/// Parses `tz` (falling back to UTC on an invalid name) and computes the next
/// occurrence of `cron_expr` strictly after now.
pub fn next_occurrence(cron_expr: &str, tz: &str, now_utc: DateTime<chrono::Utc>) -> Result<Option<String>> {
    let zone: Tz = tz.parse().unwrap_or(chrono_tz::UTC);
    let expr = CronExpr::parse(cron_expr)?;
    let local_now = now_utc.with_timezone(&zone);
    Ok(expr.next_after(local_now).map(|dt| dt.with_timezone(&chrono::Utc).to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn matches_hourly_boundary() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let dt = chrono_tz::UTC.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        assert!(expr.matches(dt));
        let dt2 = chrono_tz::UTC.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap();
        assert!(!expr.matches(dt2));
    }

    #[test]
    fn next_after_step_field_finds_next_five_minute_mark() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let dt = chrono_tz::UTC.with_ymd_and_hms(2026, 1, 1, 10, 1, 30).unwrap();
        let next = expr.next_after(dt).unwrap();
        assert_eq!(next.minute(), 5);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn next_occurrence_falls_back_to_utc_on_invalid_timezone() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap();
        let next = next_occurrence("0 11 * * *", "Not/AZone", now).unwrap().unwrap();
        assert!(next.starts_with("2026-01-01T11:00:00"));
    }

    #[test]
    fn dom_or_dow_match_when_both_restricted() {
        let expr = CronExpr::parse("0 0 1 * 1").unwrap();
        // Jan 1 2026 is a Thursday; the 15th is a Thursday too but not the 1st.
        let first = chrono_tz::UTC.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(expr.matches(first));
    }
}
