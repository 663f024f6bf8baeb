//! `time_window.resolve`: turn a schedule (cron + timezone + offset) into a
//! concrete reporting window.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{input_str, Tool, ToolStage};
use crate::context::{ContextField, Granularity, ResolvedWindow, TaskContext, TimeWindowSpec};

/// Zones without daylight saving, as fixed offsets in seconds east of UTC.
const ZONE_ALIASES: &[(&str, i32)] = &[
    ("asia/shanghai", 8 * 3600),
    ("asia/hong_kong", 8 * 3600),
    ("asia/singapore", 8 * 3600),
    ("asia/tokyo", 9 * 3600),
    ("asia/kolkata", 5 * 3600 + 1800),
];

/// Infer the report period from a 5-field cron expression.
///
/// A restricted day-of-week means weekly, a restricted day-of-month means
/// monthly, anything else daily.
pub fn infer_granularity(cron_expr: &str) -> anyhow::Result<Granularity> {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() != 5 {
        bail!(
            "expected 5 cron fields (min hour dom month dow), got {}",
            fields.len()
        );
    }
    let restricted = |f: &str| f != "*" && f != "?";
    if restricted(fields[4]) {
        Ok(Granularity::Weekly)
    } else if restricted(fields[2]) {
        Ok(Granularity::Monthly)
    } else {
        Ok(Granularity::Daily)
    }
}

/// Parse `UTC`, `+08:00`, `UTC+8`, `GMT-05:30` or a known zone alias.
pub fn parse_timezone(tz: &str) -> anyhow::Result<FixedOffset> {
    let trimmed = tz.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "utc" || lower == "z" || lower == "gmt" {
        return FixedOffset::east_opt(0).context("zero offset");
    }
    if let Some((_, secs)) = ZONE_ALIASES.iter().find(|(name, _)| *name == lower) {
        return FixedOffset::east_opt(*secs).context("alias offset");
    }

    let rest = lower
        .strip_prefix("utc")
        .or_else(|| lower.strip_prefix("gmt"))
        .unwrap_or(&lower);
    let (sign, digits) = match rest.chars().next() {
        Some('+') => (1, &rest[1..]),
        Some('-') => (-1, &rest[1..]),
        _ => bail!("unsupported timezone `{}`", trimmed),
    };
    if !digits.is_ascii() {
        bail!("invalid timezone offset in `{}`", trimmed);
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => (&digits[..2], &digits[2..]),
        None => (digits, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| anyhow!("invalid timezone hours in `{}`", trimmed))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| anyhow!("invalid timezone minutes in `{}`", trimmed))?;
    if hours > 14 || minutes >= 60 {
        bail!("timezone offset out of range: `{}`", trimmed);
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("timezone offset out of range: `{}`", trimmed))
}

fn shift_days(date: NaiveDate, periods: i64) -> Option<NaiveDate> {
    if periods >= 0 {
        date.checked_sub_days(Days::new(periods as u64))
    } else {
        date.checked_add_days(Days::new(periods.unsigned_abs()))
    }
}

fn shift_months(date: NaiveDate, periods: i64) -> Option<NaiveDate> {
    let months = Months::new(u32::try_from(periods.unsigned_abs()).ok()?);
    if periods >= 0 {
        date.checked_sub_months(months)
    } else {
        date.checked_add_months(months)
    }
}

/// Resolve the `[start, end)` window `spec.offset` periods before the period
/// containing `now`, in the window's timezone. Weeks start on Monday.
pub fn resolve_window(spec: &TimeWindowSpec, now: DateTime<Utc>) -> anyhow::Result<ResolvedWindow> {
    let granularity = infer_granularity(&spec.cron_expr)?;
    let tz = parse_timezone(&spec.timezone)?;
    let today = now.with_timezone(&tz).date_naive();
    let offset = i64::from(spec.offset);

    let (start, end) = match granularity {
        Granularity::Daily => {
            let start = shift_days(today, offset).context("date out of range")?;
            (start, start.checked_add_days(Days::new(1)))
        }
        Granularity::Weekly => {
            let monday = today
                .checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_monday())))
                .context("date out of range")?;
            let start = shift_days(monday, offset * 7).context("date out of range")?;
            (start, start.checked_add_days(Days::new(7)))
        }
        Granularity::Monthly => {
            let first = today.with_day(1).context("date out of range")?;
            let start = shift_months(first, offset).context("date out of range")?;
            (start, start.checked_add_months(Months::new(1)))
        }
    };
    let end = end.context("date out of range")?;

    let to_local = |date: NaiveDate| -> anyhow::Result<String> {
        let midnight = date.and_hms_opt(0, 0, 0).context("midnight")?;
        let local = tz
            .from_local_datetime(&midnight)
            .single()
            .context("ambiguous local time")?;
        Ok(local.to_rfc3339())
    };

    Ok(ResolvedWindow {
        start: to_local(start)?,
        end: to_local(end)?,
        granularity,
    })
}

/// Resolves `time_window` into `resolved_window`.
pub struct TimeWindowResolve;

#[async_trait]
impl Tool for TimeWindowResolve {
    fn name(&self) -> &str {
        "time_window.resolve"
    }

    fn description(&self) -> &str {
        "Resolve the schedule's cron, timezone and offset into a concrete start/end window."
    }

    fn stages(&self) -> &[ToolStage] {
        &[ToolStage::TemplateParse, ToolStage::TaskExecution]
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::TimeWindow]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::ResolvedWindow]
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "now": {"type": "string", "description": "RFC 3339 reference instant; defaults to the current time"}
            }
        })
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let spec = ctx.time_window.as_ref().context("no time window")?;
        let now = match input_str(input, "now") {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid `now`: {}", raw))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        let window = resolve_window(spec, now)?;

        let mut out = Map::new();
        out.insert(
            ContextField::ResolvedWindow.to_string(),
            serde_json::to_value(window)?,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::orders_context;
    use crate::task::OutputKind;

    fn spec(cron: &str, tz: &str, offset: i32) -> TimeWindowSpec {
        TimeWindowSpec {
            cron_expr: cron.to_string(),
            timezone: tz.to_string(),
            offset,
        }
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("instant")
            .with_timezone(&Utc)
    }

    #[test]
    fn granularity_from_cron() {
        assert_eq!(infer_granularity("0 9 * * *").expect("cron"), Granularity::Daily);
        assert_eq!(infer_granularity("0 9 * * 1").expect("cron"), Granularity::Weekly);
        assert_eq!(infer_granularity("0 9 1 * *").expect("cron"), Granularity::Monthly);
        assert!(infer_granularity("0 9 * *").is_err());
    }

    #[test]
    fn timezone_forms() {
        assert_eq!(parse_timezone("UTC").expect("tz").local_minus_utc(), 0);
        assert_eq!(parse_timezone("+08:00").expect("tz").local_minus_utc(), 8 * 3600);
        assert_eq!(parse_timezone("UTC-5").expect("tz").local_minus_utc(), -5 * 3600);
        assert_eq!(parse_timezone("GMT+0530").expect("tz").local_minus_utc(), 19800);
        assert_eq!(
            parse_timezone("Asia/Kolkata").expect("tz").local_minus_utc(),
            19800
        );
        assert!(parse_timezone("Europe/Berlin").is_err());
        assert!(parse_timezone("+25:00").is_err());
    }

    #[test]
    fn non_ascii_offsets_are_rejected() {
        assert!(parse_timezone("+1é1").is_err());
        assert!(parse_timezone("UTC-０８").is_err());
    }

    #[test]
    fn previous_month_in_shanghai() {
        // 2024-03-01 01:00 Shanghai is still February in UTC.
        let window = resolve_window(
            &spec("0 9 1 * *", "Asia/Shanghai", 1),
            at("2024-02-29T17:00:00Z"),
        )
        .expect("window");
        assert_eq!(window.granularity, Granularity::Monthly);
        assert_eq!(window.start, "2024-02-01T00:00:00+08:00");
        assert_eq!(window.end, "2024-03-01T00:00:00+08:00");
    }

    #[test]
    fn previous_week_starts_monday() {
        // 2024-05-15 is a Wednesday.
        let window =
            resolve_window(&spec("0 8 * * 1", "UTC", 1), at("2024-05-15T12:00:00Z")).expect("window");
        assert_eq!(window.start, "2024-05-06T00:00:00+00:00");
        assert_eq!(window.end, "2024-05-13T00:00:00+00:00");
    }

    #[test]
    fn current_day_with_zero_offset() {
        let window =
            resolve_window(&spec("30 6 * * *", "UTC", 0), at("2024-05-15T12:00:00Z")).expect("window");
        assert_eq!(window.granularity, Granularity::Daily);
        assert_eq!(window.start, "2024-05-15T00:00:00+00:00");
        assert_eq!(window.end, "2024-05-16T00:00:00+00:00");
    }

    #[tokio::test]
    async fn tool_writes_resolved_window() {
        let mut ctx = orders_context(OutputKind::Sql);
        ctx.time_window = Some(spec("0 9 1 * *", "UTC", 1));
        let mut input = Map::new();
        input.insert("now".to_string(), json!("2024-07-10T00:00:00Z"));

        let out = TimeWindowResolve
            .execute(&input, &ctx, &CancellationToken::new())
            .await
            .expect("resolve");
        assert_eq!(out["resolved_window"]["start"], json!("2024-06-01T00:00:00+00:00"));
        assert_eq!(out["resolved_window"]["granularity"], json!("monthly"));
    }
}
