use chrono::{DateTime, Utc};

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `YYYYMMDD_HHMMSS`, used in session directory names.
pub fn compact_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// `YYYYMMDD_HHMMSS_ffffff`, used in pair file names.
pub fn compact_stamp_micros(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%6f").to_string()
}

pub fn parse_due_at(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Some(offset) = trimmed.strip_prefix('+') {
        let millis = parse_relative_millis(offset)?;
        return Ok(Utc::now() + chrono::Duration::milliseconds(millis));
    }
    Err(format!(
        "invalid time `{trimmed}`: expected RFC 3339 (2026-01-31T09:00:00Z) or +<n>[ms|s|m|h]"
    ))
}

fn parse_relative_millis(raw: &str) -> Result<i64, String> {
    let split = raw
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value = digits
        .parse::<i64>()
        .map_err(|_| format!("invalid relative time `+{raw}`"))?;
    let factor = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => return Err(format!("unknown time unit `{other}`")),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("relative time `+{raw}` is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compact_stamps_are_sortable_and_fixed_width() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        assert_eq!(compact_stamp(at), "20260304_050607");
        assert_eq!(compact_stamp_micros(at), "20260304_050607_000000");
    }

    #[test]
    fn parse_due_at_accepts_rfc3339_and_relative_offsets() {
        let parsed = parse_due_at("2026-01-31T09:00:00.250Z").expect("rfc3339");
        assert_eq!(parsed.timestamp_millis() % 1000, 250);

        let before = Utc::now();
        let relative = parse_due_at("+90s").expect("relative");
        assert!(relative >= before + chrono::Duration::seconds(89));

        assert!(parse_due_at("+5d").is_err());
        assert!(parse_due_at("tomorrow").is_err());
    }
}
