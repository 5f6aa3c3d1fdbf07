//! `{{name}}` placeholders in raw query text.
//!
//! A placeholder takes the request parameter of that name. Otherwise
//! `now` and `today`, optionally shifted (`{{now-7d}}`), become unix
//! seconds, as does an RFC 3339 timestamp. Anything else, including a
//! shift beyond the representable range, is left as is.

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid placeholder regex"))
}

pub fn expand(text: &str, params: &HashMap<String, String>) -> String {
    expand_at(text, params, Utc::now())
}

pub fn expand_at(text: &str, params: &HashMap<String, String>, now: DateTime<Utc>) -> String {
    placeholder()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if let Some(value) = params.get(name) {
                return value.clone();
            }
            match parse_time_expr(name, now) {
                Some(t) => t.timestamp().to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn parse_time_expr(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    let (base, rest) = if let Some(rest) = value.strip_prefix("today") {
        (now.date_naive().and_hms_opt(0, 0, 0)?.and_utc(), rest)
    } else if let Some(rest) = value.strip_prefix("now") {
        (now, rest)
    } else {
        return None;
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return Some(base);
    }

    let (sign, offset) = if let Some(offset) = rest.strip_prefix('+') {
        (1, offset.trim())
    } else if let Some(offset) = rest.strip_prefix('-') {
        (-1, offset.trim())
    } else {
        return None;
    };
    let (unit_at, _) = offset.char_indices().last()?;
    let (number, unit) = offset.split_at(unit_at);
    let amount: i64 = number.parse().ok()?;
    let duration = match unit {
        "s" => TimeDelta::try_seconds(amount),
        "m" => TimeDelta::try_minutes(amount),
        "h" => TimeDelta::try_hours(amount),
        "d" => TimeDelta::try_days(amount),
        "w" => TimeDelta::try_weeks(amount),
        _ => None,
    }?;
    if sign > 0 {
        base.checked_add_signed(duration)
    } else {
        base.checked_sub_signed(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_params_win() {
        let params = HashMap::from([("platform".to_string(), "linux".to_string())]);
        assert_eq!(
            expand_at(r#"{"eq": {"platform": "{{ platform }}"}}"#, &params, now()),
            r#"{"eq": {"platform": "linux"}}"#
        );
    }

    #[test]
    fn test_time_expressions() {
        let params = HashMap::new();
        let now = now();
        assert_eq!(expand_at("{{now}}", &params, now), now.timestamp().to_string());
        assert_eq!(
            expand_at("{{now-1d}}", &params, now),
            (now - TimeDelta::days(1)).timestamp().to_string()
        );
        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(
            expand_at("{{today + 2h}}", &params, now),
            (midnight + TimeDelta::hours(2)).timestamp().to_string()
        );
    }

    #[test]
    fn test_unknown_placeholder_is_kept() {
        assert_eq!(expand_at("{{who}} {{now+3x}}", &HashMap::new(), now()), "{{who}} {{now+3x}}");
    }

    #[test]
    fn test_out_of_range_shift_is_kept() {
        let params = HashMap::new();
        assert_eq!(
            expand_at("{{now-99999999999999d}}", &params, now()),
            "{{now-99999999999999d}}"
        );
        assert_eq!(
            expand_at("{{today+9999999999w}}", &params, now()),
            "{{today+9999999999w}}"
        );
    }
}
