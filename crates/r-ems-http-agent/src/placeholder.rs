//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Live value and timestamp substitution for request templates.
//!
//! * `{$value}` is replaced by the plain string form of the value. When written as
//!   `"{$value}"` the quotes are consumed and the JSON form is inserted instead, so a
//!   body such as `{"setpoint": "{$value}"}` stays valid JSON for numbers and objects.
//! * `{$time}` renders epoch milliseconds, `{$time#%Y-%m-%d}` renders a strftime
//!   pattern and `{$time#%H:%M#-60000}` shifts "now" by the trailing millisecond offset.

use std::borrow::Cow;
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

/// Marker replaced by the live attribute value.
pub const VALUE_PLACEHOLDER: &str = "{$value}";
/// Prefix of the time marker.
pub const TIME_PLACEHOLDER_PREFIX: &str = "{$time";

/// Which markers a template contains; computed once when the template is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceholderFlags {
    pub value: bool,
    pub time: bool,
}

impl PlaceholderFlags {
    /// Scan every fragment once.
    pub fn scan<'a>(fragments: impl IntoIterator<Item = &'a str>) -> Self {
        fragments
            .into_iter()
            .fold(Self::default(), |flags, fragment| Self {
                value: flags.value || fragment.contains(VALUE_PLACEHOLDER),
                time: flags.time || find_time_marker(fragment).is_some(),
            })
    }

    pub fn any(&self) -> bool {
        self.value || self.time
    }
}

/// Substitutes one value and one instant into template fragments.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderInjector<'a> {
    value: Option<&'a Value>,
    now: DateTime<Utc>,
}

impl<'a> PlaceholderInjector<'a> {
    pub fn new(value: Option<&'a Value>, now: DateTime<Utc>) -> Self {
        Self { value, now }
    }

    /// Replace the markers enabled in `flags`; borrows the input untouched otherwise.
    pub fn inject<'s>(&self, input: &'s str, flags: PlaceholderFlags) -> Cow<'s, str> {
        let mut output = Cow::Borrowed(input);
        if flags.value && output.contains(VALUE_PLACEHOLDER) {
            output = Cow::Owned(self.replace_value(&output));
        }
        if flags.time && find_time_marker(&output).is_some() {
            output = Cow::Owned(self.replace_time(&output));
        }
        output
    }

    fn replace_value(&self, input: &str) -> String {
        let plain = self.value.and_then(stringify_value).unwrap_or_default();
        let json = self
            .value
            .map(Value::to_string)
            .unwrap_or_else(|| "null".to_owned());

        let mut out = String::with_capacity(input.len() + plain.len());
        let mut rest = input;
        while let Some(pos) = rest.find(VALUE_PLACEHOLDER) {
            let before = &rest[..pos];
            let after = &rest[pos + VALUE_PLACEHOLDER.len()..];
            if before.ends_with('"') && after.starts_with('"') {
                out.push_str(&before[..before.len() - 1]);
                out.push_str(&json);
                rest = &after[1..];
            } else {
                out.push_str(before);
                out.push_str(&plain);
                rest = after;
            }
        }
        out.push_str(rest);
        out
    }

    fn replace_time(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len() + 16);
        let mut rest = input;
        while let Some(marker) = find_time_marker(rest) {
            out.push_str(&rest[..marker.start]);
            out.push_str(&render_time(marker.spec, self.now));
            rest = &rest[marker.end..];
        }
        out.push_str(rest);
        out
    }
}

/// Plain string form of a value; `None` for JSON null.
pub fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

struct TimeMarker<'a> {
    start: usize,
    end: usize,
    spec: &'a str,
}

fn find_time_marker(input: &str) -> Option<TimeMarker<'_>> {
    let mut offset = 0;
    while let Some(pos) = input[offset..].find(TIME_PLACEHOLDER_PREFIX) {
        let start = offset + pos;
        let spec_start = start + TIME_PLACEHOLDER_PREFIX.len();
        let tail = &input[spec_start..];
        if let Some(close) = tail.find('}') {
            let spec = &tail[..close];
            if spec.is_empty() || spec.starts_with('#') {
                return Some(TimeMarker {
                    start,
                    end: spec_start + close + 1,
                    spec,
                });
            }
        }
        offset = spec_start;
    }
    None
}

fn render_time(spec: &str, now: DateTime<Utc>) -> String {
    let spec = spec.strip_prefix('#').unwrap_or(spec);
    let (format, offset) = spec.split_once('#').unwrap_or((spec, ""));
    let offset_ms = offset.trim().parse::<i64>().unwrap_or(0);
    let instant = ChronoDuration::try_milliseconds(offset_ms)
        .and_then(|offset| now.checked_add_signed(offset))
        .unwrap_or_else(|| {
            tracing::warn!(offset_ms, "time placeholder offset out of range; using now");
            now
        });

    if format.is_empty() {
        return instant.timestamp_millis().to_string();
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        tracing::warn!(format, "invalid time placeholder format; using epoch millis");
        return instant.timestamp_millis().to_string();
    }
    let mut rendered = String::new();
    if write!(rendered, "{}", instant.format(format)).is_err() {
        return instant.timestamp_millis().to_string();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn no_marker_is_a_no_op() {
        let flags = PlaceholderFlags::scan(["meters/power", "accept"]);
        assert!(!flags.any());
        let value = json!(100);
        let injector = PlaceholderInjector::new(Some(&value), fixed_now());
        let out = injector.inject("meters/power", PlaceholderFlags { value: true, time: true });
        assert!(matches!(out, Cow::Borrowed("meters/power")));
    }

    #[test]
    fn value_marker_is_substituted_and_idempotent() {
        let flags = PlaceholderFlags::scan(["volume/set/{$value}"]);
        assert!(flags.value && !flags.time);
        let value = json!(100);
        let injector = PlaceholderInjector::new(Some(&value), fixed_now());
        let first = injector.inject("volume/set/{$value}", flags);
        let second = injector.inject("volume/set/{$value}", flags);
        assert_eq!(first, "volume/set/100");
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn quoted_marker_inserts_json() {
        let flags = PlaceholderFlags::scan([r#"{"myObject": "{$value}"}"#]);
        let value = json!({"prop1": true});
        let injector = PlaceholderInjector::new(Some(&value), fixed_now());
        assert_eq!(
            injector.inject(r#"{"myObject": "{$value}"}"#, flags),
            r#"{"myObject": {"prop1":true}}"#
        );

        let text = json!("on");
        let injector = PlaceholderInjector::new(Some(&text), fixed_now());
        assert_eq!(injector.inject(r#"{"v": "{$value}"}"#, flags), r#"{"v": "on"}"#);
        assert_eq!(injector.inject("mode={$value}", flags), "mode=on");

        let injector = PlaceholderInjector::new(None, fixed_now());
        assert_eq!(injector.inject(r#"{"v": "{$value}"}"#, flags), r#"{"v": null}"#);
        assert_eq!(injector.inject("mode={$value}", flags), "mode=");
    }

    #[test]
    fn time_marker_variants() {
        let now = fixed_now();
        let flags = PlaceholderFlags::scan(["{$time}"]);
        assert!(flags.time);
        let injector = PlaceholderInjector::new(None, now);

        assert_eq!(
            injector.inject("from={$time}", flags),
            format!("from={}", now.timestamp_millis())
        );
        assert_eq!(injector.inject("{$time#%Y-%m-%d}", flags), "2024-03-01");
        assert_eq!(injector.inject("{$time#%H:%M#-3600000}", flags), "11:30");
        assert_eq!(
            injector.inject("{$time##60000}", flags),
            (now.timestamp_millis() + 60_000).to_string()
        );
    }

    #[test]
    fn unrelated_braces_are_left_alone() {
        let flags = PlaceholderFlags::scan(["{$timezone}"]);
        assert!(!flags.time);
        let injector = PlaceholderInjector::new(None, fixed_now());
        assert_eq!(
            injector.inject("{$timezone}", PlaceholderFlags { value: false, time: true }),
            "{$timezone}"
        );
    }

    #[test]
    fn out_of_range_offset_renders_now() {
        let now = fixed_now();
        let injector = PlaceholderInjector::new(None, now);
        let flags = PlaceholderFlags { value: false, time: true };
        let millis = now.timestamp_millis().to_string();
        assert_eq!(injector.inject("{$time##9223372036854775807}", flags), millis);
        assert_eq!(injector.inject("{$time##-9223372036854775808}", flags), millis);
        assert_eq!(injector.inject("{$time#%Y#9223372036854775807}", flags), "2024");
    }

    #[test]
    fn invalid_format_falls_back_to_millis() {
        let now = fixed_now();
        let injector = PlaceholderInjector::new(None, now);
        let flags = PlaceholderFlags { value: false, time: true };
        assert_eq!(
            injector.inject("{$time#%Q}", flags),
            now.timestamp_millis().to_string()
        );
    }
}
