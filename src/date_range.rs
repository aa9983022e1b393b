//! `EXT-X-DATERANGE` intervals anchored on the segment timeline.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::warn;

use crate::attributes::AttrList;
use crate::segment::MediaFragmentRef;

pub const CLASS_INTERSTITIAL: &str = "com.apple.hls.interstitial";

pub const ATTR_ID: &str = "ID";
pub const ATTR_CLASS: &str = "CLASS";
pub const ATTR_CUE: &str = "CUE";
pub const ATTR_X_CUE: &str = "X-CUE";
pub const ATTR_START_DATE: &str = "START-DATE";
pub const ATTR_END_DATE: &str = "END-DATE";
pub const ATTR_DURATION: &str = "DURATION";
pub const ATTR_PLANNED_DURATION: &str = "PLANNED-DURATION";
pub const ATTR_END_ON_NEXT: &str = "END-ON-NEXT";
pub const ATTR_ASSET_URI: &str = "X-ASSET-URI";
pub const ATTR_ASSET_LIST: &str = "X-ASSET-LIST";

/// Milliseconds since the epoch of an ISO-8601 date-time.
///
/// Accepts RFC 3339, offsets without a colon, and dates without a zone
/// (read as UTC).
pub fn parse_date_ms(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis() as f64);
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.timestamp_millis() as f64);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis() as f64);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis() as f64)
}

/// `CUE` flags of a date range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRangeCue {
    pub pre: bool,
    pub post: bool,
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct DateRange {
    pub attr: AttrList,
    pub tag_anchor: Option<MediaFragmentRef>,
    pub tag_order: usize,
    start_date: f64,
    end_date: Option<f64>,
    date_at_end: OnceLock<Option<f64>>,
    cue: OnceLock<DateRangeCue>,
    bad_value_for_same_id: Option<String>,
}

impl DateRange {
    /// Builds a date range, merging with an earlier tag of the same `ID`.
    ///
    /// Attributes of the new tag win. A value that disagrees with the earlier
    /// tag marks the range invalid.
    pub fn new(attr: AttrList, same_id: Option<&DateRange>, tag_count: usize) -> Self {
        let mut attr = attr;
        let mut bad_value_for_same_id = None;
        if let Some(previous) = same_id {
            for (key, value) in previous.attr.iter() {
                if attr.get(key).is_some_and(|v| v != value.as_str()) {
                    warn!(
                        "DATERANGE tag attribute: \"{}\" does not match for tags with ID: \"{}\"",
                        key,
                        attr.get(ATTR_ID).unwrap_or_default()
                    );
                    bad_value_for_same_id = Some(key.to_string());
                    break;
                }
            }
            attr.merge_missing(&previous.attr);
        }

        let start_date = match same_id {
            Some(previous) => previous.start_date,
            None => attr
                .get(ATTR_START_DATE)
                .and_then(parse_date_ms)
                .unwrap_or(f64::NAN),
        };
        let end_date = if attr.contains(ATTR_END_DATE) {
            same_id
                .and_then(|p| p.end_date)
                .or_else(|| attr.get(ATTR_END_DATE).and_then(parse_date_ms))
        } else {
            None
        };
        let date_at_end = same_id
            .map(|p| p.date_at_end.clone())
            .unwrap_or_default();
        let cue = same_id.map(|p| p.cue.clone()).unwrap_or_default();

        DateRange {
            attr,
            tag_anchor: same_id.and_then(|p| p.tag_anchor.clone()),
            tag_order: same_id.map(|p| p.tag_order).unwrap_or(tag_count),
            start_date,
            end_date,
            date_at_end,
            cue,
            bad_value_for_same_id,
        }
    }

    pub fn id(&self) -> &str {
        self.attr.get(ATTR_ID).unwrap_or_default()
    }

    pub fn class(&self) -> Option<&str> {
        self.attr.get(ATTR_CLASS)
    }

    /// The attribute that disagreed with an earlier tag of the same `ID`.
    pub fn bad_value_for_same_id(&self) -> Option<&str> {
        self.bad_value_for_same_id.as_deref()
    }

    pub fn cue(&self) -> DateRangeCue {
        *self.cue.get_or_init(|| {
            let name = if self.attr.contains(ATTR_CUE) {
                ATTR_CUE
            } else {
                ATTR_X_CUE
            };
            let flags = self
                .attr
                .enumerated_string_list(name, &["pre", "post", "once"]);
            DateRangeCue {
                pre: flags.get("pre").copied().unwrap_or(false),
                post: flags.get("post").copied().unwrap_or(false),
                once: flags.get("once").copied().unwrap_or(false),
            }
        })
    }

    /// Start date in milliseconds since the epoch, `NaN` when unparseable.
    pub fn start_date(&self) -> f64 {
        self.start_date
    }

    /// Position on the media timeline in seconds, `NaN` without an anchor
    /// carrying a program date time.
    pub fn start_time(&self) -> f64 {
        match &self.tag_anchor {
            Some(anchor) => match anchor.program_date_time {
                Some(pdt) => anchor.start + (self.start_date - pdt) / 1000.0,
                None => {
                    warn!(
                        "Expected tagAnchor Fragment with PDT set for DateRange \"{}\"",
                        self.id()
                    );
                    f64::NAN
                }
            },
            None => {
                warn!(
                    "Expected tagAnchor Fragment with PDT set for DateRange \"{}\"",
                    self.id()
                );
                f64::NAN
            }
        }
    }

    pub fn end_date(&self) -> Option<f64> {
        if let Some(end) = self.end_date {
            return Some(end);
        }
        *self
            .date_at_end
            .get_or_init(|| self.duration().map(|d| self.start_date + d * 1000.0))
    }

    pub fn duration(&self) -> Option<f64> {
        if self.attr.contains(ATTR_DURATION) {
            let duration = self.attr.decimal_floating_point(ATTR_DURATION);
            return duration.is_finite().then_some(duration);
        }
        self.end_date.map(|end| (end - self.start_date) / 1000.0)
    }

    pub fn planned_duration(&self) -> Option<f64> {
        self.attr
            .contains(ATTR_PLANNED_DURATION)
            .then(|| self.attr.decimal_floating_point(ATTR_PLANNED_DURATION))
    }

    pub fn end_on_next(&self) -> bool {
        self.attr.bool(ATTR_END_ON_NEXT)
    }

    pub fn is_interstitial(&self) -> bool {
        self.class() == Some(CLASS_INTERSTITIAL)
    }

    pub fn is_valid(&self) -> bool {
        let cue = self.cue();
        !self.id().is_empty()
            && self.bad_value_for_same_id.is_none()
            && self.start_date.is_finite()
            && self.duration().map_or(true, |d| d >= 0.0)
            && (!self.end_on_next() || self.class().is_some())
            && (!self.attr.contains(ATTR_CUE) || (!cue.pre && !cue.post) || cue.pre != cue.post)
            && (!self.is_interstitial()
                || self.attr.contains(ATTR_ASSET_URI)
                || self.attr.contains(ATTR_ASSET_LIST))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(attrs: &str) -> DateRange {
        DateRange::new(AttrList::parse(attrs), None, 0)
    }

    #[test]
    fn lenient_dates() {
        assert_eq!(parse_date_ms("1970-01-01T00:00:01Z"), Some(1000.0));
        assert_eq!(parse_date_ms("1970-01-01T00:00:01.500+0000"), Some(1500.0));
        assert_eq!(parse_date_ms("1970-01-01T00:00:02"), Some(2000.0));
        assert_eq!(parse_date_ms("1970-01-02"), Some(86_400_000.0));
        assert_eq!(parse_date_ms("yesterday"), None);
    }

    #[test]
    fn end_on_next_requires_class() {
        let dr = range("ID=\"a\",START-DATE=\"2024-01-01T00:00:00Z\",END-ON-NEXT=YES");
        assert!(!dr.is_valid());
        let dr = range(
            "ID=\"a\",CLASS=\"c\",START-DATE=\"2024-01-01T00:00:00Z\",END-ON-NEXT=YES",
        );
        assert!(dr.is_valid());
    }

    #[test]
    fn duration_and_end_date() {
        let dr = range("ID=\"a\",START-DATE=\"1970-01-01T00:00:10Z\",DURATION=5.5");
        assert_eq!(dr.duration(), Some(5.5));
        assert_eq!(dr.end_date(), Some(15_500.0));

        let dr = range(
            "ID=\"b\",START-DATE=\"1970-01-01T00:00:10Z\",END-DATE=\"1970-01-01T00:00:12Z\"",
        );
        assert_eq!(dr.duration(), Some(2.0));

        let dr = range("ID=\"c\",START-DATE=\"1970-01-01T00:00:10Z\",DURATION=-1");
        assert!(!dr.is_valid());
        assert_eq!(range("ID=\"d\",START-DATE=\"x\"").duration(), None);
        assert!(!range("ID=\"d\",START-DATE=\"x\"").is_valid());
    }

    #[test]
    fn cue_flags() {
        let dr = range("ID=\"a\",START-DATE=\"1970-01-01T00:00:00Z\",CUE=\"PRE,ONCE\"");
        assert_eq!(
            dr.cue(),
            DateRangeCue {
                pre: true,
                post: false,
                once: true
            }
        );
        assert!(dr.is_valid());
        let both = range("ID=\"a\",START-DATE=\"1970-01-01T00:00:00Z\",CUE=\"PRE,POST\"");
        assert!(!both.is_valid());
        let x_cue = range("ID=\"a\",START-DATE=\"1970-01-01T00:00:00Z\",X-CUE=\"POST\"");
        assert!(x_cue.cue().post);
    }

    #[test]
    fn interstitial_needs_asset() {
        let dr = range(
            "ID=\"ad\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"1970-01-01T00:00:00Z\"",
        );
        assert!(dr.is_interstitial());
        assert!(!dr.is_valid());
        let dr = range(
            "ID=\"ad\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"1970-01-01T00:00:00Z\",X-ASSET-URI=\"ad.m3u8\"",
        );
        assert!(dr.is_valid());
    }

    #[test]
    fn same_id_merge() {
        let first = DateRange::new(
            AttrList::parse("ID=\"a\",START-DATE=\"1970-01-01T00:00:00Z\",PLANNED-DURATION=30"),
            None,
            3,
        );
        let second = DateRange::new(AttrList::parse("ID=\"a\",DURATION=20"), Some(&first), 7);
        assert!(second.is_valid());
        assert_eq!(second.tag_order, 3);
        assert_eq!(second.duration(), Some(20.0));
        assert_eq!(second.planned_duration(), Some(30.0));
        assert_eq!(second.start_date(), 0.0);

        let conflict = DateRange::new(
            AttrList::parse("ID=\"a\",PLANNED-DURATION=31,DURATION=20"),
            Some(&first),
            8,
        );
        assert_eq!(conflict.bad_value_for_same_id(), Some("PLANNED-DURATION"));
        assert!(!conflict.is_valid());
    }

    #[test]
    fn start_time_from_anchor() {
        let mut dr = range("ID=\"a\",START-DATE=\"1970-01-01T00:00:15Z\"");
        assert!(dr.start_time().is_nan());
        dr.tag_anchor = Some(MediaFragmentRef {
            base_url: String::new(),
            start: 100.0,
            duration: 6.0,
            sn: 1,
            program_date_time: Some(10_000.0),
        });
        assert_eq!(dr.start_time(), 105.0);
    }
}
