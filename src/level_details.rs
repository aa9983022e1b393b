//! Parsed media playlist and live reload bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use url::Url;

use crate::attributes::AttrList;
use crate::date_range::DateRange;
use crate::error::PlaylistParsingError;
use crate::playlist::MediaPlaylistType;
use crate::segment::{Fragment, Part};

pub const DEFAULT_TARGET_DURATION: f64 = 10.0;

/// Value of the `_HLS_skip` delivery directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsSkip {
    No,
    Yes,
    V2,
}

impl fmt::Display for HlsSkip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HlsSkip::No => write!(f, ""),
            HlsSkip::Yes => write!(f, "YES"),
            HlsSkip::V2 => write!(f, "v2"),
        }
    }
}

/// Blocking playlist reload and delta update query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HlsUrlParameters {
    pub msn: Option<u64>,
    pub part: Option<usize>,
    pub skip: HlsSkip,
}

impl HlsUrlParameters {
    pub fn new(msn: Option<u64>, part: Option<usize>, skip: HlsSkip) -> Self {
        HlsUrlParameters { msn, part, skip }
    }

    /// Sets `_HLS_msn`, `_HLS_part` and `_HLS_skip` on `uri`, replacing any
    /// existing values. Relative URIs are returned untouched.
    pub fn add_directives(&self, uri: &str) -> String {
        let Ok(mut url) = Url::parse(uri) else {
            return uri.to_string();
        };
        let mut directives = Vec::new();
        if let Some(msn) = self.msn {
            directives.push(("_HLS_msn", msn.to_string()));
        }
        if let Some(part) = self.part {
            directives.push(("_HLS_part", part.to_string()));
        }
        if self.skip != HlsSkip::No {
            directives.push(("_HLS_skip", self.skip.to_string()));
        }
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !directives.iter().any(|(name, _)| k == name))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() && directives.is_empty() {
            return url.to_string();
        }
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in &kept {
                query.append_pair(k, v);
            }
            for (k, v) in &directives {
                query.append_pair(k, v);
            }
        }
        url.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct LevelDetails {
    pub url: String,
    pub m3u8: String,
    pub fragments: Vec<Option<Fragment>>,
    pub fragment_hint: Option<Fragment>,
    pub part_list: Option<Vec<Part>>,
    pub date_ranges: BTreeMap<String, DateRange>,
    pub date_range_tag_count: usize,
    pub live: bool,
    pub start_sn: u64,
    pub end_sn: u64,
    pub start_cc: u64,
    pub end_cc: u64,
    pub targetduration: f64,
    pub totalduration: f64,
    pub averagetargetduration: Option<f64>,
    pub version: Option<u64>,
    pub playlist_type: Option<MediaPlaylistType>,
    pub start_time_offset: Option<f64>,
    pub can_block_reload: bool,
    pub can_skip_until: f64,
    pub can_skip_date_ranges: bool,
    pub hold_back: f64,
    pub part_hold_back: f64,
    pub part_target: f64,
    pub skipped_segments: u64,
    pub recently_removed_dateranges: Option<Vec<String>>,
    pub preload_hint: Option<AttrList>,
    pub rendition_reports: Option<Vec<AttrList>>,
    /// Indices into `fragments` of the first fragment of every new common
    /// encryption key set.
    pub encrypted_fragments: Vec<usize>,
    pub variable_list: Vec<AttrList>,
    pub has_variable_refs: bool,
    pub playlist_parsing_error: Option<PlaylistParsingError>,
    pub updated: bool,
    pub advanced: bool,
    pub misses: u32,
    /// Wall clock milliseconds when the playlist last advanced.
    pub advanced_date_time: Option<f64>,
    pub age_header: f64,
    pub drift_start: f64,
    pub drift_end: f64,
    pub drift_start_time: f64,
    pub drift_end_time: f64,
}

impl LevelDetails {
    pub fn new(url: impl Into<String>) -> Self {
        LevelDetails {
            url: url.into(),
            m3u8: String::new(),
            fragments: Vec::new(),
            fragment_hint: None,
            part_list: None,
            date_ranges: BTreeMap::new(),
            date_range_tag_count: 0,
            live: true,
            start_sn: 0,
            end_sn: 0,
            start_cc: 0,
            end_cc: 0,
            targetduration: 0.0,
            totalduration: 0.0,
            averagetargetduration: None,
            version: None,
            playlist_type: None,
            start_time_offset: None,
            can_block_reload: false,
            can_skip_until: 0.0,
            can_skip_date_ranges: false,
            hold_back: 0.0,
            part_hold_back: 0.0,
            part_target: 0.0,
            skipped_segments: 0,
            recently_removed_dateranges: None,
            preload_hint: None,
            rendition_reports: None,
            encrypted_fragments: Vec::new(),
            variable_list: Vec::new(),
            has_variable_refs: false,
            playlist_parsing_error: None,
            updated: true,
            advanced: true,
            misses: 0,
            advanced_date_time: None,
            age_header: 0.0,
            drift_start: 0.0,
            drift_end: 0.0,
            drift_start_time: 0.0,
            drift_end_time: 0.0,
        }
    }

    /// Compares this playlist against the previous load of the same level.
    pub fn reloaded(&mut self, previous: Option<&LevelDetails>) {
        self.reloaded_at(previous, Utc::now().timestamp_millis() as f64);
    }

    pub fn reloaded_at(&mut self, previous: Option<&LevelDetails>, now_ms: f64) {
        let Some(previous) = previous else {
            self.advanced = true;
            self.updated = true;
            self.advanced_date_time = Some(now_ms - self.age_header * 1000.0);
            self.drift_start = self.fragment_end();
            self.drift_start_time = now_ms;
            return;
        };
        let part_sn_diff = self.last_part_sn() as i64 - previous.last_part_sn() as i64;
        let part_index_diff = self.last_part_index() - previous.last_part_index();
        self.updated = self.end_sn != previous.end_sn
            || part_index_diff != 0
            || part_sn_diff != 0
            || !self.live;
        self.advanced = self.end_sn > previous.end_sn
            || part_sn_diff > 0
            || (part_sn_diff == 0 && part_index_diff > 0);
        self.misses = if self.updated || self.advanced {
            (previous.misses as f64 * 0.6).floor() as u32
        } else {
            previous.misses + 1
        };

        self.drift_start = previous.drift_start;
        self.drift_start_time = previous.drift_start_time;
        if self.advanced {
            self.advanced_date_time = Some(now_ms - self.age_header * 1000.0);
            self.drift_end = self.fragment_end();
            self.drift_end_time = now_ms;
        } else {
            self.advanced_date_time = previous.advanced_date_time;
            self.drift_end = previous.drift_end;
            self.drift_end_time = previous.drift_end_time;
        }
    }

    /// Ratio of media advanced to wall clock elapsed between reloads.
    pub fn drift(&self) -> f64 {
        let run_time = self.drift_end_time - self.drift_start_time;
        if run_time > 0.0 {
            let run_duration = self.drift_end - self.drift_start;
            return run_duration * 1000.0 / run_time;
        }
        1.0
    }

    fn last_fragment(&self) -> Option<&Fragment> {
        self.fragments.last().and_then(Option::as_ref)
    }

    fn last_part(&self) -> Option<&Part> {
        self.part_list.as_ref().and_then(|p| p.last())
    }

    pub fn has_program_date_time(&self) -> bool {
        self.last_fragment()
            .and_then(Fragment::program_date_time)
            .is_some()
    }

    pub fn level_target_duration(&self) -> f64 {
        self.averagetargetduration
            .filter(|d| *d > 0.0)
            .or(Some(self.targetduration).filter(|d| *d > 0.0))
            .unwrap_or(DEFAULT_TARGET_DURATION)
    }

    pub fn edge(&self) -> f64 {
        let part_end = self.part_end();
        if part_end != 0.0 {
            part_end
        } else {
            self.fragment_end()
        }
    }

    pub fn part_end(&self) -> f64 {
        match self.last_part() {
            Some(part) => part.end(),
            None => self.fragment_end(),
        }
    }

    pub fn fragment_end(&self) -> f64 {
        self.last_fragment().map(Fragment::end).unwrap_or(0.0)
    }

    pub fn fragment_start(&self) -> f64 {
        self.fragments
            .first()
            .and_then(Option::as_ref)
            .map(Fragment::start)
            .unwrap_or(0.0)
    }

    /// Seconds since the playlist last advanced.
    pub fn age(&self) -> f64 {
        self.age_at(Utc::now().timestamp_millis() as f64)
    }

    pub fn age_at(&self, now_ms: f64) -> f64 {
        match self.advanced_date_time {
            Some(advanced) => (now_ms - advanced).max(0.0) / 1000.0,
            None => 0.0,
        }
    }

    /// `-1` without parts.
    pub fn last_part_index(&self) -> i64 {
        self.last_part().map(|p| p.index as i64).unwrap_or(-1)
    }

    pub fn max_part_index(&self) -> i64 {
        let Some(parts) = &self.part_list else {
            return 0;
        };
        let last_index = self.last_part_index();
        if last_index == -1 {
            return 0;
        }
        parts
            .iter()
            .rev()
            .map(|p| p.index as i64)
            .find(|i| *i > last_index)
            .unwrap_or(last_index)
    }

    pub fn last_part_sn(&self) -> u64 {
        self.last_part()
            .and_then(|p| p.frag_sn().media())
            .unwrap_or(self.end_sn)
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now().timestamp_millis() as f64)
    }

    pub fn expired_at(&self, now_ms: f64) -> bool {
        let age = self.age_at(now_ms);
        if self.live && age > 0.0 && self.misses < 3 {
            let window = self.part_end() - self.fragment_start();
            return age > window.max(self.totalduration) + self.level_target_duration();
        }
        false
    }

    /// Which delta update the next request may ask for.
    pub fn skip_directive(&self) -> HlsSkip {
        self.skip_directive_at(Utc::now().timestamp_millis() as f64)
    }

    pub fn skip_directive_at(&self, now_ms: f64) -> HlsSkip {
        let recent_enough = self.age_at(now_ms) < self.can_skip_until / 2.0;
        if self.can_skip_until > 0.0 && recent_enough {
            if self.can_skip_date_ranges {
                return HlsSkip::V2;
            }
            return HlsSkip::Yes;
        }
        HlsSkip::No
    }

    /// Refreshes the anchor snapshots of the date ranges after fragments
    /// were moved on the timeline. Anchors whose fragment is gone are kept.
    pub fn sync_date_range_anchors(&mut self) {
        let fragments = &self.fragments;
        for date_range in self.date_ranges.values_mut() {
            let Some(anchor) = date_range.tag_anchor.as_mut() else {
                continue;
            };
            let sn = anchor.sn;
            let current = fragments
                .iter()
                .flatten()
                .find(|f| f.sn.media() == Some(sn))
                .and_then(Fragment::media_ref);
            if let Some(current) = current {
                *anchor = current;
            }
        }
    }

    /// Fragments that start a new common encryption key set.
    pub fn encrypted_fragment_list(&self) -> impl Iterator<Item = &Fragment> {
        self.encrypted_fragments
            .iter()
            .filter_map(|i| self.fragments.get(*i).and_then(Option::as_ref))
    }
}
