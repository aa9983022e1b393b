//! Interstitial (ad insertion) events layered on `EXT-X-DATERANGE` tags.
//!
//! An [`InterstitialEvent`] wraps one date range of the
//! `com.apple.hls.interstitial` class and derives its scheduling policy:
//! where it starts, how long it plays, where primary playback resumes and
//! whether its media can be appended in place of the primary content.
//! [`InterstitialEventMap`] keeps events alive across playlist reloads and
//! [`AssetListLoader`] fetches `X-ASSET-LIST` documents.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::LoadPolicy;
use crate::date_range::{DateRange, DateRangeCue, ATTR_ASSET_LIST, ATTR_ASSET_URI};
use crate::error::{AssetListError, ErrorDetails, LoaderError};
use crate::events::{EventBus, HlsEvent};
use crate::level_details::LevelDetails;
use crate::loader::{
    load_with_timeout, LoaderConfiguration, LoaderContext, LoaderFactory, ResponseType,
};
use crate::segment::{Fragment, MediaFragmentRef, RequestHandle};
use crate::uri::is_data_uri;

/// Distance in seconds under which two timeline positions are treated as one.
pub const ALIGNED_END_THRESHOLD_SECONDS: f64 = 0.025;

const ATTR_RESUME_OFFSET: &str = "X-RESUME-OFFSET";
const ATTR_PLAYOUT_LIMIT: &str = "X-PLAYOUT-LIMIT";
const ATTR_RESTRICT: &str = "X-RESTRICT";
const ATTR_SNAP: &str = "X-SNAP";
const ATTR_TIMELINE_OCCUPIES: &str = "X-TIMELINE-OCCUPIES";
const ATTR_TIMELINE_STYLE: &str = "X-TIMELINE-STYLE";
const ATTR_CONTENT_MAY_VARY: &str = "X-CONTENT-MAY-VARY";

/// `X-RESTRICT` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackRestrictions {
    pub skip: bool,
    pub jump: bool,
}

/// `X-SNAP` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapOptions {
    pub out: bool,
    pub in_: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineOccupancy {
    Point,
    Range,
}

/// One entry of an asset list document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetListAsset {
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(
        rename = "DURATION",
        default,
        deserialize_with = "lenient_duration"
    )]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of an `X-ASSET-LIST` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetListResponse {
    #[serde(rename = "ASSETS")]
    pub assets: Vec<AssetListAsset>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AssetListResponse {
    /// Parses a response body. Fails when `ASSETS` is missing or not an array.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// `DURATION` as a number or a numeric string.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// A single asset of an interstitial.
#[derive(Debug, Clone, PartialEq)]
pub struct InterstitialAssetItem {
    pub parent_identifier: String,
    pub identifier: String,
    /// `None` until known.
    pub duration: Option<f64>,
    /// Offset from the start of the event.
    pub start_offset: f64,
    pub timeline_start: f64,
    pub uri: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InterstitialEvent {
    pub date_range: DateRange,
    base_url: String,
    duration: Option<f64>,
    timeline_start: Option<f64>,
    append_in_place_disabled: bool,
    pub append_in_place_started: bool,
    pub has_played: bool,
    pub cumulative_duration: f64,
    /// `NaN` when not signalled.
    pub resume_offset: f64,
    /// `NaN` when not signalled.
    pub playout_limit: f64,
    pub restrictions: PlaybackRestrictions,
    pub snap_options: SnapOptions,
    pub asset_list: Vec<InterstitialAssetItem>,
    pub asset_list_response: Option<AssetListResponse>,
    pub asset_list_loader: Option<RequestHandle>,
    pub resume_anchor: Option<MediaFragmentRef>,
    pub error: Option<AssetListError>,
    pub reset_on_resume: bool,
}

impl InterstitialEvent {
    pub fn new(date_range: DateRange, base_url: impl Into<String>) -> Self {
        let mut event = InterstitialEvent {
            date_range: date_range.clone(),
            base_url: base_url.into(),
            duration: None,
            timeline_start: None,
            append_in_place_disabled: false,
            append_in_place_started: false,
            has_played: false,
            cumulative_duration: 0.0,
            resume_offset: f64::NAN,
            playout_limit: f64::NAN,
            restrictions: PlaybackRestrictions::default(),
            snap_options: SnapOptions::default(),
            asset_list: Vec::new(),
            asset_list_response: None,
            asset_list_loader: None,
            resume_anchor: None,
            error: None,
            reset_on_resume: false,
        };
        event.set_date_range(date_range);
        event
    }

    /// Replaces the date range after a playlist reload, keeping playback state.
    pub fn set_date_range(&mut self, date_range: DateRange) {
        let attr = &date_range.attr;
        self.resume_offset = attr.optional_float(ATTR_RESUME_OFFSET, self.resume_offset);
        self.playout_limit = attr.optional_float(ATTR_PLAYOUT_LIMIT, self.playout_limit);
        if attr.contains(ATTR_RESTRICT) {
            let flags = attr.enumerated_string_list(ATTR_RESTRICT, &["SKIP", "JUMP"]);
            self.restrictions = PlaybackRestrictions {
                skip: flags.get("SKIP").copied().unwrap_or(false),
                jump: flags.get("JUMP").copied().unwrap_or(false),
            };
        }
        if attr.contains(ATTR_SNAP) {
            let flags = attr.enumerated_string_list(ATTR_SNAP, &["OUT", "IN"]);
            self.snap_options = SnapOptions {
                out: flags.get("OUT").copied().unwrap_or(false),
                in_: flags.get("IN").copied().unwrap_or(false),
            };
        }
        self.date_range = date_range;
    }

    /// Forgets playback progress. Assets of events that do not supplement the
    /// primary timeline are dropped too.
    pub fn reset(&mut self) {
        self.append_in_place_started = false;
        if let Some(loader) = self.asset_list_loader.take() {
            loader.0.destroy();
        }
        if !self.supplements_primary() {
            self.asset_list_response = None;
            self.asset_list.clear();
            self.duration = None;
        }
    }

    pub fn is_asset_past_playout_limit(&self, asset_index: usize) -> bool {
        if asset_index > 0 && asset_index >= self.asset_list.len() {
            return true;
        }
        if asset_index == 0 || self.playout_limit.is_nan() {
            return false;
        }
        if self.playout_limit == 0.0 {
            return true;
        }
        let offset = self.asset_list[asset_index].start_offset;
        offset > self.playout_limit
    }

    pub fn find_asset_index(&self, identifier: &str) -> Option<usize> {
        self.asset_list.iter().position(|a| a.identifier == identifier)
    }

    pub fn identifier(&self) -> &str {
        self.date_range.id()
    }

    pub fn cue(&self) -> DateRangeCue {
        self.date_range.cue()
    }

    /// Milliseconds since the epoch.
    pub fn start_date(&self) -> f64 {
        self.date_range.start_date()
    }

    pub fn start_time(&self) -> f64 {
        let start_time = self.date_range.start_time();
        if self.snap_options.out {
            if let Some(anchor) = &self.date_range.tag_anchor {
                return snap_to_fragment_time(start_time, anchor);
            }
        }
        start_time
    }

    /// Where the event sits on the primary timeline. Pre-rolls sit at zero.
    pub fn start_offset(&self) -> f64 {
        if self.cue().pre {
            0.0
        } else {
            self.start_time()
        }
    }

    /// Whether the event starts on a segment boundary of the primary content.
    pub fn start_is_aligned(&self) -> bool {
        if self.start_time() == 0.0 || self.snap_options.out {
            return true;
        }
        match &self.date_range.tag_anchor {
            Some(anchor) => {
                let start_time = self.date_range.start_time();
                let snapped = snap_to_fragment_time(start_time, anchor);
                (start_time - snapped).abs() < ALIGNED_END_THRESHOLD_SECONDS
            }
            None => false,
        }
    }

    pub fn resumption_offset(&self) -> f64 {
        let offset = if self.resume_offset.is_finite() {
            self.resume_offset
        } else {
            self.duration()
        };
        self.cumulative_duration + offset
    }

    pub fn resume_time(&self) -> f64 {
        let resume_time = self.start_offset() + self.resumption_offset();
        if self.snap_options.in_ {
            if let Some(anchor) = &self.resume_anchor {
                return snap_to_fragment_time(resume_time, anchor);
            }
        }
        resume_time
    }

    pub fn append_in_place(&self) -> bool {
        if self.append_in_place_started {
            return true;
        }
        if self.append_in_place_disabled {
            return false;
        }
        let cue = self.cue();
        if cue.once || cue.pre || !self.start_is_aligned() {
            return false;
        }
        if self.playout_limit.is_nan() && self.resume_offset.is_nan() {
            return true;
        }
        let duration = self.duration();
        self.resume_offset.is_finite()
            && self.resume_offset != 0.0
            && duration != 0.0
            && (self.resume_offset - duration).abs() < ALIGNED_END_THRESHOLD_SECONDS
    }

    /// Once appending in place has started only a reset on resume can be
    /// requested.
    pub fn set_append_in_place(&mut self, value: bool) {
        if self.append_in_place_started {
            self.reset_on_resume = !value;
            return;
        }
        self.append_in_place_disabled = !value;
    }

    pub fn timeline_start(&self) -> f64 {
        self.timeline_start.unwrap_or_else(|| self.start_time())
    }

    pub fn set_timeline_start(&mut self, value: f64) {
        self.timeline_start = Some(value);
    }

    /// Assigned duration, else the date range's `DURATION` or
    /// `PLANNED-DURATION`, capped by `X-PLAYOUT-LIMIT`.
    pub fn duration(&self) -> f64 {
        let mut duration = match self.duration {
            Some(duration) => duration,
            None => self
                .date_range
                .duration()
                .filter(|d| *d != 0.0)
                .or_else(|| self.date_range.planned_duration().filter(|d| d.is_finite()))
                .unwrap_or(0.0),
        };
        if !self.playout_limit.is_nan() && self.playout_limit < duration {
            duration = self.playout_limit;
        }
        duration
    }

    pub fn set_duration(&mut self, value: f64) {
        self.duration = Some(value);
    }

    pub fn timeline_occupancy(&self) -> TimelineOccupancy {
        match self.date_range.attr.get(ATTR_TIMELINE_OCCUPIES) {
            Some("RANGE") => TimelineOccupancy::Range,
            _ => TimelineOccupancy::Point,
        }
    }

    pub fn supplements_primary(&self) -> bool {
        self.date_range.attr.get(ATTR_TIMELINE_STYLE) == Some("PRIMARY")
    }

    pub fn content_may_vary(&self) -> bool {
        self.date_range.attr.get(ATTR_CONTENT_MAY_VARY) != Some("NO")
    }

    pub fn asset_url(&self) -> Option<&str> {
        self.date_range.attr.get(ATTR_ASSET_URI)
    }

    pub fn asset_list_url(&self) -> Option<&str> {
        self.date_range.attr.get(ATTR_ASSET_LIST)
    }

    /// URL of the playlist that carried the date range.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn asset_list_loaded(&self) -> bool {
        !self.asset_list.is_empty() || self.asset_list_response.is_some()
    }

    /// Installs a loaded asset list: one item per asset, laid out back to
    /// back from the event's timeline start. The event lasts as long as its
    /// assets.
    pub fn set_asset_list_response(&mut self, response: AssetListResponse) {
        let event_start = self.timeline_start();
        let mut sum_duration = 0.0;
        self.asset_list = response
            .assets
            .iter()
            .enumerate()
            .map(|(i, asset)| {
                let duration = asset.duration.unwrap_or(f64::NAN);
                let item = InterstitialAssetItem {
                    parent_identifier: self.identifier().to_string(),
                    identifier: generate_asset_identifier(self.identifier(), &asset.uri, i),
                    duration: Some(duration),
                    start_offset: sum_duration,
                    timeline_start: event_start + sum_duration,
                    uri: asset.uri.clone(),
                    error: None,
                };
                sum_duration += duration;
                item
            })
            .collect();
        self.duration = Some(sum_duration);
        self.asset_list_response = Some(response);
    }

    /// Creates the single asset of an `X-ASSET-URI` event.
    fn ensure_asset_uri_item(&mut self) {
        if !self.asset_list.is_empty() {
            return;
        }
        let Some(uri) = self.asset_url().map(String::from) else {
            return;
        };
        self.asset_list.push(InterstitialAssetItem {
            parent_identifier: self.identifier().to_string(),
            identifier: generate_asset_identifier(self.identifier(), &uri, 0),
            duration: None,
            start_offset: 0.0,
            timeline_start: self.timeline_start(),
            uri,
            error: None,
        });
    }

    /// Recomputes asset offsets and the event duration from the asset list.
    pub fn update_asset_durations(&mut self) {
        if !self.asset_list_loaded() {
            return;
        }
        let event_start = self.timeline_start();
        let mut sum_duration = 0.0;
        let mut has_unknown_duration = false;
        let mut has_errors = false;
        for asset in self.asset_list.iter_mut() {
            asset.start_offset = sum_duration;
            asset.timeline_start = event_start + sum_duration;
            has_unknown_duration |= asset.duration.is_none();
            has_errors |= asset.error.is_some();
            let duration = match (&asset.error, asset.duration) {
                (None, Some(d)) if d.is_finite() => d,
                _ => 0.0,
            };
            sum_duration += duration;
        }
        let duration = if has_unknown_duration && !has_errors {
            sum_duration.max(self.duration())
        } else {
            sum_duration
        };
        self.duration = Some(duration);
    }
}

/// Start or end of `frag`, whichever `time` is closer to.
fn snap_to_fragment_time(time: f64, frag: &MediaFragmentRef) -> f64 {
    let near_end = (time - frag.end()).abs() < ALIGNED_END_THRESHOLD_SECONDS;
    if time - frag.start < frag.duration / 2.0 && !near_end {
        frag.start
    } else {
        frag.end()
    }
}

/// 32-bit string hash rendered as an unsigned decimal.
fn hash(text: &str) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut hash: i32 = 5381;
    for unit in units.iter().rev() {
        hash = hash.wrapping_mul(33) ^ *unit as i32;
    }
    (hash as u32).to_string()
}

/// `<event id>-<1 based index>-<uri hash>`
pub fn generate_asset_identifier(event_id: &str, uri: &str, asset_index: usize) -> String {
    format!("{}-{}-{}", event_id, asset_index + 1, hash(uri))
}

/// Resolves an interstitial URI and tags it with the primary session id.
pub fn get_interstitial_url(
    uri: &str,
    session_id: &str,
    base_url: &str,
) -> Result<Url, url::ParseError> {
    let mut url = match Url::parse(uri) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base_url)?.join(uri)?,
        Err(e) => return Err(e),
    };
    if !is_data_uri(url.as_str()) {
        set_query_param(&mut url, "_HLS_primary_id", session_id);
    }
    Ok(url)
}

fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(name, value);
}

fn find_fragment_at(fragments: &[Option<Fragment>], time: f64) -> Option<&Fragment> {
    fragments
        .iter()
        .flatten()
        .find(|f| f.start() <= time && time < f.end())
}

/// Interstitial events of a primary playlist, kept across reloads by id.
#[derive(Debug, Default)]
pub struct InterstitialEventMap {
    events: Vec<InterstitialEvent>,
}

impl InterstitialEventMap {
    pub fn new() -> Self {
        InterstitialEventMap::default()
    }

    /// Events in playback order.
    pub fn events(&self) -> &[InterstitialEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [InterstitialEvent] {
        &mut self.events
    }

    pub fn get(&self, id: &str) -> Option<&InterstitialEvent> {
        self.events.iter().find(|e| e.identifier() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InterstitialEvent> {
        self.events.iter_mut().find(|e| e.identifier() == id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Rebuilds the schedule from the interstitial date ranges of `details`.
    ///
    /// Returns the events whose date range disappeared from the playlist.
    pub fn update(
        &mut self,
        details: &LevelDetails,
        enable_append_in_place: bool,
    ) -> Vec<InterstitialEvent> {
        let mut previous = std::mem::take(&mut self.events);
        for date_range in details.date_ranges.values() {
            if !date_range.is_interstitial() {
                continue;
            }
            let existing = previous
                .iter()
                .position(|e| e.identifier() == date_range.id())
                .map(|i| previous.swap_remove(i));
            let event = match existing {
                Some(mut event) => {
                    event.set_date_range(date_range.clone());
                    event
                }
                None => {
                    let mut event = InterstitialEvent::new(date_range.clone(), &details.url);
                    if !enable_append_in_place {
                        event.set_append_in_place(false);
                    }
                    debug!("new interstitial event {}", event.identifier());
                    event
                }
            };
            self.events.push(event);
        }
        for event in self.events.iter_mut() {
            event.ensure_asset_uri_item();
        }
        self.events.sort_by(compare_events);
        self.resolve_offsets(details);
        for removed in previous.iter_mut() {
            removed.reset();
        }
        previous
    }

    fn resolve_offsets(&mut self, details: &LevelDetails) {
        let primary_duration = if details.live {
            f64::INFINITY
        } else {
            details.edge()
        };
        let scheduled: Vec<usize> = (0..self.events.len())
            .filter(|&i| {
                let event = &self.events[i];
                event.error.is_none() && !(event.cue().once && event.has_played)
            })
            .collect();

        let mut cumulative_duration = 0.0;
        let mut last_scheduled_start = None;
        for (position, &index) in scheduled.iter().enumerate() {
            let event = &mut self.events[index];
            let cue = event.cue();
            let event_start = if cue.pre {
                0.0
            } else if cue.post {
                primary_duration
            } else {
                event.start_time()
            };
            event.update_asset_durations();
            if last_scheduled_start == Some(event_start) {
                event.cumulative_duration = cumulative_duration;
            } else {
                event.cumulative_duration = 0.0;
                cumulative_duration = 0.0;
                last_scheduled_start = Some(event_start);
            }
            if !cue.post && event.snap_options.in_ {
                let resume_at = event.start_offset() + event.resumption_offset();
                event.resume_anchor =
                    find_fragment_at(&details.fragments, resume_at).and_then(Fragment::media_ref);
            }
            if event.append_in_place()
                && !event.append_in_place_started
                && !primary_can_resume_in_place_at(event, details)
            {
                event.set_append_in_place(false);
            }
            let resume_offset = if event.resume_offset.is_finite() {
                event.resume_offset
            } else {
                event.duration()
            };
            let append_in_place = event.append_in_place();
            let resume_time = event.resume_time();
            cumulative_duration += resume_offset;

            if !append_in_place {
                if let Some(&next) = scheduled.get(position + 1) {
                    let next_event = &mut self.events[next];
                    if next_event.start_time() - resume_time < ALIGNED_END_THRESHOLD_SECONDS {
                        next_event.set_append_in_place(false);
                    }
                }
            }
        }
    }
}

/// Pre-rolls first, post-rolls last, the rest by start time. Ties keep
/// playlist tag order.
fn compare_events(a: &InterstitialEvent, b: &InterstitialEvent) -> Ordering {
    let (ca, cb) = (a.cue(), b.cue());
    if ca.pre != cb.pre {
        return if ca.pre { Ordering::Less } else { Ordering::Greater };
    }
    if ca.post != cb.post {
        return if ca.post { Ordering::Greater } else { Ordering::Less };
    }
    if !ca.pre && !ca.post {
        let (sa, sb) = (a.start_time(), b.start_time());
        if sa != sb {
            if let Some(order) = sa.partial_cmp(&sb) {
                return order;
            }
        }
    }
    a.date_range.tag_order.cmp(&b.date_range.tag_order)
}

/// Whether primary playback can pick up where the event ends without a gap.
fn primary_can_resume_in_place_at(event: &InterstitialEvent, details: &LevelDetails) -> bool {
    let resume_time = event.resume_time();
    let resumes_in_place_at = event.start_time() + event.resumption_offset();
    if (resume_time - resumes_in_place_at).abs() > ALIGNED_END_THRESHOLD_SECONDS {
        debug!(
            "interstitial {} resumes at {} instead of {}",
            event.identifier(),
            resume_time,
            resumes_in_place_at
        );
        return false;
    }
    if resume_time >= details.edge() {
        return true;
    }
    match find_fragment_at(&details.fragments, resume_time) {
        Some(frag) => {
            (frag.start() - resume_time).abs() < ALIGNED_END_THRESHOLD_SECONDS
                || (frag.end() - resume_time).abs() < ALIGNED_END_THRESHOLD_SECONDS
        }
        None => false,
    }
}

/// Fetches `X-ASSET-LIST` documents.
pub struct AssetListLoader {
    factory: Arc<dyn LoaderFactory>,
    load_policy: LoadPolicy,
    session_id: String,
    events: EventBus,
}

impl AssetListLoader {
    pub fn new(
        factory: Arc<dyn LoaderFactory>,
        load_policy: LoadPolicy,
        session_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        AssetListLoader {
            factory,
            load_policy,
            session_id: session_id.into(),
            events,
        }
    }

    /// Loads the asset list of `event` in a single attempt.
    ///
    /// Publishes [`HlsEvent::AssetListLoading`], then either
    /// [`HlsEvent::AssetListLoaded`] or an error. Failures are recorded on
    /// `event.error`; an aborted load publishes nothing.
    pub async fn load_asset_list(
        &self,
        event: &mut InterstitialEvent,
        hls_start_offset: Option<f64>,
    ) -> Result<AssetListResponse, AssetListError> {
        let id = event.identifier().to_string();
        let asset_list_url = event.asset_list_url().unwrap_or_default().to_string();
        let mut url = match get_interstitial_url(&asset_list_url, &self.session_id, event.base_url())
        {
            Ok(url) => url,
            Err(e) => {
                let error = AssetListError::new(
                    id,
                    ErrorDetails::AssetListLoadError,
                    e.to_string(),
                    Some(asset_list_url),
                );
                return Err(self.fail(event, error));
            }
        };
        if let Some(offset) = hls_start_offset.filter(|o| *o != 0.0) {
            if !is_data_uri(url.as_str()) {
                set_query_param(&mut url, "_HLS_start_offset", &offset.to_string());
            }
        }
        let url = url.to_string();

        let loader = self.factory.create();
        event.asset_list_loader = Some(RequestHandle(loader.clone()));
        self.events.publish(HlsEvent::AssetListLoading {
            event_id: id.clone(),
            url: url.clone(),
        });
        let result = load_with_timeout(
            loader.as_ref(),
            LoaderContext::new(url.clone(), ResponseType::Text),
            LoaderConfiguration::single_attempt(&self.load_policy),
        )
        .await;
        event.asset_list_loader = None;

        let response = match result {
            Ok(response) => response,
            Err(LoaderError::Aborted) => {
                debug!("asset list load aborted for {}", id);
                return Err(AssetListError::new(
                    id,
                    ErrorDetails::InternalAborted,
                    "asset list load aborted",
                    Some(url),
                ));
            }
            Err(LoaderError::Timeout) => {
                let error = AssetListError::new(
                    id,
                    ErrorDetails::AssetListLoadTimeout,
                    format!("Timeout loading X-ASSET-LIST ({})", url),
                    Some(url),
                );
                return Err(self.fail(event, error));
            }
            Err(LoaderError::Http { code, text }) => {
                let error = AssetListError::new(
                    id,
                    ErrorDetails::AssetListLoadError,
                    format!(
                        "Error loading X-ASSET-LIST: HTTP status {} {} ({})",
                        code, text, url
                    ),
                    Some(url),
                );
                return Err(self.fail(event, error));
            }
        };

        match AssetListResponse::from_slice(&response.data) {
            Ok(asset_list) => {
                event.set_asset_list_response(asset_list.clone());
                event.error = None;
                self.events.publish(HlsEvent::AssetListLoaded {
                    event_id: id,
                    response: asset_list.clone(),
                    network_details: response.network_details,
                });
                Ok(asset_list)
            }
            Err(e) => {
                let mut error = AssetListError::new(
                    id,
                    ErrorDetails::AssetListParsingError,
                    format!("Invalid interstitial asset list: {}", e),
                    Some(url),
                );
                error.network_details = response.network_details;
                Err(self.fail(event, error))
            }
        }
    }

    fn fail(&self, event: &mut InterstitialEvent, error: AssetListError) -> AssetListError {
        warn!("{}", error);
        event.error = Some(error.clone());
        self.events.publish(error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrList;
    use crate::loader::{Loader, LoaderResponse};
    use crate::parser::parse_level_playlist;
    use crate::segment::{LoadStats, PlaylistLevelType};
    use async_trait::async_trait;
    use bytes::Bytes;

    const PRIMARY: &str = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-PROGRAM-DATE-TIME:2020-01-01T00:00:00.000Z
#EXTINF:4,
a.ts
#EXTINF:4,
b.ts
#EXTINF:4,
c.ts
#EXTINF:4,
d.ts
#EXT-X-DATERANGE:ID=\"mid\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"2020-01-01T00:00:08.000Z\",X-ASSET-LIST=\"list.json\"
#EXT-X-DATERANGE:ID=\"pre\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"2020-01-01T00:00:00.000Z\",CUE=\"PRE\",X-ASSET-URI=\"pre.m3u8\",DURATION=5
#EXT-X-DATERANGE:ID=\"post\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"2020-01-01T00:00:00.000Z\",CUE=\"POST\",X-ASSET-URI=\"post.m3u8\"
#EXT-X-DATERANGE:ID=\"chapter\",START-DATE=\"2020-01-01T00:00:04.000Z\"
#EXT-X-ENDLIST
";

    fn primary() -> LevelDetails {
        parse_level_playlist(
            PRIMARY,
            "https://example.com/primary.m3u8",
            0,
            PlaylistLevelType::Main,
        )
    }

    fn anchor(start: f64, duration: f64) -> MediaFragmentRef {
        MediaFragmentRef {
            base_url: "https://example.com/primary.m3u8".into(),
            start,
            duration,
            sn: 0,
            program_date_time: Some(start * 1000.0),
        }
    }

    fn event(attrs: &str, anchor_at: Option<(f64, f64)>) -> InterstitialEvent {
        let mut range = DateRange::new(AttrList::parse(attrs), None, 0);
        range.tag_anchor = anchor_at.map(|(start, duration)| anchor(start, duration));
        InterstitialEvent::new(range, "https://example.com/primary.m3u8")
    }

    const BASE: &str = "ID=\"ad\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"1970-01-01T00:00:08.000Z\",X-ASSET-URI=\"ad.m3u8\"";

    #[test]
    fn parses_policy_attributes() {
        let e = event(
            &format!("{},X-RESUME-OFFSET=0,X-PLAYOUT-LIMIT=15,X-RESTRICT=\"SKIP,JUMP\",X-SNAP=\"IN\"", BASE),
            Some((8.0, 4.0)),
        );
        assert_eq!(e.resume_offset, 0.0);
        assert_eq!(e.playout_limit, 15.0);
        assert_eq!(e.restrictions, PlaybackRestrictions { skip: true, jump: true });
        assert_eq!(e.snap_options, SnapOptions { out: false, in_: true });
        assert_eq!(e.timeline_occupancy(), TimelineOccupancy::Point);
        assert!(e.content_may_vary());
        assert_eq!(e.asset_url(), Some("ad.m3u8"));
    }

    #[test]
    fn duration_sources() {
        let mut e = event(&format!("{},PLANNED-DURATION=12", BASE), Some((8.0, 4.0)));
        assert_eq!(e.duration(), 12.0);
        e = event(&format!("{},DURATION=10,PLANNED-DURATION=12", BASE), Some((8.0, 4.0)));
        assert_eq!(e.duration(), 10.0);
        e = event(&format!("{},DURATION=10,X-PLAYOUT-LIMIT=6", BASE), Some((8.0, 4.0)));
        assert_eq!(e.duration(), 6.0);
        e.set_duration(3.0);
        assert_eq!(e.duration(), 3.0);
    }

    #[test]
    fn resumption_offset_prefers_resume_offset() {
        let mut e = event(&format!("{},DURATION=30", BASE), Some((8.0, 4.0)));
        e.cumulative_duration = 10.0;
        assert_eq!(e.resumption_offset(), 40.0);
        e = event(&format!("{},DURATION=30,X-RESUME-OFFSET=0", BASE), Some((8.0, 4.0)));
        e.cumulative_duration = 10.0;
        assert_eq!(e.resumption_offset(), 10.0);
        assert_eq!(e.resume_time(), 18.0);
    }

    #[test]
    fn append_in_place_policy() {
        let aligned = event(&format!("{},DURATION=30", BASE), Some((8.0, 4.0)));
        assert!(aligned.start_is_aligned());
        assert!(aligned.append_in_place());

        let unaligned = event(&format!("{},DURATION=30", BASE), Some((7.0, 4.0)));
        assert!(!unaligned.start_is_aligned());
        assert!(!unaligned.append_in_place());

        let once = event(&format!("{},CUE=\"ONCE\"", BASE), Some((8.0, 4.0)));
        assert!(!once.append_in_place());

        let resumes_early = event(&format!("{},DURATION=30,X-RESUME-OFFSET=0", BASE), Some((8.0, 4.0)));
        assert!(!resumes_early.append_in_place());

        let resumes_at_end = event(
            &format!("{},DURATION=30,X-RESUME-OFFSET=30.01", BASE),
            Some((8.0, 4.0)),
        );
        assert!(resumes_at_end.append_in_place());
    }

    #[test]
    fn append_in_place_is_sticky_once_started() {
        let mut e = event(&format!("{},DURATION=30", BASE), Some((8.0, 4.0)));
        e.set_append_in_place(false);
        assert!(!e.append_in_place());
        e.set_append_in_place(true);
        e.append_in_place_started = true;
        e.set_append_in_place(false);
        assert!(e.append_in_place());
        assert!(e.reset_on_resume);
    }

    #[test]
    fn snap_out_moves_start_to_segment_boundary() {
        let e = event(&format!("{},X-SNAP=\"OUT\"", BASE), Some((7.0, 4.0)));
        assert_eq!(e.date_range.start_time(), 8.0);
        assert_eq!(e.start_time(), 7.0);
        let e = event(&format!("{},X-SNAP=\"OUT\"", BASE), Some((5.0, 4.0)));
        assert_eq!(e.start_time(), 9.0);
    }

    #[test]
    fn playout_limit() {
        let mut e = event(&format!("{},X-PLAYOUT-LIMIT=20", BASE), Some((8.0, 4.0)));
        e.set_asset_list_response(
            AssetListResponse::from_slice(
                br#"{"ASSETS":[{"URI":"a.m3u8","DURATION":15},{"URI":"b.m3u8","DURATION":10},{"URI":"c.m3u8","DURATION":10}]}"#,
            )
            .unwrap(),
        );
        assert!(!e.is_asset_past_playout_limit(0));
        assert!(!e.is_asset_past_playout_limit(1));
        assert!(e.is_asset_past_playout_limit(2));
        assert!(e.is_asset_past_playout_limit(3));
        e.playout_limit = 0.0;
        assert!(!e.is_asset_past_playout_limit(0));
        assert!(e.is_asset_past_playout_limit(1));
    }

    #[test]
    fn asset_list_items() {
        let mut e = event(BASE, Some((8.0, 4.0)));
        e.set_asset_list_response(
            AssetListResponse::from_slice(
                br#"{"ASSETS":[{"URI":"a.m3u8","DURATION":15.5},{"URI":"b.m3u8","DURATION":"10"}],"X-AD-ID":"7"}"#,
            )
            .unwrap(),
        );
        assert_eq!(e.duration(), 25.5);
        assert_eq!(e.asset_list.len(), 2);
        let second = &e.asset_list[1];
        assert_eq!(second.parent_identifier, "ad");
        assert_eq!(second.identifier, format!("ad-2-{}", hash("b.m3u8")));
        assert_eq!(second.start_offset, 15.5);
        assert_eq!(second.timeline_start, 23.5);
        assert_eq!(e.find_asset_index(&second.identifier), Some(1));
        assert!(e.asset_list_loaded());
        assert!(e.asset_list_response.as_ref().unwrap().extra.contains_key("X-AD-ID"));
    }

    #[test]
    fn asset_list_requires_assets_array() {
        assert!(AssetListResponse::from_slice(br#"{"ASSETS":{}}"#).is_err());
        assert!(AssetListResponse::from_slice(br#"{}"#).is_err());
        assert!(AssetListResponse::from_slice(b"not json").is_err());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash(""), "5381");
        assert_eq!(hash("a"), ((5381i32 * 33) ^ 97).to_string());
        assert_eq!(hash("ab"), hash("ab"));
        assert_ne!(hash("ab"), hash("ba"));
        assert_eq!(hash("ab"), "5861062");
        assert_eq!(hash("é€"), "5584576");
    }

    #[test]
    fn asset_identifier_hashes_uri() {
        assert_eq!(
            generate_asset_identifier("ad", "https://ads.example.com/ad1.m3u8", 0),
            "ad-1-243963949"
        );
        assert_eq!(generate_asset_identifier("ad", "a", 2), "ad-3-177604");
    }

    #[test]
    fn interstitial_url_query() {
        let url = get_interstitial_url("list.json?x=1", "session", "https://example.com/p/primary.m3u8")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/p/list.json?x=1&_HLS_primary_id=session"
        );
        let data = get_interstitial_url("data:application/json,{}", "session", "https://example.com/")
            .unwrap();
        assert!(!data.as_str().contains("_HLS_primary_id"));
    }

    #[test]
    fn schedule_orders_and_filters_events() {
        let details = primary();
        let mut map = InterstitialEventMap::new();
        let removed = map.update(&details, true);
        assert!(removed.is_empty());
        let ids: Vec<&str> = map.events().iter().map(|e| e.identifier()).collect();
        assert_eq!(ids, vec!["pre", "mid", "post"]);

        let pre = map.get("pre").unwrap();
        assert_eq!(pre.start_offset(), 0.0);
        assert!(!pre.append_in_place());
        assert_eq!(pre.asset_list.len(), 1);
        assert_eq!(pre.asset_list[0].duration, None);
        assert_eq!(pre.duration(), 5.0);

        let mid = map.get("mid").unwrap();
        assert_eq!(mid.start_time(), 8.0);
        assert!(mid.asset_list.is_empty());
        assert!(mid.append_in_place());
        assert_eq!(mid.base_url(), "https://example.com/primary.m3u8");
    }

    #[test]
    fn schedule_keeps_state_and_reports_removed() {
        let details = primary();
        let mut map = InterstitialEventMap::new();
        map.update(&details, true);
        map.get_mut("mid").unwrap().has_played = true;

        let mut reloaded = primary();
        reloaded.date_ranges.remove("post");
        let removed = map.update(&reloaded, true);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].identifier(), "post");
        assert!(map.get("mid").unwrap().has_played);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn disabled_append_in_place() {
        let mut map = InterstitialEventMap::new();
        map.update(&primary(), false);
        assert!(map.events().iter().all(|e| !e.append_in_place()));
    }

    #[test]
    fn back_to_back_events_accumulate() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-PROGRAM-DATE-TIME:2020-01-01T00:00:00.000Z
#EXTINF:4,
a.ts
#EXTINF:4,
b.ts
#EXT-X-DATERANGE:ID=\"one\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"2020-01-01T00:00:04.000Z\",X-ASSET-URI=\"one.m3u8\",DURATION=10
#EXT-X-DATERANGE:ID=\"two\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"2020-01-01T00:00:04.000Z\",X-ASSET-URI=\"two.m3u8\",DURATION=6
#EXT-X-ENDLIST
";
        let details = parse_level_playlist(text, "https://example.com/p.m3u8", 0, PlaylistLevelType::Main);
        let mut map = InterstitialEventMap::new();
        map.update(&details, true);
        let one = map.get("one").unwrap();
        let two = map.get("two").unwrap();
        assert_eq!(one.cumulative_duration, 0.0);
        assert_eq!(one.resume_time(), 14.0);
        assert_eq!(two.cumulative_duration, 10.0);
        assert_eq!(two.resumption_offset(), 16.0);
        assert_eq!(two.resume_time(), 20.0);
    }

    struct JsonLoader {
        status: Result<&'static str, LoaderError>,
        requested: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Loader for JsonLoader {
        async fn load(
            &self,
            context: LoaderContext,
            _config: LoaderConfiguration,
        ) -> Result<LoaderResponse, LoaderError> {
            self.requested.lock().push(context.url.clone());
            let body = self.status.clone()?;
            Ok(LoaderResponse {
                url: context.url,
                code: 200,
                data: Bytes::from_static(body.as_bytes()),
                stats: LoadStats::default(),
                network_details: None,
            })
        }

        fn abort(&self) {}

        fn destroy(&self) {}
    }

    fn asset_list_loader(status: Result<&'static str, LoaderError>) -> (AssetListLoader, Arc<JsonLoader>, EventBus) {
        let loader = Arc::new(JsonLoader {
            status,
            requested: parking_lot::Mutex::new(Vec::new()),
        });
        let shared = loader.clone();
        let factory = move || -> Arc<dyn Loader> { shared.clone() };
        let bus = EventBus::default();
        (
            AssetListLoader::new(
                Arc::new(factory),
                LoadPolicy::asset_list_default(),
                "session",
                bus.clone(),
            ),
            loader,
            bus,
        )
    }

    #[tokio::test]
    async fn loads_asset_list() {
        let (loader, fake, bus) =
            asset_list_loader(Ok(r#"{"ASSETS":[{"URI":"a.m3u8","DURATION":12}]}"#));
        let mut rx = bus.subscribe();
        let mut e = event(
            "ID=\"ad\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"1970-01-01T00:00:08.000Z\",X-ASSET-LIST=\"list.json\"",
            Some((8.0, 4.0)),
        );
        let response = loader.load_asset_list(&mut e, Some(2.5)).await.unwrap();
        assert_eq!(response.assets.len(), 1);
        assert_eq!(e.duration(), 12.0);
        assert!(e.asset_list_loader.is_none());
        assert_eq!(
            fake.requested.lock()[0],
            "https://example.com/list.json?_HLS_primary_id=session&_HLS_start_offset=2.5"
        );
        assert!(matches!(rx.recv().await.unwrap(), HlsEvent::AssetListLoading { .. }));
        match rx.recv().await.unwrap() {
            HlsEvent::AssetListLoaded { event_id, .. } => assert_eq!(event_id, "ad"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn asset_list_errors_are_recorded() {
        let (loader, _, bus) = asset_list_loader(Ok(r#"{"ASSETS":"nope"}"#));
        let mut rx = bus.subscribe();
        let mut e = event(
            "ID=\"ad\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"1970-01-01T00:00:08.000Z\",X-ASSET-LIST=\"list.json\"",
            None,
        );
        let error = loader.load_asset_list(&mut e, None).await.unwrap_err();
        assert_eq!(error.details, ErrorDetails::AssetListParsingError);
        assert!(!error.fatal);
        assert_eq!(e.error.as_ref().map(|e| e.details), Some(ErrorDetails::AssetListParsingError));
        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            HlsEvent::Error(data) => assert_eq!(data.details(), ErrorDetails::AssetListParsingError),
            other => panic!("unexpected {:?}", other),
        }

        let (loader, _, _) = asset_list_loader(Err(LoaderError::Http {
            code: 404,
            text: "Not Found".into(),
        }));
        let error = loader.load_asset_list(&mut e, None).await.unwrap_err();
        assert_eq!(error.details, ErrorDetails::AssetListLoadError);
        assert!(error.reason.contains("HTTP status 404"));

        let (loader, _, _) = asset_list_loader(Err(LoaderError::Timeout));
        let error = loader.load_asset_list(&mut e, None).await.unwrap_err();
        assert_eq!(error.details, ErrorDetails::AssetListLoadTimeout);
    }
}
