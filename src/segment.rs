//! Media segment model: fragments, partial segments and their shared base.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use nom::character::complete::{char, digit1};
use nom::combinator::{map_res, opt};
use nom::sequence::{pair, preceded};
use nom::IResult;

use crate::attributes::{AttrList, KeyMethod};
use crate::date_range::parse_date_ms;
use crate::error::FragmentSummary;
use crate::level_key::{KeyIdRegistry, KeySystemFormat, LevelKey, LevelKeys};
use crate::loader::Loader;
use crate::uri::resolve_url;

/// Media sequence number of a fragment, or the init segment sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentSn {
    Media(u64),
    InitSegment,
}

impl FragmentSn {
    pub fn media(&self) -> Option<u64> {
        match self {
            FragmentSn::Media(sn) => Some(*sn),
            FragmentSn::InitSegment => None,
        }
    }

    pub fn is_init_segment(&self) -> bool {
        matches!(self, FragmentSn::InitSegment)
    }
}

impl Default for FragmentSn {
    fn default() -> Self {
        FragmentSn::Media(0)
    }
}

impl fmt::Display for FragmentSn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FragmentSn::Media(sn) => write!(f, "{}", sn),
            FragmentSn::InitSegment => write!(f, "initSegment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaylistLevelType {
    #[default]
    Main,
    Audio,
    Subtitle,
}

impl fmt::Display for PlaylistLevelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlaylistLevelType::Main => write!(f, "main"),
            PlaylistLevelType::Audio => write!(f, "audio"),
            PlaylistLevelType::Subtitle => write!(f, "subtitle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementaryStreamType {
    Audio,
    Video,
    AudioVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ElementaryStreamInfo {
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
    pub partial: bool,
}

pub type ElementaryStreams = HashMap<ElementaryStreamType, ElementaryStreamInfo>;

/// Timing and size counters of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStats {
    pub aborted: bool,
    pub loaded: u64,
    pub retry: u32,
    pub total: u64,
    pub chunk_count: u32,
    pub bw_estimate: f64,
    pub loading_start: f64,
    pub loading_first: f64,
    pub loading_end: f64,
}

/// Half open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn number(i: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(i)
}

fn byte_range_val(i: &str) -> IResult<&str, (u64, Option<u64>)> {
    pair(number, opt(preceded(char('@'), number)))(i)
}

/// State shared by fragments and parts.
#[derive(Debug, Clone, Default)]
pub struct BaseSegment {
    pub base_url: String,
    relurl: String,
    url: OnceLock<String>,
    byte_range: Option<ByteRange>,
    elementary_streams: Option<ElementaryStreams>,
    stats: Option<LoadStats>,
}

impl BaseSegment {
    pub fn new(base_url: impl Into<String>) -> Self {
        BaseSegment {
            base_url: base_url.into(),
            ..BaseSegment::default()
        }
    }

    pub fn relurl(&self) -> &str {
        &self.relurl
    }

    pub fn set_relurl(&mut self, relurl: impl Into<String>) {
        self.relurl = relurl.into();
        self.url = OnceLock::new();
    }

    /// Absolute URL, resolved on first access.
    pub fn url(&self) -> &str {
        self.url
            .get_or_init(|| resolve_url(&self.base_url, &self.relurl))
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = OnceLock::from(url.into());
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    /// Applies a `<length>[@<offset>]` value. Without an offset the range
    /// continues where `previous` ended.
    pub fn set_byte_range(&mut self, value: &str, previous: Option<&BaseSegment>) {
        let Ok((_, (length, offset))) = byte_range_val(value.trim()) else {
            return;
        };
        let start = offset.unwrap_or_else(|| {
            previous
                .and_then(BaseSegment::byte_range_end_offset)
                .unwrap_or(0)
        });
        self.byte_range = Some(ByteRange {
            start,
            end: start.saturating_add(length),
        });
    }

    pub fn byte_range_start_offset(&self) -> Option<u64> {
        self.byte_range.map(|r| r.start)
    }

    pub fn byte_range_end_offset(&self) -> Option<u64> {
        self.byte_range.map(|r| r.end)
    }

    pub fn has_stats(&self) -> bool {
        self.stats.is_some()
    }

    pub fn stats(&self) -> Option<&LoadStats> {
        self.stats.as_ref()
    }

    pub fn stats_mut(&mut self) -> &mut LoadStats {
        self.stats.get_or_insert_with(LoadStats::default)
    }

    pub fn has_streams(&self) -> bool {
        self.elementary_streams.is_some()
    }

    pub fn elementary_streams(&self) -> Option<&ElementaryStreams> {
        self.elementary_streams.as_ref()
    }

    pub fn elementary_streams_mut(&mut self) -> &mut ElementaryStreams {
        self.elementary_streams.get_or_insert_with(HashMap::new)
    }

    /// Records or widens the PTS/DTS span of an elementary stream.
    pub fn set_elementary_stream_info(
        &mut self,
        kind: ElementaryStreamType,
        start_pts: f64,
        end_pts: f64,
        start_dts: f64,
        end_dts: f64,
        partial: bool,
    ) {
        let streams = self.elementary_streams_mut();
        match streams.get_mut(&kind) {
            Some(info) => {
                info.start_pts = info.start_pts.min(start_pts);
                info.end_pts = info.end_pts.max(end_pts);
                info.start_dts = info.start_dts.min(start_dts);
                info.end_dts = info.end_dts.max(end_dts);
            }
            None => {
                streams.insert(
                    kind,
                    ElementaryStreamInfo {
                        start_pts,
                        end_pts,
                        start_dts,
                        end_dts,
                        partial,
                    },
                );
            }
        }
    }

    pub fn clear_elementary_stream_info(&mut self) {
        if let Some(streams) = self.elementary_streams.as_mut() {
            streams.clear();
        }
    }
}

/// Snapshot of a media fragment used as a timeline anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFragmentRef {
    pub base_url: String,
    pub start: f64,
    pub duration: f64,
    pub sn: u64,
    pub program_date_time: Option<f64>,
}

impl MediaFragmentRef {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Outcome of decrypt data resolution for a fragment.
#[derive(Debug, Clone)]
pub enum DecryptState {
    Unencrypted,
    Resolved(Arc<LevelKey>),
    /// Several DRM key formats apply; the key system has to be chosen with
    /// [`Fragment::set_key_format`] before the fragment can be decrypted.
    PendingKeySystemSelection,
}

/// Handle to an in-flight request that can be aborted.
#[derive(Clone)]
pub struct RequestHandle(pub Arc<dyn Loader>);

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RequestHandle")
    }
}

#[derive(Debug, Clone)]
pub struct Fragment {
    base: BaseSegment,
    pub playlist_type: PlaylistLevelType,
    pub sn: FragmentSn,
    pub cc: u64,
    pub level: usize,
    start: f64,
    duration: f64,
    pub playlist_offset: f64,
    pub levelkeys: Option<Arc<LevelKeys>>,
    decryptdata: Option<Arc<LevelKey>>,
    pub raw_program_date_time: Option<String>,
    program_date_time: OnceLock<Option<f64>>,
    pub title: Option<String>,
    pub tag_list: Vec<Vec<String>>,
    pub init_segment: Option<Arc<Fragment>>,
    pub end_list: bool,
    pub gap: bool,
    signalled_bitrate: Option<f64>,
    /// Payload of a loaded init segment.
    pub data: Option<Bytes>,
    pub loader: Option<RequestHandle>,
    pub key_loader: Option<RequestHandle>,
    pub start_pts: Option<f64>,
    pub end_pts: Option<f64>,
    pub start_dts: Option<f64>,
    pub end_dts: Option<f64>,
    pub max_start_pts: Option<f64>,
    pub min_end_pts: Option<f64>,
    pub delta_pts: Option<f64>,
}

impl Deref for Fragment {
    type Target = BaseSegment;

    fn deref(&self) -> &BaseSegment {
        &self.base
    }
}

impl DerefMut for Fragment {
    fn deref_mut(&mut self) -> &mut BaseSegment {
        &mut self.base
    }
}

impl Fragment {
    pub fn new(playlist_type: PlaylistLevelType, base_url: impl Into<String>) -> Self {
        Fragment {
            base: BaseSegment::new(base_url),
            playlist_type,
            sn: FragmentSn::default(),
            cc: 0,
            level: 0,
            start: 0.0,
            duration: 0.0,
            playlist_offset: 0.0,
            levelkeys: None,
            decryptdata: None,
            raw_program_date_time: None,
            program_date_time: OnceLock::new(),
            title: None,
            tag_list: Vec::new(),
            init_segment: None,
            end_list: false,
            gap: false,
            signalled_bitrate: None,
            data: None,
            loader: None,
            key_loader: None,
            start_pts: None,
            end_pts: None,
            start_dts: None,
            end_dts: None,
            max_start_pts: None,
            min_end_pts: None,
            delta_pts: None,
        }
    }

    pub fn is_media(&self) -> bool {
        !self.sn.is_init_segment()
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn set_start(&mut self, start: f64) {
        self.start = start;
    }

    pub fn add_start(&mut self, delta: f64) {
        self.set_start(self.start + delta);
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration;
    }

    /// Snapshot of the fragment's current position, `None` for init segments.
    pub fn media_ref(&self) -> Option<MediaFragmentRef> {
        Some(MediaFragmentRef {
            base_url: self.base.base_url.clone(),
            start: self.start,
            duration: self.duration,
            sn: self.sn.media()?,
            program_date_time: self.program_date_time(),
        })
    }

    /// Milliseconds since the epoch, parsed from the raw tag on first access.
    pub fn program_date_time(&self) -> Option<f64> {
        *self.program_date_time.get_or_init(|| {
            self.raw_program_date_time
                .as_deref()
                .and_then(parse_date_ms)
        })
    }

    /// A non finite value clears both the raw and the parsed date.
    pub fn set_program_date_time(&mut self, value: Option<f64>) {
        match value.filter(|v| v.is_finite()) {
            Some(v) => self.program_date_time = OnceLock::from(Some(v)),
            None => {
                self.raw_program_date_time = None;
                self.program_date_time = OnceLock::from(None);
            }
        }
    }

    pub fn set_raw_program_date_time(&mut self, raw: Option<String>) {
        self.raw_program_date_time = raw;
        self.program_date_time = OnceLock::new();
    }

    pub fn end_program_date_time(&self) -> Option<f64> {
        let pdt = self.program_date_time()?;
        let duration = if self.duration.is_finite() {
            self.duration
        } else {
            0.0
        };
        Some(pdt + duration * 1000.0)
    }

    pub fn byte_length(&self) -> Option<u64> {
        if let Some(total) = self.base.stats().map(|s| s.total).filter(|t| *t > 0) {
            return Some(total);
        }
        self.base.byte_range().map(|r| r.len())
    }

    /// Bits per second from the known byte length, else the signalled value.
    pub fn bitrate(&self) -> Option<f64> {
        match self.byte_length().filter(|l| *l > 0) {
            Some(len) if self.duration > 0.0 => Some(len as f64 * 8.0 / self.duration),
            _ => self.signalled_bitrate,
        }
    }

    pub fn set_bitrate(&mut self, bitrate: f64) {
        self.signalled_bitrate = Some(bitrate);
    }

    /// Whether any key of the fragment encrypts content.
    pub fn encrypted(&self) -> bool {
        if self.decryptdata.as_ref().map(|d| d.encrypted) == Some(true) {
            return true;
        }
        match &self.levelkeys {
            Some(keys) => keys.len() > 1 || keys.values().any(|k| k.encrypted),
            None => false,
        }
    }

    /// Decrypt data resolved so far, without resolving.
    pub fn decryptdata(&self) -> Option<&Arc<LevelKey>> {
        self.decryptdata.as_ref()
    }

    pub fn set_decryptdata(&mut self, decryptdata: Option<Arc<LevelKey>>) {
        self.decryptdata = decryptdata;
    }

    /// Resolves decrypt data from `levelkeys`, caching the result.
    ///
    /// With several DRM key formats and none selected the state stays pending:
    /// it does not mean the fragment is clear.
    pub fn decrypt_state(&mut self, registry: &KeyIdRegistry) -> DecryptState {
        let Some(levelkeys) = self.levelkeys.clone() else {
            return DecryptState::Unencrypted;
        };
        if levelkeys.values().any(|k| k.method == KeyMethod::None) {
            return DecryptState::Unencrypted;
        }
        if let Some(identity) = levelkeys.get("identity") {
            if self.decryptdata.is_none() {
                self.decryptdata = identity
                    .get_decrypt_data(self.sn, Some(&levelkeys), registry)
                    .map(Arc::new);
            }
        } else if self.decryptdata.as_ref().and_then(|d| d.key_id.as_ref()).is_none() {
            if levelkeys.len() == 1 {
                self.decryptdata = levelkeys
                    .values()
                    .next()
                    .and_then(|k| k.get_decrypt_data(self.sn, Some(&levelkeys), registry))
                    .map(Arc::new);
            } else if self.decryptdata.is_none() {
                return DecryptState::PendingKeySystemSelection;
            }
        }
        match &self.decryptdata {
            Some(data) => DecryptState::Resolved(data.clone()),
            None => DecryptState::Unencrypted,
        }
    }

    /// Selects the key of `format` once the DRM key system is known.
    pub fn set_key_format(&mut self, format: KeySystemFormat, registry: &KeyIdRegistry) {
        let Some(levelkeys) = self.levelkeys.clone() else {
            return;
        };
        let Some(key) = levelkeys.get(format.as_str()) else {
            return;
        };
        if self.decryptdata.as_ref().and_then(|d| d.key_id.as_ref()).is_none() {
            self.decryptdata = key
                .get_decrypt_data(self.sn, Some(&levelkeys), registry)
                .map(Arc::new);
        }
    }

    pub fn abort_requests(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.0.abort();
        }
        if let Some(key_loader) = self.key_loader.take() {
            key_loader.0.abort();
        }
    }

    pub fn summary(&self) -> FragmentSummary {
        FragmentSummary {
            sn: self.sn,
            level: self.level,
            playlist_type: self.playlist_type,
            url: self.url().to_string(),
        }
    }
}

/// Low latency partial segment of a parent fragment.
#[derive(Debug, Clone)]
pub struct Part {
    base: BaseSegment,
    pub frag_offset: f64,
    pub duration: f64,
    pub gap: bool,
    pub independent: bool,
    pub index: usize,
    frag_sn: FragmentSn,
    frag_start: f64,
}

impl Deref for Part {
    type Target = BaseSegment;

    fn deref(&self) -> &BaseSegment {
        &self.base
    }
}

impl DerefMut for Part {
    fn deref_mut(&mut self) -> &mut BaseSegment {
        &mut self.base
    }
}

impl Part {
    pub fn new(
        attrs: &AttrList,
        frag: &Fragment,
        base_url: &str,
        index: usize,
        previous: Option<&Part>,
    ) -> Self {
        let mut base = BaseSegment::new(base_url);
        base.set_relurl(attrs.enumerated_string("URI").unwrap_or_default());
        if let Some(range) = attrs.enumerated_string("BYTERANGE") {
            base.set_byte_range(range, previous.map(|p| &p.base));
        }
        Part {
            base,
            frag_offset: previous
                .map(|p| p.frag_offset + p.duration)
                .unwrap_or(0.0),
            duration: attrs.decimal_floating_point("DURATION"),
            gap: attrs.bool("GAP"),
            independent: attrs.bool("INDEPENDENT"),
            index,
            frag_sn: frag.sn,
            frag_start: frag.start(),
        }
    }

    /// Sequence number of the parent fragment.
    pub fn frag_sn(&self) -> FragmentSn {
        self.frag_sn
    }

    /// Re-anchors the part after its parent fragment was positioned.
    pub fn set_fragment(&mut self, frag: &Fragment) {
        self.frag_sn = frag.sn;
        self.frag_start = frag.start();
    }

    pub fn start(&self) -> f64 {
        self.frag_start + self.frag_offset
    }

    pub fn end(&self) -> f64 {
        self.start() + self.duration
    }

    pub fn loaded(&self) -> bool {
        self.base
            .elementary_streams()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}
