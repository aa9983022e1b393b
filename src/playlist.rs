//! Contains all the structs used for parsing.
//!
//! The main type here is the `Playlist` enum.
//! Which is either a `MultivariantPlaylist` or a `MediaPlaylist`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::attributes::{AttrList, ClosedCaptions, HdcpLevel, Resolution};
use crate::codecs::LevelCodecs;
use crate::error::PlaylistParsingError;
use crate::level_details::LevelDetails;
use crate::level_key::LevelKey;

/// [Playlist](https://tools.ietf.org/html/draft-pantos-http-live-streaming-19#section-4.1),
/// can either be a `MultivariantPlaylist` or a `MediaPlaylist`.
#[derive(Debug, Clone)]
pub enum Playlist {
    MultivariantPlaylist(ParsedMultivariantPlaylist),
    MediaPlaylist(Box<LevelDetails>),
}

impl Playlist {
    pub fn playlist_parsing_error(&self) -> Option<&PlaylistParsingError> {
        match self {
            Playlist::MultivariantPlaylist(p) => p.playlist_parsing_error.as_ref(),
            Playlist::MediaPlaylist(d) => d.playlist_parsing_error.as_ref(),
        }
    }
}

/// `#EXT-X-CONTENT-STEERING`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSteering {
    pub uri: String,
    pub pathway_id: String,
}

/// A variant stream announced by `#EXT-X-STREAM-INF`.
#[derive(Debug, Clone)]
pub struct LevelParsed {
    pub attrs: AttrList,
    pub url: String,
    pub bitrate: u64,
    pub name: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub hdcp_level: Option<HdcpLevel>,
    pub closed_captions: Option<ClosedCaptions>,
    pub audio_group: Option<String>,
    pub subtitle_group: Option<String>,
    pub codecs: LevelCodecs,
}

impl LevelParsed {
    pub fn from_attrs(attrs: AttrList, url: String) -> Self {
        let bitrate = attrs
            .decimal_integer("BANDWIDTH")
            .filter(|b| *b > 0)
            .or_else(|| attrs.decimal_integer("AVERAGE-BANDWIDTH"))
            .unwrap_or(0);
        let frame_rate = Some(attrs.decimal_floating_point("FRAME-RATE")).filter(|f| f.is_finite());
        LevelParsed {
            url,
            bitrate,
            name: attrs.get("NAME").map(String::from),
            resolution: attrs.decimal_resolution("RESOLUTION"),
            frame_rate,
            hdcp_level: attrs.raw("HDCP-LEVEL").cloned().map(HdcpLevel::from),
            closed_captions: attrs.raw("CLOSED-CAPTIONS").cloned().map(ClosedCaptions::from),
            audio_group: attrs.get("AUDIO").map(String::from),
            subtitle_group: attrs.get("SUBTITLES").map(String::from),
            codecs: LevelCodecs::classify(attrs.get("CODECS").unwrap_or_default()),
            attrs,
        }
    }

    pub fn width(&self) -> Option<u64> {
        self.resolution.map(|r| r.width)
    }

    pub fn height(&self) -> Option<u64> {
        self.resolution.map(|r| r.height)
    }
}

/// Result of parsing a multivariant playlist.
#[derive(Debug, Clone, Default)]
pub struct ParsedMultivariantPlaylist {
    pub levels: Vec<LevelParsed>,
    pub session_data: Option<BTreeMap<String, AttrList>>,
    pub session_keys: Option<Vec<LevelKey>>,
    pub content_steering: Option<ContentSteering>,
    pub start_time_offset: Option<f64>,
    pub variable_list: Vec<AttrList>,
    pub has_variable_refs: bool,
    pub playlist_parsing_error: Option<PlaylistParsingError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlternativeMediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

impl FromStr for AlternativeMediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<AlternativeMediaType, String> {
        match s {
            "AUDIO" => Ok(AlternativeMediaType::Audio),
            "VIDEO" => Ok(AlternativeMediaType::Video),
            "SUBTITLES" => Ok(AlternativeMediaType::Subtitles),
            "CLOSED-CAPTIONS" => Ok(AlternativeMediaType::ClosedCaptions),
            _ => Err(format!("Unable to create AlternativeMediaType from {:?}", s)),
        }
    }
}

impl fmt::Display for AlternativeMediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlternativeMediaType::Audio => write!(f, "AUDIO"),
            AlternativeMediaType::Video => write!(f, "VIDEO"),
            AlternativeMediaType::Subtitles => write!(f, "SUBTITLES"),
            AlternativeMediaType::ClosedCaptions => write!(f, "CLOSED-CAPTIONS"),
        }
    }
}

/// An alternate rendition announced by `#EXT-X-MEDIA`.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub attrs: AttrList,
    pub id: usize,
    pub media_type: AlternativeMediaType,
    pub group_id: String,
    pub name: String,
    pub lang: Option<String>,
    pub assoc_lang: Option<String>,
    pub channels: Option<String>,
    pub characteristics: Option<String>,
    pub instream_id: Option<String>,
    pub default: bool,
    pub autoselect: bool,
    pub forced: bool,
    pub url: String,
    pub audio_codec: Option<String>,
    pub text_codec: Option<String>,
}

/// Alternate renditions of a multivariant playlist, by type.
#[derive(Debug, Clone, Default)]
pub struct ParsedMultivariantMediaOptions {
    pub audio_tracks: Vec<MediaTrack>,
    pub subtitle_tracks: Vec<MediaTrack>,
    pub closed_captions: Vec<MediaTrack>,
    pub video_tracks: Vec<MediaTrack>,
}

impl ParsedMultivariantMediaOptions {
    pub fn tracks_mut(&mut self, media_type: AlternativeMediaType) -> &mut Vec<MediaTrack> {
        match media_type {
            AlternativeMediaType::Audio => &mut self.audio_tracks,
            AlternativeMediaType::Subtitles => &mut self.subtitle_tracks,
            AlternativeMediaType::ClosedCaptions => &mut self.closed_captions,
            AlternativeMediaType::Video => &mut self.video_tracks,
        }
    }
}

/// `#EXT-X-PLAYLIST-TYPE:<EVENT|VOD>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPlaylistType {
    Event,
    Vod,
    Other(String),
}

impl FromStr for MediaPlaylistType {
    type Err = String;

    fn from_str(s: &str) -> Result<MediaPlaylistType, String> {
        match s {
            "EVENT" => Ok(MediaPlaylistType::Event),
            "VOD" => Ok(MediaPlaylistType::Vod),
            "" => Err("Unable to create MediaPlaylistType from empty value".to_string()),
            other => Ok(MediaPlaylistType::Other(other.to_string())),
        }
    }
}

impl fmt::Display for MediaPlaylistType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MediaPlaylistType::Event => write!(f, "EVENT"),
            MediaPlaylistType::Vod => write!(f, "VOD"),
            MediaPlaylistType::Other(s) => write!(f, "{}", s),
        }
    }
}
