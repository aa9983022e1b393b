use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{char, digit0, digit1, multispace0, space0};
use nom::combinator::{map, map_res, opt, recognize, rest};
use nom::sequence::{pair, preceded};
use nom::IResult;
use tracing::{debug, warn};

use crate::attributes::{AttrList, KeyMethod};
use crate::date_range::{DateRange, ATTR_ID};
use crate::error::PlaylistParsingError;
use crate::level_details::LevelDetails;
use crate::level_key::{LevelKey, LevelKeys};
use crate::playlist::*;
use crate::segment::{Fragment, FragmentSn, Part, PlaylistLevelType};
use crate::uri::resolve_url;

/// Tags that may appear at most once in a media playlist.
const SINGLETON_TAGS: [&str; 9] = [
    "PLAYLIST-TYPE",
    "MEDIA-SEQUENCE",
    "TARGETDURATION",
    "VERSION",
    "ENDLIST",
    "SERVER-CONTROL",
    "PART-INF",
    "SKIP",
    "DISCONTINUITY-SEQUENCE",
];

/// Parse an m3u8 playlist, letting the parser figure out whether it is a
/// multivariant or a media playlist.
///
/// # Examples
///
/// ```
/// use m3u8_timeline::Playlist;
///
/// let text = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:9.009,\nseg0.ts\n#EXT-X-ENDLIST\n";
///
/// match m3u8_timeline::parse_playlist(text, "https://example.com/live/index.m3u8") {
///     Playlist::MultivariantPlaylist(pl) => println!("Multivariant playlist:\n{:?}", pl),
///     Playlist::MediaPlaylist(pl) => println!("Media playlist:\n{:?}", pl),
/// }
/// ```
pub fn parse_playlist(input: &str, base_url: &str) -> Playlist {
    match is_multivariant_playlist(input) {
        true => Playlist::MultivariantPlaylist(parse_multivariant_playlist(input, base_url)),
        false => Playlist::MediaPlaylist(Box::new(parse_level_playlist(
            input,
            base_url,
            0,
            PlaylistLevelType::Main,
        ))),
    }
}

/// When a media tag or no multivariant tag is found, this returns false.
pub fn is_multivariant_playlist(input: &str) -> bool {
    contains_multivariant_tag(input).unwrap_or(false)
}

/// Scans input looking for either a multivariant or media `#EXT` tag.
///
/// Returns `Some(true/false)` for the first multivariant/media tag found,
/// `None` if no known tag occurs.
fn contains_multivariant_tag(input: &str) -> Option<bool> {
    if !has_m3u_tag(input) {
        return None;
    }
    input.lines().find_map(|line| match playlist_line(line.trim()) {
        Ok((_, Line::Extinf(..))) => Some(false),
        Ok((_, Line::Tag(name, _))) => match name {
            "STREAM-INF" | "I-FRAME-STREAM-INF" | "MEDIA" | "SESSION-KEY" | "SESSION-DATA" => {
                Some(true)
            }
            "TARGETDURATION" | "MEDIA-SEQUENCE" | "DISCONTINUITY-SEQUENCE" | "ENDLIST"
            | "PLAYLIST-TYPE" | "I-FRAMES-ONLY" | "BYTERANGE" | "DISCONTINUITY" | "KEY"
            | "MAP" | "PROGRAM-DATE-TIME" | "DATERANGE" | "PART" | "PART-INF"
            | "SERVER-CONTROL" | "SKIP" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

// -----------------------------------------------------------------------------------------------
// Line classification
// -----------------------------------------------------------------------------------------------

/// One non-blank playlist line.
#[derive(Debug, PartialEq)]
enum Line<'a> {
    /// `#EXTINF:<duration>[,<title>]`, the duration kept as written.
    Extinf(&'a str, Option<&'a str>),
    /// `#EXT-X-<name>[:<value>]`
    Tag(&'a str, &'a str),
    Comment(&'a str),
    Uri(&'a str),
}

fn playlist_line(i: &str) -> IResult<&str, Line<'_>> {
    alt((
        map(preceded(tag("#EXTINF:"), extinf), |(duration, title)| {
            Line::Extinf(duration, title)
        }),
        map(
            preceded(
                tag("#EXT-X-"),
                pair(is_not(":"), opt(preceded(char(':'), rest))),
            ),
            |(name, value): (&str, Option<&str>)| {
                Line::Tag(name.trim(), value.map(str::trim).unwrap_or_default())
            },
        ),
        map(preceded(char('#'), rest), Line::Comment),
        map(rest, |uri: &str| Line::Uri(uri.trim())),
    ))(i)
}

fn extinf(i: &str) -> IResult<&str, (&str, Option<&str>)> {
    pair(
        preceded(space0, recognize(pair(digit0, opt(pair(char('.'), digit1))))),
        map(opt(preceded(char(','), rest)), |title: Option<&str>| {
            title.map(str::trim).filter(|t| !t.is_empty())
        }),
    )(i)
}

fn m3u_tag(i: &str) -> IResult<&str, &str> {
    preceded(pair(opt(char('\u{feff}')), multispace0), tag("#EXTM3U"))(i)
}

fn has_m3u_tag(input: &str) -> bool {
    m3u_tag(input).is_ok()
}

fn number(i: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(i)
}

fn parse_number(value: &str) -> Option<u64> {
    number(value.trim()).ok().map(|(_, n)| n)
}

fn non_blank_lines(input: &str) -> impl Iterator<Item = &str> {
    input.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn has_variable_references(input: &str) -> bool {
    input.contains("{$")
}

fn parse_start_time_offset(value: &str) -> Option<f64> {
    let offset = AttrList::parse(value).decimal_floating_point("TIME-OFFSET");
    offset.is_finite().then_some(offset)
}

// -----------------------------------------------------------------------------------------------
// Multivariant Playlist
// -----------------------------------------------------------------------------------------------

/// Parse input as a multivariant playlist.
///
/// Structural problems are reported through
/// [`ParsedMultivariantPlaylist::playlist_parsing_error`].
pub fn parse_multivariant_playlist(input: &str, base_url: &str) -> ParsedMultivariantPlaylist {
    let mut parsed = ParsedMultivariantPlaylist {
        has_variable_refs: has_variable_references(input),
        ..ParsedMultivariantPlaylist::default()
    };
    if !has_m3u_tag(input) {
        parsed.playlist_parsing_error = Some(PlaylistParsingError::MissingExtM3u);
        return parsed;
    }

    let mut lines = non_blank_lines(input);
    while let Some(line) = lines.next() {
        let Ok((_, Line::Tag(name, value))) = playlist_line(line) else {
            continue;
        };
        match name {
            "STREAM-INF" => {
                let uri = lines.by_ref().find(|l| !l.starts_with('#'));
                let Some(uri) = uri else {
                    warn!("EXT-X-STREAM-INF without URI: \"{}\"", value);
                    break;
                };
                let level = LevelParsed::from_attrs(AttrList::parse(value), resolve_url(base_url, uri));
                parsed.levels.push(level);
            }
            "SESSION-DATA" => {
                let attrs = AttrList::parse(value);
                if let Some(data_id) = attrs.get("DATA-ID").map(String::from) {
                    parsed
                        .session_data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(data_id, attrs);
                }
            }
            "SESSION-KEY" => {
                let key = LevelKey::from_attrs(&AttrList::parse(value), base_url);
                if key.encrypted && key.is_supported() {
                    parsed.session_keys.get_or_insert_with(Vec::new).push(key);
                } else {
                    warn!("[Keys] Ignoring invalid EXT-X-SESSION-KEY tag: \"{}\"", value);
                }
            }
            "DEFINE" => parsed.variable_list.push(AttrList::parse(value)),
            "CONTENT-STEERING" => {
                let attrs = AttrList::parse(value);
                parsed.content_steering = Some(ContentSteering {
                    uri: resolve_url(base_url, attrs.get("SERVER-URI").unwrap_or_default()),
                    pathway_id: attrs.get("PATHWAY-ID").unwrap_or(".").to_string(),
                });
            }
            "START" => parsed.start_time_offset = parse_start_time_offset(value),
            _ => {}
        }
    }

    // Drop levels whose codecs are all unrecognised, unless that drops every level.
    let known = parsed
        .levels
        .iter()
        .filter(|l| !has_only_unknown_codecs(l))
        .count();
    if known > 0 && known < parsed.levels.len() {
        parsed.levels.retain(|l| !has_only_unknown_codecs(l));
    }
    if parsed.levels.is_empty() {
        parsed.playlist_parsing_error = Some(PlaylistParsingError::NoLevels);
    }
    parsed
}

fn has_only_unknown_codecs(level: &LevelParsed) -> bool {
    !level.codecs.has_known() && !level.codecs.unknown_codecs.is_empty()
}

/// Extracts the `EXT-X-MEDIA` renditions of a multivariant playlist.
///
/// Audio and subtitle renditions inherit the codec of the first level using
/// their `GROUP-ID`, or of the first level when no level references it.
pub fn parse_multivariant_media(
    input: &str,
    base_url: &str,
    parsed: &ParsedMultivariantPlaylist,
) -> ParsedMultivariantMediaOptions {
    let mut options = ParsedMultivariantMediaOptions::default();
    let mut id = 0;
    for line in non_blank_lines(input) {
        let Ok((_, Line::Tag("MEDIA", value))) = playlist_line(line) else {
            continue;
        };
        let attrs = AttrList::parse(value);
        let Some(media_type) = attrs.get("TYPE").and_then(|t| t.parse().ok()) else {
            continue;
        };
        let group_id = attrs.get("GROUP-ID").unwrap_or_default().to_string();
        let lang = attrs.get("LANGUAGE").map(String::from);
        let mut track = MediaTrack {
            id,
            media_type,
            name: attrs
                .get("NAME")
                .map(String::from)
                .or_else(|| lang.clone())
                .unwrap_or_default(),
            lang,
            assoc_lang: attrs.get("ASSOC-LANGUAGE").map(String::from),
            channels: attrs.get("CHANNELS").map(String::from),
            characteristics: attrs.get("CHARACTERISTICS").map(String::from),
            instream_id: attrs.get("INSTREAM-ID").map(String::from),
            default: attrs.bool("DEFAULT"),
            autoselect: attrs.bool("AUTOSELECT"),
            forced: attrs.bool("FORCED"),
            url: attrs
                .get("URI")
                .map(|uri| resolve_url(base_url, uri))
                .unwrap_or_default(),
            audio_codec: None,
            text_codec: None,
            group_id,
            attrs,
        };
        id += 1;

        match media_type {
            AlternativeMediaType::Audio => {
                let group = parsed
                    .levels
                    .iter()
                    .find(|l| l.audio_group.as_deref() == Some(track.group_id.as_str()))
                    .or(parsed.levels.first());
                track.audio_codec = group.and_then(|l| l.codecs.audio_codec.clone());
            }
            AlternativeMediaType::Subtitles => {
                let group = parsed
                    .levels
                    .iter()
                    .find(|l| l.subtitle_group.as_deref() == Some(track.group_id.as_str()))
                    .or(parsed.levels.first());
                track.text_codec = group.and_then(|l| l.codecs.text_codec.clone());
            }
            _ => {}
        }
        options.tracks_mut(media_type).push(track);
    }
    options
}

// -----------------------------------------------------------------------------------------------
// Media Playlist
// -----------------------------------------------------------------------------------------------

/// Parse input as the media playlist of level `level_id`.
///
/// Structural problems are reported through
/// [`LevelDetails::playlist_parsing_error`]; invalid tags are logged and
/// skipped.
pub fn parse_level_playlist(
    input: &str,
    base_url: &str,
    level_id: usize,
    playlist_type: PlaylistLevelType,
) -> LevelDetails {
    let mut level = LevelDetails::new(base_url);
    level.m3u8 = input.to_string();
    level.has_variable_refs = has_variable_references(input);
    if !has_m3u_tag(input) {
        level.playlist_parsing_error = Some(PlaylistParsingError::MissingExtM3u);
        return level;
    }

    let mut builder = LevelBuilder::new(&mut level, base_url, level_id, playlist_type);
    for line in non_blank_lines(input) {
        builder.line(line);
    }
    builder.finish();
    level
}

/// Line by line state of a media playlist being parsed.
struct LevelBuilder<'a> {
    level: &'a mut LevelDetails,
    base_url: &'a str,
    level_id: usize,
    playlist_type: PlaylistLevelType,
    frag: Fragment,
    /// Index of the last committed fragment.
    prev_frag: Option<usize>,
    /// Indices of fragments carrying their own `PROGRAM-DATE-TIME`.
    program_date_times: Vec<usize>,
    first_pdt_index: Option<usize>,
    current_init: Option<Arc<Fragment>>,
    init_program_date_time: Option<String>,
    next_byte_range: Option<String>,
    levelkeys: Option<Arc<LevelKeys>>,
    current_sn: u64,
    current_part: usize,
    discontinuity_counter: u64,
    current_bitrate: Option<f64>,
    total_duration: f64,
    create_next_frag: bool,
    seen_tags: HashSet<String>,
}

impl<'a> LevelBuilder<'a> {
    fn new(
        level: &'a mut LevelDetails,
        base_url: &'a str,
        level_id: usize,
        playlist_type: PlaylistLevelType,
    ) -> Self {
        LevelBuilder {
            level,
            base_url,
            level_id,
            playlist_type,
            frag: Fragment::new(playlist_type, base_url),
            prev_frag: None,
            program_date_times: Vec::new(),
            first_pdt_index: None,
            current_init: None,
            init_program_date_time: None,
            next_byte_range: None,
            levelkeys: None,
            current_sn: 0,
            current_part: 0,
            discontinuity_counter: 0,
            current_bitrate: None,
            total_duration: 0.0,
            create_next_frag: false,
            seen_tags: HashSet::new(),
        }
    }

    fn line(&mut self, line: &str) {
        if self.create_next_frag {
            self.create_next_frag = false;
            self.next_frag();
        }
        match playlist_line(line) {
            Ok((_, Line::Extinf(duration, title))) => {
                match duration.parse::<f64>() {
                    Ok(duration) => self.frag.set_duration(duration),
                    Err(_) => warn!("Invalid EXTINF duration: \"{}\"", line),
                }
                self.frag.title = title.map(String::from);
                let mut tag = vec!["INF".to_string(), duration.to_string()];
                tag.extend(title.map(String::from));
                self.frag.tag_list.push(tag);
            }
            Ok((_, Line::Uri(uri))) => self.commit_fragment(uri),
            Ok((_, Line::Tag(name, value))) => self.tag(name, value, line),
            Ok((_, Line::Comment(_))) => {}
            Err(_) => debug!("line not parsed: {}", line),
        }
    }

    /// Starts the fragment following the one just committed.
    fn next_frag(&mut self) {
        let mut frag = Fragment::new(self.playlist_type, self.base_url);
        frag.playlist_offset = self.total_duration;
        frag.set_start(self.total_duration);
        frag.sn = FragmentSn::Media(self.current_sn);
        frag.cc = self.discontinuity_counter;
        frag.level = self.level_id;
        if let Some(bitrate) = self.current_bitrate {
            frag.set_bitrate(bitrate);
        }
        if let Some(init) = &self.current_init {
            frag.init_segment = Some(init.clone());
            if let Some(raw) = self.init_program_date_time.take() {
                frag.set_raw_program_date_time(Some(raw));
            }
            if let Some(range) = self.next_byte_range.take() {
                frag.set_byte_range(&range, None);
            }
        }
        self.frag = frag;
    }

    fn commit_fragment(&mut self, uri: &str) {
        if !self.frag.duration().is_finite() {
            return;
        }
        let index = self.level.fragments.len();
        let mut frag = std::mem::replace(
            &mut self.frag,
            Fragment::new(self.playlist_type, self.base_url),
        );
        frag.playlist_offset = self.total_duration;
        frag.set_start(self.total_duration);
        if let Some(levelkeys) = self.levelkeys.clone() {
            self.set_frag_level_keys(&mut frag, levelkeys, index);
        }
        frag.sn = FragmentSn::Media(self.current_sn);
        frag.level = self.level_id;
        frag.cc = self.discontinuity_counter;
        frag.set_relurl(uri);
        self.assign_program_date_time(&mut frag, index);
        self.anchor_parts(&frag);

        self.total_duration += frag.duration();
        self.level.fragments.push(Some(frag));
        self.prev_frag = Some(index);
        self.current_sn += 1;
        self.current_part = 0;
        self.create_next_frag = true;
    }

    fn set_frag_level_keys(&mut self, frag: &mut Fragment, levelkeys: Arc<LevelKeys>, index: usize) {
        let is_new_key_set = match self.level.encrypted_fragments.last() {
            Some(last) => !self.level.fragments[*last]
                .as_ref()
                .and_then(|f| f.levelkeys.as_ref())
                .is_some_and(|keys| Arc::ptr_eq(keys, &levelkeys)),
            None => true,
        };
        if is_new_key_set && levelkeys.values().any(|k| k.is_common_encryption) {
            self.level.encrypted_fragments.push(index);
        }
        frag.levelkeys = Some(levelkeys);
    }

    fn previous_fragment(&self) -> Option<&Fragment> {
        self.prev_frag
            .and_then(|i| self.level.fragments.get(i))
            .and_then(Option::as_ref)
    }

    fn assign_program_date_time(&mut self, frag: &mut Fragment, index: usize) {
        if frag.raw_program_date_time.is_some() {
            self.program_date_times.push(index);
            return;
        }
        let previous = self.previous_fragment();
        if previous.and_then(Fragment::program_date_time).is_some() {
            let end = previous.and_then(Fragment::end_program_date_time);
            frag.set_program_date_time(end);
        }
    }

    /// Parts seen since the last fragment belong to `frag`.
    fn anchor_parts(&mut self, frag: &Fragment) {
        if self.current_part == 0 {
            return;
        }
        if let Some(parts) = self.level.part_list.as_mut() {
            let first = parts.len().saturating_sub(self.current_part);
            for part in &mut parts[first..] {
                part.set_fragment(frag);
            }
        }
    }

    fn check_singleton(&mut self, name: &str, line: &str) -> bool {
        if !SINGLETON_TAGS.contains(&name) {
            return true;
        }
        if self.seen_tags.insert(name.to_string()) {
            return true;
        }
        self.level.playlist_parsing_error = Some(PlaylistParsingError::MultipleTagOccurrence {
            tag: name.to_string(),
            line: line.to_string(),
        });
        false
    }

    fn check_before_segments(&mut self, name: &str, line: &str) {
        if !self.level.fragments.is_empty() {
            self.level.playlist_parsing_error = Some(PlaylistParsingError::TagAfterSegments {
                tag: name.to_string(),
                line: line.to_string(),
            });
        }
    }

    fn tag(&mut self, name: &str, value: &str, line: &str) {
        let first_occurrence = self.check_singleton(name, line);
        match name {
            "BYTERANGE" => {
                let fragments = &self.level.fragments;
                let previous = self
                    .prev_frag
                    .and_then(|i| fragments.get(i))
                    .and_then(Option::as_ref)
                    .map(|f| &**f);
                self.frag.set_byte_range(value, previous);
            }
            "PROGRAM-DATE-TIME" => {
                self.frag.set_raw_program_date_time(Some(value.to_string()));
                self.frag
                    .tag_list
                    .push(vec!["PROGRAM-DATE-TIME".to_string(), value.to_string()]);
                if self.first_pdt_index.is_none() {
                    self.first_pdt_index = Some(self.level.fragments.len());
                }
            }
            "PLAYLIST-TYPE" => {
                self.level.playlist_type = value.to_uppercase().parse().ok();
            }
            "MEDIA-SEQUENCE" => {
                if first_occurrence {
                    self.check_before_segments(name, line);
                }
                let sn = parse_number(value).unwrap_or(0);
                self.level.start_sn = sn;
                self.current_sn = sn;
            }
            "SKIP" => {
                let attrs = AttrList::parse(value);
                if let Some(skipped) = attrs.decimal_integer("SKIPPED-SEGMENTS") {
                    self.level.skipped_segments += skipped;
                    self.level
                        .fragments
                        .extend(std::iter::repeat_with(|| None).take(skipped as usize));
                    self.current_sn += skipped;
                }
                if let Some(removed) = attrs.enumerated_string("RECENTLY-REMOVED-DATERANGES") {
                    self.level
                        .recently_removed_dateranges
                        .get_or_insert_with(Vec::new)
                        .extend(removed.split('\t').map(String::from));
                }
            }
            "TARGETDURATION" => {
                self.level.targetduration = parse_number(value)
                    .map(|d| d.max(1) as f64)
                    .unwrap_or(0.0);
            }
            "VERSION" => self.level.version = parse_number(value),
            "INDEPENDENT-SEGMENTS" => {}
            "ENDLIST" => self.level.live = false,
            "DISCONTINUITY" => {
                self.discontinuity_counter += 1;
                self.frag.tag_list.push(vec!["DIS".to_string()]);
            }
            "GAP" => {
                self.frag.gap = true;
                self.frag.tag_list.push(vec![name.to_string()]);
            }
            "BITRATE" => {
                self.frag
                    .tag_list
                    .push(vec![name.to_string(), value.to_string()]);
                self.current_bitrate = parse_number(value).map(|kbps| kbps as f64 * 1000.0);
                if let Some(bitrate) = self.current_bitrate {
                    self.frag.set_bitrate(bitrate);
                }
            }
            "DATERANGE" => self.date_range(value),
            "DEFINE" => self.level.variable_list.push(AttrList::parse(value)),
            "DISCONTINUITY-SEQUENCE" => {
                if first_occurrence {
                    self.check_before_segments(name, line);
                }
                let cc = parse_number(value).unwrap_or(0);
                self.level.start_cc = cc;
                self.discontinuity_counter = cc;
            }
            "KEY" => self.key(value),
            "START" => self.level.start_time_offset = parse_start_time_offset(value),
            "MAP" => self.map(value),
            "SERVER-CONTROL" => {
                let attrs = AttrList::parse(value);
                self.level.can_block_reload = attrs.bool("CAN-BLOCK-RELOAD");
                self.level.can_skip_until = attrs.optional_float("CAN-SKIP-UNTIL", 0.0);
                self.level.can_skip_date_ranges =
                    self.level.can_skip_until > 0.0 && attrs.bool("CAN-SKIP-DATERANGES");
                self.level.part_hold_back = attrs.optional_float("PART-HOLD-BACK", 0.0);
                self.level.hold_back = attrs.optional_float("HOLD-BACK", 0.0);
            }
            "PART-INF" => {
                self.level.part_target =
                    AttrList::parse(value).decimal_floating_point("PART-TARGET");
            }
            "PART" => self.part(value),
            "PRELOAD-HINT" => self.level.preload_hint = Some(AttrList::parse(value)),
            "RENDITION-REPORT" => self
                .level
                .rendition_reports
                .get_or_insert_with(Vec::new)
                .push(AttrList::parse(value)),
            _ => {
                debug!("line parsed but not handled: {}", line);
                let mut tag = vec![name.to_string()];
                if !value.is_empty() {
                    tag.push(value.to_string());
                }
                self.frag.tag_list.push(tag);
            }
        }
    }

    fn date_range(&mut self, value: &str) {
        let attrs = AttrList::parse(value);
        let same_id = attrs
            .get(ATTR_ID)
            .and_then(|id| self.level.date_ranges.get(id));
        let date_range = DateRange::new(attrs, same_id, self.level.date_range_tag_count);
        self.level.date_range_tag_count += 1;
        if date_range.is_valid() || self.level.skipped_segments > 0 {
            let id = date_range.id().to_string();
            self.level.date_ranges.insert(id, date_range);
        } else {
            warn!("Ignoring invalid DATERANGE tag: \"{}\"", value);
        }
        self.frag
            .tag_list
            .push(vec!["EXT-X-DATERANGE".to_string(), value.to_string()]);
    }

    fn key(&mut self, value: &str) {
        let key = LevelKey::from_attrs(&AttrList::parse(value), self.base_url);
        if !key.is_supported() {
            warn!("[Keys] Ignoring invalid EXT-X-KEY tag: \"{}\"", value);
            return;
        }
        if key.method == KeyMethod::None {
            self.levelkeys = None;
            return;
        }
        let levelkeys = self.levelkeys.get_or_insert_with(Default::default);
        let unchanged = levelkeys
            .get(&key.key_format)
            .is_some_and(|existing| existing.matches(&key));
        if !unchanged {
            // Fragments already committed keep the map they were given.
            Arc::make_mut(levelkeys).insert(key.key_format.clone(), Arc::new(key));
        }
    }

    fn init_segment(&self, init: &mut Fragment, attrs: &AttrList) {
        init.set_relurl(attrs.get("URI").unwrap_or_default());
        if let Some(range) = attrs.get("BYTERANGE") {
            init.set_byte_range(range, None);
        }
        init.level = self.level_id;
        init.sn = FragmentSn::InitSegment;
        if let Some(levelkeys) = &self.levelkeys {
            init.levelkeys = Some(levelkeys.clone());
        }
        init.init_segment = None;
        init.cc = self.discontinuity_counter;
    }

    fn map(&mut self, value: &str) {
        let attrs = AttrList::parse(value);
        let duration = self.frag.duration();
        if duration != 0.0 && !duration.is_nan() {
            // MAP after EXTINF: the init segment is a new fragment.
            let mut init = Fragment::new(self.playlist_type, self.base_url);
            self.init_segment(&mut init, &attrs);
            let init = Arc::new(init);
            self.frag.init_segment = Some(init.clone());
            self.current_init = Some(init);
        } else {
            // MAP before EXTINF: the fragment in progress becomes the init segment.
            self.next_byte_range = self
                .frag
                .byte_range()
                .filter(|r| r.end > 0)
                .map(|r| format!("{}@{}", r.len(), r.start));
            let mut init = std::mem::replace(
                &mut self.frag,
                Fragment::new(self.playlist_type, self.base_url),
            );
            self.init_program_date_time = init.raw_program_date_time.take();
            init.set_raw_program_date_time(None);
            self.init_segment(&mut init, &attrs);
            self.current_init = Some(Arc::new(init));
            self.create_next_frag = true;
        }
    }

    fn part(&mut self, value: &str) {
        let attrs = AttrList::parse(value);
        let parts = self.level.part_list.get_or_insert_with(Vec::new);
        let previous = if self.current_part > 0 {
            parts.last()
        } else {
            None
        };
        let part = Part::new(&attrs, &self.frag, self.base_url, self.current_part, previous);
        self.current_part += 1;
        self.frag.set_duration(self.frag.duration() + part.duration);
        parts.push(part);
    }

    fn finish(mut self) {
        if self.level.part_list.is_some() && !self.create_next_frag {
            let mut hint = std::mem::replace(
                &mut self.frag,
                Fragment::new(self.playlist_type, self.base_url),
            );
            hint.sn = FragmentSn::Media(self.current_sn);
            hint.level = self.level_id;
            hint.cc = self.discontinuity_counter;
            hint.playlist_offset = self.total_duration;
            hint.set_start(self.total_duration);
            if hint.raw_program_date_time.is_none() {
                let previous = self.previous_fragment();
                if previous.and_then(Fragment::program_date_time).is_some() {
                    let end = previous.and_then(Fragment::end_program_date_time);
                    hint.set_program_date_time(end);
                }
            }
            if hint.init_segment.is_none() {
                hint.init_segment = self.current_init.clone();
            }
            self.anchor_parts(&hint);
            self.level.fragment_hint = Some(hint);
        }

        let level = &mut *self.level;
        if level.targetduration <= 0.0 {
            level.playlist_parsing_error = Some(PlaylistParsingError::MissingTargetDuration);
        }

        let fragment_count = level.fragments.len();
        self.total_duration += level.skipped_segments as f64 * level.targetduration;
        let live = level.live;
        let last = level.fragments.last_mut().and_then(Option::as_mut);
        match last {
            Some(last) if self.total_duration > 0.0 => {
                level.end_sn = last.sn.media().unwrap_or(0);
                if !live {
                    last.end_list = true;
                }
                level.averagetargetduration = Some(self.total_duration / fragment_count as f64);
            }
            _ => level.end_sn = 0,
        }
        if let Some(first) = level.fragments.first().and_then(Option::as_ref) {
            level.start_cc = first.cc;
        }
        level.totalduration = self.total_duration;
        level.end_cc = self.discontinuity_counter;

        if let Some(first_pdt_index) = self.first_pdt_index.filter(|i| *i > 0) {
            backfill_program_date_times(&mut level.fragments, first_pdt_index);
        }
        if !self.program_date_times.is_empty() && level.date_range_tag_count > 0 {
            map_date_ranges(level, &self.program_date_times);
        }
    }
}

/// Derives program date times of the fragments preceding the first one
/// that carries its own.
fn backfill_program_date_times(fragments: &mut [Option<Fragment>], first_pdt_index: usize) {
    let Some(mut next_pdt) = fragments
        .get(first_pdt_index)
        .and_then(Option::as_ref)
        .and_then(Fragment::program_date_time)
    else {
        return;
    };
    let end = first_pdt_index.min(fragments.len());
    for frag in fragments[..end].iter_mut().rev() {
        let Some(frag) = frag else {
            return;
        };
        next_pdt -= frag.duration() * 1000.0;
        frag.set_program_date_time(Some(next_pdt));
    }
}

/// Anchors every date range to the fragment its start date falls in,
/// falling back to the last fragment with a program date time.
fn map_date_ranges(level: &mut LevelDetails, program_date_times: &[usize]) {
    let Some(&last_pdt) = program_date_times.last() else {
        return;
    };
    let playlist_end = if level.live {
        f64::INFINITY
    } else {
        level.totalduration
    };
    let fragments = &level.fragments;
    let fallback = fragments
        .get(last_pdt)
        .and_then(Option::as_ref)
        .and_then(Fragment::media_ref);
    for date_range in level.date_ranges.values_mut() {
        let start_date = date_range.start_date();
        let anchor = (0..program_date_times.len())
            .rev()
            .find_map(|j| {
                find_fragment_with_start_date(
                    fragments,
                    start_date,
                    program_date_times,
                    j,
                    playlist_end,
                )
            })
            .and_then(|i| fragments.get(i))
            .and_then(Option::as_ref)
            .and_then(Fragment::media_ref);
        date_range.tag_anchor = anchor.or_else(|| fallback.clone());
    }
}

fn find_fragment_with_start_date(
    fragments: &[Option<Fragment>],
    start_date: f64,
    program_date_times: &[usize],
    index: usize,
    end_time: f64,
) -> Option<usize> {
    let pdt_index = *program_date_times.get(index)?;
    let pdt_frag = fragments.get(pdt_index)?.as_ref()?;
    let pdt_start = pdt_frag.program_date_time()?;
    if !(start_date >= pdt_start || index == 0) {
        return None;
    }
    let next_pdt = program_date_times.get(index + 1).copied();
    let next_start = next_pdt
        .and_then(|i| fragments.get(i))
        .and_then(Option::as_ref)
        .map(Fragment::start)
        .unwrap_or(end_time);
    let duration_between_pdt = next_start - pdt_frag.start();
    if !(start_date <= pdt_start + duration_between_pdt * 1000.0) {
        return None;
    }
    if fragments.len() > program_date_times.len() {
        let end_index = next_pdt.unwrap_or(fragments.len().saturating_sub(1));
        for i in ((pdt_index + 1)..=end_index).rev() {
            let Some(frag) = fragments.get(i).and_then(Option::as_ref) else {
                continue;
            };
            if let (Some(start), Some(end)) = (frag.program_date_time(), frag.end_program_date_time()) {
                if start_date >= start && start_date < end {
                    return Some(i);
                }
            }
        }
    }
    Some(pdt_index)
}
