#![allow(unused_variables, unused_imports, dead_code)]

use m3u8_timeline::playlist::*;
use m3u8_timeline::*;
use std::fs;
use std::io::Read;
use std::path;

fn all_sample_m3u_playlists() -> Vec<path::PathBuf> {
    let path: std::path::PathBuf = ["sample-playlists"].iter().collect();
    fs::read_dir(path.to_str().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .map(|dir| dir.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "m3u8"))
        .collect()
}

fn getm3u(path: &str) -> String {
    let mut buf = String::new();
    let mut file = fs::File::open(path).unwrap_or_else(|_| panic!("Can't find m3u8: {}", path));
    file.read_to_string(&mut buf).expect("Can't read file");
    buf
}

fn get_sample_playlist(name: &str) -> String {
    let path: std::path::PathBuf = ["sample-playlists", name].iter().collect();
    getm3u(path.to_str().unwrap())
}

fn get_media_playlist(name: &str, base_url: &str) -> LevelDetails {
    let input = get_sample_playlist(name);
    parse_level_playlist(&input, base_url, 0, PlaylistLevelType::Main)
}

fn fragment(details: &LevelDetails, index: usize) -> &Fragment {
    details.fragments[index]
        .as_ref()
        .unwrap_or_else(|| panic!("fragment {} was skipped", index))
}

// -----------------------------------------------------------------------------------------------
// Playlist

fn print_parse_playlist_test(playlist_name: &str) -> bool {
    let input: String = get_sample_playlist(playlist_name);
    println!("Parsing playlist file: {:?}", playlist_name);
    let parsed = parse_playlist(&input, "https://example.com/hls/index.m3u8");

    match parsed.playlist_parsing_error() {
        None => {
            println!("{:?}", parsed);
            true
        }
        Some(e) => {
            println!("Parsing failed:\n {:?}", e);
            false
        }
    }
}

#[test]
fn playlist_multivariant() {
    assert!(print_parse_playlist_test("multivariant.m3u8"));
}

#[test]
fn playlist_multivariant_with_session_key() {
    assert!(print_parse_playlist_test("multivariant-with-session-key.m3u8"));
}

#[test]
fn playlist_multivariant_not_ending_in_newline() {
    assert!(print_parse_playlist_test(
        "multivariant-not-ending-in-newline.m3u8"
    ));
}

#[test]
fn playlist_multivariant_crlf() {
    assert!(print_parse_playlist_test("multivariant-crlf.m3u8"));
}

// -- Media playlists

#[test]
fn playlist_media_vod() {
    assert!(print_parse_playlist_test("media-vod.m3u8"));
}

#[test]
fn playlist_media_aes_128() {
    assert!(print_parse_playlist_test("media-aes-128.m3u8"));
}

#[test]
fn playlist_media_byterange() {
    assert!(print_parse_playlist_test("media-byterange.m3u8"));
}

#[test]
fn playlist_media_low_latency() {
    assert!(print_parse_playlist_test("media-low-latency.m3u8"));
}

#[test]
fn playlist_media_delta_update() {
    assert!(print_parse_playlist_test("media-delta-update.m3u8"));
}

#[test]
fn playlist_media_interstitials() {
    assert!(print_parse_playlist_test("media-interstitials.m3u8"));
}

#[test]
fn playlist_media_not_ending_in_newline() {
    assert!(print_parse_playlist_test("media-not-ending-in-newline.m3u8"));
}

#[test]
fn playlist_media_without_segments() {
    assert!(print_parse_playlist_test("media-without-segments.m3u8"));
}

#[test]
fn playlist_media_missing_extm3u() {
    assert!(!print_parse_playlist_test("media-missing-extm3u.m3u8"));
}

#[test]
fn playlist_types() {
    for path_buf in all_sample_m3u_playlists() {
        let path = path_buf.to_str().unwrap();
        let input = getm3u(path);
        let is_multivariant = is_multivariant_playlist(&input);

        println!("{:?} = {:?}", path, is_multivariant);

        assert!(path.to_lowercase().contains("multivariant") == is_multivariant);
    }
}

// -----------------------------------------------------------------------------------------------
// Multivariant playlists

#[test]
fn multivariant_levels_and_renditions() {
    let base = "https://example.com/hls/multivariant.m3u8";
    let input = get_sample_playlist("multivariant.m3u8");
    let parsed = parse_multivariant_playlist(&input, base);

    assert_eq!(parsed.levels.len(), 3);
    let low = &parsed.levels[0];
    assert_eq!(low.url, "https://example.com/hls/low/index.m3u8");
    assert_eq!(low.bitrate, 1_280_000);
    assert_eq!(low.width(), Some(640));
    assert_eq!(low.height(), Some(360));
    assert_eq!(low.frame_rate, Some(25.0));
    assert_eq!(low.audio_group.as_deref(), Some("aac"));
    assert_eq!(low.subtitle_group.as_deref(), Some("subs"));
    assert_eq!(parsed.levels[2].bitrate, 7_680_000);

    assert_eq!(
        parsed.content_steering,
        Some(ContentSteering {
            uri: "https://example.com/hls/steering.json".to_string(),
            pathway_id: "CDN-A".to_string(),
        })
    );
    let session_data = parsed.session_data.as_ref().unwrap();
    assert_eq!(
        session_data["com.example.title"].get("VALUE"),
        Some("Big Buck Bunny")
    );

    let media = parse_multivariant_media(&input, base, &parsed);
    assert_eq!(media.audio_tracks.len(), 2);
    assert_eq!(media.subtitle_tracks.len(), 1);
    let english = &media.audio_tracks[0];
    assert_eq!(english.name, "English");
    assert_eq!(english.lang.as_deref(), Some("en"));
    assert!(english.default);
    assert_eq!(english.url, "https://example.com/hls/audio/en.m3u8");
    assert!(!media.audio_tracks[1].default);
    assert_eq!(media.audio_tracks[1].id, 1);
}

#[test]
fn multivariant_session_key_and_start() {
    let input = get_sample_playlist("multivariant-with-session-key.m3u8");
    let parsed = parse_multivariant_playlist(&input, "https://example.com/index.m3u8");

    assert_eq!(parsed.levels.len(), 2);
    assert_eq!(parsed.levels[1].url, "https://cdn.example.com/1080p.m3u8");
    assert_eq!(parsed.start_time_offset, Some(-12.5));
    let session_keys = parsed.session_keys.as_ref().unwrap();
    assert_eq!(session_keys.len(), 1);
    assert_eq!(session_keys[0].uri, "skd://fairplay-key");
    assert_eq!(session_keys[0].key_format, "com.apple.streamingkeydelivery");
}

#[test]
fn multivariant_line_endings() {
    for name in [
        "multivariant-crlf.m3u8",
        "multivariant-not-ending-in-newline.m3u8",
    ] {
        let input = get_sample_playlist(name);
        let parsed = parse_multivariant_playlist(&input, "https://example.com/index.m3u8");
        let urls: Vec<&str> = parsed.levels.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            ["https://example.com/low.m3u8", "https://example.com/high.m3u8"],
            "{}",
            name
        );
    }
}

// -----------------------------------------------------------------------------------------------
// Media playlists

#[test]
fn vod_timeline() {
    let details = get_media_playlist("media-vod.m3u8", "https://example.com/vod/index.m3u8");

    assert!(details.playlist_parsing_error.is_none());
    assert_eq!(details.fragments.len(), 2);
    assert!(!details.live);
    assert_eq!(details.targetduration, 10.0);
    assert_eq!(details.version, Some(3));
    assert!((details.totalduration - 18.018).abs() < 1e-9);

    let first = fragment(&details, 0);
    assert_eq!(first.sn, FragmentSn::Media(0));
    assert_eq!(first.start(), 0.0);
    assert_eq!(first.url(), "https://example.com/vod/segment0.ts");

    let second = fragment(&details, 1);
    assert_eq!(second.sn, FragmentSn::Media(1));
    assert!((second.start() - 9.009).abs() < 1e-9);
    assert!(second.end_list);
    assert_eq!(details.start_sn, 0);
    assert_eq!(details.end_sn, 1);
}

#[test]
fn aes_128_key_applies_until_method_none() {
    let mut details = get_media_playlist("media-aes-128.m3u8", "");
    let registry = KeyIdRegistry::new();

    for index in 0..2 {
        let frag = details.fragments[index].as_mut().unwrap();
        assert!(frag.encrypted());
        match frag.decrypt_state(&registry) {
            DecryptState::Resolved(decryptdata) => {
                assert_eq!(decryptdata.uri, "key.bin");
                assert_eq!(decryptdata.key_format, "identity");
                assert_eq!(
                    decryptdata.iv.as_deref().map(|iv| iv[15]),
                    Some(index as u8)
                );
            }
            other => panic!("fragment {} not resolved: {:?}", index, other),
        }
    }

    let clear = details.fragments[2].as_mut().unwrap();
    assert!(!clear.encrypted());
    assert!(matches!(
        clear.decrypt_state(&registry),
        DecryptState::Unencrypted
    ));
    assert!(clear.decryptdata().is_none());
    // AES-128 keys are not common encryption key sets.
    assert!(details.encrypted_fragments.is_empty());
}

#[test]
fn decrypt_data_is_resolved_once() {
    let mut details = get_media_playlist("media-aes-128.m3u8", "https://example.com/");
    let registry = KeyIdRegistry::new();
    let frag = details.fragments[1].as_mut().unwrap();

    let first = match frag.decrypt_state(&registry) {
        DecryptState::Resolved(data) => data,
        other => panic!("not resolved: {:?}", other),
    };
    let second = match frag.decrypt_state(&registry) {
        DecryptState::Resolved(data) => data,
        other => panic!("not resolved: {:?}", other),
    };
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.uri, "https://example.com/key.bin");
}

#[test]
fn method_none_key_has_no_decrypt_data() {
    let none = level_key::LevelKey::from_attrs(
        &attributes::AttrList::parse("METHOD=NONE"),
        "https://example.com/",
    );
    assert!(!none.encrypted);
    assert!(none
        .get_decrypt_data(FragmentSn::Media(4), None, &KeyIdRegistry::new())
        .is_none());
}

#[test]
fn byte_ranges_continue_from_previous_segment() {
    let details = get_media_playlist("media-byterange.m3u8", "https://example.com/");

    let ranges: Vec<(u64, u64)> = details
        .fragments
        .iter()
        .flatten()
        .filter_map(|f| f.byte_range())
        .map(|r| (r.start, r.end))
        .collect();
    assert_eq!(ranges, [(0, 100), (100, 150), (400, 475)]);
    assert_eq!(fragment(&details, 1).byte_length(), Some(50));
    assert_eq!(fragment(&details, 2).url(), "https://example.com/media.ts");
}

#[test]
fn missing_extm3u() {
    let input = get_sample_playlist("media-missing-extm3u.m3u8");
    match parse_playlist(&input, "https://example.com/") {
        Playlist::MediaPlaylist(details) => {
            assert_eq!(
                details.playlist_parsing_error,
                Some(PlaylistParsingError::MissingExtM3u)
            );
            assert!(details.fragments.is_empty());
        }
        Playlist::MultivariantPlaylist(_) => panic!("detected as multivariant"),
    }
}

#[test]
fn missing_target_duration() {
    let details = parse_level_playlist(
        "#EXTM3U\n#EXTINF:4,\na.ts\n",
        "https://example.com/",
        0,
        PlaylistLevelType::Main,
    );
    assert_eq!(
        details.playlist_parsing_error,
        Some(PlaylistParsingError::MissingTargetDuration)
    );
    assert_eq!(details.fragments.len(), 1);
}

#[test]
fn media_sequence_after_segments() {
    let details = parse_level_playlist(
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\na.ts\n#EXT-X-MEDIA-SEQUENCE:3\n",
        "https://example.com/",
        0,
        PlaylistLevelType::Main,
    );
    assert!(matches!(
        details.playlist_parsing_error,
        Some(PlaylistParsingError::TagAfterSegments { .. })
    ));
}

#[test]
fn init_segments_and_discontinuities() {
    let details = get_media_playlist(
        "media-fmp4-discontinuity.m3u8",
        "https://example.com/live/index.m3u8",
    );

    assert!(details.live);
    assert_eq!(details.fragments.len(), 4);
    assert_eq!(details.start_sn, 100);
    assert_eq!(details.end_sn, 103);
    assert_eq!(details.start_cc, 3);
    assert_eq!(details.end_cc, 4);

    let first = fragment(&details, 0);
    let init = first.init_segment.as_ref().unwrap();
    assert_eq!(init.url(), "https://example.com/live/init-a.mp4");
    assert_eq!(init.sn, FragmentSn::InitSegment);
    assert_eq!(first.cc, 3);

    let after_discontinuity = fragment(&details, 2);
    assert_eq!(after_discontinuity.cc, 4);
    assert_eq!(
        after_discontinuity.init_segment.as_ref().map(|i| i.relurl()),
        Some("init-b.mp4")
    );
    assert!(fragment(&details, 3).gap);

    let pdt0 = first.program_date_time().unwrap();
    let pdt1 = fragment(&details, 1).program_date_time().unwrap();
    assert_eq!(pdt1 - pdt0, 4000.0);
    assert!(details.has_program_date_time());
}

#[test]
fn low_latency_parts() {
    let details = get_media_playlist(
        "media-low-latency.m3u8",
        "https://example.com/ll/index.m3u8",
    );

    assert!(details.playlist_parsing_error.is_none());
    assert_eq!(details.fragments.len(), 2);
    assert_eq!(details.start_sn, 266);
    assert_eq!(details.end_sn, 267);
    assert!(details.can_block_reload);
    assert_eq!(details.can_skip_until, 24.0);
    assert_eq!(details.part_hold_back, 3.0);
    assert_eq!(details.part_target, 1.0);
    assert_eq!(details.part_list.as_ref().map(Vec::len), Some(5));
    assert!(details.preload_hint.is_some());
    assert_eq!(details.rendition_reports.as_ref().map(Vec::len), Some(1));

    let hint = details.fragment_hint.as_ref().unwrap();
    assert_eq!(hint.sn, FragmentSn::Media(268));
    // The hinted fragment is not part of the playlist duration.
    assert_eq!(details.totalduration, 8.0);
}

#[test]
fn delta_update_durations() {
    let details = get_media_playlist(
        "media-delta-update.m3u8",
        "https://example.com/live/index.m3u8",
    );

    assert_eq!(details.skipped_segments, 3);
    assert_eq!(details.fragments.len(), 5);
    assert!(details.fragments[..3].iter().all(Option::is_none));
    assert_eq!(fragment(&details, 3).sn, FragmentSn::Media(103));
    assert_eq!(details.end_sn, 104);
    assert_eq!(
        details.recently_removed_dateranges,
        Some(vec!["ad-1".to_string(), "ad-2".to_string()])
    );

    let listed: f64 = details.fragments.iter().flatten().map(|f| f.duration()).sum();
    let skipped = details.skipped_segments as f64 * details.targetduration;
    assert_eq!(details.totalduration, listed + skipped);
    assert_eq!(details.totalduration, 19.5);
}

#[test]
fn total_duration_sums_segments() {
    for path_buf in all_sample_m3u_playlists() {
        let input = getm3u(path_buf.to_str().unwrap());
        if is_multivariant_playlist(&input) {
            continue;
        }
        let details = parse_level_playlist(&input, "https://example.com/", 0, PlaylistLevelType::Main);
        let listed: f64 = details.fragments.iter().flatten().map(|f| f.duration()).sum();
        let skipped = details.skipped_segments as f64 * details.targetduration;
        assert!(
            (details.totalduration - (listed + skipped)).abs() < 1e-9,
            "{:?}",
            path_buf
        );
    }
}

#[test]
fn not_ending_in_newline() {
    let details = get_media_playlist("media-not-ending-in-newline.m3u8", "https://example.com/");
    assert_eq!(details.fragments.len(), 1);
    assert_eq!(fragment(&details, 0).relurl(), "last.ts");
    assert_eq!(details.totalduration, 10.0);
}

#[test]
fn without_segments() {
    let details = get_media_playlist("media-without-segments.m3u8", "https://example.com/");
    assert!(details.fragments.is_empty());
    assert_eq!(details.end_sn, 0);
    assert_eq!(details.totalduration, 0.0);
}

// -----------------------------------------------------------------------------------------------
// Date ranges

fn playlist_with_date_range(attrs: &str) -> LevelDetails {
    let input = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
         #EXT-X-PROGRAM-DATE-TIME:2024-05-01T12:00:00.000Z\n\
         #EXTINF:6,\na.ts\n#EXT-X-DATERANGE:{}\n#EXTINF:6,\nb.ts\n",
        attrs
    );
    parse_level_playlist(&input, "https://example.com/", 0, PlaylistLevelType::Main)
}

#[test]
fn end_on_next_requires_class() {
    let details = playlist_with_date_range(
        "ID=\"splice\",START-DATE=\"2024-05-01T12:00:03.000Z\",END-ON-NEXT=YES",
    );
    assert!(details.date_ranges.is_empty());

    let details = playlist_with_date_range(
        "ID=\"splice\",CLASS=\"com.example.splice\",START-DATE=\"2024-05-01T12:00:03.000Z\",END-ON-NEXT=YES",
    );
    assert_eq!(details.date_ranges.len(), 1);
}

#[test]
fn date_range_start_time_follows_program_date_time() {
    let details = playlist_with_date_range(
        "ID=\"chapter\",START-DATE=\"2024-05-01T12:00:09.000Z\",DURATION=3.5",
    );
    let date_range = &details.date_ranges["chapter"];
    assert_eq!(date_range.start_time(), 9.0);
    assert_eq!(date_range.duration(), Some(3.5));
    assert!(!date_range.is_interstitial());
}

// -----------------------------------------------------------------------------------------------
// Interstitials

#[test]
fn interstitial_schedule() {
    let details = get_media_playlist(
        "media-interstitials.m3u8",
        "https://example.com/main/index.m3u8",
    );
    assert_eq!(details.date_ranges.len(), 3);

    let mut schedule = InterstitialEventMap::new();
    let removed = schedule.update(&details, true);
    assert!(removed.is_empty());
    assert_eq!(schedule.len(), 2);

    let ids: Vec<&str> = schedule.events().iter().map(|e| e.identifier()).collect();
    assert_eq!(ids, ["preroll", "midroll"]);

    let preroll = schedule.get("preroll").unwrap();
    assert!(preroll.cue().pre);
    assert_eq!(preroll.start_offset(), 0.0);
    assert!(preroll.restrictions.skip && preroll.restrictions.jump);
    assert!(!preroll.append_in_place());
    assert_eq!(
        preroll.asset_url(),
        Some("https://ads.example.com/preroll.m3u8")
    );

    let midroll = schedule.get("midroll").unwrap();
    assert_eq!(midroll.start_time(), 6.0);
    assert_eq!(midroll.duration(), 15.0);
    assert_eq!(midroll.resumption_offset(), 0.0);
    assert_eq!(midroll.resume_time(), 6.0);
    assert_eq!(midroll.asset_list_url(), Some("assets.json"));
}

#[test]
fn interstitials_removed_on_reload() {
    let base = "https://example.com/main/index.m3u8";
    let details = get_media_playlist("media-interstitials.m3u8", base);
    let mut schedule = InterstitialEventMap::new();
    schedule.update(&details, true);
    schedule.get_mut("midroll").unwrap().has_played = true;

    let without_preroll = get_sample_playlist("media-interstitials.m3u8")
        .lines()
        .filter(|l| !l.contains("ID=\"preroll\""))
        .collect::<Vec<_>>()
        .join("\n");
    let details = parse_level_playlist(&without_preroll, base, 0, PlaylistLevelType::Main);
    let removed = schedule.update(&details, true);

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].identifier(), "preroll");
    assert_eq!(schedule.len(), 1);
    assert!(schedule.get("midroll").unwrap().has_played);
}

// -----------------------------------------------------------------------------------------------
// Live reloads

#[test]
fn live_reload_without_changes_is_a_miss() {
    let input = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:4,\na.ts\n";
    let base = "https://example.com/live/index.m3u8";
    let previous = parse_level_playlist(input, base, 0, PlaylistLevelType::Main);
    let mut details = parse_level_playlist(input, base, 0, PlaylistLevelType::Main);
    details.reloaded(Some(&previous));

    assert!(details.live);
    assert!(!details.updated);
    assert!(!details.advanced);
    assert_eq!(details.misses, previous.misses + 1);
}
