//! A library to parse m3u8 playlists (HTTP Live Streaming) [link]
//! (https://tools.ietf.org/html/rfc8216) into a segment timeline, track live
//! playlist updates, and acquire the keys needed to decrypt segments.
//!
//! # Examples
//!
//! Parsing a playlist and let the parser figure out if it's a media or
//! multivariant playlist.
//!
//! ```
//! use m3u8_timeline::Playlist;
//!
//! let text = "#EXTM3U
//! #EXT-X-TARGETDURATION:10
//! #EXT-X-VERSION:3
//! #EXTINF:9.009,
//! seg0.ts
//! #EXTINF:9.009,
//! seg1.ts
//! #EXT-X-ENDLIST
//! ";
//!
//! match m3u8_timeline::parse_playlist(text, "https://example.com/vod/index.m3u8") {
//!     Playlist::MultivariantPlaylist(pl) => println!("Multivariant playlist:\n{:?}", pl),
//!     Playlist::MediaPlaylist(details) => {
//!         assert_eq!(details.fragments.len(), 2);
//!         assert!(!details.live);
//!     }
//! }
//! ```
//!
//! Parsing a media playlist directly and following a live reload
//!
//! ```
//! use m3u8_timeline::{parse_level_playlist, PlaylistLevelType};
//!
//! let first = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:10\n\
//!              #EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n";
//! let second = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:11\n\
//!               #EXTINF:4,\nb.ts\n#EXTINF:4,\nc.ts\n";
//!
//! let base = "https://example.com/live/index.m3u8";
//! let previous = parse_level_playlist(first, base, 0, PlaylistLevelType::Main);
//! let mut details = parse_level_playlist(second, base, 0, PlaylistLevelType::Main);
//! details.reloaded(Some(&previous));
//!
//! assert!(details.live);
//! assert!(details.updated);
//! assert!(details.advanced);
//! assert_eq!(details.misses, 0);
//! ```

pub mod attributes;
pub mod codecs;
pub mod config;
pub mod date_range;
pub mod error;
pub mod events;
pub mod interstitial;
pub mod key_loader;
pub mod level_details;
pub mod level_key;
pub mod loader;
pub mod parser;
pub mod playlist;
pub mod pssh;
pub mod segment;
pub mod uri;

pub use config::HlsConfig;
pub use date_range::DateRange;
pub use error::{AssetListError, ErrorDetails, ErrorType, KeyLoadError, PlaylistParsingError};
pub use events::{EventBus, HlsEvent};
pub use interstitial::{AssetListLoader, InterstitialEvent, InterstitialEventMap};
pub use key_loader::{EmeController, KeyLoader};
pub use level_details::LevelDetails;
pub use level_key::{KeyIdRegistry, LevelKey};
pub use loader::{Loader, LoaderFactory};
pub use parser::{
    is_multivariant_playlist, parse_level_playlist, parse_multivariant_media,
    parse_multivariant_playlist, parse_playlist,
};
pub use playlist::Playlist;
pub use segment::{DecryptState, Fragment, FragmentSn, Part, PlaylistLevelType};
