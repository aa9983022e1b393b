//! URL helpers: resolving playlist-relative URIs and decoding `data:` URIs.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use url::Url;

/// Resolves `relative` against `base`.
///
/// Absolute inputs are returned normalized. When `base` is not an absolute URL
/// the relative reference is returned unchanged.
pub fn resolve_url(base: &str, relative: &str) -> String {
    if let Ok(absolute) = Url::parse(relative) {
        return absolute.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(relative)) {
        Ok(joined) => joined.to_string(),
        Err(_) => relative.to_string(),
    }
}

pub fn is_data_uri(uri: &str) -> bool {
    uri.starts_with("data:")
}

/// Decodes the payload of a `data:[<mediatype>][;base64],<data>` URI.
///
/// Returns `None` for anything that is not a well formed data URI.
pub fn data_uri_bytes(uri: &str) -> Option<Vec<u8>> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    if data.contains(',') {
        return None;
    }
    if meta.rsplit(';').next() == Some("base64") {
        base64_decode(data)
    } else {
        Some(data.as_bytes().to_vec())
    }
}

/// Accepts standard and url-safe alphabets, with or without padding.
pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    let data = data.trim();
    STANDARD
        .decode(data)
        .or_else(|_| STANDARD_NO_PAD.decode(data))
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative() {
        assert_eq!(
            resolve_url("https://cdn.example.com/live/index.m3u8", "seg0.ts"),
            "https://cdn.example.com/live/seg0.ts"
        );
        assert_eq!(
            resolve_url("https://cdn.example.com/live/index.m3u8", "../keys/k.bin"),
            "https://cdn.example.com/keys/k.bin"
        );
    }

    #[test]
    fn keeps_relative_without_absolute_base() {
        assert_eq!(resolve_url("", "key.bin"), "key.bin");
        assert_eq!(resolve_url("playlist.m3u8", "key.bin"), "key.bin");
    }

    #[test]
    fn absolute_passthrough() {
        assert_eq!(
            resolve_url("https://a.example/x.m3u8", "https://b.example/k"),
            "https://b.example/k"
        );
    }

    #[test]
    fn decodes_data_uris() {
        assert_eq!(
            data_uri_bytes("data:text/plain;base64,AAECAw=="),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(data_uri_bytes("data:,abc"), Some(b"abc".to_vec()));
        assert_eq!(data_uri_bytes("skd://key"), None);
    }
}
