//! `EXT-X-KEY` / `EXT-X-SESSION-KEY` model and per-segment decrypt data.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::attributes::{AttrList, KeyMethod};
use crate::pssh::{mp4_pssh, parse_multi_pssh, parse_play_ready_wrm, PLAYREADY_SYSTEM_ID};
use crate::segment::FragmentSn;
use crate::uri::{data_uri_bytes, resolve_url};

/// `KEYFORMAT` values understood by DRM key systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySystemFormat {
    FairPlay,
    PlayReady,
    Widevine,
    ClearKey,
}

impl KeySystemFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySystemFormat::FairPlay => "com.apple.streamingkeydelivery",
            KeySystemFormat::PlayReady => "com.microsoft.playready",
            KeySystemFormat::Widevine => "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed",
            KeySystemFormat::ClearKey => "org.w3.clearkey",
        }
    }

    pub fn key_system(&self) -> KeySystem {
        match self {
            KeySystemFormat::FairPlay => KeySystem::FairPlay,
            KeySystemFormat::PlayReady => KeySystem::PlayReady,
            KeySystemFormat::Widevine => KeySystem::Widevine,
            KeySystemFormat::ClearKey => KeySystem::ClearKey,
        }
    }
}

impl FromStr for KeySystemFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "com.apple.streamingkeydelivery" => Ok(KeySystemFormat::FairPlay),
            "com.microsoft.playready" => Ok(KeySystemFormat::PlayReady),
            "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed" => Ok(KeySystemFormat::Widevine),
            "org.w3.clearkey" => Ok(KeySystemFormat::ClearKey),
            _ => Err(format!("Unknown key system format: {}", s)),
        }
    }
}

impl fmt::Display for KeySystemFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// EME key system identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySystem {
    #[serde(rename = "com.apple.fps")]
    FairPlay,
    #[serde(rename = "com.microsoft.playready")]
    PlayReady,
    #[serde(rename = "com.widevine.alpha")]
    Widevine,
    #[serde(rename = "org.w3.clearkey")]
    ClearKey,
}

impl KeySystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySystem::FairPlay => "com.apple.fps",
            KeySystem::PlayReady => "com.microsoft.playready",
            KeySystem::Widevine => "com.widevine.alpha",
            KeySystem::ClearKey => "org.w3.clearkey",
        }
    }

    pub fn key_system_format(&self) -> KeySystemFormat {
        match self {
            KeySystem::FairPlay => KeySystemFormat::FairPlay,
            KeySystem::PlayReady => KeySystemFormat::PlayReady,
            KeySystem::Widevine => KeySystemFormat::Widevine,
            KeySystem::ClearKey => KeySystemFormat::ClearKey,
        }
    }
}

/// Keys active for a segment, by `KEYFORMAT`.
///
/// Shared between consecutive fragments; a diverging key tag produces a new
/// map instead of mutating the shared one.
pub type LevelKeys = BTreeMap<String, Arc<LevelKey>>;

/// Process scoped association of key URIs with key ids.
///
/// Owned by the key loader of a playback session and cleared when the session
/// ends.
#[derive(Debug, Default)]
pub struct KeyIdRegistry {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyIdRegistry {
    pub fn new() -> Self {
        KeyIdRegistry::default()
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.map.lock().get(uri).cloned()
    }

    pub fn set_key_id_for_uri(&self, uri: &str, key_id: Vec<u8>) {
        self.map.lock().insert(uri.to_string(), key_id);
    }

    /// Generates a placeholder key id for `uri` from the registry size.
    pub fn add_key_id_for_uri(&self, uri: &str) -> Vec<u8> {
        let mut map = self.map.lock();
        let key_id = generated_key_id(map.len());
        map.insert(uri.to_string(), key_id.clone());
        key_id
    }

    fn get_or_generate(&self, uri: &str) -> Vec<u8> {
        let mut map = self.map.lock();
        if let Some(existing) = map.get(uri) {
            return existing.clone();
        }
        let key_id = generated_key_id(map.len());
        map.insert(uri.to_string(), key_id.clone());
        key_id
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

fn generated_key_id(index: usize) -> Vec<u8> {
    let mut key_id = vec![0u8; 16];
    key_id[12..16].copy_from_slice(&(index as u32).to_be_bytes());
    key_id
}

/// AES-128 IV for a media sequence number: the low 32 bits, big endian, in the
/// last four bytes.
pub fn create_initialization_vector(sn: u64) -> Vec<u8> {
    let mut iv = vec![0u8; 16];
    iv[12..16].copy_from_slice(&(sn as u32).to_be_bytes());
    iv
}

#[derive(Debug, Clone)]
pub struct LevelKey {
    pub method: KeyMethod,
    pub uri: String,
    pub key_format: String,
    pub key_format_versions: Vec<u32>,
    pub encrypted: bool,
    pub is_common_encryption: bool,
    pub iv: Option<Vec<u8>>,
    pub key_id: Option<Vec<u8>>,
    pub pssh: Option<Vec<u8>>,
    key: OnceLock<Vec<u8>>,
}

impl LevelKey {
    pub fn new(
        method: KeyMethod,
        uri: impl Into<String>,
        key_format: impl Into<String>,
        key_format_versions: Vec<u32>,
        iv: Option<Vec<u8>>,
        key_id: Option<Vec<u8>>,
    ) -> Self {
        let encrypted = method != KeyMethod::None;
        let is_common_encryption = encrypted && !method.is_full_segment_encryption();
        LevelKey {
            method,
            uri: uri.into(),
            key_format: key_format.into(),
            key_format_versions,
            encrypted,
            is_common_encryption,
            iv,
            key_id,
            pssh: None,
            key: OnceLock::new(),
        }
    }

    /// Builds a key from the attributes of a key tag, resolving `URI`
    /// against `base_url`.
    pub fn from_attrs(attrs: &AttrList, base_url: &str) -> Self {
        let method = attrs
            .enumerated_string("METHOD")
            .map(KeyMethod::from)
            .unwrap_or_else(|| KeyMethod::Other(String::new()));
        let uri = attrs.get("URI").unwrap_or_default();
        let iv = attrs.hexadecimal_integer("IV");
        if !uri.is_empty() && attrs.contains("IV") && iv.is_none() {
            warn!("Invalid IV: {}", attrs.get("IV").unwrap_or_default());
        }
        let resolved = if uri.is_empty() {
            String::new()
        } else {
            resolve_url(base_url, uri)
        };
        let key_format = attrs
            .enumerated_string("KEYFORMAT")
            .unwrap_or("identity")
            .to_string();
        let key_format_versions = attrs
            .enumerated_string("KEYFORMATVERSIONS")
            .unwrap_or("1")
            .split('/')
            .filter_map(|v| v.trim().parse().ok())
            .collect();
        let key_id = attrs
            .get("KEYID")
            .filter(|v| v.starts_with("0x") || v.starts_with("0X"))
            .and_then(|_| attrs.hexadecimal_integer("KEYID"));
        LevelKey::new(method, resolved, key_format, key_format_versions, iv, key_id)
    }

    pub fn key_system_format(&self) -> Option<KeySystemFormat> {
        self.key_format.parse().ok()
    }

    /// Key bytes, present once loaded.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.get().map(Vec::as_slice)
    }

    /// Installs loaded key bytes. Returns `false` when a key was already set.
    pub fn set_key(&self, key: Vec<u8>) -> bool {
        self.key.set(key).is_ok()
    }

    pub fn is_supported(&self) -> bool {
        if self.method.is_full_segment_encryption() || self.method == KeyMethod::None {
            return true;
        }
        if self.key_format == "identity" {
            return self.method == KeyMethod::SampleAes;
        }
        match self.key_system_format() {
            Some(_) => self.method.is_sample_aes(),
            None => false,
        }
    }

    pub fn matches(&self, other: &LevelKey) -> bool {
        let mut a = self.key_format_versions.clone();
        let mut b = other.key_format_versions.clone();
        a.sort_unstable();
        b.sort_unstable();
        other.uri == self.uri
            && other.method == self.method
            && other.encrypted == self.encrypted
            && other.key_format == self.key_format
            && a == b
            && other.iv == self.iv
            && other.key_id == self.key_id
    }

    /// Resolves the decryption parameters for segment `sn`.
    ///
    /// Returns `None` when the key does not encrypt anything. Full segment
    /// methods yield a fresh `identity` key carrying the IV; DRM keys yield a
    /// copy with `key_id`/`pssh` filled in.
    pub fn get_decrypt_data(
        &self,
        sn: FragmentSn,
        level_keys: Option<&LevelKeys>,
        registry: &KeyIdRegistry,
    ) -> Option<LevelKey> {
        if !self.encrypted || self.uri.is_empty() {
            return None;
        }

        if self.method.is_full_segment_encryption() {
            let iv = match &self.iv {
                Some(iv) => iv.clone(),
                None => {
                    let sn = match sn {
                        FragmentSn::Media(sn) => sn,
                        FragmentSn::InitSegment => {
                            warn!(
                                "missing IV for initialization segment with method=\"{}\" - compliance issue",
                                self.method
                            );
                            0
                        }
                    };
                    create_initialization_vector(sn)
                }
            };
            return Some(LevelKey::new(
                self.method.clone(),
                self.uri.clone(),
                "identity",
                self.key_format_versions.clone(),
                Some(iv),
                None,
            ));
        }

        let mut resolved = self.clone();
        if let Some(key_id) = &self.key_id {
            if let Some(assigned) = registry.get(&self.uri) {
                if &assigned != key_id {
                    registry.set_key_id_for_uri(&self.uri, key_id.clone());
                }
            }
            if self.pssh.is_some() {
                return Some(resolved);
            }
        }

        if let Some(key_bytes) = data_uri_bytes(&self.uri) {
            match self.key_system_format() {
                Some(KeySystemFormat::Widevine) => {
                    if resolved.key_id.is_none() {
                        resolved.key_id = parse_multi_pssh(&key_bytes)
                            .into_iter()
                            .next()
                            .and_then(|p| p.kids.into_iter().next());
                    }
                    resolved.pssh = Some(key_bytes);
                    if resolved.key_id.is_none() {
                        resolved.key_id = sibling_key_id(level_keys, &self.key_format);
                    }
                }
                Some(KeySystemFormat::PlayReady) => {
                    resolved.pssh = Some(mp4_pssh(&PLAYREADY_SYSTEM_ID, None, &key_bytes));
                    resolved.key_id = parse_play_ready_wrm(&key_bytes);
                }
                _ => {
                    let mut key_id = vec![0u8; 16];
                    let n = key_bytes.len().min(16);
                    key_id[16 - n..].copy_from_slice(&key_bytes[..n]);
                    resolved.key_id = Some(key_id);
                }
            }
        }

        if resolved.key_id.as_ref().map(Vec::len) != Some(16) {
            resolved.key_id = sibling_key_id(level_keys, &self.key_format);
        }
        if resolved.key_id.as_ref().map(Vec::len) != Some(16) {
            resolved.key_id = Some(registry.get_or_generate(&self.uri));
        }
        Some(resolved)
    }
}

/// Key id signalled by a key of another format in the same key set.
fn sibling_key_id(level_keys: Option<&LevelKeys>, own_format: &str) -> Option<Vec<u8>> {
    let level_keys = level_keys?;
    level_keys
        .iter()
        .filter(|(format, _)| format.as_str() != own_format)
        .find_map(|(format, key)| {
            if let Some(key_id) = key.key_id.as_ref().filter(|k| k.len() == 16) {
                return Some(key_id.clone());
            }
            if format.as_str() == KeySystemFormat::PlayReady.as_str() {
                return data_uri_bytes(&key.uri).and_then(|b| parse_play_ready_wrm(&b));
            }
            None
        })
}

/// Whether every per-segment key of `level_keys` was announced by a session key.
pub fn session_keys_match(session_keys: &[LevelKey], level_keys: &LevelKeys) -> bool {
    level_keys.values().all(|key| {
        !key.encrypted || session_keys.iter().any(|session| session.matches(key))
    })
}
