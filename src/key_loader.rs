//! Key acquisition for encrypted fragments.
//!
//! Keys are cached by key id. Fragments sharing a key share one load: the
//! first request stores a [`Shared`] future that later requests await.
//! AES keys are fetched over HTTP through the injected
//! [`Loader`](crate::loader::Loader); DRM keys are handed to the injected
//! [`EmeController`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::attributes::KeyMethod;
use crate::config::HlsConfig;
use crate::error::{ErrorDetails, ErrorResponse, FragmentSummary, KeyLoadError, LoaderError};
use crate::events::{EventBus, HlsEvent};
use crate::level_details::LevelDetails;
use crate::level_key::{KeyIdRegistry, KeySystem, KeySystemFormat, LevelKey};
use crate::loader::{
    load_with_timeout, Loader, LoaderConfiguration, LoaderContext, LoaderFactory, ResponseType,
};
use crate::pssh::parse_key_ids_from_tenc;
use crate::segment::{DecryptState, Fragment, PlaylistLevelType};

/// Status of a key inside a DRM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKeyStatus {
    Usable,
    UsableInFuture,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

impl fmt::Display for MediaKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MediaKeyStatus::Usable => "usable",
            MediaKeyStatus::UsableInFuture => "usable-in-future",
            MediaKeyStatus::Expired => "expired",
            MediaKeyStatus::Released => "released",
            MediaKeyStatus::OutputRestricted => "output-restricted",
            MediaKeyStatus::OutputDownscaled => "output-downscaled",
            MediaKeyStatus::StatusPending => "status-pending",
            MediaKeyStatus::InternalError => "internal-error",
        };
        write!(f, "{}", s)
    }
}

/// DRM session a key was loaded into.
#[derive(Debug, Clone)]
pub struct MediaKeySessionContext {
    pub key_system: KeySystem,
    pub decryptdata: Arc<LevelKey>,
    pub session_id: Option<String>,
    pub key_status: Option<MediaKeyStatus>,
}

/// Result of a key load.
#[derive(Debug, Clone)]
pub struct KeyLoadedData {
    pub frag: FragmentSummary,
    pub decryptdata: Arc<LevelKey>,
    pub key_id: String,
}

/// The DRM collaborator.
#[async_trait]
pub trait EmeController: Send + Sync {
    /// Picks one of `formats` for `frag`, acquiring key system access.
    async fn select_key_system_format(
        &self,
        frag: &FragmentSummary,
        formats: Vec<KeySystemFormat>,
    ) -> Result<KeySystemFormat, KeyLoadError>;

    async fn load_key(&self, data: &KeyLoadedData) -> Result<MediaKeySessionContext, KeyLoadError>;

    fn get_key_status(&self, decryptdata: &LevelKey) -> Option<MediaKeyStatus>;

    async fn get_key_system_access(&self, key_systems: Vec<KeySystem>) -> Result<(), KeyLoadError>;

    fn get_selected_key_system_formats(&self) -> Vec<KeySystemFormat>;
}

type KeyLoadFuture = Shared<BoxFuture<'static, Result<KeyLoadedData, KeyLoadError>>>;

/// Cache entry for one key id.
pub struct KeyInfo {
    pub decryptdata: Arc<LevelKey>,
    pub playlist_type: PlaylistLevelType,
    key_load: Mutex<Option<KeyLoadFuture>>,
    loader: Mutex<Option<Arc<dyn Loader>>>,
    media_key_session_context: Mutex<Option<MediaKeySessionContext>>,
}

impl KeyInfo {
    fn new(decryptdata: Arc<LevelKey>, playlist_type: PlaylistLevelType) -> Self {
        KeyInfo {
            decryptdata,
            playlist_type,
            key_load: Mutex::new(None),
            loader: Mutex::new(None),
            media_key_session_context: Mutex::new(None),
        }
    }

    pub fn media_key_session_context(&self) -> Option<MediaKeySessionContext> {
        self.media_key_session_context.lock().clone()
    }

    /// Whether a network request for this key is in flight.
    pub fn is_loading(&self) -> bool {
        self.loader.lock().is_some()
    }
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("decryptdata", &self.decryptdata)
            .field("playlist_type", &self.playlist_type)
            .field("loading", &self.is_loading())
            .finish()
    }
}

type KeyInfoMap = Arc<Mutex<HashMap<String, Arc<KeyInfo>>>>;

/// Cache key of a key: the hex key id, or the URI for FairPlay and keys
/// without an id.
pub fn key_id_string(decryptdata: &LevelKey) -> String {
    match &decryptdata.key_id {
        Some(key_id) if decryptdata.key_system_format() != Some(KeySystemFormat::FairPlay) => {
            hex::encode(key_id)
        }
        _ => decryptdata.uri.clone(),
    }
}

fn uses_eme(decryptdata: &LevelKey) -> bool {
    decryptdata.method.is_sample_aes() && decryptdata.key_format != "identity"
}

pub struct KeyLoader {
    config: HlsConfig,
    factory: Arc<dyn LoaderFactory>,
    eme: Option<Arc<dyn EmeController>>,
    registry: Arc<KeyIdRegistry>,
    events: EventBus,
    key_id_to_key_info: KeyInfoMap,
}

impl KeyLoader {
    pub fn new(
        config: HlsConfig,
        factory: Arc<dyn LoaderFactory>,
        eme: Option<Arc<dyn EmeController>>,
        events: EventBus,
    ) -> Self {
        KeyLoader {
            config,
            factory,
            eme,
            registry: Arc::new(KeyIdRegistry::new()),
            events,
            key_id_to_key_info: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// URI to key id associations of this session.
    pub fn registry(&self) -> &Arc<KeyIdRegistry> {
        &self.registry
    }

    pub fn key_info(&self, key_id: &str) -> Option<Arc<KeyInfo>> {
        self.key_id_to_key_info.lock().get(key_id).cloned()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.key_id_to_key_info.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_id_to_key_info.lock().is_empty()
    }

    /// Aborts in-flight key requests, optionally only those of one playlist type.
    pub fn abort(&self, playlist_type: Option<PlaylistLevelType>) {
        for info in self.key_id_to_key_info.lock().values() {
            if playlist_type.is_some_and(|t| t != info.playlist_type) {
                continue;
            }
            if let Some(loader) = info.loader.lock().as_ref() {
                loader.abort();
            }
        }
    }

    /// Forgets DRM keys when media is detached. Plain AES keys stay cached.
    pub fn detach(&self) {
        self.key_id_to_key_info.lock().retain(|_, info| {
            info.media_key_session_context.lock().is_none() && !info.decryptdata.is_common_encryption
        });
    }

    /// Destroys every in-flight loader and forgets all keys.
    pub fn destroy(&self) {
        let mut infos = self.key_id_to_key_info.lock();
        for info in infos.values() {
            if let Some(loader) = info.loader.lock().take() {
                loader.destroy();
            }
        }
        infos.clear();
        self.registry.clear();
    }

    /// Selects a key system while clear content loads, so the DRM session is
    /// ready when the first encrypted fragment arrives.
    ///
    /// Returns `Ok(false)` when nothing had to be done.
    pub async fn load_clear(
        &self,
        loading_frag: &Fragment,
        details: &mut LevelDetails,
        start_frag_requested: bool,
    ) -> Result<bool, KeyLoadError> {
        let Some(eme) = self.eme.clone() else {
            return Ok(false);
        };
        if !self.config.eme_enabled || !eme.get_selected_key_system_formats().is_empty() {
            return Ok(false);
        }

        let count = details.encrypted_fragments.len();
        let target = details
            .encrypted_fragments
            .iter()
            .enumerate()
            .find_map(|(i, &index)| {
                let frag = details.fragments.get(index)?.as_ref()?;
                let ahead = loading_frag.cc <= frag.cc
                    && match (loading_frag.sn.media(), frag.sn.media()) {
                        (Some(loading), Some(sn)) => loading < sn,
                        _ => true,
                    };
                (ahead || (!start_frag_requested && i + 1 == count)).then_some(index)
            });
        if let Some(index) = target {
            let Some(frag) = details.fragments.get_mut(index).and_then(Option::as_mut) else {
                return Ok(false);
            };
            let format = eme
                .select_key_system_format(&frag.summary(), key_formats(frag))
                .await?;
            frag.set_key_format(format, &self.registry);
            eme.get_key_system_access(vec![format.key_system()]).await?;
            return Ok(true);
        }

        if self.config.require_key_system_access_on_start && !self.config.drm_systems.is_empty() {
            eme.get_key_system_access(self.config.drm_systems.clone())
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Loads the key of `frag`, sharing the request with every fragment that
    /// uses the same key id.
    pub async fn load(&self, frag: &mut Fragment) -> Result<KeyLoadedData, KeyLoadError> {
        let state = frag.decrypt_state(&self.registry);
        let mut key_system_format = None;
        if matches!(state, DecryptState::PendingKeySystemSelection)
            && frag.encrypted()
            && self.config.eme_enabled
        {
            if let Some(eme) = &self.eme {
                let summary = frag.summary();
                let format = eme
                    .select_key_system_format(&summary, key_formats(frag))
                    .await
                    .map_err(|e| self.report(e.with_frag(summary)))?;
                key_system_format = Some(format);
            }
        }
        match self.load_internal(frag, key_system_format).await {
            Ok(loaded) => {
                self.events.publish(HlsEvent::KeyLoaded {
                    frag: loaded.frag.clone(),
                    key_id: loaded.key_id.clone(),
                });
                Ok(loaded)
            }
            Err(e) => Err(self.report(e)),
        }
    }

    async fn load_internal(
        &self,
        frag: &mut Fragment,
        key_system_format: Option<KeySystemFormat>,
    ) -> Result<KeyLoadedData, KeyLoadError> {
        if let Some(format) = key_system_format {
            frag.set_key_format(format, &self.registry);
        }
        let summary = frag.summary();
        let Some(mut decryptdata) = frag.decryptdata().cloned() else {
            let reason = match key_system_format {
                Some(format) => format!(
                    "Expected frag.decryptdata to be defined after setting format {}",
                    format
                ),
                None => "Missing decryption data on fragment in onKeyLoading".to_string(),
            };
            return Err(KeyLoadError::new(ErrorDetails::KeyLoadError, reason).with_frag(summary));
        };
        if decryptdata.uri.is_empty() {
            return Err(KeyLoadError::new(
                ErrorDetails::KeyLoadError,
                format!("Invalid key URI: \"{}\"", decryptdata.uri),
            )
            .with_frag(summary));
        }

        if uses_eme(&decryptdata) && decryptdata.key_id.is_none() {
            if let Some(key_id) = init_segment_key_id(frag) {
                let mut with_key_id = (*decryptdata).clone();
                with_key_id.key_id = Some(key_id);
                decryptdata = Arc::new(with_key_id);
                frag.set_decryptdata(Some(decryptdata.clone()));
            }
        }

        let id = key_id_string(&decryptdata);
        let load = {
            let mut infos = self.key_id_to_key_info.lock();
            let existing = infos.get(&id).cloned();
            if let Some(key) = existing.as_ref().and_then(|info| info.decryptdata.key()) {
                decryptdata.set_key(key.to_vec());
                return Ok(KeyLoadedData {
                    frag: summary,
                    decryptdata,
                    key_id: id,
                });
            }
            match existing.as_ref().and_then(|info| self.reusable_load(info)) {
                Some(load) => load,
                None => {
                    debug!(
                        "{}oading key {} URI: {} from {} {}",
                        if existing.is_some() { "Rel" } else { "L" },
                        id,
                        decryptdata.uri,
                        frag.playlist_type,
                        frag.level
                    );
                    let info = Arc::new(KeyInfo::new(decryptdata.clone(), frag.playlist_type));
                    let load = self.start_load(&info, &id, summary.clone(), frag)?;
                    *info.key_load.lock() = Some(load.clone());
                    infos.insert(id.clone(), info);
                    self.events.publish(HlsEvent::KeyLoading {
                        frag: summary.clone(),
                    });
                    load
                }
            }
        };

        let loaded = load.await.map_err(|e| KeyLoadError {
            frag: Some(summary.clone()),
            ..e
        })?;
        if let Some(key) = loaded.decryptdata.key() {
            if !Arc::ptr_eq(&loaded.decryptdata, &decryptdata) {
                decryptdata.set_key(key.to_vec());
            }
        }
        Ok(KeyLoadedData {
            frag: summary,
            decryptdata,
            key_id: id,
        })
    }

    /// An earlier load worth awaiting: still in flight, or finished with a
    /// key the DRM session can use.
    fn reusable_load(&self, info: &KeyInfo) -> Option<KeyLoadFuture> {
        let load = info.key_load.lock().clone()?;
        match load.peek() {
            None => Some(load),
            Some(Ok(_)) => {
                let eme = self.eme.as_ref()?;
                match eme.get_key_status(&info.decryptdata) {
                    Some(MediaKeyStatus::Usable) | Some(MediaKeyStatus::UsableInFuture) => {
                        Some(load)
                    }
                    _ => None,
                }
            }
            Some(Err(_)) => None,
        }
    }

    fn start_load(
        &self,
        info: &Arc<KeyInfo>,
        id: &str,
        frag: FragmentSummary,
        fragment: &Fragment,
    ) -> Result<KeyLoadFuture, KeyLoadError> {
        let decryptdata = &info.decryptdata;
        match &decryptdata.method {
            KeyMethod::SampleAes | KeyMethod::SampleAesCenc | KeyMethod::SampleAesCtr => {
                if decryptdata.key_format == "identity" {
                    Ok(self.load_key_http(info, id, frag))
                } else {
                    Ok(self.load_key_eme(info, id, frag, fragment.is_media()))
                }
            }
            KeyMethod::Aes128 | KeyMethod::Aes256 | KeyMethod::Aes256Ctr => {
                Ok(self.load_key_http(info, id, frag))
            }
            other => Err(KeyLoadError::new(
                ErrorDetails::KeyLoadError,
                format!("Key supplied with unsupported METHOD: \"{}\"", other),
            )
            .with_frag(frag)),
        }
    }

    fn load_key_http(&self, info: &Arc<KeyInfo>, id: &str, frag: FragmentSummary) -> KeyLoadFuture {
        let weak: Weak<KeyInfo> = Arc::downgrade(info);
        let decryptdata = info.decryptdata.clone();
        let infos = self.key_id_to_key_info.clone();
        let loader = self.factory.create();
        let config = LoaderConfiguration::single_attempt(&self.config.key_load_policy);
        let id = id.to_string();
        async move {
            let uri = decryptdata.uri.clone();
            if let Some(info) = weak.upgrade() {
                *info.loader.lock() = Some(loader.clone());
            }
            let result = load_with_timeout(
                loader.as_ref(),
                LoaderContext::new(uri.clone(), ResponseType::ArrayBuffer),
                config,
            )
            .await;
            if let Some(info) = weak.upgrade() {
                info.loader.lock().take();
            }

            let response = match result {
                Ok(response) => response,
                Err(LoaderError::Http { code, text }) => {
                    return Err(KeyLoadError::new(
                        ErrorDetails::KeyLoadError,
                        format!("HTTP Error {} loading key {}", code, uri),
                    )
                    .with_frag(frag)
                    .with_response(ErrorResponse {
                        url: uri,
                        code,
                        text,
                    }));
                }
                Err(LoaderError::Timeout) => {
                    return Err(KeyLoadError::new(
                        ErrorDetails::KeyLoadTimeout,
                        "key loading timed out",
                    )
                    .with_frag(frag));
                }
                Err(LoaderError::Aborted) => {
                    return Err(KeyLoadError::new(
                        ErrorDetails::InternalAborted,
                        "key loading aborted",
                    )
                    .with_frag(frag));
                }
            };

            let current = infos.lock().get(&id).cloned();
            let unchanged = match (current, weak.upgrade()) {
                (Some(current), Some(info)) => Arc::ptr_eq(&current, &info),
                _ => false,
            };
            if !unchanged {
                return Err(KeyLoadError::new(
                    ErrorDetails::KeyLoadError,
                    "after key load, decryptdata unset or changed",
                )
                .with_frag(frag)
                .with_network_details(response.network_details));
            }
            decryptdata.set_key(response.data.to_vec());
            Ok(KeyLoadedData {
                frag,
                decryptdata,
                key_id: id,
            })
        }
        .boxed()
        .shared()
    }

    fn load_key_eme(
        &self,
        info: &Arc<KeyInfo>,
        id: &str,
        frag: FragmentSummary,
        is_media: bool,
    ) -> KeyLoadFuture {
        let loaded = KeyLoadedData {
            frag,
            decryptdata: info.decryptdata.clone(),
            key_id: id.to_string(),
        };
        let eme = self.eme.clone().filter(|_| self.config.eme_enabled);
        let weak = Arc::downgrade(info);
        async move {
            let Some(eme) = eme else {
                return Ok(loaded);
            };
            if loaded.decryptdata.key_id.is_none() && !is_media {
                return Ok(loaded);
            }
            let context = eme.load_key(&loaded).await.map_err(|e| KeyLoadError {
                frag: Some(loaded.frag.clone()),
                ..e
            })?;
            if let Some(info) = weak.upgrade() {
                *info.media_key_session_context.lock() = Some(context);
            }
            Ok(loaded)
        }
        .boxed()
        .shared()
    }

    fn report(&self, error: KeyLoadError) -> KeyLoadError {
        warn!("{}", error);
        self.events.publish(error.clone());
        error
    }
}

impl fmt::Debug for KeyLoader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyLoader")
            .field("config", &self.config)
            .field("keys", &self.len())
            .finish()
    }
}

fn key_formats(frag: &Fragment) -> Vec<KeySystemFormat> {
    frag.levelkeys
        .as_ref()
        .map(|keys| keys.keys().filter_map(|f| f.parse().ok()).collect())
        .unwrap_or_default()
}

/// First default key id of the fragment's init segment.
fn init_segment_key_id(frag: &Fragment) -> Option<Vec<u8>> {
    let data = frag.init_segment.as_ref()?.data.as_ref()?;
    let key_ids = parse_key_ids_from_tenc(data);
    let first = key_ids.first()?.clone();
    if key_ids.iter().any(|k| *k != first) {
        warn!("Using first of multiple keyIds found in init segment tenc");
    }
    Some(first)
}
