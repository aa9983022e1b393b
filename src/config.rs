//! Player configuration consumed by the key and asset-list loaders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::level_key::KeySystem;

/// Retry behaviour for one failure kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_num_retry: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_num_retry: 0,
            retry_delay_ms: 0,
            max_retry_delay_ms: 0,
        }
    }
}

/// Time limits and retry rules for one kind of request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadPolicy {
    pub max_time_to_first_byte_ms: u64,
    pub max_load_time_ms: u64,
    pub timeout_retry: Option<RetryConfig>,
    pub error_retry: Option<RetryConfig>,
}

impl LoadPolicy {
    /// Key requests.
    pub fn key_default() -> Self {
        LoadPolicy {
            max_time_to_first_byte_ms: 8_000,
            max_load_time_ms: 20_000,
            timeout_retry: Some(RetryConfig {
                max_num_retry: 1,
                retry_delay_ms: 1_000,
                max_retry_delay_ms: 20_000,
            }),
            error_retry: Some(RetryConfig {
                max_num_retry: 8,
                retry_delay_ms: 1_000,
                max_retry_delay_ms: 20_000,
            }),
        }
    }

    /// Interstitial asset-list requests.
    pub fn asset_list_default() -> Self {
        LoadPolicy {
            max_time_to_first_byte_ms: 10_000,
            max_load_time_ms: 30_000,
            timeout_retry: Some(RetryConfig::default()),
            error_retry: Some(RetryConfig::default()),
        }
    }

    pub fn max_load_time(&self) -> Duration {
        Duration::from_millis(self.max_load_time_ms)
    }
}

impl Default for LoadPolicy {
    fn default() -> Self {
        LoadPolicy::key_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HlsConfig {
    pub key_load_policy: LoadPolicy,
    pub interstitial_asset_list_load_policy: LoadPolicy,
    /// Route DRM keys through the EME controller.
    pub eme_enabled: bool,
    pub require_key_system_access_on_start: bool,
    /// Key systems the application configured licenses for.
    pub drm_systems: Vec<KeySystem>,
    pub interstitial_append_in_place: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        HlsConfig {
            key_load_policy: LoadPolicy::key_default(),
            interstitial_asset_list_load_policy: LoadPolicy::asset_list_default(),
            eme_enabled: false,
            require_key_system_access_on_start: false,
            drm_systems: Vec::new(),
            interstitial_append_in_place: true,
        }
    }
}
