//! Error types shared across the crate.
//!
//! Playlist problems never abort parsing: they are stored on the parse result
//! as a [`PlaylistParsingError`] and the caller decides whether they are fatal.
//! Key and asset-list loading failures are always non-fatal at this layer and
//! carry an [`ErrorDetails`] value from a fixed taxonomy.

use std::fmt;

use thiserror::Error;

use crate::segment::{FragmentSn, PlaylistLevelType};

/// Broad category of an error surfaced to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    NetworkError,
    KeySystemError,
    OtherError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorType::NetworkError => write!(f, "networkError"),
            ErrorType::KeySystemError => write!(f, "keySystemError"),
            ErrorType::OtherError => write!(f, "otherError"),
        }
    }
}

/// Fine grained error identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDetails {
    KeyLoadError,
    KeyLoadTimeout,
    InternalAborted,
    KeySystemNoSession,
    AssetListLoadError,
    AssetListLoadTimeout,
    AssetListParsingError,
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorDetails::KeyLoadError => "keyLoadError",
            ErrorDetails::KeyLoadTimeout => "keyLoadTimeOut",
            ErrorDetails::InternalAborted => "aborted",
            ErrorDetails::KeySystemNoSession => "keySystemNoSession",
            ErrorDetails::AssetListLoadError => "assetListLoadError",
            ErrorDetails::AssetListLoadTimeout => "assetListLoadTimeout",
            ErrorDetails::AssetListParsingError => "assetListParsingError",
        };
        write!(f, "{}", s)
    }
}

/// Structural problem found while parsing a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaylistParsingError {
    #[error("Missing format identifier #EXTM3U")]
    MissingExtM3u,

    #[error("no levels found in manifest")]
    NoLevels,

    #[error("Missing Target Duration")]
    MissingTargetDuration,

    #[error("#EXT-X-{tag} must not appear more than once ({line})")]
    MultipleTagOccurrence { tag: String, line: String },

    #[error("#EXT-X-{tag} must appear before the first Media Segment ({line})")]
    TagAfterSegments { tag: String, line: String },
}

/// Failure reported by an injected [`Loader`](crate::loader::Loader).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("HTTP Error {code} {text}")]
    Http { code: u16, text: String },

    #[error("request timed out")]
    Timeout,

    #[error("request aborted")]
    Aborted,
}

/// What the failing fragment looked like when a key load was attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSummary {
    pub sn: FragmentSn,
    pub level: usize,
    pub playlist_type: PlaylistLevelType,
    pub url: String,
}

/// Response information attached to a failed key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub url: String,
    pub code: u16,
    pub text: String,
}

/// A key could not be acquired for a fragment.
#[derive(Debug, Clone, Error)]
#[error("{details}: {reason}")]
pub struct KeyLoadError {
    pub error_type: ErrorType,
    pub details: ErrorDetails,
    pub fatal: bool,
    pub reason: String,
    pub frag: Option<FragmentSummary>,
    pub response: Option<ErrorResponse>,
    pub network_details: Option<String>,
}

impl KeyLoadError {
    pub fn new(details: ErrorDetails, reason: impl Into<String>) -> Self {
        KeyLoadError {
            error_type: ErrorType::NetworkError,
            details,
            fatal: false,
            reason: reason.into(),
            frag: None,
            response: None,
            network_details: None,
        }
    }

    pub fn with_frag(mut self, frag: FragmentSummary) -> Self {
        self.frag = Some(frag);
        self
    }

    pub fn with_response(mut self, response: ErrorResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_network_details(mut self, network_details: Option<String>) -> Self {
        self.network_details = network_details;
        self
    }

    /// Errors raised by the DRM collaborator use the key-system category.
    pub fn key_system(details: ErrorDetails, reason: impl Into<String>) -> Self {
        KeyLoadError {
            error_type: ErrorType::KeySystemError,
            ..KeyLoadError::new(details, reason)
        }
    }
}

/// An interstitial asset list could not be loaded or parsed.
#[derive(Debug, Clone, Error)]
#[error("{details}: {reason}")]
pub struct AssetListError {
    pub error_type: ErrorType,
    pub details: ErrorDetails,
    pub fatal: bool,
    pub reason: String,
    pub url: Option<String>,
    pub interstitial_id: String,
    pub network_details: Option<String>,
}

impl AssetListError {
    pub fn new(
        interstitial_id: impl Into<String>,
        details: ErrorDetails,
        reason: impl Into<String>,
        url: Option<String>,
    ) -> Self {
        AssetListError {
            error_type: ErrorType::NetworkError,
            details,
            fatal: false,
            reason: reason.into(),
            url,
            interstitial_id: interstitial_id.into(),
            network_details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_error_messages() {
        let err = PlaylistParsingError::MultipleTagOccurrence {
            tag: "VERSION".into(),
            line: "#EXT-X-VERSION:4".into(),
        };
        assert_eq!(
            err.to_string(),
            "#EXT-X-VERSION must not appear more than once (#EXT-X-VERSION:4)"
        );
    }

    #[test]
    fn key_load_error_is_non_fatal() {
        let err = KeyLoadError::new(ErrorDetails::KeyLoadTimeout, "key loading timed out");
        assert!(!err.fatal);
        assert_eq!(err.error_type, ErrorType::NetworkError);
        assert_eq!(err.to_string(), "keyLoadTimeOut: key loading timed out");
    }
}
