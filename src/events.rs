//! Events emitted by the loaders.

use tokio::sync::broadcast;

use crate::error::{AssetListError, ErrorDetails, FragmentSummary, KeyLoadError};
use crate::interstitial::AssetListResponse;

/// Error payload of [`HlsEvent::Error`].
#[derive(Debug, Clone)]
pub enum ErrorData {
    KeyLoad(KeyLoadError),
    AssetList(AssetListError),
}

impl ErrorData {
    pub fn details(&self) -> ErrorDetails {
        match self {
            ErrorData::KeyLoad(e) => e.details,
            ErrorData::AssetList(e) => e.details,
        }
    }

    pub fn fatal(&self) -> bool {
        match self {
            ErrorData::KeyLoad(e) => e.fatal,
            ErrorData::AssetList(e) => e.fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HlsEvent {
    KeyLoading {
        frag: FragmentSummary,
    },
    KeyLoaded {
        frag: FragmentSummary,
        key_id: String,
    },
    AssetListLoading {
        event_id: String,
        url: String,
    },
    AssetListLoaded {
        event_id: String,
        response: AssetListResponse,
        network_details: Option<String>,
    },
    Error(ErrorData),
}

impl From<KeyLoadError> for HlsEvent {
    fn from(error: KeyLoadError) -> Self {
        HlsEvent::Error(ErrorData::KeyLoad(error))
    }
}

impl From<AssetListError> for HlsEvent {
    fn from(error: AssetListError) -> Self {
        HlsEvent::Error(ErrorData::AssetList(error))
    }
}

/// Broadcasts [`HlsEvent`]s to every subscriber.
///
/// Publishing never blocks; without subscribers events are dropped and slow
/// subscribers see `RecvError::Lagged`.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<HlsEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn publish<E: Into<HlsEvent>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HlsEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers() {
        let bus = EventBus::new(0);
        bus.publish(KeyLoadError::new(ErrorDetails::KeyLoadError, "gone"));
    }

    #[tokio::test]
    async fn subscribers_receive_errors() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();
        bus.publish(KeyLoadError::new(ErrorDetails::KeyLoadTimeout, "slow"));
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                HlsEvent::Error(data) => {
                    assert_eq!(data.details(), ErrorDetails::KeyLoadTimeout);
                    assert!(!data.fatal());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
