//! Injected network loader abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::LoadPolicy;
use crate::error::LoaderError;
use crate::segment::LoadStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    ArrayBuffer,
    Text,
}

/// What to request.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderContext {
    pub url: String,
    pub response_type: ResponseType,
    pub headers: Vec<(String, String)>,
}

impl LoaderContext {
    pub fn new(url: impl Into<String>, response_type: ResponseType) -> Self {
        LoaderContext {
            url: url.into(),
            response_type,
            headers: Vec::new(),
        }
    }
}

/// How to request it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfiguration {
    pub load_policy: LoadPolicy,
    pub timeout: Duration,
    pub max_retry: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl LoaderConfiguration {
    /// A single attempt bounded by the policy's load time; retrying is left
    /// to the caller.
    pub fn single_attempt(load_policy: &LoadPolicy) -> Self {
        LoaderConfiguration {
            timeout: load_policy.max_load_time(),
            load_policy: load_policy.clone(),
            max_retry: 0,
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderResponse {
    pub url: String,
    pub code: u16,
    pub data: Bytes,
    pub stats: LoadStats,
    pub network_details: Option<String>,
}

/// A network request in flight or about to be issued.
///
/// One loader handles one request; [`abort`](Loader::abort) makes a pending
/// [`load`](Loader::load) resolve with [`LoaderError::Aborted`].
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        context: LoaderContext,
        config: LoaderConfiguration,
    ) -> Result<LoaderResponse, LoaderError>;

    fn abort(&self);

    fn destroy(&self);
}

/// Creates a loader per request.
pub trait LoaderFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Loader>;
}

impl<F> LoaderFactory for F
where
    F: Fn() -> Arc<dyn Loader> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Loader> {
        self()
    }
}

/// Runs `loader` and turns an overrun of `config.timeout` into
/// [`LoaderError::Timeout`], aborting the loader.
pub async fn load_with_timeout(
    loader: &dyn Loader,
    context: LoaderContext,
    config: LoaderConfiguration,
) -> Result<LoaderResponse, LoaderError> {
    let timeout = config.timeout;
    match tokio::time::timeout(timeout, loader.load(context, config)).await {
        Ok(result) => result,
        Err(_) => {
            loader.abort();
            Err(LoaderError::Timeout)
        }
    }
}
