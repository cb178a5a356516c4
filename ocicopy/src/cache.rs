use async_trait::async_trait;
use moka::future::Cache;
use oci_spec::image::Descriptor;

use crate::{
    error::Error,
    store::{ByteStream, ReadOnlyStorage, Storage},
    verify::VerifyReader,
};

// Read-through cache in front of a slow store. A miss is downloaded into the
// cache store once and every reader is served from the cache afterwards; the
// flights map makes concurrent fetches of the same digest share a single
// backing read. A passthrough handle shares the cache but stops populating
// it, which the copy engine uses for the push path so layer bodies are not
// retained after their single use.
#[derive(Clone)]
pub struct CacheProxy<B, C> {
    base: B,
    cache: C,
    flights: Cache<String, ()>,
    size_limit: Option<u64>,
    stop_caching: bool,
}

impl<B, C> CacheProxy<B, C>
where
    B: ReadOnlyStorage + Clone + Send + Sync + 'static,
    C: Storage + Clone + Send + Sync + 'static,
{
    pub fn new(base: B, cache: C) -> CacheProxy<B, C> {
        CacheProxy {
            base,
            cache,
            flights: Cache::builder().build(),
            size_limit: None,
            stop_caching: false,
        }
    }

    /// Per-blob ceiling; larger blobs fail with `SizeExceedsLimit` before
    /// the backing store is even asked.
    pub fn with_size_limit(mut self, limit: u64) -> CacheProxy<B, C> {
        self.size_limit = Some(limit);
        self
    }

    /// A handle onto the same cache that serves hits but no longer
    /// populates on miss.
    pub fn passthrough(&self) -> CacheProxy<B, C> {
        let mut proxy = self.clone();
        proxy.stop_caching = true;
        proxy
    }
}

async fn populate<B, C>(base: B, cache: C, desc: Descriptor) -> Result<(), Error>
where
    B: ReadOnlyStorage,
    C: Storage,
{
    let stream = base.fetch(&desc).await?;
    // verify on the way in, a corrupted stream must never become a cache hit
    let verified = VerifyReader::new(stream, &desc)?;
    match cache.push(&desc, Box::new(verified)).await {
        Ok(()) | Err(Error::AlreadyExists) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<B, C> ReadOnlyStorage for CacheProxy<B, C>
where
    B: ReadOnlyStorage + Clone + Send + Sync + 'static,
    C: Storage + Clone + Send + Sync + 'static,
{
    async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
        Ok(self.cache.exists(desc).await? || self.base.exists(desc).await?)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
        if let Some(limit) = self.size_limit {
            if desc.size() > limit {
                return Err(Error::SizeExceedsLimit {
                    size: desc.size(),
                    limit,
                });
            }
        }
        if self.cache.exists(desc).await? {
            return self.cache.fetch(desc).await;
        }
        if self.stop_caching {
            return self.base.fetch(desc).await;
        }
        self.flights
            .entry(desc.digest().to_string())
            .or_try_insert_with(populate(
                self.base.clone(),
                self.cache.clone(),
                desc.clone(),
            ))
            .await
            .map_err(Error::Shared)?;
        self.cache.fetch(desc).await
    }
}
