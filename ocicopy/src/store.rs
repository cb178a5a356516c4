use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::Descriptor;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{error::Error, verify::VerifyReader};

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

// keep preallocation honest when a descriptor lies about its size
const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

#[async_trait]
pub trait ReadOnlyStorage: Send + Sync {
    async fn exists(&self, desc: &Descriptor) -> Result<bool, Error>;

    /// Fails with `Error::NotFound` when the blob is absent. The returned
    /// stream is raw; callers that consume it wrap it in a `VerifyReader`.
    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error>;
}

#[async_trait]
pub trait Storage: ReadOnlyStorage {
    /// Reads the full declared size, verifies the digest, and lands the blob
    /// atomically or not at all. Pushing an already-present blob either
    /// succeeds without I/O or fails with `Error::AlreadyExists`, per
    /// implementation; callers treat both as success.
    async fn push(&self, desc: &Descriptor, content: ByteStream) -> Result<(), Error>;
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error>;

    /// Last-write-wins.
    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error>;

    /// Like `tag` but hands over the manifest bytes the caller already has,
    /// saving stores that need the body (registries) a second fetch.
    async fn tag_with_content(
        &self,
        desc: &Descriptor,
        content: Bytes,
        reference: &str,
    ) -> Result<(), Error> {
        let _ = content;
        self.tag(desc, reference).await
    }
}

#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    /// Resolve and fetch in one step; registries do this in a single GET.
    async fn fetch_reference(&self, reference: &str) -> Result<(Descriptor, Bytes), Error>;
}

#[async_trait]
pub trait ReferrerLister: Send + Sync {
    /// All known manifests whose subject equals `subject`, optionally
    /// narrowed by artifact type. `Ok(None)` means the store has no referrer
    /// capability at all, which is different from knowing of no referrers.
    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Option<Vec<Descriptor>>, Error>;
}

/// Fetch an entire blob, verified against its descriptor.
pub async fn fetch_content<S: ReadOnlyStorage + ?Sized>(
    store: &S,
    desc: &Descriptor,
) -> Result<Bytes, Error> {
    let stream = store.fetch(desc).await?;
    let mut reader = VerifyReader::new(stream, desc)?;
    let mut buf = Vec::with_capacity(desc.size().min(MAX_PREALLOC) as usize);
    reader.read_to_end(&mut buf).await.map_err(Error::from_io)?;
    Ok(buf.into())
}
