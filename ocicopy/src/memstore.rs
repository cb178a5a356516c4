use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use oci_spec::image::{Descriptor, DescriptorBuilder};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::{
    error::Error,
    manifest,
    store::{
        ByteStream, ReadOnlyStorage, ReferenceFetcher, ReferrerLister, Storage, TagStore,
        fetch_content,
    },
    verify::VerifyReader,
};

// In-memory CAS, ground truth for tests and staging area for small
// workloads. Everything is Clone with interior mutability so handles can be
// passed around freely.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    blobs: RwLock<HashMap<String, Bytes>>,
    tags: RwLock<HashMap<String, Descriptor>>,
    // reverse subject index, maintained on every manifest push so that
    // referrers() is a lookup instead of a scan
    referrers: RwLock<HashMap<String, Vec<Descriptor>>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }

    async fn index_referrer(&self, desc: &Descriptor, data: &[u8]) {
        let media_type = desc.media_type().to_string();
        if !manifest::is_manifest(&media_type) {
            return;
        }
        let parsed = match manifest::parse(&media_type, data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("stored undecodable manifest {}: {:?}", desc.digest(), e);
                return;
            }
        };
        let Some(subject) = parsed.subject else {
            return;
        };
        // referrers responses carry the artifact type (falling back to the
        // config media type) and the manifest annotations
        let artifact_type = parsed
            .artifact_type
            .or_else(|| parsed.config.as_ref().map(|c| c.media_type().to_string()));
        let mut builder = DescriptorBuilder::default()
            .media_type(desc.media_type().clone())
            .digest(desc.digest().clone())
            .size(desc.size());
        if let Some(artifact_type) = artifact_type {
            builder = builder.artifact_type(artifact_type.as_str());
        }
        if let Some(annotations) = parsed.annotations {
            builder = builder.annotations(annotations);
        }
        let referrer = match builder.build() {
            Ok(referrer) => referrer,
            Err(e) => {
                debug!("could not build referrer descriptor: {:?}", e);
                return;
            }
        };
        self.inner
            .referrers
            .write()
            .await
            .entry(subject.digest().to_string())
            .or_default()
            .push(referrer);
    }
}

#[async_trait]
impl ReadOnlyStorage for Memory {
    async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
        Ok(self
            .inner
            .blobs
            .read()
            .await
            .contains_key(&desc.digest().to_string()))
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
        let blobs = self.inner.blobs.read().await;
        match blobs.get(&desc.digest().to_string()) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(Error::NotFound),
        }
    }
}

#[async_trait]
impl Storage for Memory {
    async fn push(&self, desc: &Descriptor, content: ByteStream) -> Result<(), Error> {
        // drain and verify before looking at the map so a duplicate push is
        // indistinguishable from a fresh one to the caller
        let mut reader = VerifyReader::new(content, desc)?;
        let mut data = Vec::with_capacity(desc.size().min(4 * 1024 * 1024) as usize);
        reader.read_to_end(&mut data).await.map_err(Error::from_io)?;
        let key = desc.digest().to_string();
        {
            let mut blobs = self.inner.blobs.write().await;
            if blobs.contains_key(&key) {
                return Err(Error::AlreadyExists);
            }
            blobs.insert(key, Bytes::from(data.clone()));
        }
        self.index_referrer(desc, &data).await;
        Ok(())
    }
}

#[async_trait]
impl TagStore for Memory {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        self.inner
            .tags
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        self.inner
            .tags
            .write()
            .await
            .insert(reference.to_string(), desc.clone());
        Ok(())
    }
}

#[async_trait]
impl ReferenceFetcher for Memory {
    async fn fetch_reference(&self, reference: &str) -> Result<(Descriptor, Bytes), Error> {
        let desc = self.resolve(reference).await?;
        let data = fetch_content(self, &desc).await?;
        Ok((desc, data))
    }
}

#[async_trait]
impl ReferrerLister for Memory {
    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Option<Vec<Descriptor>>, Error> {
        let map = self.inner.referrers.read().await;
        let mut list = map
            .get(&subject.digest().to_string())
            .cloned()
            .unwrap_or_default();
        if let Some(artifact_type) = artifact_type {
            list.retain(|d| {
                d.artifact_type()
                    .as_ref()
                    .map(|t| t.to_string() == artifact_type)
                    .unwrap_or(false)
            });
        }
        Ok(Some(list))
    }
}
