use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{info, warn};
use oci_spec::image::{Descriptor, Platform};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::CacheProxy,
    error::Error,
    manifest,
    memstore::Memory,
    platform::select_platform,
    store::{ReadOnlyStorage, ReferrerLister, Storage, TagStore, fetch_content},
    verify::VerifyReader,
    walk::{Handler, PreVisit, Walker},
};

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOrigin {
    Source,
    Destination,
}

/// What failed, on which side of the pipeline, and why.
#[derive(Debug, Clone)]
pub struct CopyError {
    pub operation: &'static str,
    pub origin: CopyOrigin,
    pub cause: Arc<Error>,
    pub message: String,
}

impl CopyError {
    fn new(operation: &'static str, origin: CopyOrigin, cause: Error) -> CopyError {
        let cause = match cause {
            Error::Shared(inner) => Error::flatten(inner),
            other => Arc::new(other),
        };
        CopyError::from_arc(operation, origin, cause)
    }

    fn from_arc(operation: &'static str, origin: CopyOrigin, cause: Arc<Error>) -> CopyError {
        let side = match origin {
            CopyOrigin::Source => "source",
            CopyOrigin::Destination => "destination",
        };
        let message = format!("{operation} failed on the {side}: {cause:?}");
        CopyError {
            operation,
            origin,
            cause,
            message,
        }
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

fn source_error(operation: &'static str) -> impl Fn(Error) -> Error {
    move |e| Error::Copy(Box::new(CopyError::new(operation, CopyOrigin::Source, e)))
}

fn dest_error(operation: &'static str) -> impl Fn(Error) -> Error {
    move |e| {
        Error::Copy(Box::new(CopyError::new(
            operation,
            CopyOrigin::Destination,
            e,
        )))
    }
}

fn to_copy_error(e: Arc<Error>) -> CopyError {
    let e = Error::flatten(e);
    match &*e {
        Error::Copy(ce) => (**ce).clone(),
        _ => CopyError::from_arc("copy", CopyOrigin::Source, e),
    }
}

#[derive(Clone)]
pub struct CopyOptions {
    /// Upper bound on concurrently handled nodes.
    pub concurrency: usize,
    /// Narrow an index (or check a manifest) to this platform first.
    pub platform: Option<Platform>,
    /// Allowlist of media types; successors outside it are pruned. Never
    /// applied to the requested root.
    pub media_type_filter: Option<Vec<String>>,
    /// Required annotations; `None` values only require the key to exist.
    /// Never applied to the requested root.
    pub annotation_filter: Option<HashMap<String, Option<String>>>,
    /// Also copy everything transitively referring to the root.
    pub with_referrers: bool,
    /// Per-blob fetch ceiling, enforced by the cache proxy.
    pub max_blob_size: Option<u64>,
    /// Called after each node lands in the destination.
    pub on_copied: Option<Arc<dyn Fn(&Descriptor) + Send + Sync>>,
    pub cancel: CancellationToken,
}

impl Default for CopyOptions {
    fn default() -> CopyOptions {
        CopyOptions {
            concurrency: DEFAULT_CONCURRENCY,
            platform: None,
            media_type_filter: None,
            annotation_filter: None,
            with_referrers: false,
            max_blob_size: None,
            on_copied: None,
            cancel: CancellationToken::new(),
        }
    }
}

struct CopyHandler<S, D> {
    caching: CacheProxy<S, Memory>,
    passthrough: CacheProxy<S, Memory>,
    dst: D,
    // walk roots are exempt from filters, they were asked for by name
    roots: Arc<Mutex<HashSet<String>>>,
    media_type_filter: Option<Vec<String>>,
    annotation_filter: Option<HashMap<String, Option<String>>>,
    on_copied: Option<Arc<dyn Fn(&Descriptor) + Send + Sync>>,
    cancel: CancellationToken,
}

impl<S, D> CopyHandler<S, D> {
    fn is_root(&self, desc: &Descriptor) -> bool {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&desc.digest().to_string())
    }

    fn filtered_out(&self, desc: &Descriptor) -> bool {
        if let Some(allowed) = &self.media_type_filter {
            let media_type = desc.media_type().to_string();
            if !allowed.iter().any(|m| *m == media_type) {
                return true;
            }
        }
        if let Some(wanted) = &self.annotation_filter {
            let annotations = desc.annotations();
            for (key, value) in wanted {
                let have = annotations.as_ref().and_then(|a| a.get(key));
                match (have, value) {
                    (None, _) => return true,
                    (Some(_), None) => {}
                    (Some(have), Some(want)) if have == want => {}
                    _ => return true,
                }
            }
        }
        false
    }
}

#[async_trait]
impl<S, D> Handler for CopyHandler<S, D>
where
    S: ReadOnlyStorage + Clone + Send + Sync + 'static,
    D: Storage + Clone + Send + Sync + 'static,
{
    async fn pre(&self, desc: &Descriptor) -> Result<PreVisit, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if !self.is_root(desc) && self.filtered_out(desc) {
            return Ok(PreVisit::SkipNode);
        }
        if self
            .dst
            .exists(desc)
            .await
            .map_err(dest_error("exists"))?
        {
            return Ok(PreVisit::SkipNode);
        }
        let media_type = desc.media_type().to_string();
        if !manifest::is_manifest(&media_type) {
            return Ok(PreVisit::Children(Vec::new()));
        }
        let data = fetch_content(&self.caching, desc)
            .await
            .map_err(source_error("fetch"))?;
        let parsed = manifest::parse(&media_type, &data).map_err(source_error("parse"))?;
        // the subject is walked like any other child so that a referrer can
        // never land before the manifest it refers to
        let mut children = Vec::new();
        if let Some(subject) = parsed.subject {
            children.push(subject);
        }
        if let Some(config) = parsed.config {
            children.push(config);
        }
        children.extend(parsed.children);
        Ok(PreVisit::Children(children))
    }

    async fn post(&self, desc: &Descriptor) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let stream = self
            .passthrough
            .fetch(desc)
            .await
            .map_err(source_error("fetch"))?;
        let verified = VerifyReader::new(stream, desc).map_err(source_error("fetch"))?;
        match self.dst.push(desc, Box::new(verified)).await {
            // another agent may have landed it concurrently
            Ok(()) | Err(Error::AlreadyExists) => {}
            // integrity failures come from the source stream, not the push
            Err(e @ (Error::MismatchedDigest | Error::TrailingData)) => {
                return Err(source_error("fetch")(e));
            }
            Err(e) => return Err(dest_error("push")(e)),
        }
        if let Some(on_copied) = &self.on_copied {
            on_copied(desc);
        }
        Ok(())
    }
}

/// Copy the graph rooted at `reference` from `src` into `dst`, then bind
/// `dst_ref` to the root (skipped when empty). Children land before their
/// parents, the root lands last before tagging, and a failed copy never tags.
pub async fn copy<S, D>(
    src: S,
    reference: &str,
    dst: D,
    dst_ref: &str,
    options: CopyOptions,
) -> Result<Descriptor, CopyError>
where
    S: ReadOnlyStorage + TagStore + ReferrerLister + Clone + Send + Sync + 'static,
    D: Storage + TagStore + Clone + Send + Sync + 'static,
{
    let root = src
        .resolve(reference)
        .await
        .map_err(|e| CopyError::new("resolve", CopyOrigin::Source, e))?;

    let mut caching = CacheProxy::new(src.clone(), Memory::new());
    if let Some(limit) = options.max_blob_size {
        caching = caching.with_size_limit(limit);
    }

    let root = if options.platform.is_some() {
        select_platform(&caching, &root, options.platform.as_ref())
            .await
            .map_err(|e| CopyError::new("select platform", CopyOrigin::Source, e))?
    } else {
        root
    };
    info!("copying {} ({})", root.digest(), root.media_type());

    let roots = Arc::new(Mutex::new(HashSet::from([root.digest().to_string()])));
    let handler = CopyHandler {
        passthrough: caching.passthrough(),
        caching: caching.clone(),
        dst: dst.clone(),
        roots: roots.clone(),
        media_type_filter: options.media_type_filter.clone(),
        annotation_filter: options.annotation_filter.clone(),
        on_copied: options.on_copied.clone(),
        cancel: options.cancel.clone(),
    };
    let walker = Walker::new(handler, options.concurrency, options.cancel.clone());
    walker.walk(root.clone()).await.map_err(to_copy_error)?;

    if !dst_ref.is_empty() {
        if manifest::is_manifest(&root.media_type().to_string()) {
            // the root bytes are still in the proxy cache, hand them to the
            // destination so it does not have to fetch them again
            let data = fetch_content(&caching, &root)
                .await
                .map_err(|e| CopyError::new("fetch", CopyOrigin::Source, e))?;
            dst.tag_with_content(&root, data, dst_ref)
                .await
                .map_err(|e| CopyError::new("tag", CopyOrigin::Destination, e))?;
        } else {
            dst.tag(&root, dst_ref)
                .await
                .map_err(|e| CopyError::new("tag", CopyOrigin::Destination, e))?;
        }
    }

    if options.with_referrers {
        copy_referrers(&src, &root, &walker, &roots).await?;
    }

    Ok(root)
}

// breadth-first over the referrer graph: referrers of the root, then
// referrers of those referrers. The walker is shared, so nodes already
// copied in the main phase are not copied twice.
async fn copy_referrers<S, H>(
    src: &S,
    root: &Descriptor,
    walker: &Walker<H>,
    roots: &Arc<Mutex<HashSet<String>>>,
) -> Result<(), CopyError>
where
    S: ReferrerLister,
    H: Handler + 'static,
{
    let mut queue = vec![root.clone()];
    let mut visited = HashSet::new();
    while let Some(subject) = queue.pop() {
        if !visited.insert(subject.digest().to_string()) {
            continue;
        }
        let listed = src
            .referrers(&subject, None)
            .await
            .map_err(|e| CopyError::new("referrers", CopyOrigin::Source, e))?;
        let Some(referrers) = listed else {
            warn!(
                "source cannot list referrers, skipping referrers of {}",
                subject.digest()
            );
            return Ok(());
        };
        for referrer in referrers {
            roots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(referrer.digest().to_string());
            walker.walk(referrer.clone()).await.map_err(to_copy_error)?;
            queue.push(referrer);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::descriptor_from_bytes;
    use crate::manifest::{MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_INDEX,
        MEDIA_TYPE_IMAGE_MANIFEST};
    use crate::store::ByteStream;
    use oci_spec::image::{Arch, Os, PlatformBuilder};
    use std::io::Cursor;

    const OCTET: &str = "application/octet-stream";
    const CONFIG: &str = "application/vnd.oci.image.config.v1+json";

    async fn push_bytes(store: &Memory, desc: &Descriptor, data: &[u8]) {
        store
            .push(desc, Box::new(Cursor::new(data.to_vec())))
            .await
            .unwrap();
    }

    async fn seed_blob(store: &Memory, media_type: &str, data: &[u8]) -> Descriptor {
        let desc = descriptor_from_bytes(media_type, data).unwrap();
        push_bytes(store, &desc, data).await;
        desc
    }

    fn desc_json(desc: &Descriptor) -> serde_json::Value {
        serde_json::to_value(desc).unwrap()
    }

    async fn seed_manifest(
        store: &Memory,
        config: &Descriptor,
        layers: &[&Descriptor],
    ) -> Descriptor {
        let layers: Vec<_> = layers.iter().map(|d| desc_json(d)).collect();
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "config": desc_json(config),
            "layers": layers,
        }))
        .unwrap();
        seed_blob(store, MEDIA_TYPE_IMAGE_MANIFEST, &data).await
    }

    // a small image: config + one layer + manifest, tagged v1
    async fn simple_image(store: &Memory) -> (Descriptor, Descriptor, Descriptor) {
        let layer = seed_blob(store, OCTET, b"hello").await;
        let config = seed_blob(store, CONFIG, b"{}").await;
        let manifest = seed_manifest(store, &config, &[&layer]).await;
        store.tag(&manifest, "v1").await.unwrap();
        (layer, config, manifest)
    }

    // destination that remembers the order successful pushes landed in
    #[derive(Clone)]
    struct RecordingDest {
        store: Memory,
        pushes: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingDest {
        fn new() -> RecordingDest {
            RecordingDest {
                store: Memory::new(),
                pushes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn pushed(&self) -> Vec<String> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReadOnlyStorage for RecordingDest {
        async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
            self.store.exists(desc).await
        }
        async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
            self.store.fetch(desc).await
        }
    }

    #[async_trait]
    impl Storage for RecordingDest {
        async fn push(&self, desc: &Descriptor, content: ByteStream) -> Result<(), Error> {
            let result = self.store.push(desc, content).await;
            if result.is_ok() {
                self.pushes.lock().unwrap().push(desc.digest().to_string());
            }
            result
        }
    }

    #[async_trait]
    impl TagStore for RecordingDest {
        async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
            self.store.resolve(reference).await
        }
        async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
            self.store.tag(desc, reference).await
        }
    }

    // source that panics when a forbidden digest is fetched
    #[derive(Clone)]
    struct StrictSource {
        store: Memory,
        forbidden: Arc<HashSet<String>>,
    }

    #[async_trait]
    impl ReadOnlyStorage for StrictSource {
        async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
            self.store.exists(desc).await
        }
        async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
            if self.forbidden.contains(&desc.digest().to_string()) {
                panic!("unexpected fetch of {}", desc.digest());
            }
            self.store.fetch(desc).await
        }
    }

    #[async_trait]
    impl TagStore for StrictSource {
        async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
            self.store.resolve(reference).await
        }
        async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
            self.store.tag(desc, reference).await
        }
    }

    #[async_trait]
    impl ReferrerLister for StrictSource {
        async fn referrers(
            &self,
            subject: &Descriptor,
            artifact_type: Option<&str>,
        ) -> Result<Option<Vec<Descriptor>>, Error> {
            self.store.referrers(subject, artifact_type).await
        }
    }

    // source that counts fetches per digest
    #[derive(Clone)]
    struct CountingSource {
        store: Memory,
        fetches: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl CountingSource {
        fn new(store: Memory) -> CountingSource {
            CountingSource {
                store,
                fetches: Arc::new(Mutex::new(HashMap::new())),
            }
        }
    }

    #[async_trait]
    impl ReadOnlyStorage for CountingSource {
        async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
            self.store.exists(desc).await
        }
        async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(desc.digest().to_string())
                .or_insert(0) += 1;
            self.store.fetch(desc).await
        }
    }

    #[async_trait]
    impl TagStore for CountingSource {
        async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
            self.store.resolve(reference).await
        }
        async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
            self.store.tag(desc, reference).await
        }
    }

    #[async_trait]
    impl ReferrerLister for CountingSource {
        async fn referrers(
            &self,
            subject: &Descriptor,
            artifact_type: Option<&str>,
        ) -> Result<Option<Vec<Descriptor>>, Error> {
            self.store.referrers(subject, artifact_type).await
        }
    }

    #[tokio::test]
    async fn test_simple_image_copy() {
        let src = Memory::new();
        let (layer, config, manifest) = simple_image(&src).await;
        let dst = RecordingDest::new();

        let root = copy(src, "v1", dst.clone(), "v1", CopyOptions::default())
            .await
            .unwrap();
        assert_eq!(root.digest().to_string(), manifest.digest().to_string());

        assert_eq!(
            dst.resolve("v1").await.unwrap().digest().to_string(),
            manifest.digest().to_string()
        );
        for desc in [&layer, &config, &manifest] {
            assert!(dst.exists(desc).await.unwrap());
        }

        // children land strictly before their parent
        let pushes = dst.pushed();
        assert_eq!(pushes.len(), 3);
        let pos = |d: &Descriptor| {
            pushes
                .iter()
                .position(|p| *p == d.digest().to_string())
                .unwrap()
        };
        assert!(pos(&layer) < pos(&manifest));
        assert!(pos(&config) < pos(&manifest));
    }

    #[tokio::test]
    async fn test_copy_is_idempotent() {
        let src = Memory::new();
        let (_, _, manifest) = simple_image(&src).await;
        let dst = RecordingDest::new();

        copy(src.clone(), "v1", dst.clone(), "v1", CopyOptions::default())
            .await
            .unwrap();
        copy(src, "v1", dst.clone(), "v1", CopyOptions::default())
            .await
            .unwrap();

        // nothing pushed twice, tag unchanged
        assert_eq!(dst.pushed().len(), 3);
        assert_eq!(
            dst.resolve("v1").await.unwrap().digest().to_string(),
            manifest.digest().to_string()
        );
    }

    #[tokio::test]
    async fn test_skip_existing_never_fetches() {
        let src = Memory::new();
        let (layer, _, _) = simple_image(&src).await;
        let dst = RecordingDest::new();
        // pre-populate the destination with the layer
        push_bytes(&dst.store, &layer, b"hello").await;

        let strict = StrictSource {
            store: src,
            forbidden: Arc::new(HashSet::from([layer.digest().to_string()])),
        };
        copy(strict, "v1", dst.clone(), "v1", CopyOptions::default())
            .await
            .unwrap();
        // the layer was skipped, only config and manifest moved
        assert_eq!(dst.pushed().len(), 2);
    }

    #[tokio::test]
    async fn test_platform_select_copies_only_the_match() {
        let src = Memory::new();

        let amd_layer = seed_blob(&src, OCTET, b"amd bits").await;
        let amd_config = seed_blob(&src, CONFIG, b"{\"amd\":1}").await;
        let amd_manifest = seed_manifest(&src, &amd_config, &[&amd_layer]).await;

        let arm_layer = seed_blob(&src, OCTET, b"arm bits").await;
        let arm_config = seed_blob(&src, CONFIG, b"{\"arm\":1}").await;
        let arm_manifest = seed_manifest(&src, &arm_config, &[&arm_layer]).await;

        let entry = |desc: &Descriptor, arch: &str| {
            let mut value = desc_json(desc);
            value["platform"] = serde_json::json!({"architecture": arch, "os": "linux"});
            value
        };
        let index_data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_IMAGE_INDEX,
            "manifests": [entry(&amd_manifest, "amd64"), entry(&arm_manifest, "arm64")],
        }))
        .unwrap();
        let index = seed_blob(&src, MEDIA_TYPE_IMAGE_INDEX, &index_data).await;
        src.tag(&index, "multi").await.unwrap();

        // the amd64 side must never be fetched
        let strict = StrictSource {
            store: src,
            forbidden: Arc::new(HashSet::from([
                amd_manifest.digest().to_string(),
                amd_config.digest().to_string(),
                amd_layer.digest().to_string(),
            ])),
        };
        let dst = RecordingDest::new();
        let options = CopyOptions {
            platform: Some(
                PlatformBuilder::default()
                    .architecture(Arch::ARM64)
                    .os(Os::Linux)
                    .build()
                    .unwrap(),
            ),
            ..CopyOptions::default()
        };
        let root = copy(strict, "multi", dst.clone(), "arm", options)
            .await
            .unwrap();

        assert_eq!(root.digest().to_string(), arm_manifest.digest().to_string());
        assert!(dst.exists(&arm_manifest).await.unwrap());
        assert!(dst.exists(&arm_layer).await.unwrap());
        assert!(!dst.exists(&amd_manifest).await.unwrap());
        assert_eq!(
            dst.resolve("arm").await.unwrap().digest().to_string(),
            arm_manifest.digest().to_string()
        );
    }

    #[tokio::test]
    async fn test_digest_mismatch_aborts_without_tagging() {
        // a source that serves bytes hashing to something else entirely
        #[derive(Clone)]
        struct LyingSource {
            root: Descriptor,
        }

        #[async_trait]
        impl ReadOnlyStorage for LyingSource {
            async fn exists(&self, _desc: &Descriptor) -> Result<bool, Error> {
                Ok(true)
            }
            async fn fetch(&self, _desc: &Descriptor) -> Result<ByteStream, Error> {
                Ok(Box::new(Cursor::new(b"evil!".to_vec())))
            }
        }

        #[async_trait]
        impl TagStore for LyingSource {
            async fn resolve(&self, _reference: &str) -> Result<Descriptor, Error> {
                Ok(self.root.clone())
            }
            async fn tag(&self, _desc: &Descriptor, _reference: &str) -> Result<(), Error> {
                Ok(())
            }
        }

        #[async_trait]
        impl ReferrerLister for LyingSource {
            async fn referrers(
                &self,
                _subject: &Descriptor,
                _artifact_type: Option<&str>,
            ) -> Result<Option<Vec<Descriptor>>, Error> {
                Ok(None)
            }
        }

        let root = descriptor_from_bytes(OCTET, b"good.").unwrap();
        let src = LyingSource { root };
        let dst = RecordingDest::new();

        let err = copy(src, "v1", dst.clone(), "v1", CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(&*err.cause, Error::MismatchedDigest));
        assert_eq!(err.origin, CopyOrigin::Source);
        // the destination was never tagged
        assert!(matches!(dst.resolve("v1").await, Err(Error::NotFound)));
        assert!(dst.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_referrers_follow_the_root() {
        let src = Memory::new();
        let (_, _, manifest) = simple_image(&src).await;

        // an artifact referring to the image, with one blob of its own
        let signature = seed_blob(&src, OCTET, b"signature bytes").await;
        let referrer_data = serde_json::to_vec(&serde_json::json!({
            "mediaType": MEDIA_TYPE_ARTIFACT_MANIFEST,
            "artifactType": "application/vnd.example.signature",
            "blobs": [desc_json(&signature)],
            "subject": desc_json(&manifest),
        }))
        .unwrap();
        let referrer = seed_blob(&src, MEDIA_TYPE_ARTIFACT_MANIFEST, &referrer_data).await;

        let dst = Memory::new();
        let options = CopyOptions {
            with_referrers: true,
            ..CopyOptions::default()
        };
        copy(src, "v1", dst.clone(), "v1", options).await.unwrap();

        assert!(dst.exists(&referrer).await.unwrap());
        assert!(dst.exists(&signature).await.unwrap());
        let listed = dst.referrers(&manifest, None).await.unwrap().unwrap();
        assert!(
            listed
                .iter()
                .any(|d| d.digest().to_string() == referrer.digest().to_string())
        );
    }

    #[tokio::test]
    async fn test_cache_keeps_backing_reads_single() {
        let src = Memory::new();
        let layer = seed_blob(&src, OCTET, b"shared layer").await;
        let config = seed_blob(&src, CONFIG, b"{}").await;
        let shared = seed_manifest(&src, &config, &[&layer]).await;

        // a contrived index listing the same manifest twice, so the walker
        // meets it through two edges
        let index_data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_IMAGE_INDEX,
            "manifests": [desc_json(&shared), desc_json(&shared)],
        }))
        .unwrap();
        let index = seed_blob(&src, MEDIA_TYPE_IMAGE_INDEX, &index_data).await;
        src.tag(&index, "v1").await.unwrap();

        let counting = CountingSource::new(src);
        let dst = RecordingDest::new();
        copy(
            counting.clone(),
            "v1",
            dst.clone(),
            "v1",
            CopyOptions::default(),
        )
        .await
        .unwrap();

        // every digest read from the source at most once
        let fetches = counting.fetches.lock().unwrap();
        for (digest, count) in fetches.iter() {
            assert_eq!(*count, 1, "{digest} fetched {count} times");
        }
        assert_eq!(dst.pushed().len(), 4);
    }

    #[tokio::test]
    async fn test_media_type_filter_prunes() {
        let src = Memory::new();
        let (layer, config, manifest) = simple_image(&src).await;
        let dst = RecordingDest::new();

        let options = CopyOptions {
            media_type_filter: Some(vec![
                MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                CONFIG.to_string(),
            ]),
            ..CopyOptions::default()
        };
        copy(src, "v1", dst.clone(), "v1", options).await.unwrap();

        assert!(dst.exists(&manifest).await.unwrap());
        assert!(dst.exists(&config).await.unwrap());
        assert!(!dst.exists(&layer).await.unwrap());
    }

    #[tokio::test]
    async fn test_annotation_filter_prunes() {
        let src = Memory::new();
        let config = seed_blob(&src, CONFIG, b"{}").await;
        let wanted = seed_blob(&src, OCTET, b"wanted").await;
        let unwanted = seed_blob(&src, OCTET, b"unwanted").await;

        // only one layer carries the annotation the filter requires
        let mut wanted_entry = desc_json(&wanted);
        wanted_entry["annotations"] = serde_json::json!({"keep": "yes"});
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "config": desc_json(&config),
            "layers": [wanted_entry, desc_json(&unwanted)],
        }))
        .unwrap();
        let manifest = seed_blob(&src, MEDIA_TYPE_IMAGE_MANIFEST, &data).await;
        src.tag(&manifest, "v1").await.unwrap();

        let dst = RecordingDest::new();
        let options = CopyOptions {
            annotation_filter: Some(HashMap::from([(
                "keep".to_string(),
                Some("yes".to_string()),
            )])),
            ..CopyOptions::default()
        };
        copy(src, "v1", dst.clone(), "v1", options).await.unwrap();

        assert!(dst.exists(&manifest).await.unwrap());
        assert!(dst.exists(&wanted).await.unwrap());
        // config has no annotations, the filter prunes it too
        assert!(!dst.exists(&config).await.unwrap());
        assert!(!dst.exists(&unwanted).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let src = Memory::new();
        simple_image(&src).await;
        let dst = RecordingDest::new();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = CopyOptions {
            cancel,
            ..CopyOptions::default()
        };
        let err = copy(src, "v1", dst, "v1", options).await.unwrap_err();
        assert!(matches!(&*err.cause, Error::Canceled));
    }

    #[tokio::test]
    async fn test_on_copied_callback() {
        let src = Memory::new();
        simple_image(&src).await;
        let dst = RecordingDest::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        let options = CopyOptions {
            on_copied: Some(Arc::new(move |desc: &Descriptor| {
                seen_in_callback
                    .lock()
                    .unwrap()
                    .push(desc.digest().to_string());
            })),
            ..CopyOptions::default()
        };
        copy(src, "v1", dst, "v1", options).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
