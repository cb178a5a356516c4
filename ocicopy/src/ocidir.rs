use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::error;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType,
};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use crate::{
    error::Error,
    store::{
        ByteStream, ReadOnlyStorage, ReferenceFetcher, ReferrerLister, Storage, TagStore,
        fetch_content,
    },
    verify::VerifyReader,
};

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = "1.0.0";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

// On-disk store following the OCI image layout:
//   <root>/oci-layout
//   <root>/index.json
//   <root>/blobs/<algo>/<hex>
// A blob file exists only once it is complete and verified; writes go
// through a random-token temp file that renames into place on success and
// unlinks on drop otherwise. index.json updates are serialized by a
// store-wide lock.
#[derive(Clone)]
pub struct OciDir {
    inner: Arc<DirInner>,
}

struct DirInner {
    root: PathBuf,
    index_lock: Mutex<()>,
}

// unlink the temp file unless the caller renamed it into place
struct TempGuard {
    path: Option<PathBuf>,
}

impl TempGuard {
    fn new(path: PathBuf) -> TempGuard {
        TempGuard { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path.take();
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("error removing temp file {:?}: {:?}", path, e);
                }
            }
        }
    }
}

fn temp_name(name: &str) -> String {
    format!(".{}.{:016x}", name, rand::random::<u64>())
}

async fn write_atomic(dir: &Path, name: &str, data: Vec<u8>) -> Result<(), Error> {
    let temp = dir.join(temp_name(name));
    let guard = TempGuard::new(temp.clone());
    fs::write(&temp, &data).await?;
    fs::rename(&temp, dir.join(name)).await?;
    guard.disarm();
    Ok(())
}

fn ref_name(desc: &Descriptor) -> Option<&str> {
    desc.annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

fn tagged_descriptor(desc: &Descriptor, reference: &str) -> Result<Descriptor, Error> {
    let mut annotations = desc.annotations().clone().unwrap_or_default();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), reference.to_string());
    let mut builder = DescriptorBuilder::default()
        .media_type(desc.media_type().clone())
        .digest(desc.digest().clone())
        .size(desc.size())
        .annotations(annotations);
    if let Some(platform) = desc.platform() {
        builder = builder.platform(platform.clone());
    }
    if let Some(artifact_type) = desc.artifact_type() {
        builder = builder.artifact_type(artifact_type.clone());
    }
    Ok(builder.build()?)
}

fn empty_index() -> Result<ImageIndex, Error> {
    Ok(ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::<Descriptor>::new())
        .build()?)
}

impl OciDir {
    pub async fn create(path: impl Into<PathBuf>) -> Result<OciDir, Error> {
        let root: PathBuf = path.into();
        fs::create_dir_all(root.join(BLOBS_DIR)).await?;
        if !fs::try_exists(root.join(LAYOUT_FILE)).await? {
            let marker = LayoutMarker {
                image_layout_version: LAYOUT_VERSION.to_string(),
            };
            write_atomic(&root, LAYOUT_FILE, serde_json::to_vec(&marker)?).await?;
        }
        if !fs::try_exists(root.join(INDEX_FILE)).await? {
            write_atomic(&root, INDEX_FILE, serde_json::to_vec(&empty_index()?)?).await?;
        }
        OciDir::open(root).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<OciDir, Error> {
        let root: PathBuf = path.into();
        let raw = fs::read(root.join(LAYOUT_FILE)).await?;
        let marker: LayoutMarker = serde_json::from_slice(&raw)?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(Error::UnsupportedVersion(marker.image_layout_version));
        }
        Ok(OciDir {
            inner: Arc::new(DirInner {
                root,
                index_lock: Mutex::new(()),
            }),
        })
    }

    pub async fn open_or_create(path: impl Into<PathBuf>) -> Result<OciDir, Error> {
        let root: PathBuf = path.into();
        if fs::try_exists(root.join(LAYOUT_FILE)).await? {
            OciDir::open(root).await
        } else {
            OciDir::create(root).await
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    // sha256:foo -> blobs/sha256/foo
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.inner
            .root
            .join(BLOBS_DIR)
            .join(digest.algorithm().as_ref())
            .join(digest.digest())
    }

    async fn read_index(&self) -> Result<ImageIndex, Error> {
        let raw = fs::read(self.inner.root.join(INDEX_FILE)).await?;
        Ok(ImageIndex::from_reader(Cursor::new(raw))?)
    }
}

#[async_trait]
impl ReadOnlyStorage for OciDir {
    async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
        Ok(fs::try_exists(self.blob_path(desc.digest())).await?)
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
        match fs::File::open(self.blob_path(desc.digest())).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Storage for OciDir {
    async fn push(&self, desc: &Descriptor, content: ByteStream) -> Result<(), Error> {
        let path = self.blob_path(desc.digest());
        // a present blob file is complete and verified, nothing to do
        if fs::try_exists(&path).await? {
            return Ok(());
        }
        let dir = path.parent().ok_or(Error::InvalidDigest)?.to_path_buf();
        fs::create_dir_all(&dir).await?;
        let temp = dir.join(temp_name(desc.digest().digest()));
        let guard = TempGuard::new(temp.clone());
        let mut verified = VerifyReader::new(content, desc)?;
        let mut file = fs::File::create(&temp).await?;
        tokio::io::copy(&mut verified, &mut file)
            .await
            .map_err(Error::from_io)?;
        file.flush().await?;
        drop(file);
        // concurrent pushes of the same digest race here; rename replaces
        // atomically and both bodies were verified identical, so whoever
        // loses still reports success
        fs::rename(&temp, &path).await?;
        guard.disarm();
        Ok(())
    }
}

#[async_trait]
impl TagStore for OciDir {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        let index = self.read_index().await?;
        if let Some(found) = index
            .manifests()
            .iter()
            .find(|m| ref_name(m) == Some(reference))
        {
            return Ok(found.clone());
        }
        // untagged manifests are commonly addressed by their digest string
        if let Ok(digest) = reference.parse::<Digest>() {
            if let Some(found) = index.manifests().iter().find(|m| *m.digest() == digest) {
                return Ok(found.clone());
            }
        }
        Err(Error::NotFound)
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        let entry = tagged_descriptor(desc, reference)?;
        let _lock = self.inner.index_lock.lock().await;
        let mut index = self.read_index().await?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|m| ref_name(m) != Some(reference))
            .cloned()
            .collect();
        manifests.push(entry);
        index.set_manifests(manifests);
        write_atomic(&self.inner.root, INDEX_FILE, serde_json::to_vec(&index)?).await
    }
}

#[async_trait]
impl ReferenceFetcher for OciDir {
    async fn fetch_reference(&self, reference: &str) -> Result<(Descriptor, Bytes), Error> {
        let desc = self.resolve(reference).await?;
        let data = fetch_content(self, &desc).await?;
        Ok((desc, data))
    }
}

#[async_trait]
impl ReferrerLister for OciDir {
    async fn referrers(
        &self,
        _subject: &Descriptor,
        _artifact_type: Option<&str>,
    ) -> Result<Option<Vec<Descriptor>>, Error> {
        // the layout has no referrer index
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::descriptor_from_bytes;
    use crate::manifest::MEDIA_TYPE_IMAGE_MANIFEST;

    async fn push_bytes(store: &OciDir, desc: &Descriptor, data: &[u8]) -> Result<(), Error> {
        store
            .push(desc, Box::new(Cursor::new(data.to_vec())))
            .await
    }

    #[tokio::test]
    async fn test_create_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("layout");
        let _store = OciDir::create(&root).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("oci-layout")).unwrap(),
            r#"{"imageLayoutVersion":"1.0.0"}"#
        );
        assert!(root.join("index.json").exists());
    }

    #[tokio::test]
    async fn test_push_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OciDir::create(dir.path().join("layout")).await.unwrap();
        let desc = descriptor_from_bytes("application/octet-stream", b"hello").unwrap();

        assert!(!store.exists(&desc).await.unwrap());
        push_bytes(&store, &desc, b"hello").await.unwrap();
        assert!(store.exists(&desc).await.unwrap());
        assert_eq!(&fetch_content(&store, &desc).await.unwrap()[..], b"hello");

        let blob = dir
            .path()
            .join("layout/blobs/sha256")
            .join(desc.digest().digest());
        assert!(blob.exists());

        // pushing a present blob succeeds without complaint
        push_bytes(&store, &desc, b"hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_push_verifies_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = OciDir::create(dir.path().join("layout")).await.unwrap();
        let desc = descriptor_from_bytes("application/octet-stream", b"good").unwrap();

        assert!(matches!(
            push_bytes(&store, &desc, b"bad!").await,
            Err(Error::MismatchedDigest)
        ));
        assert!(!store.exists(&desc).await.unwrap());
        // no temp leftovers
        let blobs = dir.path().join("layout/blobs/sha256");
        assert_eq!(std::fs::read_dir(&blobs).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_tag_resolve_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("layout");
        let store = OciDir::create(&root).await.unwrap();
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, b"{\"schemaVersion\":2}")
            .unwrap();
        push_bytes(&store, &desc, b"{\"schemaVersion\":2}")
            .await
            .unwrap();
        store.tag(&desc, "v1").await.unwrap();

        let resolved = store.resolve("v1").await.unwrap();
        assert_eq!(resolved.digest().to_string(), desc.digest().to_string());

        // digest-string resolve
        let by_digest = store.resolve(&desc.digest().to_string()).await.unwrap();
        assert_eq!(by_digest.digest().to_string(), desc.digest().to_string());

        // tags survive reopening
        let reopened = OciDir::open(&root).await.unwrap();
        let resolved = reopened.resolve("v1").await.unwrap();
        assert_eq!(resolved.digest().to_string(), desc.digest().to_string());

        assert!(matches!(
            reopened.resolve("v2").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_retag_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = OciDir::create(dir.path().join("layout")).await.unwrap();
        let a = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, b"aa").unwrap();
        let b = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, b"bb").unwrap();
        store.tag(&a, "v1").await.unwrap();
        store.tag(&b, "v1").await.unwrap();

        let index = store.read_index().await.unwrap();
        assert_eq!(index.manifests().len(), 1);
        assert_eq!(
            index.manifests()[0].digest().to_string(),
            b.digest().to_string()
        );
        assert_eq!(ref_name(&index.manifests()[0]), Some("v1"));
    }

    #[tokio::test]
    async fn test_unsupported_layout_version() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("layout");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"0.9.0"}"#).unwrap();

        assert!(matches!(
            OciDir::open(&root).await,
            Err(Error::UnsupportedVersion(v)) if v == "0.9.0"
        ));
    }
}
