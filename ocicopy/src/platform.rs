use std::io::Cursor;

use log::debug;
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, Platform};

use crate::{
    error::Error,
    manifest::{
        MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_IMAGE_INDEX,
        MEDIA_TYPE_IMAGE_MANIFEST,
    },
    store::{ReadOnlyStorage, fetch_content},
};

// arch and os must be equal; variant and os version count only when the
// target asks for them; the target's os features must be a subset
pub fn platform_matches(target: &Platform, candidate: &Platform) -> bool {
    if target.architecture() != candidate.architecture() || target.os() != candidate.os() {
        return false;
    }
    if let Some(variant) = target.variant() {
        if candidate.variant().as_ref() != Some(variant) {
            return false;
        }
    }
    if let Some(os_version) = target.os_version() {
        if candidate.os_version().as_ref() != Some(os_version) {
            return false;
        }
    }
    if let Some(wanted) = target.os_features() {
        let have = candidate.os_features().clone().unwrap_or_default();
        if !wanted.iter().all(|f| have.contains(f)) {
            return false;
        }
    }
    true
}

fn config_matches(target: &Platform, config: &ImageConfiguration) -> bool {
    if target.architecture() != config.architecture() || target.os() != config.os() {
        return false;
    }
    if let Some(variant) = target.variant() {
        if config.variant().as_ref() != Some(variant) {
            return false;
        }
    }
    if let Some(os_version) = target.os_version() {
        if config.os_version().as_ref() != Some(os_version) {
            return false;
        }
    }
    if let Some(wanted) = target.os_features() {
        let have = config.os_features().clone().unwrap_or_default();
        if !wanted.iter().all(|f| have.contains(f)) {
            return false;
        }
    }
    true
}

/// Select the manifest matching `target` starting from `root`. An index
/// yields its first matching entry in declaration order, which is stable and
/// part of the contract. A plain manifest is checked against its config.
pub async fn select_platform<S: ReadOnlyStorage + ?Sized>(
    store: &S,
    root: &Descriptor,
    target: Option<&Platform>,
) -> Result<Descriptor, Error> {
    let media_type = root.media_type().to_string();
    match media_type.as_str() {
        MEDIA_TYPE_IMAGE_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => {
            let Some(target) = target else {
                return Ok(root.clone());
            };
            let data = fetch_content(store, root).await?;
            let manifest = ImageManifest::from_reader(Cursor::new(data.as_ref()))?;
            let config_data = fetch_content(store, manifest.config()).await?;
            let config = ImageConfiguration::from_reader(Cursor::new(config_data.as_ref()))?;
            if config_matches(target, &config) {
                Ok(root.clone())
            } else {
                debug!("platform does not match manifest {}", root.digest());
                Err(Error::NotFound)
            }
        }
        MEDIA_TYPE_IMAGE_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
            let data = fetch_content(store, root).await?;
            let index = ImageIndex::from_reader(Cursor::new(data.as_ref()))?;
            match target {
                Some(target) => index
                    .manifests()
                    .iter()
                    .find(|m| {
                        m.platform()
                            .as_ref()
                            .map(|p| platform_matches(target, p))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .ok_or(Error::NotFound),
                None => {
                    if index.manifests().iter().all(|m| m.platform().is_none()) {
                        index.manifests().first().cloned().ok_or(Error::NotFound)
                    } else {
                        Err(Error::NotFound)
                    }
                }
            }
        }
        _ => Err(Error::Unsupported(media_type)),
    }
}
