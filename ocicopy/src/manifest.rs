use std::collections::HashMap;
use std::io::Cursor;

use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use serde::Deserialize;

use crate::error::Error;

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";

/// The pieces of a manifest the copy engine cares about. Unknown media types
/// parse to the default value, meaning "leaf blob".
#[derive(Debug, Default, Clone)]
pub struct Parsed {
    pub subject: Option<Descriptor>,
    pub config: Option<Descriptor>,
    pub children: Vec<Descriptor>,
    pub artifact_type: Option<String>,
    pub annotations: Option<HashMap<String, String>>,
}

// the artifact manifest was dropped from the image spec (and from oci-spec)
// before 1.1 went final but registries still serve them
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactManifest {
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    blobs: Vec<Descriptor>,
    #[serde(default)]
    subject: Option<Descriptor>,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

pub fn is_manifest(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_IMAGE_MANIFEST
            | MEDIA_TYPE_IMAGE_INDEX
            | MEDIA_TYPE_DOCKER_MANIFEST
            | MEDIA_TYPE_DOCKER_MANIFEST_LIST
            | MEDIA_TYPE_ARTIFACT_MANIFEST
    )
}

pub fn parse(media_type: &str, data: &[u8]) -> Result<Parsed, Error> {
    match media_type {
        MEDIA_TYPE_IMAGE_MANIFEST => {
            let manifest = ImageManifest::from_reader(Cursor::new(data)).map_err(invalid)?;
            Ok(Parsed {
                subject: manifest.subject().clone(),
                config: Some(manifest.config().clone()),
                children: manifest.layers().clone(),
                artifact_type: manifest.artifact_type().as_ref().map(|t| t.to_string()),
                annotations: manifest.annotations().clone(),
            })
        }
        // schema-compatible with the OCI manifest but docker never grew
        // subject or artifactType
        MEDIA_TYPE_DOCKER_MANIFEST => {
            let manifest = ImageManifest::from_reader(Cursor::new(data)).map_err(invalid)?;
            Ok(Parsed {
                subject: None,
                config: Some(manifest.config().clone()),
                children: manifest.layers().clone(),
                artifact_type: None,
                annotations: manifest.annotations().clone(),
            })
        }
        MEDIA_TYPE_IMAGE_INDEX => {
            let index = ImageIndex::from_reader(Cursor::new(data)).map_err(invalid)?;
            Ok(Parsed {
                subject: index.subject().clone(),
                config: None,
                children: index.manifests().clone(),
                artifact_type: index.artifact_type().as_ref().map(|t| t.to_string()),
                annotations: index.annotations().clone(),
            })
        }
        MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
            let index = ImageIndex::from_reader(Cursor::new(data)).map_err(invalid)?;
            Ok(Parsed {
                subject: None,
                config: None,
                children: index.manifests().clone(),
                artifact_type: None,
                annotations: index.annotations().clone(),
            })
        }
        MEDIA_TYPE_ARTIFACT_MANIFEST => {
            let manifest: ArtifactManifest =
                serde_json::from_slice(data).map_err(|e| Error::InvalidMediaType(e.to_string()))?;
            Ok(Parsed {
                subject: manifest.subject,
                config: None,
                children: manifest.blobs,
                artifact_type: manifest.artifact_type,
                annotations: manifest.annotations,
            })
        }
        _ => Ok(Parsed::default()),
    }
}

fn invalid(e: oci_spec::OciSpecError) -> Error {
    Error::InvalidMediaType(e.to_string())
}
