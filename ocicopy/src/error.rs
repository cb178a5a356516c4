use std::sync::Arc;

use crate::copy::CopyError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotFound,
    AlreadyExists,
    InvalidDigest,
    InvalidReference(String),
    InvalidMediaType(String),
    MissingMediaType,
    MissingReference,
    MismatchedDigest,
    TrailingData,
    SizeExceedsLimit { size: u64, limit: u64 },
    Unsupported(String),
    UnsupportedVersion(String),
    Canceled,
    UnexpectedPanic,
    Unknown,
    InvalidAuth,
    BadDockerContentDigest,
    BadContentType(String),
    MissingLocation,
    StatusNotOk(reqwest::StatusCode),
    Registry { code: String, message: String },
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    Reqwest(#[from] reqwest::Error),
    Copy(Box<CopyError>),
    Shared(Arc<Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    // round-trip through std::io::Error so AsyncRead adapters can carry us
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }

    pub(crate) fn from_io(e: std::io::Error) -> Error {
        let kind = e.kind();
        match e.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(err) => *err,
                Err(other) => Error::Io(std::io::Error::new(kind, other)),
            },
            None => Error::Io(kind.into()),
        }
    }

    pub(crate) fn flatten(mut e: Arc<Error>) -> Arc<Error> {
        loop {
            match &*e {
                Error::Shared(inner) => {
                    let inner = inner.clone();
                    e = inner;
                }
                _ => return e,
            }
        }
    }
}
