use std::pin::Pin;
use std::task::{Context, Poll, ready};

use oci_spec::image::{Descriptor, DigestAlgorithm};
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::Error;

enum Hasher {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn matches(&mut self, expected_hex: &str) -> bool {
        use sha2::Digest;
        let hex = match self {
            Hasher::Sha256(h) => hex::encode(h.finalize_reset()),
            Hasher::Sha512(h) => hex::encode(h.finalize_reset()),
        };
        hex == expected_hex
    }
}

// Wraps a stream leaving a CAS so that nothing unverified reaches the rest of
// the system. Reading past the declared size fails with TrailingData; a short
// stream or wrong bytes fail with MismatchedDigest once the stream ends. The
// errors ride inside std::io::Error, Error::from_io gets them back out.
pub struct VerifyReader<R> {
    inner: R,
    hasher: Hasher,
    expected: String,
    size: u64,
    seen: u64,
    finished: bool,
}

impl<R> VerifyReader<R> {
    pub fn new(inner: R, descriptor: &Descriptor) -> Result<VerifyReader<R>, Error> {
        use sha2::Digest;
        let hasher = match descriptor.digest().algorithm() {
            DigestAlgorithm::Sha256 => Hasher::Sha256(Box::new(Sha256::new())),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Box::new(Sha512::new())),
            algo => return Err(Error::Unsupported(format!("digest algorithm {algo}"))),
        };
        Ok(VerifyReader {
            inner,
            hasher,
            expected: descriptor.digest().digest().to_string(),
            size: descriptor.size(),
            seen: 0,
            finished: false,
        })
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut me.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        if chunk.is_empty() {
            // end of stream, settle the verdict exactly once
            if !me.finished {
                me.finished = true;
                if me.seen != me.size || !me.hasher.matches(&me.expected) {
                    return Poll::Ready(Err(Error::MismatchedDigest.into_io()));
                }
            }
            return Poll::Ready(Ok(()));
        }
        me.seen += chunk.len() as u64;
        if me.seen > me.size {
            return Poll::Ready(Err(Error::TrailingData.into_io()));
        }
        me.hasher.update(chunk);
        Poll::Ready(Ok(()))
    }
}
