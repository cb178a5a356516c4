use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    distribution::Reference,
    image::{Descriptor, Digest, ImageIndex},
};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use tokio::{io::AsyncReadExt, sync::RwLock};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    descriptor::{digest_bytes, verify_bytes},
    error::Error,
    manifest,
    store::{ByteStream, ReadOnlyStorage, ReferenceFetcher, ReferrerLister, Storage, TagStore},
    verify::VerifyReader,
};

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const WARNING_HEADER: &str = "warning";
const OCI_ERROR_CODE_UNSUPPORTED: &str = "UNSUPPORTED";

const ACCEPT_ANY_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.oci.artifact.manifest.v1+json";

const SCOPE_PULL: &str = "pull";
const SCOPE_PULL_PUSH: &str = "pull,push";

#[derive(Debug)]
pub enum Auth {
    None,
    UserPass(String, String),
}

/// registry domain -> credentials
pub type AuthMap = BTreeMap<String, Auth>;

// one token per registry+repo; ghcr for example hands out tokens that work
// across repos but we do not rely on that
#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenCacheKey(String);

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    auth: AuthMap,
    plain_http: Vec<String>,
}

impl ClientBuilder {
    pub fn auth(mut self, auth: AuthMap) -> ClientBuilder {
        self.auth = auth;
        self
    }

    /// Talk plain http to this registry (local registries mostly).
    pub fn plain_http(mut self, registry: impl Into<String>) -> ClientBuilder {
        self.plain_http.push(registry.into());
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(4))
            .https_only(self.plain_http.is_empty())
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(1_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        Ok(Client {
            client,
            token_cache,
            auth_store: Arc::new(ArcSwap::from_pointee(self.auth)),
            plain_http: Arc::new(self.plain_http.into_iter().collect()),
        })
    }
}

// Shared transport for any number of Repository handles. Clone is cheap and
// everything takes &self.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
    auth_store: Arc<ArcSwap<AuthMap>>,
    plain_http: Arc<BTreeSet<String>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn new() -> Result<Client, Error> {
        Client::builder().build()
    }

    pub async fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    fn scheme_for(&self, registry: &str) -> &'static str {
        if self.plain_http.contains(registry) {
            "http"
        } else {
            "https"
        }
    }

    /// Liveness and auth probe; a registry answering the /v2/ endpoint with
    /// 200 or an auth challenge is alive.
    pub async fn ping(&self, registry: &str) -> Result<(), Error> {
        let url = format!("{}://{}/v2/", self.scheme_for(registry), registry);
        trace!("GET {url}");
        let res = self.client.request(Method::GET, &url).send().await?;
        match res.status() {
            StatusCode::OK | StatusCode::UNAUTHORIZED => Ok(()),
            status => Err(Error::StatusNotOk(status)),
        }
    }

    /// Handle for one repository, e.g. `ghcr.io/org/thing`. Tags and digests
    /// in `name` are ignored; references are per-operation.
    pub fn repository(&self, name: &str) -> Result<Repository, Error> {
        let reference: Reference = name
            .parse()
            .map_err(|_| Error::InvalidReference(name.to_string()))?;
        let registry = reference.resolve_registry().to_string();
        let scheme = self.scheme_for(&registry);
        Ok(Repository {
            client: self.clone(),
            registry,
            repository: reference.repository().to_string(),
            scheme,
            referrers_support: Arc::new(RwLock::new(None)),
        })
    }
}

/// A single repository on a registry, speaking the distribution v2 protocol.
/// Implements the CAS traits so the copy engine can use it as either side.
#[derive(Clone)]
pub struct Repository {
    client: Client,
    registry: String,
    repository: String,
    scheme: &'static str,
    // whether the referrers API answered; decided once per handle
    referrers_support: Arc<RwLock<Option<bool>>>,
}

impl Repository {
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    fn url(&self, tail: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}",
            self.scheme, self.registry, self.repository, tail
        )
    }

    fn absolute_url(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{}{}", self.scheme, self.registry, location)
        }
    }

    fn cache_key(&self) -> TokenCacheKey {
        TokenCacheKey(format!("{}/{}", self.registry, self.repository))
    }

    // attach the cached token if any, send, and on a 401 fetch a token for
    // the challenge and retry once. Streaming-body requests cannot be
    // cloned, those attach whatever token is cached and live with the
    // answer.
    async fn send(&self, req: reqwest::RequestBuilder, scope: &str) -> Result<Response, Error> {
        let retry = req.try_clone();
        let mut req = req;
        if let Some(token) = self.client.token_cache.get(&self.cache_key()).await {
            req = req.bearer_auth(token.token);
        }
        let res = req.send().await?;
        log_warnings(&res);
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }
        let Some(retry) = retry else {
            return Ok(res);
        };
        let Some(challenge) = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_www_authenticate_header)
        else {
            return Ok(res);
        };
        // whatever we had was not good enough
        self.client.token_cache.invalidate(&self.cache_key()).await;
        let token = self.token_for(&challenge, scope).await?;
        let res = retry.bearer_auth(token.token).send().await?;
        log_warnings(&res);
        Ok(res)
    }

    async fn token_for(&self, challenge: &Challenge, scope: &str) -> Result<Token, Error> {
        // the challenge names the scope it wants; fall back to the verb we
        // were going to ask for
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:{}", self.repository, scope));
        let auth = match self.client.auth_store.load().get(&self.registry) {
            Some(Auth::UserPass(user, pass)) => Some((user.clone(), pass.clone())),
            // no credentials is fine, most registries hand out anonymous
            // pull tokens
            Some(Auth::None) | None => None,
        };
        let entry = self
            .client
            .token_cache
            .entry(self.cache_key())
            .or_try_insert_with(fetch_token(
                self.client.client.clone(),
                challenge.realm.clone(),
                challenge.service.clone(),
                scope,
                auth,
            ))
            .await
            .map_err(Error::Shared)?;
        if entry.is_fresh() {
            trace!("got new token for {}", self.name());
        }
        Ok(entry.into_value())
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<(), Error> {
        let url = self.url(&format!("manifests/{reference}"));
        trace!("PUT {url}");
        let req = self
            .client
            .client
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, media_type)
            .body(data);
        let res = self.send(req, SCOPE_PULL_PUSH).await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(registry_error(res).await)
        }
    }

    async fn push_blob(
        &self,
        desc: &Descriptor,
        content: VerifyReader<ByteStream>,
    ) -> Result<(), Error> {
        let url = self.url("blobs/uploads/");
        trace!("POST {url}");
        let req = self.client.client.request(Method::POST, &url);
        let res = self.send(req, SCOPE_PULL_PUSH).await?;
        let location = match res.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED => self.upload_location(&res)?,
            _ => return Err(registry_error(res).await),
        };

        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={}", desc.digest());
        trace!("PUT {put_url}");
        let stream = ReaderStream::new(content);
        let mut req = self
            .client
            .client
            .request(Method::PUT, &put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, desc.size())
            .body(reqwest::Body::wrap_stream(stream));
        if let Some(token) = self.client.token_cache.get(&self.cache_key()).await {
            req = req.bearer_auth(token.token);
        }
        let res = req.send().await?;
        log_warnings(&res);
        match res.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                // believable only when the registry reports our digest back
                let have = docker_content_digest(&res).ok().flatten();
                if have.as_ref() == Some(desc.digest()) {
                    Ok(())
                } else {
                    Err(registry_error(res).await)
                }
            }
            _ => Err(registry_error(res).await),
        }
    }

    fn upload_location(&self, res: &Response) -> Result<String, Error> {
        let value = res
            .headers()
            .get(header::LOCATION)
            .ok_or(Error::MissingLocation)?;
        let location = value.to_str().map_err(|_| Error::MissingLocation)?;
        Ok(self.absolute_url(location))
    }

    async fn referrers_by_api(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Option<Vec<Descriptor>>, Error> {
        let mut url = self.url(&format!("referrers/{}", subject.digest()));
        if let Some(artifact_type) = artifact_type {
            url = format!("{url}?artifactType={artifact_type}");
        }
        let mut out = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            trace!("GET {url}");
            let req = self
                .client
                .client
                .request(Method::GET, &url)
                .header(header::ACCEPT, manifest::MEDIA_TYPE_IMAGE_INDEX);
            let res = self.send(req, SCOPE_PULL).await?;
            match res.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => return Ok(None),
                _ => {
                    let err = registry_error(res).await;
                    if let Error::Registry { code, .. } = &err {
                        if code == OCI_ERROR_CODE_UNSUPPORTED {
                            return Ok(None);
                        }
                    }
                    return Err(err);
                }
            }
            next = res
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_link_next)
                .map(|l| self.absolute_url(l));
            let data = res.bytes().await?;
            let index = ImageIndex::from_reader(Cursor::new(data.as_ref()))
                .map_err(|e| Error::InvalidMediaType(e.to_string()))?;
            out.extend(index.manifests().iter().cloned());
        }
        Ok(Some(out))
    }

    // fallback for registries without the referrers endpoint: the subject
    // digest doubles as a tag, colon swapped for a dash
    async fn referrers_by_tag(&self, subject: &Descriptor) -> Result<Vec<Descriptor>, Error> {
        let tag = referrer_tag(subject.digest());
        match self.fetch_reference(&tag).await {
            Ok((desc, data)) => {
                if desc.media_type().to_string() != manifest::MEDIA_TYPE_IMAGE_INDEX {
                    return Ok(Vec::new());
                }
                let index = ImageIndex::from_reader(Cursor::new(data.as_ref()))
                    .map_err(|e| Error::InvalidMediaType(e.to_string()))?;
                Ok(index.manifests().clone())
            }
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ReadOnlyStorage for Repository {
    async fn exists(&self, desc: &Descriptor) -> Result<bool, Error> {
        let media_type = desc.media_type().to_string();
        let req = if manifest::is_manifest(&media_type) {
            self.client
                .client
                .request(
                    Method::HEAD,
                    self.url(&format!("manifests/{}", desc.digest())),
                )
                .header(header::ACCEPT, media_type)
        } else {
            self.client.client.request(
                Method::HEAD,
                self.url(&format!("blobs/{}", desc.digest())),
            )
        };
        let res = self.send(req, SCOPE_PULL).await?;
        match res.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(registry_error(res).await),
        }
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream, Error> {
        let media_type = desc.media_type().to_string();
        let req = if manifest::is_manifest(&media_type) {
            self.client
                .client
                .request(
                    Method::GET,
                    self.url(&format!("manifests/{}", desc.digest())),
                )
                .header(header::ACCEPT, media_type)
        } else {
            self.client.client.request(
                Method::GET,
                self.url(&format!("blobs/{}", desc.digest())),
            )
        };
        let res = self.send(req, SCOPE_PULL).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            _ => return Err(registry_error(res).await),
        }
        let stream = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let stream: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>> = Box::pin(stream);
        Ok(Box::new(StreamReader::new(stream)))
    }
}

#[async_trait]
impl Storage for Repository {
    async fn push(&self, desc: &Descriptor, content: ByteStream) -> Result<(), Error> {
        let media_type = desc.media_type().to_string();
        let verified = VerifyReader::new(content, desc)?;
        if manifest::is_manifest(&media_type) {
            let mut verified = verified;
            let mut data = Vec::with_capacity(desc.size().min(4 * 1024 * 1024) as usize);
            verified
                .read_to_end(&mut data)
                .await
                .map_err(Error::from_io)?;
            self.put_manifest(&desc.digest().to_string(), &media_type, data.into())
                .await
        } else {
            self.push_blob(desc, verified).await
        }
    }
}

#[async_trait]
impl TagStore for Repository {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        let url = self.url(&format!("manifests/{reference}"));
        trace!("HEAD {url}");
        let req = self
            .client
            .client
            .request(Method::HEAD, &url)
            .header(header::ACCEPT, ACCEPT_ANY_MANIFEST);
        let res = self.send(req, SCOPE_PULL).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            _ => return Err(registry_error(res).await),
        }
        let media_type = content_type(&res)?;
        let digest = if let Ok(digest) = reference.parse::<Digest>() {
            Some(digest)
        } else {
            docker_content_digest(&res)?
        };
        let size = res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        match (digest, size) {
            (Some(digest), Some(size)) => {
                Ok(Descriptor::new(media_type.as_str().into(), size, digest))
            }
            // some registries omit the digest header, a GET settles it
            _ => {
                let (desc, _) = self.fetch_reference(reference).await?;
                Ok(desc)
            }
        }
    }

    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<(), Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        // no bytes supplied, refetch our own manifest by digest
        let (_, data) = self.fetch_reference(&desc.digest().to_string()).await?;
        self.put_manifest(reference, &desc.media_type().to_string(), data)
            .await
    }

    async fn tag_with_content(
        &self,
        desc: &Descriptor,
        content: Bytes,
        reference: &str,
    ) -> Result<(), Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        verify_bytes(desc.digest(), &content)?;
        self.put_manifest(reference, &desc.media_type().to_string(), content)
            .await
    }
}

#[async_trait]
impl ReferenceFetcher for Repository {
    async fn fetch_reference(&self, reference: &str) -> Result<(Descriptor, Bytes), Error> {
        if reference.is_empty() {
            return Err(Error::MissingReference);
        }
        let url = self.url(&format!("manifests/{reference}"));
        trace!("GET {url}");
        let req = self
            .client
            .client
            .request(Method::GET, &url)
            .header(header::ACCEPT, ACCEPT_ANY_MANIFEST);
        let res = self.send(req, SCOPE_PULL).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            _ => return Err(registry_error(res).await),
        }
        let media_type = content_type(&res)?;
        let expected = if let Ok(digest) = reference.parse::<Digest>() {
            Some(digest)
        } else {
            docker_content_digest(&res)?
        };
        let data = res.bytes().await?;
        let digest = match expected {
            Some(digest) => {
                verify_bytes(&digest, &data)?;
                digest
            }
            None => digest_bytes(&data),
        };
        Ok((
            Descriptor::new(media_type.as_str().into(), data.len() as u64, digest),
            data,
        ))
    }
}

#[async_trait]
impl ReferrerLister for Repository {
    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Option<Vec<Descriptor>>, Error> {
        let support = *self.referrers_support.read().await;
        let api = match support {
            Some(false) => None,
            _ => self.referrers_by_api(subject, artifact_type).await?,
        };
        let mut list = match api {
            Some(list) => {
                if support.is_none() {
                    *self.referrers_support.write().await = Some(true);
                }
                list
            }
            None => {
                if support.is_none() {
                    debug!(
                        "{} does not answer the referrers api, using the tag scheme",
                        self.registry
                    );
                    *self.referrers_support.write().await = Some(false);
                }
                self.referrers_by_tag(subject).await?
            }
        };
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

pub(crate) fn referrer_tag(digest: &Digest) -> String {
    digest.to_string().replace(':', "-")
}

struct Challenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

async fn fetch_token(
    client: reqwest::Client,
    realm: String,
    service: String,
    scope: String,
    auth: Option<(String, String)>,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct TokenResponse {
        token: Option<String>,
        // some token servers speak oauth2
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    trace!("GET {realm} scope={scope}");
    let mut req = client
        .request(Method::GET, &realm)
        .query(&[("scope", scope.as_str()), ("service", service.as_str())]);
    if let Some((user, pass)) = auth {
        req = req.basic_auth(user, Some(pass));
    }
    let res = req.send().await?;
    if !res.status().is_success() {
        return Err(Error::StatusNotOk(res.status()));
    }
    let body: TokenResponse = res.json().await?;
    let token = body
        .token
        .or(body.access_token)
        .ok_or(Error::InvalidAuth)?;
    // the token spec gives 60 seconds as the default lifetime
    let expires_in = Duration::from_secs(body.expires_in.unwrap_or(60).max(1));
    Ok(Token { token, expires_in })
}

fn content_type(res: &Response) -> Result<String, Error> {
    res.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::BadContentType("missing content type".to_string()))
}

fn docker_content_digest(res: &Response) -> Result<Option<Digest>, Error> {
    res.headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|value| -> Result<Digest, Error> {
            value
                .to_str()
                .map_err(|_| Error::BadDockerContentDigest)?
                .parse()
                .map_err(|_| Error::BadDockerContentDigest)
        })
        .transpose()
}

#[derive(Deserialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    code: String,
    #[serde(default)]
    message: String,
}

async fn registry_error(res: Response) -> Error {
    let status = res.status();
    match res.json::<ErrorBody>().await {
        Ok(body) => match body.errors.into_iter().next() {
            Some(entry) => {
                debug!(
                    "registry error status={status} code={} message={}",
                    entry.code, entry.message
                );
                Error::Registry {
                    code: entry.code,
                    message: entry.message,
                }
            }
            None => Error::StatusNotOk(status),
        },
        Err(_) => Error::StatusNotOk(status),
    }
}

fn log_warnings(res: &Response) {
    for value in res.headers().get_all(WARNING_HEADER).iter() {
        match value.to_str().ok().and_then(parse_warning_str) {
            Some(text) => warn!("registry warning: {text}"),
            None => debug!("ignoring unparseable warning header {:?}", value),
        }
    }
}

// the registry profile of the Warning header is exactly `299 - "text"`,
// anything looser is rejected
fn parse_warning_str(input: &str) -> Option<&str> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::char,
        combinator::eof,
        sequence::{delimited, preceded, terminated},
    };
    fn parser(input: &str) -> IResult<&str, &str> {
        terminated(
            preceded(
                tag("299 - "),
                delimited(char('"'), take_until1("\""), char('"')),
            ),
            eof,
        )
        .parse(input)
    }
    parser(input).ok().map(|(_, text)| text)
}

fn parse_www_authenticate_header(input: &HeaderValue) -> Option<Challenge> {
    parse_www_authenticate_str(input.to_str().ok()?)
}

fn parse_www_authenticate_str(input: &str) -> Option<Challenge> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, fields) = parser(input).ok()?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (key, value) in fields {
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(Challenge {
        realm: realm?.to_string(),
        service: service?.to_string(),
        scope: scope.map(str::to_string),
    })
}

// Link: </v2/repo/referrers/sha256:..?n=10&last=..>; rel="next"
fn parse_link_next(value: &str) -> Option<&str> {
    value.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        target.trim().strip_prefix('<')?.strip_suffix('>')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_parser_accepts_the_profile() {
        assert_eq!(parse_warning_str(r#"299 - "hello""#), Some("hello"));
        assert_eq!(
            parse_warning_str(r#"299 - "repo is deprecated, move""#),
            Some("repo is deprecated, move")
        );
    }

    #[test]
    fn test_warning_parser_rejects_deviations() {
        let cases = [
            r#"199 - "wrong code""#,
            r#"299 registry "wrong agent""#,
            r#"299 - unquoted"#,
            r#"299 - """#,
            r#" 299 - "leading whitespace""#,
            r#"299 - "trailing whitespace" "#,
            r#"299 - "text" extra"#,
            r#"299-"no spaces""#,
            "",
        ];
        for case in cases {
            assert_eq!(parse_warning_str(case), None, "{case:?}");
        }
    }

    #[test]
    fn test_www_authenticate() {
        let cases = [
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:lib/app:pull""#,
            r#"Bearer realm="https://auth.example.com/token", service="registry.example.com", scope="repository:lib/app:pull""#,
            r#"Bearer   scope="repository:lib/app:pull",realm="https://auth.example.com/token",service="registry.example.com""#,
        ];
        for case in cases {
            let challenge = parse_www_authenticate_str(case).unwrap();
            assert_eq!(challenge.realm, "https://auth.example.com/token", "{case}");
            assert_eq!(challenge.service, "registry.example.com", "{case}");
            assert_eq!(
                challenge.scope.as_deref(),
                Some("repository:lib/app:pull"),
                "{case}"
            );
        }
    }

    #[test]
    fn test_www_authenticate_without_scope() {
        let challenge = parse_www_authenticate_str(
            r#"Bearer realm="https://auth.example.com/token",service="svc""#,
        )
        .unwrap();
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn test_www_authenticate_requires_realm_and_service() {
        assert!(parse_www_authenticate_str(r#"Bearer service="svc""#).is_none());
        assert!(parse_www_authenticate_str(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn test_link_next() {
        assert_eq!(
            parse_link_next(r#"</v2/r/referrers/sha256:aa?last=x>; rel="next""#),
            Some("/v2/r/referrers/sha256:aa?last=x")
        );
        assert_eq!(
            parse_link_next(
                r#"</page1>; rel="prev", </v2/r/referrers/sha256:aa?n=2>; rel="next""#
            ),
            Some("/v2/r/referrers/sha256:aa?n=2")
        );
        assert_eq!(parse_link_next(r#"</page1>; rel="prev""#), None);
        assert_eq!(parse_link_next("garbage"), None);
    }

    #[test]
    fn test_referrer_tag() {
        let digest: Digest =
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                .parse()
                .unwrap();
        assert_eq!(
            referrer_tag(&digest),
            "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
