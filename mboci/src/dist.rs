use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::TryStreamExt;
use log::{debug, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    distribution::Reference,
    image::{Descriptor, DescriptorBuilder, ImageManifest, ImageManifestBuilder, MediaType},
};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use mbblob::BlobStore;
use mbcas::{Cas, LinkMode};
use mbdigest::Digest;

use crate::index::{BUNDLE_INDEX_MEDIA_TYPE, BundleIndex, FileEntry, StorageKind};

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
#[allow(dead_code)]
const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_IMAGE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
const LAYER_MEDIA_TYPE: &str = "application/octet-stream";
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

// we accept everything and reject indexes after looking at what came back,
// so the error can name the media type instead of being a bare 404
const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TRANSFER_CONCURRENCY: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    Digest(#[from] mbdigest::Error),
    Index(#[from] crate::index::Error),
    Json(#[from] serde_json::Error),
    Io(#[from] std::io::Error),
    Blob(mbblob::Error),
    Cas(mbcas::Error),
    NoTagOrDigest(String),
    BadDockerContentDigest,
    DigestMismatch {
        name: String,
        expected: Digest,
        actual: Digest,
    },
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    UnsupportedArtifact {
        reference: String,
        media_type: String,
    },
    MissingIndex(String),
    NotFound(String),
    BlobNotFound(String),
    Auth(String),
    StatusNotOk(StatusCode),
    UploadRejected(StatusCode),
    MissingUploadLocation,
    RequestNotRetryable,
    BlobStoreRequired(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<mbblob::Error> for Error {
    fn from(e: mbblob::Error) -> Error {
        Error::Blob(e)
    }
}

impl From<mbcas::Error> for Error {
    fn from(e: mbcas::Error) -> Error {
        Error::Cas(e)
    }
}

// ---- auth ------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    UserPass(String, String),
}

pub type AuthMap = BTreeMap<String, Auth>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TokenScope {
    Pull,
    Push,
}

impl TokenScope {
    fn actions(self) -> &'static str {
        match self {
            TokenScope::Pull => "pull",
            TokenScope::Push => "pull,push",
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenCacheKey(String);

fn token_key(reference: &Reference, scope: TokenScope) -> TokenCacheKey {
    TokenCacheKey(format!(
        "{}/{}#{}",
        reference.resolve_registry(),
        reference.repository(),
        scope.actions()
    ))
}

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
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

struct BearerChallenge<'a> {
    realm: &'a str,
    service: &'a str,
}

fn parse_bearer_challenge(input: &HeaderValue) -> Option<BearerChallenge<'_>> {
    parse_bearer_challenge_str(input.to_str().ok()?)
}

fn parse_bearer_challenge_str(input: &str) -> Option<BearerChallenge<'_>> {
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
    let (_, matches) = parser(input).ok()?;
    let mut realm = None;
    let mut service = None;
    for (k, v) in matches {
        match k {
            "realm" => realm = Some(v),
            "service" => service = Some(v),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
    })
}

async fn fetch_token(
    client: reqwest::Client,
    reference: &Reference,
    scope: TokenScope,
    challenge: &BearerChallenge<'_>,
    auth: Auth,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let scope = format!("repository:{}:{}", reference.repository(), scope.actions());
    let mut req = client
        .request(Method::GET, challenge.realm)
        .query(&[("scope", scope.as_str()), ("service", challenge.service)]);
    if let Auth::UserPass(user, pass) = &auth {
        req = req.basic_auth(user, Some(pass));
    }
    let json = req.send().await?.json::<JsonToken>().await?;

    let token = json
        .token
        .or(json.access_token)
        .ok_or_else(|| Error::Auth("token endpoint returned no token".to_string()))?;
    // token response spec gives 60s as the default lifetime
    let expires_in = Duration::from_secs(json.expires_in.unwrap_or(60));
    Ok(Token { token, expires_in })
}

// ---- client ----------------------------------------------------------------

/// One file riding as an OCI layer in a push.
#[derive(Debug, Clone)]
pub struct PushLayer {
    pub path: String,
    pub digest: Digest,
    pub size: u64,
    pub source: PathBuf,
}

pub struct ClientBuilder {
    insecure: bool,
    auth: AuthMap,
    max_retries: u32,
    transfer_concurrency: usize,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            insecure: false,
            auth: BTreeMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            transfer_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
        }
    }
}

impl ClientBuilder {
    /// Plain http for local registries.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn auth(mut self, auth: AuthMap) -> Self {
        self.auth = auth;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn transfer_concurrency(mut self, n: usize) -> Self {
        self.transfer_concurrency = n.max(1);
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::limited(4));
        if !self.insecure {
            builder = builder.https_only(true);
        }
        let client = builder.build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        Ok(Client {
            client,
            scheme: if self.insecure { "http" } else { "https" },
            token_cache,
            auth_store: Arc::new(ArcSwap::from_pointee(self.auth)),
            max_retries: self.max_retries,
            transfer_concurrency: self.transfer_concurrency,
        })
    }
}

/// OCI distribution client for bundle artifacts. Clone is cheap; everything
/// is interior-mutable behind Arcs, following the shape of moka's own Cache.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    scheme: &'static str,
    token_cache: Cache<TokenCacheKey, Token>,
    auth_store: Arc<ArcSwap<AuthMap>>,
    max_retries: u32,
    transfer_concurrency: usize,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    // ---- url helpers ----

    fn base_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}/v2/{}",
            self.scheme,
            reference.resolve_registry(),
            reference.repository()
        )
    }

    fn manifest_url(&self, reference: &Reference) -> Result<String, Error> {
        let r = reference
            .digest()
            .or_else(|| reference.tag())
            .ok_or_else(|| Error::NoTagOrDigest(reference.to_string()))?;
        Ok(format!("{}/manifests/{}", self.base_url(reference), r))
    }

    fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.base_url(reference), digest)
    }

    // ---- request plumbing ----

    /// Send with the bearer-token dance: attach a cached token if we have
    /// one, and on 401 parse the WWW-Authenticate challenge, fetch a token,
    /// and replay the request once.
    async fn auth_and_send(
        &self,
        reference: &Reference,
        scope: TokenScope,
        mut req: reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        // bodies are always Bytes here so the clone never fails in practice
        let req_copy = req.try_clone().ok_or(Error::RequestNotRetryable)?;

        let key = token_key(reference, scope);
        if let Some(token) = self.token_cache.get(&key).await {
            req = req.bearer_auth(token.token);
        }

        let res = req.send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let Some(challenge) = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_bearer_challenge)
        else {
            return Err(Error::Auth(format!(
                "401 from {} without a usable www-authenticate challenge; check credentials",
                reference.resolve_registry()
            )));
        };

        let auth = self
            .auth_store
            .load()
            .get(reference.resolve_registry())
            .cloned()
            .unwrap_or(Auth::None);
        let entry = self
            .token_cache
            .entry(key)
            .or_try_insert_with(fetch_token(
                self.client.clone(),
                reference,
                scope,
                &challenge,
                auth,
            ))
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;
        if entry.is_fresh() {
            trace!("got new token for {}", entry.key().0);
        }

        let res = req_copy.bearer_auth(entry.into_value().token).send().await?;
        Ok(res)
    }

    /// Transport errors and 5xx retry with capped exponential backoff; 4xx
    /// never retries. `make` rebuilds the request for each attempt.
    async fn send_with_retry(
        &self,
        reference: &Reference,
        scope: TokenScope,
        make: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        let mut attempt = 0;
        loop {
            let result = self.auth_and_send(reference, scope, make()).await;
            let retryable = match &result {
                Ok(res) => res.status().is_server_error(),
                Err(Error::Reqwest(_)) => true,
                Err(_) => false,
            };
            if retryable && attempt < self.max_retries {
                let delay = backoff(attempt);
                warn!(
                    "request to {} failed (attempt {}), retrying in {:?}",
                    reference.resolve_registry(),
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return result;
        }
    }

    // ---- read side ----

    /// Resolve whatever the reference names to a manifest digest. A digest
    /// reference short-circuits; a tag goes through HEAD first and falls back
    /// to GET for registries that do not honor HEAD.
    pub async fn resolve_tag_to_digest(&self, reference: &Reference) -> Result<Digest, Error> {
        if let Some(d) = reference.digest() {
            return Ok(d.parse()?);
        }
        let url = self.manifest_url(reference)?;
        trace!("HEAD {url}");
        let res = self
            .send_with_retry(reference, TokenScope::Pull, || {
                self.client
                    .request(Method::HEAD, &url)
                    .header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;
        match res.status() {
            StatusCode::OK => {
                if let Some(digest) = docker_content_digest(&res)? {
                    return Ok(digest);
                }
                // no digest header on HEAD; the GET path computes one
            }
            StatusCode::NOT_FOUND => return Err(Error::NotFound(reference.to_string())),
            status => {
                debug!("HEAD {} returned {}, falling back to GET", url, status);
            }
        }
        let (_, digest, _) = self.get_manifest_raw(reference).await?;
        Ok(digest)
    }

    async fn get_manifest_raw(
        &self,
        reference: &Reference,
    ) -> Result<(String, Digest, Bytes), Error> {
        let url = self.manifest_url(reference)?;
        trace!("GET {url}");
        let res = self
            .send_with_retry(reference, TokenScope::Pull, || {
                self.client
                    .request(Method::GET, &url)
                    .header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(reference.to_string())),
            status if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                return Err(Error::Auth(format!("{status} for {reference}")));
            }
            status => return Err(Error::StatusNotOk(status)),
        }

        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let header_digest = if let Some(d) = reference.digest() {
            Some(d.parse()?)
        } else {
            docker_content_digest(&res)?
        };
        let data = res.bytes().await?;
        let digest = match header_digest {
            Some(expected) => {
                let actual = Digest::from_bytes(&data);
                if actual != expected {
                    return Err(Error::DigestMismatch {
                        name: reference.to_string(),
                        expected,
                        actual,
                    });
                }
                expected
            }
            None => {
                warn!(
                    "registry did not return {} for {}; using digest of the raw manifest bytes",
                    DOCKER_CONTENT_DIGEST_HEADER, reference
                );
                Digest::from_bytes(&data)
            }
        };
        Ok((content_type, digest, data))
    }

    /// Fetch and parse the manifest, refusing multi-platform artifacts.
    pub async fn get_manifest_with_digest(
        &self,
        reference: &Reference,
    ) -> Result<(ImageManifest, Digest, Bytes), Error> {
        let (content_type, digest, data) = self.get_manifest_raw(reference).await?;
        if is_index_media_type(&content_type) {
            return Err(Error::UnsupportedArtifact {
                reference: reference.to_string(),
                media_type: content_type,
            });
        }
        let manifest = ImageManifest::from_reader(Cursor::new(&data))?;
        // some registries omit content-type; the parsed mediaType still tells
        if let Some(mt) = manifest.media_type() {
            let mt = mt.to_string();
            if is_index_media_type(&mt) {
                return Err(Error::UnsupportedArtifact {
                    reference: reference.to_string(),
                    media_type: mt,
                });
            }
        }
        Ok((manifest, digest, data))
    }

    /// Fetch the bundle index (the manifest's config blob). Artifacts whose
    /// config is not a bundle index are refused outright.
    pub async fn get_index(&self, reference: &Reference) -> Result<BundleIndex, Error> {
        let (manifest, _digest, _raw) = self.get_manifest_with_digest(reference).await?;
        let config = manifest.config();
        if config.media_type().to_string() != BUNDLE_INDEX_MEDIA_TYPE {
            debug!(
                "config media type {} is not a bundle index",
                config.media_type()
            );
            return Err(Error::MissingIndex(reference.to_string()));
        }
        let expected: Digest = config.digest().to_string().parse()?;
        let data = self.get_blob_bytes(reference, &expected).await?;
        BundleIndex::from_slice(&data).map_err(|e| {
            warn!("config blob of {} did not decode as an index: {}", reference, e);
            Error::MissingIndex(reference.to_string())
        })
    }

    pub async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct TagList {
            #[allow(dead_code)]
            name: Option<String>,
            tags: Option<Vec<String>>,
        }
        let url = format!("{}/tags/list", self.base_url(reference));
        trace!("GET {url}");
        let res = self
            .send_with_retry(reference, TokenScope::Pull, || {
                self.client.request(Method::GET, &url)
            })
            .await?;
        match res.status() {
            StatusCode::OK => Ok(res.json::<TagList>().await?.tags.unwrap_or_default()),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(Error::StatusNotOk(status)),
        }
    }

    /// Small blob straight to memory, digest-verified. Used for config blobs.
    async fn get_blob_bytes(&self, reference: &Reference, digest: &Digest) -> Result<Bytes, Error> {
        let url = self.blob_url(reference, digest);
        trace!("GET {url}");
        let res = self
            .send_with_retry(reference, TokenScope::Pull, || {
                self.client.request(Method::GET, &url)
            })
            .await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::BlobNotFound(digest.to_string())),
            status => return Err(Error::StatusNotOk(status)),
        }
        let data = res.bytes().await?;
        let actual = Digest::from_bytes(&data);
        if actual != *digest {
            return Err(Error::DigestMismatch {
                name: digest.to_string(),
                expected: *digest,
                actual,
            });
        }
        Ok(data)
    }

    /// Stream a blob to a file, hashing incrementally; the write only
    /// survives if the digest checks out.
    async fn download_blob_to(
        &self,
        reference: &Reference,
        digest: &Digest,
        dest: &Path,
    ) -> Result<u64, Error> {
        use sha2::Digest as _;
        let url = self.blob_url(reference, digest);
        trace!("GET {url}");
        let mut res = self
            .send_with_retry(reference, TokenScope::Pull, || {
                self.client.request(Method::GET, &url)
            })
            .await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::BlobNotFound(digest.to_string())),
            status => return Err(Error::StatusNotOk(status)),
        }

        let file = tokio::fs::File::create(dest).await?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut hasher = sha2::Sha256::new();
        let mut len: u64 = 0;
        while let Some(chunk) = res.chunk().await? {
            hasher.update(&chunk);
            len += chunk.len() as u64;
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        let actual = Digest::Sha256(hasher.finalize().into());
        if actual != *digest {
            let _ = std::fs::remove_file(dest);
            return Err(Error::DigestMismatch {
                name: digest.to_string(),
                expected: *digest,
                actual,
            });
        }
        Ok(len)
    }

    // ---- write side ----

    /// Upload layers and the index config blob, then put a manifest that
    /// binds them under `tag`. Returns the manifest's canonical digest as the
    /// registry reports it.
    pub async fn push_with_index_config(
        &self,
        reference: &Reference,
        index: &BundleIndex,
        layers: &[PushLayer],
        manifest_annotations: &BTreeMap<String, String>,
    ) -> Result<Digest, Error> {
        futures::stream::iter(layers.iter().map(Ok))
            .try_for_each_concurrent(self.transfer_concurrency, |layer| async move {
                let data = Bytes::from(tokio::fs::read(&layer.source).await?);
                let actual = Digest::from_bytes(&data);
                if actual != layer.digest {
                    // the file changed between planning and apply
                    return Err(Error::DigestMismatch {
                        name: layer.path.clone(),
                        expected: layer.digest,
                        actual,
                    });
                }
                self.ensure_blob_uploaded(reference, &layer.digest, data).await
            })
            .await?;

        let config_bytes = Bytes::from(index.canonical_bytes());
        let config_digest = Digest::from_bytes(&config_bytes);
        self.ensure_blob_uploaded(reference, &config_digest, config_bytes.clone())
            .await?;

        let manifest = build_manifest(
            &config_digest,
            config_bytes.len() as u64,
            layers,
            manifest_annotations,
        )?;
        let manifest_bytes = serde_json::to_vec(&manifest)?;

        let url = self.manifest_url(reference)?;
        trace!("PUT {url}");
        let res = self
            .send_with_retry(reference, TokenScope::Push, || {
                self.client
                    .request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, OCI_IMAGE_MANIFEST_V1)
                    .body(Bytes::from(manifest_bytes.clone()))
            })
            .await?;
        if !res.status().is_success() {
            return Err(Error::UploadRejected(res.status()));
        }
        match docker_content_digest(&res)? {
            Some(digest) => Ok(digest),
            None => {
                warn!(
                    "registry did not return {} for manifest put; using digest of the uploaded bytes",
                    DOCKER_CONTENT_DIGEST_HEADER
                );
                Ok(Digest::from_bytes(&manifest_bytes))
            }
        }
    }

    async fn ensure_blob_uploaded(
        &self,
        reference: &Reference,
        digest: &Digest,
        data: Bytes,
    ) -> Result<(), Error> {
        let blob_url = self.blob_url(reference, digest);
        trace!("HEAD {blob_url}");
        let res = self
            .send_with_retry(reference, TokenScope::Push, || {
                self.client.request(Method::HEAD, &blob_url)
            })
            .await?;
        if res.status() == StatusCode::OK {
            debug!("blob {} already on registry", digest.short());
            return Ok(());
        }

        let uploads_url = format!("{}/blobs/uploads/", self.base_url(reference));
        trace!("POST {uploads_url}");
        let res = self
            .send_with_retry(reference, TokenScope::Push, || {
                self.client
                    .request(Method::POST, &uploads_url)
                    .header(header::CONTENT_LENGTH, 0)
            })
            .await?;
        if !res.status().is_success() {
            return Err(Error::UploadRejected(res.status()));
        }
        let location = res
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingUploadLocation)?;
        let put_url = upload_put_url(
            self.scheme,
            reference.resolve_registry(),
            location,
            digest,
        );

        trace!("PUT {put_url}");
        let res = self
            .send_with_retry(reference, TokenScope::Push, || {
                self.client
                    .request(Method::PUT, &put_url)
                    .header(header::CONTENT_TYPE, LAYER_MEDIA_TYPE)
                    .header(header::CONTENT_LENGTH, data.len())
                    .body(data.clone())
            })
            .await?;
        if !res.status().is_success() {
            return Err(Error::UploadRejected(res.status()));
        }
        debug!("uploaded blob {} ({} bytes)", digest.short(), data.len());
        Ok(())
    }

    // ---- pull side ----

    /// Download the given entries into `dest_dir`, fanning out up to the
    /// transfer concurrency. OCI entries come from the registry, blob entries
    /// through `blob_store`. With a CAS, content is promoted into the cache
    /// first and materialized out of it; without one, every file goes through
    /// a digest-verified temp-then-rename in its destination directory.
    pub async fn pull_selected(
        &self,
        reference: &Reference,
        entries: &[FileEntry],
        dest_dir: &Path,
        blob_store: Option<&dyn BlobStore>,
        cas: Option<&Cas>,
        link_mode: LinkMode,
    ) -> Result<(), Error> {
        futures::stream::iter(entries.iter().map(Ok))
            .try_for_each_concurrent(self.transfer_concurrency, |entry| async move {
                self.pull_entry(reference, entry, dest_dir, blob_store, cas, link_mode)
                    .await
            })
            .await
    }

    async fn pull_entry(
        &self,
        reference: &Reference,
        entry: &FileEntry,
        dest_dir: &Path,
        blob_store: Option<&dyn BlobStore>,
        cas: Option<&Cas>,
        link_mode: LinkMode,
    ) -> Result<(), Error> {
        entry.validate()?;
        let dest = dest_dir.join(&entry.path);

        if let Some(cas) = cas {
            cas.ensure_present(&entry.digest, |tmp| async move {
                self.fetch_entry(reference, entry, blob_store, &tmp)
                    .await
                    .map_err(mbcas::Error::fetch)
            })
            .await?;
            cas.materialize(&entry.digest, &dest, link_mode, false)?;
            return Ok(());
        }

        let parent = dest
            .parent()
            .ok_or_else(|| Error::Io(std::io::Error::other(format!("no parent for {dest:?}"))))?;
        std::fs::create_dir_all(parent)?;
        let tmp = tempfile::Builder::new().prefix(".mb-").tempfile_in(parent)?;
        self.fetch_entry(reference, entry, blob_store, tmp.path())
            .await?;
        let actual = Digest::from_file(tmp.path())?;
        if actual != entry.digest {
            return Err(Error::DigestMismatch {
                name: entry.path.clone(),
                expected: entry.digest,
                actual,
            });
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    async fn fetch_entry(
        &self,
        reference: &Reference,
        entry: &FileEntry,
        blob_store: Option<&dyn BlobStore>,
        dest: &Path,
    ) -> Result<(), Error> {
        match entry.storage {
            StorageKind::Oci => {
                let len = self.download_blob_to(reference, &entry.digest, dest).await?;
                if len != entry.size {
                    return Err(Error::SizeMismatch {
                        name: entry.path.clone(),
                        expected: entry.size,
                        actual: len,
                    });
                }
                Ok(())
            }
            StorageKind::Blob => {
                let store = blob_store.ok_or_else(|| {
                    Error::BlobStoreRequired(entry.path.clone())
                })?;
                // validated above: blob storage implies a blob_ref
                let blob_ref = entry
                    .blob_ref
                    .as_ref()
                    .ok_or_else(|| Error::BlobStoreRequired(entry.path.clone()))?;
                store.get(blob_ref, dest).await?;
                Ok(())
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((200u64 << attempt).min(800))
}

fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX_V1 || media_type == DOCKER_IMAGE_MANIFEST_LIST_V2
}

fn docker_content_digest(res: &Response) -> Result<Option<Digest>, Error> {
    res.headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|v| -> Result<Digest, Error> {
            v.to_str()
                .map_err(|_| Error::BadDockerContentDigest)?
                .parse()
                .map_err(|_| Error::BadDockerContentDigest)
        })
        .transpose()
}

// the Location from a 202 can be absolute or registry-relative, and may
// already carry a session query
fn upload_put_url(scheme: &str, registry: &str, location: &str, digest: &Digest) -> String {
    let base = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{scheme}://{registry}{location}")
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}digest={digest}")
}

fn build_manifest(
    config_digest: &Digest,
    config_size: u64,
    layers: &[PushLayer],
    manifest_annotations: &BTreeMap<String, String>,
) -> Result<ImageManifest, Error> {
    let config = DescriptorBuilder::default()
        .media_type(MediaType::Other(BUNDLE_INDEX_MEDIA_TYPE.to_string()))
        .digest(to_oci_digest(config_digest))
        .size(config_size)
        .build()?;

    let layer_descs: Vec<Descriptor> = layers
        .iter()
        .map(|layer| {
            // the title annotation carries the full relative path; registries
            // that strip to basenames would otherwise lose directory layout
            DescriptorBuilder::default()
                .media_type(MediaType::Other(LAYER_MEDIA_TYPE.to_string()))
                .digest(to_oci_digest(&layer.digest))
                .size(layer.size)
                .annotations(HashMap::from([(
                    TITLE_ANNOTATION.to_string(),
                    layer.path.clone(),
                )]))
                .build()
        })
        .collect::<Result<_, _>>()?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layer_descs)
        .annotations(
            manifest_annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        )
        .build()?;
    Ok(manifest)
}

fn to_oci_digest(d: &Digest) -> oci_spec::image::Digest {
    match d {
        Digest::Sha256(_) => d
            .hex()
            .parse::<oci_spec::image::Sha256Digest>()
            .expect("validated hex")
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_challenge_parser() {
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer    realm="https://auth.docker.io/token",   service="registry.docker.io""#,
            r#"Bearer   service="registry.docker.io", realm="https://auth.docker.io/token""#,
        ];
        for case in cases.iter() {
            let c = parse_bearer_challenge_str(case).unwrap();
            assert_eq!(c.realm, "https://auth.docker.io/token", "{}", case);
            assert_eq!(c.service, "registry.docker.io", "{}", case);
        }
        assert!(parse_bearer_challenge_str("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge_str("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn test_backoff_caps() {
        assert_eq!(backoff(0), Duration::from_millis(200));
        assert_eq!(backoff(1), Duration::from_millis(400));
        assert_eq!(backoff(2), Duration::from_millis(800));
        assert_eq!(backoff(3), Duration::from_millis(800));
        assert_eq!(backoff(10), Duration::from_millis(800));
    }

    #[test]
    fn test_index_media_types_refused() {
        assert!(is_index_media_type(OCI_IMAGE_INDEX_V1));
        assert!(is_index_media_type(DOCKER_IMAGE_MANIFEST_LIST_V2));
        assert!(!is_index_media_type(OCI_IMAGE_MANIFEST_V1));
        assert!(!is_index_media_type(DOCKER_IMAGE_MANIFEST_V2));
        assert!(!is_index_media_type(""));
    }

    #[test]
    fn test_upload_put_url_variants() {
        let d = Digest::from_bytes("x");
        let u = upload_put_url("http", "localhost:5000", "/v2/r/blobs/uploads/uuid", &d);
        assert_eq!(u, format!("http://localhost:5000/v2/r/blobs/uploads/uuid?digest={d}"));
        let u = upload_put_url(
            "https",
            "ghcr.io",
            "https://ghcr.io/v2/r/blobs/uploads/uuid?state=abc",
            &d,
        );
        assert_eq!(
            u,
            format!("https://ghcr.io/v2/r/blobs/uploads/uuid?state=abc&digest={d}")
        );
    }

    #[test]
    fn test_build_manifest_carries_paths_and_config() {
        let layers = vec![
            PushLayer {
                path: "data/deep/file.bin".to_string(),
                digest: Digest::from_bytes("one"),
                size: 3,
                source: PathBuf::from("/tmp/x"),
            },
        ];
        let config_digest = Digest::from_bytes("index");
        let manifest =
            build_manifest(&config_digest, 42, &layers, &BTreeMap::new()).unwrap();
        assert_eq!(
            manifest.config().media_type().to_string(),
            BUNDLE_INDEX_MEDIA_TYPE
        );
        assert_eq!(manifest.config().size(), 42);
        assert_eq!(manifest.layers().len(), 1);
        let annotations = manifest.layers()[0].annotations().as_ref().unwrap();
        assert_eq!(
            annotations.get(TITLE_ANNOTATION).unwrap(),
            "data/deep/file.bin"
        );
    }

    #[test]
    fn test_token_scope_actions() {
        assert_eq!(TokenScope::Pull.actions(), "pull");
        assert_eq!(TokenScope::Push.actions(), "pull,push");
        let r: Reference = "ghcr.io/org/repo:latest".parse().unwrap();
        assert_ne!(token_key(&r, TokenScope::Pull), token_key(&r, TokenScope::Push));
    }
}
