//! HTTP channels, fallback fetching, pacing and the report artifact for MPS.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mps_core::Candidate;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mps-storage";

pub const DEFAULT_PROXY_ENDPOINT: &str = "http://api.scraperapi.com";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Writes the single report artifact of a run.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Serialize candidates as a pretty JSON array and write them to `file`
    /// (relative to the store root unless absolute).
    pub async fn write_report(
        &self,
        file: impl AsRef<Path>,
        candidates: &[Candidate],
    ) -> anyhow::Result<StoredReport> {
        let bytes = serde_json::to_vec_pretty(candidates).context("serializing candidate report")?;
        let path = self.root.join(file.as_ref());
        self.write_atomic(&path, &bytes).await?;
        Ok(StoredReport {
            content_hash: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
        })
    }

    /// Replace `path` via a temp file in the same directory and a rename, so
    /// readers never observe a half-written report.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Proxy,
    Direct,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => f.write_str("proxy"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FetchErrorKind {
    Transport,
    RemoteRejected,
    AuthOrQuota,
    Malformed,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{channel} transport error: {detail}")]
    Transport { channel: ChannelKind, detail: String },
    #[error("{channel} rejected with http status {status}")]
    RemoteRejected { channel: ChannelKind, status: u16 },
    #[error("{channel} refused with 403 (auth or quota): {detail}")]
    AuthOrQuota { channel: ChannelKind, detail: String },
    #[error("{channel} returned a malformed body: {detail}")]
    Malformed { channel: ChannelKind, detail: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transport { .. } => FetchErrorKind::Transport,
            Self::RemoteRejected { .. } => FetchErrorKind::RemoteRejected,
            Self::AuthOrQuota { .. } => FetchErrorKind::AuthOrQuota,
            Self::Malformed { .. } => FetchErrorKind::Malformed,
        }
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Transport { channel, .. }
            | Self::RemoteRejected { channel, .. }
            | Self::AuthOrQuota { channel, .. }
            | Self::Malformed { channel, .. } => *channel,
        }
    }
}

/// Result of one channel attempt: the parsed JSON document or a typed failure.
pub type FetchOutcome = Result<JsonValue, FetchError>;

fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

pub fn classify_response(channel: ChannelKind, status: StatusCode, body: &[u8]) -> FetchOutcome {
    match status {
        StatusCode::OK => serde_json::from_slice(body).map_err(|err| FetchError::Malformed {
            channel,
            detail: err.to_string(),
        }),
        StatusCode::FORBIDDEN => Err(FetchError::AuthOrQuota {
            channel,
            detail: body_snippet(body),
        }),
        other => Err(FetchError::RemoteRejected {
            channel,
            status: other.as_u16(),
        }),
    }
}

pub fn classify_reqwest_error(channel: ChannelKind, err: &reqwest::Error) -> FetchError {
    let cause = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_body() || err.is_decode() {
        "reading body failed"
    } else {
        "request failed"
    };
    FetchError::Transport {
        channel,
        detail: format!("{cause}: {err}"),
    }
}

async fn execute(channel: ChannelKind, request: reqwest::RequestBuilder) -> FetchOutcome {
    let resp = request
        .send()
        .await
        .map_err(|err| classify_reqwest_error(channel, &err))?;
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|err| classify_reqwest_error(channel, &err))?;
    debug!(%channel, status = status.as_u16(), bytes = body.len(), "channel response");
    classify_response(channel, status, &body)
}

/// One network path to the stats API. Implementations never retry.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn kind(&self) -> ChannelKind;

    async fn fetch(&self, target_url: &str) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applied to every single channel attempt.
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Relays requests through a paid proxy that rotates network identity.
#[derive(Clone)]
pub struct ProxyChannel {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    timeout: Duration,
}

impl fmt::Debug for ProxyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyChannel")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProxyChannel {
    /// Returns `Ok(None)` when no credential is configured: the proxy path is
    /// then unavailable and must not be attempted.
    pub fn from_credential(
        client: reqwest::Client,
        endpoint: &str,
        credential: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let Some(api_key) = credential.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("parsing proxy endpoint {endpoint}"))?;
        Ok(Some(Self {
            client,
            endpoint,
            api_key: api_key.to_string(),
            timeout,
        }))
    }

    /// `<endpoint>?api_key=..&url=<encoded target>&keep_headers=true`
    pub fn request_url(&self, target_url: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("url", target_url)
            .append_pair("keep_headers", "true");
        url
    }
}

#[async_trait]
impl Channel for ProxyChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Proxy
    }

    async fn fetch(&self, target_url: &str) -> FetchOutcome {
        let request = self
            .client
            .get(self.request_url(target_url))
            .timeout(self.timeout);
        execute(ChannelKind::Proxy, request)
            .instrument(info_span!("channel_fetch", channel = "proxy", url = target_url))
            .await
    }
}

/// Headers attached to direct requests so they look like a browser visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserHeaders {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl Default for BrowserHeaders {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: "application/json, text/plain, */*".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            referer: None,
            origin: None,
        }
    }
}

impl BrowserHeaders {
    pub fn for_site(site: &str) -> Self {
        let site = site.trim_end_matches('/');
        Self {
            referer: Some(format!("{site}/")),
            origin: Some(site.to_string()),
            ..Self::default()
        }
    }

    pub fn to_header_map(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).context("invalid user agent header")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&self.accept).context("invalid accept header")?,
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&self.accept_language).context("invalid accept-language header")?,
        );
        if let Some(referer) = &self.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("invalid referer header")?,
            );
        }
        if let Some(origin) = &self.origin {
            headers.insert(
                ORIGIN,
                HeaderValue::from_str(origin).context("invalid origin header")?,
            );
        }
        Ok(headers)
    }
}

#[derive(Debug, Clone)]
pub struct DirectChannel {
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Duration,
}

impl DirectChannel {
    pub fn new(
        client: reqwest::Client,
        headers: &BrowserHeaders,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client,
            headers: headers.to_header_map()?,
            timeout,
        })
    }
}

#[async_trait]
impl Channel for DirectChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn fetch(&self, target_url: &str) -> FetchOutcome {
        let request = self
            .client
            .get(target_url)
            .headers(self.headers.clone())
            .timeout(self.timeout);
        execute(ChannelKind::Direct, request)
            .instrument(info_span!("channel_fetch", channel = "direct", url = target_url))
            .await
    }
}

/// Global cap on direct calls: `capacity` calls in a burst, then one more per
/// `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Floor applied to a zero refill interval.
    pub const MIN_REFILL: Duration = Duration::from_millis(1);

    /// Capacity of at least one and a non-zero interval.
    pub fn normalized(self) -> Self {
        Self {
            capacity: self.capacity.max(1),
            refill_every: if self.refill_every.is_zero() {
                Self::MIN_REFILL
            } else {
                self.refill_every
            },
        }
    }
}

/// Token bucket shared by every clone of a [`RateGate`].
#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    /// Start of the refill period currently accruing.
    period_start: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = config.normalized();
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                period_start: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    pub async fn take(&self) {
        let interval = self.config.refill_every;
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let periods = now.duration_since(state.period_start).as_nanos() / interval.as_nanos();
            if periods > 0 {
                let refilled = u32::try_from(periods).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refilled).min(self.config.capacity);
                // Whole periods only, so a partial period keeps accruing.
                let advance = u32::try_from(periods)
                    .ok()
                    .and_then(|n| interval.checked_mul(n))
                    .unwrap_or(Duration::MAX);
                state.period_start = state.period_start.checked_add(advance).unwrap_or(now);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next_refill = state.period_start + interval;
            drop(state);
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

/// Pacing bounds: every wait lasts `base_delay + uniform(jitter_min, jitter_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGateConfig {
    pub base_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::ZERO,
            jitter_min: Duration::from_millis(200),
            jitter_max: Duration::from_millis(500),
        }
    }
}

/// Stateless pacing policy applied before direct-channel calls. Safe to call
/// from any number of workers at once.
#[derive(Debug, Clone)]
pub struct RateGate {
    config: RateGateConfig,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(RateGateConfig::default())
    }
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        let (jitter_min, jitter_max) = if config.jitter_min <= config.jitter_max {
            (config.jitter_min, config.jitter_max)
        } else {
            (config.jitter_max, config.jitter_min)
        };
        Self {
            config: RateGateConfig {
                base_delay: config.base_delay,
                jitter_min,
                jitter_max,
            },
            token_bucket: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateGateConfig {
            base_delay: Duration::ZERO,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        })
    }

    pub fn with_token_bucket(mut self, config: TokenBucketConfig) -> Self {
        self.token_bucket = Some(Arc::new(SimpleTokenBucket::new(config)));
        self
    }

    pub fn token_bucket(&self) -> Option<TokenBucketConfig> {
        self.token_bucket.as_ref().map(|bucket| bucket.config())
    }

    pub fn config(&self) -> RateGateConfig {
        self.config
    }

    pub fn next_delay(&self) -> Duration {
        let lo = self.config.jitter_min.as_micros() as u64;
        let hi = self.config.jitter_max.as_micros() as u64;
        let jitter = if hi > lo {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        self.config
            .base_delay
            .saturating_add(Duration::from_micros(jitter))
    }

    pub async fn wait(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Clone)]
pub struct FetcherConfig {
    pub http: HttpClientConfig,
    pub proxy_endpoint: String,
    pub proxy_credential: Option<String>,
    pub browser_headers: BrowserHeaders,
    pub rate_gate: RateGateConfig,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl fmt::Debug for FetcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherConfig")
            .field("http", &self.http)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .field(
                "proxy_credential",
                &self.proxy_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("browser_headers", &self.browser_headers)
            .field("rate_gate", &self.rate_gate)
            .field("token_bucket", &self.token_bucket)
            .finish()
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            proxy_endpoint: DEFAULT_PROXY_ENDPOINT.to_string(),
            proxy_credential: None,
            browser_headers: BrowserHeaders::default(),
            rate_gate: RateGateConfig::default(),
            token_bucket: None,
        }
    }
}

/// Proxy-first, direct-second fetch with a single outcome.
#[derive(Debug, Clone)]
pub struct FallbackFetcher {
    proxy: Option<Arc<dyn Channel>>,
    direct: Arc<dyn Channel>,
    gate: RateGate,
}

impl FallbackFetcher {
    pub fn new(proxy: Option<Arc<dyn Channel>>, direct: Arc<dyn Channel>, gate: RateGate) -> Self {
        Self {
            proxy,
            direct,
            gate,
        }
    }

    /// Build both channels over one shared connection pool.
    pub fn from_config(config: &FetcherConfig) -> anyhow::Result<Self> {
        let client = build_client(&config.http)?;
        let proxy = ProxyChannel::from_credential(
            client.clone(),
            &config.proxy_endpoint,
            config.proxy_credential.as_deref(),
            config.http.timeout,
        )?
        .map(|p| Arc::new(p) as Arc<dyn Channel>);
        let direct = DirectChannel::new(client, &config.browser_headers, config.http.timeout)?;

        let mut gate = RateGate::new(config.rate_gate);
        if let Some(bucket) = config.token_bucket {
            gate = gate.with_token_bucket(bucket);
        }
        Ok(Self::new(proxy, Arc::new(direct), gate))
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.gate
    }

    /// Proxy failures of any kind fall through to a paced direct attempt, whose
    /// outcome is final.
    pub async fn fetch_with_fallback(&self, url: &str) -> FetchOutcome {
        if let Some(proxy) = &self.proxy {
            match proxy.fetch(url).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.kind() == FetchErrorKind::AuthOrQuota => {
                    warn!(url, error = %err, "proxy auth or quota failure, falling back to direct");
                }
                Err(err) => {
                    debug!(url, error = %err, "proxy attempt failed, falling back to direct");
                }
            }
        }

        self.gate.wait().await;
        self.direct.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug)]
    struct ScriptedChannel {
        kind: ChannelKind,
        calls: AtomicUsize,
        outcome: FetchOutcome,
    }

    impl ScriptedChannel {
        fn new(kind: ChannelKind, outcome: FetchOutcome) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn fetch(&self, _target_url: &str) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn payload() -> JsonValue {
        serde_json::json!({"careerTotals": {"regularSeason": {"goals": 499}}})
    }

    #[test]
    fn report_hashing_is_stable() {
        let hash = ReportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn report_is_written_atomically_and_replaced() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let candidate = Candidate {
            entity_id: "8471214".into(),
            display_name: "Alex Ovechkin".to_string(),
            cumulative_value: 897,
            target_milestone: 900,
            amount_needed: 3,
            stat_type: "goals".to_string(),
            metadata: BTreeMap::from([("team".to_string(), "WSH".to_string())]),
        };

        let first = store
            .write_report("out/nhl_milestones.json", &[candidate.clone()])
            .await
            .expect("first write");
        let second = store
            .write_report("out/nhl_milestones.json", &[])
            .await
            .expect("second write");

        assert_ne!(first.content_hash, second.content_hash);
        let text = std::fs::read_to_string(&second.path).expect("read report");
        assert_eq!(text.trim(), "[]");
        let leftovers = std::fs::read_dir(dir.path().join("out"))
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn status_classification_follows_taxonomy() {
        let ok = classify_response(ChannelKind::Direct, StatusCode::OK, br#"{"a":1}"#);
        assert_eq!(ok.unwrap()["a"], 1);

        let forbidden = classify_response(ChannelKind::Proxy, StatusCode::FORBIDDEN, b"quota");
        assert_eq!(forbidden.unwrap_err().kind(), FetchErrorKind::AuthOrQuota);

        let rejected = classify_response(ChannelKind::Direct, StatusCode::TOO_MANY_REQUESTS, b"");
        match rejected.unwrap_err() {
            FetchError::RemoteRejected { status, channel } => {
                assert_eq!(status, 429);
                assert_eq!(channel, ChannelKind::Direct);
            }
            other => panic!("unexpected {other:?}"),
        }

        let malformed = classify_response(ChannelKind::Direct, StatusCode::OK, b"<html>");
        assert_eq!(malformed.unwrap_err().kind(), FetchErrorKind::Malformed);

        let no_content = classify_response(ChannelKind::Direct, StatusCode::NO_CONTENT, b"");
        assert_eq!(no_content.unwrap_err().kind(), FetchErrorKind::RemoteRejected);
    }

    #[test]
    fn proxy_url_embeds_encoded_target() {
        let proxy = ProxyChannel::from_credential(
            reqwest::Client::new(),
            DEFAULT_PROXY_ENDPOINT,
            Some("secret-key"),
            Duration::from_secs(5),
        )
        .unwrap()
        .unwrap();
        let url = proxy.request_url("https://api-web.nhle.com/v1/player/8478402/landing?x=1&y=2");
        let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["api_key"], "secret-key");
        assert_eq!(
            pairs["url"],
            "https://api-web.nhle.com/v1/player/8478402/landing?x=1&y=2"
        );
        assert_eq!(pairs["keep_headers"], "true");
        assert!(!url.as_str().contains("x=1&y=2"));
        assert!(!format!("{proxy:?}").contains("secret-key"));
    }

    #[test]
    fn blank_credential_disables_proxy() {
        for credential in [None, Some(""), Some("   ")] {
            let proxy = ProxyChannel::from_credential(
                reqwest::Client::new(),
                DEFAULT_PROXY_ENDPOINT,
                credential,
                Duration::from_secs(5),
            )
            .unwrap();
            assert!(proxy.is_none());
        }
    }

    #[test]
    fn rate_gate_delay_stays_in_bounds() {
        let gate = RateGate::new(RateGateConfig {
            base_delay: Duration::from_millis(100),
            jitter_min: Duration::from_millis(50),
            jitter_max: Duration::from_millis(20),
        });
        for _ in 0..200 {
            let delay = gate.next_delay();
            assert!(delay >= Duration::from_millis(120), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
        assert_eq!(RateGate::disabled().next_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_blocks_once_drained() {
        let gate = RateGate::disabled().with_token_bucket(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(500),
        });
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() < Duration::from_millis(500));
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_millisecond_refill_still_refills() {
        let gate = RateGate::disabled().with_token_bucket(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_micros(500),
        });
        gate.wait().await;
        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(2), gate.wait())
            .await
            .expect("second wait returns after one refill");
        assert!(start.elapsed() >= Duration::from_micros(500));
        assert!(start.elapsed() < Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_interval_is_clamped() {
        let gate = RateGate::disabled().with_token_bucket(TokenBucketConfig {
            capacity: 0,
            refill_every: Duration::ZERO,
        });
        let config = gate.token_bucket().unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.refill_every, TokenBucketConfig::MIN_REFILL);

        gate.wait().await;
        tokio::time::timeout(Duration::from_secs(1), gate.wait())
            .await
            .expect("clamped interval refills");
    }

    #[test]
    fn huge_base_delay_saturates() {
        let gate = RateGate::new(RateGateConfig {
            base_delay: Duration::MAX,
            jitter_min: Duration::from_millis(200),
            jitter_max: Duration::from_millis(500),
        });
        assert_eq!(gate.next_delay(), Duration::MAX);
    }

    fn paced_gate() -> RateGate {
        RateGate::new(RateGateConfig {
            base_delay: Duration::from_millis(300),
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn direct_attempt_after_proxy_failure_is_paced() {
        let proxy = ScriptedChannel::new(
            ChannelKind::Proxy,
            Err(FetchError::AuthOrQuota {
                channel: ChannelKind::Proxy,
                detail: "credits exhausted".to_string(),
            }),
        );
        let direct = ScriptedChannel::new(ChannelKind::Direct, Ok(payload()));
        let fetcher =
            FallbackFetcher::new(Some(proxy as Arc<dyn Channel>), direct.clone(), paced_gate());

        let start = Instant::now();
        assert!(fetcher.fetch_with_fallback("https://example.test/a").await.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_only_fetch_is_paced() {
        let direct = ScriptedChannel::new(ChannelKind::Direct, Ok(payload()));
        let fetcher = FallbackFetcher::new(None, direct, paced_gate());

        let start = Instant::now();
        assert!(fetcher.fetch_with_fallback("https://example.test/a").await.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_success_is_not_paced() {
        let proxy = ScriptedChannel::new(ChannelKind::Proxy, Ok(payload()));
        let direct = ScriptedChannel::new(ChannelKind::Direct, Ok(payload()));
        let fetcher = FallbackFetcher::new(Some(proxy as Arc<dyn Channel>), direct, paced_gate());

        let start = Instant::now();
        assert!(fetcher.fetch_with_fallback("https://example.test/a").await.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn proxy_auth_failure_falls_back_to_direct() {
        let proxy = ScriptedChannel::new(
            ChannelKind::Proxy,
            Err(FetchError::AuthOrQuota {
                channel: ChannelKind::Proxy,
                detail: "credits exhausted".to_string(),
            }),
        );
        let direct = ScriptedChannel::new(ChannelKind::Direct, Ok(payload()));
        let fetcher = FallbackFetcher::new(
            Some(proxy.clone() as Arc<dyn Channel>),
            direct.clone(),
            RateGate::disabled(),
        );

        let outcome = fetcher.fetch_with_fallback("https://example.test/a").await;
        assert_eq!(outcome.unwrap(), payload());
        assert_eq!(proxy.calls(), 1);
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test]
    async fn proxy_success_skips_direct() {
        let proxy = ScriptedChannel::new(ChannelKind::Proxy, Ok(payload()));
        let direct = ScriptedChannel::new(
            ChannelKind::Direct,
            Err(FetchError::RemoteRejected {
                channel: ChannelKind::Direct,
                status: 500,
            }),
        );
        let fetcher = FallbackFetcher::new(
            Some(proxy.clone() as Arc<dyn Channel>),
            direct.clone(),
            RateGate::disabled(),
        );

        assert!(fetcher.fetch_with_fallback("https://example.test/a").await.is_ok());
        assert_eq!(direct.calls(), 0);
    }

    #[tokio::test]
    async fn missing_proxy_goes_straight_to_direct() {
        let direct = ScriptedChannel::new(ChannelKind::Direct, Ok(payload()));
        let fetcher = FallbackFetcher::new(None, direct.clone(), RateGate::disabled());
        assert!(!fetcher.proxy_enabled());
        assert!(fetcher.fetch_with_fallback("https://example.test/a").await.is_ok());
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test]
    async fn direct_failure_is_final_outcome() {
        let proxy = ScriptedChannel::new(
            ChannelKind::Proxy,
            Err(FetchError::Transport {
                channel: ChannelKind::Proxy,
                detail: "timed out".to_string(),
            }),
        );
        let direct = ScriptedChannel::new(
            ChannelKind::Direct,
            Err(FetchError::Transport {
                channel: ChannelKind::Direct,
                detail: "timed out".to_string(),
            }),
        );
        let fetcher = FallbackFetcher::new(
            Some(proxy as Arc<dyn Channel>),
            direct,
            RateGate::disabled(),
        );
        let err = fetcher
            .fetch_with_fallback("https://example.test/a")
            .await
            .unwrap_err();
        assert_eq!(err.channel(), ChannelKind::Direct);
        assert_eq!(err.kind(), FetchErrorKind::Transport);
    }

    #[test]
    fn config_debug_redacts_credential() {
        let config = FetcherConfig {
            proxy_credential: Some("hunter2".to_string()),
            ..FetcherConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
