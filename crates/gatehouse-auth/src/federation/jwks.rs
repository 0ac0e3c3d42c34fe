//! Provider key set fetching, caching and rotation tracking.
//!
//! [`KeyCache`] holds the public signing keys of one provider, keyed by
//! `kid`. Keys are refreshed when the cache TTL has passed or an unknown
//! `kid` shows up. Every successful refresh replaces the whole key set, and
//! the difference to the previous set is reported as a [`KeyRotation`].
//!
//! # Degraded mode
//!
//! When a refresh fails, keys from the last successful fetch are still
//! served for up to `jwks_stale_if_error` past their TTL. A provider outage
//! therefore does not log everyone out at once. After a failed fetch,
//! lookups go without refetching for [`MIN_REFETCH_INTERVAL`], so waiters
//! queued behind the failing caller do not each hit the provider again.
//!
//! # Accepted keys
//!
//! Only RSA keys with a non-empty `kid` are kept. Encryption keys
//! (`use: "enc"`) are ignored. Malformed entries are skipped with a warning
//! and never fail the refresh as a whole.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::JwksError;
use crate::config::OidcConfig;
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::metrics::{MetricsSink, names};
use crate::tasks::{CleanupHandle, spawn_periodic};

/// Maximum accepted key set document size (1 MB).
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// An unknown `kid` triggers a refetch at most this often.
pub const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(10);

/// Change between two successive key sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRotation {
    /// Provider label.
    pub provider: String,
    /// Key ids present now but not before.
    pub added: Vec<String>,
    /// Key ids present before but not now.
    pub removed: Vec<String>,
    /// Size of the new key set.
    pub total: usize,
    /// When the change was observed.
    pub at: OffsetDateTime,
}

#[derive(Clone)]
struct CachedKey {
    key: DecodingKey,
    algorithm: Option<Algorithm>,
}

#[derive(Default)]
struct KeySet {
    jwks_uri: Option<Url>,
    keys: HashMap<String, CachedKey>,
    fetched_at: Option<Instant>,
    fetched_at_utc: Option<OffsetDateTime>,
    /// Bumped on every refresh attempt, failed ones included.
    attempts: u64,
    /// Time and cause of the last failed fetch; cleared by a success.
    last_failure: Option<(Instant, JwksError)>,
    last_rotation: Option<KeyRotation>,
}

#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawJwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Cached signing keys of a single provider.
pub struct KeyCache {
    provider: String,
    http: reqwest::Client,
    ttl: Duration,
    stale_if_error: Duration,
    state: RwLock<KeySet>,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("provider", &self.provider)
            .field("ttl", &self.ttl)
            .field("stale_if_error", &self.stale_if_error)
            .finish_non_exhaustive()
    }
}

impl KeyCache {
    /// Creates an empty cache. TTLs and the provider label come from `config`.
    pub fn new(http: reqwest::Client, config: &OidcConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            provider: config.provider_name.clone(),
            http,
            ttl: config.jwks_cache_ttl,
            stale_if_error: config.jwks_stale_if_error,
            state: RwLock::new(KeySet::default()),
            metrics,
            events: None,
        }
    }

    /// Sets the key set endpoint up front.
    #[must_use]
    pub fn with_jwks_uri(mut self, uri: Url) -> Self {
        self.state.get_mut().jwks_uri = Some(uri);
        self
    }

    /// Sends rotation events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Points the cache at a (new) key set endpoint. Cached keys are kept.
    pub async fn set_jwks_uri(&self, uri: Url) {
        let mut state = self.state.write().await;
        tracing::debug!(provider = %self.provider, jwks_uri = %uri, "jwks endpoint set");
        state.jwks_uri = Some(uri);
    }

    /// Current key set endpoint.
    pub async fn jwks_uri(&self) -> Option<Url> {
        self.state.read().await.jwks_uri.clone()
    }

    /// Provider label.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Returns the decoding key for `kid`, fetching the key set if needed.
    ///
    /// # Errors
    ///
    /// - `JwksError::KeyNotFound` if no usable key has this id
    /// - A fetch error if the key set could not be refreshed and no cached
    ///   key within the stale window matches
    pub async fn get_key(&self, kid: &str) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
        let seen_attempts = {
            let state = self.state.read().await;
            let fresh = self.is_fresh(&state);
            if fresh && let Some(cached) = state.keys.get(kid) {
                self.metrics
                    .increment_counter(names::JWKS_CACHE_HITS_TOTAL, &self.labels());
                tracing::trace!(provider = %self.provider, kid = %kid, "jwks cache hit");
                return Ok((cached.key.clone(), cached.algorithm));
            }
            if fresh && fetched_recently(&state) {
                return Err(JwksError::KeyNotFound(kid.to_string()));
            }
            state.attempts
        };

        self.metrics
            .increment_counter(names::JWKS_CACHE_MISSES_TOTAL, &self.labels());
        tracing::debug!(provider = %self.provider, kid = %kid, "jwks cache miss");

        let mut state = self.state.write().await;
        // Another caller tried while this one waited for the lock, or the
        // provider failed moments ago: settle on what that attempt left.
        if state.attempts != seen_attempts || failed_recently(&state) {
            return match &state.last_failure {
                Some((_, err)) => self.serve_stale(&state, kid, err.clone()),
                None => lookup(&state, kid),
            };
        }

        match self.refresh_locked(&mut state).await {
            Ok(_) => lookup(&state, kid),
            Err(err) => self.serve_stale(&state, kid, err),
        }
    }

    /// Cached key within the stale window, or `err`.
    fn serve_stale(
        &self,
        state: &KeySet,
        kid: &str,
        err: JwksError,
    ) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
        if self.within_stale_window(state)
            && let Some(cached) = state.keys.get(kid)
        {
            tracing::warn!(
                provider = %self.provider,
                kid = %kid,
                error = %err,
                "jwks refresh failed, serving cached key"
            );
            return Ok((cached.key.clone(), cached.algorithm));
        }
        Err(err)
    }

    /// Fetches the key set now, regardless of cache state. Returns the
    /// number of usable keys.
    ///
    /// # Errors
    ///
    /// Returns a fetch error; the cached keys are left untouched.
    pub async fn refresh(&self) -> Result<usize, JwksError> {
        let mut state = self.state.write().await;
        self.refresh_locked(&mut state).await
    }

    /// Cached key ids, sorted.
    pub async fn key_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state.keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of cached keys.
    pub async fn key_count(&self) -> usize {
        self.state.read().await.keys.len()
    }

    /// Time of the last successful fetch.
    pub async fn last_fetched(&self) -> Option<OffsetDateTime> {
        self.state.read().await.fetched_at_utc
    }

    /// Returns `true` if nothing was fetched yet or the TTL has passed.
    pub async fn is_expired(&self) -> bool {
        !self.is_fresh(&*self.state.read().await)
    }

    /// Most recent rotation, if any was observed.
    pub async fn last_rotation(&self) -> Option<KeyRotation> {
        self.state.read().await.last_rotation.clone()
    }

    /// Starts refreshing the key set every `interval`.
    pub fn start_refresh(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> CleanupHandle {
        let cache = Arc::clone(self);
        spawn_periodic("jwks_refresh", interval, token, move || {
            let cache = Arc::clone(&cache);
            async move { cache.refresh().await.map(|_| 0) }
        })
    }

    fn labels(&self) -> [(&'static str, &str); 1] {
        [("provider", self.provider.as_str())]
    }

    fn is_fresh(&self, state: &KeySet) -> bool {
        state
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    fn within_stale_window(&self, state: &KeySet) -> bool {
        state
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.ttl.saturating_add(self.stale_if_error))
    }

    async fn refresh_locked(&self, state: &mut KeySet) -> Result<usize, JwksError> {
        let uri = state.jwks_uri.clone().ok_or(JwksError::NotConfigured)?;
        state.attempts += 1;
        let keys = match self.fetch(&uri).await {
            Ok(keys) => keys,
            Err(err) => {
                state.last_failure = Some((Instant::now(), err.clone()));
                self.metrics
                    .increment_counter(names::JWKS_FETCH_ERRORS_TOTAL, &self.labels());
                tracing::warn!(provider = %self.provider, jwks_uri = %uri, error = %err, "jwks fetch failed");
                return Err(err);
            }
        };

        let now = OffsetDateTime::now_utc();
        // The very first fetch establishes the baseline.
        if state.fetched_at.is_some() {
            let old: BTreeSet<&String> = state.keys.keys().collect();
            let new: BTreeSet<&String> = keys.keys().collect();
            let added: Vec<String> = new.difference(&old).map(|k| (*k).clone()).collect();
            let removed: Vec<String> = old.difference(&new).map(|k| (*k).clone()).collect();

            if !added.is_empty() || !removed.is_empty() {
                let rotation = KeyRotation {
                    provider: self.provider.clone(),
                    added,
                    removed,
                    total: keys.len(),
                    at: now,
                };
                self.record_rotation(&rotation);
                state.last_rotation = Some(rotation);
            }
        }

        let count = keys.len();
        state.keys = keys;
        state.fetched_at = Some(Instant::now());
        state.fetched_at_utc = Some(now);
        state.last_failure = None;

        self.metrics
            .set_gauge(names::JWKS_KEYS_TOTAL, &self.labels(), count as f64);
        tracing::debug!(provider = %self.provider, keys = count, "jwks refreshed");
        Ok(count)
    }

    fn record_rotation(&self, rotation: &KeyRotation) {
        let labels = self.labels();
        self.metrics
            .increment_counter(names::JWKS_KEY_ROTATIONS_TOTAL, &labels);
        self.metrics
            .add_counter(names::JWKS_KEYS_ADDED_TOTAL, &labels, rotation.added.len() as u64);
        self.metrics.add_counter(
            names::JWKS_KEYS_REMOVED_TOTAL,
            &labels,
            rotation.removed.len() as u64,
        );
        self.metrics.set_gauge(
            names::JWKS_LAST_ROTATION_TIMESTAMP,
            &labels,
            rotation.at.unix_timestamp() as f64,
        );

        tracing::info!(
            provider = %rotation.provider,
            added = ?rotation.added,
            removed = ?rotation.removed,
            total = rotation.total,
            "provider key rotation detected"
        );
        emit(
            self.events.as_ref(),
            SecurityEvent::KeyRotation {
                provider: rotation.provider.clone(),
                added: rotation.added.len(),
                removed: rotation.removed.len(),
                at: rotation.at,
            },
        );
    }

    async fn fetch(&self, uri: &Url) -> Result<HashMap<String, CachedKey>, JwksError> {
        tracing::debug!(provider = %self.provider, jwks_uri = %uri, "fetching jwks");

        let response = self
            .http
            .get(uri.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| JwksError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::HttpStatus(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_SIZE
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: MAX_RESPONSE_SIZE,
            });
        }

        let document: RawKeySet = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        let mut keys = HashMap::new();
        for entry in document.keys {
            match parse_key(entry) {
                Ok(Some((kid, key))) => {
                    keys.insert(kid, key);
                }
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!(provider = %self.provider, reason = %reason, "skipping malformed jwk");
                }
            }
        }

        if keys.is_empty() {
            return Err(JwksError::Parse("no usable signing keys".to_string()));
        }
        Ok(keys)
    }
}

fn lookup(state: &KeySet, kid: &str) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
    state
        .keys
        .get(kid)
        .map(|cached| (cached.key.clone(), cached.algorithm))
        .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()))
}

fn fetched_recently(state: &KeySet) -> bool {
    state
        .fetched_at
        .is_some_and(|at| at.elapsed() < MIN_REFETCH_INTERVAL)
}

fn failed_recently(state: &KeySet) -> bool {
    state
        .last_failure
        .as_ref()
        .is_some_and(|(at, _)| at.elapsed() < MIN_REFETCH_INTERVAL)
}

/// Parses one JWK. `Ok(None)` means a well-formed key this cache ignores.
fn parse_key(value: serde_json::Value) -> Result<Option<(String, CachedKey)>, String> {
    let jwk: RawJwk = serde_json::from_value(value).map_err(|e| e.to_string())?;

    if jwk.kty != "RSA" {
        tracing::debug!(kty = %jwk.kty, "ignoring non-RSA jwk");
        return Ok(None);
    }
    if jwk.key_use.as_deref() == Some("enc") {
        return Ok(None);
    }

    let kid = jwk
        .kid
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| "missing kid".to_string())?;

    let algorithm = match jwk.alg.as_deref() {
        None => None,
        Some("RS256") => Some(Algorithm::RS256),
        Some("RS384") => Some(Algorithm::RS384),
        Some("RS512") => Some(Algorithm::RS512),
        Some(other) => return Err(format!("kid {kid}: unsupported alg {other}")),
    };

    let (Some(n), Some(e)) = (jwk.n, jwk.e) else {
        return Err(format!("kid {kid}: missing modulus or exponent"));
    };
    let key = DecodingKey::from_rsa_components(&n, &e).map_err(|err| format!("kid {kid}: {err}"))?;

    Ok(Some((kid, CachedKey { key, algorithm })))
}
