//! Idempotency layer for command handlers.
//!
//! A caller-supplied key is claimed atomically before the wrapped handler
//! runs. A completed key replays the stored response; a key that is still
//! running is rejected; an expired key is treated as never seen.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use store::{Begin, IdempotencyStatus, IdempotencyStore};
use uuid::Uuid;

use crate::error::IdempotencyError;

/// Default header carrying the idempotency key.
pub const DEFAULT_KEY_HEADER: &str = "x-idempotency-key";

/// Default lifetime of an idempotency record.
pub const DEFAULT_EXPIRES_AFTER_SECS: i64 = 600;

const MAX_KEY_LEN: usize = 255;

/// Idempotency layer settings.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Name of the request header holding the key.
    pub key_header: String,
    /// How long a record suppresses re-execution.
    pub expires_after: Duration,
    /// Reject requests without a key instead of running them undeduplicated.
    pub require_key: bool,
    /// Reject a reused key whose request body differs from the first use.
    pub validate_payload: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_header: DEFAULT_KEY_HEADER.to_string(),
            expires_after: Duration::seconds(DEFAULT_EXPIRES_AFTER_SECS),
            require_key: false,
            validate_payload: true,
        }
    }
}

/// A handler response, flagged when it was replayed from a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentResponse<T> {
    pub response: T,
    pub replayed: bool,
}

/// Returns the SHA-256 hex digest of the request's JSON form.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(&serde_json::to_value(request)?)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Wraps command handlers with key-based deduplication.
pub struct IdempotencyLayer<S: IdempotencyStore> {
    store: S,
    config: IdempotencyConfig,
}

impl<S: IdempotencyStore> IdempotencyLayer<S> {
    /// Creates a new layer over the given store.
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Runs `handler` at most once per live key.
    ///
    /// Without a key the handler runs directly (unless `require_key` is
    /// set). With a key:
    /// - unseen or expired: claim it, run the handler, store the response on
    ///   success or release the key on failure
    /// - completed: return the stored response without running the handler
    /// - in progress: fail with `DuplicateInFlight`
    #[tracing::instrument(skip(self, request, handler))]
    pub async fn execute<Req, Resp, E, F, Fut>(
        &self,
        key: Option<&str>,
        request: &Req,
        handler: F,
    ) -> Result<IdempotentResponse<Resp>, IdempotencyError<E>>
    where
        Req: Serialize,
        Resp: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resp, E>>,
    {
        let Some(key) = key else {
            if self.config.require_key {
                return Err(IdempotencyError::KeyRequired);
            }
            let response = handler().await.map_err(IdempotencyError::Handler)?;
            return Ok(IdempotentResponse {
                response,
                replayed: false,
            });
        };
        validate_key(key)?;

        let fingerprint = fingerprint(request).map_err(IdempotencyError::Serialization)?;
        let claim = Uuid::new_v4().to_string();
        let now = Utc::now();

        match self
            .store
            .try_begin(key, &fingerprint, &claim, self.expiry_from(now), now)
            .await?
        {
            Begin::Existing(record) => {
                if self.config.validate_payload && record.fingerprint != fingerprint {
                    tracing::warn!(key, "idempotency key reused with a different payload");
                    return Err(IdempotencyError::PayloadMismatch {
                        key: key.to_string(),
                    });
                }

                match (record.status, record.response) {
                    (IdempotencyStatus::Completed, Some(stored)) => {
                        let response = serde_json::from_value(stored)
                            .map_err(IdempotencyError::Serialization)?;
                        tracing::info!(key, "replaying stored response");
                        metrics::counter!("idempotency_replays_total").increment(1);
                        Ok(IdempotentResponse {
                            response,
                            replayed: true,
                        })
                    }
                    _ => {
                        tracing::warn!(key, "duplicate request while first is in flight");
                        metrics::counter!("idempotency_in_flight_rejections_total").increment(1);
                        Err(IdempotencyError::DuplicateInFlight {
                            key: key.to_string(),
                        })
                    }
                }
            }
            Begin::Started => match handler().await {
                Ok(response) => {
                    self.store_response(key, &claim, &response).await;
                    Ok(IdempotentResponse {
                        response,
                        replayed: false,
                    })
                }
                Err(e) => {
                    match self.store.release(key, &claim).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(key, "idempotency key expired and was reclaimed before release");
                        }
                        Err(release_err) => {
                            tracing::warn!(key, error = %release_err, "failed to release idempotency key");
                        }
                    }
                    Err(IdempotencyError::Handler(e))
                }
            },
        }
    }

    /// Deletes expired records and returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, store::StoreError> {
        self.store.purge_expired(Utc::now()).await
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.config.expires_after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Records the handler's response. The handler already succeeded, so a
    /// failure here is logged and the record is left to expire. A record
    /// reclaimed by another caller after expiring is left untouched.
    async fn store_response<Resp: Serialize>(&self, key: &str, claim: &str, response: &Resp) {
        let stored = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(key, error = %e, "failed to serialize response for idempotency record");
                return;
            }
        };
        match self
            .store
            .complete(key, claim, &stored, self.expiry_from(Utc::now()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key, "idempotency key expired and was reclaimed before completion");
                metrics::counter!("idempotency_claims_lost_total").increment(1);
            }
            Err(e) => tracing::error!(key, error = %e, "failed to complete idempotency record"),
        }
    }
}

fn validate_key<E>(key: &str) -> Result<(), IdempotencyError<E>> {
    if key.trim().is_empty() {
        return Err(IdempotencyError::InvalidKey("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(IdempotencyError::InvalidKey(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(IdempotencyError::InvalidKey(
            "key contains control characters".to_string(),
        ));
    }
    Ok(())
}
