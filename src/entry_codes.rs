//! One-time entry codes: upload, validation and mark-used.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::error::{Result, SamplerError};
use crate::rate_limit::AttemptLimiter;
use crate::store::EntryCodeStore;

const WRONG_CODE: &str = "wrong entry code";

/// Strips the separators participants tend to type into codes.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect()
}

pub struct EntryCodeService {
    instance_id: String,
    store: Arc<dyn EntryCodeStore>,
    limiter: AttemptLimiter,
    failure_delay_max: Duration,
}

impl EntryCodeService {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn EntryCodeStore>,
        limiter: AttemptLimiter,
        failure_delay_max: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            limiter,
            failure_delay_max,
        }
    }

    /// Saves the given codes and returns how many were new.
    pub async fn add_codes(&self, codes: &[String]) -> usize {
        let mut saved = 0;
        for raw in codes {
            let code = normalize_code(raw);
            if code.is_empty() {
                continue;
            }
            match self.store.add_entry_code(&self.instance_id, &code, Utc::now()).await {
                Ok(true) => saved += 1,
                Ok(false) => warn!(instance_id = %self.instance_id, code = %code, "entry code already exists"),
                Err(err) => {
                    error!(instance_id = %self.instance_id, code = %code, error = %err, "could not save entry code")
                }
            }
        }
        saved
    }

    /// Checks that `code` exists and is unused. Failed checks count against
    /// `uid` and are answered after a random delay.
    pub async fn validate(&self, uid: &str, code: &str) -> Result<()> {
        if uid.is_empty() {
            warn!("empty uid when checking entry code");
            return self.reject("wrong id").await;
        }
        let code = normalize_code(code);
        if code.is_empty() {
            warn!(uid, "empty entry code attempt");
            return self.reject("empty entry code attempt").await;
        }

        self.limiter.prune();
        debug!(tracked_uids = self.limiter.tracked_keys(), "checking entry code");
        if self.limiter.is_blocked(uid) {
            warn!(uid, "too many wrong code attempts");
            return self.reject(WRONG_CODE).await;
        }

        let found = match self.store.find_entry_code(&self.instance_id, &code).await {
            Ok(found) => found,
            Err(err) if err.is_storage() => return Err(err),
            Err(err) => {
                error!(uid, code = %code, error = %err, "entry code lookup failed");
                None
            }
        };

        match found {
            Some(entry) if entry.used_at.is_none() => Ok(()),
            Some(_) => {
                let failures = self.limiter.record_failure(uid);
                warn!(uid, code = %code, failures, "attempt to reuse entry code");
                self.reject(WRONG_CODE).await
            }
            None => {
                let failures = self.limiter.record_failure(uid);
                warn!(uid, code = %code, failures, "unknown entry code");
                self.reject(WRONG_CODE).await
            }
        }
    }

    pub async fn mark_used(&self, code: &str, participant_id: &str) -> Result<()> {
        let code = normalize_code(code);
        self.store
            .mark_entry_code_used(&self.instance_id, &code, participant_id, Utc::now())
            .await
    }

    async fn reject(&self, message: &str) -> Result<()> {
        let delay = self.random_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Err(SamplerError::InvalidRequest(message.to_string()))
    }

    fn random_delay(&self) -> Duration {
        let max_ms = self.failure_delay_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn service(limit: u32) -> EntryCodeService {
        EntryCodeService::new(
            "study-a",
            Arc::new(MemoryStore::new()),
            AttemptLimiter::new(limit, Duration::from_secs(300)),
            Duration::ZERO,
        )
    }

    #[test]
    fn normalization_drops_separators() {
        assert_eq!(normalize_code(" ab-12_3 4 "), "ab1234");
        assert_eq!(normalize_code("-_ "), "");
    }

    #[tokio::test]
    async fn valid_code_passes_until_used() {
        let codes = service(10);
        assert_eq!(codes.add_codes(&["AB-CD".to_string(), "ABCD".to_string()]).await, 1);

        codes.validate("uid-1", "ab cd".to_uppercase().as_str()).await.unwrap();
        codes.mark_used("AB_CD", "participant-1").await.unwrap();

        let err = codes.validate("uid-1", "ABCD").await.unwrap_err();
        assert_eq!(err.to_string(), WRONG_CODE);
        assert!(matches!(
            codes.mark_used("ABCD", "participant-2").await.unwrap_err(),
            SamplerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected() {
        let codes = service(10);
        assert!(codes.validate("", "ABCD").await.is_err());
        assert_eq!(
            codes.validate("uid", " - ").await.unwrap_err().to_string(),
            "empty entry code attempt"
        );
    }

    #[tokio::test]
    async fn repeated_failures_block_the_uid() {
        let codes = service(2);
        codes.add_codes(&["GOOD1".to_string()]).await;

        for _ in 0..3 {
            assert!(codes.validate("uid-1", "BAD").await.is_err());
        }
        // blocked even with a valid code
        assert!(codes.validate("uid-1", "GOOD1").await.is_err());
        codes.validate("uid-2", "GOOD1").await.unwrap();
    }
}
