//! Short-lived response cache in front of a quote source.
//!
//! Accidental re-runs within the TTL reuse the previous response instead of
//! spending another request against the rate limit. Keyed by the exact
//! request; only successful responses are stored. Expiry is measured by the
//! injected clock.

use super::provider::{FetchError, QuoteMap, QuoteSource};
use crate::clock::Clock;
use crate::domain::QuoteRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct CacheEntry {
    stored_at: DateTime<Utc>,
    quotes: QuoteMap,
}

pub struct CachedQuoteSource<S> {
    inner: S,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<QuoteRequest, CacheEntry>>,
}

impl<S: QuoteSource> CachedQuoteSource<S> {
    pub fn new(inner: S, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QuoteRequest, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, request: &QuoteRequest) -> Option<QuoteMap> {
        let now = self.clock.now();
        let mut entries = self.entries();
        // Drop everything stale while we hold the lock anyway.
        entries.retain(|_, entry| !self.is_expired(entry, now));
        entries.get(request).map(|entry| entry.quotes.clone())
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.stored_at).to_std() {
            Ok(age) => age >= self.ttl,
            // Clock moved backwards: treat as fresh rather than refetching in a loop.
            Err(_) => false,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries()
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<S: QuoteSource> QuoteSource for CachedQuoteSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, request: &QuoteRequest) -> Result<QuoteMap, FetchError> {
        if self.ttl.is_zero() {
            return self.inner.fetch(request).await;
        }

        if let Some(quotes) = self.lookup(request) {
            tracing::info!(source = self.inner.name(), "serving quotes from response cache");
            return Ok(quotes);
        }

        let quotes = self.inner.fetch(request).await?;
        self.entries().insert(
            request.clone(),
            CacheEntry {
                stored_at: self.clock.now(),
                quotes: quotes.clone(),
            },
        );
        Ok(quotes)
    }
}
