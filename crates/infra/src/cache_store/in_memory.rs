use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use skillrun_core::{IdempotencyKey, OwnerToken};

use super::r#trait::{
    CacheEntry, CacheStats, CacheStore, ClaimOutcome, ClaimRequest, CommitOutcome, EntryStatus,
    StoreError, TerminalRecord,
};

/// In-memory idempotency cache.
///
/// Intended for tests/dev and single-process callers. Claims are atomic because
/// the whole check-and-write happens under the write lock.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<IdempotencyKey, CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).filter(|e| !e.is_expired(now)).cloned())
    }

    fn try_claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;

        if let Some(existing) = entries.get(&request.key) {
            if !existing.is_expired(now) {
                return Ok(match existing.status {
                    EntryStatus::Pending => ClaimOutcome::AlreadyPending(existing.clone()),
                    _ => ClaimOutcome::AlreadyTerminal(existing.clone()),
                });
            }
        }

        let entry = CacheEntry::pending(request, now);
        entries.insert(request.key.clone(), entry.clone());
        Ok(ClaimOutcome::Claimed(entry))
    }

    fn commit(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        record: TerminalRecord,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;

        match entries.get_mut(key) {
            Some(entry) if entry.status == EntryStatus::Pending && entry.owner_token == owner => {
                entry.apply_terminal(record, now);
                Ok(CommitOutcome::Committed)
            }
            _ => Ok(CommitOutcome::StaleOwner),
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }

    fn invalidate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.remove(key).is_some())
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;

        let mut stats = CacheStats::default();
        for entry in entries.values() {
            if entry.is_expired(now) {
                stats.expired += 1;
                continue;
            }
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Succeeded => stats.succeeded += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use skillrun_core::{ErrorClass, OperationScope};

    use super::*;
    use crate::cache_store::r#trait::{TerminalOutcome, deadline};

    fn request(owner: OwnerToken, ttl: Duration) -> ClaimRequest {
        let scope = OperationScope::parse("acme", "lifecycle-audit", "extract").unwrap();
        ClaimRequest {
            key: IdempotencyKey::derive(&scope, &json!({"ids": [1, 2, 3]})).unwrap(),
            scope,
            owner,
            claim_ttl: ttl,
        }
    }

    fn success_record(now: DateTime<Utc>) -> TerminalRecord {
        TerminalRecord {
            outcome: TerminalOutcome::Succeeded {
                output: json!({"rows": 3}),
            },
            attempt_count: 1,
            total_duration_ms: 12,
            attempts: vec![],
            expires_at: deadline(now, Duration::from_secs(3600)),
        }
    }

    #[test]
    fn claim_then_commit() {
        let store = InMemoryCacheStore::new();
        let owner = OwnerToken::new();
        let req = request(owner, Duration::from_secs(60));
        let now = Utc::now();

        assert!(matches!(store.try_claim(&req, now).unwrap(), ClaimOutcome::Claimed(_)));
        assert!(matches!(
            store.try_claim(&request(OwnerToken::new(), Duration::from_secs(60)), now).unwrap(),
            ClaimOutcome::AlreadyPending(_)
        ));

        assert_eq!(
            store.commit(&req.key, owner, success_record(now), now).unwrap(),
            CommitOutcome::Committed
        );

        let entry = store.get(&req.key, now).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Succeeded);
        assert_eq!(entry.output, Some(json!({"rows": 3})));

        match store.try_claim(&req, now).unwrap() {
            ClaimOutcome::AlreadyTerminal(e) => assert_eq!(e.status, EntryStatus::Succeeded),
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[test]
    fn terminal_entries_are_immutable() {
        let store = InMemoryCacheStore::new();
        let owner = OwnerToken::new();
        let req = request(owner, Duration::from_secs(60));
        let now = Utc::now();

        store.try_claim(&req, now).unwrap();
        store.commit(&req.key, owner, success_record(now), now).unwrap();

        let second = TerminalRecord {
            outcome: TerminalOutcome::Failed {
                class: ErrorClass::Unknown,
                message: "late".into(),
            },
            ..success_record(now)
        };
        assert_eq!(
            store.commit(&req.key, owner, second, now).unwrap(),
            CommitOutcome::StaleOwner
        );
        assert_eq!(
            store.get(&req.key, now).unwrap().unwrap().status,
            EntryStatus::Succeeded
        );
    }

    #[test]
    fn expired_claim_is_reclaimed_and_old_owner_is_stale() {
        let store = InMemoryCacheStore::new();
        let first = OwnerToken::new();
        let req = request(first, Duration::from_millis(10));
        let t0 = Utc::now();

        store.try_claim(&req, t0).unwrap();

        let later = t0 + chrono::Duration::milliseconds(50);
        let second = OwnerToken::new();
        let reclaimed = store
            .try_claim(&request(second, Duration::from_secs(60)), later)
            .unwrap();
        assert!(matches!(reclaimed, ClaimOutcome::Claimed(ref e) if e.owner_token == second));

        assert_eq!(
            store.commit(&req.key, first, success_record(later), later).unwrap(),
            CommitOutcome::StaleOwner
        );
    }

    #[test]
    fn expired_entries_are_absent_and_purged() {
        let store = InMemoryCacheStore::new();
        let owner = OwnerToken::new();
        let req = request(owner, Duration::from_secs(60));
        let now = Utc::now();

        store.try_claim(&req, now).unwrap();
        let mut record = success_record(now);
        record.expires_at = now + chrono::Duration::milliseconds(5);
        store.commit(&req.key, owner, record, now).unwrap();

        let later = now + chrono::Duration::seconds(1);
        assert!(store.get(&req.key, later).unwrap().is_none());
        assert_eq!(store.stats(later).unwrap().expired, 1);
        assert_eq!(store.purge_expired(later).unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryCacheStore::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    let req = request(OwnerToken::new(), Duration::from_secs(60));
                    if let ClaimOutcome::Claimed(_) = store.try_claim(&req, now).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let store = InMemoryCacheStore::new();
        let req = request(OwnerToken::new(), Duration::from_secs(60));
        store.try_claim(&req, Utc::now()).unwrap();

        assert!(store.invalidate(&req.key).unwrap());
        assert!(!store.invalidate(&req.key).unwrap());
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let store = Arc::new(InMemoryCacheStore::new());
        store
            .try_claim(&request(OwnerToken::new(), Duration::from_secs(60)), Utc::now())
            .unwrap();

        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(matches!(store.len(), Err(StoreError::LockPoisoned)));
        assert!(matches!(store.is_empty(), Err(StoreError::LockPoisoned)));
        assert!(matches!(
            store.get(&request(OwnerToken::new(), Duration::ZERO).key, Utc::now()),
            Err(StoreError::LockPoisoned)
        ));
    }
}
