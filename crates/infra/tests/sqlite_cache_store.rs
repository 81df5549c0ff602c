//! SQLite cache store against a real database file.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tempfile::TempDir;

use skillrun_core::{ErrorClass, IdempotencyKey, OperationScope, OwnerToken, RetryAttempt};
use skillrun_infra::cache_store::r#trait::deadline;
use skillrun_infra::cache_store::{
    CacheStore, ClaimOutcome, ClaimRequest, CommitOutcome, EntryStatus, SqliteCacheStore,
    TerminalOutcome, TerminalRecord,
};
use skillrun_infra::config::{CacheConfig, ConflictMode, SkillrunConfig};
use skillrun_infra::retry::{OperationFailure, RecordingSleeper, RetryExecutor};

fn open(dir: &TempDir) -> SqliteCacheStore {
    skillrun_observability::init_with_default_filter("skillrun_infra=debug,warn");
    let config = CacheConfig::at(dir.path().join("nested").join("cache.sqlite3")).with_pool_size(8);
    SqliteCacheStore::open(&config).unwrap()
}

fn scope() -> OperationScope {
    OperationScope::parse("acme", "lifecycle-audit", "extract").unwrap()
}

fn request(owner: OwnerToken, ttl: Duration) -> ClaimRequest {
    let scope = scope();
    ClaimRequest {
        key: IdempotencyKey::derive(&scope, &json!({"ids": [1, 2, 3]})).unwrap(),
        scope,
        owner,
        claim_ttl: ttl,
    }
}

fn success(ttl: Duration) -> TerminalRecord {
    let now = Utc::now();
    TerminalRecord {
        outcome: TerminalOutcome::Succeeded {
            output: json!({"rows": [1, 2, 3], "note": "ok"}),
        },
        attempt_count: 2,
        total_duration_ms: 1_250,
        attempts: vec![
            RetryAttempt::failed(1, now, Duration::from_millis(40), ErrorClass::TransientApi, "503"),
            RetryAttempt::succeeded(2, now, Duration::from_millis(30)),
        ],
        expires_at: deadline(now, ttl),
    }
}

#[test]
fn open_creates_parent_directory_and_table() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    assert!(store.path().exists());
    assert_eq!(store.stats(Utc::now()).unwrap().pending, 0);
}

#[test]
fn claim_commit_and_read_back() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let owner = OwnerToken::new();
    let req = request(owner, Duration::from_secs(60));

    assert!(matches!(store.try_claim(&req, Utc::now()).unwrap(), ClaimOutcome::Claimed(_)));

    let pending = store.get(&req.key, Utc::now()).unwrap().unwrap();
    assert_eq!(pending.status, EntryStatus::Pending);
    assert_eq!(pending.owner_token, owner);
    assert_eq!(pending.scope, scope());

    assert_eq!(
        store.commit(&req.key, owner, success(Duration::from_secs(3600)), Utc::now()).unwrap(),
        CommitOutcome::Committed
    );

    let entry = store.get(&req.key, Utc::now()).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Succeeded);
    assert_eq!(entry.output, Some(json!({"rows": [1, 2, 3], "note": "ok"})));
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.total_duration_ms, 1_250);
    assert_eq!(entry.attempts.len(), 2);
    assert_eq!(entry.attempts[0].error_class, Some(ErrorClass::TransientApi));

    let replay = entry.to_cached_result();
    assert!(replay.cached && replay.success);
}

#[test]
fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let owner = OwnerToken::new();
    let req = request(owner, Duration::from_secs(60));

    {
        let store = open(&dir);
        store.try_claim(&req, Utc::now()).unwrap();
        store.commit(&req.key, owner, success(Duration::from_secs(3600)), Utc::now()).unwrap();
    }

    let store = open(&dir);
    match store.try_claim(&request(OwnerToken::new(), Duration::from_secs(60)), Utc::now()).unwrap() {
        ClaimOutcome::AlreadyTerminal(entry) => assert_eq!(entry.status, EntryStatus::Succeeded),
        other => panic!("expected terminal entry, got {other:?}"),
    }
}

#[test]
fn two_handles_race_for_one_claim() {
    let dir = TempDir::new().unwrap();
    let handles = [open(&dir), open(&dir)];
    let winners = Arc::new(AtomicUsize::new(0));
    let now = Utc::now();

    let threads: Vec<_> = (0..16)
        .map(|i| {
            let store = handles[i % 2].clone();
            let winners = winners.clone();
            std::thread::spawn(move || {
                let req = request(OwnerToken::new(), Duration::from_secs(60));
                if let ClaimOutcome::Claimed(_) = store.try_claim(&req, now).unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(handles[0].stats(now).unwrap().pending, 1);
}

#[test]
fn expired_claim_is_reclaimed_and_old_owner_goes_stale() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let first = OwnerToken::new();
    let t0 = Utc::now();

    store.try_claim(&request(first, Duration::from_millis(10)), t0).unwrap();

    let later = t0 + chrono::Duration::milliseconds(50);
    let second = OwnerToken::new();
    let reclaimed = store.try_claim(&request(second, Duration::from_secs(60)), later).unwrap();
    assert!(matches!(reclaimed, ClaimOutcome::Claimed(_)));

    let key = request(first, Duration::ZERO).key;
    assert_eq!(
        store.commit(&key, first, success(Duration::from_secs(60)), later).unwrap(),
        CommitOutcome::StaleOwner
    );
    assert_eq!(
        store.commit(&key, second, success(Duration::from_secs(60)), later).unwrap(),
        CommitOutcome::Committed
    );
    assert_eq!(
        store.commit(&key, second, success(Duration::from_secs(60)), later).unwrap(),
        CommitOutcome::StaleOwner
    );
}

#[test]
fn failed_entries_store_class_and_message() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let owner = OwnerToken::new();
    let req = request(owner, Duration::from_secs(60));
    let now = Utc::now();

    store.try_claim(&req, now).unwrap();
    let record = TerminalRecord {
        outcome: TerminalOutcome::Failed {
            class: ErrorClass::ValidationError,
            message: "ids must be non-empty".into(),
        },
        attempt_count: 1,
        total_duration_ms: 3,
        attempts: vec![],
        expires_at: deadline(now, Duration::from_secs(60)),
    };
    store.commit(&req.key, owner, record, now).unwrap();

    let entry = store.get(&req.key, now).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.output, None);
    assert_eq!(entry.error_class, Some(ErrorClass::ValidationError));
    assert_eq!(entry.error_message.as_deref(), Some("ids must be non-empty"));
    assert_eq!(store.stats(now).unwrap().failed, 1);
}

#[test]
fn purge_and_invalidate() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let now = Utc::now();

    let short = request(OwnerToken::new(), Duration::from_millis(5));
    store.try_claim(&short, now).unwrap();

    let scope = OperationScope::parse("acme", "lifecycle-audit", "report").unwrap();
    let long = ClaimRequest {
        key: IdempotencyKey::derive(&scope, &json!({"ids": [9]})).unwrap(),
        scope,
        owner: OwnerToken::new(),
        claim_ttl: Duration::from_secs(60),
    };
    store.try_claim(&long, now).unwrap();

    let later = now + chrono::Duration::seconds(1);
    assert!(store.get(&short.key, later).unwrap().is_none());
    assert_eq!(store.stats(later).unwrap().expired, 1);
    assert_eq!(store.purge_expired(later).unwrap(), 1);
    assert_eq!(store.stats(later).unwrap().expired, 0);

    assert!(store.invalidate(&long.key).unwrap());
    assert!(!store.invalidate(&long.key).unwrap());
    assert!(store.get(&long.key, later).unwrap().is_none());
}

#[test]
fn executor_over_sqlite_runs_once_across_handles() {
    let dir = TempDir::new().unwrap();
    let config = SkillrunConfig {
        conflict: ConflictMode::Wait {
            poll_interval_ms: 5,
            max_poll_interval_ms: 25,
            max_wait_ms: 10_000,
        },
        ..SkillrunConfig::default()
    };
    let calls = Arc::new(AtomicU32::new(0));

    let threads: Vec<_> = (0..6)
        .map(|_| {
            let store = open(&dir);
            let config = config.clone();
            let calls = calls.clone();
            std::thread::spawn(move || {
                let executor = RetryExecutor::new(store, &config);
                let op = move |_: &JsonValue| -> anyhow::Result<JsonValue> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(80));
                    Ok(json!({"rows": 3}))
                };
                executor
                    .execute_with_retry(&op, "acme", "lifecycle-audit", "extract", &json!({"ids": [1, 2, 3]}))
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.committed).count(), 1);
    assert!(results.iter().all(|r| r.success));
}

#[test]
fn acme_scenario_persists_terminal_failure() {
    let dir = TempDir::new().unwrap();
    let config = SkillrunConfig {
        idempotency: skillrun_infra::config::IdempotencyConfig {
            failure_ttl_ms: 60_000,
            ..Default::default()
        },
        ..SkillrunConfig::default()
    };
    let sleeper = Arc::new(RecordingSleeper::new());
    let executor = RetryExecutor::new(open(&dir), &config).with_sleeper(sleeper.clone());
    let op = |_: &JsonValue| -> anyhow::Result<JsonValue> {
        Err(OperationFailure::transient("rate limited").into())
    };

    let result = executor
        .execute_with_retry(&op, "acme", "lifecycle-audit", "extract", &json!({"ids": [1, 2, 3]}))
        .unwrap();
    assert_eq!(result.attempt_count, 5);
    assert_eq!(sleeper.calls().len(), 4);

    let replay = executor
        .execute_with_retry(&op, "acme", "lifecycle-audit", "extract", &json!({"ids": [1, 2, 3]}))
        .unwrap();
    assert!(replay.cached);
    assert!(!replay.success);
    assert_eq!(replay.error_class, Some(ErrorClass::TransientApi));
    assert_eq!(replay.attempt_count, 5);
    assert_eq!(replay.attempts.len(), 5);
}

#[test]
fn cached_hit_is_served_while_another_writer_holds_the_lock() {
    let dir = TempDir::new().unwrap();
    let cache = CacheConfig {
        busy_timeout_ms: 200,
        ..CacheConfig::at(dir.path().join("cache.sqlite3")).with_pool_size(4)
    };
    let executor = RetryExecutor::new(SqliteCacheStore::open(&cache).unwrap(), &SkillrunConfig::default());
    let op = |_: &JsonValue| -> anyhow::Result<JsonValue> { Ok(json!({"rows": 3})) };
    let input = json!({"ids": [1, 2, 3]});

    let first = executor
        .execute_with_retry(&op, "acme", "lifecycle-audit", "extract", &input)
        .unwrap();
    assert!(first.committed);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let options = SqliteConnectOptions::new().filename(&cache.path);
    let mut writer = runtime.block_on(SqliteConnection::connect_with(&options)).unwrap();
    runtime.block_on(sqlx::query("BEGIN IMMEDIATE").execute(&mut writer)).unwrap();

    let replay = executor
        .execute_with_retry(&op, "acme", "lifecycle-audit", "extract", &input)
        .unwrap();
    assert!(replay.cached);
    assert!(replay.success);
    assert_eq!(replay.output, Some(json!({"rows": 3})));

    runtime.block_on(sqlx::query("ROLLBACK").execute(&mut writer)).unwrap();
    runtime.block_on(writer.close()).unwrap();
}
