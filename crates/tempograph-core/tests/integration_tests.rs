//! Tempograph Core Integration Tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use tempograph_core::{
    Result,
    config::{CircuitConfig, Config, DegradationPolicy, RetryConfig},
    domain::{Disposition, EpisodeState, IngestionStatus, NewEpisode},
    error::{ErrorCategory, ProviderError},
    infrastructure::graph::SqliteGraphStore,
    ingest::{IngestionPipeline, NotificationSink, PermanentFailure, RetryLedger},
    llm::{ExtractedEntity, ExtractedFact, ExtractedGraph, InferenceProvider},
    storage::{Database, DatabaseConfig},
};

/// Extracts `A relation B` clauses separated by `;`
#[derive(Default)]
struct ScriptedProvider {
    failing: AtomicBool,
    extract_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn failing() -> Self {
        let provider = Self::default();
        provider.failing.store(true, Ordering::SeqCst);
        provider
    }

    fn check(&self) -> std::result::Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ProviderError::network("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        self.check()?;
        Ok(vec![text.len() as f32, 0.5, -0.5])
    }

    async fn extract_entities(&self, text: &str) -> std::result::Result<ExtractedGraph, ProviderError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let mut graph = ExtractedGraph::default();
        for clause in text.split(';') {
            let parts: Vec<&str> = clause.split_whitespace().collect();
            let [source, relation, target] = parts.as_slice() else {
                continue;
            };
            for name in [source, target] {
                if !graph.entities.iter().any(|e| e.name == *name) {
                    graph.entities.push(ExtractedEntity {
                        name: name.to_string(),
                        summary: None,
                    });
                }
            }
            graph.facts.push(ExtractedFact {
                source: source.to_string(),
                target: target.to_string(),
                relation: relation.to_string(),
                fact: clause.trim().to_string(),
            });
        }
        Ok(graph)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    failures: Mutex<Vec<PermanentFailure>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn permanent_failure(&self, failure: &PermanentFailure) -> Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }
}

struct TestPipeline {
    _temp_dir: TempDir,
    db: Database,
    pipeline: IngestionPipeline,
    provider: Arc<ScriptedProvider>,
    notifier: Arc<RecordingNotifier>,
}

impl TestPipeline {
    fn store(&self) -> SqliteGraphStore {
        SqliteGraphStore::new(self.db.pool().clone())
    }
}

fn test_config(policy: DegradationPolicy) -> Config {
    let mut config = Config::default();
    config.degradation.policy = policy;
    config.circuit = CircuitConfig {
        failure_threshold: 1,
        half_open_max_calls: 1,
        ..CircuitConfig::default()
    };
    config.retry = RetryConfig {
        max_attempts: 3,
        backoff_schedule_secs: vec![0],
        ..RetryConfig::default()
    };
    config
}

async fn open_db(dir: &TempDir) -> Database {
    Database::new(DatabaseConfig::with_path(dir.path().join("graph.db")))
        .await
        .unwrap()
}

fn build(
    db: &Database,
    config: Config,
    provider: Arc<ScriptedProvider>,
    notifier: Arc<RecordingNotifier>,
) -> IngestionPipeline {
    IngestionPipeline::builder(config.clone())
        .provider(provider)
        .store(Arc::new(SqliteGraphStore::new(db.pool().clone())))
        .ledger(RetryLedger::new(db.pool().clone(), &config.retry))
        .notifier(notifier)
        .build()
        .unwrap()
}

async fn create_pipeline(config: Config, provider: ScriptedProvider) -> TestPipeline {
    let temp_dir = TempDir::new().unwrap();
    let db = open_db(&temp_dir).await;
    let provider = Arc::new(provider);
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = build(&db, config, provider.clone(), notifier.clone());

    TestPipeline {
        _temp_dir: temp_dir,
        db,
        pipeline,
        provider,
        notifier,
    }
}

fn episode(group: &str, body: &str) -> NewEpisode {
    NewEpisode::new(group, "chat", body, Utc.with_ymd_and_hms(2025, 5, 20, 14, 30, 0).unwrap())
}

#[tokio::test]
async fn test_full_ingestion_on_disk() {
    let t = create_pipeline(test_config(DegradationPolicy::StoreRawAndRetry), ScriptedProvider::default()).await;

    let disposition = t
        .pipeline
        .submit_and_wait(episode("proj", "Dana owns Billing; Billing uses Postgres"))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::CommittedFull { entities: 3, facts: 2 });

    let store = t.store();
    let entities = store.list_entities("proj").await.unwrap();
    assert_eq!(entities.len(), 3);
    for entity in &entities {
        assert_eq!(
            entity.name_embedding,
            Some(vec![entity.name.len() as f32, 0.5, -0.5])
        );
    }
    assert!(store.list_edges("proj").await.unwrap().iter().all(|e| e.fact_embedding.is_some()));
}

#[tokio::test]
async fn test_submit_episode_then_poll_status() {
    let t = create_pipeline(test_config(DegradationPolicy::StoreRawAndRetry), ScriptedProvider::default()).await;

    let id = t
        .pipeline
        .submit_episode(episode("proj", "Dana owns Billing"))
        .await
        .unwrap();

    let mut status = t.pipeline.get_ingestion_status(id).await.unwrap();
    for _ in 0..100 {
        if status.as_ref().is_some_and(IngestionStatus::is_terminal) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        status = t.pipeline.get_ingestion_status(id).await.unwrap();
    }

    assert_eq!(status, Some(IngestionStatus::CommittedFull));
}

#[tokio::test]
async fn test_degraded_resubmission_keeps_one_episode() {
    let t = create_pipeline(test_config(DegradationPolicy::StoreRawAndRetry), ScriptedProvider::failing()).await;
    let new = episode("proj", "Dana owns Billing");
    let id = new.derive_id();

    let first = t.pipeline.submit_and_wait(new.clone()).await.unwrap();
    let second = t.pipeline.submit_and_wait(new).await.unwrap();

    assert!(matches!(first, Disposition::CommittedDegraded { retry_scheduled: true, .. }));
    assert!(matches!(
        second,
        Disposition::CommittedDegraded {
            category: ErrorCategory::CircuitOpen,
            retry_scheduled: true,
            ..
        }
    ));

    let store = t.store();
    assert_eq!(store.count_episodes_with_id(id).await.unwrap(), 1);
    assert_eq!(store.list_episodes("proj").await.unwrap().len(), 1);
    assert_eq!(t.pipeline.ledger().len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_fail_policy_rejects_with_category() {
    let t = create_pipeline(test_config(DegradationPolicy::Fail), ScriptedProvider::failing()).await;

    let first = t.pipeline.submit_and_wait(episode("proj", "a knows b")).await.unwrap();
    assert_eq!(first.category(), Some(ErrorCategory::ProviderNetwork));
    assert!(!first.is_committed());

    // Open circuit: rejected fast with a retry-after hint
    match t.pipeline.submit_and_wait(episode("proj", "b knows c")).await.unwrap() {
        Disposition::Rejected {
            category,
            retry_after,
            ..
        } => {
            assert_eq!(category, ErrorCategory::CircuitOpen);
            assert!(retry_after.is_some());
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(t.provider.extract_calls.load(Ordering::SeqCst), 1);
    assert!(t.store().list_episodes("proj").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_notify_once() {
    let mut config = test_config(DegradationPolicy::StoreRawAndRetry);
    // Let every drain pass reach the provider
    config.circuit.recovery_timeout_secs = 0;
    let t = create_pipeline(config, ScriptedProvider::failing()).await;

    let new = episode("proj", "Dana owns Billing");
    let id = new.derive_id();
    t.pipeline.submit_and_wait(new).await.unwrap();

    let first = t.pipeline.drain_retries_once().await.unwrap();
    assert_eq!(first.rescheduled, 1);
    assert_eq!(t.pipeline.ledger().get(id).await.unwrap().unwrap().attempt_count, 1);

    let second = t.pipeline.drain_retries_once().await.unwrap();
    assert_eq!(second.rescheduled, 1);

    let third = t.pipeline.drain_retries_once().await.unwrap();
    assert_eq!(third.exhausted, 1);
    assert!(t.pipeline.ledger().get(id).await.unwrap().is_none());

    let idle = t.pipeline.drain_retries_once().await.unwrap();
    assert_eq!(idle.attempted(), 0);

    let failures = t.notifier.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].episode_id, id);
    assert_eq!(failures[0].attempts, 3);
    assert_eq!(failures[0].last_error_category, ErrorCategory::ProviderNetwork);

    // Still stored raw
    assert_eq!(
        t.store().get_episode(id).await.unwrap().unwrap().state,
        EpisodeState::Raw
    );
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(DegradationPolicy::StoreRawAndRetry);
    let new = episode("proj", "Dana owns Billing");
    let id = new.derive_id();

    {
        let db = open_db(&temp_dir).await;
        let pipeline = build(
            &db,
            config.clone(),
            Arc::new(ScriptedProvider::failing()),
            Arc::new(RecordingNotifier::default()),
        );
        pipeline.submit_and_wait(new).await.unwrap();
        db.close().await;
    }

    let db = open_db(&temp_dir).await;
    let pipeline = build(
        &db,
        config,
        Arc::new(ScriptedProvider::default()),
        Arc::new(RecordingNotifier::default()),
    );

    assert_eq!(
        pipeline.get_ingestion_status(id).await.unwrap(),
        Some(IngestionStatus::CommittedDegraded {
            category: Some(ErrorCategory::ProviderNetwork),
            retry_after: None,
        })
    );

    // Fresh process, fresh circuit
    let report = pipeline.drain_retries_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(
        pipeline.get_ingestion_status(id).await.unwrap(),
        Some(IngestionStatus::CommittedFull)
    );

    let store = SqliteGraphStore::new(db.pool().clone());
    assert_eq!(store.get_episode(id).await.unwrap().unwrap().state, EpisodeState::Full);
    assert_eq!(store.list_entities("proj").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_full_ledger_is_reported() {
    let mut config = test_config(DegradationPolicy::StoreRawAndRetry);
    config.retry.max_ledger_size = 1;
    let t = create_pipeline(config, ScriptedProvider::failing()).await;

    let first = t.pipeline.submit_and_wait(episode("proj", "a knows b")).await.unwrap();
    let second = t.pipeline.submit_and_wait(episode("proj", "b knows c")).await.unwrap();

    assert!(matches!(first, Disposition::CommittedDegraded { retry_scheduled: true, .. }));
    match second {
        Disposition::CommittedDegraded {
            category,
            retry_after,
            retry_scheduled,
        } => {
            assert_eq!(category, ErrorCategory::LedgerFull);
            assert!(retry_after.is_some());
            assert!(!retry_scheduled);
        }
        other => panic!("expected degraded commit, got {:?}", other),
    }
    // The raw episode is still committed
    assert_eq!(t.store().list_episodes("proj").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_groups_are_independent() {
    let t = create_pipeline(test_config(DegradationPolicy::StoreRawAndRetry), ScriptedProvider::default()).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        for group in ["alpha", "beta"] {
            let new = NewEpisode::new(
                group,
                format!("turn {}", i),
                format!("user{} asks bot", i),
                Utc::now(),
            );
            ids.push((group, t.pipeline.submit_episode(new).await.unwrap()));
        }
    }

    // A final episode per group drains everything queued before it
    for group in ["alpha", "beta"] {
        t.pipeline
            .submit_and_wait(NewEpisode::new(group, "last", "bot answers user0", Utc::now()))
            .await
            .unwrap();
    }

    let store = t.store();
    for (group, id) in ids {
        let node = store.get_episode(id).await.unwrap().unwrap();
        assert_eq!(node.episode.group_id, group);
        assert_eq!(node.state, EpisodeState::Full);
    }

    // Each group's bot entity is its own node
    for group in ["alpha", "beta"] {
        let bots = store
            .list_entities(group)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.canonical_name == "bot")
            .count();
        assert_eq!(bots, 1);
    }
}
