//! End-to-end scheduler tests with scripted transport and adapter doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bookfetch_core::cancel::CancelToken;
use bookfetch_core::db::Database;
use bookfetch_core::fetch::{FetchError, RateLimiter, RetryPolicy, Transport};
use bookfetch_core::scheduler::{
    FailureClass, Progress, ScheduleConfig, ScheduleError, Scheduler,
};
use bookfetch_core::source::{ExtractedChapter, SourceAdapter, SourceRegistry};
use bookfetch_core::store::{ChapterRange, ChapterRecord, ChapterRef, ChapterStore, Item, SourceId};

const HOST: &str = "https://fake.test";

type Scripted = Result<Vec<u8>, u16>;

/// Transport whose responses are scripted per URL.
///
/// URLs without a script succeed with placeholder content. Scripted
/// responses are consumed front to back; the last one repeats.
struct FakeTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: AtomicU32,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn script(&self, url: impl Into<String>, responses: Vec<Scripted>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(url.into(), responses.into());
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut scripts = self.scripts.lock().expect("scripts lock");
        let Some(queue) = scripts.get_mut(url) else {
            return Ok(format!("content of {url}").into_bytes());
        };

        let response = if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue")
        } else {
            queue.front().cloned().expect("non-empty queue")
        };
        match response {
            Ok(bytes) => Ok(bytes),
            Err(status) => Err(FetchError::http_status(url, status)),
        }
    }
}

/// Adapter for the fake site: chapter lists are JSON, chapters are text.
struct FakeAdapter {
    name: &'static str,
}

fn toc_url(item_id: &str) -> String {
    format!("{HOST}/{item_id}/toc")
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn throttle_key(&self) -> &str {
        "fake.test"
    }

    async fn fetch_chapter_list(
        &self,
        transport: &dyn Transport,
        item_id: &str,
    ) -> Result<Vec<ChapterRef>, FetchError> {
        let url = toc_url(item_id);
        let bytes = transport.request(&url).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::malformed(url, format!("bad chapter list: {e}")))
    }

    fn chapter_url(&self, item_id: &str, chapter_id: &str) -> String {
        format!("{HOST}/{item_id}/{chapter_id}")
    }

    fn extract_chapter(&self, raw: &[u8], chapter_id: &str) -> Option<ExtractedChapter> {
        if raw.is_empty() {
            return None;
        }
        Some(ExtractedChapter::new(
            format!("Chapter {chapter_id}"),
            String::from_utf8_lossy(raw).into_owned(),
        ))
    }
}

struct TestEnv {
    transport: Arc<FakeTransport>,
    store: ChapterStore,
    scheduler: Scheduler,
    source: SourceId,
}

/// Single-source environment with an in-memory store and no rate limits.
async fn single_source_env(config: ScheduleConfig) -> TestEnv {
    let db = Database::new_in_memory().await.expect("database");
    let mut registry = SourceRegistry::new();
    let source = registry.register(Arc::new(FakeAdapter { name: "fake" }), 1);
    let store = ChapterStore::new(db, Arc::new(registry));

    let transport = Arc::new(FakeTransport::new());
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(RateLimiter::disabled()),
        RetryPolicy::default(),
        config,
    )
    .expect("scheduler config");

    TestEnv {
        transport,
        store,
        scheduler,
        source,
    }
}

fn snapshot_item(id: &str, count: usize) -> Item {
    let chapters = (1..=count)
        .map(|i| ChapterRef::new(format!("c{i}"), i))
        .collect();
    Item::new(id).with_snapshot(chapters)
}

#[tokio::test]
async fn test_full_run_acquires_every_chapter() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    let mut snapshots: Vec<Progress> = Vec::new();
    let report = env
        .scheduler
        .run_with_progress(&snapshot_item("book", 3), env.source, &cancel, |p| {
            snapshots.push(p);
        })
        .await
        .expect("run");

    assert_eq!(report.acquired, 3);
    assert_eq!(report.skipped, 0);
    assert!(report.is_complete());
    assert_eq!(env.store.count().await.expect("count"), 3);
    assert_eq!(env.transport.calls(), 3);

    // Progress is monotonic and ends complete
    for pair in snapshots.windows(2) {
        assert!(pair[1].done >= pair[0].done);
    }
    let last = snapshots.last().expect("at least one snapshot");
    assert_eq!((last.done, last.total), (3, 3));
}

#[tokio::test]
async fn test_enumeration_via_adapter() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    let chapters = vec![ChapterRef::new("c1", 1), ChapterRef::new("c2", 2)];
    env.transport.script(
        toc_url("book"),
        vec![Ok(serde_json::to_vec(&chapters).expect("json"))],
    );

    let report = env
        .scheduler
        .run(&Item::new("book"), env.source, &cancel)
        .await
        .expect("run");

    assert_eq!(report.acquired, 2);
    // One toc request plus one per chapter
    assert_eq!(env.transport.calls(), 3);
}

#[tokio::test]
async fn test_enumeration_failure_fails_the_run() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    env.transport.script(toc_url("book"), vec![Err(404)]);

    let result = env.scheduler.run(&Item::new("book"), env.source, &cancel).await;

    assert!(matches!(result, Err(ScheduleError::Enumeration { .. })));
    assert_eq!(env.store.count().await.expect("count"), 0);
}

#[tokio::test]
async fn test_skip_on_exists_spends_no_network_traffic() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    for i in 1..=3 {
        env.store
            .upsert(&ChapterRecord::new(
                format!("c{i}"),
                env.source,
                format!("Chapter {i}"),
                "already here",
            ))
            .await
            .expect("upsert");
    }

    let mut snapshots: Vec<Progress> = Vec::new();
    let report = env
        .scheduler
        .run_with_progress(&snapshot_item("book", 3), env.source, &cancel, |p| {
            snapshots.push(p);
        })
        .await
        .expect("run");

    assert_eq!(report.skipped, 3);
    assert_eq!(report.acquired, 0);
    assert!(report.is_complete());
    assert_eq!(env.transport.calls(), 0, "skips must not touch the network");

    // A fully-acquired item reports complete immediately
    assert_eq!(
        (snapshots[0].done, snapshots[0].total),
        (3, 3),
        "first snapshot should already be complete"
    );
}

#[tokio::test]
async fn test_refetch_when_skip_existing_disabled() {
    let env = single_source_env(ScheduleConfig {
        skip_existing: false,
        ..ScheduleConfig::default()
    })
    .await;
    let cancel = CancelToken::new();

    env.store
        .upsert(&ChapterRecord::new("c1", env.source, "Old", "stale"))
        .await
        .expect("upsert");

    let report = env
        .scheduler
        .run(&snapshot_item("book", 1), env.source, &cancel)
        .await
        .expect("run");

    assert_eq!(report.acquired, 1);
    assert_eq!(report.skipped, 0);

    let record = env
        .store
        .get("c1", env.source)
        .await
        .expect("get")
        .expect("record");
    assert_ne!(record.body, "stale", "content should have been replaced");
}

#[tokio::test]
async fn test_mixed_outcomes_partial_success() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    env.transport
        .script(format!("{HOST}/book/c2"), vec![Err(403)]);

    let report = env
        .scheduler
        .run(&snapshot_item("book", 3), env.source, &cancel)
        .await
        .expect("run");

    assert_eq!(report.acquired, 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_complete());

    let failure = &report.failures[0];
    assert_eq!(failure.chapter_id, "c2");
    assert_eq!(failure.class, FailureClass::AuthRequired);

    // The failed chapter left no partial record behind
    assert_eq!(env.store.count().await.expect("count"), 2);
    assert!(!env.store.exists("c2", None).await.expect("exists"));
}

#[tokio::test]
async fn test_interrupted_run_resumes_without_refetching() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    // First run: c2's source is down permanently
    env.transport
        .script(format!("{HOST}/book/c2"), vec![Err(404)]);
    let report = env
        .scheduler
        .run(&snapshot_item("book", 3), env.source, &cancel)
        .await
        .expect("first run");
    assert_eq!(report.acquired, 2);
    assert_eq!(report.failed(), 1);

    let calls_after_first = env.transport.calls();
    assert_eq!(calls_after_first, 3);

    // Source recovers; second run fetches only the missing chapter
    env.transport
        .script(format!("{HOST}/book/c2"), vec![Ok(b"recovered text".to_vec())]);
    let report = env
        .scheduler
        .run(&snapshot_item("book", 3), env.source, &cancel)
        .await
        .expect("second run");

    assert_eq!(report.skipped, 2);
    assert_eq!(report.acquired, 1);
    assert!(report.is_complete());
    assert_eq!(
        env.transport.calls() - calls_after_first,
        1,
        "resume must fetch only the missing chapter"
    );
    assert_eq!(env.store.count().await.expect("count"), 3);
}

#[tokio::test]
async fn test_range_restriction_limits_work_set() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    let item = snapshot_item("book", 5)
        .with_range(ChapterRange::bounded(Some(2), Some(4)).ignoring([3]));

    let report = env.scheduler.run(&item, env.source, &cancel).await.expect("run");

    // Positions 2 and 4 only
    assert_eq!(report.acquired, 2);
    assert!(env.store.exists("c2", None).await.expect("exists"));
    assert!(!env.store.exists("c3", None).await.expect("exists"));
    assert!(env.store.exists("c4", None).await.expect("exists"));
    assert!(!env.store.exists("c5", None).await.expect("exists"));
}

#[tokio::test]
async fn test_unknown_source_is_rejected() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    let result = env
        .scheduler
        .run(&snapshot_item("book", 1), SourceId(99), &cancel)
        .await;

    assert!(matches!(result, Err(ScheduleError::UnknownSource(_))));
}

#[tokio::test]
async fn test_cancel_before_run_settles_nothing() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = env
        .scheduler
        .run(&snapshot_item("book", 3), env.source, &cancel)
        .await
        .expect("run");

    assert!(report.cancelled);
    assert_eq!(report.acquired, 0);
    assert_eq!(env.transport.calls(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_stops_new_dispatch() {
    let env = single_source_env(ScheduleConfig {
        workers: 1,
        ..ScheduleConfig::default()
    })
    .await;
    let cancel = CancelToken::new();

    let canceller = cancel.clone();
    let report = env
        .scheduler
        .run_with_progress(&snapshot_item("book", 3), env.source, &cancel, move |p| {
            if p.done >= 1 {
                canceller.cancel();
            }
        })
        .await
        .expect("run");

    assert!(report.cancelled);
    assert!(
        report.settled() < 3,
        "cancellation should leave chapters unsettled, settled {}",
        report.settled()
    );
    // Whatever settled before the cancel is durable
    assert_eq!(
        env.store.count().await.expect("count") as usize,
        report.acquired
    );
}

#[tokio::test]
async fn test_run_many_isolates_item_failures() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    // First item's listing is gone; second enumerates fine
    env.transport.script(toc_url("broken"), vec![Err(404)]);
    let chapters = vec![ChapterRef::new("g1", 1), ChapterRef::new("g2", 2)];
    env.transport.script(
        toc_url("good"),
        vec![Ok(serde_json::to_vec(&chapters).expect("json"))],
    );

    let items = vec![Item::new("broken"), Item::new("good")];
    let results = env.scheduler.run_many(&items, env.source, &cancel).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "broken");
    assert!(matches!(
        results[0].1,
        Err(ScheduleError::Enumeration { .. })
    ));

    assert_eq!(results[1].0, "good");
    let report = results[1].1.as_ref().expect("second item should run");
    assert_eq!(report.acquired, 2);
    assert!(env.store.exists("g1", None).await.expect("exists"));
}

#[tokio::test]
async fn test_run_many_cancel_skips_unstarted_items() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let items = vec![snapshot_item("a", 1), snapshot_item("b", 1)];
    let results = env.scheduler.run_many(&items, env.source, &cancel).await;

    for (id, result) in &results {
        let report = result.as_ref().unwrap_or_else(|_| panic!("{id} should not error"));
        assert!(report.cancelled, "{id} should report cancelled");
        assert_eq!(report.acquired, 0);
    }
    assert_eq!(env.transport.calls(), 0);
}

#[tokio::test]
async fn test_better_copy_skips_worse_source_but_not_vice_versa() {
    let db = Database::new_in_memory().await.expect("database");
    let mut registry = SourceRegistry::new();
    let paid = registry.register(Arc::new(FakeAdapter { name: "paid" }), 5);
    let free = registry.register(Arc::new(FakeAdapter { name: "free" }), 10);
    let store = ChapterStore::new(db, Arc::new(registry));

    let transport = Arc::new(FakeTransport::new());
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(RateLimiter::disabled()),
        RetryPolicy::default(),
        ScheduleConfig::default(),
    )
    .expect("scheduler");
    let cancel = CancelToken::new();

    // A paid (better) copy of c1 already exists: the free run skips it
    store
        .upsert(&ChapterRecord::new("c1", paid, "Paid c1", "full"))
        .await
        .expect("upsert");
    let report = scheduler
        .run(&snapshot_item("book", 1), free, &cancel)
        .await
        .expect("free run");
    assert_eq!(report.skipped, 1);
    assert_eq!(transport.calls(), 0);

    // Only a free (worse) copy of c2 exists: the paid run fetches it
    store
        .upsert(&ChapterRecord::new("c2", free, "Free c2", "preview"))
        .await
        .expect("upsert");
    let item = Item::new("book").with_snapshot(vec![ChapterRef::new("c2", 2)]);
    let report = scheduler.run(&item, paid, &cancel).await.expect("paid run");
    assert_eq!(report.acquired, 1);

    let best = store.get_best("c2").await.expect("get_best").expect("record");
    assert_eq!(best.source_id, paid, "paid copy should now win resolution");
}

#[tokio::test]
async fn test_extraction_failure_reported_distinctly() {
    let env = single_source_env(ScheduleConfig::default()).await;
    let cancel = CancelToken::new();

    // Fetch succeeds with an empty body the adapter cannot extract
    env.transport
        .script(format!("{HOST}/book/c1"), vec![Ok(Vec::new())]);

    let report = env
        .scheduler
        .run(&snapshot_item("book", 1), env.source, &cancel)
        .await
        .expect("run");

    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].class, FailureClass::Extraction);
    assert_eq!(env.store.count().await.expect("count"), 0);
}
