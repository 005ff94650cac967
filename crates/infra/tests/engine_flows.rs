//! End-to-end flows through the public engine API, with remote providers scripted
//! by a stub transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde_json::{Value as JsonValue, json};

use tidemark_core::{AccountId, ConnectorKey, JobStatus, time};
use tidemark_events::{Notification, Notifier};
use tidemark_infra::http::{ApiResponse, RetryPolicy, StubTransport};
use tidemark_infra::jobs::{HandlerError, JsonMap, SIMULATE_JOB_TYPE, handler_fn};
use tidemark_infra::stores::{
    ActivityQuery, ActivitySink, AtlassianAccountStore, AtlassianService, CalendarAccountStore,
    CalendarCredentials, InMemoryCalendarStore, SyncStateStore,
};
use tidemark_infra::{Engine, EngineConfig, Stores};

const ME: &str = "u-me";
const IDLE: Duration = Duration::from_secs(30);

struct Harness {
    engine: Engine,
    stub: Arc<StubTransport>,
    calendars: Arc<InMemoryCalendarStore>,
}

fn harness(config: EngineConfig, stub: StubTransport) -> Harness {
    let calendars = Arc::new(InMemoryCalendarStore::new());
    let stores = Stores {
        calendars: calendars.clone(),
        ..Stores::in_memory()
    };
    let stub = Arc::new(stub);
    let engine = Engine::with_transport(config, stores, Notifier::default(), stub.clone());
    Harness {
        engine,
        stub,
        calendars,
    }
}

fn config() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy::no_retry())
}

fn recent(hours_ago: i64) -> String {
    time::format_timestamp(&(Utc::now() - ChronoDuration::hours(hours_ago)))
}

fn jira_issue(id: &str) -> JsonValue {
    json!({
        "id": id,
        "key": format!("OPS-{id}"),
        "fields": {
            "summary": "Rotate keys",
            "created": recent(5),
            "updated": recent(5),
            "creator": {"accountId": ME, "displayName": "Me"},
            "comment": {"comments": [
                {"id": format!("c{id}"), "author": {"accountId": ME}, "created": recent(4)}
            ]}
        }
    })
}

fn jira_stub() -> StubTransport {
    StubTransport::new()
        .json(
            Method::GET,
            "/rest/api/3/myself",
            json!({"accountId": ME, "displayName": "Me"}),
        )
        .json(
            Method::POST,
            "/rest/api/3/search/jql",
            json!({"issues": [jira_issue("1"), jira_issue("2")], "isLast": true}),
        )
}

fn account_payload(account_id: &AccountId) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("account_id".into(), json!(account_id));
    payload
}

async fn messages(engine: &Engine, job_id: tidemark_core::JobId) -> Vec<String> {
    engine
        .events(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.message)
        .collect()
}

#[tokio::test]
async fn jira_sync_is_idempotent_across_runs() {
    let h = harness(config(), jira_stub());
    let stores = h.engine.stores().clone();
    let account = stores
        .atlassian_accounts
        .create(AtlassianService::Jira, "acme", "me@acme.test", "token")
        .await
        .unwrap();
    let subscription = h.engine.notifier().subscribe();

    let first = h
        .engine
        .request_sync("jira", &account.account_id, false)
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(first).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
    let result = job.result.unwrap();
    assert_eq!(result["synced_events"], 4);
    assert_eq!(stores.activity.count().await.unwrap(), 4);
    assert!(
        stores
            .sync_state
            .last_sync_for("jira", &account.account_id)
            .await
            .unwrap()
            .is_some()
    );

    let second = h
        .engine
        .request_sync("jira", &account.account_id, true)
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(second).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(stores.activity.count().await.unwrap(), 4);

    let window = ActivityQuery::between(0, i64::MAX).with_source("jira");
    let listed = stores.activity.list(&window).await.unwrap();
    assert_eq!(listed.len(), 4);
    assert!(listed.windows(2).all(|w| w[0].event.event_ts >= w[1].event.event_ts));

    let syncs = subscription
        .drain()
        .into_iter()
        .filter(|n| matches!(n, Notification::ActivitySync { synced_events: 4, .. }))
        .count();
    assert_eq!(syncs, 2);
    let auth = &h.stub.requests_to("/rest/api/3/myself")[0].auth;
    assert!(auth.is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_inside_one_job() {
    let stub = StubTransport::new()
        .on(
            Method::GET,
            "/rest/api/3/myself",
            [
                ApiResponse::new(429, "slow down").with_header("Retry-After", "1"),
                ApiResponse::new(500, "oops"),
                ApiResponse::json(200, &json!({"accountId": ME})),
            ],
        )
        .json(
            Method::POST,
            "/rest/api/3/search/jql",
            json!({"issues": [], "isLast": true}),
        );
    let retry = RetryPolicy::default()
        .with_max_retries(2)
        .with_base_delay(Duration::from_millis(100));
    let h = harness(EngineConfig::default().with_retry(retry), stub);
    let account = h
        .engine
        .stores()
        .atlassian_accounts
        .create(AtlassianService::Jira, "acme", "me@acme.test", "token")
        .await
        .unwrap();

    let job_id = h
        .engine
        .request_sync("jira", &account.account_id, false)
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
    assert_eq!(h.stub.requests_to("/rest/api/3/myself").len(), 3);
}

#[tokio::test]
async fn permanent_errors_fail_the_job() {
    let stub = StubTransport::new().on(
        Method::GET,
        "/rest/api/3/myself",
        [ApiResponse::new(401, "bad credentials")],
    );
    let h = harness(config(), stub);
    let account = h
        .engine
        .stores()
        .atlassian_accounts
        .create(AtlassianService::Jira, "acme", "me@acme.test", "wrong")
        .await
        .unwrap();

    let job_id = h
        .engine
        .request_sync("jira", &account.account_id, false)
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().message.contains("401"));
    assert!(
        h.engine
            .stores()
            .sync_state
            .last_sync_for("jira", &account.account_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn calendar_sync_recovers_from_an_expired_cursor() {
    let start = Utc::now() + ChronoDuration::hours(2);
    let event = json!({
        "id": "standup",
        "summary": "Standup",
        "start": {"dateTime": time::format_timestamp(&start)},
        "end": {"dateTime": time::format_timestamp(&(start + ChronoDuration::minutes(15)))}
    });
    let stub = StubTransport::new()
        .json(
            Method::GET,
            "/users/me/calendarList",
            json!({"items": [{"id": "primary", "primary": true, "summary": "Me"}]}),
        )
        .on(
            Method::GET,
            "/events",
            [
                ApiResponse::new(410, "Gone"),
                ApiResponse::json(200, &json!({"items": [event], "nextSyncToken": "fresh"})),
            ],
        );
    let h = harness(config(), stub);
    let stores = h.engine.stores().clone();
    let account = stores
        .calendar_accounts
        .create(
            "google",
            Some("me@example.com".into()),
            None,
            CalendarCredentials {
                access_token: Some("tok".into()),
                refresh_token: Some("refresh".into()),
                expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            },
        )
        .await
        .unwrap();
    let key = ConnectorKey::collection("calendar", &account.account_id, "primary");
    stores
        .sync_state
        .upsert(&key, Some("stale".into()))
        .await
        .unwrap();

    let job_id = h
        .engine
        .request_sync("calendar", &account.account_id, false)
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
    assert_eq!(h.stub.requests_to("/events").len(), 2);
    assert_eq!(h.calendars.event_count(), 1);
    let cursor = stores.sync_state.get(&key).await.unwrap().unwrap().cursor;
    assert_eq!(cursor.as_deref(), Some("fresh"));
}

#[tokio::test(start_paused = true)]
async fn worker_cap_bounds_concurrency() {
    let h = harness(config().with_workers(2), StubTransport::new());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let running = running.clone();
        let peak = peak.clone();
        h.engine.register_handler(
            "test.busy",
            handler_fn(move |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(JsonMap::new())
                }
            }),
        );
    }

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(h.engine.submit("test.busy", JsonMap::new()).await.unwrap());
    }
    assert!(h.engine.snapshot().active <= 2);
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    assert!(peak.load(Ordering::SeqCst) <= 2);
    for id in ids {
        assert_eq!(h.engine.get(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }
    assert_eq!(h.engine.snapshot().active, 0);
}

#[tokio::test]
async fn unknown_job_types_fail_without_stalling_the_pool() {
    let h = harness(config().with_workers(1), StubTransport::new());

    let unknown = h.engine.submit("noop.unknown", JsonMap::new()).await.unwrap();
    let mut payload = JsonMap::new();
    payload.insert("simulate_ms".into(), json!(10));
    let simulated = h.engine.submit(SIMULATE_JOB_TYPE, payload).await.unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    let job = h.engine.get(unknown).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.unwrap().message,
        "no handler registered for job type noop.unknown"
    );
    assert_eq!(
        h.engine.get(simulated).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn terminal_jobs_ignore_cancel() {
    let h = harness(config(), StubTransport::new());
    h.engine
        .register_handler("test.quick", handler_fn(|_| async { Ok(JsonMap::new()) }));

    let job_id = h.engine.submit("test.quick", JsonMap::new()).await.unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);
    let before = messages(&h.engine, job_id).await;

    assert_eq!(h.engine.cancel(job_id).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(h.engine.cancel(job_id).await.unwrap(), JobStatus::Succeeded);

    assert_eq!(messages(&h.engine, job_id).await, before);
    assert_eq!(
        h.engine.get(job_id).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test(start_paused = true)]
async fn running_jobs_stop_at_their_next_checkpoint() {
    let h = harness(config(), StubTransport::new());
    let started = Arc::new(tokio::sync::Notify::new());
    {
        let started = started.clone();
        h.engine.register_handler(
            "test.loop",
            handler_fn(move |ctx| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    loop {
                        if let Err(err) = ctx.checkpoint().await {
                            return Err::<JsonMap, HandlerError>(err);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }),
        );
    }

    let job_id = h.engine.submit("test.loop", JsonMap::new()).await.unwrap();
    started.notified().await;
    assert_eq!(h.engine.cancel(job_id).await.unwrap(), JobStatus::Canceled);
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    assert_eq!(
        h.engine.get(job_id).await.unwrap().unwrap().status,
        JobStatus::Canceled
    );
    let cancels = messages(&h.engine, job_id)
        .await
        .into_iter()
        .filter(|m| m == "job canceled")
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn scheduler_cycle_skips_recently_synced_accounts() {
    let h = harness(config(), jira_stub());
    let stores = h.engine.stores().clone();
    let fresh = stores
        .atlassian_accounts
        .create(AtlassianService::Jira, "fresh", "me@acme.test", "token")
        .await
        .unwrap();
    let stale = stores
        .atlassian_accounts
        .create(AtlassianService::Jira, "stale", "me@acme.test", "token")
        .await
        .unwrap();
    stores
        .sync_state
        .upsert(&ConnectorKey::account("jira", &fresh.account_id), None)
        .await
        .unwrap();

    let queued = h.engine.scheduler().run_cycle().await.unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);

    assert_eq!(queued.len(), 1);
    let job = h.engine.get(queued[0]).await.unwrap().unwrap();
    assert_eq!(
        job.payload_str("account_id"),
        Some(stale.account_id.as_str())
    );
}

#[tokio::test]
async fn deleting_an_account_cascades_after_sync() {
    let h = harness(config(), jira_stub());
    let stores = h.engine.stores().clone();
    let account = stores
        .atlassian_accounts
        .create(AtlassianService::Jira, "acme", "me@acme.test", "token")
        .await
        .unwrap();

    h.engine
        .submit(tidemark_infra::connectors::JIRA_SYNC_JOB, account_payload(&account.account_id))
        .await
        .unwrap();
    assert!(h.engine.queue().wait_idle_for(IDLE).await);
    assert_eq!(stores.activity.count().await.unwrap(), 4);

    assert!(h.engine.delete_atlassian_account(&account.account_id).await.unwrap());
    assert_eq!(stores.activity.count().await.unwrap(), 0);
    assert!(
        stores
            .sync_state
            .last_sync_for("jira", &account.account_id)
            .await
            .unwrap()
            .is_none()
    );
}
