//! `job.simulate`: a handler that only reports progress.
//!
//! Useful for exercising observers and cancellation without touching any remote
//! API. `payload.simulate_ms` spreads up to five progress ticks over that many
//! milliseconds; zero or missing completes in a single tick.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::handler::{HandlerError, JobContext, JobHandler};
use super::types::JsonMap;

pub const SIMULATE_JOB_TYPE: &str = "job.simulate";

const MAX_STEPS: u64 = 5;
const MIN_STEP_MS: u64 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulateHandler;

impl SimulateHandler {
    fn steps(duration_ms: u64) -> u64 {
        if duration_ms == 0 {
            1
        } else {
            (duration_ms / MIN_STEP_MS).clamp(1, MAX_STEPS)
        }
    }
}

#[async_trait]
impl JobHandler for SimulateHandler {
    async fn run(&self, ctx: JobContext) -> Result<JsonMap, HandlerError> {
        let duration_ms = match ctx.payload().get("simulate_ms") {
            None | Some(JsonValue::Null) => 0,
            Some(value) => value
                .as_f64()
                .filter(|ms| ms.is_finite())
                .map(|ms| ms.max(0.0) as u64)
                .ok_or_else(|| HandlerError::InvalidPayload("simulate_ms must be a number".into()))?,
        };

        let steps = Self::steps(duration_ms);
        let pause = Duration::from_millis(duration_ms / steps);
        for step in 1..=steps {
            ctx.checkpoint().await?;
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let progress = step as f64 / steps as f64;
            ctx.progress(progress, Some(&format!("progress {progress:.2}")))
                .await;
        }

        let mut result = JsonMap::new();
        result.insert("simulated_ms".into(), duration_ms.into());
        result.insert("steps".into(), steps.into());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidemark_core::JobStatus;
    use tidemark_events::{Notification, Notifier};

    use super::*;
    use crate::jobs::queue::JobQueue;
    use crate::jobs::store::InMemoryJobStore;

    #[test]
    fn step_count_scales_with_duration() {
        assert_eq!(SimulateHandler::steps(0), 1);
        assert_eq!(SimulateHandler::steps(100), 1);
        assert_eq!(SimulateHandler::steps(600), 3);
        assert_eq!(SimulateHandler::steps(60_000), 5);
    }

    fn payload(ms: u64) -> JsonMap {
        let mut payload = JsonMap::new();
        payload.insert("simulate_ms".into(), ms.into());
        payload
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_progress_to_completion() {
        let notifier = Notifier::default();
        let sub = notifier.subscribe();
        let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), notifier, 1);
        queue.register_handler(SIMULATE_JOB_TYPE, Arc::new(SimulateHandler));

        let id = queue.submit(SIMULATE_JOB_TYPE, payload(1_000)).await.unwrap();
        queue.wait_idle().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result.unwrap()["steps"], 5);

        let ticks: Vec<f64> = sub
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::JobProgress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![0.2, 0.4, 0.6, 0.8, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_between_ticks_when_canceled() {
        let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), Notifier::default(), 1);
        queue.register_handler(SIMULATE_JOB_TYPE, Arc::new(SimulateHandler));

        let id = queue.submit(SIMULATE_JOB_TYPE, payload(10_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(queue.cancel(id).await.unwrap(), JobStatus::Canceled);
        queue.wait_idle().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.progress.unwrap_or_default() < 1.0);
    }

    #[tokio::test]
    async fn rejects_non_numeric_duration() {
        let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), Notifier::default(), 1);
        queue.register_handler(SIMULATE_JOB_TYPE, Arc::new(SimulateHandler));

        let mut payload = JsonMap::new();
        payload.insert("simulate_ms".into(), "soon".into());
        let id = queue.submit(SIMULATE_JOB_TYPE, payload).await.unwrap();
        queue.wait_idle().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().message.contains("simulate_ms"));
    }
}
