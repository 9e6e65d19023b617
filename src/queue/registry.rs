use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::traits::{Job, JobResult};

type HandlerFn<C> =
    dyn Fn(serde_json::Value, Arc<C>) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync;

pub(crate) type BoxedHandler<C> = Arc<HandlerFn<C>>;

/// Maps `job_type` strings to deserialization plus execution.
pub struct JobRegistry<C: Send + Sync + 'static> {
    handlers: HashMap<&'static str, BoxedHandler<C>>,
}

impl<C: Send + Sync + 'static> JobRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<J: Job<C>>(mut self) -> Self {
        let handler: BoxedHandler<C> = Arc::new(move |payload: serde_json::Value, ctx: Arc<C>| {
            Box::pin(async move {
                let job: J = serde_json::from_value(payload)?;
                job.perform(&ctx).await
            }) as Pin<Box<dyn Future<Output = JobResult> + Send>>
        });
        self.handlers.insert(J::JOB_TYPE, handler);
        self
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&BoxedHandler<C>> {
        self.handlers.get(job_type)
    }
}

impl<C: Send + Sync + 'static> Default for JobRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
