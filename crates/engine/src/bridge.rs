//! `WorkflowBridge`: the host side of a socket trigger.
//!
//! Every decoded frame the trigger emits starts one workflow execution. The
//! emit call awaits the run, so a slow workflow slows the trigger down
//! instead of piling up executions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use trigger::{DecodedMessage, HostBridge, MemoryStaticData, StaticDataStore, TriggerError};

use crate::{ExecutionResult, Workflow, WorkflowExecutor};

/// Trigger errors kept for [`WorkflowBridge::recorded_errors`]. Older ones are dropped.
pub const MAX_RECORDED_ERRORS: usize = 100;

/// What the bridge reports to an observer.
#[derive(Debug)]
pub enum WorkflowActivity {
    /// An event was emitted and the workflow ran (possibly with a failed node).
    Executed(ExecutionResult),
    /// An event was emitted but the workflow could not be run.
    Rejected { event: Value, error: String },
    /// The trigger reported a non-fatal problem.
    TriggerError(String),
}

pub struct WorkflowBridge {
    workflow: Arc<Workflow>,
    executor: Arc<WorkflowExecutor>,
    store: MemoryStaticData,
    observer: Option<mpsc::UnboundedSender<WorkflowActivity>>,
    errors: Mutex<VecDeque<String>>,
}

impl WorkflowBridge {
    pub fn new(workflow: Arc<Workflow>, executor: Arc<WorkflowExecutor>) -> Self {
        Self {
            workflow,
            executor,
            store: MemoryStaticData::new(),
            observer: None,
            errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Forward every execution and trigger error to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<WorkflowActivity>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// The workflow's static data.
    pub fn store(&self) -> &MemoryStaticData {
        &self.store
    }

    /// The most recent non-fatal errors reported by the trigger, oldest first.
    pub fn recorded_errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn notify(&self, activity: WorkflowActivity) {
        if let Some(observer) = &self.observer {
            if observer.send(activity).is_err() {
                debug!("workflow observer dropped");
            }
        }
    }
}

#[async_trait]
impl HostBridge for WorkflowBridge {
    async fn emit(&self, message: DecodedMessage) {
        if message.is_fallback() {
            debug!("frame was not JSON, running workflow on its character map");
        }
        let event = message.into_value();

        match self.executor.run(&self.workflow, event.clone()).await {
            Ok(result) => {
                if let Some(reason) = &result.error {
                    warn!(execution_id = %result.execution_id, "workflow execution failed: {reason}");
                }
                self.notify(WorkflowActivity::Executed(result));
            }
            Err(err) => {
                error!(workflow_id = %self.workflow.id, "workflow could not run: {err}");
                self.notify(WorkflowActivity::Rejected {
                    event,
                    error: err.to_string(),
                });
            }
        }
    }

    fn emit_error(&self, error: TriggerError) {
        warn!(workflow_id = %self.workflow.id, "trigger reported: {error}");
        let message = error.to_string();
        {
            let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
            if errors.len() == MAX_RECORDED_ERRORS {
                errors.pop_front();
            }
            errors.push_back(message.clone());
        }
        self.notify(WorkflowActivity::TriggerError(message));
    }

    fn parameter(&self, name: &str) -> Option<Value> {
        self.workflow.trigger.get(name).cloned()
    }

    fn static_data(&self) -> Arc<dyn StaticDataStore> {
        Arc::new(self.store.clone())
    }
}
