//! Ordered task flows with reverse-order cleanup. The create/expand/
//! delete pipelines are sequences of steps against the array and the
//! node; when a step fails every previously finished step must be undone
//! so no half-created object leaks, and a failing undo must never stop
//! the walk.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeviceError;

/// Accumulated result map, merged from each step's partial result.
pub type FlowResult = HashMap<String, Value>;

pub type StepOutcome = Result<FlowResult, DeviceError>;

/// A step body: receives the accumulated result (the initial params
/// merged with every earlier step's output) and returns its own partial
/// result to merge.
pub type StepFn =
    Box<dyn for<'a> Fn(&'a FlowResult) -> BoxFuture<'a, StepOutcome> + Send + Sync>;

/// A step's undo: receives the accumulated result as it stood when the
/// flow stopped.
pub type RevertFn = Box<
    dyn for<'a> Fn(&'a FlowResult) -> BoxFuture<'a, Result<(), DeviceError>>
        + Send
        + Sync,
>;

struct Task {
    name: String,
    run: StepFn,
    revert: Option<RevertFn>,
    finished: bool,
}

pub struct TaskFlow {
    id: Uuid,
    name: String,
    tasks: Vec<Task>,
    result: FlowResult,
}

impl TaskFlow {
    pub fn new(name: &str) -> TaskFlow {
        TaskFlow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            tasks: Vec::new(),
            result: FlowResult::new(),
        }
    }

    /// Append a step. Steps run in insertion order; reverts run in the
    /// reverse order over the steps that finished.
    pub fn add(
        mut self,
        name: &str,
        run: StepFn,
        revert: Option<RevertFn>,
    ) -> TaskFlow {
        self.tasks.push(Task {
            name: name.to_string(),
            run,
            revert,
            finished: false,
        });
        self
    }

    /// Run the steps in order. The first failure aborts the flow,
    /// reverts every finished step and surfaces the failing step's
    /// error.
    pub async fn run(
        &mut self,
        params: FlowResult,
    ) -> Result<FlowResult, DeviceError> {
        self.result.extend(params);
        for index in 0 .. self.tasks.len() {
            let name = self.tasks[index].name.clone();
            debug!("flow {} ({}): running {}", self.name, self.id, name);
            let outcome = (self.tasks[index].run)(&self.result).await;
            match outcome {
                Ok(partial) => {
                    self.result.extend(partial);
                    self.tasks[index].finished = true;
                }
                Err(error) => {
                    warn!(
                        "flow {} ({}): {} failed: {}, reverting",
                        self.name, self.id, name, error
                    );
                    self.revert().await;
                    return Err(DeviceError::TaskFailed {
                        task: name,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(self.result.clone())
    }

    /// Undo the finished steps in reverse order. A revert's own failure
    /// is logged and discarded; each finished step is reverted exactly
    /// once.
    pub async fn revert(&mut self) {
        for index in (0 .. self.tasks.len()).rev() {
            if !self.tasks[index].finished {
                continue;
            }
            let name = self.tasks[index].name.clone();
            if let Some(revert) = &self.tasks[index].revert {
                debug!(
                    "flow {} ({}): reverting {}",
                    self.name, self.id, name
                );
                if let Err(error) = revert(&self.result).await {
                    warn!(
                        "flow {} ({}): revert of {} failed: {}",
                        self.name, self.id, name, error
                    );
                }
            }
            self.tasks[index].finished = false;
        }
    }
}
