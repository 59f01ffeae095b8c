//! Task bodies for the delivery record lifecycle and the per-kind registry that
//! routes claimed tasks to them.
//!
//! Every body performs one actuation and then closes the loop in the record
//! store: send/edit upsert the record, delete removes it. An ineligible item
//! never touches the store. Bodies report instead of failing, so a worker always
//! completes the task and the queue never redelivers a finished actuation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use yahnc_actuator::{Actuation, DeliveryActuator};
use yahnc_core::{Clock, DeliveryRecord, DeliveryTask, IneligibleReason, MessageId, TaskKind};
use yahnc_storage::RecordStore;

use crate::queue::ClaimedTask;

/// What a task body did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerReport {
    Stored { message_id: MessageId },
    Removed { message_id: MessageId },
    Ineligible { reason: IneligibleReason },
    /// The chat backend call failed; the store was left alone.
    ActuationFailed { cause: String },
    /// The actuation succeeded but the store write did not.
    StoreFailed { cause: String },
    Rejected { cause: String },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &DeliveryTask) -> HandlerReport;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for task kind {0}")]
    DuplicateHandler(TaskKind),
}

/// Collaborators every lifecycle body needs.
#[derive(Clone)]
pub struct Lifecycle {
    actuator: Arc<dyn DeliveryActuator>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(
        actuator: Arc<dyn DeliveryActuator>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            actuator,
            store,
            clock,
        }
    }

    async fn persist(&self, mut record: DeliveryRecord) -> HandlerReport {
        record.touch(self.clock.now());
        match self.store.put(&record).await {
            Ok(()) => HandlerReport::Stored {
                message_id: record.message_id,
            },
            Err(err) => {
                error!(item_id = %record.item_id, message_id = %record.message_id, error = %err, "storing record failed");
                HandlerReport::StoreFailed {
                    cause: err.to_string(),
                }
            }
        }
    }

    async fn after_upsert_actuation(
        &self,
        record: DeliveryRecord,
        actuation: Actuation,
    ) -> HandlerReport {
        match actuation {
            Actuation::Delivered(message_id) => {
                let mut record = record;
                record.message_id = message_id;
                self.persist(record).await
            }
            Actuation::Ineligible(reason) => {
                debug!(item_id = %record.item_id, %reason, "item ignored");
                HandlerReport::Ineligible { reason }
            }
            Actuation::Failed(err) => {
                error!(item_id = %record.item_id, error = %err, "actuation failed");
                HandlerReport::ActuationFailed {
                    cause: err.to_string(),
                }
            }
        }
    }
}

fn mismatch(expected: TaskKind, task: &DeliveryTask) -> HandlerReport {
    warn!(expected = %expected, got = %task.kind(), "task routed to wrong handler");
    HandlerReport::Rejected {
        cause: format!("{expected} handler received {}", task.kind()),
    }
}

pub struct SendMessageHandler(pub Lifecycle);

#[async_trait]
impl TaskHandler for SendMessageHandler {
    async fn handle(&self, task: &DeliveryTask) -> HandlerReport {
        let DeliveryTask::SendMessage { item_id } = *task else {
            return mismatch(TaskKind::SendMessage, task);
        };
        info!(%item_id, "sending message");
        let mut record = DeliveryRecord::unsent(item_id);
        let actuation = self.0.actuator.send(&mut record).await;
        self.0.after_upsert_actuation(record, actuation).await
    }
}

pub struct EditMessageHandler(pub Lifecycle);

#[async_trait]
impl TaskHandler for EditMessageHandler {
    async fn handle(&self, task: &DeliveryTask) -> HandlerReport {
        let DeliveryTask::EditMessage {
            item_id,
            message_id,
        } = *task
        else {
            return mismatch(TaskKind::EditMessage, task);
        };
        info!(%item_id, %message_id, "editing message");
        let mut record = task.record();
        let actuation = self.0.actuator.edit(&mut record).await;
        self.0.after_upsert_actuation(record, actuation).await
    }
}

pub struct DeleteMessageHandler(pub Lifecycle);

impl DeleteMessageHandler {
    async fn remove(&self, record: &DeliveryRecord) -> HandlerReport {
        match self.0.store.delete(record.item_id).await {
            Ok(_) => HandlerReport::Removed {
                message_id: record.message_id,
            },
            Err(err) => {
                error!(item_id = %record.item_id, error = %err, "removing record failed");
                HandlerReport::StoreFailed {
                    cause: err.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl TaskHandler for DeleteMessageHandler {
    async fn handle(&self, task: &DeliveryTask) -> HandlerReport {
        let DeliveryTask::DeleteMessage {
            item_id,
            message_id,
        } = *task
        else {
            return mismatch(TaskKind::DeleteMessage, task);
        };
        info!(%item_id, %message_id, "deleting message");
        let record = task.record();
        if message_id.is_unsent() {
            // Nothing was ever posted, so only the record has to go.
            return self.remove(&record).await;
        }
        match self.0.actuator.delete(&record).await {
            Actuation::Delivered(_) => self.remove(&record).await,
            Actuation::Ineligible(reason) => {
                debug!(%item_id, %reason, "delete ignored");
                HandlerReport::Ineligible { reason }
            }
            Actuation::Failed(err) => {
                error!(%item_id, %message_id, error = %err, "delete failed; record kept for next cleanup");
                HandlerReport::ActuationFailed {
                    cause: err.to_string(),
                }
            }
        }
    }
}

/// One handler per task kind, fixed after construction.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired with the send, edit and delete bodies.
    pub fn lifecycle(lifecycle: Lifecycle) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(
            TaskKind::SendMessage,
            Arc::new(SendMessageHandler(lifecycle.clone())),
        )?;
        registry.register(
            TaskKind::EditMessage,
            Arc::new(EditMessageHandler(lifecycle.clone())),
        )?;
        registry.register(
            TaskKind::DeleteMessage,
            Arc::new(DeleteMessageHandler(lifecycle)),
        )?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind)
    }
}

/// Runs a claimed task through the handler registered for its kind.
pub struct TaskDispatcher {
    registry: Arc<TaskRegistry>,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, claimed: &ClaimedTask) -> HandlerReport {
        let kind = claimed.task.kind();
        let Some(handler) = self.registry.get(kind) else {
            error!(task_id = %claimed.id, %kind, "no handler registered");
            return HandlerReport::Rejected {
                cause: format!("no handler registered for {kind}"),
            };
        };
        let report = handler.handle(&claimed.task).await;
        debug!(task_id = %claimed.id, %kind, attempt = claimed.attempt, ?report, "task finished");
        report
    }
}
