use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::UserId;
use crate::domain::workflow::{InstanceId, StepId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    StepActivated,
    EscalationFired,
    Rejected,
    Returned,
    ApprovalComplete,
    Cancelled,
    Reminder,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepActivated => "step_activated",
            Self::EscalationFired => "escalation_fired",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::ApprovalComplete => "approval_complete",
            Self::Cancelled => "cancelled",
            Self::Reminder => "reminder",
        }
    }
}

/// Something a person should be told. Delivery belongs to whoever drains the sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub id: String,
    pub recipient_id: UserId,
    pub notification_type: NotificationType,
    pub instance_id: InstanceId,
    pub step_id: Option<StepId>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationIntent {
    pub fn new(
        recipient_id: UserId,
        notification_type: NotificationType,
        instance_id: InstanceId,
        step_id: Option<StepId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recipient_id,
            notification_type,
            instance_id,
            step_id,
            message: None,
            created_at,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, intent: NotificationIntent);
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    intents: Arc<Mutex<Vec<NotificationIntent>>>,
}

impl InMemoryNotificationSink {
    pub fn intents(&self) -> Vec<NotificationIntent> {
        match self.intents.lock() {
            Ok(intents) => intents.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_type(&self, notification_type: NotificationType) -> Vec<NotificationIntent> {
        self.intents()
            .into_iter()
            .filter(|intent| intent.notification_type == notification_type)
            .collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn emit(&self, intent: NotificationIntent) {
        match self.intents.lock() {
            Ok(mut intents) => intents.push(intent),
            Err(poisoned) => poisoned.into_inner().push(intent),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn emit(&self, intent: NotificationIntent) {
        tracing::info!(
            event_name = "notification.intent_emitted",
            recipient_id = %intent.recipient_id,
            notification_type = intent.notification_type.as_str(),
            instance_id = %intent.instance_id,
            step_id = intent.step_id.as_ref().map(|id| id.0.as_str()).unwrap_or("-"),
            "notification intent"
        );
    }
}
