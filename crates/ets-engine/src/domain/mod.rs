//! Domain Model

pub mod events;
pub mod invocation;
pub mod subscription;
pub mod trigger;

pub use events::{
    DomainEvent, InvocationCompletedEvent, InvocationFailedEvent, InvocationType,
    TriggerInvokedEvent, WorkflowRunEvent,
};
pub use invocation::{Invocation, InvocationStatus};
pub use subscription::{
    EventBridgeConfig, HttpAuth, HttpConfig, InlineConfig, ResponseMode, ScriptConfig,
    ScriptLanguage, Subscription, SubscriptionChanges, SubscriptionConfig, SubscriptionType,
    WorkflowConfig,
};
pub use trigger::{Trigger, TriggerType};
