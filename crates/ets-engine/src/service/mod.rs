//! Engine Services

pub mod circuit_breaker;
pub mod completion;
pub mod dispatch;
pub mod expiry;
pub mod orchestrator;
pub mod router;
pub mod subscription;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use completion::{CompleteInvocationCommand, CompletionService, NO_OUTPUT_ERROR};
pub use dispatch::{DispatchAdapter, DispatchOutcome, METADATA_KEY};
pub use expiry::{ExpiryService, TIMEOUT_REASON};
pub use orchestrator::{InvocationOrchestrator, InvokeRequest, InvokeTestRequest};
pub use router::DispatchRouter;
pub use subscription::{Caller, SubscribeCommand, SubscriptionService, UpdateSubscriptionCommand};
