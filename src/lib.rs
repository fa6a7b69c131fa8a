pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod providers;
pub mod routing;
pub mod server;
pub mod store;
pub mod translate;
pub mod unified;
pub mod usage;

pub use catalog::{ModelCatalog, ModelInfo};
pub use config::{config_search_paths, GatewayConfig};
pub use credentials::{Credential, CredentialResolver, EnvCredentialResolver, StaticCredentialResolver};
pub use error::{GatewayError, Result};
pub use gate::{AllowOverrides, Gate, RoutingStrategy};
pub use gateway::{Gateway, SseEvent, SseStream};
pub use providers::{ProviderAdapter, ProviderKind, ResponseStream};
pub use routing::Router;
pub use server::{build_router, AppState};
pub use store::{CachedGateStore, GateCache, GateStore, MemoryGateCache, MemoryGateStore};
pub use unified::{UnifiedRequest, UnifiedResponse};
pub use usage::{JsonlUsageLog, SpendLedger, SpendTracker, UsageOutcome, UsageRecorder, UsageSink};
