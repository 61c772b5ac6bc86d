//! Nexus research orchestration core.
//!
//! Turns one research request into a workflow of interdependent operations
//! executed across a bounded worker pool, with a durable knowledge store,
//! a monitoring event stream, provider rate limiting and retries, DOK
//! synthesis, and entity resolution. Transport surfaces (REST, WebSocket,
//! UI) sit on top of the library API; nothing here knows about HTTP.
//!
//! The usual wiring order:
//!
//! ```ignore
//! let config = NexusConfig::from_env()?;
//! let store = Store::open("nexus.db").await?;
//! let bus = EventBus::new(1024, config.event_max_bytes);
//! let gateway = ProviderGateway::builder()
//!     .with_search_provider(linkup)
//!     .with_reasoning_llm(reasoning)
//!     .with_task_llm(task_model)
//!     .build(&config);
//! let ctx = NexusContext::new(config, store, bus, gateway);
//! let orchestrator = Orchestrator::start(ctx);
//! let task = orchestrator.create_task(request).await?;
//! let finished = orchestrator.run_task(&task.id).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod export;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod resolution;
pub mod store;
pub mod synthesis;

pub use config::NexusConfig;
pub use error::{CoreError, ErrorKind};
pub use events::{EventBus, MonitorEvent, SubscriberFilter};
pub use gateway::ProviderGateway;
pub use orchestrator::{NexusContext, Orchestrator, TaskRequest};
pub use store::Store;
