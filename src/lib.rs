// Library modules
pub mod client;
pub mod config;
pub mod control;
pub mod env;
pub mod events;
pub mod hub;
pub mod instance;
pub mod interactive;
pub mod lifecycle;
pub mod ports;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod ring;
pub mod shell;
pub mod workspace;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use events::EventBus;
pub use hub::Hub;
pub use lifecycle::{Execution, ExecutionStatus, LaunchRequest, LifecycleManager};
pub use ports::PortAllocator;
pub use protocol::{ErrorCode, ErrorPayload, MessageType, WsEnvelope};
pub use queue::MessageQueue;
pub use ring::RingBuffer;
pub use shell::ShellSession;
