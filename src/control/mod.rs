//! Client-facing control plane: WebSocket dispatcher and action handlers.

pub mod conn;
pub mod dispatch;
pub mod handlers;

pub use conn::{router, ControlState};
pub use dispatch::{Dispatcher, HandlerCtx};
