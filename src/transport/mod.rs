//! Request/response plus publish/subscribe between a caller (UI) and the
//! host that runs the lifecycle controller.

pub mod client;
pub mod host;
pub mod wire;

pub use client::{RequestHandle, TransportClient};
pub use host::{EventSubscription, ModelSubscription, TransportHost};
pub use wire::{Command, HostFrame, ModelListEvent, Reply};
