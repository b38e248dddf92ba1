//! Process-level building blocks: the workflow core, the live
//! connection registry, and the NATS notification seam.

pub mod connections;
pub mod notify;
pub mod workflow;

pub use connections::{ConnectionRegistry, ConnectionSender};
pub use notify::{progress_subject, NatsProgressPublisher, ProgressPublisher, TestPublisher};
