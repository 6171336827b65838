use crate::error::Result;
use crate::event::EventSink;
use crate::pipeline::Pipeline;
use crate::transport::Transport;
use std::sync::Arc;

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

/// Factory of pipeline transports for one kind of backend
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the transport of a pipeline. Fails on invalid pipeline options.
    /// `events` receives faults the transport absorbs on its own.
    fn open(&self, pipeline: &Pipeline, events: &EventSink) -> Result<Arc<dyn Transport>>;
}
