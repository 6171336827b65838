use crate::error::JobError;
use std::sync::{Arc, PoisonError, RwLock};

/// Lifecycle and error notifications raised by the broker and its pipelines
#[derive(Debug, Clone)]
pub enum Event {
    /// Every registered pipeline has been started.
    BrokerReady,
    /// A pipeline started consuming from its transport.
    PipelineActive { pipeline: String },
    /// A pipeline drained and stopped.
    PipelineStopped { pipeline: String },
    /// A non fatal failure inside a pipeline (transport fault, failed ack,
    /// failed retry submission).
    PipelineError {
        pipeline: String,
        error: Arc<JobError>,
    },
}

/// Callback receiving events. Invoked from arbitrary tasks, possibly
/// concurrently.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Shared slot holding the current listener. Cloned into every engine and
/// transport of a broker.
#[derive(Clone, Default)]
pub struct EventSink {
    listener: Arc<RwLock<Option<Listener>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, listener: Listener) {
        let mut slot = self.listener.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(listener);
    }

    pub fn emit(&self, event: Event) {
        // clone out of the lock so listeners may call back into the broker
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(listener) = listener {
            listener(&event);
        }
    }

    pub fn pipeline_error(&self, pipeline: &str, error: JobError) {
        tracing::error!(pipeline = %pipeline, error = %error, "pipeline error");
        self.emit(Event::PipelineError {
            pipeline: pipeline.to_string(),
            error: Arc::new(error),
        });
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self
            .listener
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("EventSink")
            .field("attached", &attached)
            .finish()
    }
}
