use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{JobError, Result};
use crate::event::{Event, EventSink, Listener};
use crate::job::{ErrorHandler, Job};
use crate::pipeline::Pipeline;
use crate::pool::HandlerPool;
use crate::stat::Stat;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info};

/// Registry of pipelines sharing one backend
#[derive(Clone)]
pub struct Broker {
    backend: Arc<dyn Backend>,
    engines: Arc<RwLock<HashMap<String, Engine>>>,
    events: EventSink,
    serving: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
}

impl Broker {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            backend: Arc::new(backend),
            engines: Arc::new(RwLock::new(HashMap::new())),
            events: EventSink::new(),
            serving: Arc::new(AtomicBool::new(false)),
            stop,
        }
    }

    /// Name of the backend behind every pipeline of this broker
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Attach the listener receiving lifecycle and error events
    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.events.set(listener);
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Register a pipeline. Names are unique; pipelines must be registered
    /// before [`Broker::serve`].
    pub async fn register(&self, pipeline: Pipeline) -> Result<()> {
        if self.is_serving() {
            return Err(JobError::ConfigError(format!(
                "cannot register pipeline `{}` while serving",
                pipeline.name()
            )));
        }

        let mut engines = self.engines.write().await;
        if engines.contains_key(pipeline.name()) {
            return Err(JobError::DuplicatePipeline(pipeline.name().to_string()));
        }

        let transport = self.backend.open(&pipeline, &self.events)?;
        let name = pipeline.name().to_string();
        engines.insert(name.clone(), Engine::new(pipeline, transport, self.events.clone()));

        info!(pipeline = %name, backend = self.backend.name(), "pipeline registered");
        Ok(())
    }

    /// Bind the handler pool and error handler of a pipeline. `None` unbinds;
    /// deliveries then wait for the next binding.
    pub async fn consume(
        &self,
        pipeline: &str,
        pool: Option<HandlerPool>,
        on_error: Option<ErrorHandler>,
    ) -> Result<()> {
        let engines = self.engines.read().await;
        let engine = engines
            .get(pipeline)
            .ok_or_else(|| JobError::UndefinedPipeline(pipeline.to_string()))?;

        engine.configure(pool, on_error);
        Ok(())
    }

    /// Push a job, returning its id
    pub async fn push(&self, pipeline: &str, job: Job) -> Result<String> {
        self.engine(pipeline).await?.push(job).await
    }

    pub async fn stat(&self, pipeline: &str) -> Result<Stat> {
        self.engine(pipeline).await?.stat().await
    }

    async fn engine(&self, pipeline: &str) -> Result<Engine> {
        if !self.is_serving() {
            return Err(JobError::NotServing);
        }

        self.engines
            .read()
            .await
            .get(pipeline)
            .cloned()
            .ok_or_else(|| JobError::UndefinedPipeline(pipeline.to_string()))
    }

    /// Start every pipeline and block until [`Broker::stop`] is called or a
    /// pipeline fails fatally.
    pub async fn serve(&self) -> Result<()> {
        if self.is_serving() {
            return Err(JobError::ConfigError("broker is already serving".to_string()));
        }
        let mut stop = self.stop.subscribe();
        self.stop.send_replace(false);
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(JobError::ConfigError("broker is already serving".to_string()));
        }

        let engines: Vec<Engine> = self.engines.read().await.values().cloned().collect();
        let mut tasks = JoinSet::new();
        for engine in &engines {
            match engine.start() {
                Ok(handle) => {
                    tasks.spawn(async move {
                        match handle.await {
                            Ok(res) => res,
                            Err(e) => Err(JobError::BackendError(format!(
                                "pipeline task failed: {}",
                                e
                            ))),
                        }
                    });
                }
                Err(err) => {
                    self.halt(&engines).await;
                    return Err(err);
                }
            }
        }

        info!(pipelines = engines.len(), backend = self.backend.name(), "broker ready");
        self.events.emit(Event::BrokerReady);

        let mut failure = None;
        loop {
            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    let res = joined
                        .map_err(|e| JobError::BackendError(format!("pipeline task failed: {}", e)))
                        .and_then(|res| res);
                    if let Err(err) = res {
                        error!(error = %err, "pipeline failed, stopping broker");
                        failure = Some(err);
                        break;
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }

        self.halt(&engines).await;
        while tasks.join_next().await.is_some() {}

        info!("broker stopped");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop every pipeline, waiting for in-flight jobs. Idempotent.
    pub async fn stop(&self) {
        if !self.serving.load(Ordering::SeqCst) {
            return;
        }

        let engines: Vec<Engine> = self.engines.read().await.values().cloned().collect();
        self.halt(&engines).await;
        self.stop.send_replace(true);
    }

    async fn halt(&self, engines: &[Engine]) {
        self.serving.store(false, Ordering::SeqCst);
        futures_util::future::join_all(engines.iter().map(|engine| engine.stop())).await;
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("backend", &self.backend.name())
            .field("serving", &self.is_serving())
            .finish()
    }
}
