//! Backend agnostic job broker
//!
//! A [`Broker`] owns named [`Pipeline`]s, each served by its own engine over a
//! transport opened by the broker's [`Backend`]. Two backends ship with the
//! crate: an in-process queue and, behind the default `amqp` feature, an AMQP
//! backend running over an externally managed channel pool.
//!
//! ```no_run
//! use courier::backend::memory::MemoryBackend;
//! use courier::{Broker, HandlerPool, Job, JobError, Pipeline};
//!
//! # async fn run() -> courier::Result<()> {
//! let broker = Broker::new(MemoryBackend::new());
//! broker.register(Pipeline::new("emails")).await?;
//!
//! let pool = HandlerPool::uniform(
//!     |id: String, job: Job| async move {
//!         println!("{} {}", id, job.name);
//!         Ok::<_, JobError>(())
//!     },
//!     4,
//! );
//! broker.consume("emails", Some(pool), None).await?;
//!
//! let server = broker.clone();
//! tokio::spawn(async move { server.serve().await });
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod pipeline;
pub mod pool;
pub mod stat;
pub mod transport;

pub use backend::memory::MemoryBackend;
pub use backend::Backend;
pub use broker::Broker;
pub use error::{JobError, Result};
pub use event::{Event, EventSink, Listener};
pub use job::{ErrorHandler, Job, JobHandler, Options};
pub use pipeline::Pipeline;
pub use pool::{HandlerPool, Lease};
pub use stat::Stat;
pub use transport::{Acknowledger, Delivery, DeliveryStream, Transport};
