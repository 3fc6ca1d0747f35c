//! Client engine for queue-managed remote endpoints.
//!
//! A [`Client`] talks to one remote app. Each [`Client::submit`] returns a
//! [`Job`] right away while the call runs on a bounded pool of tokio tasks.
//! Depending on the app's protocol a job either makes one blocking request,
//! owns an event stream of its own, or reads its messages from the session's
//! shared event stream, which is demultiplexed by event id.
//!
//! ```no_run
//! use queue_client::{Call, Client, ClientOptions};
//!
//! # async fn run() -> queue_client::ClientResult<()> {
//! let client = Client::connect("http://127.0.0.1:7860", ClientOptions::default()).await?;
//! let job = client.submit(Call::new().api("/predict").args([5, 4]))?;
//! let output = job.result(None).await?;
//! println!("{:?}", output);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod communicator;
pub mod config;
pub mod diff;
pub mod endpoint;
pub mod error;
pub mod files;
pub mod heartbeat;
mod invoke;
pub mod job;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod session;
pub mod status;
pub mod stream;

pub use client::{Call, Client};
pub use config::{ClientOptions, Credentials};
pub use endpoint::{CancelPlan, EndpointDescriptor, Output};
pub use error::{ClientError, ClientResult};
pub use files::handle_file;
pub use job::{Job, JobIter};
pub use protocol::Protocol;
pub use schema::{ApiInfo, AppConfig, AppVersion};
pub use status::{OutputUpdate, Status, StatusUpdate, Update};
