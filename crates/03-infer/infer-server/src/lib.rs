//! The inference server: request batching, multi-engine, priority-ordered
//! dispatch over device engines.
//!
//! A [`Session`] binds one model to a batching strategy, a priority level
//! and a pool of engines. Requests carry a [`Package`] of work units tagged
//! with a stream identifier; the per-session batcher gathers units into
//! batches, engine workers run preprocess → forward → postprocess, and the
//! completion path delivers responses **in submission order per tag** —
//! to the registered [`Observer`] for asynchronous sessions, or by waking
//! the blocked caller for synchronous ones.
//!
//! Cancellation is cooperative: [`Session::discard_task`] marks a tag, the
//! batcher skips still-queued work and every undelivered response for the
//! tag completes as [`Status::Canceled`]. Destroying a session drains: all
//! in-flight work finishes or cancels before the session object goes away.

mod batcher;
mod data;
mod engine;
mod error;
mod perf;
mod priority;
mod processor;
mod request;
mod session;
mod status;

use std::sync::Arc;
use std::time::Duration;

use device::DeviceId;

pub use data::{InferData, InferValue, Package, UserData};
pub use engine::ModelIo;
pub use error::{ServerError, ServerResult};
pub use perf::{PerfSnapshot, PerfStats};
pub use processor::{
    register_postprocessor, register_preprocessor, Postprocessor, Preprocessor,
};
pub use session::{BatchStrategy, Observer, Session, SessionDesc};
pub use status::Status;

/// Factory facade over sessions on one device.
pub struct InferServer {
    device_id: DeviceId,
}

impl InferServer {
    /// Creates a server bound to `device_id`.
    pub fn new(device_id: DeviceId) -> ServerResult<Self> {
        device::DeviceContext::new(device_id)?;
        Ok(Self { device_id })
    }

    /// The device sessions of this server run on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Loads a model through the process-wide cache.
    pub fn load_model(&self, url: &str) -> ServerResult<Arc<model::Model>> {
        Ok(model::load_model(url)?)
    }

    /// Creates an asynchronous session delivering responses to `observer`.
    pub fn create_session(
        &self,
        desc: SessionDesc,
        observer: Arc<dyn Observer>,
    ) -> ServerResult<Session> {
        Session::create(self.device_id, desc, Some(observer))
    }

    /// Creates a synchronous session; responses are picked up through
    /// [`InferServer::request_sync`].
    pub fn create_sync_session(&self, desc: SessionDesc) -> ServerResult<Session> {
        Session::create(self.device_id, desc, None)
    }

    /// Destroys a session, draining every in-flight request first.
    pub fn destroy_session(&self, session: Session) {
        drop(session);
    }

    /// Enqueues a package on an asynchronous session. Returns as soon as the
    /// package is queued.
    pub fn request(
        &self,
        session: &Session,
        package: Package,
        user_data: UserData,
    ) -> ServerResult<()> {
        session.request(package, user_data)
    }

    /// Runs a package on a synchronous session, blocking until the response
    /// is ready or `timeout` elapses.
    pub fn request_sync(
        &self,
        session: &Session,
        package: Package,
        timeout: Option<Duration>,
    ) -> ServerResult<(Status, Option<Package>)> {
        session.request_sync(package, timeout)
    }

    /// Blocks until every in-flight item with `tag` has completed.
    pub fn wait_task_done(&self, session: &Session, tag: &str) {
        session.wait_task_done(tag)
    }

    /// Marks in-flight items with `tag` to be dropped; their responses are
    /// still delivered, with [`Status::Canceled`].
    pub fn discard_task(&self, session: &Session, tag: &str) {
        session.discard_task(tag)
    }
}
