//! The capability seam between the engine and the system under test.

use std::error::Error;

/// Boxed error at the requester boundary. The engine only ever needs the
/// message: failures become keyed counts, never control flow.
pub type RequestError = Box<dyn Error + Send + Sync>;

/// Synchronously issues requests against a particular system under test.
///
/// One instance is owned by one worker for the whole run; implementations
/// may keep per-connection state between calls.
pub trait Requester: Send {
    /// Prepares the requester before any requests are issued. A setup
    /// failure aborts the whole benchmark.
    fn setup(&mut self) -> Result<(), RequestError>;

    /// Performs one full synchronous request/response exchange. Returns
    /// `Ok` iff the response was received and validated.
    fn request(&mut self) -> Result<(), RequestError>;

    /// Called once after the last request, even on an aborted run.
    fn teardown(&mut self) -> Result<(), RequestError>;
}

/// Creates one [`Requester`] per benchmark connection.
pub trait RequesterFactory {
    /// Returns a new requester for connection `number`. Invoked exactly
    /// once per connection, before any worker starts.
    fn get_requester(&self, number: u64) -> Result<Box<dyn Requester>, RequestError>;
}
