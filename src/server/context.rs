//! Per-call state threaded through server handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::code::Code;
use crate::error::RpcError;
use crate::metadata::Metadata;

#[derive(Debug, Default)]
struct Shared {
    code: Code,
    details: Option<String>,
    initial_metadata: Option<Metadata>,
    initial_metadata_taken: bool,
    trailing_metadata: Option<Metadata>,
    aborted: bool,
}

/// Handle on the state of one server-side call.
///
/// Handlers receive a clone per invocation and steer the outcome through
/// it: the status code and details, initial and trailing metadata, and
/// the abort short-circuit. The engine reads the final state back when it
/// writes the response.
#[derive(Debug, Clone)]
pub struct ServerContext {
    shared: Arc<Mutex<Shared>>,
    deadline: Option<Instant>,
    invocation_metadata: Arc<Metadata>,
}

impl ServerContext {
    pub(crate) fn new(deadline: Option<Instant>, invocation_metadata: Metadata) -> Self {
        ServerContext {
            shared: Arc::new(Mutex::new(Shared::default())),
            deadline,
            invocation_metadata: Arc::new(invocation_metadata),
        }
    }

    /// Set the status code reported in the trailer.
    pub fn set_code(&self, code: Code) {
        self.shared.lock().unwrap().code = code;
    }

    /// Set the details string reported in `grpc-message`.
    pub fn set_details(&self, details: impl Into<String>) {
        self.shared.lock().unwrap().details = Some(details.into());
    }

    /// The current status code.
    pub fn code(&self) -> Code {
        self.shared.lock().unwrap().code
    }

    /// The current details string.
    pub fn details(&self) -> Option<String> {
        self.shared.lock().unwrap().details.clone()
    }

    /// Attach metadata to the response headers.
    ///
    /// May be called at most once, and only before the first response
    /// message has been written.
    pub fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.initial_metadata_taken || shared.initial_metadata.is_some() {
            return Err(RpcError::internal("initial metadata already sent"));
        }
        shared.initial_metadata = Some(metadata);
        Ok(())
    }

    /// Attach metadata to the trailer frame.
    pub fn set_trailing_metadata(&self, metadata: Metadata) {
        self.shared.lock().unwrap().trailing_metadata = Some(metadata);
    }

    /// Terminate the call with a non-`OK` status.
    ///
    /// Records the code and details, then hands back the error the handler
    /// returns to unwind itself; no further response bytes are produced
    /// for an aborted call. Aborting with `Code::Ok` is refused: the
    /// context is left untouched and an `INTERNAL` error is returned.
    pub fn abort(&self, code: Code, details: impl Into<String>) -> RpcError {
        if code == Code::Ok {
            return RpcError::internal("abort called with status OK");
        }

        let details = details.into();
        let mut shared = self.shared.lock().unwrap();
        shared.code = code;
        shared.details = Some(details.clone());
        shared.aborted = true;
        RpcError::new(code, details)
    }

    /// Time left until the deadline, or `None` when the call has none.
    ///
    /// Decreases monotonically and bottoms out at zero.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The absolute deadline of this call, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Metadata the caller attached to the request.
    pub fn invocation_metadata(&self) -> &Metadata {
        &self.invocation_metadata
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.shared.lock().unwrap().aborted
    }

    /// Fold a handler error into the terminal state, unless an abort
    /// already recorded one.
    pub(crate) fn record_error(&self, err: &RpcError) {
        let mut shared = self.shared.lock().unwrap();
        if shared.aborted {
            return;
        }
        shared.code = err.code();
        shared.details = err.details().map(str::to_owned);
    }

    pub(crate) fn take_initial_metadata(&self) -> Option<Metadata> {
        let mut shared = self.shared.lock().unwrap();
        shared.initial_metadata_taken = true;
        shared.initial_metadata.take()
    }

    pub(crate) fn trailing_metadata(&self) -> Option<Metadata> {
        self.shared.lock().unwrap().trailing_metadata.clone()
    }
}
