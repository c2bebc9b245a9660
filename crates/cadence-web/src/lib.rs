//! HTTP trigger for the Cadence publishing worker.
//!
//! Exposes one authenticated endpoint, `/api/worker/run`, that runs a
//! worker invocation and returns its JSON response, plus `/health`.

mod error;
mod routes;

pub use error::WebError;
pub use routes::{AppState, create_router};
