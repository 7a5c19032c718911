//! Requests: the unit of lazy, concurrent computation.
//!
//! A [`Request`] runs as a scheduler task, may spawn children through its
//! [`RequestContext`], and is awaited, waited on, or observed through a
//! completion callback. [`RequestPool`] fans out over many requests and
//! surfaces the first failure.

pub mod cancel;
pub mod context;
pub mod error;
pub mod pool;
pub mod request;

pub use cancel::CancelToken;
pub use context::RequestContext;
pub use error::RequestError;
pub use pool::RequestPool;
pub use request::{Request, RequestBuilder};
