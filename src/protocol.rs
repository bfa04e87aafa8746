//! RPC encoding seam

use std::future::Future;
use std::pin::Pin;

use crate::error::BoxError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Pending reply to one remote call
pub type Reply<'a, V, E> = BoxFuture<'a, Result<Vec<V>, E>>;

/// Turns a method name and arguments into a request/response exchange on a
/// transport connection `H`
pub trait Protocol<H>: Send + Sync + 'static {
    type Value: Send + 'static;
    /// Error reported by the remote side
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issue a call. An `Err` means the request was never sent; otherwise the
    /// returned future resolves with the remote result values or error.
    fn invoke<'a>(
        &'a self,
        connection: &'a H,
        method: &str,
        args: Vec<Self::Value>,
    ) -> Result<Reply<'a, Self::Value, Self::Error>, BoxError>;
}
