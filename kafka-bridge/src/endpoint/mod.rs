use crate::api::BridgeError;

pub mod sink;
pub mod source;

/// Invoked once when an endpoint is closed, so that its owner can release it.
pub type CloseHandler = Box<dyn FnOnce() + Send + Sync>;

/// A proxy between bridge clients and the Kafka clients serving them.
pub trait BridgeEndpoint {
    /// Creates the Kafka clients backing the endpoint.
    fn open(&mut self) -> Result<(), BridgeError>;

    /// Releases the Kafka clients. Closing an endpoint that was never opened is fine.
    fn close(&mut self);

    fn close_handler(&mut self, handler: CloseHandler);
}
