//! Model invocation: one retrying, breaker-guarded, schema-validating path
//! for every stage that needs language understanding.

pub mod breaker;
pub mod error;
pub mod invoker;
pub mod schema;
pub mod transport;

pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{InvokeError, TransportError};
pub use invoker::{Invocation, InvokerSettings, ModelInvoker};
pub use schema::SchemaRegistry;
pub use transport::{HttpTransport, HttpTransportSettings, ModelRequest, ModelTransport};
