pub mod dispatcher;
pub mod token;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use token::{Origin, Outcome, Reply, SendGuard, Token};
pub use transport::{Transport, TransportOptions};
