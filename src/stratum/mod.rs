pub mod connection;
pub mod protocol;
pub mod server;
pub mod tls;

pub use connection::Session;
pub use protocol::{StratumError, StratumRequest, StratumResponse};
pub use server::{SessionHandler, StratumServer};
