pub mod publisher;
pub mod receiver;
pub mod wire;

pub use publisher::RelayPublisher;
pub use receiver::ShareReceiver;
