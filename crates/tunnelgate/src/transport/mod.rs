pub mod conn;
pub mod resolver;

pub use conn::{AcceptStatus, ConnectProgress, Connection, IoStatus, Listener};
pub use resolver::Resolver;
