pub mod assembler;
pub mod catalog;
pub mod codec;
pub mod connection;
pub mod decoder;
pub mod message;
pub(crate) mod reader;
pub mod registry;
pub mod replication;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;


pub use connection::PgConnection;
pub use decoder::decode;
pub use message::{Lsn, Message, RawMessage, WalMessage};
pub use registry::Registry;
pub use replication::{ChangeSource, PgChangeSource, MARKER_PREFIX, SKIP_TRANSACTION};
