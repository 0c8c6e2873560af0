pub mod broker;
pub mod client_id;
pub mod connections;
pub mod keep_alive;
pub mod packet_id;
pub mod retain;
pub mod router;
pub mod session;
pub mod trie;

pub use client_id::ClientId;
pub use keep_alive::KeepAlive;

/// Identifies one TCP connection for the lifetime of the process.
///
/// Distinct from the client id: a client id can be taken over by a newer
/// connection, and teardown must only deregister its own registration.
pub type ConnectionId = u64;
