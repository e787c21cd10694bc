//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! The relay owns live connection state and ordering; the store traits own
//! durability. Route handlers only translate between the wire and these
//! services.

pub mod pg_store;
pub mod registry;
pub mod relay;
pub mod store;
