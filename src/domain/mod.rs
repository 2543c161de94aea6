//! Domain layer public interface.
//!
//! This module defines the broker abstraction the client and worker drive,
//! independent of any concrete client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    Message,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
