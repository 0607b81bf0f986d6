//! Command and telemetry bridge between a controller and a simulated agent environment.
//!
//! A controller drives agents over two independent channels: a bounded
//! request/reply **command channel** and a topic-filtered **telemetry
//! channel**. Both carry the same JSON envelope (`{"header":{..},"data":{..}}`).
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP endpoints, streams, shutdown handles
//! - [`frame`]: Length-prefixed message framing with channel multiplexing
//! - [`envelope`]: Envelope codec, action table, topic split and filter
//! - [`peer`]: Command/telemetry channels and the environment-side endpoints (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use agentbridge_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use agentbridge_frame::*;
}

/// Re-export envelope types.
pub mod envelope {
    pub use agentbridge_envelope::*;
}

/// Re-export channel types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use agentbridge_peer::*;
}
