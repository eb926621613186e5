//! Callscope PBX integration
//!
//! Client for the Grandstream UCM JSON API:
//! - challenge/login handshake and per-tenant session reuse
//! - CDR fetch and authoritative-leg extraction
//! - recording download
//! - a scripted mock device for tests

pub mod cdr;
pub mod client;
pub mod mock;
pub mod recording;
pub mod session;

pub use cdr::{extract_calls, CdrPayload, LegRule};
pub use client::{PbxApi, PbxEndpoint, UcmClient};
pub use mock::MockPbx;
pub use recording::RecordingRef;
pub use session::SessionManager;
