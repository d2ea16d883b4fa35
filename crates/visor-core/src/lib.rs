//! Core types shared across the visor bridge: ids, the error taxonomy,
//! gateway wire envelopes, reply classification, and the trait seams the
//! higher crates plug into.

pub mod device;
pub mod errors;
pub mod ids;
pub mod reply;
pub mod turn;
pub mod wire;
