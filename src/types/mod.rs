//! Core data types shared across the pipeline.
//!
//! - [`Frame`] is the unit produced by every frame source, sequence-numbered
//!   and sharing its pixels through an `Arc`
//! - [`ConnectionState`] is the reconnecting source's state machine
//! - [`Cadence`] controls which pulled frames reach the inference engine

mod cadence;
mod connection_state;
mod frame;

pub use cadence::Cadence;
pub use connection_state::ConnectionState;
pub use frame::Frame;
