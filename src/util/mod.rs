//! Small shared utilities.

mod ack;

pub use ack::AckSet;
