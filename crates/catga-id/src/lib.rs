//! Lock-free distributed id generation.
//!
//! A Snowflake-style generator producing sortable 63-bit ids from a single
//! packed atomic word, without a mutex on the hot path. See
//! [`generator::IdGenerator`] for the CAS algorithm and
//! [`layout::SnowflakeLayout`] for the bit-field configuration.

mod generator;
mod layout;

pub use generator::{GeneratorConfig, IdError, IdGenerator};
pub use layout::{LayoutError, ParsedId, SnowflakeLayout};
