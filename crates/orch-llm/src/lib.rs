//! LLM oracle adapters used by the worker pipeline and the agent manager:
//! plan+code generation, structured review, and substage-goal drafting all
//! go through the `Oracle` trait so callers never depend on a concrete
//! provider.

pub mod anthropic;
pub mod fake;
pub mod oracle;

pub use anthropic::AnthropicOracle;
pub use fake::FakeOracle;
pub use oracle::{Oracle, OracleError, OracleResult};
