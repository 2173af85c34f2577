pub mod body;
pub mod config;
pub mod connection;
pub mod engine;
pub mod filter;
pub mod interpreter;
pub mod logging;
pub mod macros;
pub mod message;

#[cfg(test)]
mod testing;

pub use engine::{EngineSettings, MilterEngine};
pub use filter::{FailurePolicy, Filter, FilterDef, FilterState};
pub use macros::{MacroNames, MacroSet, MacroSource};
pub use message::{Header, InMemoryMessage, MessageMutation};

/// The aggregated decision for one phase across all consulted filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reject,
    Discard,
    Tempfail,
    /// Full SMTP reply line, e.g. `554 5.7.1 Rejected by policy`
    ReplyCode(String),
}

impl Verdict {
    pub fn is_continue(&self) -> bool {
        matches!(self, Verdict::Continue)
    }

    /// The reply the SMTP dialogue should send for this verdict, if it
    /// refuses the current command.
    pub fn smtp_reply(&self) -> Option<&str> {
        match self {
            Verdict::Continue | Verdict::Discard => None,
            Verdict::Reject => Some(filter::DEFAULT_REJECT_REPLY),
            Verdict::Tempfail => Some(filter::DEFAULT_TEMPFAIL_REPLY),
            Verdict::ReplyCode(text) => Some(text),
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Continue => f.write_str("continue"),
            Verdict::Reject => f.write_str("reject"),
            Verdict::Discard => f.write_str("discard"),
            Verdict::Tempfail => f.write_str("tempfail"),
            Verdict::ReplyCode(text) => write!(f, "reply \"{}\"", text),
        }
    }
}
