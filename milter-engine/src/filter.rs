use crate::Verdict;
use milter::{
    read_frame, write_frame, Command, Deadline, Frame, MilterError, OptNeg, ProtocolFlags,
    SocketSpec, Timeouts,
};
use miette::{bail, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

pub const DEFAULT_TEMPFAIL_REPLY: &str = "451 4.3.2 Please try again later";
pub const DEFAULT_REJECT_REPLY: &str = "554 5.7.1 Command rejected";

/// What happens to the transaction when a filter cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Skip the filter for the rest of the connection.
    #[default]
    Ignore,
    Tempfail,
    Reject,
}

impl FailurePolicy {
    /// Parses the `flags` option of a filter: `T` tempfails, `R` rejects.
    pub fn from_flags(flags: &str) -> Result<Self> {
        let mut policy = FailurePolicy::Ignore;
        for flag in flags.chars().filter(|c| !c.is_whitespace()) {
            let next = match flag.to_ascii_uppercase() {
                'T' => FailurePolicy::Tempfail,
                'R' => FailurePolicy::Reject,
                other => bail!("unknown filter flag '{}'", other),
            };
            if policy != FailurePolicy::Ignore && policy != next {
                bail!("filter flags T and R are mutually exclusive");
            }
            policy = next;
        }
        Ok(policy)
    }
}

/// Static definition of one filter, shared by every engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDef {
    pub name: String,
    pub socket: SocketSpec,
    pub timeouts: Timeouts,
    pub policy: FailurePolicy,
    /// Reply used when the filter fails or sends an unusable reply code.
    pub reply: Option<String>,
}

impl FilterDef {
    pub fn new(name: impl Into<String>, socket: SocketSpec) -> Self {
        FilterDef {
            name: name.into(),
            socket,
            timeouts: Timeouts::default(),
            policy: FailurePolicy::default(),
            reply: None,
        }
    }

    pub fn failure_text(&self) -> &str {
        match (&self.reply, self.policy) {
            (Some(reply), _) => reply,
            (None, FailurePolicy::Reject) => DEFAULT_REJECT_REPLY,
            (None, _) => DEFAULT_TEMPFAIL_REPLY,
        }
    }

    /// The verdict a failure of this filter imposes on the current phase.
    pub fn failure_verdict(&self) -> Option<Verdict> {
        let fallback = match self.policy {
            FailurePolicy::Ignore => return None,
            FailurePolicy::Tempfail => Verdict::Tempfail,
            FailurePolicy::Reject => Verdict::Reject,
        };
        Some(
            self.reply
                .clone()
                .map(Verdict::ReplyCode)
                .unwrap_or(fallback),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterState {
    /// Configured, never connected
    Ready,
    /// Socket open, negotiation in progress
    Connecting,
    Open,
    /// Inside a message transaction
    InMessage,
    /// No further interest in this connection
    Closable,
    /// Finished with the current message
    Done,
    Closed,
    Error,
}

impl std::fmt::Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FilterState::Ready => "ready",
            FilterState::Connecting => "connecting",
            FilterState::Open => "open",
            FilterState::InMessage => "inmsg",
            FilterState::Closable => "closable",
            FilterState::Done => "done",
            FilterState::Closed => "closed",
            FilterState::Error => "error",
        })
    }
}

pub(crate) trait FilterIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FilterIo for T {}

/// Live, per-connection state of one filter.
pub struct Filter {
    def: Arc<FilterDef>,
    state: FilterState,
    negotiated: Option<OptNeg>,
    stream: Option<Box<dyn FilterIo>>,
}

impl Filter {
    pub fn new(def: Arc<FilterDef>) -> Self {
        Filter {
            def,
            state: FilterState::Ready,
            negotiated: None,
            stream: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &FilterDef {
        &self.def
    }

    pub(crate) fn shared_def(&self) -> Arc<FilterDef> {
        Arc::clone(&self.def)
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Version and capabilities agreed on during negotiation.
    pub fn negotiated(&self) -> Option<&OptNeg> {
        self.negotiated.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn set_state(&mut self, state: FilterState) {
        if self.state != state {
            debug!(filter = %self.def.name, from = %self.state, to = %state, "filter state change");
            self.state = state;
        }
    }

    pub(crate) fn attach(&mut self, stream: Box<dyn FilterIo>) {
        self.stream = Some(stream);
        self.set_state(FilterState::Connecting);
    }

    pub(crate) fn opened(&mut self, negotiated: OptNeg) {
        self.negotiated = Some(negotiated);
        self.set_state(FilterState::Open);
    }

    /// Only open filters and filters inside a message receive phase frames.
    pub(crate) fn accepts_frames(&self) -> bool {
        matches!(self.state, FilterState::Open | FilterState::InMessage)
    }

    /// Whether the filter asked not to be sent `command`.
    pub(crate) fn skips(&self, command: Command) -> bool {
        let flag = match command {
            Command::Connect => ProtocolFlags::NO_CONNECT,
            Command::Helo => ProtocolFlags::NO_HELO,
            Command::Mail => ProtocolFlags::NO_MAIL,
            Command::Rcpt => ProtocolFlags::NO_RCPT,
            Command::Body => ProtocolFlags::NO_BODY,
            Command::Header => ProtocolFlags::NO_HEADERS,
            Command::Eoh => ProtocolFlags::NO_EOH,
            _ => return false,
        };
        self.negotiated
            .map(|n| n.protocol.contains(flag))
            .unwrap_or(false)
    }

    pub(crate) async fn send(
        &mut self,
        command: Command,
        payload: &[u8],
        max_payload: usize,
    ) -> Result<(), MilterError> {
        let deadline = self.def.timeouts.deadline(milter::TimeoutClass::Write);
        let stream = self.stream_mut()?;
        write_frame(stream, command.code(), payload, max_payload, deadline).await?;
        debug!(filter = %self.def.name, %command, len = payload.len(), "sent frame");
        Ok(())
    }

    pub(crate) async fn receive(
        &mut self,
        max_payload: usize,
        deadline: Deadline,
    ) -> Result<Frame, MilterError> {
        let stream = self.stream_mut()?;
        let frame = read_frame(stream, max_payload, deadline).await?;
        debug!(
            filter = %self.def.name,
            command = %(frame.command as char),
            len = frame.payload.len(),
            "received frame"
        );
        Ok(frame)
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn FilterIo>, MilterError> {
        self.stream
            .as_mut()
            .ok_or_else(|| MilterError::ProtocolViolation("filter is not connected".to_string()))
    }

    /// Drops the connection after `error` and returns the verdict the
    /// failure policy imposes, if any.
    pub(crate) fn fail(&mut self, error: &MilterError) -> Option<Verdict> {
        self.stream = None;
        self.set_state(FilterState::Error);
        let verdict = self.def.failure_verdict();
        warn!(
            filter = %self.def.name,
            error = %error,
            policy = ?self.def.policy,
            "filter failed"
        );
        verdict
    }

    pub(crate) fn close(&mut self) {
        self.stream = None;
        self.set_state(FilterState::Closed);
    }
}
