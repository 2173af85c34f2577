use crate::config::select_filters;
use crate::connection;
use crate::filter::{Filter, FilterDef, FilterState};
use crate::interpreter;
use crate::macros::{self, MacroNames, MacroSet, MacroSource};
use crate::message::MessageMutation;
use crate::Verdict;
use futures::StreamExt;
use milter::{
    connect_payload, header_payload, macro_payload, strings_payload, ClientAddr, Command,
    MilterError, Response, TimeoutClass, MAX_CHUNK_SIZE,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Settings shared by every engine built from one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub chunk_size: usize,
    pub macros: MacroNames,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            chunk_size: MAX_CHUNK_SIZE,
            macros: MacroNames::default(),
        }
    }
}

/// Runs the filters of one SMTP connection.
///
/// Every phase visits the filters in their configured order and stops at
/// the first one whose answer is not CONTINUE. Filter failures never
/// escape: they are logged and turned into a verdict (or nothing) by the
/// filter's failure policy.
pub struct MilterEngine {
    filters: Vec<Filter>,
    settings: EngineSettings,
}

impl MilterEngine {
    pub fn new(defs: &[Arc<FilterDef>], settings: EngineSettings) -> Self {
        MilterEngine {
            filters: defs.iter().cloned().map(Filter::new).collect(),
            settings,
        }
    }

    /// Restricts the engine to `names`, in that order. Used for listeners
    /// that have their own filter list.
    pub fn with_filter_list(self, names: &[String]) -> miette::Result<Self> {
        let defs: Vec<Arc<FilterDef>> = self.filters.iter().map(Filter::shared_def).collect();
        let selected = select_filters(&defs, names)?;
        Ok(MilterEngine::new(&selected, self.settings))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    pub fn states(&self) -> Vec<(&str, FilterState)> {
        self.filters.iter().map(|f| (f.name(), f.state())).collect()
    }

    /// Connects and negotiates with every filter not yet connected.
    pub async fn open(&mut self) -> Verdict {
        let max = self.settings.chunk_size;
        let mut verdict = Verdict::Continue;
        for filter in self
            .filters
            .iter_mut()
            .filter(|f| f.state() == FilterState::Ready)
        {
            if let Err(e) = connection::open(filter, max).await {
                if let Some(failed) = filter.fail(&e) {
                    if verdict.is_continue() {
                        verdict = failed;
                    }
                }
            }
        }
        verdict
    }

    pub async fn connect(
        &mut self,
        hostname: &str,
        client_addr: &ClientAddr,
        macros: &dyn MacroSource,
    ) -> Verdict {
        let opened = self.open().await;
        if !opened.is_continue() {
            return opened;
        }

        let set = macros::collect(
            &self.settings.macros.connect,
            &self.settings.macros.templates,
            macros,
        );
        let payload = connect_payload(hostname, client_addr);
        let verdict = self.run_phase(Command::Connect, &payload, &set).await;

        // filters that accepted the connection want nothing more from it
        let max = self.settings.chunk_size;
        for filter in self
            .filters
            .iter_mut()
            .filter(|f| f.state() == FilterState::Closable)
        {
            if let Err(e) = filter.send(Command::Quit, &[], max).await {
                debug!(filter = %filter.name(), error = %e, "quit failed");
            }
            filter.close();
        }
        verdict
    }

    pub async fn helo(&mut self, name: &str, macros: &dyn MacroSource) -> Verdict {
        self.reset_for_message();
        let set = macros::collect(
            &self.settings.macros.helo,
            &self.settings.macros.templates,
            macros,
        );
        self.run_phase(Command::Helo, &strings_payload(&[name]), &set)
            .await
    }

    pub async fn mail_from<S: AsRef<str>>(&mut self, args: &[S], macros: &dyn MacroSource) -> Verdict {
        self.reset_for_message();
        let set = macros::collect(
            &self.settings.macros.envfrom,
            &self.settings.macros.templates,
            macros,
        );
        self.run_phase(Command::Mail, &strings_payload(args), &set)
            .await
    }

    pub async fn rcpt_to<S: AsRef<str>>(&mut self, args: &[S], macros: &dyn MacroSource) -> Verdict {
        let set = macros::collect(
            &self.settings.macros.envrcpt,
            &self.settings.macros.templates,
            macros,
        );
        self.run_phase(Command::Rcpt, &strings_payload(args), &set)
            .await
    }

    pub async fn header(&mut self, name: &str, value: &str) -> Verdict {
        self.run_phase(Command::Header, &header_payload(name, value), &Vec::new())
            .await
    }

    pub async fn end_of_headers(&mut self) -> Verdict {
        self.run_phase(Command::Eoh, &[], &Vec::new()).await
    }

    /// Sends `bytes` as one or more body chunks.
    pub async fn body(&mut self, bytes: &[u8]) -> Verdict {
        for chunk in bytes.chunks(self.settings.chunk_size) {
            let verdict = self.run_phase(Command::Body, chunk, &Vec::new()).await;
            if !verdict.is_continue() {
                return verdict;
            }
        }
        Verdict::Continue
    }

    /// Ends the body and applies each filter's actions to `message`.
    /// Filters still inside the message are aborted when the verdict is
    /// not CONTINUE.
    pub async fn end_of_message(&mut self, message: &mut dyn MessageMutation) -> Verdict {
        let max = self.settings.chunk_size;
        let mut verdict = Verdict::Continue;

        for filter in self.filters.iter_mut() {
            if filter.state() == FilterState::Error {
                match failed_verdict(filter) {
                    Some(failed) => {
                        verdict = failed;
                        break;
                    }
                    None => continue,
                }
            }
            if !filter.accepts_frames() {
                continue;
            }

            let result = match filter.send(Command::BodyEob, &[], max).await {
                Ok(()) => interpreter::collect_end_of_message(filter, message, max).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(answer) => verdict = answer,
                Err(e) => {
                    if let Some(failed) = filter.fail(&e) {
                        verdict = failed;
                    }
                }
            }
            if !verdict.is_continue() {
                debug!(filter = %filter.name(), %verdict, "end of message stopped");
                break;
            }
        }

        if !verdict.is_continue() {
            self.abort().await;
        }
        verdict
    }

    /// Runs the header, end-of-header, body and end-of-message phases from
    /// the message's own content.
    pub async fn data(&mut self, message: &mut dyn MessageMutation) -> Verdict {
        for header in message.headers().into_iter().filter(|h| !h.generated) {
            let verdict = self.header(&header.name, &header.value).await;
            if !verdict.is_continue() {
                self.abort().await;
                return verdict;
            }
        }

        let verdict = self.end_of_headers().await;
        if !verdict.is_continue() {
            self.abort().await;
            return verdict;
        }

        let mut stopped = None;
        {
            let mut body = message.body_stream();
            while let Some(chunk) = body.next().await {
                let verdict = match chunk {
                    Ok(chunk) => self.body(&chunk).await,
                    Err(e) => {
                        error!(error = ?e, "could not read message body");
                        Verdict::Tempfail
                    }
                };
                if !verdict.is_continue() {
                    stopped = Some(verdict);
                    break;
                }
            }
        }
        if let Some(verdict) = stopped {
            self.abort().await;
            return verdict;
        }

        self.end_of_message(message).await
    }

    /// Tells filters inside a message to forget it. No answer is expected.
    pub async fn abort(&mut self) {
        let max = self.settings.chunk_size;
        for filter in self
            .filters
            .iter_mut()
            .filter(|f| f.state() == FilterState::InMessage)
        {
            match filter.send(Command::Abort, &[], max).await {
                Ok(()) => filter.set_state(FilterState::Open),
                Err(e) => {
                    filter.fail(&e);
                }
            }
        }
    }

    /// Closes every filter connection.
    pub async fn quit(&mut self) {
        let max = self.settings.chunk_size;
        for filter in self.filters.iter_mut() {
            if filter.is_connected() {
                if let Err(e) = filter.send(Command::Quit, &[], max).await {
                    debug!(filter = %filter.name(), error = %e, "quit failed");
                }
            }
            filter.close();
        }
    }

    /// A new message starts on HELO and MAIL.
    fn reset_for_message(&mut self) {
        for filter in self.filters.iter_mut() {
            if matches!(filter.state(), FilterState::InMessage | FilterState::Done) {
                filter.set_state(FilterState::Open);
            }
        }
    }

    async fn run_phase(&mut self, command: Command, payload: &[u8], macros: &MacroSet) -> Verdict {
        let max = self.settings.chunk_size;
        let macro_frame = (!macros.is_empty()).then(|| macro_payload(command, macros));
        let mut verdict = Verdict::Continue;

        for filter in self.filters.iter_mut() {
            if filter.state() == FilterState::Error {
                match failed_verdict(filter) {
                    Some(failed) => {
                        verdict = failed;
                        break;
                    }
                    None => continue,
                }
            }
            if !filter.accepts_frames() || filter.skips(command) {
                continue;
            }

            match exchange(filter, command, payload, macro_frame.as_deref(), max).await {
                Ok(answer) => verdict = answer,
                Err(e) => {
                    if let Some(failed) = filter.fail(&e) {
                        warn!(filter = %filter.name(), %failed, "failure policy applied");
                        verdict = failed;
                    }
                }
            }
            if !verdict.is_continue() {
                debug!(filter = %filter.name(), phase = %command, %verdict, "phase stopped");
                break;
            }
        }
        verdict
    }
}

/// What a filter already in ERROR contributes to a phase.
fn failed_verdict(filter: &Filter) -> Option<Verdict> {
    let verdict = filter.def().failure_verdict()?;
    debug!(filter = %filter.name(), %verdict, "failed filter applies its policy");
    Some(verdict)
}

/// Macros, the phase frame and the filter's answer to it.
async fn exchange(
    filter: &mut Filter,
    command: Command,
    payload: &[u8],
    macros: Option<&[u8]>,
    max_payload: usize,
) -> Result<Verdict, MilterError> {
    if let Some(macros) = macros {
        filter.send(Command::Macro, macros, max_payload).await?;
    }
    filter.send(command, payload, max_payload).await?;

    let deadline = filter.def().timeouts.deadline(TimeoutClass::Read);
    let frame = filter.receive(max_payload, deadline).await?;
    let response = Response::decode(&frame)?;
    interpreter::phase_verdict(filter, command, response)
}
