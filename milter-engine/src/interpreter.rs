use crate::body::BodyReplacement;
use crate::filter::{Filter, FilterState};
use crate::message::MessageMutation;
use crate::Verdict;
use milter::{Actions, Command, Deadline, MilterError, Response, TimeoutClass};
use tracing::{debug, error, warn};

/// Whether `text` is usable as a filter supplied SMTP reply: a 4xx or 5xx
/// code followed by a space, a dash or nothing.
pub fn valid_reply_code(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() < 3 {
        return false;
    }
    matches!(bytes[0], b'4' | b'5')
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && matches!(bytes.get(3), None | Some(b' ') | Some(b'-'))
}

/// Applies a terminal response to `command` to the filter's state and
/// returns the resulting verdict.
pub(crate) fn phase_verdict(
    filter: &mut Filter,
    command: Command,
    response: Response,
) -> Result<Verdict, MilterError> {
    // a refused recipient does not end the message for this filter
    let refused = if command == Command::Rcpt {
        None
    } else {
        Some(FilterState::Done)
    };

    let (verdict, next) = match response {
        Response::Continue => (
            Verdict::Continue,
            (command == Command::Mail).then_some(FilterState::InMessage),
        ),
        Response::Accept => {
            let next = match command {
                Command::Connect | Command::Helo => FilterState::Closable,
                _ => FilterState::Done,
            };
            (Verdict::Continue, Some(next))
        }
        Response::Reject => (Verdict::Reject, refused),
        Response::Tempfail => (Verdict::Tempfail, refused),
        Response::Discard => (Verdict::Discard, Some(FilterState::Done)),
        Response::ReplyCode(text) => {
            let text = if valid_reply_code(&text) {
                text
            } else {
                warn!(filter = %filter.name(), reply = %text, "invalid reply code from filter");
                filter.def().failure_text().to_string()
            };
            (Verdict::ReplyCode(text), refused)
        }
        other => {
            return Err(MilterError::ProtocolViolation(format!(
                "unexpected '{}' response to {}",
                other.code().code() as char,
                command
            )))
        }
    };

    if let Some(state) = next {
        filter.set_state(state);
    }
    Ok(verdict)
}

/// Reads the filter's answers after end of body: any number of actions and
/// progress notes followed by one terminal response.
pub(crate) async fn collect_end_of_message(
    filter: &mut Filter,
    message: &mut dyn MessageMutation,
    max_payload: usize,
) -> Result<Verdict, MilterError> {
    let timeout = filter.def().timeouts.end_of_message;
    let mut deadline = Deadline::after(TimeoutClass::EndOfMessage, timeout);
    let mut replacement: Option<BodyReplacement> = None;
    let mut mutation_failed = false;

    loop {
        let frame = filter.receive(max_payload, deadline).await?;
        let response = match Response::decode(&frame) {
            Ok(response) => response,
            Err(e @ MilterError::MalformedPayload { .. }) => {
                warn!(filter = %filter.name(), error = %e, "ignoring malformed action");
                continue;
            }
            Err(e) => return Err(e),
        };

        if response == Response::Progress {
            debug!(filter = %filter.name(), "filter reported progress");
            deadline = Deadline::after(TimeoutClass::EndOfMessage, timeout);
            continue;
        }

        if response.code().is_terminal() {
            if let Some(body) = replacement.take() {
                if let Err(e) = body.commit(message).await {
                    error!(filter = %filter.name(), error = ?e, "could not finish body replacement");
                    mutation_failed = true;
                }
            }
            let verdict = phase_verdict(filter, Command::BodyEob, response)?;
            if filter.state() != FilterState::Done {
                filter.set_state(FilterState::Done);
            }
            if mutation_failed && verdict.is_continue() {
                return Ok(Verdict::Tempfail);
            }
            return Ok(verdict);
        }

        // keep the conversation in sync but stop touching a message that
        // could not be changed
        if mutation_failed {
            continue;
        }
        if let Err(e) = apply_action(filter, response, message, &mut replacement).await {
            error!(filter = %filter.name(), error = ?e, "could not apply filter action");
            mutation_failed = true;
        }
    }
}

fn required_action(response: &Response) -> Actions {
    match response {
        Response::AddHeader { .. } => Actions::ADD_HEADERS,
        Response::ChangeHeader { .. } => Actions::CHANGE_HEADERS,
        Response::AddRecipient(_) => Actions::ADD_RCPT,
        Response::DeleteRecipient(_) => Actions::DELETE_RCPT,
        Response::Quarantine(_) => Actions::QUARANTINE,
        Response::ReplaceBody(_) => Actions::CHANGE_BODY,
        _ => Actions::empty(),
    }
}

async fn apply_action(
    filter: &Filter,
    response: Response,
    message: &mut dyn MessageMutation,
    replacement: &mut Option<BodyReplacement>,
) -> miette::Result<()> {
    let required = required_action(&response);
    let negotiated = filter
        .negotiated()
        .map(|n| n.actions)
        .unwrap_or_default();
    if !negotiated.contains(required) {
        // honoured anyway
        warn!(
            filter = %filter.name(),
            action = ?required,
            "filter requested an action it did not negotiate"
        );
    }

    match response {
        Response::AddHeader { name, value } => {
            debug!(filter = %filter.name(), %name, "adding header");
            message.add_header(&name, &value).await
        }
        Response::ChangeHeader { index, name, value } => {
            debug!(filter = %filter.name(), %name, index, "changing header");
            message.change_header(&name, index, &value).await
        }
        Response::AddRecipient(address) => message.add_recipient(&address).await,
        Response::DeleteRecipient(address) => message.delete_recipient(&address).await,
        Response::Quarantine(reason) => {
            warn!(filter = %filter.name(), %reason, "message quarantined");
            message.quarantine(&reason).await
        }
        Response::ReplaceBody(chunk) => {
            replacement
                .get_or_insert_with(BodyReplacement::new)
                .write(&chunk);
            Ok(())
        }
        _ => Ok(()),
    }
}
