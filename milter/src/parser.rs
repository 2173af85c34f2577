use super::*;
use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_until},
    combinator::all_consuming,
    number::complete::be_u32,
    sequence::terminated,
    IResult, Parser,
};

/// A decoded filter response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    Accept,
    Reject,
    Discard,
    Tempfail,
    /// SMTP reply line supplied by the filter, not yet validated
    ReplyCode(String),
    Progress,
    Quarantine(String),
    AddHeader {
        name: String,
        value: String,
    },
    /// `index` counts occurrences of `name` starting at 1
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
    AddRecipient(String),
    DeleteRecipient(String),
    ReplaceBody(Bytes),
}

impl Response {
    /// Decodes a response frame.
    ///
    /// Unknown command bytes are a `ProtocolViolation`. A known command
    /// whose payload does not have the expected layout is reported as
    /// `MalformedPayload` so the caller can drop just that one action.
    pub fn decode(frame: &Frame) -> Result<Response, MilterError> {
        let code = ResponseCode::try_from(frame.command)?;
        let payload = &frame.payload[..];

        let response = match code {
            ResponseCode::Continue => Response::Continue,
            ResponseCode::Accept => Response::Accept,
            ResponseCode::Reject => Response::Reject,
            ResponseCode::Discard => Response::Discard,
            ResponseCode::Tempfail => Response::Tempfail,
            ResponseCode::Progress => Response::Progress,
            ResponseCode::ReplyCode => {
                // An unterminated reply turns into an empty one, which the
                // engine replaces with the filter's failure text.
                let text = single_string(payload).map(lossy).unwrap_or_default();
                Response::ReplyCode(text)
            }
            ResponseCode::Quarantine => {
                let reason = single_string(payload)
                    .ok_or_else(|| MilterError::malformed(frame.command, "unterminated reason"))?;
                Response::Quarantine(lossy(reason))
            }
            ResponseCode::AddHeader => {
                let (_, (name, value)) = all_consuming((cstring, cstring))
                    .parse(payload)
                    .map_err(|_| MilterError::malformed(frame.command, "expected name and value"))?;
                if name.is_empty() {
                    return Err(MilterError::malformed(frame.command, "empty header name"));
                }
                Response::AddHeader {
                    name: lossy(name),
                    value: lossy(value),
                }
            }
            ResponseCode::ChangeHeader => {
                let (_, (index, name, value)) = all_consuming((be_u32, cstring, cstring))
                    .parse(payload)
                    .map_err(|_| {
                        MilterError::malformed(frame.command, "expected index, name and value")
                    })?;
                if name.is_empty() {
                    return Err(MilterError::malformed(frame.command, "empty header name"));
                }
                Response::ChangeHeader {
                    index,
                    name: lossy(name),
                    value: lossy(value),
                }
            }
            ResponseCode::AddRecipient | ResponseCode::DeleteRecipient => {
                let address = single_string(payload)
                    .filter(|address| !address.is_empty())
                    .ok_or_else(|| MilterError::malformed(frame.command, "expected an address"))?;
                if code == ResponseCode::AddRecipient {
                    Response::AddRecipient(lossy(address))
                } else {
                    Response::DeleteRecipient(lossy(address))
                }
            }
            ResponseCode::ReplaceBody => Response::ReplaceBody(frame.payload.clone()),
        };
        Ok(response)
    }

    pub fn code(&self) -> ResponseCode {
        match self {
            Response::Continue => ResponseCode::Continue,
            Response::Accept => ResponseCode::Accept,
            Response::Reject => ResponseCode::Reject,
            Response::Discard => ResponseCode::Discard,
            Response::Tempfail => ResponseCode::Tempfail,
            Response::ReplyCode(_) => ResponseCode::ReplyCode,
            Response::Progress => ResponseCode::Progress,
            Response::Quarantine(_) => ResponseCode::Quarantine,
            Response::AddHeader { .. } => ResponseCode::AddHeader,
            Response::ChangeHeader { .. } => ResponseCode::ChangeHeader,
            Response::AddRecipient(_) => ResponseCode::AddRecipient,
            Response::DeleteRecipient(_) => ResponseCode::DeleteRecipient,
            Response::ReplaceBody(_) => ResponseCode::ReplaceBody,
        }
    }
}

fn cstring(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until(&b"\0"[..]), tag(&b"\0"[..])).parse(input)
}

/// Exactly one NUL terminated string and nothing after it.
fn single_string(input: &[u8]) -> Option<&[u8]> {
    all_consuming(cstring).parse(input).ok().map(|(_, s)| s)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
