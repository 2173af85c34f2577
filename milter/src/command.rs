use super::*;

/// Commands the MTA sends to a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Abort the current message, keep the connection
    Abort = b'A',
    /// One chunk of the message body
    Body = b'B',
    /// SMTP client connection details
    Connect = b'C',
    /// Macro definitions for the command that follows
    Macro = b'D',
    /// End of the message body
    BodyEob = b'E',
    /// HELO/EHLO argument
    Helo = b'H',
    /// One message header
    Header = b'L',
    /// MAIL FROM arguments
    Mail = b'M',
    /// End of the header block
    Eoh = b'N',
    /// Option negotiation
    OptNeg = b'O',
    /// Close the filter connection
    Quit = b'Q',
    /// RCPT TO arguments
    Rcpt = b'R',
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Abort => "abort",
            Command::Body => "body",
            Command::Connect => "connect",
            Command::Macro => "macro",
            Command::BodyEob => "end-of-message",
            Command::Helo => "helo",
            Command::Header => "header",
            Command::Mail => "mail",
            Command::Eoh => "end-of-header",
            Command::OptNeg => "negotiate",
            Command::Quit => "quit",
            Command::Rcpt => "rcpt",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Response codes a filter may send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    AddRecipient = b'+',
    DeleteRecipient = b'-',
    Accept = b'a',
    ReplaceBody = b'b',
    Continue = b'c',
    Discard = b'd',
    AddHeader = b'h',
    ChangeHeader = b'm',
    Progress = b'p',
    Quarantine = b'q',
    Reject = b'r',
    Tempfail = b't',
    ReplyCode = b'y',
}

impl ResponseCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the code ends the filter's answer to a command.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResponseCode::Accept
                | ResponseCode::Continue
                | ResponseCode::Discard
                | ResponseCode::Reject
                | ResponseCode::Tempfail
                | ResponseCode::ReplyCode
        )
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = MilterError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            b'+' => ResponseCode::AddRecipient,
            b'-' => ResponseCode::DeleteRecipient,
            b'a' => ResponseCode::Accept,
            b'b' => ResponseCode::ReplaceBody,
            b'c' => ResponseCode::Continue,
            b'd' => ResponseCode::Discard,
            b'h' => ResponseCode::AddHeader,
            b'm' => ResponseCode::ChangeHeader,
            b'p' => ResponseCode::Progress,
            b'q' => ResponseCode::Quarantine,
            b'r' => ResponseCode::Reject,
            b't' => ResponseCode::Tempfail,
            b'y' => ResponseCode::ReplyCode,
            other => {
                return Err(MilterError::ProtocolViolation(format!(
                    "unknown response code {:#04x}",
                    other
                )))
            }
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_lookup() {
        assert_eq!(ResponseCode::try_from(b'c').unwrap(), ResponseCode::Continue);
        assert_eq!(ResponseCode::try_from(b'y').unwrap(), ResponseCode::ReplyCode);
        assert_eq!(
            ResponseCode::try_from(b'+').unwrap(),
            ResponseCode::AddRecipient
        );
        assert!(matches!(
            ResponseCode::try_from(b'Z'),
            Err(MilterError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_terminal_codes() {
        assert!(ResponseCode::Accept.is_terminal());
        assert!(ResponseCode::ReplyCode.is_terminal());
        assert!(!ResponseCode::Progress.is_terminal());
        assert!(!ResponseCode::AddHeader.is_terminal());
        assert!(!ResponseCode::ReplaceBody.is_terminal());
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::OptNeg.code(), b'O');
        assert_eq!(Command::BodyEob.code(), b'E');
        assert_eq!(Command::Eoh.code(), b'N');
        assert_eq!(Command::Macro.to_string(), "macro");
    }
}
