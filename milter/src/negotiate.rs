use super::*;
use bytes::{BufMut, Bytes, BytesMut};
use nom::{number::complete::be_u32, IResult, Parser};

const OPTNEG_LEN: usize = 12;

/// Contents of an option negotiation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptNeg {
    pub version: u32,
    pub actions: Actions,
    pub protocol: ProtocolFlags,
}

impl Default for OptNeg {
    /// Everything this client understands.
    fn default() -> Self {
        OptNeg {
            version: MILTER_VERSION,
            actions: Actions::all(),
            protocol: ProtocolFlags::all(),
        }
    }
}

impl OptNeg {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPTNEG_LEN);
        buf.put_u32(self.version);
        buf.put_u32(self.actions.bits());
        buf.put_u32(self.protocol.bits());
        buf.freeze()
    }

    /// Checks a filter's reply against what this side offered and returns
    /// the negotiated settings.
    pub fn accept_reply(&self, frame: &Frame) -> Result<OptNeg, NegotiationError> {
        if frame.command != Command::OptNeg.code() {
            return Err(NegotiationError::UnexpectedCommand(frame.command as char));
        }
        let (_, (version, actions, protocol)) = optneg_fields(&frame.payload)
            .map_err(|_| NegotiationError::ShortPayload(frame.payload.len()))?;

        if version == OBSOLETE_VERSION || version > self.version {
            return Err(NegotiationError::VersionIncompatible {
                version,
                max: self.version,
            });
        }
        check_subset("action", actions, self.actions.bits())?;
        check_subset("protocol", protocol, self.protocol.bits())?;

        Ok(OptNeg {
            version,
            actions: Actions::from_bits_retain(actions),
            protocol: ProtocolFlags::from_bits_retain(protocol),
        })
    }
}

fn optneg_fields(input: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    (be_u32, be_u32, be_u32).parse(input)
}

fn check_subset(kind: &'static str, requested: u32, supported: u32) -> Result<(), NegotiationError> {
    if requested & supported != requested {
        return Err(NegotiationError::CapabilityMismatch {
            kind,
            requested,
            supported,
        });
    }
    Ok(())
}
