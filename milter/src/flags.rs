use bitflags::bitflags;

bitflags! {
    /// Message modifications a filter may request at end of message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Actions: u32 {
        const ADD_HEADERS = 0x01;
        const CHANGE_BODY = 0x02;
        const ADD_RCPT = 0x04;
        const DELETE_RCPT = 0x08;
        const CHANGE_HEADERS = 0x10;
        const QUARANTINE = 0x20;
    }
}

bitflags! {
    /// Phases a filter asks not to be sent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolFlags: u32 {
        const NO_CONNECT = 0x01;
        const NO_HELO = 0x02;
        const NO_MAIL = 0x04;
        const NO_RCPT = 0x08;
        const NO_BODY = 0x10;
        const NO_HEADERS = 0x20;
        const NO_EOH = 0x40;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(Actions::all().bits(), 0x3f);
        assert_eq!(ProtocolFlags::all().bits(), 0x7f);
        assert_eq!(
            (Actions::ADD_HEADERS | Actions::CHANGE_HEADERS).bits(),
            0x11
        );
    }

    #[test]
    fn test_unknown_bits_rejected() {
        assert!(Actions::from_bits(0x40).is_none());
        assert!(ProtocolFlags::from_bits(0x100).is_none());
        assert_eq!(
            ProtocolFlags::from_bits(0x05),
            Some(ProtocolFlags::NO_CONNECT | ProtocolFlags::NO_MAIL)
        );
    }
}
