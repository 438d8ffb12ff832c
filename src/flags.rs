use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        /// The header block is complete; no CONTINUATION frames follow.
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
        /// Exclusive flag, stream dependency and weight fields are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges the peer's SETTINGS; the payload must be empty.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends the header block.
        const END_HEADERS = 0x4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_dropped() {
        let flags = HeadersFlags::from_bits_truncate(0xff);
        assert_eq!(
            flags,
            HeadersFlags::END_STREAM
                | HeadersFlags::END_HEADERS
                | HeadersFlags::PADDED
                | HeadersFlags::PRIORITY
        );
        assert_eq!(PingFlags::from_bits_truncate(0x3), PingFlags::ACK);
    }
}
