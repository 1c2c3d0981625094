//! Binary front-end wire constants.
//!
//! Wire format: `[1-byte check][1-byte length n][n bytes encrypted address]`
//!
//! Rejections are plain ASCII numeric tokens written straight onto the
//! connection before it is closed. They are not HTTP responses.

/// First byte value reserved for an addressing scheme the gateway does not
/// implement. Connections that open with it are rejected.
pub const RESERVED_SENTINEL: u8 = 0x90;

/// Numeric rejection tokens sent to clients before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RejectCode {
    /// Could not read the first byte.
    FirstByte = 1101,
    /// First byte was [`RESERVED_SENTINEL`].
    ReservedSentinel = 1102,
    /// Could not read the length byte, or it was zero.
    Length = 1103,
    /// Fewer payload bytes than announced.
    ShortPayload = 1104,
    /// The encrypted address could not be decrypted.
    DecryptFailed = 1105,
    /// The backend dial ran out of time.
    DialTimeout = 4101,
    /// The backend dial failed for any other reason.
    DialFailed = 4102,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::FirstByte => "1101",
            RejectCode::ReservedSentinel => "1102",
            RejectCode::Length => "1103",
            RejectCode::ShortPayload => "1104",
            RejectCode::DecryptFailed => "1105",
            RejectCode::DialTimeout => "4101",
            RejectCode::DialFailed => "4102",
        }
    }

    /// Bytes written on the wire.
    pub fn token(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
