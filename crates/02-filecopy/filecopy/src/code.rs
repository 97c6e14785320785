//! Numeric result codes carried in [`ResultHeader`](crate::ResultHeader).

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    UnexpectedEof = 1,
    NameTooLong = 2,
    LinkTargetTooLong = 3,
    UnsupportedFileType = 4,
    Filesystem = 5,
    ByteQuotaExceeded = 6,
    FileQuotaExceeded = 7,
    InvalidPath = 8,
    Sandbox = 9,
    Internal = 10,
    /// Stream ended exactly where the next header would start.
    LegalEof = 31_415_926,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::UnexpectedEof,
            2 => Self::NameTooLong,
            3 => Self::LinkTargetTooLong,
            4 => Self::UnsupportedFileType,
            5 => Self::Filesystem,
            6 => Self::ByteQuotaExceeded,
            7 => Self::FileQuotaExceeded,
            8 => Self::InvalidPath,
            9 => Self::Sandbox,
            10 => Self::Internal,
            31_415_926 => Self::LegalEof,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Process exit status for this code.
    pub fn exit_status(self) -> u8 {
        u8::try_from(self.as_u32()).unwrap_or(u8::MAX)
    }

    /// Message shown to the user on the sending side.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Ok => "transfer completed",
            Self::UnexpectedEof => "stream ended unexpectedly",
            Self::NameTooLong => "file name too long",
            Self::LinkTargetTooLong => "symlink target too long",
            Self::UnsupportedFileType => "unsupported file type",
            Self::Filesystem => "destination storage failure",
            Self::ByteQuotaExceeded => "destination refused: too much data",
            Self::FileQuotaExceeded => "destination refused: too many files",
            Self::InvalidPath => "unsafe file name",
            Self::Sandbox => "receiver could not confine itself",
            Self::Internal => "receiver aborted",
            Self::LegalEof => "sender stopped before the end of the stream",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.as_u32())
    }
}

/// Maps a raw code from the wire, including ones this side does not know.
pub fn describe_code(code: u32) -> String {
    match ErrorCode::from_u32(code) {
        Some(known) => known.to_string(),
        None => format!("unknown error ({code})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u32() {
        for raw in (0..=10).chain([31_415_926]) {
            let code = ErrorCode::from_u32(raw).unwrap();
            assert_eq!(code.as_u32(), raw);
        }
        assert_eq!(ErrorCode::from_u32(11), None);
    }

    #[test]
    fn exit_status_is_clamped() {
        assert_eq!(ErrorCode::Ok.exit_status(), 0);
        assert_eq!(ErrorCode::ByteQuotaExceeded.exit_status(), 6);
        assert_eq!(ErrorCode::LegalEof.exit_status(), 255);
    }

    #[test]
    fn unknown_codes_are_still_described() {
        assert_eq!(describe_code(6), "destination refused: too much data (6)");
        assert_eq!(describe_code(77), "unknown error (77)");
    }
}
