//! The receiver's final response, written exactly once on every exit path.

use std::io::{self, Write};

use tracing::{debug, warn};

use crate::code::ErrorCode;
use crate::wire::ResultHeader;

/// Owns the response stream and the pending outcome.
///
/// The outcome starts as [`ErrorCode::Internal`], so a receiver that bails
/// out (or panics) before recording anything still reports a failure.
pub struct StatusReporter<W: Write> {
    out: Option<W>,
    code: ErrorCode,
    crc: u32,
}

impl<W: Write> StatusReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Some(out),
            code: ErrorCode::Internal,
            crc: 0,
        }
    }

    pub fn record(&mut self, code: ErrorCode, crc: u32) {
        self.code = code;
        self.crc = crc;
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Writes the recorded outcome and returns the stream.
    pub fn finish(mut self) -> io::Result<W> {
        let mut out = match self.out.take() {
            Some(out) => out,
            None => return Err(io::Error::other("status already written")),
        };
        write_status(&mut out, self.code, self.crc)?;
        Ok(out)
    }
}

impl<W: Write> Drop for StatusReporter<W> {
    fn drop(&mut self) {
        if let Some(mut out) = self.out.take() {
            if let Err(err) = write_status(&mut out, self.code, self.crc) {
                warn!("failed to write final status: {err}");
            }
        }
    }
}

fn write_status<W: Write>(out: &mut W, code: ErrorCode, crc: u32) -> io::Result<()> {
    debug!(%code, crc = format_args!("{crc:#010x}"), "writing final status");
    let header = ResultHeader {
        error_code: code.as_u32(),
        crc32: crc,
    };
    out.write_all(&header.to_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn decode(bytes: &[u8]) -> ResultHeader {
        ResultHeader::from_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn finish_writes_recorded_outcome_once() {
        let mut status = StatusReporter::new(Vec::new());
        status.record(ErrorCode::Ok, 0x1234);
        let out = status.finish().unwrap();
        assert_eq!(
            decode(&out),
            ResultHeader {
                error_code: 0,
                crc32: 0x1234
            }
        );
    }

    #[test]
    fn drop_reports_internal_when_nothing_recorded() {
        let sink = Shared::default();
        drop(StatusReporter::new(sink.clone()));
        assert_eq!(decode(&sink.0.lock()).error_code, ErrorCode::Internal.as_u32());
    }

    #[test]
    fn drop_reports_last_record_on_early_return() {
        fn session(sink: Shared, fail: bool) -> Result<(), ErrorCode> {
            let mut status = StatusReporter::new(sink);
            status.record(ErrorCode::FileQuotaExceeded, 99);
            if fail {
                return Err(ErrorCode::FileQuotaExceeded);
            }
            status.record(ErrorCode::Ok, 0);
            Ok(())
        }

        let sink = Shared::default();
        assert!(session(sink.clone(), true).is_err());
        let bytes = sink.0.lock().clone();
        assert_eq!(bytes.len(), ResultHeader::SIZE);
        assert_eq!(
            decode(&bytes),
            ResultHeader {
                error_code: 7,
                crc32: 99
            }
        );
    }

    #[test]
    fn panics_still_produce_a_status() {
        let sink = Shared::default();
        let inner = sink.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _status = StatusReporter::new(inner);
            panic!("decoder blew up");
        }));
        assert!(result.is_err());
        assert_eq!(decode(&sink.0.lock()).error_code, ErrorCode::Internal.as_u32());
    }
}
