//! Receives a file stream on stdin into a confined destination directory and
//! answers on stdout.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use filecopy::{unpack_session, ErrorCode, Limits, Sandbox, StatusReporter};
use filecopy_tools::init_tracing;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Unpack an untrusted file stream inside a sandbox")]
struct Args {
    /// User to unpack as (name or numeric uid)
    user: String,

    /// Destination directory, created if missing
    dest: PathBuf,

    /// Byte quota over all regular files (0 = unlimited)
    #[arg(long, env = "UPDATES_MAX_BYTES", default_value_t = 0)]
    max_bytes: u64,

    /// Quota on the number of entries (0 = unlimited)
    #[arg(long, env = "UPDATES_MAX_FILES", default_value_t = 0)]
    max_files: u64,
}

impl Args {
    fn limits(&self) -> Limits {
        Limits {
            max_bytes: self.max_bytes,
            max_files: self.max_files,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();

    // Answers on every path out of main, including panics and bad arguments.
    let mut status = StatusReporter::new(io::stdout());

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Usage and help go to stderr: stdout carries only the response.
            eprint!("{}", err.render());
            return exit(status);
        }
    };
    let limits = args.limits();

    let confined = match Sandbox::new(args.user, args.dest).enter() {
        Ok(confined) => confined,
        Err(err) => {
            error!("{:#}", anyhow::Error::new(err));
            status.record(ErrorCode::Sandbox, 0);
            return exit(status);
        }
    };

    match unpack_session(io::stdin().lock(), status, confined.root(), limits) {
        Ok(code) => ExitCode::from(code.exit_status()),
        Err(err) => {
            error!("failed to write response: {err}");
            ExitCode::from(ErrorCode::Internal.exit_status())
        }
    }
}

fn exit(status: StatusReporter<io::Stdout>) -> ExitCode {
    let code = status.code();
    if let Err(err) = status.finish() {
        error!("failed to write response: {err}");
    }
    ExitCode::from(code.exit_status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotas_come_from_flags_or_environment() {
        std::env::set_var("UPDATES_MAX_BYTES", "4096");
        std::env::set_var("UPDATES_MAX_FILES", "12");
        let from_env = Args::try_parse_from(["filecopy-unpack", "nobody", "/incoming"]).unwrap();
        let from_flags = Args::try_parse_from([
            "filecopy-unpack",
            "--max-files",
            "3",
            "nobody",
            "/incoming",
        ])
        .unwrap();
        std::env::remove_var("UPDATES_MAX_BYTES");
        std::env::remove_var("UPDATES_MAX_FILES");

        assert_eq!(
            from_env.limits(),
            Limits {
                max_bytes: 4096,
                max_files: 12
            }
        );
        assert_eq!(from_flags.max_files, 3);
        assert_eq!(from_flags.max_bytes, 4096);
        assert_eq!(from_env.user, "nobody");
        assert_eq!(from_env.dest, PathBuf::from("/incoming"));
    }

    #[test]
    fn malformed_quota_is_an_argument_error() {
        let err = Args::try_parse_from([
            "filecopy-unpack",
            "--max-bytes",
            "lots",
            "nobody",
            "/incoming",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
