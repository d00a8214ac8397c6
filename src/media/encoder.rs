//! Encoder process launching and exit status interpretation
//!
//! The media pipeline runs out of process. The server only hands it its
//! arguments and watches how it exits.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::error::MediaError;

pub const EXIT_NOT_ENOUGH_ARGUMENTS: i32 = 91;
pub const EXIT_INVALID_ARGUMENT: i32 = 92;
pub const EXIT_UNKNOWN_CODEC: i32 = 93;
pub const EXIT_CAPTURE_HARDWARE: i32 = 94;
pub const EXIT_GRACEFUL_EOS: i32 = 95;
pub const EXIT_ENCODER_ERROR: i32 = 96;

/// How an encoder run ended
pub fn interpret_exit(code: Option<i32>) -> Result<(), MediaError> {
    match code {
        Some(0) | Some(EXIT_GRACEFUL_EOS) => Ok(()),
        Some(EXIT_CAPTURE_HARDWARE) => Err(MediaError::CaptureHardware),
        Some(EXIT_ENCODER_ERROR) => Err(MediaError::Encoder),
        Some(EXIT_NOT_ENOUGH_ARGUMENTS | EXIT_INVALID_ARGUMENT | EXIT_UNKNOWN_CODEC) => {
            Err(MediaError::BadArguments)
        }
        other => Err(MediaError::Unknown(other)),
    }
}

pub fn exit_status_to_result(status: ExitStatus) -> Result<(), MediaError> {
    // No code means the process died from a signal
    interpret_exit(status.code())
}

/// Starts encoder processes
///
/// Implemented by the real process spawner and by test doubles.
pub trait EncoderLauncher: Send + 'static {
    fn launch(&mut self, args: &[String]) -> io::Result<Child>;
}

/// Spawns a configured executable with the negotiated arguments
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl EncoderLauncher for ProcessLauncher {
    fn launch(&mut self, args: &[String]) -> io::Result<Child> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(interpret_exit(Some(0)), Ok(()));
        assert_eq!(interpret_exit(Some(95)), Ok(()));
        assert_eq!(interpret_exit(Some(94)), Err(MediaError::CaptureHardware));
        assert_eq!(interpret_exit(Some(96)), Err(MediaError::Encoder));
        for code in [91, 92, 93] {
            assert_eq!(interpret_exit(Some(code)), Err(MediaError::BadArguments));
        }
        assert_eq!(interpret_exit(Some(1)), Err(MediaError::Unknown(Some(1))));
        assert_eq!(interpret_exit(None), Err(MediaError::Unknown(None)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_reports_exit() {
        let mut launcher = ProcessLauncher::new("sh");
        let mut child = launcher
            .launch(&["-c".to_string(), "exit 94".to_string()])
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_status_to_result(status), Err(MediaError::CaptureHardware));
    }
}
