use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDERR_FILENO, unistd::isatty};

pub enum SandboxError {
  /// pipe() or fork() failed before the child became observable
  Spawn(String),
  /// A ptrace or /proc operation failed while the tracee was controllable
  Internal { context: String, errno: Errno },
  /// The tracee ELF carries an EI_CLASS this sandbox does not support
  UnsupportedArchitecture(u8),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
}

#[allow(unused)]
pub enum SandboxExit {
  Ok,
  Err(SandboxError),
}

impl SandboxError {
  pub fn spawn<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Spawn(msg.into())
  }

  pub fn internal<MS: Into<String>>(context: MS, errno: Errno) -> SandboxError {
    SandboxError::Internal {
      context: context.into(),
      errno,
    }
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Cli(msg.into())
  }

  /// Stable tag for reports and log grepping
  pub fn kind(&self) -> &'static str {
    match self {
      SandboxError::Spawn(_) => "spawn",
      SandboxError::Internal { .. } => "internal",
      SandboxError::UnsupportedArchitecture(_) => "architecture",
      SandboxError::Nix(_) => "nix",
      SandboxError::Fs(_) => "filesystem",
      SandboxError::Cli(_) => "cli",
      SandboxError::Logger(_) => "logger",
    }
  }

  /// The OS errno behind this error, when there is one
  pub fn errno(&self) -> Option<Errno> {
    match self {
      SandboxError::Internal { errno, .. } => Some(*errno),
      SandboxError::Nix(errno) => Some(*errno),
      _ => None,
    }
  }
}

impl Debug for SandboxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for SandboxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      SandboxError::Spawn(msg) => f.write_fmt(format_args!("{}", msg)),
      SandboxError::Internal { context, errno } => {
        f.write_fmt(format_args!("{}: {}", context, errno.desc()))
      }
      SandboxError::UnsupportedArchitecture(class) => {
        f.write_fmt(format_args!("unsupported ELF class {}", class))
      }
      SandboxError::Nix(errno) => f.write_fmt(format_args!("{}", errno.desc())),
      SandboxError::Fs(msg) => f.write_fmt(format_args!("{}", msg)),
      SandboxError::Cli(msg) => f.write_fmt(format_args!("{}", msg)),
      SandboxError::Logger(err) => f.write_fmt(format_args!("{}", err)),
    }
  }
}

impl From<Errno> for SandboxError {
  fn from(errno: Errno) -> Self {
    SandboxError::Nix(errno)
  }
}

impl From<std::io::Error> for SandboxError {
  fn from(err: std::io::Error) -> Self {
    SandboxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for SandboxError {
  fn from(err: FlexiLoggerError) -> Self {
    SandboxError::Logger(err)
  }
}

impl Error for SandboxError {}

impl Termination for SandboxExit {
  fn report(self) -> ExitCode {
    let err = match self {
      SandboxExit::Ok => return ExitCode::SUCCESS,
      SandboxExit::Err(err) => err,
    };

    let is_tty = isatty(STDERR_FILENO).unwrap_or(false);
    if is_tty {
      match err.errno() {
        Some(errno) => eprintln!(
          "\x1b[1;31mptbox: {} error\x1b[0m: {} (errno {})",
          err.kind(),
          err,
          errno as i32
        ),
        None => eprintln!("\x1b[1;31mptbox: {} error\x1b[0m: {}", err.kind(), err),
      }
    } else {
      // Machine consumers get the same shape as ExitStat::report_json
      let errno = err
        .errno()
        .map_or("null".to_string(), |errno| (errno as i32).to_string());
      eprintln!("{{");
      eprintln!("  \"ok\": false,");
      eprintln!("  \"kind\": \"{}\",", err.kind());
      eprintln!("  \"errno\": {},", errno);
      eprintln!("  \"message\": {:?}", err.to_string());
      eprintln!("}}");
    }
    ExitCode::FAILURE
  }
}
