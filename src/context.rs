use std::os::unix::prelude::RawFd;

use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::Signal;
use nix::unistd::isatty;

use crate::utils::{MemoryLimitType, TimeLimitType};

/// Sandbox running options that configure the spawned tracee
#[derive(Debug, Clone)]
pub struct SandboxOptions {
  /// Inherited by the tracee as fd 0; negative closes stdin
  stdin_fd: RawFd,
  /// Inherited by the tracee as fd 1; negative closes stdout
  stdout_fd: RawFd,
  /// Inherited by the tracee as fd 2; negative closes stderr
  stderr_fd: RawFd,
  /// Wall-clock limit in microseconds, 0 disables the deadline
  time_limit: TimeLimitType,
  /// Address space limit in bytes, 0 disables the rlimit
  memory_limit: MemoryLimitType,
}

impl SandboxOptions {
  pub fn new() -> Self {
    SandboxOptions {
      stdin_fd: STDIN_FILENO,
      stdout_fd: STDOUT_FILENO,
      stderr_fd: STDERR_FILENO,
      time_limit: 0,
      memory_limit: 0,
    }
  }

  pub fn stdin_fd(&mut self, fd: RawFd) -> &mut Self {
    self.stdin_fd = fd;
    self
  }

  pub fn stdout_fd(&mut self, fd: RawFd) -> &mut Self {
    self.stdout_fd = fd;
    self
  }

  pub fn stderr_fd(&mut self, fd: RawFd) -> &mut Self {
    self.stderr_fd = fd;
    self
  }

  /// Set wall-clock limit (unit: us)
  pub fn time_limit(&mut self, value: TimeLimitType) -> &mut Self {
    self.time_limit = value;
    self
  }

  /// Set address space limit (unit: bytes)
  pub fn memory_limit(&mut self, value: MemoryLimitType) -> &mut Self {
    self.memory_limit = value;
    self
  }

  pub(crate) fn stdio_fds(&self) -> [RawFd; 3] {
    [self.stdin_fd, self.stdout_fd, self.stderr_fd]
  }

  pub fn time_limit_us(&self) -> TimeLimitType {
    self.time_limit
  }

  pub fn memory_limit_bytes(&self) -> MemoryLimitType {
    self.memory_limit
  }
}

impl Default for SandboxOptions {
  fn default() -> Self {
    Self::new()
  }
}

/// The verdict of one sandboxed run
#[derive(Debug, Clone)]
pub struct ExitStat {
  /// Raw wait status, in the format specified in wait(2)
  code: i32,
  runtime_us: u64,
  vm_peak_bytes: u64,
  message: String,
}

impl ExitStat {
  pub(crate) fn new(code: i32, runtime_us: u64, vm_peak_bytes: u64, message: String) -> Self {
    ExitStat {
      code,
      runtime_us,
      vm_peak_bytes,
      message,
    }
  }

  pub fn code(&self) -> i32 {
    self.code
  }

  pub fn exited(&self) -> bool {
    libc::WIFEXITED(self.code)
  }

  pub fn exit_code(&self) -> Option<i32> {
    if self.exited() {
      Some(libc::WEXITSTATUS(self.code))
    } else {
      None
    }
  }

  pub fn signaled(&self) -> bool {
    libc::WIFSIGNALED(self.code)
  }

  pub fn term_signal(&self) -> Option<Signal> {
    if self.signaled() {
      Signal::try_from(libc::WTERMSIG(self.code)).ok()
    } else {
      None
    }
  }

  pub fn core_dumped(&self) -> bool {
    self.signaled() && libc::WCOREDUMP(self.code)
  }

  pub fn runtime_us(&self) -> u64 {
    self.runtime_us
  }

  pub fn vm_peak_bytes(&self) -> u64 {
    self.vm_peak_bytes
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  /// Report on a tty as colored text, otherwise as JSON
  pub fn report(&self) {
    let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
    if is_tty {
      self.report_human();
    } else {
      self.report_json();
    }
  }

  pub fn report_human(&self) {
    let status = self.exit_code().map_or_else(
      || "\x1b[91m×\x1b[39m".to_string(),
      |v| format!("\x1b[9{}m{}\x1b[39m", if v == 0 { 2 } else { 1 }, v),
    );
    let signal = self.term_signal().map_or_else(
      || "\x1b[92m✓\x1b[39m".to_string(),
      |v| format!("\x1b[91m{}\x1b[39m", v),
    );

    println!();
    println!("\x1b[1mStatus\x1b[22m   {}", status);
    println!("\x1b[1mSignal\x1b[22m   {}", signal);
    println!("\x1b[1mTime\x1b[22m     {} us", self.runtime_us);
    println!("\x1b[1mMemory\x1b[22m   {} bytes", self.vm_peak_bytes);
    if !self.message.is_empty() {
      println!("\x1b[1mMessage\x1b[22m  {}", self.message);
    }
    println!();
  }

  pub fn report_json(&self) {
    let status = self
      .exit_code()
      .map_or_else(|| "null".to_string(), |v| v.to_string());
    let signal = self
      .term_signal()
      .map_or_else(|| "null".to_string(), |v| format!("\"{}\"", v));

    println!("{{");
    println!("  \"ok\": true,");
    println!("  \"status\": {},", status);
    println!("  \"signal\": {},", signal);
    println!("  \"runtime_us\": {},", self.runtime_us);
    println!("  \"vm_peak_bytes\": {},", self.vm_peak_bytes);
    println!("  \"message\": {:?}", self.message);
    println!("}}");
  }
}
