//! Child-to-parent bootstrap error relay. One message per run, packed as
//! `errno:u32 (LE) || context bytes || 0x00`; the pipe is close-on-exec so
//! a successful execvp leaves it empty.

use std::os::unix::prelude::RawFd;

use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::SandboxError;

const MESSAGE_MAX: usize = 512;

pub struct ErrorPipe {
  read: RawFd,
  write: RawFd,
  /// Once split, the halves own their fds and the pair must not close them
  split: bool,
}

pub struct ErrorReceiver(RawFd);

pub struct ErrorSender(RawFd);

impl ErrorPipe {
  pub fn new() -> Result<Self, SandboxError> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
      .map_err(|errno| SandboxError::spawn(format!("pipe2 fails: {}", errno)))?;
    Ok(ErrorPipe {
      read,
      write,
      split: false,
    })
  }

  pub fn into_receiver(mut self) -> Result<ErrorReceiver, SandboxError> {
    self.split = true;
    if let Err(errno) = close(self.write) {
      let _ = close(self.read);
      return Err(errno.into());
    }
    Ok(ErrorReceiver(self.read))
  }

  pub fn into_sender(mut self) -> Result<ErrorSender, SandboxError> {
    self.split = true;
    if let Err(errno) = close(self.read) {
      let _ = close(self.write);
      return Err(errno.into());
    }
    Ok(ErrorSender(self.write))
  }
}

impl Drop for ErrorPipe {
  fn drop(&mut self) {
    // Reached unsplit only when fork() failed; both ends are still ours
    if !self.split {
      let _ = close(self.read);
      let _ = close(self.write);
    }
  }
}

impl ErrorReceiver {
  /// Drain at most one packed message; None when the child wrote nothing
  pub fn receive(&self) -> Option<String> {
    let mut buf = [0u8; MESSAGE_MAX];
    let size = unistd::read(self.0, &mut buf).ok()?;
    if size < 4 {
      return None;
    }

    let errno = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let payload = &buf[4..size];
    let terminator = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    let context = String::from_utf8_lossy(&payload[..terminator]);

    let mut message = format!("{}: {}", context, Errno::from_i32(errno as i32).desc());
    // Anything past the terminator is kept as a diagnostic suffix
    if terminator + 1 < payload.len() {
      message.push_str(" [");
      message.push_str(&String::from_utf8_lossy(&payload[terminator + 1..]));
      message.push(']');
    }
    Some(message)
  }
}

impl Drop for ErrorReceiver {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl ErrorSender {
  /// Write one packed message; runs in the child after fork, so it only
  /// touches the stack.
  pub fn send(&self, errno: Errno, context: &str) {
    let mut buf = [0u8; MESSAGE_MAX];
    let errno_bytes = (errno as u32).to_le_bytes();
    buf[..4].copy_from_slice(&errno_bytes);

    let context = context.as_bytes();
    let len = context.len().min(MESSAGE_MAX - 5);
    buf[4..4 + len].copy_from_slice(&context[..len]);
    buf[4 + len] = 0;

    let _ = unistd::write(self.0, &buf[..4 + len + 1]);
  }
}

impl Drop for ErrorSender {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}
