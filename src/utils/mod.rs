use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::Record;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

pub use pipe::{ErrorPipe, ErrorReceiver, ErrorSender};

pub mod pipe;

pub type TimeLimitType = u64;

pub type MemoryLimitType = u64;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Tracee #1234. architecture: X86_64```
#[allow(unused)]
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string(string: &str) -> CString {
  CString::new(string).expect("Convert &str to CString should work")
}

/// Blocks all signals on the current thread until dropped
pub(crate) struct SignalBlocker {
  old_mask: SigSet,
}

impl SignalBlocker {
  pub fn new() -> Self {
    let mut old_mask = SigSet::empty();
    let _ = pthread_sigmask(
      SigmaskHow::SIG_SETMASK,
      Some(&SigSet::all()),
      Some(&mut old_mask),
    );
    SignalBlocker { old_mask }
  }
}

impl Drop for SignalBlocker {
  fn drop(&mut self) {
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None);
  }
}
