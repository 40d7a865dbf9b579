use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::utils::SignalBlocker;

/// Wall-clock deadline for one run. Arming with a non-zero limit spawns a
/// thread that SIGKILLs the tracee on expiry; a zero limit leaves the timer
/// inert and it only measures runtime.
pub(crate) struct WallClockTimer {
  start: Instant,
  fired: Arc<AtomicBool>,
  cancel: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl WallClockTimer {
  pub fn arm(time_limit_us: u64, pid: Pid) -> Self {
    let start = Instant::now();
    let fired = Arc::new(AtomicBool::new(false));

    if time_limit_us == 0 {
      return WallClockTimer {
        start,
        fired,
        cancel: None,
        handle: None,
      };
    }

    let (cancel, expiry) = mpsc::channel::<()>();
    let thread_fired = Arc::clone(&fired);

    // The killer thread must not steal signals meant for the tracer; spawn
    // it with everything blocked and restore the mask afterwards.
    let _mask = SignalBlocker::new();
    let handle = std::thread::spawn(move || {
      if let Err(RecvTimeoutError::Timeout) =
        expiry.recv_timeout(Duration::from_micros(time_limit_us))
      {
        thread_fired.store(true, Ordering::SeqCst);
        info!("Tracee #{}. hit the wall-clock deadline", pid);
        let _ = signal::kill(pid, Signal::SIGKILL);
      }
    });

    debug!("Armed {} us deadline for tracee #{}.", time_limit_us, pid);

    WallClockTimer {
      start,
      fired,
      cancel: Some(cancel),
      handle: Some(handle),
    }
  }

  /// Stop the timer; called exactly once, at the first point the tracee is
  /// observed terminated. Returns the runtime in microseconds and whether
  /// the deadline fired.
  pub fn stop(mut self) -> (u64, bool) {
    self.disarm();
    let runtime = self.start.elapsed().as_micros() as u64;
    (runtime, self.fired.load(Ordering::SeqCst))
  }

  fn disarm(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      let _ = cancel.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for WallClockTimer {
  fn drop(&mut self) {
    // Reached without stop() only when the run fails; the join keeps a
    // pending SIGKILL from hitting a recycled pid.
    self.disarm();
  }
}
