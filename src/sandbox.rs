use std::cmp::max;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{sysconf, Pid, SysconfVar};

use crate::context::{ExitStat, SandboxOptions};
use crate::error::SandboxError;
use crate::regs::orig_ax_offset;
use crate::spawner;
use crate::syscall::{syscall_name, Arch, SyscallPolicy};
use crate::timer::WallClockTimer;
use crate::utils::ErrorReceiver;

/// Run `exec` with `argv` under ptrace, stepping it through every syscall
/// boundary and letting `policy` decide at each entry and exit. The returned
/// verdict carries the raw wait status, the wall-clock runtime, the peak
/// address-space size and a diagnostic message.
///
/// `argv` is the complete argument vector of the tracee, its first element
/// being argv[0]; an empty `argv` falls back to `exec` alone.
pub fn run<P: SyscallPolicy>(
  exec: &str,
  argv: &[String],
  opts: &SandboxOptions,
  working_dir: &Path,
  policy: &mut P,
) -> Result<ExitStat, SandboxError> {
  let (child, pipe) = spawner::spawn(exec, argv, opts, working_dir, || ptrace::traceme())?;
  execute(child, opts, pipe, policy)
}

fn execute<P: SyscallPolicy>(
  child: Pid,
  opts: &SandboxOptions,
  pipe: ErrorReceiver,
  policy: &mut P,
) -> Result<ExitStat, SandboxError> {
  // Wait for the tracee to be ready. If it is already gone, the bootstrap
  // failed and the pipe explains why.
  let (raw, status) = wait_raw(child).map_err(|errno| SandboxError::internal("waitpid()", errno))?;
  if terminal(&status) {
    return Ok(ExitStat::new(raw, 0, 0, pipe.receive().unwrap_or_default()));
  }

  let mut tracee = Tracee::new(child, raw);

  set_trace_options(child)?;
  let arch = policy.detect_tracee_architecture(child)?;
  let mut statm = StatmSampler::open(child)?;

  let timer = WallClockTimer::arm(opts.time_limit_us(), child);
  let mut vm_peak_bytes: u64 = 0;

  loop {
    if !tracee.advance_to_syscall()? {
      return Ok(finalize(&tracee, timer, vm_peak_bytes, &pipe));
    }

    // Entry stop: the syscall number sits in the orig_*ax user-area slot
    let syscall = match ptrace::read_user(child, orig_ax_offset() as ptrace::AddressType) {
      Ok(number) => number as i64,
      Err(Errno::ESRCH) => {
        // Lost the race with the tracee's own death
        tracee.kill_and_reap();
        return Ok(finalize(&tracee, timer, vm_peak_bytes, &pipe));
      }
      Err(errno) => return Err(SandboxError::internal("ptrace(PTRACE_PEEKUSER)", errno)),
    };

    match policy.is_syscall_entry_allowed(child, syscall) {
      Ok(true) => {}
      Ok(false) => return Ok(deny(&mut tracee, timer, vm_peak_bytes, policy, arch, syscall)),
      Err(Errno::ESRCH) => {
        tracee.kill_and_reap();
        return Ok(finalize(&tracee, timer, vm_peak_bytes, &pipe));
      }
      Err(errno) => return Err(SandboxError::internal("syscall entry check", errno)),
    }

    if !tracee.advance_to_syscall()? {
      return Ok(finalize(&tracee, timer, vm_peak_bytes, &pipe));
    }

    // Exit stop: sample the peak after any call that can grow the address
    // space returned
    if alters_address_space(arch, syscall) {
      let pages = statm.sample()?;
      vm_peak_bytes = max(vm_peak_bytes, pages * statm.page_size());
    }

    match policy.is_syscall_exit_allowed(child, syscall) {
      Ok(true) => {}
      Ok(false) => return Ok(deny(&mut tracee, timer, vm_peak_bytes, policy, arch, syscall)),
      Err(Errno::ESRCH) => {
        tracee.kill_and_reap();
        return Ok(finalize(&tracee, timer, vm_peak_bytes, &pipe));
      }
      Err(errno) => return Err(SandboxError::internal("syscall exit check", errno)),
    }
  }
}

/// The tracee as an owned resource: whatever path leaves execute(), the
/// process is killed and reaped before control returns to the caller.
struct Tracee {
  pid: Pid,
  raw_status: i32,
  reaped: bool,
}

impl Tracee {
  fn new(pid: Pid, raw_status: i32) -> Self {
    Tracee {
      pid,
      raw_status,
      reaped: false,
    }
  }

  /// Resume the tracee up to its next syscall boundary. Returns true at a
  /// syscall stop, false once the tracee has terminated (already reaped).
  fn advance_to_syscall(&mut self) -> Result<bool, SandboxError> {
    loop {
      // A failure here only means the tracee has just died; the following
      // waitpid reports it
      let _ = ptrace::syscall(self.pid, None::<Signal>);

      let (raw, status) =
        wait_raw(self.pid).map_err(|errno| SandboxError::internal("waitpid()", errno))?;
      self.raw_status = raw;

      match status {
        WaitStatus::PtraceSyscall(_) => return Ok(true),
        // Tracing artifacts, swallowed
        WaitStatus::Stopped(_, Signal::SIGSTOP | Signal::SIGTRAP | Signal::SIGCONT) => {}
        WaitStatus::Stopped(_, signal) => {
          debug!("Tracee #{}. stopped by {}, delivering", self.pid, signal);
          let _ = ptrace::cont(self.pid, signal);
        }
        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
          self.reaped = true;
          return Ok(false);
        }
        _ => {}
      }
    }
  }

  fn kill_and_reap(&mut self) {
    if self.reaped {
      return;
    }
    let _ = signal::kill(self.pid, Signal::SIGKILL);
    loop {
      match wait_raw(self.pid) {
        Ok((raw, status)) => {
          self.raw_status = raw;
          if terminal(&status) {
            break;
          }
        }
        Err(_) => break,
      }
    }
    self.reaped = true;
  }
}

impl Drop for Tracee {
  fn drop(&mut self) {
    self.kill_and_reap();
  }
}

fn terminal(status: &WaitStatus) -> bool {
  matches!(
    status,
    WaitStatus::Exited(..) | WaitStatus::Signaled(..)
  )
}

/// waitpid keeping the raw wait status for the verdict
fn wait_raw(pid: Pid) -> Result<(i32, WaitStatus), Errno> {
  loop {
    let mut raw: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid.as_raw(), &mut raw as *mut libc::c_int, 0) };
    if rc == -1 {
      let errno = Errno::last();
      if errno == Errno::EINTR {
        continue;
      }
      return Err(errno);
    }
    return Ok((raw, WaitStatus::from_raw(pid, raw)?));
  }
}

fn set_trace_options(pid: Pid) -> Result<(), SandboxError> {
  let wanted = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL;
  if ptrace::setoptions(pid, wanted).is_ok() {
    return Ok(());
  }
  // Kernels older than 3.8 lack EXITKILL
  ptrace::setoptions(pid, Options::PTRACE_O_TRACESYSGOOD)
    .map_err(|errno| SandboxError::internal("ptrace(PTRACE_SETOPTIONS)", errno))
}

fn alters_address_space(arch: Arch, syscall: i64) -> bool {
  match arch {
    Arch::I386 => matches!(
      syscall,
      45  // brk
      | 90  // mmap
      | 163 // mremap
      | 192 // mmap2
    ),
    Arch::X86_64 => {
      matches!(syscall, libc::SYS_mmap | libc::SYS_brk | libc::SYS_mremap)
    }
  }
}

/// The tracee terminated on its own (or through the deadline); build the
/// verdict from its wait status.
fn finalize(
  tracee: &Tracee,
  timer: WallClockTimer,
  vm_peak_bytes: u64,
  pipe: &ErrorReceiver,
) -> ExitStat {
  let (runtime_us, deadline_fired) = timer.stop();
  let raw = tracee.raw_status;

  let message = if raw == 0 {
    String::new()
  } else if deadline_fired && libc::WIFSIGNALED(raw) && libc::WTERMSIG(raw) == libc::SIGKILL {
    "Time limit exceeded".to_string()
  } else {
    pipe.receive().unwrap_or_default()
  };

  info!(
    "Tracee #{}. finished: status {:#x}, {} us, vm peak {} bytes",
    tracee.pid, raw, runtime_us, vm_peak_bytes
  );
  ExitStat::new(raw, runtime_us, vm_peak_bytes, message)
}

/// The policy refused a syscall; kill the tracee and explain in the verdict
fn deny<P: SyscallPolicy>(
  tracee: &mut Tracee,
  timer: WallClockTimer,
  vm_peak_bytes: u64,
  policy: &P,
  arch: Arch,
  syscall: i64,
) -> ExitStat {
  let (runtime_us, _) = timer.stop();
  tracee.kill_and_reap();

  let message = policy.error_message().unwrap_or_else(|| {
    let name = syscall_name(arch, syscall);
    if name.is_empty() {
      format!("forbidden syscall {}", syscall)
    } else {
      format!("forbidden syscall {}: {}()", syscall, name)
    }
  });

  info!("Tracee #{}. denied: {}", tracee.pid, message);
  ExitStat::new(tracee.raw_status, runtime_us, vm_peak_bytes, message)
}

/// Peak sampler over /proc/pid/statm, opened once per run
struct StatmSampler {
  file: File,
  page_size: u64,
}

impl StatmSampler {
  fn open(pid: Pid) -> Result<Self, SandboxError> {
    let file = File::open(format!("/proc/{}/statm", pid))?;
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
      .ok()
      .flatten()
      .map(|v| v as u64)
      .unwrap_or(4096);
    Ok(StatmSampler { file, page_size })
  }

  /// Current total address space of the tracee, in pages
  fn sample(&mut self) -> Result<u64, SandboxError> {
    self
      .file
      .seek(SeekFrom::Start(0))
      .map_err(|_| SandboxError::internal("lseek(/proc/pid/statm)", Errno::EIO))?;

    let mut buf = [0u8; 32];
    let size = self
      .file
      .read(&mut buf)
      .map_err(|_| SandboxError::internal("read(/proc/pid/statm)", Errno::EIO))?;
    if size == 0 {
      return Err(SandboxError::internal("read(/proc/pid/statm)", Errno::EIO));
    }

    let mut pages: u64 = 0;
    for byte in &buf[..size] {
      if !byte.is_ascii_digit() {
        break;
      }
      pages = pages * 10 + (byte - b'0') as u64;
    }
    Ok(pages)
  }

  fn page_size(&self) -> u64 {
    self.page_size
  }
}
