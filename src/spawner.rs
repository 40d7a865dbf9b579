//! fork() plus the child-side bootstrap: stream redirection, working
//! directory, address-space rlimit, the tracer hook and finally execvp.
//! Anything that fails before execvp is relayed through the error pipe and
//! the child exits with a sentinel code.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::prelude::RawFd;
use std::path::Path;

use log::info;
use nix::errno::Errno;
use nix::libc;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, close, dup2, execvp, fork, ForkResult, Pid};

use crate::context::SandboxOptions;
use crate::error::SandboxError;
use crate::utils::{into_c_string, ErrorPipe, ErrorReceiver, ErrorSender};

/// Exit code of a child whose bootstrap failed
const BOOTSTRAP_EXIT_CODE: i32 = 255;

/// Fork a child that boots into `exec` with `argv` under the caller's hook
/// (the sandbox passes PTRACE_TRACEME). Returns the child pid and the read
/// end of the bootstrap error pipe.
pub(crate) fn spawn<F>(
  exec: &str,
  argv: &[String],
  opts: &SandboxOptions,
  working_dir: &Path,
  child_hook: F,
) -> Result<(Pid, ErrorReceiver), SandboxError>
where
  F: FnOnce() -> Result<(), Errno>,
{
  // Everything the child needs is allocated before fork(); the child only
  // runs async-signal-safe code afterwards.
  let program = into_c_string(exec);
  let args: Vec<CString> = if argv.is_empty() {
    vec![program.clone()]
  } else {
    argv.iter().map(|a| into_c_string(a)).collect()
  };

  let pipe = ErrorPipe::new()?;

  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => {
      info!("Spawned tracee #{}. for {}", child, exec);
      Ok((child, pipe.into_receiver()?))
    }
    Ok(ForkResult::Child) => {
      let sender = match pipe.into_sender() {
        Ok(sender) => sender,
        Err(_) => unsafe { libc::_exit(BOOTSTRAP_EXIT_CODE) },
      };
      run_child(&program, &args, opts, working_dir, child_hook, &sender)
    }
    Err(errno) => Err(SandboxError::spawn(format!("fork fails: {}", errno))),
  }
}

fn run_child<F>(
  program: &CString,
  args: &[CString],
  opts: &SandboxOptions,
  working_dir: &Path,
  child_hook: F,
  sender: &ErrorSender,
) -> !
where
  F: FnOnce() -> Result<(), Errno>,
{
  match child_setup(program, args, opts, working_dir, child_hook) {
    Ok(never) => match never {},
    Err((errno, context)) => {
      sender.send(errno, context);
      unsafe { libc::_exit(BOOTSTRAP_EXIT_CODE) }
    }
  }
}

fn child_setup<F>(
  program: &CString,
  args: &[CString],
  opts: &SandboxOptions,
  working_dir: &Path,
  child_hook: F,
) -> Result<Infallible, (Errno, &'static str)>
where
  F: FnOnce() -> Result<(), Errno>,
{
  let [stdin_fd, stdout_fd, stderr_fd] = opts.stdio_fds();
  redirect_stream(stdin_fd, libc::STDIN_FILENO).map_err(|errno| (errno, "dup2(stdin)"))?;
  redirect_stream(stdout_fd, libc::STDOUT_FILENO).map_err(|errno| (errno, "dup2(stdout)"))?;
  redirect_stream(stderr_fd, libc::STDERR_FILENO).map_err(|errno| (errno, "dup2(stderr)"))?;

  chdir(working_dir).map_err(|errno| (errno, "chdir()"))?;

  let memory_limit = opts.memory_limit_bytes();
  if memory_limit > 0 {
    setrlimit(Resource::RLIMIT_AS, memory_limit, memory_limit)
      .map_err(|errno| (errno, "setrlimit(RLIMIT_AS)"))?;
  }

  child_hook().map_err(|errno| (errno, "ptrace(PTRACE_TRACEME)"))?;

  match execvp(program, args) {
    Ok(never) => match never {},
    Err(errno) => Err((errno, "execvp()")),
  }
}

/// Replace `target` with `fd`; a negative fd closes the stream instead
fn redirect_stream(fd: RawFd, target: RawFd) -> Result<(), Errno> {
  if fd < 0 {
    close(target)
  } else if fd != target {
    dup2(fd, target).map(|_| ())
  } else {
    Ok(())
  }
}
