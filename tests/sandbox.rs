use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;
use nix::sys::signal::Signal;
use tempfile::tempdir;

use ptbox::{run, AllowAllPolicy, DefaultPolicy, ExitStat, SandboxOptions, SyscallPolicy};

mod common;

/// Build a freestanding fixture so the tracee's syscall sequence is exact
fn compile_fixture(dir: &Path, name: &str) -> String {
  let source = format!("./fixtures/{}.c", name);
  let executable = dir.join(name);

  let output = Command::new("gcc")
    .args(["-static", "-nostdlib", "-nostartfiles", "-fno-stack-protector", "-o"])
    .arg(&executable)
    .arg(&source)
    .output()
    .expect("Compile should be ok");
  assert!(
    output.status.success(),
    "Compiling {} fails: {}",
    name,
    String::from_utf8_lossy(&output.stderr)
  );

  executable.to_string_lossy().to_string()
}

fn run_fixture<P: SyscallPolicy>(
  name: &str,
  opts: &SandboxOptions,
  policy: &mut P,
) -> ExitStat {
  let dir = tempdir().unwrap();
  let dir = dir.into_path();

  let executable = compile_fixture(&dir, name);
  info!("Start running fixture {}", name);
  let result = run(
    &executable,
    &[executable.clone()],
    opts,
    Path::new("."),
    policy,
  )
  .unwrap();
  info!("Fixture {} finished: {:?}", name, result);

  fs::remove_dir_all(dir).unwrap();
  result
}

#[test]
fn it_should_run_hello() {
  common::setup();
  let dir = tempdir().unwrap();
  let out_path: PathBuf = dir.path().join("hello.out");
  let out_file = fs::File::create(&out_path).unwrap();

  let mut opts = SandboxOptions::new();
  opts
    .time_limit(1_000_000)
    .memory_limit(64 * 1024 * 1024)
    .stdin_fd(-1)
    .stdout_fd(out_file.as_raw_fd());

  let mut policy = DefaultPolicy::new();
  let result = run_fixture("hello", &opts, &mut policy);

  assert_eq!(result.exit_code(), Some(0));
  assert_eq!(result.message(), "");
  assert!(result.runtime_us() < 1_000_000);
  assert!(result.vm_peak_bytes() > 0);

  drop(out_file);
  assert_eq!(fs::read_to_string(&out_path).unwrap(), "hi\n");
}

#[test]
fn it_should_report_immediate_exit_without_memory_peak() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("exitzero", &SandboxOptions::new(), &mut policy);

  assert_eq!(result.exit_code(), Some(0));
  assert_eq!(result.message(), "");
  assert_eq!(result.vm_peak_bytes(), 0);
}

#[test]
fn it_should_kill_forbidden_socket() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("socket", &SandboxOptions::new(), &mut policy);

  assert_eq!(result.term_signal(), Some(Signal::SIGKILL));
  assert!(
    result.message().starts_with("forbidden syscall 41"),
    "unexpected message: {}",
    result.message()
  );
}

#[test]
fn it_should_run_deterministically() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let first = run_fixture("socket", &SandboxOptions::new(), &mut policy);

  let mut policy = DefaultPolicy::new();
  let second = run_fixture("socket", &SandboxOptions::new(), &mut policy);

  assert_eq!(first.code(), second.code());
  assert_eq!(first.message(), second.message());
}

#[test]
fn it_should_neutralize_denied_open() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("openpasswd", &SandboxOptions::new(), &mut policy);

  // The path pointer was rewritten to NULL, the tracee saw EFAULT
  assert_eq!(result.exit_code(), Some(20));
  assert_eq!(result.message(), "");
}

#[test]
fn it_should_pass_allow_listed_open() {
  common::setup();
  let mut policy = DefaultPolicy::with_allowed_files(vec!["/etc/passwd".to_string()]);
  let result = run_fixture("openpasswd", &SandboxOptions::new(), &mut policy);

  assert_eq!(result.exit_code(), Some(10));
}

#[test]
fn it_should_neutralize_lseek_on_stdin() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("seekstdin", &SandboxOptions::new(), &mut policy);

  // The fd argument was rewritten to -1, the tracee saw EBADF
  assert_eq!(result.exit_code(), Some(20));
}

#[test]
fn it_should_allow_self_tgkill() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("tgkill", &SandboxOptions::new(), &mut policy);

  assert_eq!(result.exit_code(), Some(0));
}

#[test]
fn it_should_deny_second_execve() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run_fixture("doubleexec", &SandboxOptions::new(), &mut policy);

  assert_eq!(result.term_signal(), Some(Signal::SIGKILL));
  assert!(
    result.message().starts_with("forbidden syscall 59"),
    "unexpected message: {}",
    result.message()
  );
}

#[test]
fn it_should_stop_on_deadline() {
  common::setup();
  let mut opts = SandboxOptions::new();
  opts.time_limit(100_000);

  let mut policy = DefaultPolicy::new();
  let result = run_fixture("spin", &opts, &mut policy);

  assert_eq!(result.term_signal(), Some(Signal::SIGKILL));
  assert_eq!(result.message(), "Time limit exceeded");
  assert!(result.runtime_us() >= 100_000);
  assert!(result.runtime_us() < 5_000_000);
}

#[test]
fn it_should_fail_mmap_over_the_memory_limit() {
  common::setup();
  let memory_limit = 16 * 1024 * 1024;
  let mut opts = SandboxOptions::new();
  opts.memory_limit(memory_limit);

  let mut policy = DefaultPolicy::new();
  let result = run_fixture("bigmmap", &opts, &mut policy);

  // The tracee saw MAP_FAILED and exited cleanly
  assert_eq!(result.exit_code(), Some(0));
  assert!(result.vm_peak_bytes() > 0);
  assert!(result.vm_peak_bytes() <= memory_limit + 4096);
}

#[test]
fn it_should_relay_bootstrap_errors() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  let result = run(
    "/nonexistent/ptbox-binary",
    &["/nonexistent/ptbox-binary".to_string()],
    &SandboxOptions::new(),
    Path::new("."),
    &mut policy,
  )
  .unwrap();

  assert_eq!(result.exit_code(), Some(255));
  assert_eq!(result.runtime_us(), 0);
  assert!(
    result.message().contains("execvp"),
    "unexpected message: {}",
    result.message()
  );
}

#[test]
fn it_should_run_dynamic_binaries_with_allow_all() {
  common::setup();
  let mut policy = AllowAllPolicy::new();
  let result = run(
    "/bin/true",
    &["/bin/true".to_string()],
    &SandboxOptions::new(),
    Path::new("."),
    &mut policy,
  )
  .unwrap();

  assert_eq!(result.exit_code(), Some(0));
  assert_eq!(result.message(), "");
}
