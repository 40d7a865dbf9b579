use nix::unistd::getpid;

use ptbox::{detect_architecture, syscall_name, Arch, DefaultPolicy, SyscallPolicy};

mod common;

#[test]
#[cfg(target_arch = "x86_64")]
fn it_should_detect_own_architecture() {
  common::setup();
  let arch = detect_architecture(getpid()).unwrap();
  assert_eq!(arch, Arch::X86_64);

  // Detection reads a static ELF header, so it is idempotent
  let again = detect_architecture(getpid()).unwrap();
  assert_eq!(arch, again);
}

#[test]
#[cfg(target_arch = "x86_64")]
fn it_should_allow_benign_syscalls() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  policy.detect_tracee_architecture(getpid()).unwrap();

  for nr in [0, 1, 9, 12, 39, 60, 231] {
    assert!(
      policy.is_syscall_entry_allowed(getpid(), nr).unwrap(),
      "syscall {} should be allowed",
      nr
    );
  }
}

#[test]
#[cfg(target_arch = "x86_64")]
fn it_should_deny_unknown_syscalls() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  policy.detect_tracee_architecture(getpid()).unwrap();

  // socket(2) and fork(2) are neither allowed nor limited
  assert!(!policy.is_syscall_entry_allowed(getpid(), 41).unwrap());
  assert!(!policy.is_syscall_entry_allowed(getpid(), 57).unwrap());
  assert!(policy.error_message().is_none());
}

#[test]
#[cfg(target_arch = "x86_64")]
fn it_should_limit_execve_credit() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  policy.detect_tracee_architecture(getpid()).unwrap();

  assert!(policy.is_syscall_entry_allowed(getpid(), 59).unwrap());
  assert!(!policy.is_syscall_entry_allowed(getpid(), 59).unwrap());
  // Once exhausted the credit stays exhausted
  assert!(!policy.is_syscall_entry_allowed(getpid(), 59).unwrap());
}

#[test]
#[cfg(target_arch = "x86_64")]
fn it_should_pass_syscall_exits() {
  common::setup();
  let mut policy = DefaultPolicy::new();
  policy.detect_tracee_architecture(getpid()).unwrap();

  // Exits of non-brk syscalls are never refused and read no registers
  assert!(policy.is_syscall_exit_allowed(getpid(), 1).unwrap());
  assert!(policy.is_syscall_exit_allowed(getpid(), 231).unwrap());
}

#[test]
fn it_should_name_syscalls_from_the_build_tables() {
  common::setup();
  // The tables are generated from the host headers; a host without them
  // yields empty mnemonics, which the sandbox tolerates
  let name = syscall_name(Arch::X86_64, 59);
  assert!(name.is_empty() || name == "execve");

  let name = syscall_name(Arch::I386, 11);
  assert!(name.is_empty() || name == "execve");

  assert_eq!(syscall_name(Arch::X86_64, -1), "");
  assert_eq!(syscall_name(Arch::X86_64, 100_000), "");
}
