pub use context::{ExitStat, SandboxOptions};
pub use error::{SandboxError, SandboxExit};
pub use sandbox::run;
pub use syscall::{
  detect_architecture, syscall_name, AllowAllPolicy, Arch, DefaultPolicy, SyscallPolicy,
};

mod context;
mod error;
mod regs;
mod sandbox;
mod spawner;
mod syscall;
mod timer;
mod utils;
