//! The only module aware of per-architecture register naming. The tracee's
//! general purpose registers are read and written as a tagged union through
//! PTRACE_GETREGSET / PTRACE_SETREGSET with the NT_PRSTATUS regset, which
//! yields the i386 layout for 32-bit tracees and the x86-64 layout otherwise.

use std::mem;

use nix::errno::Errno;
use nix::libc;
use nix::unistd::Pid;

use crate::syscall::Arch;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct I386UserRegs {
  pub ebx: u32,
  pub ecx: u32,
  pub edx: u32,
  pub esi: u32,
  pub edi: u32,
  pub ebp: u32,
  pub eax: u32,
  pub xds: u32,
  pub xes: u32,
  pub xfs: u32,
  pub xgs: u32,
  pub orig_eax: u32,
  pub eip: u32,
  pub xcs: u32,
  pub eflags: u32,
  pub esp: u32,
  pub xss: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct X8664UserRegs {
  pub r15: u64,
  pub r14: u64,
  pub r13: u64,
  pub r12: u64,
  pub rbp: u64,
  pub rbx: u64,
  pub r11: u64,
  pub r10: u64,
  pub r9: u64,
  pub r8: u64,
  pub rax: u64,
  pub rcx: u64,
  pub rdx: u64,
  pub rsi: u64,
  pub rdi: u64,
  pub orig_rax: u64,
  pub rip: u64,
  pub cs: u64,
  pub eflags: u64,
  pub rsp: u64,
  pub ss: u64,
  pub fs_base: u64,
  pub gs_base: u64,
  pub ds: u64,
  pub es: u64,
  pub fs: u64,
  pub gs: u64,
}

#[repr(C)]
pub(crate) union UserRegs {
  pub i386: I386UserRegs,
  pub x86_64: X8664UserRegs,
}

pub(crate) struct Registers {
  uregs: UserRegs,
}

impl Registers {
  /// Read the tracee's register file
  pub fn get(pid: Pid) -> Result<Self, Errno> {
    let mut regs = Registers {
      uregs: unsafe { mem::zeroed() },
    };
    let mut iov = libc::iovec {
      iov_base: &mut regs.uregs as *mut UserRegs as *mut libc::c_void,
      iov_len: mem::size_of::<UserRegs>(),
    };
    let rc = unsafe {
      libc::ptrace(
        libc::PTRACE_GETREGSET,
        pid.as_raw(),
        libc::NT_PRSTATUS as libc::c_ulong,
        &mut iov as *mut libc::iovec,
      )
    };
    if rc == -1 {
      return Err(Errno::last());
    }
    Ok(regs)
  }

  /// Write the register file back to the tracee
  pub fn set(&mut self, pid: Pid) -> Result<(), Errno> {
    let mut iov = libc::iovec {
      iov_base: &mut self.uregs as *mut UserRegs as *mut libc::c_void,
      iov_len: mem::size_of::<UserRegs>(),
    };
    let rc = unsafe {
      libc::ptrace(
        libc::PTRACE_SETREGSET,
        pid.as_raw(),
        libc::NT_PRSTATUS as libc::c_ulong,
        &mut iov as *mut libc::iovec,
      )
    };
    if rc == -1 {
      return Err(Errno::last());
    }
    Ok(())
  }

  /// Syscall argument by position (0 to 5) in the arch's syscall ABI
  pub fn syscall_arg(&self, arch: Arch, index: usize) -> u64 {
    match arch {
      Arch::I386 => {
        let regs = unsafe { &self.uregs.i386 };
        let value = match index {
          0 => regs.ebx,
          1 => regs.ecx,
          2 => regs.edx,
          3 => regs.esi,
          4 => regs.edi,
          _ => regs.ebp,
        };
        value as u64
      }
      Arch::X86_64 => {
        let regs = unsafe { &self.uregs.x86_64 };
        match index {
          0 => regs.rdi,
          1 => regs.rsi,
          2 => regs.rdx,
          3 => regs.r10,
          4 => regs.r8,
          _ => regs.r9,
        }
      }
    }
  }

  pub fn set_syscall_arg(&mut self, arch: Arch, index: usize, value: u64) {
    match arch {
      Arch::I386 => {
        let regs = unsafe { &mut self.uregs.i386 };
        let value = value as u32;
        match index {
          0 => regs.ebx = value,
          1 => regs.ecx = value,
          2 => regs.edx = value,
          3 => regs.esi = value,
          4 => regs.edi = value,
          _ => regs.ebp = value,
        }
      }
      Arch::X86_64 => {
        let regs = unsafe { &mut self.uregs.x86_64 };
        match index {
          0 => regs.rdi = value,
          1 => regs.rsi = value,
          2 => regs.rdx = value,
          3 => regs.r10 = value,
          4 => regs.r8 = value,
          _ => regs.r9 = value,
        }
      }
    }
  }

  /// Sign-extended syscall return value, valid at a syscall-exit stop
  pub fn return_value(&self, arch: Arch) -> i64 {
    match arch {
      Arch::I386 => unsafe { self.uregs.i386.eax as i32 as i64 },
      Arch::X86_64 => unsafe { self.uregs.x86_64.rax as i64 },
    }
  }
}

/// Offset of the syscall-number slot in the native user area, for
/// PTRACE_PEEKUSER. The kernel exposes the native layout to the tracer for
/// 32-bit tracees as well, so the offset depends only on the tracer build.
#[cfg(target_arch = "x86_64")]
pub(crate) fn orig_ax_offset() -> usize {
  mem::offset_of!(libc::user_regs_struct, orig_rax)
}

#[cfg(target_arch = "x86")]
pub(crate) fn orig_ax_offset() -> usize {
  mem::offset_of!(libc::user_regs_struct, orig_eax)
}
