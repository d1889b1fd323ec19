//! Per-architecture syscall register mapping. Everything else in the
//! tracer is architecture-independent.

use anyhow::{Context, Result};
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Register snapshot of a syscall stop. `number` and `args` are valid at
/// the entry stop, `result` at the exit stop; on aarch64 x0 carries both
/// the first argument and the return value, so callers must pair an
/// entry-stop snapshot with an exit-stop result.
#[derive(Debug, Clone, Copy)]
pub struct SyscallRegs {
    pub number: i64,
    pub args: [u64; 3],
    pub result: i64,
}

#[cfg(target_arch = "x86_64")]
pub fn read_syscall(pid: Pid) -> Result<SyscallRegs> {
    let regs = ptrace::getregs(pid).context("ptrace getregs failed")?;
    Ok(SyscallRegs {
        number: regs.orig_rax as i64,
        args: [regs.rdi, regs.rsi, regs.rdx],
        result: regs.rax as i64,
    })
}

#[cfg(target_arch = "aarch64")]
pub fn read_syscall(pid: Pid) -> Result<SyscallRegs> {
    let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(pid)
        .context("ptrace getregset failed")?;
    Ok(SyscallRegs {
        number: regs.regs[8] as i64,
        args: [regs.regs[0], regs.regs[1], regs.regs[2]],
        result: regs.regs[0] as i64,
    })
}
