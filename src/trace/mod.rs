//! Runs a child process under ptrace and records the files it reads.
//!
//! The child's stdout is captured to an unlinked temp file. Every
//! successful read-open and every chdir is recorded during the trace;
//! after the child exits the records are replayed against a virtual cwd
//! to produce canonical absolute dependency paths.
//!
//! Known limitations: the tracer does not follow clone/fork (reads made
//! by grandchildren are not recorded), and `openat` with a directory fd
//! other than AT_FDCWD is resolved against the tracked cwd rather than
//! the fd. Both err toward cache misses, never false hits.

mod arch;

use std::ffi::{CString, OsString};
use std::fs;
use std::io::{IoSliceMut, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{raise, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};

use arch::SyscallRegs;

const ENOENT_RESULT: i64 = -(libc::ENOENT as i64);

/// Captured child stdout and exit status.
pub struct TraceOutput {
    pub stdout: Vec<u8>,
    pub exit_status: i32,
}

enum RecordKind {
    Chdir,
    Open,
}

/// One observed syscall, replayed after the child exits.
struct SyscallRecord {
    kind: RecordKind,
    path: PathBuf,
}

/// Run `cmd` under the tracer. `on_dependency` is invoked once per
/// resolved dependency path, in the order the child opened them.
///
/// `cmd[0]` must already be resolved to an executable path. OS-level
/// failures (temp file, fork, ptrace, cross-process memory read) are
/// errors; the child failing is not — its exit status is reported as-is,
/// and a child killed by signal N is reported as `128 + N`.
pub fn run<F>(cmd: &[String], mut on_dependency: F) -> Result<TraceOutput>
where
    F: FnMut(&Path),
{
    anyhow::ensure!(!cmd.is_empty(), "empty command");

    let argv: Vec<CString> = cmd
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("argument contains a NUL byte")?;
    let exec_error = format!("helpcache: can't exec '{}'\n", cmd[0]);

    // Created unlinked, so it disappears however the tracer exits.
    let mut stdout_file =
        tempfile::tempfile().context("can't create temp file for child stdout")?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let _ = dup2(stdout_file.as_raw_fd(), libc::STDOUT_FILENO);
            let _ = ptrace::traceme();
            let _ = raise(Signal::SIGSTOP);
            let _ = nix::unistd::execvp(argv[0].as_c_str(), &argv);
            let _ = nix::unistd::write(std::io::stderr(), exec_error.as_bytes());
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            let (records, exit_status) = trace_loop(child)?;
            resolve_records(records, &mut on_dependency)?;

            let mut stdout = Vec::new();
            stdout_file
                .seek(SeekFrom::Start(0))
                .context("can't rewind capture file")?;
            stdout_file
                .read_to_end(&mut stdout)
                .context("can't read captured stdout")?;
            Ok(TraceOutput {
                stdout,
                exit_status,
            })
        }
    }
}

/// Step the child syscall-by-syscall until it exits.
///
/// PTRACE_O_TRACESYSGOOD makes syscall stops distinguishable from signal
/// stops, and PTRACE_O_TRACEEXEC turns the post-exec trap into an event
/// stop instead of a spurious SIGTRAP. `pending` holds the syscall whose
/// entry stop has been seen but whose exit stop has not: arguments are
/// captured at the entry stop, the return value at the exit stop.
fn trace_loop(child: Pid) -> Result<(Vec<SyscallRecord>, i32)> {
    // First stop is the SIGSTOP the child raised before exec.
    match waitpid(child, None).context("waitpid failed")? {
        WaitStatus::Exited(_, code) => return Ok((Vec::new(), code)),
        WaitStatus::Stopped(..) => {}
        other => bail!("unexpected initial stop: {other:?}"),
    }
    ptrace::setoptions(
        child,
        Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXEC,
    )
    .context("ptrace setoptions failed")?;

    let mut records = Vec::new();
    let mut pending: Option<SyscallRegs> = None;
    let mut resume_signal: Option<Signal> = None;

    loop {
        ptrace::syscall(child, resume_signal).context("ptrace syscall step failed")?;
        resume_signal = None;

        match waitpid(child, None).context("waitpid failed")? {
            WaitStatus::Exited(_, code) => return Ok((records, code)),
            WaitStatus::Signaled(_, signal, _) => return Ok((records, 128 + signal as i32)),
            WaitStatus::PtraceSyscall(_) => {
                let stop = arch::read_syscall(child)?;
                match pending.take() {
                    // Exit stop of the entry we are holding: the return
                    // value is valid now.
                    Some(entry) if entry.number == stop.number => {
                        inspect_syscall(child, entry, stop.result, &mut records)?;
                    }
                    // Fresh entry. The number check above also resyncs
                    // the pairing if an exit stop ever goes missing.
                    _ => pending = Some(stop),
                }
            }
            // A successful execve replaces its exit stop with this event
            // stop; drop the pending entry so the next syscall stop is
            // read as an entry again.
            WaitStatus::PtraceEvent(..) => pending = None,
            // Genuine signal delivery: hand the signal back to the child
            // on the next resume.
            WaitStatus::Stopped(_, signal) => resume_signal = Some(signal),
            _ => {}
        }
    }
}

/// Record `chdir`, `open`, and `openat`, inspected at the syscall-exit
/// stop where the return value is valid. Opens that cannot read the file
/// content and opens that failed with ENOENT are skipped.
fn inspect_syscall(
    pid: Pid,
    entry: SyscallRegs,
    result: i64,
    records: &mut Vec<SyscallRecord>,
) -> Result<()> {
    match entry.number {
        n if n == libc::SYS_chdir => {
            let path = read_child_path(pid, entry.args[0])?;
            records.push(SyscallRecord {
                kind: RecordKind::Chdir,
                path,
            });
        }
        n if n == libc::SYS_openat => {
            let flags = entry.args[2] as i32;
            if flags & libc::O_DIRECTORY != 0 || !opens_for_read(flags) || result == ENOENT_RESULT
            {
                return Ok(());
            }
            let path = read_child_path(pid, entry.args[1])?;
            records.push(SyscallRecord {
                kind: RecordKind::Open,
                path,
            });
        }
        #[cfg(target_arch = "x86_64")]
        n if n == libc::SYS_open => {
            let flags = entry.args[1] as i32;
            if !opens_for_read(flags) || result == ENOENT_RESULT {
                return Ok(());
            }
            let path = read_child_path(pid, entry.args[0])?;
            records.push(SyscallRecord {
                kind: RecordKind::Open,
                path,
            });
        }
        _ => {}
    }
    Ok(())
}

/// O_WRONLY is the only access mode that cannot read the file back;
/// O_RDWR still exposes the content to the child.
fn opens_for_read(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_WRONLY
}

/// Read a NUL-terminated path of at most PATH_MAX bytes from the child's
/// memory. Chunks never cross a page boundary, so a terminating NUL in a
/// mapped page is found even when the following page is unmapped.
fn read_child_path(pid: Pid, addr: u64) -> Result<PathBuf> {
    let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    };
    let page_mask = page_size - 1;

    let mut path = Vec::new();
    let mut addr = addr;
    let mut remaining = libc::PATH_MAX as usize;
    let mut chunk = vec![0u8; page_size as usize];

    while remaining > 0 {
        let mut chunk_len = remaining.min(page_size as usize);
        let end_in_page = ((addr + chunk_len as u64) & page_mask) as usize;
        if chunk_len > end_in_page {
            chunk_len -= end_in_page;
        }

        let mut local = [IoSliceMut::new(&mut chunk[..chunk_len])];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: chunk_len,
        }];
        let nread = match process_vm_readv(pid, &mut local, &remote) {
            Ok(n) if n > 0 => n,
            Ok(_) => bail!("can't read path from child memory"),
            Err(Errno::ENOSYS) => bail!("process_vm_readv is not supported on this system"),
            Err(err) => return Err(err).context("process_vm_readv failed"),
        };

        if let Some(nul) = chunk[..nread].iter().position(|&b| b == 0) {
            path.extend_from_slice(&chunk[..nul]);
            return Ok(PathBuf::from(OsString::from_vec(path)));
        }
        path.extend_from_slice(&chunk[..nread]);
        addr += nread as u64;
        remaining -= nread;
    }
    bail!("path in child memory is longer than PATH_MAX")
}

/// Replay the recorded syscalls against a virtual cwd seeded with the
/// tracer's own cwd. Relative paths resolve against whatever directory
/// the child had chdir'ed to at that point, folding `..` and symlinks
/// through the real filesystem. Paths that no longer resolve are dropped:
/// a miss is safe, a false hit is not.
fn resolve_records<F>(records: Vec<SyscallRecord>, emit: &mut F) -> Result<()>
where
    F: FnMut(&Path),
{
    let mut cwd = std::env::current_dir().context("can't read current directory")?;
    for record in records {
        match record.kind {
            RecordKind::Chdir => {
                if record.path.is_absolute() {
                    cwd = record.path;
                } else {
                    cwd = fs::canonicalize(cwd.join(&record.path)).unwrap_or_default();
                }
            }
            RecordKind::Open => {
                if record.path.is_absolute() {
                    emit(&record.path);
                } else if let Ok(resolved) = fs::canonicalize(cwd.join(&record.path)) {
                    emit(&resolved);
                }
            }
        }
    }
    Ok(())
}
