use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::stat;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Identity of a mount namespace: device and inode of its `/proc` handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsId {
    pub dev: u64,
    pub ino: u64,
}

/// Everything the monitor asks of the kernel, behind one seam so the
/// scenario tests can script wait statuses and a synthetic proc table.
///
/// Per-pid failures are the caller's business: the contract throughout is
/// "an error means that pid is gone", logged and absorbed, never propagated.
pub trait Sys: Send + Sync {
    fn attach(&self, pid: Pid) -> nix::Result<()>;
    fn detach(&self, pid: Pid) -> nix::Result<()>;
    fn cont(&self, pid: Pid, sig: Option<Signal>) -> nix::Result<()>;
    fn set_options(&self, pid: Pid, opts: Options) -> nix::Result<()>;
    /// Payload of the last ptrace event on `pid` (the child pid for
    /// fork/vfork events).
    fn event_msg(&self, pid: Pid) -> nix::Result<u64>;
    /// Non-blocking reap of any tracee status change.
    fn wait_any(&self) -> nix::Result<WaitStatus>;
    /// Blocking wait for the first stop after attaching `pid`.
    fn wait_first_stop(&self, pid: Pid) -> nix::Result<()>;
    fn kill(&self, pid: Pid, sig: Signal) -> nix::Result<()>;

    fn mnt_ns(&self, pid: Pid) -> nix::Result<NsId>;
    /// Owner of the pid's proc directory.
    fn proc_uid(&self, pid: Pid) -> nix::Result<u32>;
    /// First NUL-terminated token of the command line.
    fn cmdline(&self, pid: Pid) -> nix::Result<String>;
    fn ppid(&self, pid: Pid) -> nix::Result<Pid>;
    /// Thread-group leader check; Err means the status file is gone and the
    /// pid is dead.
    fn is_process(&self, pid: Pid) -> nix::Result<bool>;

    /// Prepare child-status wakeups for the calling thread and hand back the
    /// fd the monitor should sleep on. Called once, from the monitor thread,
    /// before anything is traced.
    fn init_child_events(&self) -> nix::Result<OwnedFd>;
    /// Swallow whatever made the child-events fd readable.
    fn drain_child_events(&self, fd: BorrowedFd<'_>);
    /// Undo `init_child_events` for the calling thread.
    fn shutdown_child_events(&self);
}

const WAIT_FLAGS: WaitPidFlag = WaitPidFlag::WUNTRACED.union(WaitPidFlag::__WALL);

fn io_errno(err: io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

fn status_field(pid: Pid, field: &str) -> nix::Result<i32> {
    let text = fs::read_to_string(format!("/proc/{pid}/status")).map_err(io_errno)?;
    text.lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.trim_start_matches(':').trim().parse().ok())
        .ok_or(Errno::EINVAL)
}

/// The real thing. Stateless: the signalfd it creates is owned by the
/// monitor, and the SIGCHLD mask change applies to the thread that called
/// `init_child_events`.
pub struct NativeSys;

impl Sys for NativeSys {
    fn attach(&self, pid: Pid) -> nix::Result<()> {
        ptrace::attach(pid)
    }

    fn detach(&self, pid: Pid) -> nix::Result<()> {
        ptrace::detach(pid, None)
    }

    fn cont(&self, pid: Pid, sig: Option<Signal>) -> nix::Result<()> {
        ptrace::cont(pid, sig)
    }

    fn set_options(&self, pid: Pid, opts: Options) -> nix::Result<()> {
        ptrace::setoptions(pid, opts)
    }

    fn event_msg(&self, pid: Pid) -> nix::Result<u64> {
        ptrace::getevent(pid).map(|msg| msg as u64)
    }

    fn wait_any(&self) -> nix::Result<WaitStatus> {
        waitpid(None, Some(WAIT_FLAGS | WaitPidFlag::WNOHANG))
    }

    fn wait_first_stop(&self, pid: Pid) -> nix::Result<()> {
        waitpid(pid, Some(WAIT_FLAGS)).map(drop)
    }

    fn kill(&self, pid: Pid, sig: Signal) -> nix::Result<()> {
        signal::kill(pid, sig)
    }

    fn mnt_ns(&self, pid: Pid) -> nix::Result<NsId> {
        let st = stat(format!("/proc/{pid}/ns/mnt").as_str())?;
        Ok(NsId {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }

    fn proc_uid(&self, pid: Pid) -> nix::Result<u32> {
        let st = stat(format!("/proc/{pid}").as_str())?;
        Ok(st.st_uid)
    }

    fn cmdline(&self, pid: Pid) -> nix::Result<String> {
        let raw = fs::read(format!("/proc/{pid}/cmdline")).map_err(io_errno)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn ppid(&self, pid: Pid) -> nix::Result<Pid> {
        status_field(pid, "PPid").map(Pid::from_raw)
    }

    fn is_process(&self, pid: Pid) -> nix::Result<bool> {
        status_field(pid, "Tgid").map(|tgid| tgid == pid.as_raw())
    }

    fn init_child_events(&self) -> nix::Result<OwnedFd> {
        // A SIG_IGN disposition would discard SIGCHLD at send time even
        // while blocked; reset to default before masking.
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { signal::sigaction(Signal::SIGCHLD, &default)? };

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.thread_block()?;

        let fd = unsafe {
            libc::signalfd(
                -1,
                mask.as_ref(),
                libc::SFD_CLOEXEC | libc::SFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn drain_child_events(&self, fd: BorrowedFd<'_>) {
        let mut buf = [0u8; std::mem::size_of::<libc::signalfd_siginfo>()];
        loop {
            let n = unsafe {
                libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n > 0 {
                continue;
            }
            if n < 0 && Errno::last() == Errno::EINTR {
                continue;
            }
            return;
        }
    }

    fn shutdown_child_events(&self) {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        let _ = mask.thread_unblock();
    }
}
