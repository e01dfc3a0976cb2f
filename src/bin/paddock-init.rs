//! In-container supervisor.
//!
//! Runs as pid 1 (or as the reaping parent) inside a container. Two
//! modes:
//!
//! - `--container <name>`: the idle task of a meta container; blocks
//!   forever and reaps whatever reparents to it.
//! - `--container <name> --wait <pid>`: supervises one workload,
//!   forwards termination signals to it, and exits with the workload's
//!   status. A workload killed by signal N is reported as exit code
//!   `128 + N`, because this process cannot die of that signal itself.

use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Parser)]
#[command(name = "paddock-init")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the container this supervisor belongs to.
    #[arg(long)]
    container: String,

    /// Pid of the workload to wait for.
    #[arg(long)]
    wait: Option<i32>,
}

static WAIT_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: i32) {
    let pid = WAIT_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe { libc::kill(pid, sig) };
    }
}

extern "C" fn wake_on_child(_sig: i32) {
    // pause() only returns for a handled signal; SIGCHLD's default
    // disposition is ignore
}

fn install_forwarders() {
    for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGUSR1, libc::SIGUSR2] {
        unsafe { libc::signal(sig, forward_signal as libc::sighandler_t) };
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let Some(wait_pid) = args.wait else {
        // meta container: just exist and reap orphans reparented to us
        unsafe { libc::signal(libc::SIGCHLD, wake_on_child as libc::sighandler_t) };
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::ECHILD {
                    // SIGCHLD interrupts the pause once a child appears
                    unsafe { libc::pause() };
                }
            }
        }
    };

    WAIT_PID.store(wait_pid, Ordering::SeqCst);
    install_forwarders();

    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == wait_pid {
            if libc::WIFEXITED(status) {
                return ExitCode::from(libc::WEXITSTATUS(status) as u8);
            }
            if libc::WIFSIGNALED(status) {
                return ExitCode::from((128 + libc::WTERMSIG(status)) as u8);
            }
        }
        if pid < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            // nothing left to wait for
            return ExitCode::from(1);
        }
    }
}
