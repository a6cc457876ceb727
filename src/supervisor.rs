use crate::config::Config;
use crate::error::SpawnError;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RUNNING: u8 = 0;
const EXITED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// Minimum wait for already-written output once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process timed out or was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Counting semaphore bounding the number of live engine processes.
///
/// Outer (files) and inner (chunks) concurrency each have their own limit;
/// this pool is the combined ceiling both of them draw from.
#[derive(Debug)]
pub struct ProcessPermits {
    capacity: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl ProcessPermits {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            available: Mutex::new(capacity),
            freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        let available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity - *available
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        while *available == 0 {
            available = self
                .freed
                .wait(available)
                .unwrap_or_else(|e| e.into_inner());
        }
        *available -= 1;
        Permit { pool: self }
    }
}

pub struct Permit<'a> {
    pool: &'a ProcessPermits,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.pool.available.lock().unwrap_or_else(|e| e.into_inner());
        *available += 1;
        self.pool.freed.notify_one();
    }
}

/// Runs one external command with a hard deadline.
///
/// The child is started in its own process group so a timeout takes down any
/// helpers it spawned along with it.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    output_cap: usize,
    permits: Arc<ProcessPermits>,
}

impl ProcessSupervisor {
    pub fn new(output_cap: usize, permits: Arc<ProcessPermits>) -> Self {
        Self {
            output_cap,
            permits,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let c = &cfg.concurrency;
        if c.outer.saturating_mul(c.inner) > c.max_engine_processes {
            warn!(
                "concurrency.outer ({}) x concurrency.inner ({}) exceeds max_engine_processes ({}); extra work will queue",
                c.outer, c.inner, c.max_engine_processes
            );
        }
        Self::new(
            cfg.supervisor.output_cap_bytes,
            Arc::new(ProcessPermits::new(c.max_engine_processes)),
        )
    }

    pub fn run<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<ProcessOutput, SpawnError> {
        let _permit = self.permits.acquire();
        let started = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id();
        debug!("spawned {program} pid={pid} timeout={timeout:?}");

        let stdout_rx = spawn_capped_reader(child.stdout.take(), self.output_cap);
        let stderr_rx = spawn_capped_reader(child.stderr.take(), self.output_cap);

        let state = Arc::new(AtomicU8::new(RUNNING));
        let (tx, rx) = mpsc::channel::<std::io::Result<ExitStatus>>();
        let waiter_state = Arc::clone(&state);
        let waiter = std::thread::spawn(move || {
            let status = child.wait();
            let _ = waiter_state.compare_exchange(RUNNING, EXITED, Ordering::SeqCst, Ordering::SeqCst);
            let _ = tx.send(status);
        });

        let mut group = GroupGuard { pid, armed: true };
        let (exit_code, timed_out) = match rx.recv_timeout(timeout) {
            Ok(status) => (exit_code_of(status), false),
            Err(RecvTimeoutError::Timeout) => {
                let won = state
                    .compare_exchange(RUNNING, TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if won {
                    warn!("{program} pid={pid} exceeded {timeout:?}; killing process group");
                    kill_group(pid);
                    let _ = rx.recv();
                    (None, true)
                } else {
                    // Exited while the deadline was expiring; the exit wins.
                    (rx.recv().ok().and_then(exit_code_of), false)
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("waiter for {program} pid={pid} vanished; killing process group");
                (None, false)
            }
        };
        // Helpers the leader left behind die with it; they may still hold the pipes.
        kill_group(pid);
        group.armed = false;
        let _ = waiter.join();

        let drain_until = Instant::now() + timeout.saturating_sub(started.elapsed()).max(DRAIN_GRACE);
        let stdout = collect_until(&stdout_rx, drain_until, program, "stdout");
        let stderr = collect_until(&stderr_rx, drain_until, program, "stderr");

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration: started.elapsed(),
        })
    }
}

/// Output that has not arrived by `until` is dropped.
fn collect_until(rx: &Receiver<Vec<u8>>, until: Instant, program: &str, stream: &str) -> Vec<u8> {
    match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
        Ok(bytes) => bytes,
        Err(_) => {
            debug!("{program} {stream} still open at the deadline; dropping it");
            Vec::new()
        }
    }
}

fn exit_code_of(status: std::io::Result<ExitStatus>) -> Option<i32> {
    status.ok().and_then(|s| s.code())
}

/// Reads `src` to the end on its own thread, keeping at most `cap` bytes.
fn spawn_capped_reader<R: Read + Send + 'static>(src: Option<R>, cap: usize) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut kept = Vec::new();
        if let Some(mut src) = src {
            let mut buf = [0u8; 8192];
            loop {
                match src.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let room = cap.saturating_sub(kept.len());
                        kept.extend_from_slice(&buf[..n.min(room)]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send(kept);
    });
    rx
}

/// Kills the process group if the supervising frame unwinds mid-wait.
struct GroupGuard {
    pid: u32,
    armed: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_group(self.pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: killpg only sends a signal; the group id is the pid of a child
    // we spawned with process_group(0).
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        debug!(
            "killpg({pid}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    warn!("process-group kill is not supported on this platform (pid={pid})");
}
