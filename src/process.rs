use std::{
    io::{BufRead as _, BufReader, Read as _},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::foundation::error::{DriverError, DriverResult};

const CHILD_POLL: Duration = Duration::from_millis(25);
const STDERR_TAIL_BYTES: usize = 2048;

/// Lifecycle of a dev-server subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Stopped,
    Failed,
}

/// Run the project's dependency install step to completion.
///
/// An empty `command` skips the step.
#[tracing::instrument(skip(dir, command), fields(dir = %dir.display()))]
pub fn prepare_project(
    project: &str,
    dir: &Path,
    command: &[String],
    timeout: Duration,
) -> DriverResult<()> {
    let Some((program, args)) = command.split_first() else {
        debug!(project, "no install command configured; skipping");
        return Ok(());
    };

    let started_at = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    isolate_group(&mut cmd);
    let mut child = cmd
        .spawn()
        .map_err(|e| DriverError::prepare(project, format!("failed to spawn '{program}': {e}")))?;

    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| DriverError::prepare(project, "failed to open install stderr"))?;
    let stderr_drain = thread::spawn(move || {
        let mut bytes = Vec::new();
        stderr.read_to_end(&mut bytes)?;
        Ok::<_, std::io::Error>(bytes)
    });

    let status = match wait_with_deadline(&mut child, timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            terminate(&mut child, Duration::ZERO);
            return Err(DriverError::prepare(
                project,
                format!("'{program}' timed out after {timeout:?}"),
            ));
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DriverError::prepare(
                project,
                format!("failed to wait for '{program}': {e}"),
            ));
        }
    };

    let stderr_bytes = stderr_drain
        .join()
        .map_err(|_| DriverError::prepare(project, "install stderr drain thread panicked"))?
        .unwrap_or_default();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr_bytes);
        return Err(DriverError::prepare(
            project,
            format!("'{program}' exited with {status}: {}", tail(stderr.trim())),
        ));
    }

    info!(
        project,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "dependencies installed"
    );
    Ok(())
}

/// Poll `child` until it exits or `timeout` elapses (`Ok(None)`).
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(CHILD_POLL.min(deadline - now));
    }
}

fn tail(s: &str) -> &str {
    if s.len() <= STDERR_TAIL_BYTES {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// A spawned dev server with line-buffered output pumps.
///
/// The server runs in its own process group so `stop` also reaches the processes
/// the serve command forks (npm -> vite).
pub struct ServerProcess {
    port: u16,
    child: Option<Child>,
    lines: Option<mpsc::Receiver<String>>,
    state: ServerState,
    stop_grace: Duration,
}

impl ServerProcess {
    pub fn start(
        dir: &Path,
        command: &[String],
        port: u16,
        stop_grace: Duration,
    ) -> DriverResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DriverError::validation("serve command must be non-empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            DriverError::process(format!("failed to spawn dev server '{program}': {e}"))
        })?;

        let (tx, rx) = mpsc::channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    debug!(port, line = %line, "dev server");
                    // The receiver goes away once the server is ready; keep draining.
                    let _ = tx.send(line);
                }
            });
        }
        if let Some(stderr) = stderr {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    warn!(port, line = %line, "dev server stderr");
                }
            });
        }

        info!(port, pid = child.id(), program = %program, "dev server spawned");

        Ok(Self {
            port,
            child: Some(child),
            lines: Some(rx),
            state: ServerState::Starting,
            stop_grace,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Block until a stdout line contains `marker`.
    ///
    /// stderr output never fails the wait. The caller is responsible for `stop` on error.
    pub fn await_ready(&mut self, marker: &str, timeout: Duration) -> DriverResult<()> {
        match self.state {
            ServerState::Starting => {}
            ServerState::Ready => return Ok(()),
            ServerState::Stopped | ServerState::Failed => {
                return Err(DriverError::process(format!(
                    "dev server on port {} is not running",
                    self.port
                )));
            }
        }

        let started_at = Instant::now();
        let deadline = started_at + timeout;
        let mut streams_closed = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                self.state = ServerState::Failed;
                return Err(DriverError::ServerStartTimeout {
                    port: self.port,
                    timeout,
                });
            }
            let remaining = deadline - now;

            if streams_closed {
                if let Some(status) = self.try_exit_status()? {
                    self.state = ServerState::Failed;
                    return Err(DriverError::ServerExited {
                        port: self.port,
                        status: status.to_string(),
                    });
                }
                thread::sleep(CHILD_POLL.min(remaining));
                continue;
            }

            let Some(lines) = self.lines.as_ref() else {
                streams_closed = true;
                continue;
            };
            match lines.recv_timeout(remaining) {
                Ok(line) if line.contains(marker) => {
                    self.state = ServerState::Ready;
                    self.lines = None;
                    info!(
                        port = self.port,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "dev server ready"
                    );
                    return Ok(());
                }
                Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => streams_closed = true,
            }
        }
    }

    fn try_exit_status(&mut self) -> DriverResult<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        child
            .try_wait()
            .map_err(|e| DriverError::process(format!("failed to poll dev server: {e}")))
    }

    /// Terminate the server and everything it spawned. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.lines = None;
        let Some(mut child) = self.child.take() else {
            self.state = ServerState::Stopped;
            return;
        };

        let pid = child.id();
        terminate(&mut child, self.stop_grace);
        self.state = ServerState::Stopped;
        info!(port = self.port, pid, "dev server stopped");
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the command as the leader of a new process group so `terminate` reaches its children.
pub(crate) fn isolate_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// TERM the child's process group, KILL after `grace`, then reap the child.
pub(crate) fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        signal_group(child.id(), "TERM");
        match wait_with_deadline(child, grace) {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                let _ = child.kill();
            }
        }
        // Stragglers that ignored TERM, even if the leader already exited.
        signal_group(child.id(), "KILL");
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill();
    }

    if let Err(e) = child.wait() {
        warn!(pid = child.id(), error = %e, "failed to reap dev server");
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        debug!(pgid, signal, error = %e, "failed to run kill");
    }
}
