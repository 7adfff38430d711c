//! PTY process handling: spawning the login shell, resize, cwd discovery.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// Options applied when spawning a session shell.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory; defaults to `$HOME` when unset.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Shell path override; defaults to the user's login shell.
    pub shell: Option<String>,
}

/// Resolve the invoking user's login shell from the system password
/// database, falling back to `/bin/bash`.
pub fn login_shell() -> String {
    let uid = unsafe { libc::getuid() };
    if let Ok(passwd) = std::fs::read_to_string("/etc/passwd") {
        for line in passwd.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() >= 7
                && fields[2].parse::<u32>() == Ok(uid)
                && !fields[6].is_empty()
            {
                return fields[6].to_string();
            }
        }
    }
    "/bin/bash".to_string()
}

/// Build the command for a session shell: login shell with `-l`, working
/// directory `$HOME`, and `TERM=xterm-256color` layered over the inherited
/// environment. Mirrors what an interactive SSH login would produce.
pub fn shell_command(opts: &SpawnOptions) -> CommandBuilder {
    let shell = opts.shell.clone().unwrap_or_else(login_shell);
    let mut cmd = CommandBuilder::new(&shell);
    cmd.arg("-l");
    match &opts.cwd {
        Some(dir) => cmd.cwd(dir),
        None => {
            if let Ok(home) = std::env::var("HOME") {
                cmd.cwd(home);
            }
        }
    }
    cmd.env("TERM", "xterm-256color");
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }
    cmd
}

/// A spawned child attached to a pseudo-terminal.
///
/// The slave side is dropped after spawn so the master reader observes
/// EOF/EIO once the child exits.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl Pty {
    /// Spawn `cmd` on a freshly allocated PTY with the given dimensions.
    pub fn spawn(cmd: CommandBuilder, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Hand out the child handle so a watcher can `wait()` on it.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// Resize the PTY and deliver SIGWINCH so the shell redraws its prompt.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)?;
        self.signal(libc::SIGWINCH);
        Ok(())
    }

    /// Current working directory of the shell process.
    ///
    /// Linux-specific: resolved through `/proc/<pid>/cwd`. This is the one
    /// non-portable step in file upload.
    #[cfg(target_os = "linux")]
    pub fn read_cwd(&self) -> std::io::Result<PathBuf> {
        let pid = self
            .pid
            .ok_or_else(|| std::io::Error::other("process not running"))?;
        std::fs::read_link(format!("/proc/{}/cwd", pid))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read_cwd(&self) -> std::io::Result<PathBuf> {
        Err(std::io::Error::other(
            "cwd discovery is only supported on linux",
        ))
    }

    /// Send SIGKILL to the child if we have a PID.
    pub fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, sig: i32) {
        if let Some(pid) = self.pid {
            if pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID exceeds i32::MAX, cannot send signal");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, sig);
            }
        }
    }
}

/// Map a child wait result to the exit code reported to clients: the
/// process's exit status, or -1 on abnormal termination.
pub fn exit_code(result: std::io::Result<portable_pty::ExitStatus>) -> i32 {
    match result {
        Ok(status) => status.exit_code() as i32,
        Err(_) => -1,
    }
}
