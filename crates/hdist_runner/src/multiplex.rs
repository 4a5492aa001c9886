//! Subprocess output multiplexing.
//!
//! A spawned command's stdout and stderr are consumed concurrently with
//! any log-pipe FIFOs, multiplexed into the job logger by a poll loop.
//! The loop wakes every 50 ms because child termination does not reliably
//! interrupt `poll(2)`; on each quiet wakeup the child is checked, and the
//! loop ends once it has exited and the descriptors have gone silent.
//!
//! Bytes are accumulated per descriptor and emitted as complete lines;
//! a trailing unfinished line is flushed when the command ends.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Child;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use hdist_logging::{Level, Logger};

use crate::error::JobError;

/// Poll quantum in milliseconds.
const POLL_TIMEOUT_MS: u16 = 50;

const BUFSIZE: usize = 4096;

/// A registered log pipe: a FIFO whose lines are routed to a named
/// sub-logger at a fixed level.
pub struct LogPipe {
    /// Sub-logger name.
    pub name: String,
    /// Level every line is logged at.
    pub level: Level,
    /// The FIFO's read end.
    pub file: File,
    /// The FIFO path handed to the job.
    pub path: PathBuf,
}

impl LogPipe {
    /// Creates the FIFO at `path` and opens its read end.
    pub fn create(name: &str, level: Level, path: PathBuf) -> Result<LogPipe, JobError> {
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .map_err(|e| JobError::io(&path, e.into()))?;
        // Open non-blocking so the open itself does not wait for a writer,
        // then switch back to blocking so the poll loop treats the FIFO
        // like any other stream.
        use std::os::unix::fs::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| JobError::io(&path, e))?;
        nix::fcntl::fcntl(
            file.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_RDONLY),
        )
        .map_err(|e| JobError::io(&path, e.into()))?;
        Ok(LogPipe {
            name: name.to_string(),
            level,
            file,
            path,
        })
    }
}

/// Where a stream's bytes go.
enum Route<'a> {
    Stdout,
    Stderr,
    Pipe { name: &'a str, level: Level },
}

struct Channel<'a> {
    fd: RawFd,
    file: &'a mut File,
    route: Route<'a>,
    open: bool,
}

/// Runs the poll loop over a child's stdout/stderr and the job's log
/// pipes until the child exits, then reaps it.
///
/// With `capture` set, stdout bytes are forwarded raw to the writer
/// instead of being logged.
pub fn supervise(
    child: &mut Child,
    logger: &Logger,
    pipes: &mut [LogPipe],
    mut capture: Option<&mut dyn Write>,
) -> Result<std::process::ExitStatus, JobError> {
    let mut stdout = child.stdout.take().map(|s| File::from(OwnedFd::from(s)));
    let mut stderr = child.stderr.take().map(|s| File::from(OwnedFd::from(s)));

    let mut channels: Vec<Channel> = Vec::new();
    if let Some(f) = stdout.as_mut() {
        channels.push(Channel {
            fd: f.as_raw_fd(),
            file: f,
            route: Route::Stdout,
            open: true,
        });
    }
    if let Some(f) = stderr.as_mut() {
        channels.push(Channel {
            fd: f.as_raw_fd(),
            file: f,
            route: Route::Stderr,
            open: true,
        });
    }
    for pipe in pipes.iter_mut() {
        channels.push(Channel {
            fd: pipe.file.as_raw_fd(),
            file: &mut pipe.file,
            route: Route::Pipe {
                name: &pipe.name,
                level: pipe.level,
            },
            open: true,
        });
    }

    let mut buffers: HashMap<RawFd, Vec<u8>> = HashMap::new();
    let mut buf = [0u8; BUFSIZE];

    loop {
        let mut poll_fds: Vec<PollFd> = channels
            .iter()
            .filter(|c| c.open)
            .map(|c| PollFd::new(c.file.as_fd(), PollFlags::POLLIN))
            .collect();
        if poll_fds.is_empty() {
            break;
        }
        let n = poll(&mut poll_fds, PollTimeout::from(POLL_TIMEOUT_MS))
            .map_err(|e| JobError::io("poll", e.into()))?;

        if n == 0 {
            // Quiet: see whether the child is gone. Log pipes may outlive
            // it (a writer may still hold the FIFO open), so exit on the
            // first quiet poll after termination.
            let done = child
                .try_wait()
                .map_err(|e| JobError::io("wait", e))?
                .is_some();
            if done {
                break;
            }
            continue;
        }

        let events: Vec<(RawFd, PollFlags)> = poll_fds
            .iter()
            .map(|p| {
                (
                    p.as_fd().as_raw_fd(),
                    p.revents().unwrap_or(PollFlags::empty()),
                )
            })
            .collect();

        for (fd, revents) in events {
            if revents.is_empty() {
                continue;
            }
            let Some(channel) = channels.iter_mut().find(|c| c.fd == fd) else {
                continue;
            };
            if revents.contains(PollFlags::POLLIN) {
                let n = channel
                    .file
                    .read(&mut buf)
                    .map_err(|e| JobError::io("subprocess stream", e))?;
                if n == 0 {
                    channel.open = false;
                    continue;
                }
                match (&channel.route, capture.as_deref_mut()) {
                    (Route::Stdout, Some(writer)) => {
                        writer
                            .write_all(&buf[..n])
                            .map_err(|e| JobError::io("captured stdout", e))?;
                    }
                    (route, _) => {
                        let buffer = buffers.entry(fd).or_default();
                        buffer.extend_from_slice(&buf[..n]);
                        emit_complete_lines(logger, route, buffer);
                    }
                }
            } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                channel.open = false;
            }
        }
    }

    // Flush unfinished trailing lines.
    for channel in &channels {
        if let Some(buffer) = buffers.get(&channel.fd) {
            if !buffer.is_empty() {
                emit_line(logger, &channel.route, buffer);
            }
        }
    }

    child.wait().map_err(|e| JobError::io("wait", e))
}

fn emit_complete_lines(logger: &Logger, route: &Route, buffer: &mut Vec<u8>) {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        emit_line(logger, route, &line[..line.len() - 1]);
    }
}

fn emit_line(logger: &Logger, route: &Route, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    match route {
        Route::Stdout => logger.sub_logger("stdout").log(Level::Info, &text),
        Route::Stderr => logger.sub_logger("stderr").log(Level::Info, &text),
        Route::Pipe { name, level } => logger.sub_logger(name).log(*level, &text),
    }
}
