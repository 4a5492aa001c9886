//! Job execution: environment assembly and command interpretation.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hdist_logging::{Level, Logger};

use crate::error::JobError;
use crate::multiplex::{supervise, LogPipe};
use crate::spec::{AssignOp, Assignment, ExecCommand, ExecKind, InputSpec, JobCommand};
use crate::substitute::substitute;

/// Context handed to in-process `hit` invocations.
pub struct HitContext<'a> {
    /// The command's environment.
    pub env: &'a BTreeMap<String, String>,
    /// The command's working directory.
    pub cwd: &'a Path,
    /// The job logger.
    pub logger: &'a Logger,
    /// Where the invocation's stdout goes (a capture buffer or the log).
    pub stdout: &'a mut dyn Write,
}

/// Handles `hit` verbs other than `logpipe`, which the executor owns.
///
/// Implementations run in the caller's process against the job's current
/// environment and working directory; errors fail the job.
pub trait HitDispatcher {
    /// Runs `argv` (starting at the verb).
    fn dispatch(
        &self,
        ctx: &mut HitContext<'_>,
        argv: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A dispatcher that rejects every verb. Useful for jobs that are known
/// not to call `hit`.
pub struct NoTools;

impl HitDispatcher for NoTools {
    fn dispatch(
        &self,
        _ctx: &mut HitContext<'_>,
        argv: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err(format!("no such hit command: {}", argv.first().map(String::as_str).unwrap_or("")).into())
    }
}

/// Mutable state carried across the commands of one job: the logger, the
/// per-job temporary directory, and any log pipes created so far.
///
/// The environment and working directory are scope state and are passed
/// through the call stack instead.
pub struct JobExecution<'a> {
    logger: &'a Logger,
    dispatcher: &'a dyn HitDispatcher,
    rpc_dir: tempfile::TempDir,
    pipes: Vec<LogPipe>,
    input_counter: usize,
}

impl<'a> JobExecution<'a> {
    /// Creates the execution state and its temporary directory.
    pub fn new(
        logger: &'a Logger,
        dispatcher: &'a dyn HitDispatcher,
    ) -> Result<Self, JobError> {
        let rpc_dir = tempfile::Builder::new()
            .prefix("hdist-job-")
            .tempdir()
            .map_err(|e| JobError::io("tempdir", e))?;
        Ok(Self {
            logger,
            dispatcher,
            rpc_dir,
            pipes: Vec::new(),
            input_counter: 0,
        })
    }

    /// Runs a command list as the root scope; returns the environment as
    /// modified by it.
    pub fn run(
        &mut self,
        commands: &[JobCommand],
        env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<BTreeMap<String, String>, JobError> {
        let mut env = env.clone();
        let mut cwd = cwd.to_path_buf();
        self.run_scope(commands, &mut env, &mut cwd)?;
        Ok(env)
    }

    fn run_scope(
        &mut self,
        commands: &[JobCommand],
        env: &mut BTreeMap<String, String>,
        cwd: &mut PathBuf,
    ) -> Result<(), JobError> {
        for command in commands {
            match command {
                JobCommand::Assign(assignment) => self.run_assign(assignment, env)?,
                JobCommand::Chdir { dir } => {
                    let dir = substitute(dir, env)?;
                    let joined = cwd.join(dir);
                    *cwd = fs::canonicalize(&joined).map_err(|e| JobError::io(&joined, e))?;
                }
                JobCommand::Scope { commands } => {
                    // Nested scopes see a snapshot; their changes to the
                    // environment and cwd are discarded.
                    let mut scope_env = env.clone();
                    let mut scope_cwd = cwd.clone();
                    self.run_scope(commands, &mut scope_env, &mut scope_cwd)?;
                }
                JobCommand::Exec(exec) => self.run_exec(exec, env, cwd)?,
            }
        }
        Ok(())
    }

    fn run_assign(
        &self,
        assignment: &Assignment,
        env: &mut BTreeMap<String, String>,
    ) -> Result<(), JobError> {
        let value = substitute(&assignment.value, env)?;
        let separator = match assignment.op {
            AssignOp::Set => {
                env.insert(assignment.key.clone(), value);
                return Ok(());
            }
            AssignOp::AppendFlag | AssignOp::PrependFlag => ' ',
            AssignOp::AppendPath | AssignOp::PrependPath => crate::imports::PATH_SEP,
        };
        let existing = env.get(&assignment.key).cloned().unwrap_or_default();
        let combined = if existing.is_empty() {
            value
        } else {
            match assignment.op {
                AssignOp::AppendFlag | AssignOp::AppendPath => {
                    format!("{existing}{separator}{value}")
                }
                _ => format!("{value}{separator}{existing}"),
            }
        };
        env.insert(assignment.key.clone(), combined);
        Ok(())
    }

    fn run_exec(
        &mut self,
        exec: &ExecCommand,
        env: &mut BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<(), JobError> {
        // Per-command environment: explicit overrides plus materialized
        // inputs, visible to this command only.
        let mut cmd_env = env.clone();
        for (key, value) in &exec.env {
            let value = substitute(value, env)?;
            cmd_env.insert(key.clone(), value);
        }
        self.materialize_inputs(&exec.inputs, &mut cmd_env)?;

        let argv: Vec<String> = exec
            .argv
            .iter()
            .map(|arg| substitute(arg, &cmd_env))
            .collect::<Result<_, _>>()?;

        self.logger.info(&format!("running {argv:?}"));
        self.logger.debug(&format!("cwd: {}", cwd.display()));

        enum Sink {
            Var(Vec<u8>),
            File(fs::File),
            Log,
        }
        let mut sink = match (&exec.to_var, &exec.append_to_file) {
            (Some(_), _) => Sink::Var(Vec::new()),
            (None, Some(file)) => {
                let file = substitute(file, &cmd_env)?;
                let path = if Path::new(&file).is_absolute() {
                    PathBuf::from(&file)
                } else {
                    cwd.join(&file)
                };
                if path.starts_with(self.rpc_dir.path()) {
                    return Err(JobError::LogPipeRedirect);
                }
                let handle = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| JobError::io(&path, e))?;
                Sink::File(handle)
            }
            (None, None) => Sink::Log,
        };

        match exec.kind {
            ExecKind::Hit => {
                let mut logger_writer = LoggerWriter(self.logger);
                let result = {
                    let capture: &mut dyn Write = match &mut sink {
                        Sink::Var(buf) => buf,
                        Sink::File(f) => f,
                        Sink::Log => &mut logger_writer,
                    };
                    self.run_hit(&argv, &cmd_env, cwd, capture)
                };
                if let Err(e) = result {
                    self.logger.error("hit command failed; raising");
                    return Err(e);
                }
            }
            ExecKind::Cmd => {
                let capture: Option<&mut dyn Write> = match &mut sink {
                    Sink::Var(buf) => Some(buf),
                    Sink::File(f) => Some(f),
                    Sink::Log => None,
                };
                self.spawn_and_supervise(&argv, &cmd_env, cwd, capture)?;
            }
        }

        if let Sink::Var(buf) = sink {
            let var = exec.to_var.as_ref().expect("sink implies to_var");
            let text = String::from_utf8_lossy(&buf);
            env.insert(var.clone(), text.trim().to_string());
        }
        Ok(())
    }

    fn materialize_inputs(
        &mut self,
        inputs: &[InputSpec],
        cmd_env: &mut BTreeMap<String, String>,
    ) -> Result<(), JobError> {
        for (i, input) in inputs.iter().enumerate() {
            let path = self
                .rpc_dir
                .path()
                .join(format!("input-{}-{i}", self.input_counter));
            let contents = match input {
                InputSpec::Text { text } => text.join("\n"),
                InputSpec::Str { string } => string.clone(),
                InputSpec::Json { json } => {
                    serde_json::to_string(json).map_err(|e| JobError::InvalidSpec {
                        reason: format!("unserializable input: {e}"),
                    })?
                }
            };
            fs::write(&path, contents).map_err(|e| JobError::io(&path, e))?;
            cmd_env.insert(format!("in{i}"), path.display().to_string());
        }
        self.input_counter += 1;
        Ok(())
    }

    fn spawn_and_supervise(
        &mut self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        cwd: &Path,
        capture: Option<&mut dyn Write>,
    ) -> Result<(), JobError> {
        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.logger
                    .error(&format!("command \"{}\" not found in PATH", argv[0]));
                return Err(JobError::CommandNotFound {
                    command: argv[0].clone(),
                    cwd: cwd.to_path_buf(),
                });
            }
            Err(e) => return Err(JobError::io(&argv[0], e)),
        };
        // Jobs get no stdin: the pipe is closed before the child is
        // waited on.
        drop(child.stdin.take());

        let status = supervise(&mut child, self.logger, &mut self.pipes, capture)?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            self.logger
                .error(&format!("command failed (code={code}); raising"));
            return Err(JobError::CommandFailed {
                argv: argv.to_vec(),
                code,
            });
        }
        Ok(())
    }

    fn run_hit(
        &mut self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        cwd: &Path,
        stdout: &mut dyn Write,
    ) -> Result<(), JobError> {
        let verb = argv.first().map(String::as_str).unwrap_or_default();
        if verb == "logpipe" {
            let [_, name, level]: &[String; 3] =
                argv.try_into().map_err(|_| JobError::InvalidSpec {
                    reason: "usage: hit logpipe NAME LEVEL".to_string(),
                })?;
            let level: Level = level.parse().map_err(|e| JobError::InvalidSpec {
                reason: format!("{e}"),
            })?;
            let path = self.create_log_pipe(name, level)?;
            stdout
                .write_all(path.display().to_string().as_bytes())
                .map_err(|e| JobError::io(&path, e))?;
            return Ok(());
        }

        let mut ctx = HitContext {
            env,
            cwd,
            logger: self.logger,
            stdout,
        };
        self.dispatcher
            .dispatch(&mut ctx, argv)
            .map_err(|e| JobError::Tool {
                verb: verb.to_string(),
                message: e.to_string(),
            })
    }

    /// Creates (or reuses) the FIFO for a `(name, level)` pair and
    /// returns its path.
    fn create_log_pipe(&mut self, name: &str, level: Level) -> Result<PathBuf, JobError> {
        if let Some(existing) = self
            .pipes
            .iter()
            .find(|p| p.name == name && p.level == level)
        {
            return Ok(existing.path.clone());
        }
        let path = self.rpc_dir.path().join(format!("logpipe-{name}-{level}"));
        let pipe = LogPipe::create(name, level, path.clone())?;
        self.pipes.push(pipe);
        Ok(path)
    }
}

/// Adapts the logger into a line-oriented writer for in-process tool
/// output that is not captured.
struct LoggerWriter<'a>(&'a Logger);

impl Write for LoggerWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for line in String::from_utf8_lossy(buf).lines() {
            self.0.info(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
