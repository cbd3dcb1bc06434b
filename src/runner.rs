//! External command execution.
//!
//! Every tool the provisioner drives (apt-get, aria2c, cmake, make, docker)
//! goes through [`CommandRunner`], so the sequencing logic can be exercised
//! against a scripted runner without touching the host.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::error::{CommandFailure, FailureReason};

/// Lines of output kept for error reports.
const TAIL_LINES: usize = 40;

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// True if `arg` appears among the arguments.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|candidate| candidate == arg)
    }

    pub fn failure(&self, reason: FailureReason, output: String) -> CommandFailure {
        CommandFailure {
            command: self.to_string(),
            reason,
            output,
        }
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Runs external commands under the zero-is-success contract.
pub trait CommandRunner {
    /// Run to completion, showing output to the operator as it arrives.
    fn run(&self, command: &CommandLine) -> Result<(), CommandFailure>;

    /// Run quietly and return stdout.
    fn capture(&self, command: &CommandLine) -> Result<String, CommandFailure>;
}

/// Runs commands on the host with `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    echo: bool,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self { echo: true }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep output off the terminal; it is still captured for error reports.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine) -> Result<(), CommandFailure> {
        tracing::debug!(%command, cwd = ?command.cwd, "spawning");

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| command.failure(FailureReason::Spawn(err.to_string()), String::new()))?;

        let tail = Arc::new(Mutex::new(OutputTail::new(TAIL_LINES)));

        let stderr_pump = child.stderr.take().map(|pipe| {
            let tail = Arc::clone(&tail);
            let echo = self.echo;
            thread::spawn(move || pump(pipe, &tail, echo.then_some(Sink::Stderr)))
        });

        if let Some(pipe) = child.stdout.take() {
            pump(pipe, &tail, self.echo.then_some(Sink::Stdout));
        }
        if let Some(handle) = stderr_pump {
            let _ = handle.join();
        }

        let status = child
            .wait()
            .map_err(|err| command.failure(FailureReason::Spawn(err.to_string()), String::new()))?;

        if status.success() {
            return Ok(());
        }

        let output = lock(&tail).render();
        let reason = match status.code() {
            Some(code) => FailureReason::Exit(code),
            None => FailureReason::Signal,
        };
        Err(command.failure(reason, output))
    }

    fn capture(&self, command: &CommandLine) -> Result<String, CommandFailure> {
        tracing::debug!(%command, "capturing");

        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|err| command.failure(FailureReason::Spawn(err.to_string()), String::new()))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let mut tail = OutputTail::new(TAIL_LINES);
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tail.push(line.to_string());
        }
        let reason = match output.status.code() {
            Some(code) => FailureReason::Exit(code),
            None => FailureReason::Signal,
        };
        Err(command.failure(reason, tail.render()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Sink {
    Stdout,
    Stderr,
}

fn pump<R: Read>(pipe: R, tail: &Mutex<OutputTail>, echo: Option<Sink>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                match echo {
                    Some(Sink::Stdout) => {
                        let _ = io::stdout().lock().write_all(&buf);
                    }
                    Some(Sink::Stderr) => {
                        let _ = io::stderr().lock().write_all(&buf);
                    }
                    None => {}
                }
                let line = String::from_utf8_lossy(&buf);
                lock(tail).push(line.trim_end_matches(['\n', '\r']).to_string());
            }
        }
    }
}

fn lock(tail: &Mutex<OutputTail>) -> MutexGuard<'_, OutputTail> {
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded buffer holding the most recent output lines.
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    limit: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().fold(String::new(), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        })
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::{CommandLine, CommandRunner};
    use crate::error::{CommandFailure, FailureReason};
    use std::cell::RefCell;

    type Responder = Box<dyn Fn(&CommandLine) -> Result<String, CommandFailure>>;

    struct Rule {
        program: String,
        arg: Option<String>,
        respond: Responder,
    }

    impl Rule {
        fn matches(&self, command: &CommandLine) -> bool {
            command.program == self.program
                && self.arg.as_deref().map_or(true, |arg| command.has_arg(arg))
        }
    }

    /// Records every command and answers from a list of rules; unmatched
    /// commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Vec<Rule>,
        calls: RefCell<Vec<CommandLine>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond to `program` (optionally only when `arg` is present).
        /// Earlier rules win.
        pub fn on(
            mut self,
            program: &str,
            arg: Option<&str>,
            respond: impl Fn(&CommandLine) -> Result<String, CommandFailure> + 'static,
        ) -> Self {
            self.rules.push(Rule {
                program: program.to_string(),
                arg: arg.map(str::to_string),
                respond: Box::new(respond),
            });
            self
        }

        pub fn fail(self, program: &str, arg: Option<&str>, code: i32) -> Self {
            self.on(program, arg, move |command| {
                Err(command.failure(FailureReason::Exit(code), format!("{} failed", command.program)))
            })
        }

        pub fn calls(&self) -> Vec<CommandLine> {
            self.calls.borrow().clone()
        }

        pub fn invoked(&self, program: &str) -> bool {
            self.calls.borrow().iter().any(|call| call.program == program)
        }

        fn answer(&self, command: &CommandLine) -> Result<String, CommandFailure> {
            self.calls.borrow_mut().push(command.clone());
            match self.rules.iter().find(|rule| rule.matches(command)) {
                Some(rule) => (rule.respond)(command),
                None => Ok(String::new()),
            }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &CommandLine) -> Result<(), CommandFailure> {
            self.answer(command).map(|_| ())
        }

        fn capture(&self, command: &CommandLine) -> Result<String, CommandFailure> {
            self.answer(command)
        }
    }
}
