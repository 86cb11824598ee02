use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Per-command execution knobs.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Label for the tracing span and log lines.
    pub service: Option<String>,
    /// Run as `mise exec -- <program> <args..>`.
    pub use_mise: bool,
    pub timeout: Option<Duration>,
    /// Failure is still reported in the result, only the error log is suppressed.
    pub ignore_errors: bool,
    /// Relay output to this process' stdout/stderr while capturing it.
    pub echo: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            service: None,
            use_mise: false,
            timeout: None,
            ignore_errors: false,
            echo: true,
        }
    }
}

/// A program, its arguments and options. Both the async and blocking paths build from this.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub options: ExecOptions,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), options: ExecOptions::default() }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.options.service = Some(name.into());
        self
    }

    pub fn mise(mut self, enabled: bool) -> Self {
        self.options.use_mise = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.options.ignore_errors = ignore;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.options.echo = false;
        self
    }

    /// Program and arguments after mise wrapping.
    pub fn argv(&self) -> (String, Vec<String>) {
        if self.options.use_mise {
            let mut args = vec!["exec".to_string(), "--".to_string(), self.program.clone()];
            args.extend(self.args.iter().cloned());
            ("mise".to_string(), args)
        } else {
            (self.program.clone(), self.args.clone())
        }
    }

    pub fn display(&self) -> String {
        let (program, args) = self.argv();
        if args.is_empty() {
            program
        } else {
            format!("{} {}", program, args.join(" "))
        }
    }

    pub(crate) fn to_std(&self) -> std::process::Command {
        let (program, args) = self.argv();
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        if let Some(dir) = &self.options.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.options.env);
        cmd
    }
}

/// `sh -c <command>`: how manifest command strings are run.
pub fn shell(command: impl Into<String>) -> CommandSpec {
    CommandSpec::new("sh", ["-c".to_string(), command.into()])
}

/// Outcome of one command. Spawn failures and timeouts are results too, never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code; 1 when the process was killed by a signal or never started.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecResult {
    pub(crate) fn spawn_failure(message: String, duration: Duration) -> Self {
        Self { code: 1, stdout: String::new(), stderr: message, success: false, timed_out: false, duration }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mise_wraps_program_and_args() {
        let spec = shell("make test").mise(true);
        let (program, args) = spec.argv();
        assert_eq!(program, "mise");
        assert_eq!(args, vec!["exec", "--", "sh", "-c", "make test"]);
        assert_eq!(spec.display(), "mise exec -- sh -c make test");
    }

    #[test]
    fn builder_sets_options() {
        let spec = CommandSpec::new("git", ["config", "user.name"])
            .cwd("/tmp")
            .env("A", "1")
            .service("account-api")
            .timeout(Some(Duration::from_secs(2)))
            .ignore_errors(true)
            .quiet();
        assert_eq!(spec.options.env.get("A").map(|s| s.as_str()), Some("1"));
        assert_eq!(spec.options.service.as_deref(), Some("account-api"));
        assert!(spec.options.ignore_errors);
        assert!(!spec.options.echo);
        assert!(!spec.options.use_mise);
        assert_eq!(spec.display(), "git config user.name");
    }
}
