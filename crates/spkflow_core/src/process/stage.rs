//! Declarative description of one external program invocation.

use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Where a stage reads its standard input from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageInput {
    /// The previous stage's output, or the caller's input for the first stage.
    #[default]
    Pipe,
    /// Like `Pipe`, but the upstream bytes are first collected in a temp
    /// file so the stage gets a seekable input.
    Spooled,
    /// An existing file.
    File(PathBuf),
    /// Empty input.
    Null,
}

/// Where a stage writes its standard output to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageOutput {
    /// The next stage's input, or the pipeline's output for the last stage.
    #[default]
    Pipe,
    /// A file, created or truncated.
    File(PathBuf),
    /// Discarded.
    Null,
}

/// One program invocation: name, argument vector, and I/O bindings.
///
/// Arguments are rendered exactly as the external toolkit expects them
/// (`--name=value`, booleans as `true`/`false`).
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    program: String,
    args: Vec<String>,
    input: StageInput,
    output: StageOutput,
}

impl StageSpec {
    /// Create a stage reading from and writing to pipes.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: StageInput::Pipe,
            output: StageOutput::Pipe,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several positional arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `--name=value`.
    pub fn opt(mut self, name: &str, value: impl Display) -> Self {
        self.args.push(format!("--{}={}", name, value));
        self
    }

    /// Append `--name=value` when a value is present.
    pub fn opt_if<T: Display>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.opt(name, v),
            None => self,
        }
    }

    /// Append a file path argument.
    pub fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Append an archive specifier such as `ark:/tmp/x.ark` or `ark,t:-`.
    pub fn archive(self, specifier: &str, path: &Path) -> Self {
        self.arg(format!("{}:{}", specifier, path.display()))
    }

    /// Set the input binding.
    pub fn stdin(mut self, input: StageInput) -> Self {
        self.input = input;
        self
    }

    /// Set the output binding.
    pub fn stdout(mut self, output: StageOutput) -> Self {
        self.output = output;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> &StageInput {
        &self.input
    }

    pub fn output(&self) -> &StageOutput {
        &self.output
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_toolkit_flags() {
        let spec = StageSpec::new("gmm-global-est")
            .opt("remove-low-count-gaussians", false)
            .opt("min-gaussian-weight", 0.0001)
            .opt_if("num-threads", None::<u32>)
            .opt_if("num-gauss", Some(2048))
            .arg("in.dubm")
            .archive("ark,s,cs", Path::new("/tmp/g.ark"));

        assert_eq!(
            spec.arguments(),
            &[
                "--remove-low-count-gaussians=false",
                "--min-gaussian-weight=0.0001",
                "--num-gauss=2048",
                "in.dubm",
                "ark,s,cs:/tmp/g.ark",
            ]
        );
    }

    #[test]
    fn defaults_to_pipes() {
        let spec = StageSpec::new("cat");
        assert_eq!(spec.input(), &StageInput::Pipe);
        assert_eq!(spec.output(), &StageOutput::Pipe);
    }

    #[test]
    fn command_line_quotes_spaces() {
        let spec = StageSpec::new("sh").args(["-c", "exit 3"]);
        assert_eq!(spec.command_line(), "sh -c 'exit 3'");
    }
}
