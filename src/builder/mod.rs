//! Launch-artifact builders
//!
//! Builders turn a deployment's resolved configuration into ordered
//! process-launch argument vectors, rendered `/bin/sh` launch scripts, and
//! auxiliary command files. Each mode name maps to a builder through the
//! registry at the bottom of this module.

pub mod container;
pub mod platform;
pub mod stream;

pub use container::ContainerCommandBuilder;
pub use platform::PlatformCommandBuilder;
pub use stream::{CommanderCommandsBuilder, SequencerCommandsBuilder, StreamFileBuilder};

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use crate::deployment::Deployment;
use crate::document::DocumentError;
use crate::properties::{PropertyError, PropertyStore};
use crate::runner::RunContext;

/// Mode name for the platform JVM builder
pub const PLATFORM_JVM_MODE: &str = "platform-jvm";

/// Mode name for the container builder
pub const DOCKER_CONTAINER_MODE: &str = "docker-container";

/// Errors raised while assembling, emitting, or executing a command
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("text admin port {port} must be a positive integer")]
    NonPositiveTextAdminPort { port: i64 },

    #[error("text admin port was not specified (must be a positive integer)")]
    MissingTextAdminPort,

    #[error("'{name}' property must be defined for a platform application")]
    MissingApplicationId { name: &'static str },

    #[error("application id '{value}' must be an integer in (0, 25]")]
    InvalidApplicationId { value: String },

    #[error("no container image configured or supplied by version info")]
    MissingContainerImage,

    #[error("no multicast location codes for data center '{data_center}'")]
    UnknownDataCenter { data_center: String },

    #[error("no multicast environment code for environment '{environment}'")]
    UnknownEnvironment { environment: String },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Properties(#[from] PropertyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A builder invoked during deployment creation.
///
/// `seed_properties` runs at construction time, before any configuration
/// is resolved; `emit` runs during `create()`, after the output tree has
/// been copied.
pub trait Builder {
    /// Seed derived properties into the deployment's store
    fn seed_properties(&self, _properties: &mut PropertyStore) -> Result<(), BuildError> {
        Ok(())
    }

    /// Write this builder's artifacts under the deployment's output tree
    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError>;
}

/// A builder that produces an executable command line.
///
/// `assemble` returns a fresh `CommandLine` on every call; token order is
/// part of the public contract.
pub trait CommandBuilder: Builder {
    /// Executable prefix, itself shell-split (e.g. "docker run")
    fn executable(&self) -> &str;

    /// Assemble the full command line for this deployment
    fn assemble(&self, deployment: &Deployment) -> Result<CommandLine, BuildError>;

    /// Launch the assembled command and report the child's exit status
    fn execute(&self, deployment: &Deployment, run: &RunContext) -> Result<ExitStatus, BuildError>;
}

/// Ordered argument accumulator.
///
/// Every pushed string is shell-word tokenized and each non-empty token
/// appended, so one push may contribute zero, one, or several tokens.
#[derive(Debug, Clone, Default)]
pub struct ArgumentList {
    tokens: Vec<String>,
}

impl ArgumentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize `text` and append its non-empty tokens
    pub fn push(&mut self, text: impl AsRef<str>) -> &mut Self {
        self.tokens.extend(
            split_shell_words(text.as_ref())
                .into_iter()
                .filter(|token| !token.is_empty()),
        );
        self
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

/// An executable plus its arguments, in exact launch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    /// Combine a shell-split executable prefix with accumulated arguments
    pub fn new(executable: &str, arguments: ArgumentList) -> Self {
        let mut tokens = split_shell_words(executable);
        tokens.extend(arguments.into_tokens());
        Self { tokens }
    }

    /// All tokens, executable first
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Append extra trailing tokens (image references, script paths)
    pub fn with_trailing(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        self.tokens.extend(extra);
        self
    }

    /// The command rendered for a `/bin/sh` script, with tokens containing
    /// shell metacharacters single-quoted
    pub fn shell_rendered(&self) -> String {
        self.tokens
            .iter()
            .map(|token| shell_quote(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Write `scripts/<filename>` under the deployment output tree: shebang,
/// any preamble lines, an echo of the command, then the command itself.
/// The user-executable bit is set on the result.
pub(crate) fn write_start_script(
    deployment: &Deployment,
    filename: &str,
    command: &CommandLine,
    preamble: &[&str],
) -> Result<PathBuf, BuildError> {
    let scripts_directory = deployment.output_directory().join("scripts");
    fs::create_dir_all(&scripts_directory)?;
    let script_path = scripts_directory.join(filename);

    let rendered = command.shell_rendered();
    let mut file = fs::File::create(&script_path)?;
    writeln!(file, "#!/bin/sh")?;
    for line in preamble {
        writeln!(file, "{}", line)?;
    }
    writeln!(file, "echo {}", shell_quote(&rendered))?;
    writeln!(file, "{}", rendered)?;
    drop(file);

    let mut permissions = fs::metadata(&script_path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o100);
    fs::set_permissions(&script_path, permissions)?;
    Ok(script_path)
}

/// Launch a command line from an explicit working directory and report
/// the child's exit status. No retries; failures propagate.
pub(crate) fn spawn_command(
    command: &CommandLine,
    working_directory: &std::path::Path,
) -> Result<ExitStatus, BuildError> {
    let (program, args) = command
        .tokens()
        .split_first()
        .ok_or_else(|| BuildError::Io(std::io::Error::other("empty command line")))?;
    tracing::info!(command = %command, directory = %working_directory.display(), "running");
    let status = std::process::Command::new(program)
        .args(args)
        .current_dir(working_directory)
        .status()?;
    Ok(status)
}

/// Split a string into shell words: whitespace separates, single and
/// double quotes group, backslash escapes the next character outside
/// single quotes.
pub(crate) fn split_shell_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '"' => {
                in_word = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(inner),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Quote one token for `/bin/sh` when it carries shell metacharacters
pub(crate) fn shell_quote(token: &str) -> String {
    const PLAIN: &str = "-_./:=+,@%";
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || PLAIN.contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// Resolve a mode name to its command builder
pub fn command_builder_for_mode(mode: &str) -> Option<Box<dyn CommandBuilder>> {
    match mode {
        PLATFORM_JVM_MODE => Some(Box::new(PlatformCommandBuilder::new())),
        DOCKER_CONTAINER_MODE => Some(Box::new(ContainerCommandBuilder::new())),
        _ => None,
    }
}

/// Resolve a mode name to a deployment builder, including the command-file
/// builders that never execute anything
pub fn builder_for_mode(mode: &str) -> Option<Box<dyn Builder>> {
    match mode {
        PLATFORM_JVM_MODE => Some(Box::new(PlatformCommandBuilder::new())),
        DOCKER_CONTAINER_MODE => Some(Box::new(ContainerCommandBuilder::new())),
        "stream-file" => Some(Box::new(StreamFileBuilder::new())),
        "sequencer-commands" => Some(Box::new(SequencerCommandsBuilder::default())),
        "commander-commands" => Some(Box::new(CommanderCommandsBuilder::default())),
        _ => None,
    }
}

/// Mode names accepted by the command registry
pub fn known_command_modes() -> &'static [&'static str] {
    &[PLATFORM_JVM_MODE, DOCKER_CONTAINER_MODE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(split_shell_words("docker run"), vec!["docker", "run"]);
        assert_eq!(split_shell_words("  spaced   out  "), vec!["spaced", "out"]);
        assert_eq!(split_shell_words(""), Vec::<String>::new());
    }

    #[test]
    fn test_split_quoted_words() {
        assert_eq!(split_shell_words(r#"-cp "libs/*""#), vec!["-cp", "libs/*"]);
        assert_eq!(
            split_shell_words("echo 'a b' c"),
            vec!["echo", "a b", "c"]
        );
    }

    #[test]
    fn test_split_escapes() {
        assert_eq!(split_shell_words(r"a\ b"), vec!["a b"]);
        assert_eq!(split_shell_words(r#""a \"b\"""#), vec![r#"a "b""#]);
    }

    #[test]
    fn test_push_splits_and_drops_empty() {
        let mut arguments = ArgumentList::new();
        arguments.push("--hostname host.example.com");
        arguments.push("");
        arguments.push("   ");
        arguments.push("-Xms1g");

        assert_eq!(arguments.tokens(), &["--hostname", "host.example.com", "-Xms1g"]);
    }

    #[test]
    fn test_command_line_order() {
        let mut arguments = ArgumentList::new();
        arguments.push("--detach");
        arguments.push("--publish 80");
        let command = CommandLine::new("docker run", arguments);

        assert_eq!(
            command.tokens(),
            &["docker", "run", "--detach", "--publish", "80"]
        );
        assert_eq!(command.to_string(), "docker run --detach --publish 80");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("-Xms1g"), "-Xms1g");
        assert_eq!(shell_quote("libs/*"), "'libs/*'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_registry_modes() {
        assert!(command_builder_for_mode(PLATFORM_JVM_MODE).is_some());
        assert!(command_builder_for_mode(DOCKER_CONTAINER_MODE).is_some());
        assert!(command_builder_for_mode("sequencer-commands").is_none());
        assert!(builder_for_mode("sequencer-commands").is_some());
        assert!(builder_for_mode("unknown").is_none());
    }
}
