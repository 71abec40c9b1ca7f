//! Draft generation for each pipeline stage.
//!
//! The model is opaque: stage owners hand a [`GenerationRequest`] to a
//! [`Generator`] and get text back. [`CommandGenerator`] runs a model CLI in
//! `--print` mode with the prompt on stdin.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::debug;

use crate::artifact::StageKind;

/// Default timeout for one generation call.
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 600;

pub const REQUIREMENTS_PROMPT: &str = r#"You are a requirements analyst.

Turn the project brief below into a requirements document with these sections:
- Goals
- Functional requirements (numbered)
- Non-functional requirements
- Out of scope
- Open questions

Output Markdown only."#;

pub const PLANNING_PROMPT: &str = r#"You are a software architect.

Using the approved requirements below, write a project plan with:
- Architecture overview (components and how they interact)
- Technology choices with a one-line rationale each
- Milestones in delivery order
- Risks

Output Markdown only."#;

pub const STORY_PROMPT: &str = r#"You are writing one user story from an approved project plan.

Write the story named below with:
- A title on the first line as a Markdown heading
- "As a ..., I want ..., so that ..."
- Acceptance criteria as a checklist
- Notes on dependencies on other stories

Output Markdown only."#;

pub const CODING_PROMPT: &str = r#"You are preparing an implementation prompt for a coding agent.

From the story and project context below, write a self-contained prompt that
tells the agent exactly what to build, which constraints apply, and how the
result will be checked. Respect the stated preferences where present.

Output the prompt text only."#;

/// One call to the model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub project_id: String,
    pub stage: StageKind,
    pub scope: Option<String>,
    pub prompt: String,
}

impl GenerationRequest {
    /// Build a request whose prompt is the stage's instructions followed by
    /// `input`.
    pub fn for_stage(project_id: &str, stage: StageKind, scope: Option<&str>, input: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            stage,
            scope: scope.map(str::to_string),
            prompt: build_prompt(stage, scope, input),
        }
    }
}

/// Produces draft text for a stage.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Stage instructions for the model.
pub fn system_prompt(stage: StageKind) -> &'static str {
    match stage {
        StageKind::RequirementsAnalysis => REQUIREMENTS_PROMPT,
        StageKind::ProjectPlanning => PLANNING_PROMPT,
        StageKind::StoryGeneration => STORY_PROMPT,
        StageKind::PromptGeneration => CODING_PROMPT,
    }
}

pub fn build_prompt(stage: StageKind, scope: Option<&str>, input: &str) -> String {
    let heading = match (stage, scope) {
        (StageKind::RequirementsAnalysis, _) => "## Project Brief".to_string(),
        (StageKind::ProjectPlanning, _) => "## Approved Requirements".to_string(),
        (StageKind::StoryGeneration, Some(story)) => format!("## Story {}", story),
        (StageKind::PromptGeneration, Some(story)) => format!("## Context for {}", story),
        (_, None) => "## Input".to_string(),
    };
    format!("{}\n\n{}\n\n{}", system_prompt(stage), heading, input)
}

/// Settings for [`CommandGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub command: String,
    /// Extra arguments placed before `--print`.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
            working_dir: None,
        }
    }
}

impl GeneratorConfig {
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

/// Runs a model CLI as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandGenerator {
    config: GeneratorConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    async fn run(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args).arg("--print");

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.config.command))?;

        let stdin = child.stdin.take().context("Failed to get stdin")?;
        let mut stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;

        // The prompt write runs under the timeout too: a child that never
        // reads stdin leaves a large write parked on a full pipe.
        let collect = async {
            let mut out = String::new();
            let mut err = String::new();
            let (written, read_out, read_err) = tokio::join!(
                write_prompt(stdin, prompt),
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err)
            );
            written?;
            read_out.context("Failed to read stdout")?;
            read_err.context("Failed to read stderr")?;
            let status = child.wait().await.context("Failed to wait for process")?;
            Ok::<_, anyhow::Error>((status, out, err))
        };

        let (status, output, errors) = tokio::time::timeout(self.config.timeout, collect)
            .await
            .with_context(|| {
                format!(
                    "Generation timed out after {}s",
                    self.config.timeout.as_secs()
                )
            })??;

        if !status.success() {
            bail!(
                "'{}' exited with code {}: {}",
                self.config.command,
                status.code().unwrap_or(-1),
                errors.trim()
            );
        }

        Ok(output)
    }
}

/// Writes the prompt and closes stdin. A child that exits without reading
/// its input closes the pipe early; its exit status reports the failure.
async fn write_prompt(mut stdin: ChildStdin, prompt: &str) -> Result<()> {
    match stdin.write_all(prompt.as_bytes()).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Generator closed stdin before reading the whole prompt");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to write prompt to stdin"),
    }
    match stdin.shutdown().await {
        Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e).context("Failed to close stdin"),
        _ => Ok(()),
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            stage = %request.stage,
            project_id = %request.project_id,
            prompt_chars = request.prompt.len(),
            "Invoking generator command"
        );
        let output = self.run(&request.prompt).await?;
        let output = output.trim();
        if output.is_empty() {
            bail!("Generator returned no content for {}", request.stage);
        }
        Ok(output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_includes_instructions_and_input() {
        let prompt = build_prompt(StageKind::StoryGeneration, Some("US-3"), "plan text");
        assert!(prompt.starts_with(STORY_PROMPT));
        assert!(prompt.contains("## Story US-3"));
        assert!(prompt.ends_with("plan text"));
    }

    #[test]
    fn test_each_stage_has_its_own_prompt() {
        let prompts: std::collections::HashSet<_> =
            StageKind::ALL.iter().map(|s| system_prompt(*s)).collect();
        assert_eq!(prompts.len(), 4);
    }

    #[test]
    fn test_request_for_stage() {
        let request =
            GenerationRequest::for_stage("p1", StageKind::RequirementsAnalysis, None, "a todo app");
        assert_eq!(request.project_id, "p1");
        assert!(request.prompt.contains("## Project Brief"));
        assert!(request.prompt.contains("a todo app"));
    }

    #[test]
    fn test_config_builders() {
        let config = GeneratorConfig::default()
            .with_command("my-model")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.command, "my-model");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.working_dir.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_generator_reads_stdout() {
        // `sh -c cat sh --print` echoes stdin and ignores the flag.
        let generator = CommandGenerator::new(
            GeneratorConfig::default()
                .with_command("sh")
                .with_args(&["-c", "cat", "sh"]),
        );
        let request = GenerationRequest::for_stage("p1", StageKind::ProjectPlanning, None, "reqs");
        let output = generator.generate(&request).await.unwrap();
        assert!(output.contains("## Approved Requirements"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_generator_reports_failure() {
        let generator = CommandGenerator::new(
            GeneratorConfig::default()
                .with_command("sh")
                .with_args(&["-c", "cat >/dev/null; echo boom >&2; exit 3", "sh"]),
        );
        let request = GenerationRequest::for_stage("p1", StageKind::ProjectPlanning, None, "reqs");
        let err = generator.generate(&request).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_generator_times_out() {
        let generator = CommandGenerator::new(
            GeneratorConfig::default()
                .with_command("sh")
                .with_args(&["-c", "sleep 5", "sh"])
                .with_timeout(Duration::from_millis(100)),
        );
        let request = GenerationRequest::for_stage("p1", StageKind::ProjectPlanning, None, "reqs");
        let err = generator.generate(&request).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_covers_prompt_larger_than_pipe_buffer() {
        let generator = CommandGenerator::new(
            GeneratorConfig::default()
                .with_command("sh")
                .with_args(&["-c", "sleep 30", "sh"])
                .with_timeout(Duration::from_secs(1)),
        );
        let prompt = "x".repeat(200 * 1024);

        let started = std::time::Instant::now();
        let err = generator.run(&prompt).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let generator = CommandGenerator::new(
            GeneratorConfig::default().with_command("definitely-not-a-real-binary-xyz"),
        );
        let request = GenerationRequest::for_stage("p1", StageKind::ProjectPlanning, None, "reqs");
        assert!(generator.generate(&request).await.is_err());
    }
}
