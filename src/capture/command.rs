//! External command capturer
//!
//! Runs a configured program once per subject. The request is passed through
//! `STORYSHOT_*` environment variables; the program prints a JSON outcome
//! such as `{"status":"failed","diffPixels":120,"diffPercent":0.4}` as the
//! last line of its stdout, optionally with an `error` message.

use super::{CaptureError, CaptureOutcome, CaptureRequest, Capturer};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Capturer backed by an external program
#[derive(Debug, Clone)]
pub struct CommandCapturer {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandCapturer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Extra environment passed to every invocation
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(&self, request: &CaptureRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("STORYSHOT_SUBJECT_KEY", &request.subject.key)
            .env("STORYSHOT_TITLE", &request.subject.title)
            .env("STORYSHOT_NAME", &request.subject.name)
            .env("STORYSHOT_GENERATED_ID", &request.generated_id)
            .env("STORYSHOT_BASELINE_PATH", &request.targets.baseline)
            .env("STORYSHOT_ACTUAL_PATH", &request.targets.actual)
            .env("STORYSHOT_DIFF_PATH", &request.targets.diff)
            .env(
                "STORYSHOT_UPDATE_BASELINES",
                if request.update_baselines { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(browser) = &request.browser {
            cmd.env("STORYSHOT_BROWSER", browser);
        }
        if let Some(viewport) = &request.viewport {
            cmd.env("STORYSHOT_VIEWPORT", viewport);
        }
        cmd
    }
}

/// Parse the last non-empty stdout line as an outcome
fn parse_outcome(stdout: &str) -> Result<CaptureOutcome, CaptureError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CaptureError::InvalidOutput("no output".to_string()))?;

    serde_json::from_str(line).map_err(|e| CaptureError::InvalidOutput(format!("{}: {}", e, line)))
}

#[async_trait]
impl Capturer for CommandCapturer {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CaptureError> {
        let child = self.command(request).spawn().map_err(|source| CaptureError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| CaptureError::Timeout(timeout.as_millis() as u64))??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CaptureError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        parse_outcome(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureTargets;
    use crate::catalog::Subject;
    use crate::index::ResultStatus;
    use std::path::PathBuf;

    fn request(key: &str) -> CaptureRequest {
        CaptureRequest {
            subject: Subject::new(key, "A", "One"),
            generated_id: "id-1".to_string(),
            targets: CaptureTargets {
                baseline: PathBuf::from("/tmp/s/id-1.png"),
                actual: PathBuf::from("/tmp/r/id-1.png"),
                diff: PathBuf::from("/tmp/r/id-1.diff.png"),
            },
            browser: Some("chromium".to_string()),
            viewport: None,
            update_baselines: false,
        }
    }

    #[test]
    fn test_parse_outcome_uses_last_line() {
        let stdout = "launching browser\n{\"status\":\"passed\"}\n\n";
        assert_eq!(parse_outcome(stdout).unwrap(), CaptureOutcome::passed());
    }

    #[test]
    fn test_parse_outcome_rejects_garbage() {
        assert!(matches!(parse_outcome("done"), Err(CaptureError::InvalidOutput(_))));
        assert!(matches!(parse_outcome(""), Err(CaptureError::InvalidOutput(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_is_passed_through_env() {
        let script = r#"
            if [ "$STORYSHOT_SUBJECT_KEY" = "a--two" ] && [ "$STORYSHOT_BROWSER" = "chromium" ]; then
                echo '{"status":"failed","diffPixels":120}'
            else
                echo '{"status":"passed"}'
            fi
        "#;
        let capturer = CommandCapturer::new("sh").args(["-c", script]);

        let outcome = capturer.capture(&request("a--two")).await.unwrap();
        assert_eq!(outcome.status, ResultStatus::Failed);
        assert_eq!(outcome.diff_pixels, Some(120));

        let outcome = capturer.capture(&request("a--one")).await.unwrap();
        assert_eq!(outcome.status, ResultStatus::Passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reported_error_is_kept() {
        let capturer = CommandCapturer::new("sh").args([
            "-c",
            r#"echo '{"status":"failed","error":"navigation timeout"}'"#,
        ]);

        let outcome = capturer.capture(&request("a--one")).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::with_status(ResultStatus::Failed).error("navigation timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let capturer = CommandCapturer::new("sh").args(["-c", "echo boom >&2; exit 3"]);

        match capturer.capture(&request("a--one")).await {
            Err(CaptureError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let capturer = CommandCapturer::new("storyshot-no-such-capture-program");
        let err = capturer.capture(&request("a--one")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let capturer = CommandCapturer::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));

        let err = capturer.capture(&request("a--one")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Timeout(100)));
    }
}
