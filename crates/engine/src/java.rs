//! Java runtime detection.

use std::time::Duration;

use apkflow_types::OutputStream;
use tracing::debug;

use crate::error::StepError;
use crate::runner::{ToolInvocation, ToolRunner};

const UNKNOWN_VERSION: &str = "Unknown";

/// Runs `<java> -version` and returns the reported version string.
///
/// The JVM prints its banner to stderr; the probe succeeds only when the
/// process exits cleanly and that banner mentions `version`.
pub async fn probe_java(runner: &dyn ToolRunner, java: &str, timeout: Option<Duration>) -> Result<String, StepError> {
    let invocation = ToolInvocation::new(java, ["-version"]).timeout(timeout);
    let mut banner: Vec<String> = Vec::new();

    let outcome = runner
        .run(&invocation, &mut |stream, line: &str| {
            if stream == OutputStream::Stderr {
                banner.push(line.to_string());
            }
        })
        .await
        .map_err(|error| StepError::JavaMissing {
            reason: error.to_string(),
        })?;

    if !outcome.completed {
        return Err(StepError::JavaMissing {
            reason: format!("'{java} -version' exited with code {}", outcome.exit_code),
        });
    }
    if !banner.iter().any(|line| line.contains("version")) {
        return Err(StepError::JavaMissing {
            reason: format!("'{java} -version' did not report a version"),
        });
    }

    let version = parse_java_version(banner.first().map(String::as_str).unwrap_or_default());
    debug!(%version, "java runtime detected");
    Ok(version)
}

/// Extracts the quoted version from the first banner line, e.g.
/// `openjdk version "17.0.2" 2022-01-18` yields `17.0.2`.
pub fn parse_java_version(first_line: &str) -> String {
    match (first_line.find('"'), first_line.rfind('"')) {
        (Some(start), Some(end)) if end > start => first_line[start + 1..end].to_string(),
        _ => UNKNOWN_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ExitOutcome, LineSink};
    use async_trait::async_trait;

    struct Banner {
        lines: Vec<&'static str>,
        exit_code: i32,
    }

    #[async_trait]
    impl ToolRunner for Banner {
        async fn run(&self, invocation: &ToolInvocation, sink: LineSink<'_>) -> Result<ExitOutcome, StepError> {
            assert_eq!(invocation.args, vec!["-version"]);
            for line in self.lines.iter().copied() {
                sink(OutputStream::Stderr, line);
            }
            Ok(ExitOutcome::from_code(self.exit_code))
        }
    }

    #[test]
    fn parses_quoted_versions() {
        assert_eq!(parse_java_version(r#"openjdk version "17.0.2" 2022-01-18"#), "17.0.2");
        assert_eq!(parse_java_version(r#"java version "1.8.0_381""#), "1.8.0_381");
        assert_eq!(parse_java_version("openjdk 21"), "Unknown");
        assert_eq!(parse_java_version(r#"only "one quote"#), "Unknown");
    }

    #[tokio::test]
    async fn probe_reads_stderr_banner() {
        let runner = Banner {
            lines: vec![
                r#"openjdk version "21.0.1" 2023-10-17"#,
                "OpenJDK Runtime Environment (build 21.0.1+12)",
            ],
            exit_code: 0,
        };
        assert_eq!(probe_java(&runner, "java", None).await.unwrap(), "21.0.1");
    }

    #[tokio::test]
    async fn probe_rejects_missing_banner_or_failure() {
        let silent = Banner {
            lines: vec![],
            exit_code: 0,
        };
        assert!(matches!(
            probe_java(&silent, "java", None).await,
            Err(StepError::JavaMissing { .. })
        ));

        let failing = Banner {
            lines: vec![r#"java version "1.8""#],
            exit_code: 1,
        };
        assert!(matches!(
            probe_java(&failing, "java", None).await,
            Err(StepError::JavaMissing { .. })
        ));
    }

    #[tokio::test]
    async fn launch_failure_means_java_missing() {
        let error = probe_java(&crate::ProcessRunner::new(), "apkflow-no-such-java", None)
            .await
            .unwrap_err();
        assert!(matches!(error, StepError::JavaMissing { .. }));
    }
}
