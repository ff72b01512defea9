//! Python runtime manager for the external conversion and inference stacks.
//!
//! The converter and both inference engines live in Python (`tensorflow`,
//! `coremltools`, `tfcoreml`). Scripts receive a JSON document on stdin and
//! answer with a JSON document on stdout.

use crate::config::PythonConfig;
use crate::error::StripError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Managed Python subprocess runner.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path: config.venv_path.clone(),
            workspace,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Detect an available Python installation.
    pub async fn detect() -> Result<PythonInfo, StripError> {
        for cmd in ["python3", "python"] {
            let Ok(output) = Command::new(cmd).arg("--version").output().await else {
                continue;
            };
            if !output.status.success() {
                continue;
            }
            // Python 2 prints its version on stderr.
            let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if version.is_empty() {
                version = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            return Ok(PythonInfo {
                path: PathBuf::from(cmd),
                version,
                venv_path: std::env::var_os("VIRTUAL_ENV").map(PathBuf::from),
            });
        }

        Err(StripError::Python(
            "Python not found. Install Python 3 with tensorflow and coremltools.".to_string(),
        ))
    }

    /// The interpreter to launch, accounting for a configured venv.
    pub fn python_cmd(&self) -> PathBuf {
        match &self.venv_path {
            Some(venv) => {
                let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
                venv.join(bin_dir).join("python")
            }
            None => self.python_path.clone(),
        }
    }

    /// Run `script` with `input` as JSON on stdin and parse JSON from stdout.
    ///
    /// The result is the last non-empty stdout line; anything printed before
    /// it is logged and dropped. A non-zero exit becomes
    /// [`StripError::Python`] carrying stderr.
    pub async fn run_script(
        &self,
        script: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, StripError> {
        let payload = serde_json::to_vec(input)?;
        debug!(
            script_len = script.len(),
            input_bytes = payload.len(),
            "Running Python script"
        );

        let result = tokio::time::timeout(self.timeout, async {
            let mut child = Command::new(self.python_cmd())
                .args(["-c", script])
                .current_dir(&self.workspace)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| StripError::Python(format!("Failed to spawn Python: {e}")))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(StripError::Python(format!(
                    "Python script failed ({}): {}",
                    output.status,
                    stderr.trim()
                )));
            }

            parse_result(&String::from_utf8_lossy(&output.stdout))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(StripError::Timeout(format!(
                "Python script timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Check which Python packages can be imported.
    pub async fn check_packages(&self, packages: &[&str]) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for pkg in packages {
            let script = format!("import importlib; importlib.import_module('{pkg}')");
            let available = Command::new(self.python_cmd())
                .args(["-c", &script])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .is_ok_and(|s| s.success());
            results.insert(pkg.to_string(), available);
        }
        results
    }
}

/// Parse the JSON result from the last non-empty line of a script's stdout.
fn parse_result(stdout: &str) -> Result<serde_json::Value, StripError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(last) = lines.next_back() else {
        return Ok(serde_json::Value::Null);
    };
    let skipped = lines.count();
    if skipped > 0 {
        debug!(skipped, "Ignoring script stdout before the result line");
    }
    serde_json::from_str(last).map_err(|e| StripError::Python(format!("Invalid JSON output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_cmd_prefers_venv() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/usr/bin/python3.11")),
            venv_path: Some(PathBuf::from("/opt/venv")),
            timeout_secs: 5,
        };
        let runtime = PythonRuntime::from_config(&config, PathBuf::from("."));
        let expected = if cfg!(windows) {
            PathBuf::from("/opt/venv/Scripts/python")
        } else {
            PathBuf::from("/opt/venv/bin/python")
        };
        assert_eq!(runtime.python_cmd(), expected);

        let runtime = PythonRuntime::new(PathBuf::from("."));
        assert_eq!(runtime.python_cmd(), PathBuf::from("python3"));
    }

    #[tokio::test]
    async fn test_python_detect() {
        // Python may or may not be available where tests run.
        if let Ok(info) = PythonRuntime::detect().await {
            assert!(!info.version.is_empty());
        }
    }

    #[tokio::test]
    async fn test_run_script_echoes_stdin() {
        let Ok(info) = PythonRuntime::detect().await else {
            return;
        };
        let config = PythonConfig {
            python_path: Some(info.path),
            venv_path: None,
            timeout_secs: 30,
        };
        let runtime = PythonRuntime::from_config(&config, std::env::temp_dir());
        let script = "import json, sys; d = json.load(sys.stdin); print(json.dumps({'n': d['n'] + 1}))";
        let out = runtime
            .run_script(script, &serde_json::json!({"n": 41}))
            .await
            .unwrap();
        assert_eq!(out["n"], 42);
    }

    #[test]
    fn test_parse_result_takes_last_line() {
        let stdout = "Loading the TF graph...\nCore ML model generated.\n{\"ok\": true}\n\n";
        assert_eq!(parse_result(stdout).unwrap(), serde_json::json!({"ok": true}));
        assert_eq!(parse_result("  \n").unwrap(), serde_json::Value::Null);
        assert!(matches!(
            parse_result("{\"ok\": true}\ndone"),
            Err(StripError::Python(_))
        ));
    }

    #[tokio::test]
    async fn test_run_script_ignores_progress_output() {
        let Ok(info) = PythonRuntime::detect().await else {
            return;
        };
        let config = PythonConfig {
            python_path: Some(info.path),
            venv_path: None,
            timeout_secs: 30,
        };
        let runtime = PythonRuntime::from_config(&config, std::env::temp_dir());
        let script = "import json\nprint('step 1 of 2')\nprint('step 2 of 2')\nprint(json.dumps({'done': True}))";
        let out = runtime
            .run_script(script, &serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(out["done"], true);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/nonexistent/python-graphstrip")),
            venv_path: None,
            timeout_secs: 5,
        };
        let runtime = PythonRuntime::from_config(&config, std::env::temp_dir());
        let err = runtime
            .run_script("print(1)", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StripError::Python(_)));
    }
}
