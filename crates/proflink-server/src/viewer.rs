use crate::error::PoolError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Start the external viewer serving one staged profile.
///
/// The child keeps the relay's stdout/stderr so its own startup logging
/// stays visible. `kill_on_drop` is a backstop; orderly teardown signals the
/// process explicitly.
pub fn launch(bin: &str, target: &Path, port: u16, symbol_dir: &Path) -> Result<Child, PoolError> {
    let mut command = Command::new(bin);
    command
        .arg("load")
        .arg(target)
        .arg("--port")
        .arg(port.to_string())
        .arg("--symbol-dir")
        .arg(symbol_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    tracing::info!(%bin, port, target = %target.display(), "launching viewer");
    command.spawn().map_err(|source| PoolError::Launch {
        bin: bin.into(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_an_existing_binary() {
        // `true` ignores the viewer arguments and exits immediately; all we
        // check is that spawning works and the child can be reaped.
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("p.json.gz");
        std::fs::write(&target, b"x").unwrap();

        let mut child = launch("true", &target, 0, dir.path()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("p.json.gz");

        let err = launch("/nonexistent/viewer-binary", &target, 0, dir.path()).unwrap_err();
        match err {
            PoolError::Launch { bin, .. } => assert_eq!(bin, "/nonexistent/viewer-binary"),
            other => panic!("expected Launch, got {other:?}"),
        }
    }
}
