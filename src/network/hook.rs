//! Before/after actions run around an executable replacement

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Hook errors
#[derive(Error, Debug)]
pub enum HookError {
    #[error("Failed to start action `{action}`: {source}")]
    Spawn {
        action: String,
        source: std::io::Error,
    },

    #[error("Action `{action}` exited with {status}: {output}")]
    Failed {
        action: String,
        status: std::process::ExitStatus,
        output: String,
    },
}

pub type HookResult<T> = Result<T, HookError>;

/// What a hook is told about the package being replaced
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub name: &'a str,
    /// Digest of the uploaded executable
    pub signature: &'a [u8],
    pub executable: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

/// Run an action through the shell and return its stdout followed by its stderr.
///
/// A missing or blank action does nothing and yields empty output.
pub async fn run_action(action: Option<&str>, ctx: HookContext<'_>) -> HookResult<String> {
    let Some(action) = action.map(str::trim).filter(|a| !a.is_empty()) else {
        return Ok(String::new());
    };

    tracing::debug!("Running action for `{}`: {}", ctx.name, action);

    let output = Command::new("sh")
        .arg("-c")
        .arg(action)
        .env("PACKAGE_NAME", ctx.name)
        .env("PACKAGE_HASH", hex::encode(ctx.signature))
        .env("PACKAGE_PATH", ctx.executable)
        .envs(ctx.env)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| HookError::Spawn {
            action: action.to_string(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(HookError::Failed {
            action: action.to_string(),
            status: output.status,
            output: combined,
        });
    }

    Ok(combined)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn context<'a>(env: &'a BTreeMap<String, String>) -> HookContext<'a> {
        HookContext {
            name: "foo",
            signature: &[0xab, 0xcd],
            executable: Path::new("/srv/foo"),
            env,
        }
    }

    #[tokio::test]
    async fn test_empty_action() {
        let env = BTreeMap::new();
        assert_eq!(run_action(None, context(&env)).await.unwrap(), "");
        assert_eq!(run_action(Some("  "), context(&env)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_action_sees_package_environment() {
        let mut env = BTreeMap::new();
        env.insert("STAGE".to_string(), "prod".to_string());

        let output = run_action(
            Some("echo $PACKAGE_NAME $PACKAGE_HASH $PACKAGE_PATH $STAGE"),
            context(&env),
        )
        .await
        .unwrap();
        assert_eq!(output, "foo abcd /srv/foo prod\n");
    }

    #[tokio::test]
    async fn test_output_combines_streams() {
        let env = BTreeMap::new();
        let output = run_action(Some("echo out; echo err >&2"), context(&env))
            .await
            .unwrap();
        assert_eq!(output, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_failing_action() {
        let env = BTreeMap::new();
        let result = run_action(Some("echo stopping; exit 3"), context(&env)).await;
        match result {
            Err(HookError::Failed { output, status, .. }) => {
                assert_eq!(output, "stopping\n");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
