//! Build module - Produces binaries and pushes them to deploy servers
//!
//! Provides:
//! - The [`Builder`] and [`Deployer`] seams the orchestrator drives
//! - A host builder running an external compiler toolchain
//! - The task orchestrator

mod orchestrator;

pub use orchestrator::*;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;

use crate::config::BuildPackage;
use crate::network::{ClientResult, DeployClient};

/// Build errors
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Build of `{name}` exited with {status}: {output}")]
    Failed {
        name: String,
        status: ExitStatus,
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Produces the binary for one package
#[async_trait]
pub trait Builder: Send + Sync {
    /// Build `name` and return where the binary was written
    async fn build(&self, name: &str, package: &BuildPackage) -> BuildResult<PathBuf>;
}

/// Ships a built binary to its deploy target
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, name: &str, package: &BuildPackage) -> ClientResult<()>;
}

#[async_trait]
impl Deployer for DeployClient {
    async fn deploy(&self, name: &str, package: &BuildPackage) -> ClientResult<()> {
        DeployClient::deploy(self, name, package).await.map(|_| ())
    }
}

/// Source control details stamped into a build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub short_hash: Option<String>,
}

impl GitInfo {
    /// Ask git about the working directory; missing details are left empty
    pub async fn discover() -> Self {
        Self {
            branch: command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]).await,
            short_hash: command_output("git", &["rev-parse", "--verify", "--short", "HEAD"]).await,
        }
    }
}

/// Everything written into a binary's version package at link time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStamp {
    /// RFC 3339 build time
    pub time: String,
    /// `pushbuild/<toolchain version>/host/<os>/<arch>`
    pub tool: String,
    pub git: GitInfo,
}

impl BuildStamp {
    pub async fn collect(toolchain: &str) -> Self {
        let version = command_output(toolchain, &["env", "GOVERSION"])
            .await
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool: format!(
                "pushbuild/{}/host/{}/{}",
                version,
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            git: GitInfo::discover().await,
        }
    }
}

async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        tracing::debug!("{} {} failed", program, args.join(" "));
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Builds with a compiler installed on this host
#[derive(Debug, Clone)]
pub struct HostBuilder {
    toolchain: String,
}

impl HostBuilder {
    pub fn new(toolchain: impl Into<String>) -> Self {
        Self {
            toolchain: toolchain.into(),
        }
    }

    /// Arguments following `build` for package `name`
    pub fn build_args(name: &str, package: &BuildPackage, stamp: &BuildStamp) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(target) = package.verbose_package.as_deref().filter(|p| !p.is_empty()) {
            let mut ldflags = vec!["-w".to_string()];
            if let Some(version) = &package.version {
                ldflags.push(format!("-X '{}.Version={}'", target, version));
            }
            ldflags.push(format!("-X '{}.BuildStamp={}'", target, stamp.time));
            ldflags.push(format!("-X '{}.BuildTool={}'", target, stamp.tool));
            if let Some(hash) = &stamp.git.short_hash {
                let branch = stamp.git.branch.as_deref().unwrap_or_default();
                ldflags.push(format!("-X '{}.GitHash={}/{}'", target, hash, branch));
            }
            args.push(format!("-ldflags={}", ldflags.join(" ")));
        }

        args.extend(package.build_flags.iter().cloned());
        args.push("-o".to_string());
        args.push(package.binary_path(name).to_string_lossy().into_owned());
        args.push(package.package.clone());
        args
    }
}

#[async_trait]
impl Builder for HostBuilder {
    async fn build(&self, name: &str, package: &BuildPackage) -> BuildResult<PathBuf> {
        let stamp = BuildStamp::collect(&self.toolchain).await;
        let args = Self::build_args(name, package, &stamp);

        let mut command = Command::new(&self.toolchain);
        command.arg("build").args(&args).stdin(Stdio::null());
        if let Some(os) = &package.build_os {
            command.env("GOOS", os);
        }
        if let Some(arch) = &package.build_arch {
            command.env("GOARCH", arch);
        }

        tracing::debug!("Build command for `{}`: {} build {}", name, self.toolchain, args.join(" "));

        let output = command.output().await.map_err(|source| BuildError::Spawn {
            program: self.toolchain.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let text = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                stderr.into_owned()
            };
            return Err(BuildError::Failed {
                name: name.to_string(),
                status: output.status,
                output: text.trim_end().to_string(),
            });
        }

        Ok(package.binary_path(name))
    }
}
