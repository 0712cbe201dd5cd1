//! Configuration module
//!
//! Handles loading and saving the build client and deploy server configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{DEFAULT_PORT, DEFAULT_SERVER_NAME};

/// Environment variable selecting a config file suffix
pub const CONFIG_ENV_VAR: &str = "PUSHBUILD_ENV";

/// Base name of the client configuration file
pub const CLIENT_CONFIG_FILE: &str = ".pushbuild";

/// Default server configuration file
pub const SERVER_CONFIG_FILE: &str = "server.toml";

/// Permission used for replaced executables when none is configured
pub const DEFAULT_FILE_MODE: u32 = 0o755;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Semantic version stamped into builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Record a successful build
    pub fn bump_patch(&mut self) {
        self.patch += 1;
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Mutual TLS material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA bundle both sides validate the peer against
    pub ca: PathBuf,
    /// Certificate chain presented to the peer
    pub cert: PathBuf,
    /// Private key for `cert`
    pub key: PathBuf,
    /// Name the server certificate must be issued for
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

/// A package the client builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPackage {
    /// Build target handed to the toolchain
    pub package: String,
    /// Package path receiving version stamps through linker flags
    pub verbose_package: Option<String>,
    /// Extra flags appended to the build command
    #[serde(default)]
    pub build_flags: Vec<String>,
    /// Target operating system
    pub build_os: Option<String>,
    /// Target architecture
    pub build_arch: Option<String>,
    /// Output directory; the binary lands at `dest/<name>`
    #[serde(default = "default_dest")]
    pub dest: PathBuf,
    /// Deploy target (`host:port`)
    pub deploy: Option<String>,
    /// Remove the local binary after a successful deploy
    #[serde(default)]
    pub clean_after_deploy: bool,
    pub version: Option<Version>,
}

fn default_dest() -> PathBuf {
    PathBuf::from(".")
}

impl BuildPackage {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            verbose_package: None,
            build_flags: Vec::new(),
            build_os: None,
            build_arch: None,
            dest: default_dest(),
            deploy: None,
            clean_after_deploy: false,
            version: None,
        }
    }

    /// Where the build places the binary for package `name`
    pub fn binary_path(&self, name: &str) -> PathBuf {
        self.dest.join(name)
    }
}

/// Build client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Number of build workers
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Rewrite the config with bumped versions after a run
    #[serde(default)]
    pub auto_upgrade: bool,
    /// Compiler program used for host builds
    #[serde(default = "default_toolchain")]
    pub toolchain: String,
    /// Client TLS material, required only for deploys
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub packages: BTreeMap<String, BuildPackage>,
}

fn default_parallel() -> usize {
    1
}

fn default_toolchain() -> String {
    "go".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            auto_upgrade: false,
            toolchain: default_toolchain(),
            tls: None,
            packages: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_toml(path)
    }

    /// Config file selected by [`CONFIG_ENV_VAR`]
    pub fn default_path() -> PathBuf {
        let suffix = std::env::var(CONFIG_ENV_VAR).ok();
        client_config_path(suffix.as_deref())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        save_toml(self, path)
    }

    /// Worker count, never below one
    pub fn parallelism(&self) -> usize {
        self.parallel.max(1)
    }
}

/// Client config file name for an optional environment suffix
pub fn client_config_path(suffix: Option<&str>) -> PathBuf {
    match suffix.map(str::trim).filter(|s| !s.is_empty()) {
        Some(suffix) => PathBuf::from(format!("{}.{}.toml", CLIENT_CONFIG_FILE, suffix)),
        None => PathBuf::from(format!("{}.toml", CLIENT_CONFIG_FILE)),
    }
}

/// A package the server accepts uploads for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPackage {
    /// Executable replaced on upload
    pub executable: PathBuf,
    /// File mode for a newly created executable (0 means the default)
    #[serde(default)]
    pub perm: u32,
    /// Command run before the executable is replaced
    pub before_action: Option<String>,
    /// Command run after the executable is replaced
    pub after_action: Option<String>,
    /// Extra environment for the hooks
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServerPackage {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            perm: 0,
            before_action: None,
            after_action: None,
            env: BTreeMap::new(),
        }
    }

    pub fn file_mode(&self) -> u32 {
        if self.perm == 0 {
            DEFAULT_FILE_MODE
        } else {
            self.perm
        }
    }
}

/// Deploy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_address")]
    pub address: String,
    /// Size of the connection handler pool (0 means the default)
    #[serde(default)]
    pub handler: usize,
    pub tls: TlsConfig,
    #[serde(default)]
    pub packages: BTreeMap<String, ServerPackage>,
}

fn default_address() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

/// Handler pool size when none is configured
pub const DEFAULT_HANDLER_COUNT: usize = 128;

impl ServerConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_toml(path)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        save_toml(self, path)
    }

    pub fn handler_count(&self) -> usize {
        if self.handler == 0 {
            DEFAULT_HANDLER_COUNT
        } else {
            self.handler
        }
    }

    /// First server config found in the usual locations
    pub fn find_default() -> Option<PathBuf> {
        let config_paths = [
            Some(PathBuf::from(SERVER_CONFIG_FILE)),
            dirs::config_dir().map(|p| p.join("pushbuild").join(SERVER_CONFIG_FILE)),
        ];

        config_paths.into_iter().flatten().find(|path| path.exists())
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> ConfigResult<()> {
    let contents = toml::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(path, contents)?;
    Ok(())
}

fn sample_tls(prefix: &str) -> TlsConfig {
    TlsConfig {
        ca: PathBuf::from("pushbuild-root.pem"),
        cert: PathBuf::from(format!("pushbuild-{}.pem", prefix)),
        key: PathBuf::from(format!("pushbuild-{}.key", prefix)),
        server_name: default_server_name(),
    }
}

/// Generate a sample client configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let mut package = BuildPackage::new("./cmd/api");
    package.build_os = Some("linux".to_string());
    package.build_arch = Some("amd64".to_string());
    package.dest = PathBuf::from("bin");
    package.deploy = Some(format!("deploy.example.com:{}", DEFAULT_PORT));
    package.version = Some(Version::new(0, 1, 0));

    let config = BuildConfig {
        tls: Some(sample_tls("client")),
        packages: BTreeMap::from([("api".to_string(), package)]),
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

/// Generate a sample server configuration file
pub fn generate_sample_server_config() -> ConfigResult<String> {
    let mut package = ServerPackage::new("/srv/api/api");
    package.before_action = Some("systemctl stop api".to_string());
    package.after_action = Some("systemctl start api".to_string());
    package.env.insert("SERVICE".to_string(), "api".to_string());

    let config = ServerConfig {
        address: default_address(),
        handler: DEFAULT_HANDLER_COUNT,
        tls: sample_tls("server"),
        packages: BTreeMap::from([("api".to_string(), package)]),
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.parallelism(), 1);
        assert_eq!(config.toolchain, "go");
    }

    #[test]
    fn test_parallelism_floor() {
        let config = BuildConfig {
            parallel: 0,
            ..Default::default()
        };
        assert_eq!(config.parallelism(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = BuildConfig::default();
        let mut package = BuildPackage::new("./cmd/foo");
        package.version = Some(Version::new(1, 2, 3));
        config.packages.insert("foo".to_string(), package.clone());

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = BuildConfig::load(file.path()).unwrap();
        assert_eq!(loaded.packages.get("foo"), Some(&package));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = BuildConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_configs_parse() {
        let client: BuildConfig = toml::from_str(&generate_sample_config().unwrap()).unwrap();
        assert_eq!(client.packages["api"].version, Some(Version::new(0, 1, 0)));

        let server: ServerConfig =
            toml::from_str(&generate_sample_server_config().unwrap()).unwrap();
        assert_eq!(server.handler_count(), DEFAULT_HANDLER_COUNT);
        assert_eq!(server.packages["api"].env["SERVICE"], "api");
    }

    #[test]
    fn test_server_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[tls]
ca = "ca.pem"
cert = "server.pem"
key = "server.key"

[packages.foo]
executable = "/srv/foo"
perm = 0o700
"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.address, "0.0.0.0:2030");
        assert_eq!(config.handler_count(), 128);
        assert_eq!(config.tls.server_name, DEFAULT_SERVER_NAME);
        assert_eq!(config.packages["foo"].file_mode(), 0o700);
        assert_eq!(ServerPackage::new("/x").file_mode(), 0o755);
    }

    #[test]
    fn test_client_config_path_suffix() {
        assert_eq!(client_config_path(None), PathBuf::from(".pushbuild.toml"));
        assert_eq!(client_config_path(Some("")), PathBuf::from(".pushbuild.toml"));
        assert_eq!(
            client_config_path(Some("prod")),
            PathBuf::from(".pushbuild.prod.toml")
        );
    }

    #[test]
    fn test_version_bump() {
        let mut version = Version::new(1, 4, 9);
        version.bump_patch();
        assert_eq!(version.to_string(), "1.4.10");
    }
}
