//! Connection and launch settings. Every struct deserializes with defaults
//! for missing fields, so a config file only needs the values it changes.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_GDB_PORT: u16 = 2159;
pub const DEFAULT_QMP_PORT: u16 = 4444;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GdbConfig {
    pub host: String,
    pub port: u16,
    /// Default socket read timeout, restored after every per-call override.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Reject frames whose checksum does not match instead of trusting TCP.
    pub verify_checksums: bool,
    /// Treat replies without `$...#xx` framing as errors.
    pub strict_framing: bool,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_GDB_PORT,
            timeout: Duration::from_secs(5),
            verify_checksums: false,
            strict_framing: false,
        }
    }
}

impl GdbConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QmpConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for QmpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_QMP_PORT,
            timeout: Duration::from_secs(5),
        }
    }
}

impl QmpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub executable: PathBuf,
    /// Passed to the emulator as `-conf <path>`.
    pub config: PathBuf,
    pub working_dir: Option<PathBuf>,
    /// `pkill -f` pattern used to clear stale instances before launch.
    pub kill_pattern: String,
    #[serde(with = "duration_ms", rename = "startup_timeout_ms")]
    pub startup_timeout: Duration,
    #[serde(with = "duration_ms", rename = "poll_connect_timeout_ms")]
    pub poll_connect_timeout: Duration,
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Delay between keystrokes for `type_text` issued through the instance.
    #[serde(with = "duration_ms", rename = "key_delay_ms")]
    pub key_delay: Duration,
    pub gdb: GdbConfig,
    pub qmp: QmpConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./src/dosbox-x"),
            config: PathBuf::from("tests/integration/test.conf"),
            working_dir: None,
            kill_pattern: "dosbox-x".to_string(),
            startup_timeout: Duration::from_secs(5),
            poll_connect_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
            key_delay: Duration::from_millis(150),
            gdb: GdbConfig::default(),
            qmp: QmpConfig::default(),
        }
    }
}

impl InstanceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading instance config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing instance config {}", path.display()))
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = config.into();
        self
    }

    pub fn with_ports(mut self, gdb_port: u16, qmp_port: u16) -> Self {
        self.gdb.port = gdb_port;
        self.qmp.port = qmp_port;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}
