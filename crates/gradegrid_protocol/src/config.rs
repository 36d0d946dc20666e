//! Line-oriented configuration files.
//!
//! Both binaries read a `key = value` file: one assignment per line, `#`
//! starts a comment, blank lines are skipped. Unknown or missing keys are
//! rejected so typos fail at startup instead of at dispatch time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ProtocolError, Result};

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_RESULTS_DIR: &str = "./results";
const DEFAULT_WORKER_TEST_DIR: &str = "./tests";
const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// Commander-side configuration.
#[derive(Debug, Clone)]
pub struct CommanderConfig {
    /// Base port `P`; the fabric occupies `P..=P+4`.
    pub base_port: u16,
    pub bind_host: String,
    /// Directory holding one subdirectory per student submission.
    pub test_dir: PathBuf,
    /// Shared grading-harness directory, served under the `common` key.
    pub common_dir: PathBuf,
    /// Wall-clock budget (seconds) a worker gets per assignment.
    pub test_timeout: u32,
    /// Heartbeat period and give-up-on-worker deadline (seconds).
    pub client_timeout: u32,
    /// File listing one shell command per line, in execution order.
    pub command_file: PathBuf,
    /// Where result transcripts are written.
    pub results_dir: PathBuf,
}

/// Worker-side configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub remote_ip: String,
    /// The commander's base port `P`.
    pub remote_port: u16,
    /// Root under which per-assignment working directories are created.
    pub test_dir: PathBuf,
    /// HTTP endpoint that echoes our public IP back as plain text.
    pub ip_echo_url: String,
}

impl CommanderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut fields = parse_kv_file(path)?;
        let config = Self {
            base_port: parse_u16(required(&mut fields, "base_port")?, "base_port")?,
            bind_host: fields
                .remove("bind_host")
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            test_dir: PathBuf::from(required(&mut fields, "test_dir")?),
            common_dir: PathBuf::from(required(&mut fields, "common_dir")?),
            test_timeout: parse_u32(required(&mut fields, "test_timeout")?, "test_timeout")?,
            client_timeout: parse_u32(required(&mut fields, "client_timeout")?, "client_timeout")?,
            command_file: PathBuf::from(required(&mut fields, "command_file")?),
            results_dir: fields
                .remove("results_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_DIR)),
        };
        reject_unknown(fields)?;
        Ok(config)
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut fields = parse_kv_file(path)?;
        let config = Self {
            remote_ip: required(&mut fields, "remote_ip")?,
            remote_port: parse_u16(required(&mut fields, "remote_port")?, "remote_port")?,
            test_dir: fields
                .remove("test_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_TEST_DIR)),
            ip_echo_url: fields
                .remove("ip_echo_url")
                .unwrap_or_else(|| DEFAULT_IP_ECHO_URL.to_string()),
        };
        reject_unknown(fields)?;
        Ok(config)
    }
}

fn parse_kv_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut fields = HashMap::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProtocolError::Protocol(format!(
                "config line {} is not 'key = value': {line}",
                number + 1
            )));
        };
        let key = key.trim().to_string();
        if fields
            .insert(key.clone(), value.trim().to_string())
            .is_some()
        {
            return Err(ProtocolError::Protocol(format!(
                "config key '{key}' appears twice"
            )));
        }
    }
    Ok(fields)
}

fn required(fields: &mut HashMap<String, String>, key: &str) -> Result<String> {
    fields
        .remove(key)
        .ok_or_else(|| ProtocolError::Protocol(format!("config is missing required key '{key}'")))
}

fn reject_unknown(fields: HashMap<String, String>) -> Result<()> {
    if let Some(key) = fields.into_keys().next() {
        return Err(ProtocolError::Protocol(format!(
            "config has unknown key '{key}'"
        )));
    }
    Ok(())
}

fn parse_u16(value: String, key: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| ProtocolError::Protocol(format!("config key '{key}' is not a port: {value}")))
}

fn parse_u32(value: String, key: &str) -> Result<u32> {
    value.parse().map_err(|_| {
        ProtocolError::Protocol(format!("config key '{key}' is not an integer: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn commander_config_parses_with_defaults() {
        let file = write_config(
            "# grading cluster\n\
             base_port = 5000\n\
             test_dir = /srv/submissions\n\
             common_dir = /srv/common\n\
             test_timeout = 60\n\
             client_timeout = 5\n\
             command_file = /srv/commands.txt\n",
        );
        let config = CommanderConfig::load(file.path()).unwrap();
        assert_eq!(config.base_port, 5000);
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.results_dir, PathBuf::from("./results"));
        assert_eq!(config.client_timeout, 5);
    }

    #[test]
    fn worker_config_parses() {
        let file = write_config(
            "remote_ip = 198.51.100.7\n\
             remote_port = 5000\n\
             test_dir = ./scratch\n",
        );
        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.remote_ip, "198.51.100.7");
        assert_eq!(config.test_dir, PathBuf::from("./scratch"));
        assert_eq!(config.ip_echo_url, "https://api.ipify.org");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let file = write_config(
            "remote_ip = 1.2.3.4\nremote_port = 5000\nretry_limit = 9\n",
        );
        let err = WorkerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("unknown key"));
    }

    #[test]
    fn missing_key_is_rejected() {
        let file = write_config("base_port = 5000\n");
        let err = CommanderConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("missing required key"));
    }

    #[test]
    fn bad_port_is_rejected() {
        let file = write_config("remote_ip = 1.2.3.4\nremote_port = sixty\n");
        assert!(WorkerConfig::load(file.path()).is_err());
    }
}
