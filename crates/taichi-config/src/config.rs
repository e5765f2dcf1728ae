//! Configuration keys, defaults and the loaded configuration value

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

const DEFAULT_SOURCE_URL: &str = "https://app.kookoo.top";

const DEFAULT_DOCKER_DOWNLOAD_URL: &str =
    "https://download.docker.com/linux/static/stable/x86_64/docker-24.0.7.tgz";

const DEFAULT_DOCKER_SERVICE_CONFIG: &str = "[Unit]
Description=Docker Application Container Engine
Documentation=https://docs.docker.com
After=network-online.target firewalld.service
Wants=network-online.target
[Service]
Type=notify
ExecStart=/usr/bin/dockerd
ExecReload=/bin/kill -s HUP $MAINPID
LimitNOFILE=infinity
LimitNPROC=infinity
LimitCORE=infinity
TimeoutStartSec=0
Delegate=yes
KillMode=process
Restart=on-failure
StartLimitBurst=3
StartLimitInterval=60s
[Install]
WantedBy=multi-user.target
";

const DEFAULT_GET_DOCKER_SHELL_COMMAND: &str =
    "curl -fsSL https://get.docker.com -o get-docker.sh && sh get-docker.sh";

/// The keys every loaded configuration is guaranteed to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKey {
    /// Base URL of the application catalogue
    SourceUrl,
    /// Static Docker tarball download URL
    DockerDownloadUrl,
    /// systemd unit written when installing Docker from the tarball
    DockerServiceConfig,
    /// One-line Docker install command
    GetDockerShellCommand,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::SourceUrl,
        ConfigKey::DockerDownloadUrl,
        ConfigKey::DockerServiceConfig,
        ConfigKey::GetDockerShellCommand,
    ];

    /// Key name as stored in the JSON file
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::SourceUrl => "source_url",
            ConfigKey::DockerDownloadUrl => "docker_download_url",
            ConfigKey::DockerServiceConfig => "docker_service_config",
            ConfigKey::GetDockerShellCommand => "get_docker_shell_command",
        }
    }

    /// Compiled-in default value
    pub fn default_value(self) -> &'static str {
        match self {
            ConfigKey::SourceUrl => DEFAULT_SOURCE_URL,
            ConfigKey::DockerDownloadUrl => DEFAULT_DOCKER_DOWNLOAD_URL,
            ConfigKey::DockerServiceConfig => DEFAULT_DOCKER_SERVICE_CONFIG,
            ConfigKey::GetDockerShellCommand => DEFAULT_GET_DOCKER_SHELL_COMMAND,
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loaded, completed configuration. Immutable once built.
///
/// Unknown keys found in the file are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Configuration {
    values: Map<String, Value>,
}

impl Default for Configuration {
    fn default() -> Self {
        let values = ConfigKey::ALL
            .iter()
            .map(|key| {
                (
                    key.as_str().to_string(),
                    Value::String(key.default_value().to_string()),
                )
            })
            .collect();
        Self { values }
    }
}

impl Configuration {
    /// Complete a parsed mapping with defaults for missing keys.
    ///
    /// Returns the configuration and the keys that had to be filled in. A
    /// required key holding a non-string value counts as missing.
    pub(crate) fn complete(mut values: Map<String, Value>) -> (Self, Vec<ConfigKey>) {
        let mut missing = Vec::new();
        for key in ConfigKey::ALL {
            let present = values.get(key.as_str()).is_some_and(Value::is_string);
            if !present {
                values.insert(
                    key.as_str().to_string(),
                    Value::String(key.default_value().to_string()),
                );
                missing.push(key);
            }
        }
        (Self { values }, missing)
    }

    /// Value of a required key
    pub fn get(&self, key: ConfigKey) -> &str {
        self.values
            .get(key.as_str())
            .and_then(Value::as_str)
            .unwrap_or_else(|| key.default_value())
    }

    /// Any value in the file, including keys this process does not use
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn source_url(&self) -> &str {
        self.get(ConfigKey::SourceUrl)
    }

    pub fn docker_download_url(&self) -> &str {
        self.get(ConfigKey::DockerDownloadUrl)
    }

    pub fn docker_service_config(&self) -> &str {
        self.get(ConfigKey::DockerServiceConfig)
    }

    pub fn get_docker_shell_command(&self) -> &str {
        self.get(ConfigKey::GetDockerShellCommand)
    }

    /// Shell commands that install Docker from the static tarball and
    /// register it as a systemd service.
    pub fn install_docker_commands(&self) -> Vec<String> {
        let steps = [
            "rm -rf /usr/bin/docker*".to_string(),
            "rm -rf /usr/bin/runc".to_string(),
            "rm -rf /usr/bin/ctr".to_string(),
            "rm -rf /usr/bin/containerd*".to_string(),
            "rm -rf /etc/systemd/system/docker*".to_string(),
            "rm -rf /var/lib/docker*".to_string(),
            "rm -rf /var/run/docker.sock".to_string(),
            format!("curl -o docker.tgz {}", self.docker_download_url()),
            "tar xzvf docker.tgz".to_string(),
            "cp docker/* /usr/bin/".to_string(),
            "rm -rf docker".to_string(),
            format!(
                "echo \"{}\" > /etc/systemd/system/docker.service",
                self.docker_service_config()
            ),
            "chmod +x /etc/systemd/system/docker.service".to_string(),
            "systemctl daemon-reload".to_string(),
            "systemctl enable --now docker.service".to_string(),
        ];
        vec![steps.join(" && ")]
    }

    /// Serialize to the on-disk JSON format
    pub(crate) fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_has_every_key() {
        let config = Configuration::default();
        for key in ConfigKey::ALL {
            assert_eq!(config.get(key), key.default_value());
        }
    }

    #[test]
    fn complete_keeps_present_values_and_unknown_keys() {
        let parsed = json!({
            "source_url": "https://mirror.example",
            "theme": "dark",
        });
        let Value::Object(map) = parsed else {
            unreachable!()
        };

        let (config, missing) = Configuration::complete(map);

        assert_eq!(config.source_url(), "https://mirror.example");
        assert_eq!(config.raw("theme"), Some(&json!("dark")));
        assert_eq!(
            missing,
            vec![
                ConfigKey::DockerDownloadUrl,
                ConfigKey::DockerServiceConfig,
                ConfigKey::GetDockerShellCommand
            ]
        );
    }

    #[test]
    fn non_string_required_value_counts_as_missing() {
        let Value::Object(map) = json!({ "source_url": 42 }) else {
            unreachable!()
        };
        let (config, missing) = Configuration::complete(map);
        assert!(missing.contains(&ConfigKey::SourceUrl));
        assert_eq!(config.source_url(), ConfigKey::SourceUrl.default_value());
    }

    #[test]
    fn install_commands_use_configured_url() {
        let Value::Object(map) = json!({ "docker_download_url": "https://mirror/docker.tgz" })
        else {
            unreachable!()
        };
        let (config, _) = Configuration::complete(map);
        let commands = config.install_docker_commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("curl -o docker.tgz https://mirror/docker.tgz"));
        assert!(commands[0].contains("ExecStart=/usr/bin/dockerd"));
        assert!(commands[0].ends_with("systemctl enable --now docker.service"));
    }

    #[test]
    fn serializes_as_flat_object() {
        let value = serde_json::to_value(Configuration::default()).unwrap();
        assert_eq!(value["source_url"], DEFAULT_SOURCE_URL);
        assert_eq!(value.as_object().unwrap().len(), 4);
    }
}
