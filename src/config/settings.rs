use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listener, per-connection sessions and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the endpoint the listener binds to and how accepted sockets and
/// the runtime are tuned.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    /// Worker threads for the runtime; `None` keeps tokio's default.
    pub worker_threads: Option<usize>,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration settings applied to every session.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub on_malformed: MalformedPolicy,
}

/// What a session does with an inbound payload that fails to decode.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log the payload and keep the connection open without replying.
    #[default]
    Drop,
    /// Close the connection with an invalid-payload close code.
    Close,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub session: Option<PartialSessionSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub nodelay: Option<bool>,
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub on_malformed: Option<MalformedPolicy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let session = self.session.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                nodelay: server.nodelay.unwrap_or(default.server.nodelay),
                worker_threads: server.worker_threads.or(default.server.worker_threads),
            },
            session: SessionSettings {
                on_malformed: session
                    .on_malformed
                    .unwrap_or(default.session.on_malformed),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// The listener binds every interface on port 8080, the endpoint clients
/// reach as `ws://127.0.0.1:8080`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8080,
                nodelay: true,
                worker_threads: None,
            },
            session: SessionSettings {
                on_malformed: MalformedPolicy::Drop,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
