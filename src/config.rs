use {
    crate::error::SetupError,
    dotenvy::dotenv,
    serde::Deserialize,
    std::{path::PathBuf, time::Duration},
    url::Url,
};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub keyserver_url: Url,
    /// did:web domain of the notify service, used for watch-subscriptions
    #[serde(default = "default_notify_server_domain")]
    pub notify_server_domain: String,
    /// How long to wait for the response to a request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Directory for the file backend. Without it nothing is persisted.
    pub storage_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_app_resolver_scheme")]
    pub app_resolver_scheme: String,
}

impl Configuration {
    /// Reads the environment, after loading `.env` if there is one.
    pub fn new() -> Result<Configuration, SetupError> {
        load_dot_env()?;
        Ok(envy::from_env::<Configuration>()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_notify_server_domain() -> String {
    "notify.walletconnect.com".to_owned()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "WARN,notify_client=DEBUG".to_owned()
}

fn default_app_resolver_scheme() -> String {
    "https".to_owned()
}

fn load_dot_env() -> dotenvy::Result<()> {
    match dotenv() {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = envy::from_iter::<_, Configuration>(vars(&[(
            "KEYSERVER_URL",
            "https://keys.walletconnect.com",
        )]))
        .unwrap();
        assert_eq!(config.notify_server_domain, "notify.walletconnect.com");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage_path, None);
        assert_eq!(config.log_level, "WARN,notify_client=DEBUG");
        assert_eq!(config.app_resolver_scheme, "https");
    }

    #[test]
    fn keyserver_url_is_required() {
        assert!(envy::from_iter::<_, Configuration>(vars(&[])).is_err());
    }

    #[test]
    fn overrides() {
        let config = envy::from_iter::<_, Configuration>(vars(&[
            ("KEYSERVER_URL", "http://127.0.0.1:8080"),
            ("NOTIFY_SERVER_DOMAIN", "notify.example"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("STORAGE_PATH", "/var/lib/notify"),
            ("APP_RESOLVER_SCHEME", "http"),
        ]))
        .unwrap();
        assert_eq!(config.keyserver_url.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(config.notify_server_domain, "notify.example");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/notify")));
        assert_eq!(config.app_resolver_scheme, "http");
    }

    #[test]
    fn invalid_timeout() {
        assert!(envy::from_iter::<_, Configuration>(vars(&[
            ("KEYSERVER_URL", "https://keys.walletconnect.com"),
            ("REQUEST_TIMEOUT_SECS", "soon"),
        ]))
        .is_err());
    }
}
