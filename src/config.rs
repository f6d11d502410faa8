use anyhow::{Context, Result};
use keyring::Entry;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:50505";
const KEYRING_SERVICE: &str = "ragchat_access_token";

/// Connection settings for the chat service.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    /// Routing key sent as `containerName`/`indexName`. Selects the use case on the backend.
    pub use_case: Option<String>,
    /// Where to find a bearer token: `env:VAR_NAME` or `keyring`.
    pub token_ref: Option<String>,
    pub user: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            use_case: None,
            token_ref: None,
            user: None,
        }
    }
}

impl ClientConfig {
    /// Reads `RAGCHAT_BASE_URL`, `RAGCHAT_USE_CASE`, `RAGCHAT_TOKEN_REF` and `RAGCHAT_USER`.
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let config = Self {
            base_url: read("RAGCHAT_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            use_case: read("RAGCHAT_USE_CASE").map(|v| v.to_lowercase()),
            token_ref: read("RAGCHAT_TOKEN_REF"),
            user: read("RAGCHAT_USER"),
        };
        log::debug!(
            "Loaded client config: base_url={} use_case={:?}",
            config.base_url,
            config.use_case
        );
        config
    }

    pub fn with_use_case(mut self, use_case: impl Into<String>) -> Self {
        self.use_case = Some(use_case.into().to_lowercase());
        self
    }

    /// Absolute URL for an endpoint path.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn keyring_account(&self) -> &str {
        self.user.as_deref().unwrap_or("default")
    }
}

/// Resolves the optional bearer token. `Ok(None)` when no reference is configured.
pub fn get_access_token(config: &ClientConfig) -> Result<Option<String>> {
    match config.token_ref.as_deref() {
        None => Ok(None),
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving access token from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .map(Some)
                .context(format!(
                    "Failed to get access token from environment variable '{}'",
                    env_var_name
                ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, config.keyring_account())
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving access token from keyring for account: {}", config.keyring_account());
            entry.get_password().map(Some).context(format!(
                "Failed to get access token from keyring for '{}'",
                config.keyring_account()
            ))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported token_ref format: {}", other)),
    }
}

/// Stores a bearer token in the OS keyring under the configured user.
pub fn set_access_token_in_keyring(config: &ClientConfig, token: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, config.keyring_account())
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting access token in keyring for account: {}", config.keyring_account());
    entry.set_password(token).context(format!(
        "Failed to set access token in keyring for '{}'",
        config.keyring_account()
    ))
}
