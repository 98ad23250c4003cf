use std::time::Duration;

use crate::config::ClientConfig;
use crate::transport::HttpRequest;

/// Builds requests against the update server's endpoints for one unit.
#[derive(Clone)]
pub struct ServerApi {
    base_url: String,
    unit_id: String,
    api_key: Option<String>,
    user_agent: String,
    timeout: Duration,
}

impl std::fmt::Debug for ServerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerApi")
            .field("base_url", &self.base_url)
            .field("unit_id", &self.unit_id)
            .field("authenticated", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerApi {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_url: config.server_base().to_string(),
            unit_id: config.unit_id.clone(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            user_agent: config.user_agent(),
            timeout: config.http_timeout(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn info_request(&self) -> HttpRequest {
        self.authenticated(format!("{}/info/{}", self.base_url, self.unit_id), "application/json")
    }

    #[must_use]
    pub fn checksum_request(&self, version: &str) -> HttpRequest {
        let endpoint = format!("{}/verify_file/{}", self.base_url, self.unit_id);
        let url = reqwest::Url::parse_with_params(
            &endpoint,
            &[("action", "checksum"), ("version", version)],
        )
        .map_or_else(
            |_| format!("{endpoint}?action=checksum&version={version}"),
            String::from,
        );
        self.authenticated(url, "text/plain")
    }

    #[must_use]
    pub fn connected_request(&self) -> HttpRequest {
        self.authenticated(format!("{}/connected", self.base_url), "application/json")
    }

    /// The server's canonical artifact location for this unit.
    #[must_use]
    pub fn default_download_url(&self) -> String {
        format!("{}/download/{}", self.base_url, self.unit_id)
    }

    /// Download request for `url`. Credentials are only attached when the URL
    /// points at the configured server.
    #[must_use]
    pub fn download_request(&self, url: &str) -> HttpRequest {
        if self.is_own_server(url) {
            self.authenticated(url.to_string(), "application/octet-stream")
        } else {
            self.anonymous(url.to_string(), "application/octet-stream")
        }
    }

    fn is_own_server(&self, url: &str) -> bool {
        url.strip_prefix(&self.base_url)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
    }

    fn anonymous(&self, url: String, accept: &str) -> HttpRequest {
        HttpRequest {
            url,
            headers: vec![
                ("Accept".to_string(), accept.to_string()),
                ("User-Agent".to_string(), self.user_agent.clone()),
            ],
            timeout: self.timeout,
        }
    }

    fn authenticated(&self, url: String, accept: &str) -> HttpRequest {
        let mut request = self.anonymous(url, accept);
        if let Some(key) = &self.api_key {
            request
                .headers
                .push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::ServerApi;
    use crate::config::ClientConfig;

    fn api(api_key: Option<&str>) -> ServerApi {
        let mut config = ClientConfig::new(
            "https://updates.example.com/",
            "acme-widget",
            "1.0.0",
            "/opt/acme-widget",
        );
        config.api_key = api_key.map(str::to_string);
        ServerApi::from_config(&config)
    }

    #[test]
    fn info_request_carries_standard_and_auth_headers() {
        let request = api(Some("k3y")).info_request();
        assert_eq!(request.url, "https://updates.example.com/info/acme-widget");
        assert_eq!(request.header("Accept"), Some("application/json"));
        assert_eq!(request.header("Authorization"), Some("Bearer k3y"));
        assert!(
            request
                .header("User-Agent")
                .is_some_and(|agent| agent.starts_with("updraft/"))
        );
        assert_eq!(request.timeout.as_secs(), 15);
    }

    #[test]
    fn requests_without_key_skip_authorization() {
        assert_eq!(api(None).info_request().header("Authorization"), None);
        assert_eq!(api(Some("  ")).info_request().header("Authorization"), None);
    }

    #[test]
    fn checksum_request_encodes_query() {
        let request = api(None).checksum_request("1.0.0-beta.1");
        assert_eq!(
            request.url,
            "https://updates.example.com/verify_file/acme-widget?action=checksum&version=1.0.0-beta.1"
        );
    }

    #[test]
    fn download_credentials_stay_on_configured_server() {
        let api = api(Some("k3y"));
        let own = api.download_request(&api.default_download_url());
        assert_eq!(own.url, "https://updates.example.com/download/acme-widget");
        assert_eq!(own.header("Authorization"), Some("Bearer k3y"));

        let foreign = api.download_request("https://cdn.example.net/acme-widget.zip");
        assert_eq!(foreign.header("Authorization"), None);

        let lookalike = api.download_request("https://updates.example.com.evil.net/x.zip");
        assert_eq!(lookalike.header("Authorization"), None);
    }
}
