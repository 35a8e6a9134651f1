pub mod rss;

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;

/// Some feed hosts reject requests without a browser user agent.
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/111.0";

/// Bound on any single HTTP request so one unreachable host cannot stall the
/// whole run.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for connection pooling across all modules.
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Returns a reference to the shared HTTP client, lazily initialized on
/// first use.
pub fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()
            .expect("Failed to create HTTP client")
    })
}
