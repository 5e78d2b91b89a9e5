use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::base::{Tool, ToolResult};

const DEFAULT_SEARCH_COUNT: u32 = 5;
const MAX_SEARCH_COUNT: u32 = 10;
const MIN_SEARCH_COUNT: u32 = 1;
const MAX_REDIRECTS: usize = 5;

/// Rejects loopback, private, link-local, unspecified, multicast and
/// known cloud-metadata addresses regardless of how they were spelled
/// (dotted-decimal, octal, hex, bare integer, IPv6 variants).
fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || is_cloud_metadata_v4(v4)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_unique_local_v6(v6)
                || is_link_local_v6(v6)
        }
    }
}

fn is_cloud_metadata_v4(v4: &Ipv4Addr) -> bool {
    *v4 == Ipv4Addr::new(169, 254, 169, 254)
}

fn is_unique_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// Rejects host strings that encode an IPv4 address in a non-canonical
/// notation (octal, hex, or a single bare 32-bit integer) used to dodge
/// naive string-based blocklists.
fn looks_like_alternate_ip_notation(host: &str) -> bool {
    if host.starts_with("0x") || host.starts_with("0X") {
        return true;
    }
    if host.chars().all(|c| c.is_ascii_digit()) && !host.contains('.') {
        return true;
    }
    let octets: Vec<&str> = host.split('.').collect();
    octets.len() <= 4
        && !octets.is_empty()
        && octets
            .iter()
            .any(|o| o.len() > 1 && o.starts_with('0') && o.chars().all(|c| c.is_ascii_digit()))
}

fn validate_url_shape(url: &Url) -> Result<(), String> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("Unsupported scheme: {}", url.scheme()));
    }
    let host = url.host_str().ok_or("URL has no host")?;
    if looks_like_alternate_ip_notation(host) {
        return Err("Host uses a disallowed numeric address notation".to_string());
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_forbidden_ip(&ip) {
            return Err("Target address blocked: not a public address".to_string());
        }
    }
    Ok(())
}

async fn resolve_and_validate(host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("DNS resolution failed: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err("DNS resolution returned no addresses".to_string());
    }
    for addr in &addrs {
        if is_forbidden_ip(&addr.ip()) {
            return Err("Target address blocked: not a public address".to_string());
        }
    }
    Ok(addrs)
}

fn extract_text(content_type: &str, body: &str, max_chars: usize) -> String {
    let extracted = if content_type.contains("application/json") {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| body.to_string())
    } else if content_type.contains("text/html") {
        strip_html(body)
    } else {
        body.to_string()
    };
    truncate_chars(&extracted, max_chars)
}

fn strip_html(html: &str) -> String {
    let script_re = regex::Regex::new(r"(?is)<script.*?</script>").unwrap();
    let style_re = regex::Regex::new(r"(?is)<style.*?</style>").unwrap();
    let tag_re = regex::Regex::new(r"(?s)<[^>]+>").unwrap();
    let ws_re = regex::Regex::new(r"[ \t]+").unwrap();
    let blank_re = regex::Regex::new(r"\n{3,}").unwrap();

    let without_scripts = script_re.replace_all(html, " ");
    let without_styles = style_re.replace_all(&without_scripts, " ");
    let without_tags = tag_re.replace_all(&without_styles, "\n");
    let unescaped = html_escape::decode_html_entities(&without_tags).into_owned();
    let collapsed = ws_re.replace_all(&unescaped, " ");
    blank_re.replace_all(&collapsed, "\n\n").trim().to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("(truncated to {max_chars} characters)\n\n{truncated}")
}

pub struct WebFetchTool {
    client: reqwest::Client,
    max_chars: usize,
    timeout_secs: u64,
}

impl WebFetchTool {
    pub fn new(max_chars: usize, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client builds"),
            max_chars,
            timeout_secs,
        }
    }

    async fn fetch_following_redirects(&self, start_url: &str) -> Result<(String, String), String> {
        let mut current = start_url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let url = Url::parse(&current).map_err(|e| format!("Invalid URL: {e}"))?;
            validate_url_shape(&url)?;
            let host = url.host_str().ok_or("URL has no host")?.to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs = resolve_and_validate(&host, port).await?;

            let response = if url.scheme() == "https" {
                self.client
                    .get(url.clone())
                    .timeout(Duration::from_secs(self.timeout_secs))
                    .send()
                    .await
                    .map_err(|e| format!("Request failed: {e}"))?
            } else {
                let addr = addrs.first().ok_or("no resolved address")?;
                let direct_url = format!(
                    "{}://{}:{}{}",
                    url.scheme(),
                    addr.ip(),
                    addr.port(),
                    url.path()
                );
                self.client
                    .get(&direct_url)
                    .header("Host", &host)
                    .timeout(Duration::from_secs(self.timeout_secs))
                    .send()
                    .await
                    .map_err(|e| format!("Request failed: {e}"))?
            };

            if response.status().is_redirection() {
                if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
                    let location = location.to_str().map_err(|_| "invalid redirect header")?;
                    current = url
                        .join(location)
                        .map_err(|e| format!("Invalid redirect target: {e}"))?
                        .to_string();
                    continue;
                }
                return Err("Redirect response missing Location header".to_string());
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/plain")
                .to_string();
            let body = response
                .text()
                .await
                .map_err(|e| format!("Failed to read response body: {e}"))?;
            return Ok((content_type, body));
        }
        Err("Too many redirects".to_string())
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }
    fn description(&self) -> &str {
        "Fetches a URL and returns its text content, following redirects."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "minLength": 1},
                "maxChars": {"type": "integer", "minimum": 1}
            },
            "required": ["url"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(url) = params.get("url").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: url");
        };
        let max_chars = params
            .get("maxChars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.max_chars);

        match self.fetch_following_redirects(url).await {
            Ok((content_type, body)) => {
                ToolResult::success(extract_text(&content_type, &body, max_chars))
            }
            Err(reason) => {
                if reason.contains("blocked") || reason.contains("notation") {
                    ToolResult::access_denied(reason)
                } else {
                    ToolResult::error(reason)
                }
            }
        }
    }
}

pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Searches the web and returns a list of matching results."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1},
                "count": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(query) = params.get("query").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: query");
        };
        let Some(api_key) = &self.api_key else {
            return ToolResult::error("web_search is not configured");
        };
        let count = params
            .get("count")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_SEARCH_COUNT)
            .clamp(MIN_SEARCH_COUNT, MAX_SEARCH_COUNT);

        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &count.to_string())])
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => ToolResult::success(
                    serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()),
                ),
                Err(e) => ToolResult::error(format!("Failed to parse search response: {e}")),
            },
            Ok(resp) => ToolResult::error(format!("Search request failed: HTTP {}", resp.status())),
            Err(e) => ToolResult::error(format!("Search request failed: {e}")),
        }
    }
}
