#![forbid(unsafe_code)]

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use parley_domain::LinkPreview;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewError {
	#[error("http error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("url is not http(s): {0}")]
	InvalidUrl(String),

	#[error("response is not html")]
	NotHtml,

	#[error("response body too large: {0} bytes")]
	TooLarge(usize),
}

/// External link-preview collaborator. Only ever called off the send
/// path; every error is swallowed by the enrichment task.
#[async_trait]
pub trait PreviewFetcher: Send + Sync {
	async fn fetch(&self, url: &str) -> Result<LinkPreview, PreviewError>;
}

/// Settings for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
	pub timeout: Duration,
	pub max_redirects: usize,
	pub max_body_bytes: usize,
	pub user_agent: String,
}

impl Default for PreviewConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(5),
			max_redirects: 3,
			max_body_bytes: 256 * 1024,
			user_agent: format!("parley-server/{} link-preview", env!("CARGO_PKG_VERSION")),
		}
	}
}

/// Fetches page metadata over HTTP and extracts Open Graph tags, with
/// `<title>`/hostname fallbacks.
pub struct HttpPreviewFetcher {
	client: reqwest::Client,
	cfg: PreviewConfig,
}

impl HttpPreviewFetcher {
	pub fn new(cfg: PreviewConfig) -> Result<Self, PreviewError> {
		let client = reqwest::Client::builder()
			.timeout(cfg.timeout)
			.redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
			.build()?;
		Ok(Self { client, cfg })
	}
}

#[async_trait]
impl PreviewFetcher for HttpPreviewFetcher {
	async fn fetch(&self, url: &str) -> Result<LinkPreview, PreviewError> {
		let parsed = url::Url::parse(url).map_err(|_| PreviewError::InvalidUrl(url.to_string()))?;
		if parsed.scheme() != "http" && parsed.scheme() != "https" {
			return Err(PreviewError::InvalidUrl(url.to_string()));
		}
		let host = parsed.host_str().unwrap_or_default().to_string();

		let resp = self
			.client
			.get(parsed.as_str())
			.header("User-Agent", &self.cfg.user_agent)
			.send()
			.await?
			.error_for_status()?;

		let content_type = resp
			.headers()
			.get("content-type")
			.and_then(|v| v.to_str().ok())
			.unwrap_or("");
		if !content_type.contains("text/html") {
			return Err(PreviewError::NotHtml);
		}

		let body = resp.text().await?;
		if body.len() > self.cfg.max_body_bytes {
			return Err(PreviewError::TooLarge(body.len()));
		}

		let title = extract_meta(&body, "og:title")
			.or_else(|| extract_meta(&body, "twitter:title"))
			.or_else(|| extract_title(&body))
			.unwrap_or_else(|| host.clone());
		let description = extract_meta(&body, "og:description")
			.or_else(|| extract_meta(&body, "twitter:description"))
			.or_else(|| extract_meta(&body, "description"))
			.unwrap_or_default();
		let image = extract_meta(&body, "og:image").or_else(|| extract_meta(&body, "twitter:image"));
		let site_name = extract_meta(&body, "og:site_name").unwrap_or_else(|| host.clone());

		Ok(LinkPreview {
			url: parsed.to_string(),
			title: title.trim().to_string(),
			description: description.trim().to_string(),
			image,
			site_name,
			domain: host,
		})
	}
}

/// Find the first URL in `text`: `http(s)://…` as-is, `www.…` with an
/// `https://` prefix added.
pub fn detect_first_url(text: &str) -> Option<String> {
	static URL_RE: OnceLock<Regex> = OnceLock::new();
	let re = URL_RE.get_or_init(|| {
		Regex::new(r"(?i)(https?://[^\s]+)|(www\.[^\s]+)").expect("url regex")
	});

	let found = re.find(text)?.as_str();
	if found.to_ascii_lowercase().starts_with("www.") {
		Some(format!("https://{found}"))
	} else {
		Some(found.to_string())
	}
}

/// Extract `<meta property="X" content="Y">` (or `name="X"`), either
/// attribute order.
fn extract_meta(html: &str, property: &str) -> Option<String> {
	let escaped = regex::escape(property);
	let patterns = [
		format!(r#"<meta[^>]*(?:property|name)=["']{escaped}["'][^>]*content=["']([^"']*)["']"#),
		format!(r#"<meta[^>]*content=["']([^"']*)["'][^>]*(?:property|name)=["']{escaped}["']"#),
	];

	for pattern in patterns {
		let re = Regex::new(&pattern).ok()?;
		if let Some(caps) = re.captures(html) {
			let value = html_decode(&caps[1]);
			if !value.trim().is_empty() {
				return Some(value);
			}
		}
	}
	None
}

/// Extract `<title>…</title>`.
fn extract_title(html: &str) -> Option<String> {
	static TITLE_RE: OnceLock<Regex> = OnceLock::new();
	let re = TITLE_RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>([^<]*)</title>").expect("title regex"));
	let caps = re.captures(html)?;
	let value = html_decode(caps[1].trim());
	if value.is_empty() { None } else { Some(value) }
}

fn html_decode(s: &str) -> String {
	s.replace("&amp;", "&")
		.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&quot;", "\"")
		.replace("&#39;", "'")
		.replace("&#x27;", "'")
}
