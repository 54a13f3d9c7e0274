use serde::{Deserialize, Serialize};

/// Template that fetches the target without an intermediary.
pub const DIRECT_TEMPLATE: &str = "direct";

/// A known proxy: a name and a URL template.
///
/// The template maps a target feed URL to the proxied URL:
///
/// - `{url}` is replaced by the percent-encoded target
/// - `{raw}` is replaced by the target verbatim
/// - `{api_key}` is replaced by the premium API key (empty when unset)
///
/// The literal template `direct` returns the target unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub name: String,
    pub template: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Same-origin proxy, placed first when "prefer local" is on.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProxyDescriptor {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            enabled: true,
            local: false,
        }
    }

    /// Marks this descriptor as the same-origin proxy.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.template == DIRECT_TEMPLATE
    }

    /// Builds the URL to request for `target` through this proxy.
    pub fn wrap(&self, target: &str, api_key: Option<&str>) -> String {
        if self.is_direct() {
            return target.to_owned();
        }

        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        self.template
            .replace("{url}", &encoded)
            .replace("{raw}", target)
            .replace("{api_key}", api_key.unwrap_or(""))
    }
}

/// Built-in proxy list used when `config.toml` declares none.
pub fn default_proxies() -> Vec<ProxyDescriptor> {
    vec![
        ProxyDescriptor::new("direct", DIRECT_TEMPLATE),
        ProxyDescriptor::new("allorigins", "https://api.allorigins.win/raw?url={url}"),
        ProxyDescriptor::new("corsproxy", "https://corsproxy.io/?url={url}"),
        ProxyDescriptor::new("codetabs", "https://api.codetabs.com/v1/proxy?quest={url}"),
    ]
}
