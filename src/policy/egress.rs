//! Network egress decisions for a launched agent.
//!
//! An agent with no reachable host gets no network at all. Otherwise its
//! container sits on an internal network and every request goes through the
//! execution's egress proxy, which asks this policy first. The same decider
//! also vets URLs that reach the orchestrator from untrusted input, such as
//! a context's callback URL.

use std::net::IpAddr;

use async_trait::async_trait;

/// A network request to be evaluated.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    /// HTTP method (GET, POST, etc.).
    pub method: String,
    /// Full URL being requested.
    pub url: String,
    /// Lowercased host, without IPv6 brackets.
    pub host: String,
    pub path: String,
}

impl NetworkRequest {
    /// Create from a URL string. Non-HTTP schemes yield `None`.
    pub fn from_url(method: &str, url: &str) -> Option<Self> {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }

        let host = parsed.host_str()?;
        let host = host
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .unwrap_or(host)
            .to_lowercase();

        Some(Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            host,
            path: parsed.path().to_string(),
        })
    }
}

/// Decision for a network request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDecision {
    Allow,
    Deny { reason: String },
}

impl NetworkDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, NetworkDecision::Deny { .. })
    }
}

/// Trait for making network policy decisions.
#[async_trait]
pub trait NetworkPolicyDecider: Send + Sync {
    /// Decide whether a request should be allowed.
    async fn decide(&self, request: &NetworkRequest) -> NetworkDecision;
}

/// Egress allowlist derived from an agent's granted integrations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EgressPolicy {
    /// The hub's own host. Always reachable when set, even if private.
    hub_host: Option<String>,
    /// Domains reachable along with all of their subdomains.
    domains: Vec<String>,
    /// Any public host is reachable (`http_egress`).
    allow_public: bool,
}

impl EgressPolicy {
    /// Policy that denies every request.
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn new(hub_host: Option<String>, domains: Vec<String>, allow_public: bool) -> Self {
        let mut domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.trim().trim_start_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort();
        domains.dedup();
        Self {
            hub_host: hub_host.map(|h| h.to_lowercase()),
            domains,
            allow_public,
        }
    }

    /// Whether the container needs any network at all.
    pub fn needs_network(&self) -> bool {
        self.hub_host.is_some() || self.allow_public || !self.domains.is_empty()
    }

    /// Whether `host` is the one internal host this policy reaches anyway.
    pub fn admits_internal(&self, host: &str) -> bool {
        self.hub_host.as_deref() == Some(host)
    }

    pub fn allow_public(&self) -> bool {
        self.allow_public
    }

    /// Every host pattern this policy admits, for export into the container.
    pub fn allowlist(&self) -> Vec<String> {
        let mut out: Vec<String> = self.hub_host.iter().cloned().collect();
        out.extend(self.domains.iter().cloned());
        if self.allow_public {
            out.push("*".to_string());
        }
        out
    }

    /// Decide on a raw URL. Anything that is not plain HTTP(S) is refused.
    pub fn check_url(&self, url: &str) -> NetworkDecision {
        match NetworkRequest::from_url("GET", url) {
            Some(request) => self.decide_host(&request.host),
            None => NetworkDecision::Deny {
                reason: format!("'{url}' is not an http(s) URL"),
            },
        }
    }

    fn decide_host(&self, host: &str) -> NetworkDecision {
        if self.admits_internal(host) {
            return NetworkDecision::Allow;
        }
        if is_internal_host(host) {
            return NetworkDecision::Deny {
                reason: format!("{host} is a private or loopback address"),
            };
        }
        if self.allow_public || self.domains.iter().any(|d| host_matches(host, d)) {
            return NetworkDecision::Allow;
        }
        NetworkDecision::Deny {
            reason: format!("{host} is not in the egress allowlist"),
        }
    }
}

#[async_trait]
impl NetworkPolicyDecider for EgressPolicy {
    async fn decide(&self, request: &NetworkRequest) -> NetworkDecision {
        self.decide_host(&request.host)
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Loopback, RFC 1918, link-local, unspecified and local-only names.
pub fn is_internal_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        Ok(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal_host(&v4.to_string());
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}
