use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Security features in front of the admin and proxy paths
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit: RateLimitConfig,
    pub firewall: FirewallConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    /// Add nosniff/frame/referrer headers (and HSTS under TLS) to every response
    pub headers: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            firewall: FirewallConfig::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            headers: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per window when no rule matches
    pub limit: u64,
    pub window: u64, // seconds
    pub rules: Vec<RateLimitRule>,
    pub storage: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 100,
            window: 60,
            rules: Vec::new(),
            storage: "memory".to_string(),
        }
    }
}

/// Per route class limit, matched by path prefix and optional method
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    pub limit: u64,
    pub window: u64, // seconds
}

impl RateLimitRule {
    pub fn get_window(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

impl RateLimitConfig {
    pub fn get_window(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    /// Longest matching path prefix wins; a rule with a method only applies to that method
    pub fn rule_for(&self, path: &str, method: &str) -> Option<&RateLimitRule> {
        self.rules
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .filter(|r| {
                r.method
                    .as_deref()
                    .map_or(true, |m| m.eq_ignore_ascii_case(method))
            })
            .max_by_key(|r| (r.path.len(), r.method.is_some()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limit == 0 || self.window == 0 {
            return Err(anyhow::anyhow!(
                "Rate limit and window must be greater than 0"
            ));
        }
        for rule in &self.rules {
            if rule.limit == 0 || rule.window == 0 {
                return Err(anyhow::anyhow!(
                    "Rate limit rule for '{}' needs limit and window greater than 0",
                    rule.path
                ));
            }
            if !rule.path.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "Rate limit rule path must start with '/': {}",
                    rule.path
                ));
            }
        }
        if self.storage != "memory" {
            return Err(anyhow::anyhow!(
                "Unsupported rate limit storage: {}",
                self.storage
            ));
        }
        Ok(())
    }
}

/// Connection-level allow/deny rules checked before anything else
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallRule {
    /// `allow` or `deny`
    pub action: String,
    /// `*`, a single address or a CIDR block
    pub source: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl FirewallRule {
    pub fn is_deny(&self) -> bool {
        self.action == "deny"
    }

    pub fn matches(&self, client_ip: Option<IpAddr>, scheme: &str, port: Option<u16>) -> bool {
        let source_ok = self.source == "*"
            || client_ip.is_some_and(|ip| source_contains(&self.source, ip));
        let protocol_ok = self
            .protocol
            .as_deref()
            .map_or(true, |p| p.eq_ignore_ascii_case(scheme));
        let port_ok =
            self.ports.is_empty() || port.is_some_and(|p| self.ports.contains(&p));
        source_ok && protocol_ok && port_ok
    }
}

impl FirewallConfig {
    /// First matching rule decides; no match admits the request.
    /// Returns the rule that refused the request, if any.
    pub fn blocking_rule(
        &self,
        client_ip: Option<IpAddr>,
        scheme: &str,
        port: Option<u16>,
    ) -> Option<&FirewallRule> {
        if !self.enabled {
            return None;
        }
        self.rules
            .iter()
            .find(|r| r.matches(client_ip, scheme, port))
            .filter(|r| r.is_deny())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for rule in &self.rules {
            if rule.action != "allow" && rule.action != "deny" {
                return Err(anyhow::anyhow!(
                    "Firewall rule action must be 'allow' or 'deny', got '{}'",
                    rule.action
                ));
            }
            if rule.source != "*" && parse_source(&rule.source).is_none() {
                return Err(anyhow::anyhow!(
                    "Firewall rule source must be '*', an IP address or a CIDR block, got '{}'",
                    rule.source
                ));
            }
        }
        Ok(())
    }
}

fn parse_source(source: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = match source.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (source, None),
    };
    let addr: IpAddr = addr.trim().parse().ok()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.trim().parse::<u8>().ok().filter(|p| *p <= max)?,
        None => max,
    };
    Some((addr, prefix))
}

fn source_contains(source: &str, ip: IpAddr) -> bool {
    let Some((net, prefix)) = parse_source(source) else {
        return false;
    };
    let (net, ip, width) = match (net, ip) {
        (IpAddr::V4(n), IpAddr::V4(i)) => (u32::from(n) as u128, u32::from(i) as u128, 32),
        (IpAddr::V6(n), IpAddr::V6(i)) => (u128::from(n), u128::from(i), 128),
        _ => return false,
    };
    if prefix == 0 {
        return true;
    }
    let shift = width - u32::from(prefix);
    (net >> shift) == (ip >> shift)
}

/// Credentials for an external auth provider. Options are redacted in the
/// admin config view.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64, // seconds
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_headers: [
                "Origin",
                "Content-Type",
                "Accept",
                "Authorization",
                "X-Request-ID",
                "X-API-Key",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exposed_headers: vec![
                "X-Request-ID".to_string(),
                "X-Rate-Limit-Limit".to_string(),
                "X-Rate-Limit-Remaining".to_string(),
                "X-Rate-Limit-Reset".to_string(),
            ],
            allow_credentials: false,
            max_age: 86400,
        }
    }
}

impl CorsConfig {
    /// The value for Access-Control-Allow-Origin, or None if the origin is refused
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            // A wildcard cannot be combined with credentials, so echo the caller
            return match (self.allow_credentials, origin) {
                (true, Some(o)) => Some(o.to_string()),
                _ => Some("*".to_string()),
            };
        }
        let origin = origin?;
        self.allowed_origins
            .iter()
            .find(|o| o.eq_ignore_ascii_case(origin))
            .map(|_| origin.to_string())
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rate_limit.validate()?;
        self.firewall.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str, method: Option<&str>, limit: u64) -> RateLimitRule {
        RateLimitRule {
            path: path.to_string(),
            method: method.map(|m| m.to_string()),
            limit,
            window: 60,
        }
    }

    #[test]
    fn test_rule_matching_prefers_longest_prefix() {
        let config = RateLimitConfig {
            rules: vec![
                rule("/", None, 100),
                rule("/api", None, 50),
                rule("/api/upload", Some("POST"), 5),
            ],
            ..Default::default()
        };

        assert_eq!(config.rule_for("/api/users", "GET").unwrap().limit, 50);
        assert_eq!(config.rule_for("/api/upload", "POST").unwrap().limit, 5);
        assert_eq!(config.rule_for("/api/upload", "GET").unwrap().limit, 50);
        assert_eq!(config.rule_for("/static", "GET").unwrap().limit, 100);
    }

    fn firewall_rule(action: &str, source: &str) -> FirewallRule {
        FirewallRule {
            action: action.to_string(),
            source: source.to_string(),
            protocol: None,
            ports: Vec::new(),
        }
    }

    #[test]
    fn test_firewall_first_match_decides() {
        let firewall = FirewallConfig {
            enabled: true,
            rules: vec![
                firewall_rule("allow", "10.1.0.0/16"),
                firewall_rule("deny", "10.0.0.0/8"),
            ],
        };
        let ip = |s: &str| s.parse::<IpAddr>().ok();

        assert!(firewall.blocking_rule(ip("10.1.2.3"), "http", Some(80)).is_none());
        assert!(firewall.blocking_rule(ip("10.2.0.1"), "http", Some(80)).is_some());
        assert!(firewall.blocking_rule(ip("192.168.1.1"), "http", Some(80)).is_none());
        assert!(firewall.blocking_rule(ip("::1"), "http", Some(80)).is_none());

        let disabled = FirewallConfig {
            enabled: false,
            ..firewall
        };
        assert!(disabled.blocking_rule(ip("10.2.0.1"), "http", Some(80)).is_none());
    }

    #[test]
    fn test_firewall_protocol_and_ports() {
        let mut rule = firewall_rule("deny", "*");
        rule.protocol = Some("https".to_string());
        rule.ports = vec![8443];
        let firewall = FirewallConfig {
            enabled: true,
            rules: vec![rule],
        };

        assert!(firewall.blocking_rule(None, "https", Some(8443)).is_some());
        assert!(firewall.blocking_rule(None, "http", Some(8443)).is_none());
        assert!(firewall.blocking_rule(None, "https", Some(443)).is_none());
    }

    #[test]
    fn test_firewall_validation() {
        let mut firewall = FirewallConfig {
            enabled: true,
            rules: vec![firewall_rule("deny", "10.0.0.1")],
        };
        assert!(firewall.validate().is_ok());

        firewall.rules = vec![firewall_rule("drop", "*")];
        assert!(firewall.validate().is_err());

        firewall.rules = vec![firewall_rule("deny", "10.0.0.0/40")];
        assert!(firewall.validate().is_err());
    }

    #[test]
    fn test_cors_origin_negotiation() {
        let mut cors = CorsConfig::default();
        assert_eq!(cors.allow_origin(Some("https://a.example")).as_deref(), Some("*"));

        cors.allowed_origins = vec!["https://a.example".to_string()];
        assert_eq!(
            cors.allow_origin(Some("https://a.example")).as_deref(),
            Some("https://a.example")
        );
        assert!(cors.allow_origin(Some("https://b.example")).is_none());
        assert!(cors.allow_origin(None).is_none());
    }
}
