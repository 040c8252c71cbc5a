use super::Rule;
use crate::adapter::AdapterFactory;
use crate::session::ConnectionRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 域名匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainMatchMode {
    #[default]
    Exact,
    /// 域名本身及其子域名
    Suffix,
    Prefix,
    Keyword,
    /// `*.example.com`，只匹配子域名
    Wildcard,
}

/// 单个域名模式，比较时忽略大小写和末尾的 `.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMatcher {
    mode: DomainMatchMode,
    pattern: String,
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl DomainMatcher {
    pub fn new(mode: DomainMatchMode, pattern: &str) -> Self {
        let pattern = normalize(pattern);
        match mode {
            DomainMatchMode::Wildcard => Self {
                mode,
                pattern: pattern.trim_start_matches("*.").to_string(),
            },
            _ => Self { mode, pattern },
        }
    }

    /// 解析带前缀的模式：`suffix:`、`prefix:`、`keyword:`、`exact:`，或 `*.` 开头的通配符
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if let Some((tag, pattern)) = input.split_once(':') {
            let mode = match tag {
                "exact" => Some(DomainMatchMode::Exact),
                "suffix" => Some(DomainMatchMode::Suffix),
                "prefix" => Some(DomainMatchMode::Prefix),
                "keyword" => Some(DomainMatchMode::Keyword),
                _ => None,
            };
            if let Some(mode) = mode {
                return Self::new(mode, pattern);
            }
        }
        if input.starts_with("*.") {
            Self::new(DomainMatchMode::Wildcard, input)
        } else {
            Self::new(DomainMatchMode::Exact, input)
        }
    }

    pub fn mode(&self) -> DomainMatchMode {
        self.mode
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = normalize(host);
        match self.mode {
            DomainMatchMode::Exact => host == self.pattern,
            DomainMatchMode::Suffix => host == self.pattern || is_subdomain(&host, &self.pattern),
            DomainMatchMode::Prefix => host.starts_with(&self.pattern),
            DomainMatchMode::Keyword => host.contains(&self.pattern),
            DomainMatchMode::Wildcard => is_subdomain(&host, &self.pattern),
        }
    }
}

fn is_subdomain(host: &str, parent: &str) -> bool {
    host.len() > parent.len()
        && host.ends_with(parent)
        && host.as_bytes()[host.len() - parent.len() - 1] == b'.'
}

impl fmt::Display for DomainMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            DomainMatchMode::Exact => write!(f, "{}", self.pattern),
            DomainMatchMode::Suffix => write!(f, "suffix:{}", self.pattern),
            DomainMatchMode::Prefix => write!(f, "prefix:{}", self.pattern),
            DomainMatchMode::Keyword => write!(f, "keyword:{}", self.pattern),
            DomainMatchMode::Wildcard => write!(f, "*.{}", self.pattern),
        }
    }
}

/// 按目标域名匹配
#[derive(Debug, Clone)]
pub struct DomainRule {
    name: String,
    factory: Arc<dyn AdapterFactory>,
    matchers: Vec<DomainMatcher>,
}

impl DomainRule {
    pub fn new(factory: Arc<dyn AdapterFactory>, matchers: Vec<DomainMatcher>) -> Self {
        Self {
            name: format!("domain({}) -> {}", matchers.len(), factory.id()),
            factory,
            matchers,
        }
    }

    pub fn matchers(&self) -> &[DomainMatcher] {
        &self.matchers
    }
}

impl Rule for DomainRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &Arc<dyn AdapterFactory> {
        &self.factory
    }

    fn matches(&self, request: &ConnectionRequest) -> bool {
        !request.is_ip() && self.matchers.iter().any(|m| m.matches(request.host()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_subdomains_only() {
        let m = DomainMatcher::parse("*.Example.com");
        assert_eq!(m.mode(), DomainMatchMode::Wildcard);
        assert!(m.matches("a.example.com"));
        assert!(m.matches("a.b.EXAMPLE.com."));
        assert!(!m.matches("example.com"));
        assert!(!m.matches("badexample.com"));
        assert_eq!(m.to_string(), "*.example.com");
    }

    #[test]
    fn test_modes() {
        assert!(DomainMatcher::parse("example.com").matches("EXAMPLE.com."));
        assert!(!DomainMatcher::parse("example.com").matches("www.example.com"));

        let suffix = DomainMatcher::parse("suffix:example.com");
        assert!(suffix.matches("example.com"));
        assert!(suffix.matches("www.example.com"));
        assert!(!suffix.matches("notexample.com"));

        assert!(DomainMatcher::parse("prefix:ads.").matches("ads.tracker.net"));
        assert!(DomainMatcher::parse("keyword:google").matches("www.google.co.jp"));
        assert!(!DomainMatcher::parse("keyword:google").matches("example.org"));
    }

    #[test]
    fn test_ip_literals_never_match() {
        let factory: Arc<dyn AdapterFactory> = Arc::new(
            crate::adapter::RejectAdapterFactory::new("reject", std::time::Duration::ZERO),
        );
        let rule = DomainRule::new(factory, vec![DomainMatcher::parse("keyword:1")]);
        let request = ConnectionRequest::new("10.0.0.1", 80).unwrap();
        assert!(!rule.matches(&request));
    }
}
