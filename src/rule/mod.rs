//! 路由规则
//!
//! `RuleManager` 按顺序检查规则，第一个匹配的规则决定使用哪个适配器工厂。

mod country;
mod domain;
mod ip;

pub use country::{CountryDatabase, CountryRule};
pub use domain::{DomainMatchMode, DomainMatcher, DomainRule};
pub use ip::IpRangeRule;

use crate::adapter::AdapterFactory;
use crate::error::{Result, TunnelError};
use crate::observer::{self, notify, Observer, RuleMatchEvent};
use crate::session::ConnectionRequest;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// 路由规则
pub trait Rule: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// 匹配时使用的适配器工厂
    fn factory(&self) -> &Arc<dyn AdapterFactory>;

    fn matches(&self, request: &ConnectionRequest) -> bool;

    /// 是否匹配所有请求
    fn is_catch_all(&self) -> bool {
        false
    }
}

/// 匹配所有请求
#[derive(Debug, Clone)]
pub struct AllRule {
    name: String,
    factory: Arc<dyn AdapterFactory>,
}

impl AllRule {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            name: format!("all -> {}", factory.id()),
            factory,
        }
    }
}

impl Rule for AllRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &Arc<dyn AdapterFactory> {
        &self.factory
    }

    fn matches(&self, _request: &ConnectionRequest) -> bool {
        true
    }

    fn is_catch_all(&self) -> bool {
        true
    }
}

/// 有序规则列表及默认适配器
pub struct RuleManager {
    rules: Vec<Box<dyn Rule>>,
    default: Option<Arc<dyn AdapterFactory>>,
    observer: Option<Arc<dyn Observer<RuleMatchEvent>>>,
}

impl RuleManager {
    pub fn new(rules: Vec<Box<dyn Rule>>, default: Option<Arc<dyn AdapterFactory>>) -> Self {
        Self {
            rules,
            default,
            observer: observer::rule_observer(),
        }
    }

    pub fn rules(&self) -> &[Box<dyn Rule>] {
        &self.rules
    }

    pub fn default_factory(&self) -> Option<&Arc<dyn AdapterFactory>> {
        self.default.as_ref()
    }

    /// 检查是否所有请求都有路由
    pub fn validate(&self) -> Result<()> {
        if self.default.is_some() || self.rules.iter().any(|r| r.is_catch_all()) {
            return Ok(());
        }
        Err(TunnelError::config_error(
            "No default adapter and no catch-all rule",
        ))
    }

    /// 第一个匹配的规则决定路由，全部不匹配时使用默认适配器
    pub fn match_route(&self, request: &ConnectionRequest) -> Result<Arc<dyn AdapterFactory>> {
        for rule in &self.rules {
            if rule.matches(request) {
                notify(&self.observer, || RuleMatchEvent::RuleMatched {
                    rule: rule.name().to_string(),
                    request: request.to_string(),
                });
                debug!("{} matched rule '{}'", request, rule.name());
                return Ok(rule.factory().clone());
            }
            notify(&self.observer, || RuleMatchEvent::RuleNotMatched {
                rule: rule.name().to_string(),
                request: request.to_string(),
            });
        }

        self.default.clone().ok_or_else(|| {
            TunnelError::connection_failed(
                request.to_string(),
                io::Error::new(io::ErrorKind::NotFound, "no route"),
            )
        })
    }
}

impl fmt::Debug for RuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleManager")
            .field("rules", &self.rules)
            .field("default", &self.default.as_ref().map(|d| d.id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RejectAdapterFactory;
    use std::time::Duration;

    fn factory(id: &str) -> Arc<dyn AdapterFactory> {
        Arc::new(RejectAdapterFactory::new(id, Duration::ZERO))
    }

    fn request(host: &str) -> ConnectionRequest {
        ConnectionRequest::new(host, 443).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let x = factory("x");
        let y = factory("y");
        let manager = RuleManager::new(
            vec![
                Box::new(DomainRule::new(
                    x.clone(),
                    vec![DomainMatcher::parse("*.example.com")],
                )),
                Box::new(DomainRule::new(
                    factory("z"),
                    vec![DomainMatcher::parse("suffix:example.com")],
                )),
            ],
            Some(y),
        );

        assert_eq!(manager.match_route(&request("a.example.com")).unwrap().id(), "x");
        assert_eq!(manager.match_route(&request("example.com")).unwrap().id(), "z");
        assert_eq!(manager.match_route(&request("other.org")).unwrap().id(), "y");
    }

    #[test]
    fn test_no_route() {
        let manager = RuleManager::new(vec![], None);
        let err = manager.match_route(&request("example.com")).unwrap_err();
        assert!(err.is_connect());
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(manager.validate().is_err());
    }

    #[test]
    fn test_catch_all_rule() {
        let manager = RuleManager::new(vec![Box::new(AllRule::new(factory("proxy")))], None);
        assert!(manager.validate().is_ok());
        assert_eq!(manager.match_route(&request("anything")).unwrap().id(), "proxy");
    }
}
