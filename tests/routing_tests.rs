/// Routing built from configuration
use proxy_tunnel::config::{build_adapters, build_rule_manager, AppConfig};
use proxy_tunnel::raw_socket::RawSocketFactory;
use proxy_tunnel::session::ConnectionRequest;
use proxy_tunnel::AdapterFactory;

const CONFIG: &str = r#"
    default_adapter = "y"

    [[adapters]]
    kind = "socks5"
    id = "x"
    server = "127.0.0.1"
    port = 1081

    [[adapters]]
    kind = "http"
    id = "y"
    server = "127.0.0.1"
    port = 3128

    [[adapters]]
    kind = "select"
    id = "pool"
    candidates = ["x", "y"]

    [[rules]]
    kind = "domain"
    adapter = "x"
    domains = ["*.example.com"]

    [[rules]]
    kind = "domain"
    adapter = "pool"
    domains = ["prefix:cdn", "exact:pool.test"]

    [[rules]]
    kind = "ip"
    adapter = "direct"
    cidrs = ["192.168.0.0/16", "fd00::/8"]

    [[rules]]
    kind = "country"
    adapter = "reject"
    countries = ["ZZ"]
"#;

fn route(config: &AppConfig, host: &str) -> String {
    let adapters = build_adapters(config, &RawSocketFactory::Tcp).unwrap();
    let rules = build_rule_manager(config, &adapters).unwrap();
    rules
        .match_route(&ConnectionRequest::new(host, 443).unwrap())
        .unwrap()
        .id()
        .to_string()
}

#[test]
fn test_first_matching_rule_wins() {
    let config = AppConfig::from_toml(CONFIG).unwrap();
    assert_eq!(route(&config, "www.example.com"), "x");
    assert_eq!(route(&config, "WWW.Example.COM."), "x");
    assert_eq!(route(&config, "cdn.static.net"), "pool");
    assert_eq!(route(&config, "pool.test"), "pool");
    assert_eq!(route(&config, "192.168.3.4"), "direct");
    assert_eq!(route(&config, "fd12::1"), "direct");
}

#[test]
fn test_unmatched_requests_use_default() {
    let config = AppConfig::from_toml(CONFIG).unwrap();
    // 通配符不匹配父域本身
    assert_eq!(route(&config, "example.com"), "y");
    assert_eq!(route(&config, "sub.pool.test"), "y");
    // 没有 GeoIP 数据库时国家规则不匹配
    assert_eq!(route(&config, "8.8.8.8"), "y");
}

#[test]
fn test_select_pool_switches_route_target() {
    let config = AppConfig::from_toml(CONFIG).unwrap();
    let adapters = build_adapters(&config, &RawSocketFactory::Tcp).unwrap();
    let pool = adapters.selector("pool").unwrap();
    assert_eq!(pool.current(), "x");
    pool.set_current("y").unwrap();
    assert_eq!(pool.current(), "y");
    assert!(pool.set_current("nope").is_err());
    assert_eq!(pool.current(), "y");
}

#[test]
fn test_template_builds() {
    let config = AppConfig::from_toml(AppConfig::template()).unwrap();
    let adapters = build_adapters(&config, &RawSocketFactory::Tcp).unwrap();
    let rules = build_rule_manager(&config, &adapters).unwrap();
    assert!(!rules.rules().is_empty());
    assert_eq!(route(&config, "ad.doubleclick.net"), "reject");
    assert_eq!(route(&config, "wiki.corp.example.com"), "office");
    assert_eq!(route(&config, "10.1.2.3"), "direct");
    assert_eq!(route(&config, "example.org"), "proxy");
}
