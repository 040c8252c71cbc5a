use super::Rule;
use crate::adapter::AdapterFactory;
use crate::session::ConnectionRequest;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// GeoIP 国家数据库，加载失败时为空库
#[derive(Clone, Default)]
pub struct CountryDatabase {
    reader: Option<Arc<Reader<Vec<u8>>>>,
}

impl CountryDatabase {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 打开 MaxMind 数据库文件，失败只记录警告
    pub fn open(path: &Path) -> Self {
        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded from: {}", path.display());
                Self {
                    reader: Some(Arc::new(reader)),
                }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database from {}: {}", path.display(), e);
                warn!("Country rules will not match any address");
                Self::empty()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.reader.is_some()
    }

    /// 查询 IP 的国家代码（大写 ISO 3166）
    pub fn country_of(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        match lookup_country(reader, ip) {
            Ok(code) => code,
            Err(e) => {
                debug!("GeoIP lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

fn lookup_country(reader: &Reader<Vec<u8>>, ip: IpAddr) -> Result<Option<String>, MaxMindDBError> {
    let country: geoip2::Country = reader.lookup(ip)?;
    Ok(country
        .country
        .and_then(|c| c.iso_code)
        .map(|s| s.to_uppercase()))
}

impl fmt::Debug for CountryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountryDatabase")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// 按目标 IP 所属国家匹配
#[derive(Debug, Clone)]
pub struct CountryRule {
    name: String,
    factory: Arc<dyn AdapterFactory>,
    countries: BTreeSet<String>,
    database: CountryDatabase,
}

impl CountryRule {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        countries: impl IntoIterator<Item = String>,
        database: CountryDatabase,
    ) -> Self {
        let countries: BTreeSet<String> = countries
            .into_iter()
            .map(|c| c.trim().to_uppercase())
            .collect();
        Self {
            name: format!(
                "country({}) -> {}",
                countries.iter().cloned().collect::<Vec<_>>().join(","),
                factory.id()
            ),
            factory,
            countries,
            database,
        }
    }
}

impl Rule for CountryRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &Arc<dyn AdapterFactory> {
        &self.factory
    }

    fn matches(&self, request: &ConnectionRequest) -> bool {
        let Some(ip) = request.ip_address() else {
            return false;
        };
        match self.database.country_of(ip.inner()) {
            Some(code) => self.countries.contains(&code),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DirectAdapterFactory;
    use crate::raw_socket::RawSocketFactory;

    #[test]
    fn test_never_matches_without_database() {
        let factory: Arc<dyn AdapterFactory> =
            Arc::new(DirectAdapterFactory::new("direct", RawSocketFactory::Tcp));
        let rule = CountryRule::new(factory, vec!["cn".to_string()], CountryDatabase::empty());
        assert_eq!(rule.name(), "country(CN) -> direct");

        let request = ConnectionRequest::new("1.2.4.8", 443).unwrap();
        assert!(!rule.matches(&request));
    }

    #[test]
    fn test_missing_database_file() {
        let db = CountryDatabase::open(Path::new("/nonexistent/GeoLite2-Country.mmdb"));
        assert!(!db.is_loaded());
        assert_eq!(db.country_of("8.8.8.8".parse().unwrap()), None);
    }
}
