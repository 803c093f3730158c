//! Configuration types for the SOAP gateway.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::GatewayError;

/// Per-service configuration.
///
/// Immutable for the duration of a request. Loadable from YAML:
///
/// ```yaml
/// provider: "StockService"
/// wsdl_url: "http://example.org/soap"
/// service_url: "http://example.org/soap?ws=1"
/// wsdl_cache_duration: 3600
/// soap_version: "1.1"
/// class_map:
///   Quote: "stock::Quote"
/// generator:
///   binding_style: document
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Provider type identifier, resolved through the provider catalog
    /// unless an instance is bound to the dispatcher
    pub provider: Option<String>,

    /// URL of the WSDL document, required to handle requests
    pub wsdl_url: Option<String>,

    /// URL of the service endpoint, required to generate the WSDL
    pub service_url: Option<String>,

    /// Seconds a generated WSDL stays valid in cache (0 disables caching)
    pub wsdl_cache_duration: u64,

    /// Cache component used for WSDL documents (`false` disables caching)
    pub cache_id: CacheId,

    /// Character encoding of the service
    pub encoding: String,

    /// WSDL complex type name to native type identifier
    pub class_map: ClassMap,

    /// SOAP actor URI of this node
    pub actor: Option<String>,

    /// SOAP version enforced by the engine (unset accepts both)
    pub soap_version: Option<SoapVersion>,

    /// Engine persistence mode
    pub persistence: Option<PersistenceMode>,

    /// Options handed to the WSDL generator
    pub generator: GeneratorConfig,

    /// Debug mode: detailed fault strings, engine WSDL cache disabled
    pub debug: bool,

    /// Maximum element nesting depth of an incoming envelope
    pub max_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            provider: None,
            wsdl_url: None,
            service_url: None,
            wsdl_cache_duration: 0,
            cache_id: CacheId::default(),
            encoding: "UTF-8".to_string(),
            class_map: ClassMap::default(),
            actor: None,
            soap_version: None,
            persistence: None,
            generator: GeneratorConfig::default(),
            debug: false,
            max_depth: crate::parser::DEFAULT_MAX_DEPTH,
        }
    }
}

impl ServiceConfig {
    /// Configuration for a provider type served at the given URLs.
    pub fn new(
        provider: impl Into<String>,
        wsdl_url: impl Into<String>,
        service_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: Some(provider.into()),
            wsdl_url: Some(wsdl_url.into()),
            service_url: Some(service_url.into()),
            ..Default::default()
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, GatewayError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Configuration(format!("invalid service config: {}", e)))
    }

    /// Binding style requested by the generator configuration.
    pub fn binding_style(&self) -> BindingStyle {
        self.generator.binding_style
    }

    /// True when WSDL documents may be read from and written to a cache.
    pub fn wsdl_caching_enabled(&self) -> bool {
        self.wsdl_cache_duration > 0 && self.cache_id.is_enabled()
    }
}

/// Identifier of the cache component holding generated WSDL documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CacheIdRepr", into = "CacheIdRepr")]
pub enum CacheId {
    /// Caching switched off
    Disabled,
    /// Named cache component
    Id(String),
}

impl Default for CacheId {
    fn default() -> Self {
        CacheId::Id("cache".to_string())
    }
}

impl CacheId {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CacheId::Id(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheId::Id(id) => Some(id),
            CacheId::Disabled => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CacheIdRepr {
    Flag(bool),
    Id(String),
}

impl From<CacheIdRepr> for CacheId {
    fn from(repr: CacheIdRepr) -> Self {
        match repr {
            CacheIdRepr::Flag(false) => CacheId::Disabled,
            CacheIdRepr::Flag(true) => CacheId::default(),
            CacheIdRepr::Id(id) => CacheId::Id(id),
        }
    }
}

impl From<CacheId> for CacheIdRepr {
    fn from(id: CacheId) -> Self {
        match id {
            CacheId::Disabled => CacheIdRepr::Flag(false),
            CacheId::Id(id) => CacheIdRepr::Id(id),
        }
    }
}

/// Mapping from WSDL complex type names to native type identifiers.
///
/// Accepts either a YAML map or a list whose plain entries mean "the WSDL
/// type and the native type share the name".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ClassMapRepr")]
pub struct ClassMap(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassMapRepr {
    Map(BTreeMap<String, String>),
    List(Vec<ClassMapItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassMapItem {
    Same(String),
    Mapped(BTreeMap<String, String>),
}

impl From<ClassMapRepr> for ClassMap {
    fn from(repr: ClassMapRepr) -> Self {
        match repr {
            ClassMapRepr::Map(map) => ClassMap(map),
            ClassMapRepr::List(items) => {
                items
                    .into_iter()
                    .fold(ClassMap::new(), |class_map, item| match item {
                        ClassMapItem::Same(name) => class_map.same(name),
                        ClassMapItem::Mapped(entries) => entries
                            .into_iter()
                            .fold(class_map, |class_map, (wsdl_type, native)| {
                                class_map.map(wsdl_type, native)
                            }),
                    })
            }
        }
    }
}

impl ClassMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a WSDL type to a native type.
    pub fn map(mut self, wsdl_type: impl Into<String>, native: impl Into<String>) -> Self {
        self.0.insert(wsdl_type.into(), native.into());
        self
    }

    /// Map a WSDL type to the native type of the same name.
    pub fn same(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.0.insert(name.clone(), name);
        self
    }

    /// Native type for a WSDL type name.
    pub fn resolve(&self, wsdl_type: &str) -> Option<&str> {
        self.0.get(wsdl_type).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    pub fn envelope_ns(&self) -> &'static str {
        match self {
            SoapVersion::Soap11 => crate::parser::SOAP_11_NS,
            SoapVersion::Soap12 => crate::parser::SOAP_12_NS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SoapVersion::Soap11 => "1.1",
            SoapVersion::Soap12 => "1.2",
        }
    }
}

/// Persistence mode applied to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Provider state lives for one request
    Request,
    /// Provider state is kept across requests of a session
    Session,
}

/// SOAP message binding convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BindingStyle {
    /// Each parameter is a direct child of the operation element
    #[default]
    Rpc,
    /// Parameters are wrapped in one element per message
    Document,
}

impl BindingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStyle::Rpc => "rpc",
            BindingStyle::Document => "document",
        }
    }
}

/// WSDL generator options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Binding style of the generated WSDL and of request handling
    pub binding_style: BindingStyle,

    /// Target namespace (defaults to `urn:<provider type>`)
    pub namespace: Option<String>,

    /// Service name (defaults to the provider type)
    pub service_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.encoding, "UTF-8");
        assert_eq!(config.wsdl_cache_duration, 0);
        assert_eq!(config.cache_id, CacheId::Id("cache".to_string()));
        assert_eq!(config.binding_style(), BindingStyle::Rpc);
        assert!(!config.wsdl_caching_enabled());
        assert!(!config.debug);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
provider: "StockService"
wsdl_url: "http://example.org/soap"
service_url: "http://example.org/soap?ws=1"
wsdl_cache_duration: 60
soap_version: "1.2"
actor: "urn:stock:gateway"
persistence: session
class_map:
  Quote: "stock::Quote"
generator:
  binding_style: document
  namespace: "urn:stock"
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.provider.as_deref(), Some("StockService"));
        assert_eq!(config.soap_version, Some(SoapVersion::Soap12));
        assert_eq!(config.persistence, Some(PersistenceMode::Session));
        assert_eq!(config.class_map.resolve("Quote"), Some("stock::Quote"));
        assert_eq!(config.binding_style(), BindingStyle::Document);
        assert_eq!(config.generator.namespace.as_deref(), Some("urn:stock"));
        assert!(config.wsdl_caching_enabled());
    }

    #[test]
    fn test_cache_id_false_disables_caching() {
        let yaml = r#"
wsdl_cache_duration: 60
cache_id: false
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cache_id, CacheId::Disabled);
        assert!(!config.wsdl_caching_enabled());
    }

    #[test]
    fn test_class_map_list_entries() {
        let yaml = r#"
class_map:
  - Quote
  - Order: "shop::Order"
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.class_map.resolve("Quote"), Some("Quote"));
        assert_eq!(config.class_map.resolve("Order"), Some("shop::Order"));
        assert_eq!(config.class_map.len(), 2);
    }

    #[test]
    fn test_class_map_builder() {
        let class_map = ClassMap::new().same("Quote").map("Order", "shop::Order");
        assert_eq!(
            class_map.iter().collect::<Vec<_>>(),
            vec![("Order", "shop::Order"), ("Quote", "Quote")]
        );
        assert!(!class_map.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = ServiceConfig::new("Svc", "http://a/wsdl", "http://a/ws");
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = ServiceConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.provider, config.provider);
        assert_eq!(parsed.cache_id, config.cache_id);
    }

    #[test]
    fn test_max_depth_from_yaml() {
        assert_eq!(ServiceConfig::default().max_depth, crate::parser::DEFAULT_MAX_DEPTH);
        let config = ServiceConfig::from_yaml("max_depth: 12").unwrap();
        assert_eq!(config.max_depth, 12);
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = ServiceConfig::from_yaml("soap_version: \"3.0\"").unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
