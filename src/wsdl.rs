//! WSDL generation and caching.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::{BindingStyle, GeneratorConfig};
use crate::error::{xml_escape, GatewayError};
use crate::parser::{SOAP_ENC_NS, XSD_NS};
use crate::provider::{OperationDescriptor, ParamDescriptor, ProviderCatalog, ProviderType, XsdType};

const WSDL_NS: &str = "http://schemas.xmlsoap.org/wsdl/";
const WSDL_SOAP_NS: &str = "http://schemas.xmlsoap.org/wsdl/soap/";
const SOAP_HTTP_TRANSPORT: &str = "http://schemas.xmlsoap.org/soap/http";

/// Cache key of a generated WSDL document.
pub fn cache_key(provider_type: &str, service_url: &str, encoding: &str) -> String {
    format!("SoapGateway.{}{}{}", provider_type, service_url, encoding)
}

/// Key/value store for generated WSDL documents.
///
/// Shared across requests; implementations need no cross-request locking
/// beyond keeping single operations consistent.
pub trait WsdlCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, wsdl: String, ttl: Duration);
}

/// In-process TTL cache.
#[derive(Debug, Default)]
pub struct MemoryWsdlCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryWsdlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WsdlCache for MemoryWsdlCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((wsdl, expires_at)) if Instant::now() < *expires_at => Some(wsdl.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, wsdl: String, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (wsdl, expires_at));
    }
}

/// Produces the WSDL document of a provider type.
pub trait WsdlGenerator {
    fn generate(
        &self,
        provider_type: &str,
        service_url: &str,
        encoding: &str,
    ) -> Result<String, GatewayError>;
}

/// Generates WSDL 1.1 from the operation descriptors registered in a
/// provider catalog.
pub struct DescriptorWsdlGenerator {
    catalog: Arc<ProviderCatalog>,
    config: GeneratorConfig,
}

impl DescriptorWsdlGenerator {
    pub fn new(catalog: Arc<ProviderCatalog>, config: GeneratorConfig) -> Self {
        Self { catalog, config }
    }
}

impl WsdlGenerator for DescriptorWsdlGenerator {
    fn generate(
        &self,
        provider_type: &str,
        service_url: &str,
        encoding: &str,
    ) -> Result<String, GatewayError> {
        let provider = self.catalog.resolve(provider_type)?;
        trace!(
            provider = provider_type,
            operations = provider.operations.len(),
            style = self.config.binding_style.as_str(),
            "Generating WSDL"
        );
        Ok(WsdlWriter::new(provider, &self.config, service_url, encoding).write())
    }
}

struct WsdlWriter<'a> {
    provider: &'a ProviderType,
    style: BindingStyle,
    namespace: String,
    service: String,
    service_url: &'a str,
    encoding: &'a str,
    out: String,
}

impl<'a> WsdlWriter<'a> {
    fn new(
        provider: &'a ProviderType,
        config: &GeneratorConfig,
        service_url: &'a str,
        encoding: &'a str,
    ) -> Self {
        let service = ncname(config.service_name.as_deref().unwrap_or(&provider.name));
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| format!("urn:{}", service));
        Self {
            provider,
            style: config.binding_style,
            namespace,
            service,
            service_url,
            encoding,
            out: String::new(),
        }
    }

    fn line(&mut self, depth: usize, text: &str) {
        self.out.push_str(&"  ".repeat(depth));
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn write(mut self) -> String {
        let ns = xml_escape(&self.namespace);
        self.line(
            0,
            &format!("<?xml version=\"1.0\" encoding=\"{}\"?>", xml_escape(self.encoding)),
        );
        self.line(
            0,
            &format!(
                "<definitions name=\"{}\" targetNamespace=\"{}\" xmlns=\"{}\" xmlns:tns=\"{}\" xmlns:soap=\"{}\" xmlns:xsd=\"{}\" xmlns:soap-enc=\"{}\">",
                self.service,
                ns,
                WSDL_NS,
                ns,
                WSDL_SOAP_NS,
                XSD_NS,
                SOAP_ENC_NS
            ),
        );
        self.write_types();
        self.write_messages();
        self.write_port_type();
        self.write_binding();
        self.write_service();
        self.line(0, "</definitions>");
        self.out
    }

    fn write_types(&mut self) {
        let arrays = self.array_types();
        let provider = self.provider;
        if provider.complex_types.is_empty()
            && arrays.is_empty()
            && self.style == BindingStyle::Rpc
        {
            return;
        }

        let ns = xml_escape(&self.namespace);
        self.line(1, "<types>");
        self.line(2, &format!("<xsd:schema targetNamespace=\"{}\">", ns));

        for ty in &provider.complex_types {
            self.line(3, &format!("<xsd:complexType name=\"{}\">", ncname(&ty.name)));
            self.write_sequence(4, &ty.fields, false);
            self.line(3, "</xsd:complexType>");
        }

        for (name, item) in &arrays {
            self.line(3, &format!("<xsd:complexType name=\"{}\">", name));
            self.line(4, "<xsd:sequence>");
            self.line(
                5,
                &format!(
                    "<xsd:element name=\"item\" type=\"{}\" minOccurs=\"0\" maxOccurs=\"unbounded\" nillable=\"true\"/>",
                    item.qname()
                ),
            );
            self.line(4, "</xsd:sequence>");
            self.line(3, "</xsd:complexType>");
        }

        if self.style == BindingStyle::Document {
            for op in &provider.operations {
                self.line(3, &format!("<xsd:element name=\"{}\">", op.name));
                self.line(4, "<xsd:complexType>");
                self.write_sequence(5, &op.params, false);
                self.line(4, "</xsd:complexType>");
                self.line(3, "</xsd:element>");

                self.line(3, &format!("<xsd:element name=\"{}Response\">", op.name));
                self.line(4, "<xsd:complexType>");
                let result: Vec<ParamDescriptor> = op
                    .returns
                    .iter()
                    .map(|ty| ParamDescriptor {
                        name: format!("{}Result", op.name),
                        ty: ty.clone(),
                    })
                    .collect();
                self.write_sequence(5, &result, true);
                self.line(4, "</xsd:complexType>");
                self.line(3, "</xsd:element>");
            }
        }

        self.line(2, "</xsd:schema>");
        self.line(1, "</types>");
    }

    fn write_sequence(&mut self, depth: usize, fields: &[ParamDescriptor], optional: bool) {
        if fields.is_empty() {
            self.line(depth, "<xsd:sequence/>");
            return;
        }
        self.line(depth, "<xsd:sequence>");
        for field in fields {
            let min = if optional { " minOccurs=\"0\"" } else { "" };
            self.line(
                depth + 1,
                &format!(
                    "<xsd:element name=\"{}\" type=\"{}\"{}/>",
                    field.name,
                    field.ty.qname(),
                    min
                ),
            );
        }
        self.line(depth, "</xsd:sequence>");
    }

    /// Array types referenced anywhere in the provider surface, by name.
    fn array_types(&self) -> BTreeMap<String, XsdType> {
        fn collect(ty: &XsdType, found: &mut BTreeMap<String, XsdType>) {
            if let XsdType::Array(inner) = ty {
                found.insert(ty.local_name(), (**inner).clone());
                collect(inner, found);
            }
        }

        let mut found = BTreeMap::new();
        for op in &self.provider.operations {
            for param in &op.params {
                collect(&param.ty, &mut found);
            }
            if let Some(ty) = &op.returns {
                collect(ty, &mut found);
            }
        }
        for ty in &self.provider.complex_types {
            for field in &ty.fields {
                collect(&field.ty, &mut found);
            }
        }
        found
    }

    fn write_messages(&mut self) {
        let provider = self.provider;
        for op in &provider.operations {
            match self.style {
                BindingStyle::Rpc => {
                    self.write_rpc_message(&format!("{}In", op.name), &op.params);
                    let output: Vec<ParamDescriptor> = op
                        .returns
                        .iter()
                        .map(|ty| ParamDescriptor {
                            name: "return".to_string(),
                            ty: ty.clone(),
                        })
                        .collect();
                    self.write_rpc_message(&format!("{}Out", op.name), &output);
                }
                BindingStyle::Document => {
                    self.line(1, &format!("<message name=\"{}In\">", op.name));
                    self.line(
                        2,
                        &format!("<part name=\"parameters\" element=\"tns:{}\"/>", op.name),
                    );
                    self.line(1, "</message>");
                    self.line(1, &format!("<message name=\"{}Out\">", op.name));
                    self.line(
                        2,
                        &format!(
                            "<part name=\"parameters\" element=\"tns:{}Response\"/>",
                            op.name
                        ),
                    );
                    self.line(1, "</message>");
                }
            }
        }
    }

    fn write_rpc_message(&mut self, name: &str, parts: &[ParamDescriptor]) {
        if parts.is_empty() {
            self.line(1, &format!("<message name=\"{}\"/>", name));
            return;
        }
        self.line(1, &format!("<message name=\"{}\">", name));
        for part in parts {
            self.line(
                2,
                &format!("<part name=\"{}\" type=\"{}\"/>", part.name, part.ty.qname()),
            );
        }
        self.line(1, "</message>");
    }

    fn write_port_type(&mut self) {
        let provider = self.provider;
        self.line(1, &format!("<portType name=\"{}PortType\">", self.service));
        for op in &provider.operations {
            self.write_port_operation(op);
        }
        self.line(1, "</portType>");
    }

    fn write_port_operation(&mut self, op: &OperationDescriptor) {
        self.line(2, &format!("<operation name=\"{}\">", op.name));
        if let Some(doc) = &op.documentation {
            self.line(3, &format!("<documentation>{}</documentation>", xml_escape(doc)));
        }
        self.line(3, &format!("<input message=\"tns:{}In\"/>", op.name));
        self.line(3, &format!("<output message=\"tns:{}Out\"/>", op.name));
        self.line(2, "</operation>");
    }

    fn write_binding(&mut self) {
        let provider = self.provider;
        let style = self.style.as_str();
        let ns = xml_escape(&self.namespace);
        let body = match self.style {
            BindingStyle::Rpc => format!(
                "<soap:body use=\"encoded\" namespace=\"{}\" encodingStyle=\"{}\"/>",
                ns, SOAP_ENC_NS
            ),
            BindingStyle::Document => "<soap:body use=\"literal\"/>".to_string(),
        };

        self.line(
            1,
            &format!(
                "<binding name=\"{}Binding\" type=\"tns:{}PortType\">",
                self.service, self.service
            ),
        );
        self.line(
            2,
            &format!(
                "<soap:binding style=\"{}\" transport=\"{}\"/>",
                style, SOAP_HTTP_TRANSPORT
            ),
        );
        for op in &provider.operations {
            let action = xml_escape(&format!("{}#{}", self.service_url, op.name));
            self.line(2, &format!("<operation name=\"{}\">", op.name));
            self.line(
                3,
                &format!("<soap:operation soapAction=\"{}\" style=\"{}\"/>", action, style),
            );
            self.line(3, "<input>");
            self.line(4, &body);
            self.line(3, "</input>");
            self.line(3, "<output>");
            self.line(4, &body);
            self.line(3, "</output>");
            self.line(2, "</operation>");
        }
        self.line(1, "</binding>");
    }

    fn write_service(&mut self) {
        let service = self.service.clone();
        let location = xml_escape(self.service_url);
        self.line(1, &format!("<service name=\"{}Service\">", service));
        self.line(
            2,
            &format!("<port name=\"{}Port\" binding=\"tns:{}Binding\">", service, service),
        );
        self.line(3, &format!("<soap:address location=\"{}\"/>", location));
        self.line(2, "</port>");
        self.line(1, "</service>");
    }
}

/// Reduce a type identifier to a valid XML name.
fn ncname(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => cleaned,
        _ => format!("_{}", cleaned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{ComplexTypeDescriptor, ServiceProvider};
    use crate::value::SoapValue;

    struct Stub;

    impl ServiceProvider for Stub {
        fn type_name(&self) -> &str {
            "stock::StockService"
        }

        fn invoke(&mut self, method: &str, _args: Vec<SoapValue>) -> Result<SoapValue, GatewayError> {
            Err(ProviderError::new("Unsupported", method).into())
        }
    }

    fn catalog() -> Arc<ProviderCatalog> {
        let stock = ProviderType::new("stock::StockService", || {
            Box::new(Stub) as Box<dyn ServiceProvider>
        })
            .operations(vec![
                OperationDescriptor::new("getQuote")
                    .param("symbol", XsdType::String)
                    .returns(XsdType::Complex("Quote".into()))
                    .doc("Latest quote & volume"),
                OperationDescriptor::new("history")
                    .param("symbol", XsdType::String)
                    .returns(XsdType::Array(Box::new(XsdType::Double))),
                OperationDescriptor::new("ping"),
            ])
            .complex_type(
                ComplexTypeDescriptor::new("Quote")
                    .field("price", XsdType::Double)
                    .field("volume", XsdType::Int),
            );
        Arc::new(ProviderCatalog::new().with(stock))
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(
            cache_key("Svc", "http://a/ws", "UTF-8"),
            "SoapGateway.Svchttp://a/wsUTF-8"
        );
    }

    #[test]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryWsdlCache::new();
        assert!(cache.get("k").is_none());
        cache.set("k", "<definitions/>".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("<definitions/>"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_memory_cache_expiry() {
        let cache = MemoryWsdlCache::new();
        cache.set("k", "<definitions/>".to_string(), Duration::ZERO);
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_generate_rpc() {
        let generator = DescriptorWsdlGenerator::new(catalog(), GeneratorConfig::default());
        let wsdl = generator
            .generate("stock::StockService", "http://example.org/soap?ws=1", "UTF-8")
            .unwrap();

        assert!(wsdl.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(wsdl.contains("targetNamespace=\"urn:stock__StockService\""));
        assert!(wsdl.contains("<message name=\"getQuoteIn\">"));
        assert!(wsdl.contains("<part name=\"return\" type=\"tns:Quote\"/>"));
        assert!(wsdl.contains("<xsd:complexType name=\"DoubleArray\">"));
        assert!(wsdl.contains("<message name=\"pingOut\"/>"));
        assert!(wsdl.contains("<soap:binding style=\"rpc\""));
        assert!(wsdl.contains("<documentation>Latest quote &amp; volume</documentation>"));
        assert!(wsdl.contains("<soap:address location=\"http://example.org/soap?ws=1\"/>"));
    }

    #[test]
    fn test_generate_document() {
        let config = GeneratorConfig {
            binding_style: BindingStyle::Document,
            namespace: Some("urn:stock".to_string()),
            service_name: Some("Stock".to_string()),
        };
        let generator = DescriptorWsdlGenerator::new(catalog(), config);
        let wsdl = generator
            .generate("stock::StockService", "http://example.org/soap", "UTF-8")
            .unwrap();

        assert!(wsdl.contains("targetNamespace=\"urn:stock\""));
        assert!(wsdl.contains("<xsd:element name=\"getQuoteResponse\">"));
        assert!(wsdl.contains("<xsd:element name=\"getQuoteResult\" type=\"tns:Quote\" minOccurs=\"0\"/>"));
        assert!(wsdl.contains("<part name=\"parameters\" element=\"tns:getQuote\"/>"));
        assert!(wsdl.contains("<soap:body use=\"literal\"/>"));
        assert!(wsdl.contains("<service name=\"StockService\">"));
    }

    #[test]
    fn test_generate_unknown_provider() {
        let generator = DescriptorWsdlGenerator::new(catalog(), GeneratorConfig::default());
        let err = generator
            .generate("Missing", "http://example.org/soap", "UTF-8")
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_ncname() {
        assert_eq!(ncname("stock::StockService"), "stock__StockService");
        assert_eq!(ncname("1st"), "_1st");
    }
}
