//! SOAP request parsing.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).

use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::DateTime;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::config::{BindingStyle, ClassMap, SoapVersion};
use crate::error::GatewayError;
use crate::value::{SoapStruct, SoapValue};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const SOAP_ENC_NS: &str = "http://schemas.xmlsoap.org/soap/encoding/";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";

/// Default limit on element nesting, envelope included.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Role URIs that address every SOAP node.
const NEXT_ROLES: [&str; 2] = [
    "http://schemas.xmlsoap.org/soap/actor/next",
    "http://www.w3.org/2003/05/soap-envelope/role/next",
];

static METHOD_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<.*?:Body[^>]*>\s*<.*?:([A-Za-z0-9_]+)").expect("method name pattern is valid")
});

/// Locate the requested method name in a raw request body: the first
/// prefixed element following a prefixed `Body` start tag. Returns an empty
/// string when the body does not match.
pub fn scan_method_name(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    METHOD_NAME
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// A parsed SOAP request.
#[derive(Debug, Clone)]
pub struct SoapRequest {
    /// Detected SOAP version
    pub version: SoapVersion,
    /// Header blocks
    pub headers: Vec<HeaderBlock>,
    /// Operation element local name
    pub operation: String,
    /// Operation element namespace
    pub operation_namespace: Option<String>,
    /// Decoded operation arguments, positional
    pub arguments: Vec<SoapValue>,
}

/// A SOAP header block.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    /// Element local name
    pub local_name: String,
    /// Element namespace URI
    pub namespace: Option<String>,
    /// Must understand flag
    pub must_understand: bool,
    /// Targeted actor (1.1) or role (1.2)
    pub actor: Option<String>,
}

impl HeaderBlock {
    /// Whether this block is addressed to a node acting as `actor`.
    pub fn targets(&self, actor: Option<&str>) -> bool {
        match self.actor.as_deref() {
            None => true,
            Some(a) if NEXT_ROLES.contains(&a) => true,
            Some(a) => actor == Some(a),
        }
    }
}

/// Minimal element tree built from the event stream.
#[derive(Debug, Default)]
struct Element {
    local_name: String,
    namespace: Option<String>,
    /// Attributes by local name, namespace declarations excluded
    attributes: Vec<(String, String)>,
    /// Namespace bindings in scope, used to resolve QName attribute values
    scope: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == local_name)
            .map(|(_, v)| v.as_str())
    }

    /// Split a QName attribute value into (namespace, local name).
    fn resolve_qname<'a>(&self, value: &'a str) -> (Option<&str>, &'a str) {
        let (prefix, local) = match value.split_once(':') {
            Some((p, l)) => (p, l),
            None => ("", value),
        };
        let ns = self
            .scope
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str());
        (ns, local)
    }
}

/// Parse raw bytes as a SOAP request. Documents nesting deeper than
/// `max_depth` elements are rejected before any decoding.
pub fn parse_request(
    data: &[u8],
    style: BindingStyle,
    class_map: &ClassMap,
    max_depth: usize,
) -> Result<SoapRequest, GatewayError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| GatewayError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    check_xxe_patterns(xml_str)?;

    let root = build_tree(xml_str, max_depth)?;

    let version = match root.namespace.as_deref() {
        Some(SOAP_11_NS) if root.local_name == "Envelope" => SoapVersion::Soap11,
        Some(SOAP_12_NS) if root.local_name == "Envelope" => SoapVersion::Soap12,
        _ => {
            return Err(GatewayError::VersionMismatch(
                "No valid SOAP Envelope found with recognized namespace".to_string(),
            ))
        }
    };
    let envelope_ns = version.envelope_ns();

    let in_envelope_ns =
        |e: &&Element, name: &str| e.local_name == name && e.namespace.as_deref() == Some(envelope_ns);

    let headers = root
        .children
        .iter()
        .find(|e| in_envelope_ns(e, "Header"))
        .map(|header| {
            header
                .children
                .iter()
                .map(|block| HeaderBlock {
                    local_name: block.local_name.clone(),
                    namespace: block.namespace.clone(),
                    must_understand: matches!(
                        block.attribute("mustUnderstand"),
                        Some("1") | Some("true")
                    ),
                    actor: block
                        .attribute("actor")
                        .or_else(|| block.attribute("role"))
                        .map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    let body = root
        .children
        .iter()
        .find(|e| in_envelope_ns(e, "Body"))
        .ok_or_else(|| GatewayError::InvalidEnvelope("SOAP Body is missing".to_string()))?;

    let operation = body
        .children
        .first()
        .ok_or_else(|| GatewayError::InvalidEnvelope("SOAP Body is empty".to_string()))?;

    let params = operation
        .children
        .iter()
        .map(|param| decode_value(param, class_map))
        .collect::<Result<Vec<_>, _>>()?;

    let arguments = match style {
        BindingStyle::Rpc => params,
        BindingStyle::Document => vec![SoapValue::Array(params)],
    };

    Ok(SoapRequest {
        version,
        headers,
        operation: operation.local_name.clone(),
        operation_namespace: operation.namespace.clone(),
        arguments,
    })
}

fn build_tree(xml: &str, max_depth: usize) -> Result<Element, GatewayError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                check_depth(stack.len() + 1, max_depth)?;
                let element = open_element(e, &mut scopes)?;
                stack.push(element);
            }

            Ok(Event::Empty(ref e)) => {
                check_depth(stack.len() + 1, max_depth)?;
                let element = open_element(e, &mut scopes)?;
                scopes.pop();
                attach(element, &mut stack, &mut root);
            }

            Ok(Event::End(_)) => {
                scopes.pop();
                if let Some(element) = stack.pop() {
                    attach(element, &mut stack, &mut root);
                }
            }

            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| GatewayError::XmlParse(format!("XML parse error: {}", e)))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }

            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }

            Ok(Event::DocType(_)) => {
                return Err(GatewayError::XmlParse(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }

            Ok(Event::Eof) => break,

            Err(e) => {
                return Err(GatewayError::XmlParse(format!(
                    "XML parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }

            _ => {}
        }

        buf.clear();
    }

    if !stack.is_empty() {
        return Err(GatewayError::XmlParse("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| GatewayError::XmlParse("document has no root element".to_string()))
}

fn check_depth(depth: usize, max_depth: usize) -> Result<(), GatewayError> {
    if depth > max_depth {
        return Err(GatewayError::XmlParse(format!(
            "maximum nesting depth of {} exceeded",
            max_depth
        )));
    }
    Ok(())
}

/// Build an element from a start tag and push its namespace scope.
fn open_element(
    e: &BytesStart,
    scopes: &mut Vec<Vec<(String, String)>>,
) -> Result<Element, GatewayError> {
    let mut declared = Vec::new();
    let mut attributes = Vec::new();

    for attr in e.attributes() {
        let attr = attr.map_err(|e| GatewayError::XmlParse(format!("invalid attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
        let value = attr
            .unescape_value()
            .map_err(|e| GatewayError::XmlParse(format!("invalid attribute value: {}", e)))?
            .into_owned();

        if key == "xmlns" {
            declared.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.push((prefix.to_string(), value));
        } else {
            let local = key.rsplit(':').next().unwrap_or(key);
            attributes.push((local.to_string(), value));
        }
    }
    scopes.push(declared);

    let scope: Vec<(String, String)> = scopes.iter().flatten().cloned().collect();

    let name = std::str::from_utf8(e.name().as_ref()).unwrap_or("").to_string();
    let (prefix, local_name) = match name.split_once(':') {
        Some((p, l)) => (p.to_string(), l.to_string()),
        None => (String::new(), name.clone()),
    };
    let namespace = scope
        .iter()
        .rev()
        .find(|(p, _)| *p == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty());

    Ok(Element {
        local_name,
        namespace,
        attributes,
        scope,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(element: Element, stack: &mut [Element], root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Decode an argument element into a value, honoring `xsi:type`,
/// `xsi:nil` and the class map.
fn decode_value(element: &Element, class_map: &ClassMap) -> Result<SoapValue, GatewayError> {
    if matches!(element.attribute("nil"), Some("true") | Some("1")) {
        return Ok(SoapValue::Null);
    }

    let declared = element.attribute("type").map(|t| element.resolve_qname(t));
    let text = element.text.as_str();
    let invalid = |ty: &str| {
        GatewayError::InvalidEnvelope(format!(
            "element '{}' holds an invalid {} value",
            element.local_name, ty
        ))
    };

    if let Some((ns, ty)) = declared {
        let builtin = ns.is_none() || ns == Some(XSD_NS) || ns == Some(SOAP_ENC_NS);
        if builtin {
            match ty {
                "int" | "integer" | "long" | "short" | "byte" | "unsignedInt" | "unsignedShort"
                | "unsignedByte" | "nonNegativeInteger" | "positiveInteger" => {
                    return text.trim().parse().map(SoapValue::Int).map_err(|_| invalid(ty));
                }
                "double" | "float" | "decimal" => {
                    return text.trim().parse().map(SoapValue::Double).map_err(|_| invalid(ty));
                }
                "boolean" => {
                    return match text.trim() {
                        "true" | "1" => Ok(SoapValue::Bool(true)),
                        "false" | "0" => Ok(SoapValue::Bool(false)),
                        _ => Err(invalid(ty)),
                    };
                }
                "base64Binary" => {
                    return STANDARD
                        .decode(text.trim())
                        .map(SoapValue::Bytes)
                        .map_err(|_| invalid(ty));
                }
                "dateTime" => {
                    return DateTime::parse_from_rfc3339(text.trim())
                        .map(SoapValue::DateTime)
                        .map_err(|_| invalid(ty));
                }
                "string" | "anyURI" | "token" | "normalizedString" => {
                    return Ok(SoapValue::String(text.to_string()));
                }
                _ => {}
            }
        }

        if ty == "Array" || ty.ends_with("Array") || element.attribute("arrayType").is_some() {
            return decode_array(element, class_map);
        }

        let mut value = decode_struct(element, class_map)?;
        value.type_name = class_map.resolve(ty).map(String::from);
        return Ok(SoapValue::Struct(value));
    }

    if element.attribute("arrayType").is_some() {
        return decode_array(element, class_map);
    }

    if element.children.is_empty() {
        Ok(SoapValue::String(text.to_string()))
    } else {
        Ok(SoapValue::Struct(decode_struct(element, class_map)?))
    }
}

fn decode_array(element: &Element, class_map: &ClassMap) -> Result<SoapValue, GatewayError> {
    element
        .children
        .iter()
        .map(|child| decode_value(child, class_map))
        .collect::<Result<Vec<_>, _>>()
        .map(SoapValue::Array)
}

fn decode_struct(element: &Element, class_map: &ClassMap) -> Result<SoapStruct, GatewayError> {
    let mut value = SoapStruct::new();
    for child in &element.children {
        value.push(child.local_name.clone(), decode_value(child, class_map)?);
    }
    Ok(value)
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), GatewayError> {
    // DOCTYPE detection
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(GatewayError::XmlParse(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    // External entity patterns
    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(GatewayError::XmlParse(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_rpc(xml: &str) -> Result<SoapRequest, GatewayError> {
        parse_request(xml.as_bytes(), BindingStyle::Rpc, &ClassMap::new(), DEFAULT_MAX_DEPTH)
    }

    const SOAP_11_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <m:Trans xmlns:m="http://example.org/trans">234</m:Trans>
  </soap:Header>
  <soap:Body>
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples</m:Item>
      <m:Quantity>3</m:Quantity>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_SAMPLE: &str = r#"<?xml version="1.0"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </env:Body>
</env:Envelope>"#;

    #[test]
    fn test_parse_soap_11() {
        let request = parse_rpc(SOAP_11_SAMPLE).unwrap();
        assert_eq!(request.version, SoapVersion::Soap11);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers[0].local_name, "Trans");
        assert_eq!(request.operation, "GetPrice");
        assert_eq!(
            request.operation_namespace.as_deref(),
            Some("http://example.org/stock")
        );
        assert_eq!(
            request.arguments,
            vec![SoapValue::from("Apples"), SoapValue::from("3")]
        );
    }

    #[test]
    fn test_parse_soap_12() {
        let request = parse_rpc(SOAP_12_SAMPLE).unwrap();
        assert_eq!(request.version, SoapVersion::Soap12);
        assert!(request.headers.is_empty());
        assert_eq!(request.operation, "GetUser");
    }

    #[test]
    fn test_document_style_wraps_arguments() {
        let request = parse_request(
            SOAP_11_SAMPLE.as_bytes(),
            BindingStyle::Document,
            &ClassMap::new(),
            DEFAULT_MAX_DEPTH,
        )
        .unwrap();
        assert_eq!(
            request.arguments,
            vec![SoapValue::Array(vec![
                SoapValue::from("Apples"),
                SoapValue::from("3")
            ])]
        );
    }

    #[test]
    fn test_typed_arguments_and_class_map() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
    xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xmlns:xsd="http://www.w3.org/2001/XMLSchema"
    xmlns:tns="urn:shop">
  <soap:Body>
    <tns:placeOrder>
      <order xsi:type="tns:Order">
        <id xsi:type="xsd:int">42</id>
        <express xsi:type="xsd:boolean">true</express>
        <payload xsi:type="xsd:base64Binary">aGVsbG8=</payload>
      </order>
      <note xsi:nil="true"/>
      <when xsi:type="xsd:dateTime">2025-01-01T10:00:00Z</when>
    </tns:placeOrder>
  </soap:Body>
</soap:Envelope>"#;
        let class_map = ClassMap::new().map("Order", "shop::Order");
        let request =
            parse_request(xml.as_bytes(), BindingStyle::Rpc, &class_map, DEFAULT_MAX_DEPTH)
                .unwrap();
        assert_eq!(request.arguments.len(), 3);

        let order = request.arguments[0].as_struct().unwrap();
        assert_eq!(order.type_name.as_deref(), Some("shop::Order"));
        assert_eq!(order.get("id"), Some(&SoapValue::Int(42)));
        assert_eq!(order.get("express"), Some(&SoapValue::Bool(true)));
        assert_eq!(order.get("payload"), Some(&SoapValue::Bytes(b"hello".to_vec())));
        assert!(request.arguments[1].is_null());
        assert!(matches!(request.arguments[2], SoapValue::DateTime(_)));
    }

    #[test]
    fn test_invalid_typed_value() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
    xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <soap:Body><m:add xmlns:m="urn:calc"><a xsi:type="xsd:int">lots</a></m:add></soap:Body>
</soap:Envelope>"#;
        let err = parse_rpc(xml).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_header_must_understand_and_actor() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <t:Token xmlns:t="urn:auth" soap:mustUnderstand="1" soap:actor="urn:other"/>
  </soap:Header>
  <soap:Body><m:ping xmlns:m="urn:svc"/></soap:Body>
</soap:Envelope>"#;
        let request = parse_rpc(xml).unwrap();
        let block = &request.headers[0];
        assert!(block.must_understand);
        assert!(!block.targets(Some("urn:gateway")));
        assert!(block.targets(Some("urn:other")));
        assert!(request.arguments.is_empty());
    }

    #[test]
    fn test_missing_body() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"/>"#;
        let err = parse_rpc(xml).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_unknown_envelope_namespace() {
        let xml = r#"<x:Envelope xmlns:x="urn:not-soap"><x:Body/></x:Envelope>"#;
        let err = parse_rpc(xml).unwrap_err();
        assert_eq!(err.fault_code(), "VersionMismatch");
    }

    #[test]
    fn test_xxe_detection() {
        let xxe_payload = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;

        let err = parse_rpc(xxe_payload).unwrap_err();
        assert!(matches!(err, GatewayError::XmlParse(_)));
    }

    fn nested_request(levels: usize) -> String {
        format!(
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><m:greet xmlns:m="urn:svc">{}{}</m:greet></soap:Body></soap:Envelope>"#,
            "<x>".repeat(levels),
            "</x>".repeat(levels)
        )
    }

    #[test]
    fn test_max_depth_exceeded() {
        let err = parse_rpc(&nested_request(100_000)).unwrap_err();
        assert!(matches!(err, GatewayError::XmlParse(ref m) if m.contains("nesting depth")));

        // Envelope, Body and the operation take three levels
        let xml = nested_request(3);
        let err = parse_request(xml.as_bytes(), BindingStyle::Rpc, &ClassMap::new(), 5).unwrap_err();
        assert!(matches!(err, GatewayError::XmlParse(_)));
    }

    #[test]
    fn test_max_depth_counts_empty_elements() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><m:ping xmlns:m="urn:svc"><a><b/></a></m:ping></soap:Body></soap:Envelope>"#;
        assert!(parse_request(xml.as_bytes(), BindingStyle::Rpc, &ClassMap::new(), 5).is_ok());
        assert!(parse_request(xml.as_bytes(), BindingStyle::Rpc, &ClassMap::new(), 4).is_err());
    }

    #[test]
    fn test_scan_method_name() {
        let body = br#"<?xml version="1.0"?><SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ns="urn:test"><SOAP-ENV:Body><ns:soapTest><myClass/></ns:soapTest></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;
        assert_eq!(scan_method_name(body), "soapTest");
    }

    #[test]
    fn test_scan_method_name_across_lines() {
        assert_eq!(scan_method_name(SOAP_11_SAMPLE.as_bytes()), "GetPrice");
    }

    #[test]
    fn test_scan_method_name_no_match() {
        assert_eq!(scan_method_name(b"<Envelope><Body><ping/></Body></Envelope>"), "");
        assert_eq!(scan_method_name(b"not xml at all"), "");
        assert_eq!(scan_method_name(b""), "");
    }
}
