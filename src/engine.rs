//! The SOAP engine: envelope decoding, operation invocation and response
//! or fault serialization.
//!
//! The dispatcher only drives the [`SoapEngine`] trait. [`XmlSoapEngine`]
//! is the built-in codec.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::binding::SoapTarget;
use crate::config::{BindingStyle, ClassMap, PersistenceMode, ServiceConfig, SoapVersion};
use crate::dispatcher::ResponseSink;
use crate::error::{Fault, GatewayError};
use crate::parser::{parse_request, SoapRequest, XSD_NS, XSI_NS};
use crate::value::SoapValue;

/// Options applied to the engine before a request is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// URL of the WSDL describing the service
    pub wsdl_url: String,
    /// Version the engine insists on, if any
    pub soap_version: Option<SoapVersion>,
    /// Actor URI of this node
    pub actor: Option<String>,
    /// Response encoding
    pub encoding: String,
    /// WSDL type name to native type name
    pub class_map: ClassMap,
    /// Argument layout of incoming operations
    pub binding_style: BindingStyle,
    /// Whether the engine may cache the WSDL it loads
    pub wsdl_cache_enabled: bool,
    /// Deepest element nesting accepted in a request
    pub max_depth: usize,
}

impl EngineOptions {
    /// Derive engine options from a service configuration. Debug mode
    /// disables engine-side WSDL caching.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, GatewayError> {
        let wsdl_url = config
            .wsdl_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("wsdl_url is required".to_string()))?;

        Ok(Self {
            wsdl_url,
            soap_version: config.soap_version,
            actor: config.actor.clone(),
            encoding: config.encoding.clone(),
            class_map: config.class_map.clone(),
            binding_style: config.binding_style(),
            wsdl_cache_enabled: !config.debug,
            max_depth: config.max_depth,
        })
    }
}

/// A SOAP protocol engine.
pub trait SoapEngine {
    /// Apply options; called once per request before anything else.
    fn configure(&mut self, options: EngineOptions) -> Result<(), GatewayError>;

    fn set_persistence(&mut self, mode: PersistenceMode) -> Result<(), GatewayError>;

    /// Whether providers can be bound without the RPC wrapper.
    fn supports_direct_binding(&self) -> bool {
        false
    }

    /// Decode the request, call the operation on `target` and write the
    /// response envelope.
    fn handle(
        &mut self,
        request: &[u8],
        target: &mut dyn SoapTarget,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), GatewayError>;

    /// Write a fault envelope.
    fn fault(&mut self, fault: &Fault, sink: &mut dyn ResponseSink);
}

/// Built-in SOAP 1.1/1.2 engine on top of quick-xml.
#[derive(Debug, Default)]
pub struct XmlSoapEngine {
    options: Option<EngineOptions>,
    persistence: Option<PersistenceMode>,
    /// Version of the request being handled, used for faults
    negotiated: Option<SoapVersion>,
}

impl XmlSoapEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(&self) -> Option<&EngineOptions> {
        self.options.as_ref()
    }

    pub fn persistence(&self) -> Option<PersistenceMode> {
        self.persistence
    }

    fn response_version(&self) -> SoapVersion {
        self.negotiated
            .or_else(|| self.options.as_ref().and_then(|o| o.soap_version))
            .unwrap_or(SoapVersion::Soap11)
    }

    fn encoding(&self) -> &str {
        self.options
            .as_ref()
            .map(|o| o.encoding.as_str())
            .unwrap_or("UTF-8")
    }

    fn check_request(&self, request: &SoapRequest, options: &EngineOptions) -> Result<(), GatewayError> {
        if let Some(expected) = options.soap_version {
            if expected != request.version {
                return Err(GatewayError::VersionMismatch(format!(
                    "expected a SOAP {} envelope, got SOAP {}",
                    expected.as_str(),
                    request.version.as_str()
                )));
            }
        }

        // No header blocks are processed here, so any mandatory block
        // addressed to this node cannot be honored.
        if let Some(block) = request
            .headers
            .iter()
            .find(|h| h.must_understand && h.targets(options.actor.as_deref()))
        {
            return Err(GatewayError::MustUnderstand(format!(
                "header block '{}' was not understood",
                block.local_name
            )));
        }

        Ok(())
    }
}

impl SoapEngine for XmlSoapEngine {
    fn configure(&mut self, options: EngineOptions) -> Result<(), GatewayError> {
        if options.encoding.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "encoding must not be empty".to_string(),
            ));
        }
        debug!(
            wsdl_url = %options.wsdl_url,
            soap_version = ?options.soap_version,
            binding_style = options.binding_style.as_str(),
            wsdl_cache = options.wsdl_cache_enabled,
            class_map_entries = options.class_map.len(),
            "SOAP engine configured"
        );
        self.options = Some(options);
        self.negotiated = None;
        Ok(())
    }

    fn set_persistence(&mut self, mode: PersistenceMode) -> Result<(), GatewayError> {
        debug!(persistence = ?mode, "SOAP engine persistence set");
        self.persistence = Some(mode);
        Ok(())
    }

    fn supports_direct_binding(&self) -> bool {
        true
    }

    fn handle(
        &mut self,
        request: &[u8],
        target: &mut dyn SoapTarget,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), GatewayError> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| GatewayError::Configuration("SOAP engine is not configured".to_string()))?;

        let request = parse_request(
            request,
            options.binding_style,
            &options.class_map,
            options.max_depth,
        )?;
        self.negotiated = Some(request.version);
        self.check_request(&request, &options)?;

        debug!(
            operation = %request.operation,
            soap_version = request.version.as_str(),
            argc = request.arguments.len(),
            "Dispatching SOAP operation"
        );

        let result = target.call(&request.operation, request.arguments.clone())?;
        let body = serialize_response(&request, &result, &options)?;

        sink.set_status(200);
        sink.write_body(body.as_bytes());
        Ok(())
    }

    fn fault(&mut self, fault: &Fault, sink: &mut dyn ResponseSink) {
        let body = fault.to_envelope(self.response_version(), self.encoding());
        sink.set_status(500);
        sink.write_body(body.as_bytes());
    }
}

/// Serialize an operation result into a response envelope.
fn serialize_response(
    request: &SoapRequest,
    result: &SoapValue,
    options: &EngineOptions,
) -> Result<String, GatewayError> {
    let ascii_only = !options.encoding.eq_ignore_ascii_case("utf-8");
    let (prefix, ns_decl) = match &request.operation_namespace {
        Some(ns) => ("tns:", format!(" xmlns:tns=\"{}\"", escape(ns, ascii_only))),
        None => ("", String::new()),
    };

    let mut body = String::new();
    match (options.binding_style, result) {
        (BindingStyle::Document, SoapValue::Null) => {}
        (BindingStyle::Document, SoapValue::Struct(fields)) => {
            body.push_str(&format!("    <{}{}Response>\n", prefix, request.operation));
            for (name, value) in &fields.fields {
                write_value(&mut body, name, value, 3, ascii_only)?;
            }
            body.push_str(&format!("    </{}{}Response>\n", prefix, request.operation));
        }
        _ => {
            body.push_str(&format!("    <{}{}Response>\n", prefix, request.operation));
            write_value(&mut body, "return", result, 3, ascii_only)?;
            body.push_str(&format!("    </{}{}Response>\n", prefix, request.operation));
        }
    }

    let body = if body.is_empty() {
        "  <soap:Body/>".to_string()
    } else {
        format!("  <soap:Body>\n{}  </soap:Body>", body)
    };

    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"{}\"?>\n<soap:Envelope xmlns:soap=\"{}\" xmlns:xsi=\"{}\" xmlns:xsd=\"{}\"{}>\n{}\n</soap:Envelope>",
        escape(&options.encoding, true),
        request.version.envelope_ns(),
        XSI_NS,
        XSD_NS,
        ns_decl,
        body
    ))
}

fn write_value(
    out: &mut String,
    name: &str,
    value: &SoapValue,
    depth: usize,
    ascii_only: bool,
) -> Result<(), GatewayError> {
    let name = element_name(name)?;
    let indent = "  ".repeat(depth);
    let typed = |ty: &str, text: &str| {
        format!(
            "{}<{} xsi:type=\"xsd:{}\">{}</{}>\n",
            indent,
            name,
            ty,
            escape(text, ascii_only),
            name
        )
    };

    match value {
        SoapValue::Null => out.push_str(&format!("{}<{} xsi:nil=\"true\"/>\n", indent, name)),
        SoapValue::Bool(b) => out.push_str(&typed("boolean", &b.to_string())),
        SoapValue::Int(i) => out.push_str(&typed("int", &i.to_string())),
        SoapValue::Double(d) => out.push_str(&typed("double", &d.to_string())),
        SoapValue::String(s) => out.push_str(&typed("string", s)),
        SoapValue::Bytes(b) => out.push_str(&typed("base64Binary", &STANDARD.encode(b))),
        SoapValue::DateTime(dt) => out.push_str(&typed("dateTime", &dt.to_rfc3339())),
        SoapValue::Array(items) => {
            out.push_str(&format!("{}<{}>\n", indent, name));
            for item in items {
                write_value(out, "item", item, depth + 1, ascii_only)?;
            }
            out.push_str(&format!("{}</{}>\n", indent, name));
        }
        SoapValue::Struct(s) => {
            out.push_str(&format!("{}<{}>\n", indent, name));
            for (field, v) in &s.fields {
                write_value(out, field, v, depth + 1, ascii_only)?;
            }
            out.push_str(&format!("{}</{}>\n", indent, name));
        }
    }
    Ok(())
}

/// Check that a field name can be written as an unprefixed element name.
fn element_name(name: &str) -> Result<&str, GatewayError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {
            chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(GatewayError::Serialization(format!(
            "'{}' is not a valid element name",
            name
        )))
    }
}

/// Escape XML text. Non-UTF-8 encodings get non-ASCII characters as
/// character references so the body stays valid in any ASCII-compatible
/// charset.
fn escape(s: &str, ascii_only: bool) -> String {
    let escaped = crate::error::xml_escape(s);
    if !ascii_only || escaped.is_ascii() {
        return escaped;
    }
    escaped
        .chars()
        .map(|c| {
            if c.is_ascii() {
                c.to_string()
            } else {
                format!("&#{};", c as u32)
            }
        })
        .collect()
}
