//! Error types and SOAP fault translation for the gateway.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::config::SoapVersion;

/// SOAP gateway errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Header not understood: {0}")]
    MustUnderstand(String),

    #[error("Cannot serialize response: {0}")]
    Serialization(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Short category name used as the SOAP fault code.
    pub fn fault_code(&self) -> &str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::MethodNotFound(_) => "MethodNotFound",
            Self::InvalidArguments { .. } => "InvalidArguments",
            Self::XmlParse(_) => "XmlParseError",
            Self::InvalidEnvelope(_) => "InvalidEnvelope",
            Self::VersionMismatch(_) => "VersionMismatch",
            Self::MustUnderstand(_) => "MustUnderstand",
            Self::Serialization(_) => "SerializationError",
            Self::Provider(e) => e.kind(),
            Self::Io(_) => "IoError",
        }
    }

    /// Whether a host error bridge already reported this failure.
    pub fn is_reported_upstream(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_reported_upstream())
    }
}

/// A failure raised by a service provider method.
///
/// Records where it was constructed and the call trace at that point.
pub struct ProviderError {
    kind: String,
    message: String,
    reported_upstream: bool,
    location: &'static Location<'static>,
    trace: Backtrace,
}

impl ProviderError {
    /// Create a provider failure of the given category.
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            reported_upstream: false,
            location: Location::caller(),
            trace: Backtrace::capture(),
        }
    }

    /// Create a failure that a host error bridge has already logged.
    #[track_caller]
    pub fn reported(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reported_upstream: true,
            ..Self::new(kind, message)
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_reported_upstream(&self) -> bool {
        self.reported_upstream
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn trace(&self) -> &Backtrace {
        &self.trace
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("reported_upstream", &self.reported_upstream)
            .field("location", &format_args!("{}:{}", self.location.file(), self.location.line()))
            .finish()
    }
}

impl std::error::Error for ProviderError {}

/// A gateway error captured on the dispatch path, with the place it
/// entered that path.
#[derive(Debug)]
pub struct Failure {
    error: GatewayError,
    location: &'static Location<'static>,
    trace: Backtrace,
}

impl Failure {
    pub fn error(&self) -> &GatewayError {
        &self.error
    }

    pub fn into_error(self) -> GatewayError {
        self.error
    }

    /// Source location: where the provider raised it, else where it was
    /// propagated into the dispatcher.
    pub fn location(&self) -> &'static Location<'static> {
        match &self.error {
            GatewayError::Provider(e) => e.location(),
            _ => self.location,
        }
    }

    pub fn trace(&self) -> &Backtrace {
        match &self.error {
            GatewayError::Provider(e) => e.trace(),
            _ => &self.trace,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl From<GatewayError> for Failure {
    #[track_caller]
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            location: Location::caller(),
            trace: Backtrace::capture(),
        }
    }
}

impl From<ProviderError> for Failure {
    #[track_caller]
    fn from(error: ProviderError) -> Self {
        Failure::from(GatewayError::Provider(error))
    }
}

/// A translated SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Short category name of the originating failure
    pub code: String,
    /// Human-readable fault string
    pub message: String,
}

impl Fault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a fault from a failure. In debug mode the fault string carries
    /// the source location, followed by the call trace when one was
    /// captured (`RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`).
    pub fn from_failure(failure: &Failure, debug: bool) -> Self {
        let mut message = match failure.error() {
            GatewayError::Provider(e) => e.message().to_string(),
            other => other.to_string(),
        };
        if debug {
            let location = failure.location();
            message.push_str(&format!(" ({}:{})", location.file(), location.line()));
            let trace = failure.trace();
            if trace.status() == BacktraceStatus::Captured {
                message.push_str(&format!("\n{}", trace));
            }
        }
        Self::new(failure.error().fault_code(), message)
    }

    /// Render the fault as a SOAP envelope.
    pub fn to_envelope(&self, version: SoapVersion, encoding: &str) -> String {
        match version {
            SoapVersion::Soap11 => soap_11_fault(self, encoding),
            SoapVersion::Soap12 => soap_12_fault(self, encoding),
        }
    }
}

/// Fault codes defined by the SOAP envelope namespace itself.
fn is_standard_code(code: &str) -> bool {
    matches!(code, "VersionMismatch" | "MustUnderstand" | "Client" | "Server")
}

fn soap_11_fault(fault: &Fault, encoding: &str) -> String {
    let code = if is_standard_code(&fault.code) {
        format!("soap:{}", fault.code)
    } else {
        fault.code.clone()
    };

    format!(
        r#"<?xml version="1.0" encoding="{}"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>{}</faultcode>
      <faultstring>{}</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        xml_escape(encoding),
        xml_escape(&code),
        xml_escape(&fault.message)
    )
}

fn soap_12_fault(fault: &Fault, encoding: &str) -> String {
    // SOAP 1.2 only allows its own code values; anything else travels as a
    // subcode of Receiver.
    let (value, subcode) = match fault.code.as_str() {
        "VersionMismatch" | "MustUnderstand" => (fault.code.as_str(), None),
        "Client" => ("Sender", None),
        "Server" => ("Receiver", None),
        other => ("Receiver", Some(other)),
    };
    let subcode = subcode
        .map(|s| {
            format!(
                "\n        <soap:Subcode>\n          <soap:Value>{}</soap:Value>\n        </soap:Subcode>",
                xml_escape(s)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="{}"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>soap:{}</soap:Value>{}
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{}</soap:Text>
      </soap:Reason>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        xml_escape(encoding),
        value,
        subcode,
        xml_escape(&fault.message)
    )
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
