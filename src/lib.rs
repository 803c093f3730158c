//! SOAP Gateway for Zentinel
//!
//! Exposes the methods of a service provider as SOAP operations: publishes
//! a WSDL description of the provider and dispatches incoming SOAP requests
//! to it, translating every failure into a SOAP fault.
//!
//! # Features
//!
//! - WSDL generation from operation descriptors, with optional TTL caching
//! - SOAP 1.1 and 1.2 envelopes, RPC and document binding styles
//! - Optional provider lifecycle hooks gating each call
//! - Fault responses carrying source location and call trace in debug mode
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_gateway::{BufferedHost, DemoService, ServiceConfig, SoapDispatcher};
//!
//! let config = ServiceConfig::new("DemoService", "http://localhost/ws?wsdl", "http://localhost/ws");
//! let mut dispatcher = SoapDispatcher::new(config, DemoService::catalog());
//! let mut host = BufferedHost::new();
//! dispatcher.run(request_body, &mut host)?;
//! ```

pub mod binding;
pub mod config;
pub mod demo;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod parser;
pub mod provider;
pub mod value;
pub mod wsdl;

pub use binding::BindingWrapper;
pub use config::ServiceConfig;
pub use demo::DemoService;
pub use dispatcher::{BufferedHost, DispatchContext, Host, ResponseSink, RunOutcome, SoapDispatcher};
pub use engine::{SoapEngine, XmlSoapEngine};
pub use error::{Fault, GatewayError, ProviderError};
pub use provider::{LifecycleHooks, ProviderCatalog, ServiceProvider};
pub use value::SoapValue;
pub use wsdl::{MemoryWsdlCache, WsdlCache, WsdlGenerator};
