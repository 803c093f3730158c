//! Request dispatch: WSDL orchestration, engine configuration, provider
//! invocation and fault translation.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::binding::BindingWrapper;
use crate::config::ServiceConfig;
use crate::engine::{EngineOptions, SoapEngine, XmlSoapEngine};
use crate::error::{Failure, Fault, GatewayError, ProviderError};
use crate::parser::scan_method_name;
use crate::provider::{ProviderCatalog, ServiceProvider};
use crate::wsdl::{cache_key, DescriptorWsdlGenerator, WsdlCache, WsdlGenerator};

/// Where the response of the current request goes.
pub trait ResponseSink {
    fn set_content_type(&mut self, content_type: &str, charset: &str);

    fn set_status(&mut self, status: u16);

    /// Replace the response body.
    fn write_body(&mut self, body: &[u8]);
}

/// A response held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedResponse {
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `Content-Type` header value, e.g. `text/xml; charset=UTF-8`.
    pub fn content_type_header(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        Some(match self.charset.as_deref() {
            Some(charset) if !charset.is_empty() => {
                format!("{}; charset={}", content_type, charset)
            }
            _ => content_type.to_string(),
        })
    }
}

impl ResponseSink for BufferedResponse {
    fn set_content_type(&mut self, content_type: &str, charset: &str) {
        self.content_type = Some(content_type.to_string());
        self.charset = Some(charset.to_string());
    }

    fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    fn write_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
    }
}

/// The hosting application around a dispatch.
pub trait Host {
    fn response(&mut self) -> &mut dyn ResponseSink;

    /// End-of-request processing, run before a fault is emitted.
    fn after_request(&mut self);

    /// End the current request with a process exit status.
    fn terminate(&mut self, status: i32);
}

/// Observable host interactions, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    AfterRequest,
    BodyWritten { status: Option<u16> },
    Terminated(i32),
}

/// A host that buffers the response and records what happened to it.
///
/// Termination is recorded rather than performed; the embedding program
/// decides how to honour it.
#[derive(Debug, Default)]
pub struct BufferedHost {
    pub response: BufferedResponse,
    pub events: Vec<HostEvent>,
}

impl BufferedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit status requested through [`Host::terminate`], if any.
    pub fn exit_status(&self) -> Option<i32> {
        self.events.iter().find_map(|event| match event {
            HostEvent::Terminated(status) => Some(*status),
            _ => None,
        })
    }
}

impl ResponseSink for BufferedHost {
    fn set_content_type(&mut self, content_type: &str, charset: &str) {
        self.response.set_content_type(content_type, charset);
    }

    fn set_status(&mut self, status: u16) {
        self.response.set_status(status);
    }

    fn write_body(&mut self, body: &[u8]) {
        self.response.write_body(body);
        self.events.push(HostEvent::BodyWritten {
            status: self.response.status,
        });
    }
}

impl Host for BufferedHost {
    fn response(&mut self) -> &mut dyn ResponseSink {
        self
    }

    fn after_request(&mut self) {
        self.events.push(HostEvent::AfterRequest);
    }

    fn terminate(&mut self, status: i32) {
        self.events.push(HostEvent::Terminated(status));
    }
}

/// Progress of a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchState {
    #[default]
    Idle,
    Configuring,
    Dispatching,
    Succeeded,
    Faulted,
}

/// Per-request invocation context, handed to lifecycle hooks.
pub struct DispatchContext<'a> {
    config: &'a ServiceConfig,
    body: &'a [u8],
    method: OnceCell<String>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(config: &'a ServiceConfig, body: &'a [u8]) -> Self {
        Self {
            config,
            body,
            method: OnceCell::new(),
        }
    }

    /// Name of the invoked operation, scanned from the raw body on first
    /// use. Empty when the body carries none.
    pub fn method_name(&self) -> &str {
        self.method.get_or_init(|| scan_method_name(self.body))
    }

    pub fn body(&self) -> &[u8] {
        self.body
    }

    pub fn config(&self) -> &ServiceConfig {
        self.config
    }
}

impl fmt::Debug for DispatchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("body_len", &self.body.len())
            .field("method", &self.method.get())
            .finish()
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The engine handled the request
    Completed,
    /// The provider's `before_method` hook declined the call
    Aborted,
    /// A fault was emitted and the host asked to terminate
    Faulted(Fault),
}

/// Exposes one service provider as a SOAP endpoint.
pub struct SoapDispatcher {
    config: ServiceConfig,
    catalog: Arc<ProviderCatalog>,
    generator: Box<dyn WsdlGenerator>,
    engine: Box<dyn SoapEngine>,
    caches: HashMap<String, Arc<dyn WsdlCache>>,
    provider: Option<Box<dyn ServiceProvider>>,
    wrapper: BindingWrapper,
    state: DispatchState,
}

impl SoapDispatcher {
    pub fn new(config: ServiceConfig, catalog: Arc<ProviderCatalog>) -> Self {
        let generator = DescriptorWsdlGenerator::new(catalog.clone(), config.generator.clone());
        let engine = XmlSoapEngine::new();
        let wrapper = BindingWrapper::select(config.binding_style(), engine.supports_direct_binding());

        Self {
            config,
            catalog,
            generator: Box::new(generator),
            engine: Box::new(engine),
            caches: HashMap::new(),
            provider: None,
            wrapper,
            state: DispatchState::Idle,
        }
    }

    /// Serve an already-built provider instead of instantiating the
    /// configured type.
    pub fn with_provider(mut self, provider: Box<dyn ServiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a WSDL cache under an id, matched against `cache_id`.
    pub fn with_cache(mut self, id: impl Into<String>, cache: Arc<dyn WsdlCache>) -> Self {
        self.caches.insert(id.into(), cache);
        self
    }

    pub fn with_generator(mut self, generator: Box<dyn WsdlGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_engine(mut self, engine: Box<dyn SoapEngine>) -> Self {
        self.wrapper =
            BindingWrapper::select(self.config.binding_style(), engine.supports_direct_binding());
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn wrapper(&self) -> BindingWrapper {
        self.wrapper
    }

    /// State reached by the most recent [`run`](Self::run).
    pub fn state(&self) -> DispatchState {
        self.state
    }

    fn provider_type(&self) -> Result<String, GatewayError> {
        if let Some(provider) = &self.provider {
            return Ok(provider.type_name().to_string());
        }
        let name = self.config.provider.as_deref().ok_or_else(|| {
            GatewayError::Configuration("no service provider configured".to_string())
        })?;
        if !self.catalog.contains(name) {
            return Err(GatewayError::Configuration(format!(
                "unknown service provider type '{}'",
                name
            )));
        }
        Ok(name.to_string())
    }

    fn wsdl_cache(&self) -> Option<&Arc<dyn WsdlCache>> {
        if !self.config.wsdl_caching_enabled() {
            return None;
        }
        self.config
            .cache_id
            .as_str()
            .and_then(|id| self.caches.get(id))
    }

    /// The WSDL of the served provider, from cache when possible.
    pub fn generate_wsdl(&self) -> Result<String, GatewayError> {
        let provider_type = self.provider_type()?;
        let service_url = self
            .config
            .service_url
            .as_deref()
            .ok_or_else(|| GatewayError::Configuration("service URL is not set".to_string()))?;

        let cache = self.wsdl_cache();
        let key = cache_key(&provider_type, service_url, &self.config.encoding);

        if let Some(cache) = cache {
            if let Some(wsdl) = cache.get(&key) {
                debug!(provider = %provider_type, "WSDL served from cache");
                return Ok(wsdl);
            }
        }

        let wsdl = self
            .generator
            .generate(&provider_type, service_url, &self.config.encoding)?;

        if let Some(cache) = cache {
            cache.set(
                &key,
                wsdl.clone(),
                Duration::from_secs(self.config.wsdl_cache_duration),
            );
            debug!(
                provider = %provider_type,
                ttl_secs = self.config.wsdl_cache_duration,
                "WSDL cached"
            );
        }

        Ok(wsdl)
    }

    /// Write the WSDL into a response.
    pub fn render_wsdl(&self, sink: &mut dyn ResponseSink) -> Result<String, GatewayError> {
        let wsdl = self.generate_wsdl()?;
        sink.set_content_type("text/xml", &self.config.encoding);
        sink.set_status(200);
        sink.write_body(wsdl.as_bytes());
        Ok(wsdl)
    }

    /// Handle one SOAP request.
    ///
    /// Configuration problems are returned as errors. Everything that goes
    /// wrong while dispatching is turned into a fault written to the host's
    /// response, after which the host is asked to terminate.
    pub fn run(&mut self, body: &[u8], host: &mut dyn Host) -> Result<RunOutcome, GatewayError> {
        self.state = DispatchState::Idle;
        let options = EngineOptions::from_config(&self.config)?;
        host.response()
            .set_content_type("text/xml", &self.config.encoding);

        self.state = DispatchState::Configuring;
        if let Err(e) = self.engine.configure(options) {
            self.state = DispatchState::Idle;
            return Err(e);
        }

        self.state = DispatchState::Dispatching;
        let result = {
            let ctx = DispatchContext::new(&self.config, body);
            info!(
                method = ctx.method_name(),
                body_len = body.len(),
                wrapper = ?self.wrapper,
                "Handling SOAP request"
            );
            dispatch(
                &mut *self.engine,
                &mut self.provider,
                &self.catalog,
                self.wrapper,
                &ctx,
                host.response(),
            )
        };

        match result {
            Ok(outcome) => {
                self.state = DispatchState::Succeeded;
                trace!(outcome = ?outcome, "SOAP request finished");
                Ok(outcome)
            }
            Err(failure) => {
                self.state = DispatchState::Faulted;
                Ok(RunOutcome::Faulted(self.emit_fault(failure, host)))
            }
        }
    }

    fn emit_fault(&mut self, failure: Failure, host: &mut dyn Host) -> Fault {
        let location = failure.location();
        if failure.error().is_reported_upstream() {
            debug!(
                fault_code = failure.error().fault_code(),
                "Failure already reported upstream"
            );
        } else {
            error!(
                fault_code = failure.error().fault_code(),
                location = %format_args!("{}:{}", location.file(), location.line()),
                error = ?failure.error(),
                "Unhandled failure during SOAP dispatch"
            );
        }

        let fault = Fault::from_failure(&failure, self.config.debug);
        host.after_request();
        self.engine.fault(&fault, host.response());
        host.terminate(1);
        fault
    }
}

fn dispatch(
    engine: &mut dyn SoapEngine,
    bound: &mut Option<Box<dyn ServiceProvider>>,
    catalog: &ProviderCatalog,
    wrapper: BindingWrapper,
    ctx: &DispatchContext<'_>,
    sink: &mut dyn ResponseSink,
) -> Result<RunOutcome, Failure> {
    let mut resolved: Box<dyn ServiceProvider>;
    let provider: &mut dyn ServiceProvider = match bound {
        Some(provider) => provider.as_mut(),
        None => {
            let name = ctx.config().provider.as_deref().ok_or_else(|| {
                GatewayError::Configuration("no service provider configured".to_string())
            })?;
            resolved = catalog.instantiate(name)?;
            resolved.as_mut()
        }
    };

    if let Some(mode) = ctx.config().persistence {
        engine.set_persistence(mode)?;
    }

    let invocation = panic::catch_unwind(AssertUnwindSafe(|| -> Result<RunOutcome, Failure> {
        let gated = match provider.lifecycle() {
            Some(hooks) => {
                if !hooks.before_method(ctx) {
                    debug!(method = ctx.method_name(), "Call declined by before_method");
                    return Ok(RunOutcome::Aborted);
                }
                true
            }
            None => false,
        };

        engine.handle(ctx.body(), &mut wrapper.bind(&mut *provider), &mut *sink)?;

        if gated {
            if let Some(hooks) = provider.lifecycle() {
                hooks.after_method(ctx);
            }
        }
        Ok(RunOutcome::Completed)
    }));

    match invocation {
        Ok(result) => result,
        Err(payload) => Err(ProviderError::reported("Panic", panic_message(payload.as_ref())).into()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "provider panicked".to_string()
    }
}
