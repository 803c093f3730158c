//! Built-in demonstration provider served by the gateway binary.

use std::sync::{Arc, LazyLock};

use tracing::debug;

use crate::dispatcher::DispatchContext;
use crate::error::{GatewayError, ProviderError};
use crate::provider::{
    ComplexTypeDescriptor, LifecycleHooks, MethodRegistry, OperationDescriptor, ProviderCatalog,
    ProviderType, ServiceProvider, XsdType,
};
use crate::value::{SoapStruct, SoapValue};

pub const DEMO_SERVICE: &str = "DemoService";

static METHODS: LazyLock<MethodRegistry<DemoService>> = LazyLock::new(|| {
    MethodRegistry::<DemoService>::new()
        .register(
            OperationDescriptor::new("add")
                .param("a", XsdType::Int)
                .param("b", XsdType::Int)
                .returns(XsdType::Int)
                .doc("Sum of two integers"),
            |_, args| {
                let a = int_arg(&args, 0, "a")?;
                let b = int_arg(&args, 1, "b")?;
                a.checked_add(b)
                    .map(SoapValue::Int)
                    .ok_or_else(|| ProviderError::new("Overflow", "integer overflow"))
            },
        )
        .register(
            OperationDescriptor::new("greet")
                .param("name", XsdType::String)
                .returns(XsdType::String),
            |_, args| {
                let name = args[0].as_str().unwrap_or("stranger");
                Ok(SoapValue::from(format!("Hello, {}", name)))
            },
        )
        .register(
            OperationDescriptor::new("getQuote")
                .param("symbol", XsdType::String)
                .returns(XsdType::Complex("Quote".to_string())),
            |_, args| {
                let symbol = args[0]
                    .as_str()
                    .ok_or_else(|| ProviderError::new("InvalidSymbol", "symbol must be a string"))?;
                let price = match symbol {
                    "ACME" => 12.5,
                    "INIT" => 101.25,
                    other => {
                        return Err(ProviderError::new(
                            "UnknownSymbol",
                            format!("no quote for '{}'", other),
                        ))
                    }
                };
                Ok(SoapValue::Struct(
                    SoapStruct::typed("Quote")
                        .with_field("symbol", symbol)
                        .with_field("price", price),
                ))
            },
        )
        .register(
            OperationDescriptor::new("history")
                .returns(XsdType::Array(Box::new(XsdType::String))),
            |demo, _| {
                Ok(SoapValue::Array(
                    demo.handled.iter().map(|m| SoapValue::from(m.as_str())).collect(),
                ))
            },
        )
});

fn int_arg(args: &[SoapValue], index: usize, name: &str) -> Result<i64, ProviderError> {
    args[index]
        .as_i64()
        .ok_or_else(|| ProviderError::new("InvalidArgument", format!("'{}' must be an integer", name)))
}

/// Small arithmetic and quote service.
#[derive(Debug, Default)]
pub struct DemoService {
    handled: Vec<String>,
}

impl DemoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider type registration carrying the operation descriptors.
    pub fn provider_type() -> ProviderType {
        ProviderType::new(DEMO_SERVICE, || Box::new(DemoService::new()) as Box<dyn ServiceProvider>)
            .operations(METHODS.descriptors())
            .complex_type(
                ComplexTypeDescriptor::new("Quote")
                    .field("symbol", XsdType::String)
                    .field("price", XsdType::Double),
            )
    }

    /// A catalog holding only this service.
    pub fn catalog() -> Arc<ProviderCatalog> {
        Arc::new(ProviderCatalog::new().with(Self::provider_type()))
    }
}

impl ServiceProvider for DemoService {
    fn type_name(&self) -> &str {
        DEMO_SERVICE
    }

    fn invoke(&mut self, method: &str, args: Vec<SoapValue>) -> Result<SoapValue, GatewayError> {
        METHODS.invoke(self, method, args)
    }

    fn lifecycle(&mut self) -> Option<&mut dyn LifecycleHooks> {
        Some(self)
    }
}

impl LifecycleHooks for DemoService {
    fn before_method(&mut self, ctx: &DispatchContext<'_>) -> bool {
        debug!(method = ctx.method_name(), "DemoService accepting call");
        true
    }

    fn after_method(&mut self, ctx: &DispatchContext<'_>) {
        self.handled.push(ctx.method_name().to_string());
    }
}
