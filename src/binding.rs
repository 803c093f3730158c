//! Binding wrappers between the engine's call convention and provider
//! method signatures.

use tracing::trace;

use crate::config::BindingStyle;
use crate::error::GatewayError;
use crate::provider::ServiceProvider;
use crate::value::SoapValue;

/// Something the engine can call operations on.
pub trait SoapTarget {
    fn call(&mut self, method: &str, args: Vec<SoapValue>) -> Result<SoapValue, GatewayError>;
}

/// Wrapper strategy, fixed once per service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingWrapper {
    /// Provider bound to the engine as-is
    Direct,
    /// Arguments and results pass through unchanged
    Rpc,
    /// Arguments unwrapped from one element, results wrapped in
    /// `<method>Result`
    Document,
}

impl BindingWrapper {
    /// Pick the wrapper for a binding style. Engines able to bind a
    /// provider directly skip the RPC wrapper.
    pub fn select(style: BindingStyle, direct_binding: bool) -> Self {
        match style {
            BindingStyle::Document => BindingWrapper::Document,
            BindingStyle::Rpc if direct_binding => BindingWrapper::Direct,
            BindingStyle::Rpc => BindingWrapper::Rpc,
        }
    }

    /// Invoke `method` on the provider under this convention.
    pub fn invoke(
        &self,
        provider: &mut dyn ServiceProvider,
        method: &str,
        args: Vec<SoapValue>,
    ) -> Result<SoapValue, GatewayError> {
        trace!(wrapper = ?self, method, argc = args.len(), "Invoking provider method");
        match self {
            BindingWrapper::Direct | BindingWrapper::Rpc => provider.invoke(method, args),
            BindingWrapper::Document => {
                let result = provider.invoke(method, document_arguments(args))?;
                if result.is_null() {
                    Ok(result)
                } else {
                    Ok(SoapValue::single(format!("{}Result", method), result))
                }
            }
        }
    }

    /// Bind a provider, producing the target handed to the engine.
    pub fn bind<'a>(self, provider: &'a mut dyn ServiceProvider) -> BoundProvider<'a> {
        BoundProvider {
            wrapper: self,
            provider,
        }
    }
}

/// The real parameter list of a document-style call: the first argument
/// carries the wrapped parameters.
fn document_arguments(args: Vec<SoapValue>) -> Vec<SoapValue> {
    let mut args = args.into_iter();
    match args.next() {
        None => Vec::new(),
        Some(SoapValue::Array(items)) => items,
        Some(SoapValue::Struct(s)) => s.into_values(),
        Some(SoapValue::Null) => Vec::new(),
        Some(other) => vec![other],
    }
}

/// A provider bound through a wrapper.
pub struct BoundProvider<'a> {
    wrapper: BindingWrapper,
    provider: &'a mut dyn ServiceProvider,
}

impl BoundProvider<'_> {
    pub fn wrapper(&self) -> BindingWrapper {
        self.wrapper
    }
}

impl SoapTarget for BoundProvider<'_> {
    fn call(&mut self, method: &str, args: Vec<SoapValue>) -> Result<SoapValue, GatewayError> {
        self.wrapper.invoke(&mut *self.provider, method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{MethodRegistry, OperationDescriptor, XsdType};
    use crate::value::SoapStruct;
    use std::sync::LazyLock;

    struct Stock {
        calls: Vec<Vec<SoapValue>>,
    }

    static METHODS: LazyLock<MethodRegistry<Stock>> = LazyLock::new(|| {
        MethodRegistry::new()
            .register(
                OperationDescriptor::new("getPrice")
                    .param("symbol", XsdType::String)
                    .returns(XsdType::Double),
                |s: &mut Stock, args| {
                    s.calls.push(args.clone());
                    match args[0].as_str() {
                        Some("ACME") => Ok(SoapValue::Double(12.5)),
                        _ => Err(ProviderError::new("UnknownSymbol", "no such symbol")),
                    }
                },
            )
            .register(OperationDescriptor::new("forget"), |s: &mut Stock, args| {
                s.calls.push(args);
                Ok(SoapValue::Null)
            })
            .register(OperationDescriptor::new("quote"), |s: &mut Stock, args| {
                s.calls.push(args);
                Ok(SoapValue::Struct(
                    SoapStruct::new().with_field("price", 1.5).with_field("currency", "EUR"),
                ))
            })
    });

    impl ServiceProvider for Stock {
        fn type_name(&self) -> &str {
            "Stock"
        }

        fn invoke(&mut self, method: &str, args: Vec<SoapValue>) -> Result<SoapValue, GatewayError> {
            METHODS.invoke(self, method, args)
        }
    }

    fn stock() -> Stock {
        Stock { calls: Vec::new() }
    }

    #[test]
    fn test_select() {
        assert_eq!(
            BindingWrapper::select(BindingStyle::Rpc, false),
            BindingWrapper::Rpc
        );
        assert_eq!(
            BindingWrapper::select(BindingStyle::Rpc, true),
            BindingWrapper::Direct
        );
        assert_eq!(
            BindingWrapper::select(BindingStyle::Document, true),
            BindingWrapper::Document
        );
    }

    #[test]
    fn test_rpc_returns_native_result() {
        let mut provider = stock();
        let result = BindingWrapper::Rpc
            .invoke(&mut provider, "getPrice", vec![SoapValue::from("ACME")])
            .unwrap();
        assert_eq!(result, SoapValue::Double(12.5));
        assert_eq!(provider.calls, vec![vec![SoapValue::from("ACME")]]);
    }

    #[test]
    fn test_document_wraps_result() {
        let mut provider = stock();
        let args = vec![SoapValue::Array(vec![SoapValue::from("ACME")])];
        let result = BindingWrapper::Document
            .invoke(&mut provider, "getPrice", args)
            .unwrap();
        assert_eq!(
            result,
            SoapValue::single("getPriceResult", SoapValue::Double(12.5))
        );
        assert_eq!(provider.calls, vec![vec![SoapValue::from("ACME")]]);
    }

    #[test]
    fn test_document_null_is_not_wrapped() {
        let mut provider = stock();
        let result = BindingWrapper::Document
            .invoke(&mut provider, "forget", vec![SoapValue::Array(vec![])])
            .unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn test_document_wraps_struct_result() {
        let mut provider = stock();
        let result = BindingWrapper::Document
            .invoke(&mut provider, "quote", vec![])
            .unwrap();
        let wrapped = result.as_struct().unwrap();
        assert_eq!(wrapped.len(), 1);
        let inner = wrapped.get("quoteResult").and_then(SoapValue::as_struct).unwrap();
        assert_eq!(inner.get("currency"), Some(&SoapValue::from("EUR")));
    }

    #[test]
    fn test_document_unpacks_struct_and_scalar() {
        let mut provider = stock();
        let wrapped = SoapValue::Struct(SoapStruct::new().with_field("symbol", "ACME"));
        BindingWrapper::Document
            .invoke(&mut provider, "forget", vec![wrapped])
            .unwrap();
        BindingWrapper::Document
            .invoke(&mut provider, "forget", vec![SoapValue::from("x")])
            .unwrap();
        assert_eq!(
            provider.calls,
            vec![vec![SoapValue::from("ACME")], vec![SoapValue::from("x")]]
        );
    }

    #[test]
    fn test_errors_propagate_through_wrapper() {
        let mut provider = stock();
        let mut target = BindingWrapper::Document.bind(&mut provider);
        let err = target
            .call("getPrice", vec![SoapValue::Array(vec![SoapValue::from("XYZ")])])
            .unwrap_err();
        assert_eq!(err.fault_code(), "UnknownSymbol");
    }
}
