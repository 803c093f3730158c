//! Service providers: the objects whose methods are exposed as SOAP
//! operations, the optional lifecycle capability, and the catalog that
//! resolves provider type identifiers.

use std::collections::HashMap;
use std::fmt;

use crate::dispatcher::DispatchContext;
use crate::error::{GatewayError, ProviderError};
use crate::value::SoapValue;

/// An object whose named methods can be invoked with positional arguments.
pub trait ServiceProvider {
    /// Provider type identifier, used for WSDL generation and cache keys.
    fn type_name(&self) -> &str;

    /// Invoke a named method. Unknown names fail with
    /// [`GatewayError::MethodNotFound`].
    fn invoke(&mut self, method: &str, args: Vec<SoapValue>) -> Result<SoapValue, GatewayError>;

    /// The lifecycle capability, when the provider implements it.
    fn lifecycle(&mut self) -> Option<&mut dyn LifecycleHooks> {
        None
    }
}

/// Optional provider capability gating each dispatch.
pub trait LifecycleHooks {
    /// Called before the engine handles the request. Returning `false`
    /// skips the call silently.
    fn before_method(&mut self, ctx: &DispatchContext<'_>) -> bool;

    /// Called after a successful dispatch.
    fn after_method(&mut self, ctx: &DispatchContext<'_>);
}

/// XML schema type of a parameter, result or struct field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XsdType {
    String,
    Int,
    Double,
    Boolean,
    DateTime,
    Base64Binary,
    /// A complex type declared with [`ComplexTypeDescriptor`]
    Complex(String),
    Array(Box<XsdType>),
}

impl XsdType {
    /// Local name as used in the generated schema.
    pub fn local_name(&self) -> String {
        match self {
            XsdType::String => "string".to_string(),
            XsdType::Int => "int".to_string(),
            XsdType::Double => "double".to_string(),
            XsdType::Boolean => "boolean".to_string(),
            XsdType::DateTime => "dateTime".to_string(),
            XsdType::Base64Binary => "base64Binary".to_string(),
            XsdType::Complex(name) => name.clone(),
            XsdType::Array(inner) => {
                let inner = inner.local_name();
                let mut chars = inner.chars();
                match chars.next() {
                    Some(first) => format!("{}{}Array", first.to_uppercase(), chars.as_str()),
                    None => "Array".to_string(),
                }
            }
        }
    }

    /// Qualified name, `xsd:` for built-ins and `tns:` for declared types.
    pub fn qname(&self) -> String {
        match self {
            XsdType::Complex(_) | XsdType::Array(_) => format!("tns:{}", self.local_name()),
            _ => format!("xsd:{}", self.local_name()),
        }
    }
}

/// A named, typed parameter or field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    pub ty: XsdType,
}

/// Description of one exposed method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    /// `None` for methods without a return value
    pub returns: Option<XsdType>,
    pub documentation: Option<String>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: None,
            documentation: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: XsdType) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn returns(mut self, ty: XsdType) -> Self {
        self.returns = Some(ty);
        self
    }

    pub fn doc(mut self, text: impl Into<String>) -> Self {
        self.documentation = Some(text.into());
        self
    }
}

/// Description of a complex type used by operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexTypeDescriptor {
    pub name: String,
    pub fields: Vec<ParamDescriptor>,
}

impl ComplexTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: XsdType) -> Self {
        self.fields.push(ParamDescriptor {
            name: name.into(),
            ty,
        });
        self
    }
}

type Method<P> = Box<dyn Fn(&mut P, Vec<SoapValue>) -> Result<SoapValue, ProviderError> + Send + Sync>;

/// Explicit method table of a provider type, built once at registration.
pub struct MethodRegistry<P> {
    methods: HashMap<String, (OperationDescriptor, Method<P>)>,
    order: Vec<String>,
}

impl<P> MethodRegistry<P> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a method under the descriptor's name.
    pub fn register<F>(mut self, descriptor: OperationDescriptor, method: F) -> Self
    where
        F: Fn(&mut P, Vec<SoapValue>) -> Result<SoapValue, ProviderError> + Send + Sync + 'static,
    {
        let name = descriptor.name.clone();
        if self
            .methods
            .insert(name.clone(), (descriptor, Box::new(method)))
            .is_none()
        {
            self.order.push(name);
        }
        self
    }

    /// Invoke `method` on `target`.
    pub fn invoke(
        &self,
        target: &mut P,
        method: &str,
        args: Vec<SoapValue>,
    ) -> Result<SoapValue, GatewayError> {
        let (descriptor, f) = self
            .methods
            .get(method)
            .ok_or_else(|| GatewayError::MethodNotFound(method.to_string()))?;

        if args.len() < descriptor.params.len() {
            return Err(GatewayError::InvalidArguments {
                method: method.to_string(),
                message: format!(
                    "expected {} argument(s), got {}",
                    descriptor.params.len(),
                    args.len()
                ),
            });
        }

        Ok(f(target, args)?)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<OperationDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.methods.get(name).map(|(d, _)| d.clone()))
            .collect()
    }
}

impl<P> Default for MethodRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

type Factory = Box<dyn Fn() -> Box<dyn ServiceProvider> + Send + Sync>;

/// A provider type known to the catalog.
pub struct ProviderType {
    pub name: String,
    pub operations: Vec<OperationDescriptor>,
    pub complex_types: Vec<ComplexTypeDescriptor>,
    factory: Factory,
}

impl ProviderType {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ServiceProvider> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            operations: Vec::new(),
            complex_types: Vec::new(),
            factory: Box::new(factory),
        }
    }

    pub fn operations(mut self, operations: Vec<OperationDescriptor>) -> Self {
        self.operations = operations;
        self
    }

    pub fn complex_type(mut self, ty: ComplexTypeDescriptor) -> Self {
        self.complex_types.push(ty);
        self
    }

    /// Create a fresh provider instance.
    pub fn instantiate(&self) -> Box<dyn ServiceProvider> {
        (self.factory)()
    }
}

impl fmt::Debug for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderType")
            .field("name", &self.name)
            .field("operations", &self.operations.len())
            .field("complex_types", &self.complex_types.len())
            .finish()
    }
}

/// Registry of provider types by identifier.
#[derive(Debug, Default)]
pub struct ProviderCatalog {
    types: HashMap<String, ProviderType>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider_type: ProviderType) {
        self.types.insert(provider_type.name.clone(), provider_type);
    }

    pub fn with(mut self, provider_type: ProviderType) -> Self {
        self.register(provider_type);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProviderType> {
        self.types.get(name)
    }

    /// Resolve a type identifier, failing with a configuration error when
    /// it is unknown.
    pub fn resolve(&self, name: &str) -> Result<&ProviderType, GatewayError> {
        self.get(name).ok_or_else(|| {
            GatewayError::Configuration(format!(
                "unknown service provider type '{}' (registered: {})",
                name,
                self.type_names().join(", ")
            ))
        })
    }

    pub fn instantiate(&self, name: &str) -> Result<Box<dyn ServiceProvider>, GatewayError> {
        Ok(self.resolve(name)?.instantiate())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type identifiers, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        total: i64,
    }

    fn registry() -> MethodRegistry<Counter> {
        MethodRegistry::new()
            .register(
                OperationDescriptor::new("add")
                    .param("amount", XsdType::Int)
                    .returns(XsdType::Int),
                |c: &mut Counter, args| {
                    let amount = args[0]
                        .as_i64()
                        .ok_or_else(|| ProviderError::new("TypeError", "amount must be an int"))?;
                    c.total += amount;
                    Ok(SoapValue::Int(c.total))
                },
            )
            .register(OperationDescriptor::new("reset"), |c: &mut Counter, _| {
                c.total = 0;
                Ok(SoapValue::Null)
            })
    }

    #[test]
    fn test_registry_invoke() {
        let registry = registry();
        let mut counter = Counter { total: 1 };
        let result = registry
            .invoke(&mut counter, "add", vec![SoapValue::Int(4)])
            .unwrap();
        assert_eq!(result, SoapValue::Int(5));
        assert!(registry.invoke(&mut counter, "reset", vec![]).unwrap().is_null());
        assert_eq!(counter.total, 0);
    }

    #[test]
    fn test_registry_unknown_method() {
        let mut counter = Counter { total: 0 };
        let err = registry()
            .invoke(&mut counter, "multiply", vec![])
            .unwrap_err();
        assert!(matches!(err, GatewayError::MethodNotFound(ref m) if m == "multiply"));
    }

    #[test]
    fn test_registry_missing_arguments() {
        let mut counter = Counter { total: 0 };
        let err = registry().invoke(&mut counter, "add", vec![]).unwrap_err();
        assert_eq!(err.fault_code(), "InvalidArguments");
    }

    #[test]
    fn test_registry_provider_error_passes_through() {
        let mut counter = Counter { total: 0 };
        let err = registry()
            .invoke(&mut counter, "add", vec![SoapValue::from("many")])
            .unwrap_err();
        assert_eq!(err.fault_code(), "TypeError");
    }

    #[test]
    fn test_registry_descriptor_order() {
        let names: Vec<String> = registry().descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add".to_string(), "reset".to_string()]);
    }

    #[test]
    fn test_xsd_type_names() {
        assert_eq!(XsdType::String.qname(), "xsd:string");
        assert_eq!(XsdType::Complex("Quote".into()).qname(), "tns:Quote");
        assert_eq!(
            XsdType::Array(Box::new(XsdType::Complex("Quote".into()))).qname(),
            "tns:QuoteArray"
        );
        assert_eq!(XsdType::Array(Box::new(XsdType::Int)).local_name(), "IntArray");
    }

    #[test]
    fn test_catalog_unknown_type() {
        let catalog = ProviderCatalog::new();
        let err = catalog.instantiate("Missing").err().unwrap();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_catalog_type_names_sorted() {
        struct Nop;

        impl ServiceProvider for Nop {
            fn type_name(&self) -> &str {
                "Nop"
            }

            fn invoke(&mut self, method: &str, _args: Vec<SoapValue>) -> Result<SoapValue, GatewayError> {
                Err(GatewayError::MethodNotFound(method.to_string()))
            }
        }

        let nop = || Box::new(Nop) as Box<dyn ServiceProvider>;
        let catalog = ProviderCatalog::new()
            .with(ProviderType::new("Zeta", nop))
            .with(ProviderType::new("Alpha", nop));
        assert_eq!(catalog.type_names(), vec!["Alpha", "Zeta"]);

        let err = catalog.resolve("Missing").unwrap_err();
        assert!(err.to_string().contains("(registered: Alpha, Zeta)"));
    }
}
