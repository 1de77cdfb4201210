use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// A callable method resolved from the method cache.
///
/// Overloads share a name and differ by argument signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub service: String,
    pub name: String,
    pub arg_sigs: Vec<String>,
    pub return_type: Option<String>,
}

impl MethodDescriptor {
    #[must_use]
    pub fn new<S: Into<String>>(
        service: impl Into<String>,
        name: impl Into<String>,
        arg_sigs: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            arg_sigs: arg_sigs.into_iter().map(Into::into).collect(),
            return_type: None,
        }
    }

    #[must_use]
    pub fn returning(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = Some(return_type.into());
        self
    }

    /// Whether this overload accepts exactly the given argument signatures.
    #[must_use]
    pub fn accepts(&self, arg_sigs: &[String]) -> bool {
        self.arg_sigs == arg_sigs
    }
}

/// A decoded inbound RPC request.
///
/// All fields are fixed by the decoder except the resolved method, which the
/// dispatch pipeline binds once after method resolution.
#[derive(Debug, Clone)]
pub struct Request {
    service: String,
    method_name: String,
    arg_sigs: Vec<String>,
    args: Vec<Value>,
    target_app_name: Option<String>,
    headers: HashMap<String, String>,
    method: Option<Arc<MethodDescriptor>>,
}

impl Request {
    /// Type name processors declare interest in for this request kind.
    pub const TYPE_NAME: &'static str = "quiver.Request";

    #[must_use]
    pub fn new(service: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method_name: method_name.into(),
            arg_sigs: Vec::new(),
            args: Vec::new(),
            target_app_name: None,
            headers: HashMap::new(),
            method: None,
        }
    }

    /// Append one argument together with its type signature.
    #[must_use]
    pub fn with_arg(mut self, sig: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arg_sigs.push(sig.into());
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn with_target_app(mut self, app_name: impl Into<String>) -> Self {
        self.target_app_name = Some(app_name.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Unique identifier of the target service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    #[must_use]
    pub fn arg_sigs(&self) -> &[String] {
        &self.arg_sigs
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    #[must_use]
    pub fn target_app_name(&self) -> Option<&str> {
        self.target_app_name.as_deref()
    }

    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The method bound during dispatch, if resolution has happened.
    #[must_use]
    pub fn method(&self) -> Option<&Arc<MethodDescriptor>> {
        self.method.as_ref()
    }

    /// Bind the resolved method. Returns `false` and keeps the existing
    /// binding if one is already set.
    pub fn bind_method(&mut self, method: Arc<MethodDescriptor>) -> bool {
        if self.method.is_some() {
            return false;
        }
        self.method = Some(method);
        true
    }
}
