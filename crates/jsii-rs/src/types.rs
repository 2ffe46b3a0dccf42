//! Type descriptors and the per-class schema cache.
//!
//! Descriptors drive the marshaler: generated bindings attach one to every
//! call site, and the cache keeps per-FQN method and property tables so the
//! callback dispatcher can recover parameter types when the kernel calls
//! back into the host. Lookups happen on the request hot path, so tables are
//! plain hash maps behind a read-mostly lock.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shape of a value at the kernel boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    /// Anything; the wire shape alone discriminates.
    Any,
    Bool,
    Number,
    String,
    Date,
    /// Enum type by FQN.
    Enum(String),
    /// By-reference class or interface by FQN.
    Class(String),
    /// By-value struct by FQN.
    Struct(String),
    /// Ordered sequence with a uniform element type.
    List(Box<TypeDesc>),
    /// String-keyed mapping with a uniform value type.
    Map(Box<TypeDesc>),
    /// One of several types, tried in IDL declaration order.
    Union(Vec<TypeDesc>),
    /// Possibly-absent value.
    Optional(Box<TypeDesc>),
}

impl TypeDesc {
    pub fn list_of(element: TypeDesc) -> Self {
        TypeDesc::List(Box::new(element))
    }

    pub fn map_of(value: TypeDesc) -> Self {
        TypeDesc::Map(Box::new(value))
    }

    pub fn optional(inner: TypeDesc) -> Self {
        TypeDesc::Optional(Box::new(inner))
    }
}

/// One parameter of a method or initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: TypeDesc,
    pub optional: bool,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, kind: TypeDesc) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Signature of an instance or static method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    pub parameters: Vec<ParameterDescriptor>,
    pub returns: Option<TypeDesc>,
    pub is_static: bool,
    pub is_async: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            returns: None,
            is_static: false,
            is_async: false,
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterDescriptor) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn returning(mut self, returns: TypeDesc) -> Self {
        self.returns = Some(returns);
        self
    }

    pub fn static_member(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }
}

/// Signature of a property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: TypeDesc,
    pub immutable: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, kind: TypeDesc) -> Self {
        Self {
            name: name.into(),
            kind,
            immutable: false,
        }
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

/// Method and property tables for one class or interface.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub fqn: String,
    pub base: Option<String>,
    pub interfaces: Vec<String>,
    pub initializer: Option<MethodDescriptor>,
    pub methods: HashMap<String, MethodDescriptor>,
    pub properties: HashMap<String, PropertyDescriptor>,
}

impl ClassDescriptor {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            base: None,
            interfaces: Vec::new(),
            initializer: None,
            methods: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    pub fn extending(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn implementing(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn with_initializer(mut self, initializer: MethodDescriptor) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }
}

/// Field table for one by-value struct.
#[derive(Debug, Clone)]
pub struct StructDescriptor {
    pub fqn: String,
    pub fields: HashMap<String, TypeDesc>,
}

impl StructDescriptor {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: TypeDesc) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }
}

/// Registry of descriptors learned from generated bindings and the kernel.
#[derive(Default)]
pub struct TypeCache {
    classes: RwLock<HashMap<String, Arc<ClassDescriptor>>>,
    structs: RwLock<HashMap<String, Arc<StructDescriptor>>>,
    naming: RwLock<HashMap<String, JsonValue>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&self, descriptor: ClassDescriptor) {
        if let Ok(mut classes) = self.classes.write() {
            classes.insert(descriptor.fqn.clone(), Arc::new(descriptor));
        }
    }

    pub fn register_struct(&self, descriptor: StructDescriptor) {
        if let Ok(mut structs) = self.structs.write() {
            structs.insert(descriptor.fqn.clone(), Arc::new(descriptor));
        }
    }

    pub fn class(&self, fqn: &str) -> Option<Arc<ClassDescriptor>> {
        self.classes.read().ok()?.get(fqn).cloned()
    }

    pub fn struct_descriptor(&self, fqn: &str) -> Option<Arc<StructDescriptor>> {
        self.structs.read().ok()?.get(fqn).cloned()
    }

    /// Looks up an instance or static method, walking the base-class chain.
    pub fn method(&self, fqn: &str, name: &str) -> Option<MethodDescriptor> {
        let mut current = self.class(fqn);
        while let Some(class) = current {
            if let Some(method) = class.methods.get(name) {
                return Some(method.clone());
            }
            current = class.base.as_deref().and_then(|base| self.class(base));
        }
        None
    }

    /// Looks up a property, walking the base-class chain.
    pub fn property(&self, fqn: &str, name: &str) -> Option<PropertyDescriptor> {
        let mut current = self.class(fqn);
        while let Some(class) = current {
            if let Some(property) = class.properties.get(name) {
                return Some(property.clone());
            }
            current = class.base.as_deref().and_then(|base| self.class(base));
        }
        None
    }

    /// Picks the most specific known class among candidate FQNs.
    ///
    /// Specificity is the length of the registered base chain; ties resolve
    /// to the earliest candidate, matching IDL declaration order.
    pub fn most_specific(&self, fqns: &[String]) -> Option<Arc<ClassDescriptor>> {
        let mut best: Option<(usize, Arc<ClassDescriptor>)> = None;
        for fqn in fqns {
            let Some(class) = self.class(fqn) else {
                continue;
            };
            let depth = self.chain_depth(&class);
            let better = best
                .as_ref()
                .map(|(best_depth, _)| depth > *best_depth)
                .unwrap_or(true);
            if better {
                best = Some((depth, class));
            }
        }
        best.map(|(_, class)| class)
    }

    fn chain_depth(&self, class: &ClassDescriptor) -> usize {
        let mut depth = 0;
        let mut base = class.base.clone();
        while let Some(fqn) = base {
            depth += 1;
            base = self.class(&fqn).and_then(|c| c.base.clone());
        }
        depth
    }

    /// Caches the naming table reported by the kernel for one assembly.
    pub fn cache_naming(&self, assembly: &str, naming: JsonValue) {
        if let Ok(mut table) = self.naming.write() {
            table.insert(assembly.to_string(), naming);
        }
    }

    pub fn naming(&self, assembly: &str) -> Option<JsonValue> {
        self.naming.read().ok()?.get(assembly).cloned()
    }
}
