//! Host-side client runtime for the jsii kernel.
//!
//! The kernel is a separately spawned child process (`jsii-runtime`) that
//! hosts the authoritative object instances; this crate holds opaque
//! handles and translates host calls into the line-delimited JSON protocol
//! on the child's stdio. Generated bindings sit on top of three surfaces:
//! the typed [`JsiiClient`], the [`ObjectRegistry`] binding kernel handles
//! to host proxies, and the [`Marshaler`] translating values under type
//! descriptors.
//!
//! The protocol is strictly synchronous with reentrant callbacks: while a
//! request is in flight the kernel may interrupt the response stream to ask
//! the host to run a member, and resumes once the host completes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use jsii_rs::{JsiiRuntime, Value};
//!
//! #[tokio::main]
//! async fn main() -> jsii_rs::Result<()> {
//!     let runtime = JsiiRuntime::new();
//!     runtime.start().await?;
//!
//!     let client = runtime.client();
//!     client.load("acme", "1.0.0", "/path/to/acme@1.0.0.jsii.tgz").await?;
//!
//!     let calc = client.create("acme.Calculator", vec![], vec![]).await?;
//!     let sum = client
//!         .invoke(&calc, "add", vec![Value::from(1), Value::from(2)])
//!         .await?;
//!     println!("sum = {:?}", sum);
//!
//!     runtime.shutdown().await
//! }
//! ```

pub mod callbacks;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod types;
pub mod value;
pub mod wire;

// Re-export commonly used types
pub use callbacks::CallbackDispatcher;
pub use client::JsiiClient;
pub use engine::{CallbackHandler, Engine, KernelSession};
pub use error::{JsiiError, Result};
pub use marshal::Marshaler;
pub use process::{KernelProcess, KernelSpec};
pub use registry::{HostObject, ObjRef, ObjectRegistry};
pub use runtime::JsiiRuntime;
pub use types::{
    ClassDescriptor, MethodDescriptor, ParameterDescriptor, PropertyDescriptor, StructDescriptor,
    TypeCache, TypeDesc,
};
pub use value::{HostError, StructValue, Value};
