pub use error_derive::JkError;
pub use fault::{Fault, FaultKind};
use serde::{Serialize, Serializer};
use serde_json::json;
pub use thiserror;
pub use thiserror::Error;

/// A JkError is the trait to which every error produced by the deployment
/// core MUST adhere. It ties together three things: the standard library
/// error machinery (message + source chain), the [Fault](fault::Fault)
/// classification that reconciliation and the supervisor branch on, and the
/// thread-safety bounds required to ship an error through a channel to the
/// presentation layer.
///
/// The easiest way to implement it is with the derive macros re-exported by
/// this crate: [Error](thiserror::Error), [JkError](error_derive::JkError),
/// and [Fault](fault_derive::Fault).
///
/// ```
/// use error::*;
///
/// #[derive(Error, JkError, Fault, Debug)]
/// #[error("the workload '{name}' refuses to finish deleting; delete it manually and retry")]
/// #[fault(FaultKind::StuckTerminating)]
/// struct WorkloadStuck {
///     name: String,
///     // Anything annotated as a source shows up in the serialized `cause`.
///     #[source]
///     cause: std::io::Error,
/// }
/// ```
pub trait JkError: std::error::Error + Fault + Send + Sync {}

/// Supports automatic boxing of any concrete JkError. The boxed form is what
/// travels across component boundaries and into progress events.
impl<T: 'static + JkError> From<T> for Box<dyn JkError> {
    fn from(err: T) -> Self {
        Box::new(err)
    }
}

/// A boxed JkError serializes as a small JSON object:
///
/// ```ignore
/// {
///     "kind": "stuck-terminating",
///     "message": "the workload 'jupyter-kube-0a1b2c3d4e' refuses to finish deleting ...",
///     "cause": "deadline exceeded"
/// }
/// ```
///
/// `kind` is the [wire name](fault::FaultKind::wire_name) of the fault, which
/// is what the presentation layer keys its remediation text on.
impl Serialize for Box<dyn JkError> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        json!({
            "kind": self.fault(),
            "message": format!("{}", self),
            "cause": self.source().map(|cause| format!("{}", cause)),
        })
        .serialize(serializer)
    }
}

/// A `StringError` converts a raw string into a first-class JkError. Useful
/// for embedding a free-form transport detail as the
/// [source](std::error::Error::source) of a higher error.
///
/// ```
/// use error::*;
///
/// #[derive(Error, JkError, Fault, Debug)]
/// #[fault(FaultKind::ConnectTransport)]
/// #[error("could not reach the cluster; check connectivity and any VPN")]
/// struct Unreachable {
///     #[source]
///     cause: StringError,
/// }
///
/// fn probe() -> Result<(), Unreachable> {
///     Err(Unreachable { cause: "dns lookup timed out".into() })
/// }
/// ```
#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::Internal)]
#[error("{inner}")]
pub struct StringError {
    inner: String,
}

impl<T: AsRef<str>> From<T> for StringError {
    fn from(inner: T) -> Self {
        Self {
            inner: inner.as_ref().to_string(),
        }
    }
}
