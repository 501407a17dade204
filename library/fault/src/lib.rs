pub use fault_derive::*;
use serde::{Serialize, Serializer};

/// Every error that crosses a component boundary in this workspace is mapped
/// to exactly one `FaultKind`. The reconciler and the lifecycle supervisor
/// branch on these kinds (a `NotFound` workload is created, a `Conflict` on a
/// secret becomes a replace, a `PortForwardStart` failure is reported but
/// does not fail the deployment), so the mapping is part of the contract, not
/// just presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Unparseable CPU/memory/GPU input or a missing required field.
    /// Raised before any cluster request is made.
    ConfigInvalid,
    /// Cluster authentication, credential, or certificate failure.
    ConnectAuth,
    /// Network, DNS, or timeout failure reaching the cluster API.
    ConnectTransport,
    /// The cluster configuration requires an external exec credential
    /// helper that could not be run.
    AuthExecHelperMissing,
    /// The cluster refused a write (HTTP 403).
    Forbidden,
    /// HTTP 404. Used internally by the reconciler; never fatal on its own.
    NotFound,
    /// HTTP 409 or "already exists". Handled by the reconciler via replace.
    Conflict,
    /// A workload carries a deletion timestamp that will not clear.
    StuckTerminating,
    /// The pod entered the terminal `Failed` phase.
    PodFailed,
    /// The pod was deleted out from under us by something else.
    PodDeletedExternally,
    /// The pod readiness ceiling was reached.
    ReadyTimeout,
    /// The local tunnel could not be established. Non-fatal for a
    /// deployment attempt.
    PortForwardStart,
    /// Cooperative cancellation. Terminal but not an error.
    Cancelled,
    /// Anything the classifier could not place (transport internals,
    /// serialization failures, violated channel invariants).
    Internal,
}

impl FaultKind {
    /// The stable name used on the wire (progress events serialize their
    /// error payload with this string as the `kind` field).
    pub fn wire_name(&self) -> &'static str {
        match self {
            FaultKind::ConfigInvalid => "config-invalid",
            FaultKind::ConnectAuth => "connect-auth",
            FaultKind::ConnectTransport => "connect-transport",
            FaultKind::AuthExecHelperMissing => "auth-exec-helper-missing",
            FaultKind::Forbidden => "forbidden",
            FaultKind::NotFound => "not-found",
            FaultKind::Conflict => "conflict",
            FaultKind::StuckTerminating => "stuck-terminating",
            FaultKind::PodFailed => "pod-failed",
            FaultKind::PodDeletedExternally => "pod-deleted-externally",
            FaultKind::ReadyTimeout => "ready-timeout",
            FaultKind::PortForwardStart => "port-forward-start",
            FaultKind::Cancelled => "cancelled",
            FaultKind::Internal => "internal",
        }
    }

    /// Whether an error of this kind terminates a deployment attempt when it
    /// reaches the supervisor. Kinds consumed internally (`NotFound`,
    /// `Conflict`), the tolerated tunnel failure, and cancellation are the
    /// only survivable ones.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FaultKind::NotFound
                | FaultKind::Conflict
                | FaultKind::PortForwardStart
                | FaultKind::Cancelled
        )
    }
}

impl Serialize for FaultKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.wire_name())
    }
}

/// A type that implements `Fault` knows which `FaultKind` it maps to.
///
/// The easiest way to implement this is the derive macro, which takes the
/// kind from a `#[fault(..)]` attribute on the type (structs) or on each
/// variant (enums).
///
/// ```
/// use fault::{Fault, FaultKind};
///
/// #[derive(Fault)]
/// #[fault(FaultKind::StuckTerminating)]
/// struct WontDie {}
///
/// #[derive(Fault)]
/// enum Outcome {
///     #[fault(FaultKind::NotFound)]
///     Missing,
///     #[fault(FaultKind::Conflict)]
///     Raced(u32),
/// }
///
/// assert_eq!(FaultKind::StuckTerminating, WontDie {}.fault());
/// assert_eq!(FaultKind::NotFound, Outcome::Missing.fault());
/// assert_eq!(FaultKind::Conflict, Outcome::Raced(1).fault());
/// ```
pub trait Fault {
    fn fault(&self) -> FaultKind;
}

#[cfg(test)]
mod tests {
    use crate as fault;
    use fault::*;

    #[derive(Fault)]
    #[fault(fault::FaultKind::PodFailed)]
    struct Struct {}

    #[derive(Fault)]
    enum Enum {
        #[fault(fault::FaultKind::NotFound)]
        Gone,
        #[fault(fault::FaultKind::Forbidden)]
        Denied { namespace: String },
        #[fault(fault::FaultKind::ConnectTransport)]
        Unreachable(u16),
    }

    #[test]
    fn smoke() {
        assert_eq!(FaultKind::PodFailed, Struct {}.fault());
        assert_eq!(FaultKind::NotFound, Enum::Gone.fault());
        assert_eq!(
            FaultKind::Forbidden,
            Enum::Denied {
                namespace: "lab".to_string()
            }
            .fault()
        );
        assert_eq!(FaultKind::ConnectTransport, Enum::Unreachable(443).fault());
    }

    #[test]
    fn wire_names_are_kebab_case() {
        let kinds = [
            FaultKind::ConfigInvalid,
            FaultKind::ConnectAuth,
            FaultKind::ConnectTransport,
            FaultKind::AuthExecHelperMissing,
            FaultKind::Forbidden,
            FaultKind::NotFound,
            FaultKind::Conflict,
            FaultKind::StuckTerminating,
            FaultKind::PodFailed,
            FaultKind::PodDeletedExternally,
            FaultKind::ReadyTimeout,
            FaultKind::PortForwardStart,
            FaultKind::Cancelled,
            FaultKind::Internal,
        ];
        for kind in kinds.iter() {
            let name = kind.wire_name();
            assert!(!name.is_empty());
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '-'));
        }
    }

    #[test]
    fn fatality() {
        assert!(FaultKind::StuckTerminating.is_fatal());
        assert!(FaultKind::ReadyTimeout.is_fatal());
        assert!(FaultKind::PodDeletedExternally.is_fatal());
        assert!(!FaultKind::NotFound.is_fatal());
        assert!(!FaultKind::Conflict.is_fatal());
        assert!(!FaultKind::PortForwardStart.is_fatal());
        assert!(!FaultKind::Cancelled.is_fatal());
    }

    #[test]
    fn serializes_as_wire_name() {
        let got = serde_json::to_string(&FaultKind::PodDeletedExternally).unwrap();
        assert_eq!(got, "\"pod-deleted-externally\"");
    }
}
