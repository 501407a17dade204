use error::*;
use kube::error::ErrorResponse;

/// The one place where a raw [kube::Error] is turned into a workspace error.
///
/// Downstream code never matches on `kube::Error` itself; it branches on the
/// [FaultKind] instead. The HTTP status classes that reconciliation depends
/// on (404, 409, 403, 401) each get their own variant, everything else is
/// classified by what the transport told us.
#[derive(Error, JkError, Fault, Debug)]
pub enum ApiError {
    #[fault(FaultKind::NotFound)]
    #[error("the cluster has no {what} named '{name}' in namespace '{namespace}'")]
    NotFound {
        what: &'static str,
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::Conflict)]
    #[error("{what} '{name}' in namespace '{namespace}' already exists or changed underneath us")]
    Conflict {
        what: &'static str,
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::Forbidden)]
    #[error(
        "the cluster refused to let us touch {what} '{name}' in namespace '{namespace}'; \
check that your account has access to that namespace"
    )]
    Forbidden {
        what: &'static str,
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::ConnectAuth)]
    #[error("the cluster rejected our credentials while touching {what} '{name}'")]
    Unauthorized {
        what: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::AuthExecHelperMissing)]
    #[error(
        "the cluster configuration requires an external credential helper that could not be \
run; install the helper referenced by your cluster configuration and make sure it is on PATH"
    )]
    ExecHelper {
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::ConnectAuth)]
    #[error("authenticating against the cluster failed; your credentials may have expired")]
    Auth {
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::ConnectTransport)]
    #[error(
        "could not reach the Kubernetes API server; check your network connection and any VPN"
    )]
    Transport {
        #[source]
        source: kube::Error,
    },
    #[fault(FaultKind::Internal)]
    #[error("the Kubernetes API server rejected our request for {what} '{name}'")]
    Rest {
        what: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl ApiError {
    pub fn classify<N, S>(what: &'static str, name: N, namespace: S, err: kube::Error) -> ApiError
    where
        N: AsRef<str>,
        S: AsRef<str>,
    {
        let name = name.as_ref().to_string();
        let namespace = namespace.as_ref().to_string();
        let code = match &err {
            kube::Error::Api(ErrorResponse { code, .. }) => Some(*code),
            _ => None,
        };
        match code {
            Some(404) => ApiError::NotFound {
                what,
                name,
                namespace,
                source: err,
            },
            Some(409) => ApiError::Conflict {
                what,
                name,
                namespace,
                source: err,
            },
            Some(403) => ApiError::Forbidden {
                what,
                name,
                namespace,
                source: err,
            },
            Some(401) => ApiError::Unauthorized {
                what,
                name,
                source: err,
            },
            Some(_) => ApiError::Rest { what, name, source: err },
            None => {
                // Everything that is not a structured API response gets
                // classified by what the transport stack printed. Coarse,
                // but these all collapse into three user remediations:
                // install the helper, refresh credentials, or fix the
                // network.
                let text = err.to_string().to_ascii_lowercase();
                if text.contains("exec") {
                    ApiError::ExecHelper { source: err }
                } else if text.contains("auth")
                    || text.contains("certificate")
                    || text.contains("tls")
                    || text.contains("ssl")
                    || text.contains("token")
                {
                    ApiError::Auth { source: err }
                } else if text.contains("connect")
                    || text.contains("timed out")
                    || text.contains("timeout")
                    || text.contains("dns")
                    || text.contains("resolve")
                {
                    ApiError::Transport { source: err }
                } else {
                    ApiError::Rest { what, name, source: err }
                }
            }
        }
    }
}
