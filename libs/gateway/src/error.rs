//! Gateway error type.

use thiserror::Error;

/// Errors surfaced by the hypervisor gateway.
///
/// Every gateway operation reports failure through this type; the balancer
/// pipelines decide whether a given failure flags a single domain, aborts
/// the tick, or aborts the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Could not open the hypervisor connection.
    #[error("unable to connect to hypervisor at {uri}: {detail}")]
    Connect { uri: String, detail: String },

    /// An underlying control-plane call reported failure.
    #[error("{op} failed: {detail}")]
    Call { op: &'static str, detail: String },

    /// A domain reported a vCPU count below one.
    #[error("domain reports {0} vCPUs")]
    NoVcpus(i64),

    /// A pin bitmap was requested for a host with no pCPUs.
    #[error("pin bitmap requested for a zero pCPU count")]
    ZeroPcpuCount,

    /// A pin target lies outside the host's pCPU range.
    #[error("pCPU {pcpu} out of range of {total} host pCPUs")]
    PcpuOutOfRange { pcpu: usize, total: usize },
}

impl GatewayError {
    /// Shorthand for wrapping an underlying call failure.
    pub fn call(op: &'static str, detail: impl ToString) -> Self {
        Self::Call {
            op,
            detail: detail.to_string(),
        }
    }
}
