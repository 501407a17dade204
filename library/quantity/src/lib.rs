//! Canonicalization of user-entered hardware quantities into the strings the
//! cluster API accepts.
//!
//! The functions here are total over their documented input grammar: any
//! input either canonicalizes or produces a typed `config-invalid` error, and
//! nothing in this crate ever talks to a cluster.

#[macro_use]
extern crate lazy_static;

use error::*;
use regex::Regex;
use result::Result;

lazy_static! {
    // The grammar the cluster itself uses for CPU quantities ("2", "500m",
    // "1.5", "2e3", ...). Matching inputs pass through unchanged.
    static ref CPU: Regex = Regex::new(r"^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$").unwrap();
    static ref MEMORY: Regex = Regex::new(r"^([0-9]*\.?[0-9]+) ?([A-Za-z]*)$").unwrap();
}

#[derive(Error, JkError, Fault, Debug)]
#[fault(FaultKind::ConfigInvalid)]
#[error("'{input}' is not a valid {field} quantity")]
pub struct InvalidResource {
    field: &'static str,
    input: String,
}

impl InvalidResource {
    fn cpu(input: &str) -> InvalidResource {
        InvalidResource {
            field: "cpu",
            input: input.to_string(),
        }
    }

    fn memory(input: &str) -> InvalidResource {
        InvalidResource {
            field: "memory",
            input: input.to_string(),
        }
    }
}

/// Validates a CPU quantity. Anything the cluster quantity grammar accepts is
/// passed through verbatim; everything else is rejected before a manifest is
/// ever built from it.
pub fn cpu(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !CPU.is_match(trimmed) {
        return Err(InvalidResource::cpu(input).into());
    }
    Ok(trimmed.to_string())
}

/// Canonicalizes a memory quantity into `<amount><binary suffix>`.
///
/// The unit is case-insensitive and drawn from a closed set; a bare number
/// means bytes. Decimal SI aliases map onto the binary suffixes (`4GB` and
/// `4gib` both become `4Gi`). That aliasing is deliberate: users of this tool
/// write "4GB" meaning "the 4-gigabyte notebook size", and handing the
/// cluster `4Gi` matches that expectation.
pub fn memory(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let caps = MEMORY
        .captures(trimmed)
        .ok_or_else(|| InvalidResource::memory(input))?;
    let amount = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let suffix = match unit.to_ascii_lowercase().as_str() {
        "" => "",
        "k" | "kb" | "ki" | "kib" => "Ki",
        "m" | "mb" | "mi" | "mib" => "Mi",
        "g" | "gb" | "gi" | "gib" => "Gi",
        "t" | "tb" | "ti" | "tib" => "Ti",
        "p" | "pb" | "pi" | "pib" => "Pi",
        "e" | "eb" | "ei" | "eib" => "Ei",
        _ => return Err(InvalidResource::memory(input).into()),
    };
    Ok(format!("{}{}", amount, suffix))
}

/// Maps a GPU selector onto the vendor resource key requested from the
/// cluster. `None` means the configuration asked for no GPU at all; an
/// unrecognized selector falls back to the generic NVIDIA key rather than
/// failing, since the scheduler is the real authority on what exists.
pub fn gpu_resource_key(selector: &str) -> Option<&'static str> {
    match selector.trim().to_ascii_lowercase().as_str() {
        "none" | "" => None,
        "a40" => Some("nvidia.com/a40"),
        "a100" => Some("nvidia.com/a100"),
        "rtxa6000" => Some("nvidia.com/rtxa6000"),
        "rtx8000" => Some("nvidia.com/rtx8000"),
        "gh200" => Some("nvidia.com/gh200"),
        "mig-small" => Some("nvidia.com/mig-1g.5gb"),
        "any-gpu" => Some("nvidia.com/gpu"),
        _ => Some("nvidia.com/gpu"),
    }
}
