//! Hardware signature and stable instance identity

use crate::lowlevel;
use cohost_core::HardwareSignature;
use std::sync::OnceLock;
use tracing::debug;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Environment variables consulted for the instance id, in order
pub const INSTANCE_ID_VARS: [&str; 2] = ["INSTANCE_ID", "WEBSITE_INSTANCE_ID"];

static GENERATED_ID: OnceLock<String> = OnceLock::new();

/// CPU brand from CPUID, then `/proc/cpuinfo`, then a fixed placeholder
pub fn cpu_brand() -> String {
    if let Some(brand) = lowlevel::cpuid_brand_string() {
        return brand;
    }

    std::fs::read_to_string(CPUINFO_PATH)
        .ok()
        .and_then(|content| parse_model_name(&content))
        .unwrap_or_else(|| HardwareSignature::UNKNOWN_BRAND.to_string())
}

/// Signature of the processor this process runs on
pub fn hardware_signature() -> HardwareSignature {
    HardwareSignature::from_brand(cpu_brand())
}

/// First `model name` value of a `/proc/cpuinfo` dump
pub fn parse_model_name(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "model name")
            .then(|| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Stable id of this instance for the lifetime of the process
pub fn stable_instance_id() -> &'static str {
    GENERATED_ID.get_or_init(|| {
        resolve_instance_id(|name| std::env::var(name).ok(), || uuid::Uuid::new_v4().to_string())
    })
}

/// Pick the first non-empty environment value, otherwise generate one
pub fn resolve_instance_id<L, G>(lookup: L, generate: G) -> String
where
    L: Fn(&str) -> Option<String>,
    G: FnOnce() -> String,
{
    for name in INSTANCE_ID_VARS {
        if let Some(value) = lookup(name).map(|v| v.trim().to_string()) {
            if !value.is_empty() {
                debug!("Instance id taken from {}", name);
                return value;
            }
        }
    }
    let generated = generate();
    debug!("Generated instance id {}", generated);
    generated
}
