//! XID error classification
//!
//! Maps raw GPU device error codes onto a severity used by signal producers
//! and the publisher. XID errors documentation:
//! https://docs.nvidia.com/deploy/xid-errors/index.html

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// XID codes typically caused by application errors rather than hardware
/// failures. Ignored by default to avoid false positives.
static DEFAULT_IGNORED_XIDS: &[u64] = &[
    13,  // Graphics Engine Exception
    31,  // GPU memory page fault
    43,  // GPU stopped processing
    45,  // Preemptive cleanup, due to previous errors
    68,  // Video processor exception
    109, // Context Switch Timeout Error
];

/// XID codes that indicate critical hardware failures requiring immediate
/// attention.
static CRITICAL_XIDS: &[u64] = &[
    // Memory errors
    48, // Double Bit ECC Error
    63, // Row remapping failure
    64, // Uncontained ECC error
    74, // NVLink error
    79, // GPU has fallen off the bus
    // Fatal errors
    94,  // Contained ECC error (severe)
    95,  // Uncontained ECC error
    119, // GSP (GPU System Processor) error
    120, // GSP firmware error
];

/// Human-readable descriptions for common XIDs.
static XID_DESCRIPTIONS: Lazy<HashMap<u64, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Application errors (typically ignored)
        (13, "Graphics Engine Exception"),
        (31, "GPU memory page fault"),
        (43, "GPU stopped processing"),
        (45, "Preemptive cleanup"),
        (68, "Video processor exception"),
        (109, "Context Switch Timeout"),
        // Memory errors
        (48, "Double Bit ECC Error"),
        (63, "Row remapping failure"),
        (64, "Uncontained ECC error"),
        (74, "NVLink error"),
        (79, "GPU has fallen off the bus"),
        (94, "Contained ECC error"),
        (95, "Uncontained ECC error"),
        // Other notable XIDs
        (8, "GPU not accessible"),
        (32, "Invalid or corrupted push buffer stream"),
        (38, "Driver firmware error"),
        (56, "Display engine error"),
        (57, "Error programming video memory interface"),
        (62, "Internal micro-controller halt (non-fatal)"),
        (69, "Graphics engine accessor error"),
        (119, "GSP error"),
        (120, "GSP firmware error"),
    ])
});

/// Severity level of an XID error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidSeverity {
    /// Typically caused by applications; GPU should still be healthy
    Ignored,
    /// May indicate a problem; not in either static table
    Warning,
    /// Critical hardware failure
    Critical,
}

impl std::fmt::Display for XidSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XidSeverity::Ignored => write!(f, "ignored"),
            XidSeverity::Warning => write!(f, "warning"),
            XidSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// True if the XID is in the default ignored set.
pub fn is_default_ignored(xid: u64) -> bool {
    DEFAULT_IGNORED_XIDS.contains(&xid)
}

/// True if the XID indicates a critical hardware failure.
pub fn is_critical(xid: u64) -> bool {
    CRITICAL_XIDS.contains(&xid)
}

/// Human-readable description for an XID.
pub fn describe(xid: u64) -> &'static str {
    XID_DESCRIPTIONS.get(&xid).copied().unwrap_or("Unknown XID")
}

/// Severity for an XID, honoring an operator-supplied additional ignore set.
pub fn classify(xid: u64, additional_ignored: &[u64]) -> XidSeverity {
    if is_default_ignored(xid) || additional_ignored.contains(&xid) {
        return XidSeverity::Ignored;
    }

    if is_critical(xid) {
        return XidSeverity::Critical;
    }

    // XIDs not in either list are treated as warnings
    XidSeverity::Warning
}

/// Severity plus description in one call.
pub fn classify_with_description(xid: u64, additional_ignored: &[u64]) -> (XidSeverity, &'static str) {
    (classify(xid, additional_ignored), describe(xid))
}

/// Parse a comma-or-space-separated string of XID values.
/// Non-numeric tokens are silently skipped; an empty result means no override.
pub fn parse_code_list(input: &str) -> Vec<u64> {
    input
        .split(|c| c == ',' || c == ' ')
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| tok.parse::<u64>().ok())
        .collect()
}
