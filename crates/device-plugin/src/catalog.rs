//! Device display names from the pci.ids vendor catalog.
//!
//! The catalog is a line-oriented text file: vendor lines start in column
//! zero with a four-digit hex id, device lines below them are indented with
//! one tab, subdevice lines with two. Lookups are best effort; a miss means
//! the caller falls back to the raw device id.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

/// Looks up the display name for `device_id` inside `vendor_id`'s section of
/// the catalog, sanitized into a resource-name-safe form. Returns `None` when
/// the catalog cannot be read or has no matching entry.
pub fn device_name(pci_ids_path: &Path, vendor_id: &str, device_id: &str) -> Option<String> {
    let file = match File::open(pci_ids_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("error opening pci ids file {}: {e}", pci_ids_path.display());
            return None;
        }
    };

    let mut in_vendor = false;
    let device_prefix = format!("\t{device_id}");

    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("error reading pci ids file {}: {e}", pci_ids_path.display());
                return None;
            }
        };

        if !in_vendor {
            in_vendor = line.starts_with(vendor_id);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if !line.starts_with('\t') {
            // left the vendor's section without a match
            warn!("could not find device with id {device_id} for vendor {vendor_id}");
            return None;
        }

        if let Some(rest) = line.strip_prefix(&device_prefix) {
            // require a full id match, not a shared prefix
            if rest.starts_with(char::is_whitespace) {
                let name = rest.trim();
                if !name.is_empty() {
                    return Some(sanitize_resource_name(name));
                }
            }
        }
    }

    warn!("could not find vendor {vendor_id} in pci ids file");
    None
}

/// Normalizes a catalog name into something usable in a resource name and a
/// socket file name: uppercased, separators collapsed to underscores, all
/// other punctuation dropped.
pub fn sanitize_resource_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.trim().to_uppercase().chars() {
        if ch.is_whitespace() || ch == '/' || ch == '.' {
            pending_separator = !out.is_empty();
        } else if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_separator {
                out.push('_');
                pending_separator = false;
            }
            out.push(ch);
        }
        // anything else is dropped without forcing a separator
    }

    out
}
