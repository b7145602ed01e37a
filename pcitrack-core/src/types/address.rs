//! PCI bus address handling.

use crate::error::{Result, TrackerError};
use once_cell::sync::Lazy;
use regex::Regex;

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Validate an address and return it in canonical (lowercase) form.
pub fn normalize_pci_address(address: &str) -> Result<String> {
    if !is_valid_pci_address(address) {
        return Err(TrackerError::InvalidAddress { address: address.to_string() });
    }
    Ok(address.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));

        assert!(!is_valid_pci_address("01:00.0")); // Missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // Missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // Invalid function (max 7)
        assert!(!is_valid_pci_address("invalid"));
    }

    #[test]
    fn test_normalize_lowercases() {
        assert_eq!(normalize_pci_address("0000:AF:00.1").unwrap(), "0000:af:00.1");
        assert!(matches!(
            normalize_pci_address("af:00.1"),
            Err(TrackerError::InvalidAddress { .. })
        ));
    }
}
