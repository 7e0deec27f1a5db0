//! ---
//! ivsim_section: "06-security-access-control"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device key derivation and shared access signatures."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Credential helpers for symmetric-key device identities.

pub mod sas;

pub use sas::{derive_device_key, key_fingerprint, CredentialError, DeviceCredentials, SasToken};
