//! # Get Started
//!
//! Keysets live under `$MOS_TRUST_DATA_HOME/machine/trust/keys` (falling back
//! to the XDG data home). A new keyset and its boot media:
//! ```bash
//! mos-trust keyset add snakeoil --bootkit-dir ./bootkit
//! ```
//!
//! ## On a machine with a TPM:
//! ```bash
//! mos-trust provision --disk any cert.pem privkey.pem
//! mos-trust initrd-setup
//! ```
//!
//! ## Against a simulator:
//! ```bash
//! TCTI=swtpm:port=2321 cargo test -- --ignored
//! ```

pub mod builder;
pub mod cli;
pub mod crypto;
pub mod disk;
pub mod efi;
pub mod hwrng;
pub mod keyset;
pub mod launch;
pub mod manifest;
pub mod oci;
pub mod ovmf;
pub mod paths;
pub mod pcr7;
pub mod pe;
pub mod run;
pub mod shim;
pub mod storage;
pub mod tpm;
