//! The fixed table of NV indices holding provisioned secrets.
use std::fmt;
use tss_esapi::attributes::NvIndexAttributes;
use tss_esapi::constants::NvIndexType;
use tss_esapi::handles::NvIndexTpmHandle;

/// Version of the NV layout written by `provision`.
pub const TPM_LAYOUT_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NvIndex {
    AdminPassword,
    TpmVersion,
    EaVersion,
    ProvisionedCert,
    ProvisionedKey,
    SbsKey,
    OsKey,
}

impl NvIndex {
    pub fn value(self) -> u32 {
        match self {
            NvIndex::AdminPassword => 0x1500001,
            NvIndex::TpmVersion => 0x1500002,
            NvIndex::EaVersion => 0x1500020,
            NvIndex::ProvisionedCert => 0x1500021,
            NvIndex::ProvisionedKey => 0x1500022,
            NvIndex::SbsKey => 0x1500030,
            NvIndex::OsKey => 0x1500040,
        }
    }

    pub fn handle(self) -> tss_esapi::Result<NvIndexTpmHandle> {
        NvIndexTpmHandle::new(self.value())
    }

    /// Attributes as `tpm2_nvdefine` spells them.
    pub fn attributes(self) -> &'static str {
        match self {
            NvIndex::TpmVersion | NvIndex::EaVersion => "ownerwrite|ownerread|authread",
            NvIndex::OsKey => "ownerwrite|ownerread|policyread|policywrite",
            _ => "ownerwrite|ownerread|policyread",
        }
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.value())
    }
}

/// Attributes of a written public index, as they enter the index's name.
pub fn public_index_attributes() -> tss_esapi::Result<NvIndexAttributes> {
    NvIndexAttributes::builder()
        .with_nv_index_type(NvIndexType::Ordinary)
        .with_owner_write(true)
        .with_owner_read(true)
        .with_auth_read(true)
        .with_written(true)
        .build()
}
