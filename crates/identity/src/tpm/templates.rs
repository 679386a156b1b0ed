//! Primary key templates for the endorsement and storage hierarchies.

use super::marshal::{
    ObjectAttributes, PublicParms, PublicUnique, Scheme, SymDefObject, Tpm2bPublic, TpmtPublic,
    TPM_ALG_SHA256,
};

/// Standard EK authorization policy: PolicySecret(TPM_RH_ENDORSEMENT).
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7,
    0x24, 0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14,
    0x69, 0xAA,
];

const RSA_KEY_BITS: u16 = 2048;

fn rsa_storage_template(object_attributes: ObjectAttributes, auth_policy: Vec<u8>) -> Tpm2bPublic {
    Tpm2bPublic::new(TpmtPublic {
        name_alg: TPM_ALG_SHA256,
        object_attributes,
        auth_policy,
        parameters: PublicParms::Rsa {
            symmetric: SymDefObject::AES_128_CFB,
            scheme: Scheme::NULL,
            key_bits: RSA_KEY_BITS,
            // 0 selects the default exponent 2^16 + 1
            exponent: 0,
        },
        unique: PublicUnique::Rsa(vec![0u8; usize::from(RSA_KEY_BITS / 8)]),
    })
}

/// RSA-2048 endorsement key template (TCG EK credential profile, template L-1).
pub fn ek_template() -> Tpm2bPublic {
    let attributes = ObjectAttributes::new()
        .fixed_tpm()
        .fixed_parent()
        .sensitive_data_origin()
        .admin_with_policy()
        .restricted()
        .decrypt();
    rsa_storage_template(attributes, EK_AUTH_POLICY.to_vec())
}

/// RSA-2048 storage root key template.
pub fn srk_template() -> Tpm2bPublic {
    let attributes = ObjectAttributes::new()
        .fixed_tpm()
        .fixed_parent()
        .sensitive_data_origin()
        .user_with_auth()
        .no_da()
        .restricted()
        .decrypt();
    rsa_storage_template(attributes, Vec::new())
}
