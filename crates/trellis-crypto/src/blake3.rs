//! Domain-separated BLAKE3 hashing for the Trellis overlay.
//!
//! ## Modes
//!
//! - [`derive_key`]: content hashes under a registered context string
//! - [`digest160`]: 160-bit digest used as a DHT identifier
//!
//! Context strings are registered in [`contexts`]. Two different purposes never
//! share a context, so an identifier can never collide with a content hash.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const NODE_ID: &str = "Trellis v1 node-id";
    pub const TRANSACTION_DATA: &str = "Trellis v1 transaction-data";
}

/// Length in bytes of a [`digest160`] output.
pub const DIGEST160_LEN: usize = 20;

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// # Arguments
///
/// * `context` - A registered context string (must start with "Trellis v1 ")
/// * `key_material` - The input key material
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Compute the 160-bit identifier digest of `data`.
///
/// `digest160(data) = BLAKE3-derive-key("Trellis v1 node-id", data)[:20]`, read
/// from the XOF stream so the output is a proper 160-bit digest rather than a
/// truncated 256-bit one.
pub fn digest160(data: &[u8]) -> [u8; DIGEST160_LEN] {
    let mut hasher = ::blake3::Hasher::new_derive_key(contexts::NODE_ID);
    hasher.update(data);
    let mut out = [0u8; DIGEST160_LEN];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Encode multiple dynamic fields using length-prefixed encoding.
///
/// `LE32(len(field1)) || field1 || LE32(len(field2)) || field2 || ...`
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}
