use serde::Serialize;

pub fn u8s_from_str(input: &str) -> [u8; 32] {
    blake3::hash(input.as_bytes()).into()
}

/// Hex encoded blake3 digest of the canonical json form of `obj`.
pub fn fingerprint<T>(obj: &T) -> serde_json::Result<String>
where
    T: Serialize,
{
    let json = crate::jsonify(obj)?;
    Ok(hex::encode(blake3::hash(json.as_bytes()).as_bytes()))
}
