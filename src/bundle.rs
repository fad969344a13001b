//! Binary ANS-104-style bundle container: a header listing each
//! item's size and id, followed by the concatenated item bytes. No
//! external bundling crate is used, the format is small enough to
//! hand-roll exactly.

use crate::model::SignedRecord;

const SIG_TYPE_ED25519: u16 = 1;

pub const BUNDLE_FORMAT_TAG: &str = "binary";
pub const BUNDLE_VERSION_TAG: &str = "2.0.0";

/// One packed item inside a bundle: the signed record plus its envelope
/// tags.
pub struct BundleItem {
    pub id: String,
    pub bytes: Vec<u8>,
}

fn encode_avro_long(n: u64) -> Vec<u8> {
    // Zigzag isn't needed for non-negative counts/lengths, but we follow
    // the same varint shape Avro uses for `long`.
    let mut n = n;
    let mut out = Vec::new();
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
    out
}

fn decode_avro_long(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Some(result)
}

/// Avro-style length-prefixed UTF-8 pairs, terminated by a zero-length
/// block.
fn encode_tags(tags: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    if !tags.is_empty() {
        out.extend(encode_avro_long(tags.len() as u64));
        for (k, v) in tags {
            out.extend(encode_avro_long(k.len() as u64));
            out.extend(k.as_bytes());
            out.extend(encode_avro_long(v.len() as u64));
            out.extend(v.as_bytes());
        }
    }
    out.extend(encode_avro_long(0));
    out
}

fn decode_tags(buf: &[u8]) -> Option<Vec<(String, String)>> {
    let mut pos = 0;
    let mut tags = Vec::new();
    loop {
        let count = decode_avro_long(buf, &mut pos)?;
        if count == 0 {
            break;
        }
        for _ in 0..count {
            let klen = decode_avro_long(buf, &mut pos)? as usize;
            let k = String::from_utf8(buf.get(pos..pos + klen)?.to_vec()).ok()?;
            pos += klen;
            let vlen = decode_avro_long(buf, &mut pos)? as usize;
            let v = String::from_utf8(buf.get(pos..pos + vlen)?.to_vec()).ok()?;
            pos += vlen;
            tags.push((k, v));
        }
    }
    Some(tags)
}

/// Builds the envelope tags for one record.
pub fn record_tags(record: &SignedRecord) -> Vec<(String, String)> {
    let p = &record.payload;
    let mut tags = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("App-Name".to_string(), "attestation-chain".to_string()),
        ("Type".to_string(), "attestation".to_string()),
        ("PI".to_string(), p.pi.clone()),
        ("Ver".to_string(), p.ver.to_string()),
        ("CID".to_string(), p.cid.clone()),
        ("Op".to_string(), p.op.as_str().to_string()),
        ("Vis".to_string(), p.vis.as_str().to_string()),
        ("Seq".to_string(), p.seq.to_string()),
    ];
    if let Some(prev_tx) = &p.prev_tx {
        tags.push(("Prev-TX".to_string(), prev_tx.clone()));
    }
    if let Some(prev_cid) = &p.prev_cid {
        tags.push(("Prev-CID".to_string(), prev_cid.clone()));
    }
    tags
}

/// Packs one signed record into a DataItem:
/// `sig_type:2 || signature || owner_pubkey || target_flag+target ||
/// anchor_flag+anchor || tag_count:8 || tag_bytes_len:8 || tag_bytes || data`.
pub fn pack_item(record: &SignedRecord) -> BundleItem {
    let tags = record_tags(record);
    let tag_bytes = encode_tags(&tags);

    let mut bytes = Vec::with_capacity(
        2 + record.signature.len() + record.owner_pubkey.len() + 2 + 16 + tag_bytes.len()
            + record.payload_bytes.len(),
    );

    bytes.extend_from_slice(&SIG_TYPE_ED25519.to_le_bytes());
    bytes.extend_from_slice(&record.signature);
    bytes.extend_from_slice(&record.owner_pubkey);

    // No target/anchor for attestation records: flag byte 0 means absent.
    bytes.push(0);
    bytes.push(0);

    bytes.extend_from_slice(&(tags.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&(tag_bytes.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&tag_bytes);
    bytes.extend_from_slice(&record.payload_bytes);

    BundleItem {
        id: record.id.clone(),
        bytes,
    }
}

fn id_bytes(id: &str) -> [u8; 32] {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(id)
        .unwrap_or_default();
    let mut out = [0u8; 32];
    let n = decoded.len().min(32);
    out[..n].copy_from_slice(&decoded[..n]);
    out
}

/// Concatenates packed items into a single bundle container: a
/// 32-byte little-endian count header, then per-item `(size, id)`
/// 64-byte headers, then the item bytes back-to-back.
pub fn build_bundle(items: &[BundleItem]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut count_bytes = [0u8; 32];
    count_bytes[..8].copy_from_slice(&(items.len() as u64).to_le_bytes());
    out.extend_from_slice(&count_bytes);

    for item in items {
        let mut size_bytes = [0u8; 32];
        size_bytes[..8].copy_from_slice(&(item.bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&size_bytes);
        out.extend_from_slice(&id_bytes(&item.id));
    }

    for item in items {
        out.extend_from_slice(&item.bytes);
    }

    out
}

/// Reads back the item count and per-item `(size, id)` header pairs from
/// a bundle's binary header, without re-parsing whole items. Used by
/// tests to assert the container shape.
pub fn read_header(bundle: &[u8]) -> Option<Vec<(u64, [u8; 32])>> {
    if bundle.len() < 32 {
        return None;
    }
    let count = u64::from_le_bytes(bundle[0..8].try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(count);
    let mut pos = 32;
    for _ in 0..count {
        if bundle.len() < pos + 64 {
            return None;
        }
        let size = u64::from_le_bytes(bundle[pos..pos + 8].try_into().ok()?);
        let mut id = [0u8; 32];
        id.copy_from_slice(&bundle[pos + 32..pos + 64]);
        out.push((size, id));
        pos += 64;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_preserves_order_and_values() {
        let tags = vec![
            ("PI".to_string(), "E1".to_string()),
            ("Seq".to_string(), "11".to_string()),
        ];
        let encoded = encode_tags(&tags);
        let decoded = decode_tags(&encoded).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn empty_tags_decode_to_empty() {
        let encoded = encode_tags(&[]);
        assert_eq!(decode_tags(&encoded).unwrap(), Vec::<(String, String)>::new());
    }

    #[test]
    fn bundle_header_reports_item_count_and_sizes() {
        let item_a = BundleItem { id: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, [1u8; 32]), bytes: vec![0u8; 10] };
        let item_b = BundleItem { id: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, [2u8; 32]), bytes: vec![0u8; 20] };
        let bundle = build_bundle(&[item_a, item_b]);
        let header = read_header(&bundle).unwrap();
        assert_eq!(header.len(), 2);
        assert_eq!(header[0].0, 10);
        assert_eq!(header[1].0, 20);
        assert_eq!(bundle.len(), 32 + 2 * 64 + 10 + 20);
    }
}
