use std::ops::Range;

use bytes::BytesMut;
use codec::attributes::{self, USER_NAME, VENDOR_SPECIFIC};

/// A named set of attributes to strip from packets passing through.
#[derive(Debug, Clone, Default)]
pub struct Rewrite {
    /// Attribute type codes to splice out wholesale.
    pub remove_attributes: Vec<u8>,
    /// `(vendor, sub-attribute)` pairs to drop inside Vendor-Specific
    /// attributes. `None` as the sub-attribute drops the whole vendor
    /// attribute.
    pub remove_vendor_attributes: Vec<(u32, Option<u8>)>,
}

impl Rewrite {
    /// Apply the rule set to a validated packet buffer in place.
    pub fn apply(&self, buf: &mut BytesMut) {
        let mut offset = codec::HEADER_SIZE;
        while buf.len() - offset >= 2 {
            let kind = buf[offset];
            let size = buf[offset + 1] as usize;
            if size < 2 || offset + size > buf.len() {
                break;
            }

            if self.remove_attributes.contains(&kind) {
                attributes::remove(buf, offset + 2..offset + size);
                continue;
            }

            if kind == VENDOR_SPECIFIC && self.rewrite_vendor(buf, offset + 2..offset + size) {
                continue;
            }

            // The attribute may have shrunk, re-read its length.
            offset += buf[offset + 1] as usize;
        }
    }

    /// Handle one Vendor-Specific attribute. Returns true when the
    /// whole attribute was removed and the current offset now points
    /// at the next one.
    fn rewrite_vendor(&self, buf: &mut BytesMut, value: Range<usize>) -> bool {
        let (vendor, subattributes) = match attributes::vendor_subattributes(buf, value.clone()) {
            Ok(it) => it,
            Err(_) => {
                // Forward broken vendor payloads untouched, they are
                // opaque to everyone but their owner.
                log::warn!("vendor attribute with broken sub-attributes left as is");
                return false;
            }
        };

        if self
            .remove_vendor_attributes
            .iter()
            .any(|(v, sub)| *v == vendor && sub.is_none())
        {
            attributes::remove(buf, value);
            return true;
        }

        let doomed: Vec<Range<usize>> = subattributes
            .into_iter()
            .filter(|(kind, _)| {
                self.remove_vendor_attributes
                    .iter()
                    .any(|(v, sub)| *v == vendor && *sub == Some(*kind))
            })
            .map(|(_, range)| range)
            .collect();

        if doomed.is_empty() {
            return false;
        }

        // Back to front so the earlier ranges stay valid.
        let mut remaining = value.len();
        for sub in doomed.into_iter().rev() {
            remaining -= sub.len() + 2;
            remove_subattribute(buf, value.start, sub);
        }

        // Nothing left but the vendor id: drop the husk.
        if remaining == 4 {
            attributes::remove(buf, value.start..value.start + 4);
            return true;
        }

        false
    }
}

fn remove_subattribute(buf: &mut BytesMut, outer_value_start: usize, sub_value: Range<usize>) {
    let start = sub_value.start - 2;
    let total = buf.len();
    let removed = sub_value.end - start;

    buf.copy_within(sub_value.end..total, start);
    buf.truncate(total - removed);
    buf[outer_value_start - 1] -= removed as u8;
    attributes::set_packet_length(buf);
}

/// Regex rewrite of the User-Name attribute, with `\1`-style
/// backreferences already translated to the `${1}` expansion the
/// regex engine understands.
pub struct UserRewrite {
    pub pattern: regex::bytes::Regex,
    pub replacement: Vec<u8>,
}

impl UserRewrite {
    /// Rewrite the User-Name value in place. Returns the original
    /// bytes when the pattern matched, so the reply path can restore
    /// them.
    pub fn apply(&self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        let range = attributes::find(buf, USER_NAME)?;
        let value = buf[range.clone()].to_vec();
        if !self.pattern.is_match(&value) {
            return None;
        }

        let rewritten = self.pattern.replace(&value, &self.replacement[..]).into_owned();
        if let Err(e) = attributes::resize(buf, range, &rewritten) {
            log::warn!("username rewrite produced an oversized value, kept original: {e}");
            return None;
        }

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Attributes, Packet};

    fn packet(attrs: &[(u8, &[u8])]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 20]);
        buf.extend_from_slice(&[0u8; 16]);
        for (kind, value) in attrs {
            attributes::append(&mut buf, *kind, value).unwrap();
        }

        buf
    }

    fn vendor(vendor: u32, subs: &[(u8, &[u8])]) -> Vec<u8> {
        let mut value = vendor.to_be_bytes().to_vec();
        for (kind, sub) in subs {
            value.push(*kind);
            value.push((sub.len() + 2) as u8);
            value.extend_from_slice(sub);
        }

        value
    }

    #[test]
    fn test_remove_simple_attributes() {
        let rewrite = Rewrite {
            remove_attributes: vec![18, 25],
            remove_vendor_attributes: vec![],
        };

        let mut buf = packet(&[(18, b"a"), (1, b"user"), (25, b"class"), (18, b"b")]);
        rewrite.apply(&mut buf);

        let mut cache = Attributes::default();
        let parsed = Packet::decode(&buf, &mut cache).unwrap();
        assert_eq!(parsed.get(1), Some(&b"user"[..]));
        assert_eq!(parsed.get(18), None);
        assert_eq!(parsed.get(25), None);
    }

    #[test]
    fn test_remove_whole_vendor_attribute() {
        let rewrite = Rewrite {
            remove_attributes: vec![],
            remove_vendor_attributes: vec![(311, None)],
        };

        let microsoft = vendor(311, &[(16, &[0u8; 4])]);
        let cisco = vendor(9, &[(1, b"cmd")]);
        let mut buf = packet(&[(26, &microsoft), (26, &cisco)]);
        rewrite.apply(&mut buf);

        let mut cache = Attributes::default();
        let parsed = Packet::decode(&buf, &mut cache).unwrap();
        let remaining: Vec<_> = parsed.get_all(26).collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(&remaining[0][..4], &9u32.to_be_bytes());
    }

    #[test]
    fn test_remove_vendor_subattribute() {
        let rewrite = Rewrite {
            remove_attributes: vec![],
            remove_vendor_attributes: vec![(311, Some(16))],
        };

        let value = vendor(311, &[(16, &[1u8; 4]), (17, &[2u8; 4])]);
        let mut buf = packet(&[(26, &value), (1, b"user")]);
        rewrite.apply(&mut buf);

        let mut cache = Attributes::default();
        let parsed = Packet::decode(&buf, &mut cache).unwrap();
        let range = parsed.get_range(26).unwrap();
        let (id, subs) = attributes::vendor_subattributes(&buf, range).unwrap();
        assert_eq!(id, 311);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, 17);
        assert_eq!(parsed.get(1), Some(&b"user"[..]));
    }

    #[test]
    fn test_empty_vendor_husk_is_dropped() {
        let rewrite = Rewrite {
            remove_attributes: vec![],
            remove_vendor_attributes: vec![(311, Some(16))],
        };

        let value = vendor(311, &[(16, &[1u8; 4])]);
        let mut buf = packet(&[(26, &value), (1, b"user")]);
        rewrite.apply(&mut buf);

        let mut cache = Attributes::default();
        let parsed = Packet::decode(&buf, &mut cache).unwrap();
        assert_eq!(parsed.get(26), None);
        assert_eq!(parsed.get(1), Some(&b"user"[..]));
    }

    #[test]
    fn test_truncated_vendor_left_untouched() {
        let rewrite = Rewrite {
            remove_attributes: vec![],
            remove_vendor_attributes: vec![(311, Some(16))],
        };

        let mut value = 311u32.to_be_bytes().to_vec();
        value.extend_from_slice(&[16, 40, 1]);
        let mut buf = packet(&[(26, &value), (1, b"user")]);
        let snapshot = buf.clone();
        rewrite.apply(&mut buf);

        assert_eq!(&buf[..], &snapshot[..]);
    }

    #[test]
    fn test_username_rewrite_with_backreference() {
        let rewrite = UserRewrite {
            pattern: regex::bytes::RegexBuilder::new("^(.*)@old\\.example$")
                .case_insensitive(true)
                .build()
                .unwrap(),
            replacement: b"${1}@new.example".to_vec(),
        };

        let mut buf = packet(&[(USER_NAME, b"alice@old.example")]);
        let original = rewrite.apply(&mut buf).unwrap();

        assert_eq!(original, b"alice@old.example");

        let mut cache = Attributes::default();
        let parsed = Packet::decode(&buf, &mut cache).unwrap();
        assert_eq!(parsed.get(USER_NAME), Some(&b"alice@new.example"[..]));

        // A miss leaves the packet alone.
        let mut buf = packet(&[(USER_NAME, b"alice@other.example")]);
        let snapshot = buf.clone();
        assert!(rewrite.apply(&mut buf).is_none());
        assert_eq!(&buf[..], &snapshot[..]);
    }
}
