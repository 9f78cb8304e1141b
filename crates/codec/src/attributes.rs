use std::ops::Range;

use bytes::BytesMut;

use crate::{Error, HEADER_SIZE, MAX_PACKET_SIZE};

pub const USER_NAME: u8 = 1;
pub const USER_PASSWORD: u8 = 2;
pub const REPLY_MESSAGE: u8 = 18;
pub const VENDOR_SPECIFIC: u8 = 26;
pub const TUNNEL_PASSWORD: u8 = 69;
pub const MESSAGE_AUTHENTICATOR: u8 = 80;

pub const VENDOR_MICROSOFT: u32 = 311;
pub const MS_MPPE_SEND_KEY: u8 = 16;
pub const MS_MPPE_RECV_KEY: u8 = 17;

/// An attribute value is bounded by the one byte length field, which
/// also covers the two header bytes.
pub const MAX_VALUE_SIZE: usize = 253;

/// Iterator over the `(type, value range)` pairs of a packet whose
/// attribute list already passed validation. Stops silently at the
/// first malformed entry, so stale buffers cannot panic it.
pub struct Iter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Iterator for Iter<'_> {
    type Item = (u8, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() - self.offset < 2 {
            return None;
        }

        let kind = self.bytes[self.offset];
        let size = self.bytes[self.offset + 1] as usize;
        if size < 2 || self.offset + size > self.bytes.len() {
            return None;
        }

        let range = self.offset + 2..self.offset + size;
        self.offset += size;
        Some((kind, range))
    }
}

/// Walk the attributes of a raw packet buffer.
pub fn iter(bytes: &[u8]) -> Iter<'_> {
    Iter {
        offset: HEADER_SIZE.min(bytes.len()),
        bytes,
    }
}

/// Value range of the first attribute of the given type.
pub fn find(bytes: &[u8], kind: u8) -> Option<Range<usize>> {
    iter(bytes).find(|(k, _)| *k == kind).map(|(_, range)| range)
}

/// Split a Vendor-Specific value into the vendor id and the
/// sub-attribute list, validating the inner type-length walk. The
/// returned ranges address the whole packet buffer so sub-attribute
/// values can be edited in place.
pub fn vendor_subattributes(
    bytes: &[u8],
    value: Range<usize>,
) -> Result<(u32, Vec<(u8, Range<usize>)>), Error> {
    if value.len() < 4 {
        return Err(Error::InvalidAttribute);
    }

    let vendor = u32::from_be_bytes(bytes[value.start..value.start + 4].try_into().unwrap());

    let mut subattributes = Vec::new();
    let mut offset = value.start + 4;
    while offset < value.end {
        if value.end - offset < 2 {
            return Err(Error::InvalidAttribute);
        }

        let kind = bytes[offset];
        let size = bytes[offset + 1] as usize;
        if size < 2 || offset + size > value.end {
            return Err(Error::InvalidAttribute);
        }

        subattributes.push((kind, offset + 2..offset + size));
        offset += size;
    }

    Ok((vendor, subattributes))
}

/// Write the buffer length back into the header length field.
pub fn set_packet_length(bytes: &mut [u8]) {
    let length = (bytes.len() as u16).to_be_bytes();
    bytes[2..4].copy_from_slice(&length);
}

/// Append an attribute and update the packet length.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use radius_proxy_codec::attributes::{REPLY_MESSAGE, append, find};
///
/// let mut buf = BytesMut::zeroed(20);
/// buf[0] = 3;
/// buf[2..4].copy_from_slice(&20u16.to_be_bytes());
///
/// append(&mut buf, REPLY_MESSAGE, b"no route").unwrap();
///
/// assert_eq!(&buf[2..4], &30u16.to_be_bytes());
/// assert_eq!(find(&buf, REPLY_MESSAGE), Some(22..30));
/// ```
pub fn append(buf: &mut BytesMut, kind: u8, value: &[u8]) -> Result<Range<usize>, Error> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(Error::AttributeTooLong);
    }

    if buf.len() + 2 + value.len() > MAX_PACKET_SIZE {
        return Err(Error::InvalidLength);
    }

    let start = buf.len() + 2;
    buf.extend_from_slice(&[kind, (value.len() + 2) as u8]);
    buf.extend_from_slice(value);
    set_packet_length(buf);

    Ok(start..start + value.len())
}

/// Splice out the attribute whose value spans `value` and update the
/// packet length.
pub fn remove(buf: &mut BytesMut, value: Range<usize>) {
    let start = value.start - 2;
    let total = buf.len();

    buf.copy_within(value.end..total, start);
    buf.truncate(total - (value.end - start));
    set_packet_length(buf);
}

/// Resize an attribute value in place.
///
/// Grows by reallocation, shifts the following bytes, and patches both
/// the attribute length byte and the packet length.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use radius_proxy_codec::attributes::{USER_NAME, append, find, resize};
///
/// let mut buf = BytesMut::zeroed(20);
/// buf[0] = 1;
/// buf[2..4].copy_from_slice(&20u16.to_be_bytes());
/// append(&mut buf, USER_NAME, b"bob").unwrap();
///
/// let range = find(&buf, USER_NAME).unwrap();
/// resize(&mut buf, range, b"bob@example.org").unwrap();
///
/// let range = find(&buf, USER_NAME).unwrap();
/// assert_eq!(&buf[range], b"bob@example.org");
/// assert_eq!(&buf[2..4], &37u16.to_be_bytes());
/// ```
pub fn resize(buf: &mut BytesMut, value: Range<usize>, new: &[u8]) -> Result<(), Error> {
    if new.len() > MAX_VALUE_SIZE {
        return Err(Error::AttributeTooLong);
    }

    let total = buf.len();
    if new.len() > value.len() {
        let grow = new.len() - value.len();
        if total + grow > MAX_PACKET_SIZE {
            return Err(Error::InvalidLength);
        }

        buf.resize(total + grow, 0);
        buf.copy_within(value.end..total, value.end + grow);
    } else if new.len() < value.len() {
        let shrink = value.len() - new.len();
        buf.copy_within(value.end..total, value.end - shrink);
        buf.truncate(total - shrink);
    }

    buf[value.start - 1] = (new.len() + 2) as u8;
    buf[value.start..value.start + new.len()].copy_from_slice(new);
    set_packet_length(buf);

    Ok(())
}
