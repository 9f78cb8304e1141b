//! ## Remote Authentication Dial In User Service (RADIUS)
//!
//! [RFC2865]: https://tools.ietf.org/html/rfc2865
//! [RFC2866]: https://tools.ietf.org/html/rfc2866
//! [RFC2869]: https://tools.ietf.org/html/rfc2869
//! [RFC6614]: https://tools.ietf.org/html/rfc6614
//!
//! RADIUS carries authentication, authorization, and accounting
//! information between a Network Access Server and a shared
//! authentication server. A packet is a fixed 20 byte header followed
//! by a list of type-length-value attributes. The same octets travel
//! unchanged over UDP datagrams [RFC2865] and over TLS streams
//! [RFC6614]; only the framing differs, so this crate validates the
//! header and attribute list once and leaves transport concerns to the
//! caller.

pub mod attributes;
pub mod crypto;

use std::ops::Range;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The RADIUS header is `code(1) | id(1) | length(2) | authenticator(16)`.
pub const HEADER_SIZE: usize = 20;

/// The largest packet the wire format allows.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Offset range of the authenticator field.
pub const AUTHENTICATOR_RANGE: Range<usize> = 4..20;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    TooShort,
    InvalidLength,
    UnknownCode,
    InvalidAttribute,
    InvalidPasswordLength,
    AttributeTooLong,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// RADIUS packet type codes.
///
/// Codes outside this set are not routable by a proxy and are treated
/// as a wire error by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
    AccessChallenge = 11,
    StatusServer = 12,
}

impl Code {
    /// Whether this code is one a client may send to the proxy.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::AccessRequest | Self::AccountingRequest | Self::StatusServer
        )
    }

    /// Whether this code is one an upstream server may answer with.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::AccessAccept
                | Self::AccessReject
                | Self::AccessChallenge
                | Self::AccountingResponse
        )
    }
}

/// A cache of the list of attributes, this is for internal use only.
#[derive(Debug, Clone)]
pub struct Attributes(Vec<(u8, Range<usize>)>);

impl Default for Attributes {
    fn default() -> Self {
        Self(Vec::with_capacity(20))
    }
}

impl Attributes {
    /// Adds an attribute to the list.
    pub fn append(&mut self, kind: u8, range: Range<usize>) {
        self.0.push((kind, range));
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching
    /// attribute in the list and return it.
    pub fn get(&self, kind: u8) -> Option<Range<usize>> {
        self.0
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from the list.
    ///
    /// A radius packet can carry multiple attributes of the same type,
    /// this returns the value ranges of every one of them in order.
    pub fn get_all<'a>(&'a self, kind: u8) -> impl Iterator<Item = &'a Range<usize>> {
        self.0
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        if !self.0.is_empty() {
            self.0.clear();
        }
    }
}

/// A validated read view over a raw packet buffer.
#[derive(Debug)]
pub struct Packet<'a> {
    code: Code,
    bytes: &'a [u8],
    attributes: &'a Attributes,
    odd_trailer: bool,
}

impl<'a> Packet<'a> {
    /// Decode and validate a packet.
    ///
    /// The buffer must already be cut down to the declared length;
    /// `Packet::wire_size` yields that length from the first four
    /// bytes. A single stray byte after the last attribute is
    /// tolerated (`odd_trailer` reports it), anything longer fails
    /// validation.
    ///
    /// # Test
    ///
    /// ```
    /// use radius_proxy_codec::{Attributes, Code, Packet, attributes::USER_NAME};
    ///
    /// let buffer = [
    ///     0x01u8, 0x07, 0x00, 0x27, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
    ///     0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x01, 0x13,
    ///     0x61, 0x6c, 0x69, 0x63, 0x65, 0x40, 0x65, 0x78, 0x61, 0x6d, 0x70,
    ///     0x6c, 0x65, 0x2e, 0x6f, 0x72, 0x67,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let packet = Packet::decode(&buffer, &mut attributes).unwrap();
    ///
    /// assert_eq!(packet.code(), Code::AccessRequest);
    /// assert_eq!(packet.id(), 7);
    /// assert_eq!(packet.get(USER_NAME), Some(&b"alice@example.org"[..]));
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TooShort);
        }

        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if length < HEADER_SIZE || length > bytes.len() {
            return Err(Error::InvalidLength);
        }

        let code = Code::try_from(bytes[0]).map_err(|_| Error::UnknownCode)?;

        attributes.clear();

        // Walk the attribute list. Each attribute is
        // `type(1) | len(1) | value(len - 2)`, len covering the two
        // header bytes, so anything below 2 or reaching past the
        // declared length is broken.
        let mut offset = HEADER_SIZE;
        while length - offset >= 2 {
            let kind = bytes[offset];
            let size = bytes[offset + 1] as usize;
            if size < 2 || offset + size > length {
                return Err(Error::InvalidAttribute);
            }

            attributes.append(kind, offset + 2..offset + size);
            offset += size;
        }

        Ok(Self {
            odd_trailer: length - offset == 1,
            bytes: &bytes[..length],
            attributes,
            code,
        })
    }

    /// Full frame size declared in the header.
    ///
    /// Used by stream transports to know how many bytes past the four
    /// byte header still belong to the current packet, and by datagram
    /// transports to find trailing junk.
    ///
    /// # Test
    ///
    /// ```
    /// use radius_proxy_codec::Packet;
    ///
    /// let buffer = [0x0cu8, 0x01, 0x00, 0x14];
    ///
    /// assert_eq!(Packet::wire_size(&buffer).unwrap(), 20);
    /// ```
    pub fn wire_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::TooShort);
        }

        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if length < HEADER_SIZE || length > MAX_PACKET_SIZE {
            return Err(Error::InvalidLength);
        }

        Ok(length)
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.bytes[1]
    }

    /// The 16 byte (request) authenticator field.
    #[inline]
    pub fn authenticator(&self) -> [u8; 16] {
        self.bytes[AUTHENTICATOR_RANGE].try_into().unwrap()
    }

    /// Whether a lone byte trailed the last attribute. Tolerated, but
    /// worth a warning at the transport.
    #[inline]
    pub fn odd_trailer(&self) -> bool {
        self.odd_trailer
    }

    /// Value of the first attribute of the given type.
    pub fn get(&self, kind: u8) -> Option<&'a [u8]> {
        self.attributes.get(kind).map(|range| &self.bytes[range])
    }

    /// Value range of the first attribute of the given type.
    pub fn get_range(&self, kind: u8) -> Option<Range<usize>> {
        self.attributes.get(kind)
    }

    /// Values of every attribute of the given type, in packet order.
    pub fn get_all(&'a self, kind: u8) -> impl Iterator<Item = &'a [u8]> {
        self.attributes
            .get_all(kind)
            .map(|range| &self.bytes[range.clone()])
    }
}
