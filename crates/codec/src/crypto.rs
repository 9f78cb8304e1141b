use std::ops::Range;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::{AUTHENTICATOR_RANGE, Error, HEADER_SIZE};

type HmacMd5 = Hmac<Md5>;

/// Write the response signature into the authenticator field.
///
/// > ResponseAuth = MD5(Code + ID + Length + RequestAuth + Attributes
/// > + Secret)
///
/// The caller must have placed the matching request authenticator at
/// offset 4 beforehand; it is part of the digested input and gets
/// overwritten by the result.
pub fn sign_response(bytes: &mut [u8], secret: &[u8]) {
    let mut hasher = Md5::new();
    hasher.update(&*bytes);
    hasher.update(secret);

    let digest: [u8; 16] = hasher.finalize().into();
    bytes[AUTHENTICATOR_RANGE].copy_from_slice(&digest);
}

fn response_digest(bytes: &[u8], secret: &[u8], request_authenticator: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(&bytes[..4]);
    hasher.update(request_authenticator);
    hasher.update(&bytes[HEADER_SIZE..]);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Check the response signature of a received reply against the
/// authenticator of the request it answers.
pub fn validate_response(bytes: &[u8], secret: &[u8], request_authenticator: &[u8; 16]) -> bool {
    response_digest(bytes, secret, request_authenticator).as_slice() == &bytes[AUTHENTICATOR_RANGE]
}

/// Sign an Accounting-Request. Its authenticator is a signature over
/// the packet with the field itself taken as sixteen zero octets.
pub fn sign_accounting_request(bytes: &mut [u8], secret: &[u8]) {
    let digest = response_digest(bytes, secret, &[0u8; 16]);
    bytes[AUTHENTICATOR_RANGE].copy_from_slice(&digest);
}

/// Check the signature of a received Accounting-Request.
pub fn validate_accounting_request(bytes: &[u8], secret: &[u8]) -> bool {
    response_digest(bytes, secret, &[0u8; 16]).as_slice() == &bytes[AUTHENTICATOR_RANGE]
}

/// HMAC-MD5 of the packet with the Message-Authenticator value taken
/// as zeros, per RFC 2869.
///
/// For responses the digest covers the authenticator of the original
/// request, passed separately, instead of the bytes at offset 4. The
/// input buffer is never touched; the zeroing happens inside the
/// digest stream, so a check leaves the packet byte-identical.
fn message_digest(
    bytes: &[u8],
    secret: &[u8],
    value: &Range<usize>,
    request_authenticator: Option<&[u8; 16]>,
) -> Result<[u8; 16], Error> {
    if value.len() != 16 || value.start < HEADER_SIZE + 2 || value.end > bytes.len() {
        return Err(Error::InvalidAttribute);
    }

    let mut mac = HmacMd5::new_from_slice(secret).map_err(|_| Error::InvalidAttribute)?;
    mac.update(&bytes[..4]);
    match request_authenticator {
        Some(authenticator) => mac.update(authenticator),
        None => mac.update(&bytes[AUTHENTICATOR_RANGE]),
    }

    mac.update(&bytes[HEADER_SIZE..value.start]);
    mac.update(&[0u8; 16]);
    mac.update(&bytes[value.end..]);

    Ok(mac.finalize().into_bytes().into())
}

/// Check a Message-Authenticator attribute value.
pub fn check_message_authenticator(
    bytes: &[u8],
    secret: &[u8],
    value: Range<usize>,
    request_authenticator: Option<&[u8; 16]>,
) -> bool {
    match message_digest(bytes, secret, &value, request_authenticator) {
        Ok(digest) => digest.as_slice() == &bytes[value],
        Err(_) => false,
    }
}

/// Recompute and write a Message-Authenticator attribute value.
pub fn set_message_authenticator(
    bytes: &mut [u8],
    secret: &[u8],
    value: Range<usize>,
    request_authenticator: Option<&[u8; 16]>,
) -> Result<(), Error> {
    let digest = message_digest(bytes, secret, &value, request_authenticator)?;
    bytes[value].copy_from_slice(&digest);
    Ok(())
}

fn check_password_length(len: usize) -> Result<(), Error> {
    if len < 16 || len > 128 || len % 16 != 0 {
        return Err(Error::InvalidPasswordLength);
    }

    Ok(())
}

/// The chained MD5 stream cipher shared by User-Password and the
/// salted keywrap.
///
/// > b(1) = MD5(Secret + Seed)       c(1) = p(1) xor b(1)
/// > b(i) = MD5(Secret + c(i - 1))   c(i) = p(i) xor b(i)
///
/// Encryption and decryption differ only in which buffer feeds the
/// next block: the xor output when encrypting, the untouched input
/// when decrypting.
fn chained_crypt(value: &mut [u8], secret: &[u8], seed: &[&[u8]], decrypt: bool) {
    let mut key: [u8; 16] = {
        let mut hasher = Md5::new();
        hasher.update(secret);
        for part in seed {
            hasher.update(part);
        }

        hasher.finalize().into()
    };

    for chunk in value.chunks_mut(16) {
        let cipher: [u8; 16] = (&*chunk).try_into().unwrap();
        for (byte, mask) in chunk.iter_mut().zip(key) {
            *byte ^= mask;
        }

        let mut hasher = Md5::new();
        hasher.update(secret);
        hasher.update(if decrypt { &cipher[..] } else { &*chunk });
        key = hasher.finalize().into();
    }
}

/// Encrypt a User-Password / Tunnel-Password value in place, RFC 2865
/// section 5.2. The plaintext must already be padded to a multiple of
/// 16 within [16, 128].
pub fn password_encrypt(
    value: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), Error> {
    check_password_length(value.len())?;
    chained_crypt(value, secret, &[authenticator], false);
    Ok(())
}

/// Decrypt a User-Password / Tunnel-Password value in place.
pub fn password_decrypt(
    value: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), Error> {
    check_password_length(value.len())?;
    chained_crypt(value, secret, &[authenticator], true);
    Ok(())
}

/// Decrypt under the old hop's secret, encrypt under the new one. The
/// request authenticator is the one of the forwarded request, which
/// both hops see unchanged.
pub fn password_recrypt(
    value: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), Error> {
    password_decrypt(value, old_secret, authenticator)?;
    password_encrypt(value, new_secret, authenticator)
}

fn keywrap_parts(value: &mut [u8]) -> Result<(&[u8], &mut [u8]), Error> {
    // The first two bytes are the salt and never change.
    if value.len() < 18 {
        return Err(Error::InvalidPasswordLength);
    }

    let (salt, key) = value.split_at_mut(2);
    check_password_length(key.len())?;
    Ok((salt, key))
}

/// Encrypt an MS-MPPE key value in place, RFC 2548 section 2.4.2. The
/// two byte salt prefixes the digest seed and is preserved unchanged.
pub fn keywrap_encrypt(
    value: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), Error> {
    let (salt, key) = keywrap_parts(value)?;
    chained_crypt(key, secret, &[authenticator, salt], false);
    Ok(())
}

/// Decrypt an MS-MPPE key value in place.
pub fn keywrap_decrypt(
    value: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), Error> {
    let (salt, key) = keywrap_parts(value)?;
    chained_crypt(key, secret, &[authenticator, salt], true);
    Ok(())
}

/// Re-encrypt an MS-MPPE key for the next hop. Each side keys off its
/// own shared secret and the request authenticator it saw.
pub fn keywrap_recrypt(
    value: &mut [u8],
    old_secret: &[u8],
    old_authenticator: &[u8; 16],
    new_secret: &[u8],
    new_authenticator: &[u8; 16],
) -> Result<(), Error> {
    keywrap_decrypt(value, old_secret, old_authenticator)?;
    keywrap_encrypt(value, new_secret, new_authenticator)
}
