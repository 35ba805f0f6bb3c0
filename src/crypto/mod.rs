//! NTAG 424 tag authentication: decrypt the PICC payload with the card's k1,
//! verify the CMAC with the card's k2, and extract the tap counter + UID.

use std::fmt;

use aes::Aes128;
use anyhow::{Result, anyhow};
use cipher::{BlockDecrypt, KeyInit};
use cmac::{Cmac, Mac};

/// A 16-byte AES key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(anyhow!("AES key must be 16 bytes"));
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A 7-byte card UID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardUid([u8; 7]);

impl CardUid {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 7 {
            return Err(anyhow!("UID must be 7 bytes"));
        }
        let mut arr = [0u8; 7];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Tap counter value, incremented by the NFC chip on every physical tap.
/// Used as the anti-replay nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Counter(u32);

impl Counter {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Parses the 3-byte little-endian counter field of the PICC data.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 3 {
            return Err(anyhow!("Counter must be 3 bytes"));
        }
        let value = u32::from(bytes[2]) << 16
                  | u32::from(bytes[1]) << 8
                  | u32::from(bytes[0]);
        Ok(Self(value))
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.0 & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            ((self.0 >> 16) & 0xFF) as u8,
        ]
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A card's key pair: k1 decrypts the PICC payload, k2 verifies the CMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    pub decrypt_key: AesKey,
    pub cmac_key: AesKey,
}

impl KeySet {
    pub fn generate() -> Self {
        Self { decrypt_key: AesKey::generate(), cmac_key: AesKey::generate() }
    }
}

/// Authenticated contents of one tap, valid only if [`extract_tap_info`]
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapInfo {
    pub uid: CardUid,
    pub counter: Counter,
}

/// Attempts to authenticate a tap payload against one card's keys.
///
/// Decrypts the 16-byte PICC payload, parses UID + counter out of it, and
/// verifies the 8-byte CMAC over the SV2 structure. Any failure means the
/// payload was not produced by a card carrying this key set.
pub fn extract_tap_info(keys: &KeySet, payload: &[u8], cmac: &[u8]) -> Result<TapInfo> {
    if payload.len() != 16 {
        return Err(anyhow!("PICC payload must be 16 bytes"));
    }
    if cmac.len() != 8 {
        return Err(anyhow!("CMAC must be 8 bytes"));
    }

    let decrypted = aes_decrypt(&keys.decrypt_key, payload)?;
    let (uid, counter) = parse_picc_data(&decrypted)?;

    if !verify_cmac(&keys.cmac_key, &uid, &counter, cmac)? {
        return Err(anyhow!("CMAC verification failed"));
    }

    Ok(TapInfo { uid, counter })
}

fn aes_decrypt(key: &AesKey, ciphertext: &[u8]) -> Result<[u8; 16]> {
    let cipher = Aes128::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("Invalid key length: {:?}", e))?;
    let mut block = [0u8; 16];
    block.copy_from_slice(ciphertext);

    cipher.decrypt_block((&mut block).into());
    Ok(block)
}

fn parse_picc_data(decrypted: &[u8; 16]) -> Result<(CardUid, Counter)> {
    // PICC data layout: 0xC7 tag, 7-byte UID, 3-byte LE counter, padding.
    if decrypted[0] != 0xC7 {
        return Err(anyhow!("Invalid PICC data format"));
    }

    let uid = CardUid::from_bytes(&decrypted[1..8])?;
    let counter = Counter::from_bytes(&decrypted[8..11])?;

    Ok((uid, counter))
}

/// Computes the AES-CMAC over the SV2 session vector for this UID + counter.
fn sv2_cmac(key: &AesKey, uid: &CardUid, counter: &Counter) -> Result<[u8; 16]> {
    let mut sv2 = [0u8; 16];
    sv2[0] = 0x3c;
    sv2[1] = 0xc3;
    sv2[2] = 0x00;
    sv2[3] = 0x01;
    sv2[4] = 0x00;
    sv2[5] = 0x80;
    sv2[6..13].copy_from_slice(uid.as_bytes());
    sv2[13..16].copy_from_slice(&counter.to_bytes());

    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("Invalid key length: {:?}", e))?;
    mac.update(&sv2);
    let computed = mac.finalize().into_bytes();

    let mut out = [0u8; 16];
    out.copy_from_slice(&computed);
    Ok(out)
}

fn verify_cmac(key: &AesKey, uid: &CardUid, counter: &Counter, expected: &[u8]) -> Result<bool> {
    let computed = sv2_cmac(key, uid, counter)?;
    // The tag truncates the CMAC to its first 8 bytes.
    Ok(computed[..8] == *expected)
}

#[cfg(test)]
pub(crate) mod testutil {
    use cipher::BlockEncrypt;

    use super::*;

    /// Builds a synthetic tap (payload + cmac) that [`extract_tap_info`]
    /// will accept for the given key set.
    pub fn forge_tap(keys: &KeySet, uid: &CardUid, counter: Counter) -> (Vec<u8>, Vec<u8>) {
        let mut block = [0u8; 16];
        block[0] = 0xC7;
        block[1..8].copy_from_slice(uid.as_bytes());
        block[8..11].copy_from_slice(&counter.to_bytes());

        let cipher = Aes128::new_from_slice(keys.decrypt_key.as_bytes()).unwrap();
        cipher.encrypt_block((&mut block).into());

        let cmac = sv2_cmac(&keys.cmac_key, uid, &counter).unwrap();
        (block.to_vec(), cmac[..8].to_vec())
    }

    pub fn test_uid() -> CardUid {
        CardUid::from_hex("04996c6a926980").unwrap()
    }
}
