//! Validator identities.
//!
//! Nodes identify themselves with Ed25519 keys.  Seeds and addresses are
//! exchanged in the "strkey" text form the validator software expects: a
//! version byte, the raw key, a CRC16-XModem checksum, all base32 encoded
//! without padding.  Accounts start with `G`, secret seeds with `S`.

use std::fmt;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::error::{ComposerError, Result};

const VERSION_ACCOUNT: u8 = 6 << 3;
const VERSION_SEED: u8 = 18 << 3;
const KEY_LEN: usize = 32;
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn random() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Parses a secret seed.  Addresses are rejected since they carry no
    /// private key.
    pub fn from_seed(seed: &str) -> Result<Self> {
        let raw = decode(VERSION_SEED, seed.trim())?;
        Ok(Self {
            signing: SigningKey::from_bytes(&raw),
        })
    }

    pub fn seed(&self) -> String {
        encode(VERSION_SEED, &self.signing.to_bytes())
    }

    pub fn address(&self) -> String {
        encode(VERSION_ACCOUNT, &self.signing.verifying_key().to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Checks that `address` is a well formed account address.
pub fn parse_address(address: &str) -> Result<()> {
    decode(VERSION_ACCOUNT, address.trim()).map(|_| ())
}

fn encode(version: u8, key: &[u8; KEY_LEN]) -> String {
    let mut payload = Vec::with_capacity(KEY_LEN + 3);
    payload.push(version);
    payload.extend_from_slice(key);
    let crc = crc16(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    base32_encode(&payload)
}

fn decode(version: u8, s: &str) -> Result<[u8; KEY_LEN]> {
    let payload = base32_decode(s)
        .ok_or_else(|| ComposerError::Keypair(format!("invalid encoding: '{}'", s)))?;
    if payload.len() != KEY_LEN + 3 {
        return Err(ComposerError::Keypair(format!("invalid length: '{}'", s)));
    }
    if payload[0] != version {
        let expected = if version == VERSION_SEED {
            "secret seed"
        } else {
            "account address"
        };
        return Err(ComposerError::Keypair(format!(
            "'{}' is not a {}",
            s, expected
        )));
    }

    let (body, checksum) = payload.split_at(KEY_LEN + 1);
    if crc16(body).to_le_bytes() != checksum {
        return Err(ComposerError::Keypair(format!("checksum mismatch: '{}'", s)));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&body[1..]);
    Ok(key)
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &b in data {
        buffer = (buffer << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let value = ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    // Trailing bits must be padding of the last byte.
    if bits >= 5 || buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}
