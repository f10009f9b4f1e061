use anyhow::{anyhow, bail, Result};
use crc32fast::Hasher as Crc32;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use strum::{Display, EnumString, IntoStaticStr};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum HashType {
    #[strum(ascii_case_insensitive)]
    Crc,
    #[strum(ascii_case_insensitive)]
    Md5,
    #[strum(ascii_case_insensitive)]
    Sha1,
}

impl HashType {
    fn bit(self) -> u8 {
        match self {
            HashType::Crc => 1,
            HashType::Md5 => 2,
            HashType::Sha1 => 4,
        }
    }

    /// Length of the binary digest in bytes.
    pub fn size(self) -> usize {
        match self {
            HashType::Crc => 4,
            HashType::Md5 => 16,
            HashType::Sha1 => 20,
        }
    }
}

/// Set of hash types, used to request which hashes to compute or compare.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HashTypes(u8);

impl HashTypes {
    pub const ALL: HashTypes = HashTypes(7);

    pub fn empty() -> Self {
        HashTypes(0)
    }

    pub fn single(hash_type: HashType) -> Self {
        HashTypes(hash_type.bit())
    }

    pub fn contains(self, hash_type: HashType) -> bool {
        self.0 & hash_type.bit() != 0
    }

    pub fn insert(&mut self, hash_type: HashType) {
        self.0 |= hash_type.bit();
    }

    pub fn union(self, other: HashTypes) -> HashTypes {
        HashTypes(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a comma separated list like "crc,md5,sha1".
    pub fn from_comma_list(s: &str) -> Result<Self> {
        let mut types = HashTypes::empty();
        for part in s.split(',') {
            let hash_type = part
                .trim()
                .parse::<HashType>()
                .map_err(|_| anyhow!("unknown hash type: {}", part))?;
            types.insert(hash_type);
        }
        Ok(types)
    }
}

/// Result of comparing two hash sets on their common types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashCompare {
    Match,
    Mismatch,
    NoCommon,
}

/// A value holding any subset of CRC32, MD5 and SHA1.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Hashes {
    pub crc: Option<u32>,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
}

impl Hashes {
    pub fn is_empty(&self) -> bool {
        self.crc.is_none() && self.md5.is_none() && self.sha1.is_none()
    }

    pub fn types(&self) -> HashTypes {
        let mut types = HashTypes::empty();
        if self.crc.is_some() {
            types.insert(HashType::Crc);
        }
        if self.md5.is_some() {
            types.insert(HashType::Md5);
        }
        if self.sha1.is_some() {
            types.insert(HashType::Sha1);
        }
        types
    }

    pub fn has_type(&self, hash_type: HashType) -> bool {
        self.types().contains(hash_type)
    }

    pub fn has_all_types(&self, requested: HashTypes) -> bool {
        self.types().0 & requested.0 == requested.0
    }

    /// Compare on common hash types. Either side being empty counts as a
    /// match, since there is nothing to contradict.
    pub fn compare(&self, other: &Hashes) -> HashCompare {
        if self.is_empty() || other.is_empty() {
            return HashCompare::Match;
        }

        let mut common = false;
        if let (Some(a), Some(b)) = (self.crc, other.crc) {
            common = true;
            if a != b {
                return HashCompare::Mismatch;
            }
        }
        if let (Some(a), Some(b)) = (&self.md5, &other.md5) {
            common = true;
            if a != b {
                return HashCompare::Mismatch;
            }
        }
        if let (Some(a), Some(b)) = (&self.sha1, &other.sha1) {
            common = true;
            if a != b {
                return HashCompare::Mismatch;
            }
        }

        if common {
            HashCompare::Match
        } else {
            HashCompare::NoCommon
        }
    }

    /// True if both CRCs are set and bitwise complements of each other,
    /// the signature of a dump with inverted checksum bytes.
    pub fn crc_complement(&self, other: &Hashes) -> bool {
        match (self.crc, other.crc) {
            (Some(a), Some(b)) => a ^ b == 0xffff_ffff,
            _ => false,
        }
    }

    /// Set one hash from a hex string, auto-detecting the type from its
    /// length (8, 32 or 40 hex digits). A CRC may carry an "0x" prefix.
    pub fn set_from_str(&mut self, s: &str) -> Result<HashType> {
        let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| anyhow!("invalid hash string: {}", s))?;

        match bytes.len() {
            4 => {
                self.crc = Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
                Ok(HashType::Crc)
            }
            16 => {
                let mut md5 = [0u8; 16];
                md5.copy_from_slice(&bytes);
                self.md5 = Some(md5);
                Ok(HashType::Md5)
            }
            20 => {
                let mut sha1 = [0u8; 20];
                sha1.copy_from_slice(&bytes);
                self.sha1 = Some(sha1);
                Ok(HashType::Sha1)
            }
            _ => bail!("hash string has no recognized length: {}", s),
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        let mut hashes = Hashes::default();
        hashes.set_from_str(s)?;
        Ok(hashes)
    }

    /// Set one hash from raw digest bytes; wrong lengths are rejected.
    pub fn set(&mut self, hash_type: HashType, data: &[u8]) -> Result<()> {
        if data.len() != hash_type.size() {
            bail!("wrong digest length {} for {}", data.len(), hash_type);
        }
        match hash_type {
            HashType::Crc => {
                self.crc = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
            }
            HashType::Md5 => {
                let mut md5 = [0u8; 16];
                md5.copy_from_slice(data);
                self.md5 = Some(md5);
            }
            HashType::Sha1 => {
                let mut sha1 = [0u8; 20];
                sha1.copy_from_slice(data);
                self.sha1 = Some(sha1);
            }
        }
        Ok(())
    }

    /// Check one hash against raw digest bytes. False if that type is unset.
    pub fn verify(&self, hash_type: HashType, data: &[u8]) -> bool {
        match hash_type {
            HashType::Crc => self
                .crc
                .is_some_and(|crc| crc.to_be_bytes().as_slice() == data),
            HashType::Md5 => self.md5.as_ref().is_some_and(|md5| md5.as_slice() == data),
            HashType::Sha1 => self.sha1.as_ref().is_some_and(|sha1| sha1.as_slice() == data),
        }
    }

    pub fn to_string(&self, hash_type: HashType) -> Option<String> {
        match hash_type {
            HashType::Crc => self.crc.map(|crc| format!("{:08x}", crc)),
            HashType::Md5 => self.md5.as_ref().map(hex::encode),
            HashType::Sha1 => self.sha1.as_ref().map(hex::encode),
        }
    }

    /// Copy the hashes present in `other` over this value.
    pub fn merge(&mut self, other: &Hashes) {
        if other.crc.is_some() {
            self.crc = other.crc;
        }
        if other.md5.is_some() {
            self.md5 = other.md5;
        }
        if other.sha1.is_some() {
            self.sha1 = other.sha1;
        }
    }
}

/// Streaming accumulator filling all requested hash types in one pass.
/// `finish` writes the digests back into the parent `Hashes`.
pub struct HashUpdate<'a> {
    hashes: &'a mut Hashes,
    crc: Option<Crc32>,
    md5: Option<Md5>,
    sha1: Option<Sha1>,
}

impl<'a> HashUpdate<'a> {
    pub fn new(hashes: &'a mut Hashes, types: HashTypes) -> Self {
        HashUpdate {
            crc: types.contains(HashType::Crc).then(Crc32::new),
            md5: types.contains(HashType::Md5).then(Md5::new),
            sha1: types.contains(HashType::Sha1).then(Sha1::new),
            hashes,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(crc) = self.crc.as_mut() {
            crc.update(data);
        }
        if let Some(md5) = self.md5.as_mut() {
            md5.update(data);
        }
        if let Some(sha1) = self.sha1.as_mut() {
            sha1.update(data);
        }
    }

    pub fn finish(self) {
        if let Some(crc) = self.crc {
            self.hashes.crc = Some(crc.finalize());
        }
        if let Some(md5) = self.md5 {
            self.hashes.md5 = Some(md5.finalize().into());
        }
        if let Some(sha1) = self.sha1 {
            self.hashes.sha1 = Some(sha1.finalize().into());
        }
    }
}

/// Hash a byte slice in one go.
pub fn hash_bytes(data: &[u8], types: HashTypes) -> Hashes {
    let mut hashes = Hashes::default();
    let mut update = HashUpdate::new(&mut hashes, types);
    update.update(data);
    update.finish();
    hashes
}
