use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::DeflateDecoder;

use crate::hashes::{HashType, HashTypes, HashUpdate, Hashes};

const TAG: &[u8; 8] = b"MComprHD";
const MAX_HEADER_LEN: usize = 124;
const META_HEADER_LEN: usize = 16;
const MAP_ENTRY_SIZE_V12: usize = 8;
const MAP_ENTRY_SIZE_V3: usize = 16;

const FLAG_HAS_PARENT: u32 = 0x01;
const MAP_FLAG_NO_CRC: u16 = 0x10;

const CODEC_ZLIB: u32 = u32::from_be_bytes(*b"zlib");
const CODEC_AVHUFF: u32 = u32::from_be_bytes(*b"avhu");

/// How the data of one hunk is stored.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MapEntryKind {
    Uncompressed,
    Compressed,
    /// Eight bytes of pattern repeated to fill the hunk.
    Mini,
    /// Data lives in another hunk of this file.
    SelfRef,
    /// Data lives in the parent image; unsupported.
    ParentRef,
}

#[derive(Clone, Debug)]
struct MapEntry {
    offset: u64,
    crc: u32,
    length: u32,
    flags: u16,
    kind: MapEntryKind,
}

/// Reader for MAME CHD disk images, header versions 1 through 5.
/// The hunk map is read lazily on first hunk access.
pub struct Chd {
    file: File,
    path: Utf8PathBuf,

    pub version: u32,
    pub hunk_len: u32,
    pub total_hunks: u64,
    pub total_len: u64,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    raw_sha1: Option<[u8; 20]>,
    flags: u32,
    compressors: [u32; 4],
    map_offset: u64,
    meta_offset: u64,

    map: Option<Vec<MapEntry>>,
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn nonzero_digest<const N: usize>(b: &[u8]) -> Option<[u8; N]> {
    let mut digest = [0u8; N];
    digest.copy_from_slice(&b[..N]);
    digest.iter().any(|byte| *byte != 0).then_some(digest)
}

impl Chd {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("cannot open disk image '{}'", path))?;

        let mut header = [0u8; MAX_HEADER_LEN];
        file.read_exact(&mut header[..12])
            .with_context(|| format!("'{}' is too short for a CHD header", path))?;
        if &header[..8] != TAG {
            bail!("'{}' is not a CHD image", path);
        }

        let header_len = be32(&header[8..]) as usize;
        if header_len > MAX_HEADER_LEN || header_len < 16 {
            bail!("'{}' has an invalid CHD header length", path);
        }
        file.read_exact(&mut header[12..header_len])
            .with_context(|| format!("cannot read CHD header of '{}'", path))?;

        let version = be32(&header[12..]);
        if version == 0 || version > 5 {
            bail!("'{}': unsupported CHD version {}", path, version);
        }

        let mut chd = Chd {
            file,
            path: path.to_owned(),
            version,
            hunk_len: 0,
            total_hunks: 0,
            total_len: 0,
            md5: None,
            sha1: None,
            raw_sha1: None,
            flags: 0,
            compressors: [0; 4],
            map_offset: 0,
            meta_offset: 0,
            map: None,
        };

        if version >= 5 {
            chd.parse_header_v5(&header);
        } else {
            chd.parse_header_v1_v4(&header, header_len as u64)?;
        }

        if chd.flags & FLAG_HAS_PARENT != 0 {
            bail!("'{}' requires a parent image, which is not supported", path);
        }
        if chd.hunk_len == 0 {
            bail!("'{}' has a zero hunk length", path);
        }

        Ok(chd)
    }

    fn parse_header_v1_v4(&mut self, header: &[u8], header_len: u64) -> Result<()> {
        self.flags = be32(&header[16..]);
        let compression = be32(&header[20..]);
        self.compressors[0] = match compression {
            0 => 0,
            1 | 2 => CODEC_ZLIB,
            3 => CODEC_AVHUFF,
            other => bail!("'{}': unknown CHD compression {}", self.path, other),
        };

        if self.version < 3 {
            self.hunk_len = be32(&header[24..]);
            self.total_hunks = be32(&header[28..]) as u64;
            // skip cylinders/heads/sectors
            self.md5 = nonzero_digest(&header[44..]);
            let _parent_md5 = &header[60..76];
            if self.version == 1 {
                self.hunk_len *= 512;
            } else {
                self.hunk_len *= be32(&header[76..]);
            }
            self.total_len = self.hunk_len as u64 * self.total_hunks;
            self.meta_offset = 0;
        } else {
            self.total_hunks = be32(&header[24..]) as u64;
            self.total_len = be64(&header[28..]);
            self.meta_offset = be64(&header[36..]);

            let mut p = 44;
            if self.version == 3 {
                self.md5 = nonzero_digest(&header[p..]);
                p += 32; // md5 + parent md5
            }
            self.hunk_len = be32(&header[p..]);
            p += 4;
            self.sha1 = nonzero_digest(&header[p..]);
            p += 40; // sha1 + parent sha1
            if self.version == 3 {
                self.raw_sha1 = self.sha1;
            } else {
                self.raw_sha1 = nonzero_digest(&header[p..]);
            }
        }

        self.map_offset = header_len;
        Ok(())
    }

    fn parse_header_v5(&mut self, header: &[u8]) {
        for (i, compressor) in self.compressors.iter_mut().enumerate() {
            *compressor = be32(&header[16 + 4 * i..]);
        }
        self.total_len = be64(&header[32..]);
        self.map_offset = be64(&header[40..]);
        self.meta_offset = be64(&header[48..]);
        self.hunk_len = be32(&header[56..]);
        if self.hunk_len > 0 {
            self.total_hunks = self.total_len.div_ceil(self.hunk_len as u64);
        }
        // 60..64 is unit bytes
        self.raw_sha1 = nonzero_digest(&header[64..]);
        self.sha1 = nonzero_digest(&header[84..]);
        let parent_sha1 = &header[104..124];
        if parent_sha1.iter().any(|byte| *byte != 0) {
            self.flags = FLAG_HAS_PARENT;
        }
    }

    fn read_map(&mut self) -> Result<()> {
        if self.map.is_some() {
            return Ok(());
        }
        if self.version >= 5 {
            bail!(
                "'{}': version 5 hunk maps are not supported",
                self.path
            );
        }

        self.file
            .seek(SeekFrom::Start(self.map_offset))
            .with_context(|| format!("cannot seek to hunk map of '{}'", self.path))?;

        let entry_size = if self.version < 3 {
            MAP_ENTRY_SIZE_V12
        } else {
            MAP_ENTRY_SIZE_V3
        };

        let mut map = Vec::with_capacity(self.total_hunks as usize);
        let mut buf = [0u8; MAP_ENTRY_SIZE_V3];
        for _ in 0..self.total_hunks {
            self.file
                .read_exact(&mut buf[..entry_size])
                .with_context(|| format!("cannot read hunk map of '{}'", self.path))?;

            if self.version < 3 {
                let packed = be64(&buf);
                let offset = packed & 0xfff_ffff_ffff;
                let length = (packed >> 44) as u32;
                map.push(MapEntry {
                    offset,
                    crc: 0,
                    length,
                    flags: MAP_FLAG_NO_CRC,
                    kind: if length == self.hunk_len {
                        MapEntryKind::Uncompressed
                    } else {
                        MapEntryKind::Compressed
                    },
                });
            } else {
                let offset = be64(&buf);
                let crc = be32(&buf[8..]);
                let length = be16(&buf[12..]) as u32;
                let flags = be16(&buf[14..]);
                let kind = match flags & 0x0f {
                    1 => MapEntryKind::Compressed,
                    2 => MapEntryKind::Uncompressed,
                    3 => MapEntryKind::Mini,
                    4 => MapEntryKind::SelfRef,
                    5 => MapEntryKind::ParentRef,
                    other => bail!("'{}': unknown hunk map entry type {}", self.path, other),
                };
                map.push(MapEntry {
                    offset,
                    crc,
                    length,
                    flags: flags & 0xf0,
                    kind,
                });
            }
        }

        self.map = Some(map);
        Ok(())
    }

    /// Read one hunk into `buf`, which must hold `hunk_len` bytes. Returns
    /// the number of bytes produced.
    pub fn read_hunk(&mut self, index: u64, buf: &mut [u8]) -> Result<usize> {
        if index >= self.total_hunks {
            bail!("'{}': hunk {} out of range", self.path, index);
        }
        self.read_map()?;

        let entry = self.map.as_ref().map(|map| map[index as usize].clone());
        let Some(entry) = entry else {
            bail!("'{}': hunk map missing", self.path);
        };
        if entry.length > self.hunk_len {
            bail!("'{}': hunk {} longer than hunk size", self.path, index);
        }

        let n = match entry.kind {
            MapEntryKind::Uncompressed => {
                self.file.seek(SeekFrom::Start(entry.offset))?;
                let n = entry.length as usize;
                self.file
                    .read_exact(&mut buf[..n])
                    .with_context(|| format!("cannot read hunk {} of '{}'", index, self.path))?;
                n
            }
            MapEntryKind::Compressed => {
                if self.compressors[0] != CODEC_ZLIB {
                    bail!("'{}': unsupported compression in hunk {}", self.path, index);
                }
                self.file.seek(SeekFrom::Start(entry.offset))?;
                let mut compressed = vec![0u8; entry.length as usize];
                self.file
                    .read_exact(&mut compressed)
                    .with_context(|| format!("cannot read hunk {} of '{}'", index, self.path))?;
                let mut decoder = DeflateDecoder::new(compressed.as_slice());
                let mut n = 0;
                while n < self.hunk_len as usize {
                    let got = decoder
                        .read(&mut buf[n..self.hunk_len as usize])
                        .with_context(|| {
                            format!("cannot inflate hunk {} of '{}'", index, self.path)
                        })?;
                    if got == 0 {
                        break;
                    }
                    n += got;
                }
                n
            }
            MapEntryKind::Mini => {
                let pattern = entry.offset.to_be_bytes();
                let n = self.hunk_len as usize;
                buf[..8.min(n)].copy_from_slice(&pattern[..8.min(n)]);
                for i in 8..n {
                    buf[i] = buf[i - 8];
                }
                n
            }
            MapEntryKind::SelfRef => return self.read_hunk(entry.offset, buf),
            MapEntryKind::ParentRef => {
                bail!("'{}': parent-referencing hunks are not supported", self.path)
            }
        };

        if entry.flags & MAP_FLAG_NO_CRC == 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf[..n]);
            if hasher.finalize() != entry.crc {
                bail!("'{}': CRC error in hunk {}", self.path, index);
            }
        }

        Ok(n)
    }

    /// Hash the whole image by streaming its hunks, verifying the computed
    /// digests against the header's declared hashes.
    pub fn get_hashes(&mut self, hashes: &mut Hashes) -> Result<()> {
        if self.version >= 5 {
            // Combined raw+meta SHA1 would be needed here; the v5 hunk map
            // is unsupported anyway, so surface that instead of a wrong hash.
            bail!(
                "'{}': hashing version 5 images is not supported",
                self.path
            );
        }

        let mut types = HashTypes::empty();
        if self.version < 4 {
            types.insert(HashType::Md5);
        }
        if self.version > 2 {
            types.insert(HashType::Sha1);
        }

        let mut computed = Hashes::default();
        let mut update = HashUpdate::new(&mut computed, types);
        let mut buf = vec![0u8; self.hunk_len as usize];
        let mut remaining = self.total_len;

        for index in 0..self.total_hunks {
            let n = self.read_hunk(index, &mut buf)?;
            let take = (remaining.min(n as u64)) as usize;
            update.update(&buf[..take]);
            remaining -= take as u64;
        }
        update.finish();

        if let (Some(declared), Some(got)) = (&self.md5, &computed.md5) {
            if declared != got {
                bail!("'{}': MD5 does not match declared hash", self.path);
            }
        }
        if let (Some(declared), Some(got)) = (&self.raw_sha1, &computed.sha1) {
            if declared != got {
                bail!("'{}': SHA1 does not match declared hash", self.path);
            }
        }

        hashes.merge(&computed);
        Ok(())
    }

    /// Header hashes without touching the hunk data.
    pub fn declared_hashes(&self) -> Hashes {
        Hashes {
            crc: None,
            md5: self.md5,
            sha1: self.sha1,
        }
    }
}

/// Read the hashes of the disk image at `path`: declared header hashes by
/// default, recomputed and verified when `full_check` is set.
pub fn disk_hashes(path: &Utf8Path, full_check: bool) -> Result<Hashes> {
    let mut chd = Chd::open(path)?;
    if full_check {
        let mut hashes = Hashes::default();
        chd.get_hashes(&mut hashes)?;
        Ok(hashes)
    } else {
        Ok(chd.declared_hashes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal v1 CHD: 512-byte hunks, uncompressed map entries.
    fn write_v1_chd(path: &Utf8Path, hunks: &[[u8; 512]]) {
        let mut header = Vec::new();
        header.extend_from_slice(TAG);
        header.extend_from_slice(&76u32.to_be_bytes()); // header length
        header.extend_from_slice(&1u32.to_be_bytes()); // version
        header.extend_from_slice(&0u32.to_be_bytes()); // flags
        header.extend_from_slice(&0u32.to_be_bytes()); // compression: none
        header.extend_from_slice(&1u32.to_be_bytes()); // hunk size in sectors
        header.extend_from_slice(&(hunks.len() as u32).to_be_bytes()); // total hunks
        header.extend_from_slice(&[0u8; 12]); // c/h/s
        let mut body = Vec::new();
        for hunk in hunks {
            body.extend_from_slice(hunk);
        }
        let md5 = crate::hashes::hash_bytes(&body, HashTypes::single(HashType::Md5));
        header.extend_from_slice(&md5.md5.unwrap()); // md5
        header.extend_from_slice(&[0u8; 16]); // parent md5
        assert_eq!(header.len(), 76);

        // map entries follow the header, then hunk data
        let data_start = 76 + hunks.len() * MAP_ENTRY_SIZE_V12;
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&header).unwrap();
        for (i, _) in hunks.iter().enumerate() {
            let offset = (data_start + i * 512) as u64;
            let packed = offset | (512u64 << 44);
            file.write_all(&packed.to_be_bytes()).unwrap();
        }
        file.write_all(&body).unwrap();
    }

    #[test]
    fn v1_header_and_hunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test.chd")).unwrap();

        let hunks = [[0x11u8; 512], [0x22u8; 512]];
        write_v1_chd(&path, &hunks);

        let mut chd = Chd::open(&path).unwrap();
        assert_eq!(chd.version, 1);
        assert_eq!(chd.hunk_len, 512);
        assert_eq!(chd.total_hunks, 2);
        assert_eq!(chd.total_len, 1024);

        let mut buf = vec![0u8; 512];
        assert_eq!(chd.read_hunk(0, &mut buf).unwrap(), 512);
        assert_eq!(buf, vec![0x11u8; 512]);
        assert_eq!(chd.read_hunk(1, &mut buf).unwrap(), 512);
        assert_eq!(buf, vec![0x22u8; 512]);
        assert!(chd.read_hunk(2, &mut buf).is_err());
    }

    #[test]
    fn v1_full_hash_verifies_declared_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test.chd")).unwrap();
        write_v1_chd(&path, &[[0xabu8; 512]]);

        let hashes = disk_hashes(&path, true).unwrap();
        assert!(hashes.md5.is_some());
        assert_eq!(
            hashes.md5,
            crate::hashes::hash_bytes(&[0xabu8; 512], HashTypes::ALL).md5
        );
    }

    #[test]
    fn corrupted_body_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test.chd")).unwrap();
        write_v1_chd(&path, &[[0xabu8; 512]]);

        // flip one data byte behind the header+map
        let mut raw = std::fs::read(&path).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert!(disk_hashes(&path, true).is_err());
        // declared hashes are still readable without the full check
        assert!(disk_hashes(&path, false).is_ok());
    }

    #[test]
    fn rejects_non_chd() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test.chd")).unwrap();
        std::fs::write(&path, b"PK\x03\x04 definitely a zip").unwrap();
        assert!(Chd::open(&path).is_err());
    }

    #[test]
    fn v5_map_reports_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("test.chd")).unwrap();

        let mut header = vec![0u8; 124];
        header[..8].copy_from_slice(TAG);
        header[8..12].copy_from_slice(&124u32.to_be_bytes());
        header[12..16].copy_from_slice(&5u32.to_be_bytes());
        header[16..20].copy_from_slice(&CODEC_ZLIB.to_be_bytes());
        header[32..40].copy_from_slice(&1024u64.to_be_bytes()); // logical bytes
        header[40..48].copy_from_slice(&124u64.to_be_bytes()); // map offset
        header[56..60].copy_from_slice(&512u32.to_be_bytes()); // hunk bytes
        header[64] = 1; // non-zero raw sha1 so it parses as present
        std::fs::write(&path, &header).unwrap();

        let mut chd = Chd::open(&path).unwrap();
        assert_eq!(chd.version, 5);
        let mut buf = vec![0u8; 512];
        let err = chd.read_hunk(0, &mut buf).unwrap_err();
        assert!(err.to_string().contains("not supported"));
        let mut hashes = Hashes::default();
        assert!(chd.get_hashes(&mut hashes).is_err());
    }
}
