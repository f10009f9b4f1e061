use std::io::Read;

use anyhow::{Context as _, Result};
use strum::{Display, EnumString, IntoStaticStr};

use crate::hashes::{HashTypes, HashUpdate, Hashes};
use crate::models::DetectorView;

const EXECUTE_BUF_SIZE: usize = 16 * 1024;

/// Lookup table reversing the bit order of a byte.
static BIT_REVERSE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).reverse_bits();
        i += 1;
    }
    table
};

/// How to transform bytes before hashing. Alignment is 1/2/4.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    #[default]
    None,
    BitSwap,
    ByteSwap,
    WordSwap,
}

impl Operation {
    pub fn alignment(self) -> usize {
        match self {
            Operation::None | Operation::BitSwap => 1,
            Operation::ByteSwap => 2,
            Operation::WordSwap => 4,
        }
    }

    fn apply(self, buf: &mut [u8]) {
        match self {
            Operation::None => {}
            Operation::BitSwap => {
                for byte in buf.iter_mut() {
                    *byte = BIT_REVERSE[*byte as usize];
                }
            }
            Operation::ByteSwap => {
                for pair in buf.chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            }
            Operation::WordSwap => {
                for word in buf.chunks_exact_mut(4) {
                    word.reverse();
                }
            }
        }
    }
}

/// Comparison applied by a data test.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TestOp {
    #[default]
    Data,
    Or,
    And,
    Xor,
}

/// Comparison applied by a file-size test.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum SizeCompare {
    Equal,
    Less,
    Greater,
}

/// Size operand of a file-size test; PO2 matches any power of two.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizeOperand {
    Size(u64),
    PowerOfTwo,
}

/// One predicate of a rule. `result` is the polarity a raw match is
/// treated as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Test {
    Data {
        op: TestOp,
        offset: i64,
        mask: Option<Vec<u8>>,
        value: Vec<u8>,
        result: bool,
    },
    FileSize {
        compare: SizeCompare,
        size: SizeOperand,
        result: bool,
    },
}

/// End offset sentinel: `Eof` means "to end of file".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EndOffset {
    #[default]
    Eof,
    Offset(i64),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub start_offset: i64,
    pub end_offset: EndOffset,
    pub operation: Operation,
    pub tests: Vec<Test>,
}

/// A header-skip rule program in clrmamepro's detector model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Detector {
    pub name: String,
    pub author: String,
    pub version: String,
    pub rules: Vec<Rule>,
}

/// Forward-only buffered reader over the file under test. Bytes already
/// read stay available, so repeated tests reuse them; reads never rewind
/// past the buffer start.
struct Context<'a> {
    reader: &'a mut dyn Read,
    buf: Vec<u8>,
}

impl<'a> Context<'a> {
    fn new(reader: &'a mut dyn Read) -> Self {
        Context {
            reader,
            buf: Vec::new(),
        }
    }

    /// Grow the buffer until at least `length` bytes of the file are held.
    fn fill_buffer(&mut self, length: usize) -> Result<()> {
        while self.buf.len() < length {
            let start = self.buf.len();
            self.buf.resize(length, 0);
            let n = self
                .reader
                .read(&mut self.buf[start..])
                .context("reading file for detector test")?;
            self.buf.truncate(start + n);
            if n == 0 {
                anyhow::bail!("unexpected end of file in detector test");
            }
        }
        Ok(())
    }

    /// Hash `[start, end)` under `operation`, streaming through an aligned
    /// scratch buffer.
    fn compute_view(&mut self, operation: Operation, start: u64, end: u64) -> Result<DetectorView> {
        let mut hashes = Hashes::default();
        let mut update = HashUpdate::new(&mut hashes, HashTypes::ALL);

        let align = operation.alignment();
        let mut pos = start;

        // Use buffered bytes first, padded out to the alignment.
        if (pos as usize) < self.buf.len() {
            let mut length = (self.buf.len() - pos as usize).min((end - pos) as usize);
            if length % align != 0 {
                length += align - length % align;
                let needed = (pos as usize + length).min(end as usize);
                self.fill_buffer(needed)?;
                length = needed - pos as usize;
            }
            let mut chunk = self.buf[pos as usize..pos as usize + length].to_vec();
            operation.apply(&mut chunk);
            update.update(&chunk);
            pos += length as u64;
        } else if pos as usize > self.buf.len() {
            // Skip forward to the start of the range.
            let mut to_skip = pos as usize - self.buf.len();
            let mut scratch = [0u8; 4096];
            // Keep the skipped bytes out of the buffer; tests have already run.
            while to_skip > 0 {
                let n = self.reader.read(&mut scratch[..to_skip.min(4096)])?;
                if n == 0 {
                    anyhow::bail!("unexpected end of file skipping to detector range");
                }
                to_skip -= n;
            }
        }

        let mut chunk = vec![0u8; EXECUTE_BUF_SIZE];
        while pos < end {
            let want = (EXECUTE_BUF_SIZE as u64).min(end - pos) as usize;
            let mut filled = 0;
            while filled < want {
                let n = self.reader.read(&mut chunk[filled..want])?;
                if n == 0 {
                    anyhow::bail!("unexpected end of file in detector range");
                }
                filled += n;
            }
            operation.apply(&mut chunk[..filled]);
            update.update(&chunk[..filled]);
            pos += filled as u64;
        }

        update.finish();
        Ok(DetectorView {
            size: end - start,
            hashes,
        })
    }
}

fn resolve_offset(offset: i64, file_size: u64) -> Option<u64> {
    let resolved = if offset < 0 {
        offset + file_size as i64
    } else {
        offset
    };
    (0..=file_size as i64)
        .contains(&resolved)
        .then_some(resolved as u64)
}

impl Test {
    /// Evaluate against the file; `None` means the test condition could not
    /// hold (offset out of range), which fails the rule like a mismatch.
    fn passes(&self, file_size: u64, ctx: &mut Context) -> Result<bool> {
        match self {
            Test::Data {
                op,
                offset,
                mask,
                value,
                result,
            } => {
                let matched = match resolve_offset(*offset, file_size) {
                    Some(start) if start + value.len() as u64 <= file_size => {
                        let end = start as usize + value.len();
                        ctx.fill_buffer(end)?;
                        let window = &ctx.buf[start as usize..end];
                        match (op, mask) {
                            (TestOp::Data, None) => window == value.as_slice(),
                            (TestOp::Data, Some(mask)) | (TestOp::And, Some(mask)) => window
                                .iter()
                                .zip(mask)
                                .zip(value)
                                .all(|((b, m), v)| b & m == *v),
                            (TestOp::Or, Some(mask)) => window
                                .iter()
                                .zip(mask)
                                .zip(value)
                                .all(|((b, m), v)| b | m == *v),
                            (TestOp::Xor, Some(mask)) => window
                                .iter()
                                .zip(mask)
                                .zip(value)
                                .all(|((b, m), v)| b ^ m == *v),
                            _ => window == value.as_slice(),
                        }
                    }
                    _ => false,
                };
                Ok(matched == *result)
            }
            Test::FileSize {
                compare,
                size,
                result,
            } => {
                let matched = match size {
                    SizeOperand::PowerOfTwo => file_size.is_power_of_two(),
                    SizeOperand::Size(size) => match compare {
                        SizeCompare::Equal => *size == file_size,
                        SizeCompare::Less => *size < file_size,
                        SizeCompare::Greater => *size > file_size,
                    },
                };
                Ok(matched == *result)
            }
        }
    }
}

impl Rule {
    fn execute(&self, file_size: u64, ctx: &mut Context) -> Result<Option<DetectorView>> {
        let Some(start) = resolve_offset(self.start_offset, file_size) else {
            return Ok(None);
        };
        let end = match self.end_offset {
            EndOffset::Eof => file_size,
            EndOffset::Offset(offset) => match resolve_offset(offset, file_size) {
                Some(end) => end,
                None => return Ok(None),
            },
        };
        if start > end {
            return Ok(None);
        }

        for test in &self.tests {
            if !test.passes(file_size, ctx)? {
                return Ok(None);
            }
        }

        ctx.compute_view(self.operation, start, end).map(Some)
    }
}

impl Detector {
    /// Run the rules in order against a file of `file_size` bytes served by
    /// `reader`; the first accepting rule produces the detector view.
    pub fn execute(&self, file_size: u64, reader: &mut dyn Read) -> Result<Option<DetectorView>> {
        let mut ctx = Context::new(reader);

        for rule in &self.rules {
            if let Some(view) = rule.execute(file_size, &mut ctx)? {
                return Ok(Some(view));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::hash_bytes;
    use std::io::Cursor;

    fn ines_detector() -> Detector {
        Detector {
            name: "iNES".to_owned(),
            author: "test".to_owned(),
            version: "1".to_owned(),
            rules: vec![Rule {
                start_offset: 16,
                end_offset: EndOffset::Eof,
                operation: Operation::None,
                tests: vec![Test::Data {
                    op: TestOp::Data,
                    offset: 0,
                    mask: None,
                    value: vec![0x4e, 0x45, 0x53, 0x1a],
                    result: true,
                }],
            }],
        }
    }

    #[test]
    fn header_skip_matches_body() {
        let mut file = vec![0x4e, 0x45, 0x53, 0x1a];
        file.extend_from_slice(&[0u8; 12]);
        file.extend_from_slice(b"rom body data");

        let detector = ines_detector();
        let view = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .expect("rule should accept");

        assert_eq!(view.size, 13);
        assert_eq!(view.hashes, hash_bytes(b"rom body data", HashTypes::ALL));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let file = b"not an ines header at all".to_vec();
        let detector = ines_detector();
        assert!(detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .is_none());
    }

    #[test]
    fn execution_is_deterministic() {
        let mut file = vec![0x4e, 0x45, 0x53, 0x1a];
        file.extend_from_slice(&[0u8; 12]);
        file.extend_from_slice(&[0xabu8; 4096]);

        let detector = ines_detector();
        let first = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap();
        let second = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn negative_offset_counts_from_eof() {
        let file = b"0123456789TAIL".to_vec();
        let detector = Detector {
            rules: vec![Rule {
                start_offset: 0,
                end_offset: EndOffset::Offset(-4),
                operation: Operation::None,
                tests: vec![Test::Data {
                    op: TestOp::Data,
                    offset: -4,
                    mask: None,
                    value: b"TAIL".to_vec(),
                    result: true,
                }],
            }],
            ..Detector::default()
        };

        let view = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .expect("tail test should accept");
        assert_eq!(view.size, 10);
        assert_eq!(view.hashes, hash_bytes(b"0123456789", HashTypes::ALL));
    }

    #[test]
    fn file_size_tests() {
        let file = vec![0u8; 64];
        let detector = Detector {
            rules: vec![Rule {
                start_offset: 0,
                end_offset: EndOffset::Eof,
                operation: Operation::None,
                tests: vec![
                    Test::FileSize {
                        compare: SizeCompare::Equal,
                        size: SizeOperand::PowerOfTwo,
                        result: true,
                    },
                    Test::FileSize {
                        compare: SizeCompare::Equal,
                        size: SizeOperand::Size(64),
                        result: true,
                    },
                ],
            }],
            ..Detector::default()
        };
        assert!(detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .is_some());

        let file = vec![0u8; 65];
        assert!(detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_polarity_inverts_match() {
        let file = b"XXXXdata".to_vec();
        let detector = Detector {
            rules: vec![Rule {
                start_offset: 4,
                end_offset: EndOffset::Eof,
                operation: Operation::None,
                tests: vec![Test::Data {
                    op: TestOp::Data,
                    offset: 0,
                    mask: None,
                    value: b"YYYY".to_vec(),
                    result: false,
                }],
            }],
            ..Detector::default()
        };
        // Bytes differ from YYYY, and result=false means that is a pass.
        assert!(detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .is_some());
    }

    #[test]
    fn byteswap_operation() {
        let file = b"abcdefgh".to_vec();
        let detector = Detector {
            rules: vec![Rule {
                start_offset: 0,
                end_offset: EndOffset::Eof,
                operation: Operation::ByteSwap,
                tests: Vec::new(),
            }],
            ..Detector::default()
        };
        let view = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .expect("empty test list accepts");
        assert_eq!(view.hashes, hash_bytes(b"badcfehg", HashTypes::ALL));
    }

    #[test]
    fn first_accepting_rule_wins() {
        let file = b"ABCDtail".to_vec();
        let detector = Detector {
            rules: vec![
                Rule {
                    start_offset: 0,
                    end_offset: EndOffset::Eof,
                    operation: Operation::None,
                    tests: vec![Test::Data {
                        op: TestOp::Data,
                        offset: 0,
                        mask: None,
                        value: b"ZZZZ".to_vec(),
                        result: true,
                    }],
                },
                Rule {
                    start_offset: 4,
                    end_offset: EndOffset::Eof,
                    operation: Operation::None,
                    tests: vec![Test::Data {
                        op: TestOp::Data,
                        offset: 0,
                        mask: None,
                        value: b"ABCD".to_vec(),
                        result: true,
                    }],
                },
            ],
            ..Detector::default()
        };
        let view = detector
            .execute(file.len() as u64, &mut Cursor::new(&file))
            .unwrap()
            .expect("second rule should accept");
        assert_eq!(view.hashes, hash_bytes(b"tail", HashTypes::ALL));
    }
}
