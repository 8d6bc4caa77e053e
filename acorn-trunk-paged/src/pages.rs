//! On-page formats: the double-buffered meta slots and the three node kinds.
//!
//! Pages are 4 KiB. Pages 0 and 1 hold meta slots A and B; whichever carries
//! the highest sequence number with a valid checksum is the committed state.
//! Data pages start at id 2 and are typed by their first byte.

use acorn_core::{AcornError, AcornResult};

pub const PAGE_SIZE: usize = 4096;
pub const META_SLOTS: u64 = 2;
/// Values up to this many bytes are stored inline in the leaf; larger ones
/// spill into an overflow chain.
pub const INLINE_MAX: usize = 2032;
/// Ids longer than this are rejected; keeps any two leaf entries splittable
/// across pages.
pub const MAX_KEY_LEN: usize = 512;
pub const OVERFLOW_HEADER: usize = 13; // type + next page + chunk len
pub const OVERFLOW_CAP: usize = PAGE_SIZE - OVERFLOW_HEADER;

const META_MAGIC: u32 = 0x4143_5047; // "ACPG"
const META_FORMAT: u16 = 1;
const META_LEN: usize = 52;

pub const PAGE_LEAF: u8 = 1;
pub const PAGE_INTERNAL: u8 = 2;
pub const PAGE_OVERFLOW: u8 = 3;
pub const PAGE_FREE: u8 = 4;

/// Contents of one meta slot; committing a transaction means writing this
/// with `sequence + 1` into the other slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub sequence: u64,
    pub root_page: u64,
    pub free_head: u64,
    pub next_page_id: u64,
    pub entry_count: u64,
}

impl Meta {
    pub fn initial() -> Self {
        Meta {
            sequence: 1,
            root_page: 0,
            free_head: 0,
            next_page_id: META_SLOTS,
            entry_count: 0,
        }
    }

    pub fn slot(&self) -> u64 {
        self.sequence % META_SLOTS
    }

    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&META_FORMAT.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.root_page.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.entry_count.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..48]);
        buf[48..52].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(page: &[u8]) -> Option<Self> {
        if page.len() < META_LEN {
            return None;
        }
        if u32::from_le_bytes(page[0..4].try_into().ok()?) != META_MAGIC {
            return None;
        }
        if u16::from_le_bytes(page[4..6].try_into().ok()?) != META_FORMAT {
            return None;
        }
        let stored_crc = u32::from_le_bytes(page[48..52].try_into().ok()?);
        if crc32fast::hash(&page[0..48]) != stored_crc {
            return None;
        }
        Some(Meta {
            sequence: u64::from_le_bytes(page[8..16].try_into().ok()?),
            root_page: u64::from_le_bytes(page[16..24].try_into().ok()?),
            free_head: u64::from_le_bytes(page[24..32].try_into().ok()?),
            next_page_id: u64::from_le_bytes(page[32..40].try_into().ok()?),
            entry_count: u64::from_le_bytes(page[40..48].try_into().ok()?),
        })
    }
}

/// Where a leaf entry's value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValRef {
    Inline(Vec<u8>),
    Overflow { total_len: u64, first_page: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Vec<(Vec<u8>, ValRef)>),
    Internal {
        /// `children.len() == separators.len() + 1`; keys < separators[i]
        /// descend left of child i + 1.
        children: Vec<u64>,
        separators: Vec<Vec<u8>>,
    },
}

impl Node {
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(entries) => {
                3 + entries
                    .iter()
                    .map(|(key, val)| {
                        2 + key.len()
                            + 1
                            + match val {
                                ValRef::Inline(bytes) => 4 + bytes.len(),
                                ValRef::Overflow { .. } => 16,
                            }
                    })
                    .sum::<usize>()
            }
            Node::Internal {
                children: _,
                separators,
            } => 3 + 8 + separators.iter().map(|sep| 2 + sep.len() + 8).sum::<usize>(),
        }
    }

    pub fn fits(&self) -> bool {
        self.encoded_len() <= PAGE_SIZE
    }

    pub fn encode_into(&self, page: &mut [u8]) {
        page.fill(0);
        match self {
            Node::Leaf(entries) => {
                page[0] = PAGE_LEAF;
                page[1..3].copy_from_slice(&(entries.len() as u16).to_le_bytes());
                let mut pos = 3;
                for (key, val) in entries {
                    page[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    pos += 2;
                    page[pos..pos + key.len()].copy_from_slice(key);
                    pos += key.len();
                    match val {
                        ValRef::Inline(bytes) => {
                            page[pos] = 0;
                            pos += 1;
                            page[pos..pos + 4]
                                .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                            pos += 4;
                            page[pos..pos + bytes.len()].copy_from_slice(bytes);
                            pos += bytes.len();
                        }
                        ValRef::Overflow {
                            total_len,
                            first_page,
                        } => {
                            page[pos] = 1;
                            pos += 1;
                            page[pos..pos + 8].copy_from_slice(&total_len.to_le_bytes());
                            pos += 8;
                            page[pos..pos + 8].copy_from_slice(&first_page.to_le_bytes());
                            pos += 8;
                        }
                    }
                }
            }
            Node::Internal {
                children,
                separators,
            } => {
                page[0] = PAGE_INTERNAL;
                page[1..3].copy_from_slice(&(separators.len() as u16).to_le_bytes());
                let mut pos = 3;
                page[pos..pos + 8].copy_from_slice(&children[0].to_le_bytes());
                pos += 8;
                for (sep, child) in separators.iter().zip(children.iter().skip(1)) {
                    page[pos..pos + 2].copy_from_slice(&(sep.len() as u16).to_le_bytes());
                    pos += 2;
                    page[pos..pos + sep.len()].copy_from_slice(sep);
                    pos += sep.len();
                    page[pos..pos + 8].copy_from_slice(&child.to_le_bytes());
                    pos += 8;
                }
            }
        }
    }

    pub fn decode(page: &[u8]) -> AcornResult<Node> {
        let mut reader = PageReader { page, pos: 1 };
        match page.first().copied() {
            Some(PAGE_LEAF) => {
                let n = reader.u16()? as usize;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let key_len = reader.u16()? as usize;
                    let key = reader.take(key_len)?.to_vec();
                    let val = match reader.u8()? {
                        0 => {
                            let val_len = reader.u32()? as usize;
                            ValRef::Inline(reader.take(val_len)?.to_vec())
                        }
                        1 => ValRef::Overflow {
                            total_len: reader.u64()?,
                            first_page: reader.u64()?,
                        },
                        _ => return Err(corrupt("unknown value kind")),
                    };
                    entries.push((key, val));
                }
                Ok(Node::Leaf(entries))
            }
            Some(PAGE_INTERNAL) => {
                let n = reader.u16()? as usize;
                let mut children = Vec::with_capacity(n + 1);
                children.push(reader.u64()?);
                let mut separators = Vec::with_capacity(n);
                for _ in 0..n {
                    let sep_len = reader.u16()? as usize;
                    separators.push(reader.take(sep_len)?.to_vec());
                    children.push(reader.u64()?);
                }
                Ok(Node::Internal {
                    children,
                    separators,
                })
            }
            other => Err(corrupt(&format!("unexpected node type {other:?}"))),
        }
    }
}

fn corrupt(what: &str) -> AcornError {
    AcornError::Storage(format!("corrupt page: {what}"))
}

struct PageReader<'a> {
    page: &'a [u8],
    pos: usize,
}

impl<'a> PageReader<'a> {
    fn take(&mut self, n: usize) -> AcornResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.page.len())
            .ok_or_else(|| corrupt("field overruns page"))?;
        let slice = &self.page[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> AcornResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> AcornResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> AcornResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> AcornResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}
