//! On-block node formats
//!
//! Every payload starts with a kind byte and the owning ParamId:
//! - **Leaf**: rollup + Gorilla-compressed run of samples
//! - **Inner**: level + child references with their rollups
//! - **Root**: commit point listing one partially filled node per level,
//!   followed by the unsealed tail, inline or in overflow leaves

use crate::blockstore::{BlockAddr, MAX_PAYLOAD_SIZE};
use crate::compression::{GorillaDecoder, GorillaEncoder, MAX_SAMPLE_BYTES};
use crate::{AggregateFunction, ParamId, Result, RidgeError, Timestamp, Value};
use bytes::{Buf, BufMut};
use serde::Serialize;

const KIND_LEAF: u8 = 1;
const KIND_INNER: u8 = 2;
const KIND_ROOT: u8 = 3;

const TAIL_INLINE: u8 = 0;
const TAIL_LEAVES: u8 = 1;

const ROLLUP_SIZE: usize = 48;
const CHILD_REF_SIZE: usize = 8 + ROLLUP_SIZE;
const LEAF_HEADER_SIZE: usize = 1 + 8 + 4 + ROLLUP_SIZE + 4;
const INNER_HEADER_SIZE: usize = 1 + 8 + 2 + 2;

/// Bytes of compressed data a leaf can hold
pub const LEAF_DATA_CAPACITY: usize = MAX_PAYLOAD_SIZE - LEAF_HEADER_SIZE;

/// Children an inner node can hold
pub const INNER_CAPACITY: usize = (MAX_PAYLOAD_SIZE - INNER_HEADER_SIZE) / CHILD_REF_SIZE;

/// Summary statistics of a subtree
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rollup {
    pub count: u64,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Rollup {
    pub fn empty() -> Self {
        Self {
            count: 0,
            min_ts: Timestamp::MAX,
            max_ts: Timestamp::MIN,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, ts: Timestamp, value: f64) {
        self.count += 1;
        self.min_ts = self.min_ts.min(ts);
        self.max_ts = self.max_ts.max(ts);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &Rollup) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.min_ts = self.min_ts.min(other.min_ts);
        self.max_ts = self.max_ts.max(other.max_ts);
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Value of an aggregate, `None` when nothing was aggregated
    pub fn get(&self, func: AggregateFunction) -> Option<f64> {
        if self.count == 0 {
            return match func {
                AggregateFunction::Count => Some(0.0),
                _ => None,
            };
        }
        Some(match func {
            AggregateFunction::Count => self.count as f64,
            AggregateFunction::Sum => self.sum,
            AggregateFunction::Mean => self.sum / self.count as f64,
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
        })
    }

    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.count);
        buf.put_u64_le(self.min_ts);
        buf.put_u64_le(self.max_ts);
        buf.put_f64_le(self.sum);
        buf.put_f64_le(self.min);
        buf.put_f64_le(self.max);
    }

    fn get_from(cursor: &mut &[u8]) -> Self {
        Self {
            count: cursor.get_u64_le(),
            min_ts: cursor.get_u64_le(),
            max_ts: cursor.get_u64_le(),
            sum: cursor.get_f64_le(),
            min: cursor.get_f64_le(),
            max: cursor.get_f64_le(),
        }
    }
}

/// Reference from a parent (or the root) to a child node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChildRef {
    pub addr: BlockAddr,
    pub rollup: Rollup,
}

impl ChildRef {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.addr.to_u64());
        self.rollup.put(buf);
    }

    fn get_from(cursor: &mut &[u8]) -> Self {
        let addr = BlockAddr::from_u64(cursor.get_u64_le());
        Self {
            addr,
            rollup: Rollup::get_from(cursor),
        }
    }
}

/// Sealed run of samples
#[derive(Debug, Clone)]
pub struct Leaf {
    pub param_id: ParamId,
    pub rollup: Rollup,
    pub count: u32,
    pub data: Vec<u8>,
}

impl Leaf {
    /// Compress sorted samples into as many leaves as needed to respect the
    /// block size
    pub fn build(param_id: ParamId, samples: &[(Timestamp, Value)]) -> Vec<Leaf> {
        let mut leaves = Vec::new();
        let mut encoder = GorillaEncoder::new();
        let mut rollup = Rollup::empty();

        for (ts, value) in samples {
            if !encoder.is_empty() && encoder.len() + MAX_SAMPLE_BYTES > LEAF_DATA_CAPACITY {
                let full = std::mem::take(&mut encoder);
                leaves.push(Self::seal(param_id, full, rollup));
                rollup = Rollup::empty();
            }
            encoder.encode(*ts, *value);
            rollup.add(*ts, value.as_f64());
        }
        if !encoder.is_empty() {
            leaves.push(Self::seal(param_id, encoder, rollup));
        }
        leaves
    }

    fn seal(param_id: ParamId, encoder: GorillaEncoder, rollup: Rollup) -> Leaf {
        let run = encoder.finish();
        Leaf {
            param_id,
            rollup,
            count: run.count as u32,
            data: run.data,
        }
    }

    /// Decompress all samples
    pub fn samples(&self) -> Result<Vec<(Timestamp, Value)>> {
        GorillaDecoder::new(&self.data, self.count as usize).decode_all()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LEAF_HEADER_SIZE + self.data.len());
        buf.put_u8(KIND_LEAF);
        buf.put_u64_le(self.param_id);
        buf.put_u32_le(self.count);
        self.rollup.put(&mut buf);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf
    }

    pub fn decode(addr: BlockAddr, payload: &[u8]) -> Result<Self> {
        let mut cursor = check_header(addr, payload, KIND_LEAF, LEAF_HEADER_SIZE)?;
        let param_id = cursor.get_u64_le();
        let count = cursor.get_u32_le();
        let rollup = Rollup::get_from(&mut cursor);
        let len = cursor.get_u32_le() as usize;
        if cursor.len() < len {
            return Err(RidgeError::corruption(addr, "leaf data truncated"));
        }
        Ok(Self {
            param_id,
            rollup,
            count,
            data: cursor[..len].to_vec(),
        })
    }
}

/// Node holding references to nodes one level down
#[derive(Debug, Clone)]
pub struct Inner {
    pub param_id: ParamId,
    /// 1 when children are leaves
    pub level: u16,
    pub children: Vec<ChildRef>,
}

impl Inner {
    pub fn rollup(&self) -> Rollup {
        let mut rollup = Rollup::empty();
        for child in &self.children {
            rollup.merge(&child.rollup);
        }
        rollup
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.children.len() <= INNER_CAPACITY);
        let mut buf = Vec::with_capacity(INNER_HEADER_SIZE + self.children.len() * CHILD_REF_SIZE);
        buf.put_u8(KIND_INNER);
        buf.put_u64_le(self.param_id);
        buf.put_u16_le(self.level);
        buf.put_u16_le(self.children.len() as u16);
        for child in &self.children {
            child.put(&mut buf);
        }
        buf
    }

    pub fn decode(addr: BlockAddr, payload: &[u8]) -> Result<Self> {
        let mut cursor = check_header(addr, payload, KIND_INNER, INNER_HEADER_SIZE)?;
        let param_id = cursor.get_u64_le();
        let level = cursor.get_u16_le();
        let n = cursor.get_u16_le() as usize;
        if level == 0 || cursor.len() < n * CHILD_REF_SIZE {
            return Err(RidgeError::corruption(addr, "inner node truncated"));
        }
        let children = (0..n).map(|_| ChildRef::get_from(&mut cursor)).collect();
        Ok(Self {
            param_id,
            level,
            children,
        })
    }
}

/// Samples not yet sealed into leaves when a root was written
#[derive(Debug, Clone, PartialEq)]
pub enum RootTail {
    /// Gorilla run stored in the root block itself
    Inline { count: u32, data: Vec<u8> },
    /// Leaves holding a tail too large for the root block
    Leaves(Vec<BlockAddr>),
}

impl RootTail {
    /// Compress `samples` for storage inside the root
    pub fn inline(samples: &[(Timestamp, Value)]) -> Self {
        let mut encoder = GorillaEncoder::new();
        for (ts, value) in samples {
            encoder.encode(*ts, *value);
        }
        let run = encoder.finish();
        RootTail::Inline {
            count: run.count as u32,
            data: run.data,
        }
    }

    fn put(&self, buf: &mut Vec<u8>) {
        match self {
            RootTail::Inline { count, data } => {
                buf.put_u8(TAIL_INLINE);
                buf.put_u32_le(*count);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            RootTail::Leaves(addrs) => {
                buf.put_u8(TAIL_LEAVES);
                buf.put_u16_le(addrs.len() as u16);
                for addr in addrs {
                    buf.put_u64_le(addr.to_u64());
                }
            }
        }
    }

    fn get_from(addr: BlockAddr, cursor: &mut &[u8]) -> Result<Self> {
        let truncated = || RidgeError::corruption(addr, "root tail truncated");
        if cursor.is_empty() {
            return Err(truncated());
        }
        match cursor.get_u8() {
            TAIL_INLINE => {
                if cursor.len() < 8 {
                    return Err(truncated());
                }
                let count = cursor.get_u32_le();
                let len = cursor.get_u32_le() as usize;
                if cursor.len() < len {
                    return Err(truncated());
                }
                let data = cursor[..len].to_vec();
                cursor.advance(len);
                Ok(RootTail::Inline { count, data })
            }
            TAIL_LEAVES => {
                if cursor.len() < 2 {
                    return Err(truncated());
                }
                let n = cursor.get_u16_le() as usize;
                if cursor.len() < n * 8 {
                    return Err(truncated());
                }
                Ok(RootTail::Leaves(
                    (0..n).map(|_| BlockAddr::from_u64(cursor.get_u64_le())).collect(),
                ))
            }
            kind => Err(RidgeError::corruption(addr, format!("unknown root tail kind {}", kind))),
        }
    }
}

/// Commit point of a tree
#[derive(Debug, Clone)]
pub struct Root {
    pub param_id: ParamId,
    pub last_timestamp: Option<Timestamp>,
    /// Partial node per level, bottom up
    pub levels: Vec<Option<ChildRef>>,
    pub tail: RootTail,
}

impl Root {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(KIND_ROOT);
        buf.put_u64_le(self.param_id);
        match self.last_timestamp {
            Some(ts) => {
                buf.put_u8(1);
                buf.put_u64_le(ts);
            }
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
        }
        buf.put_u16_le(self.levels.len() as u16);
        for level in &self.levels {
            match level {
                Some(child) => {
                    buf.put_u8(1);
                    child.put(&mut buf);
                }
                None => buf.put_u8(0),
            }
        }
        self.tail.put(&mut buf);
        buf
    }

    pub fn decode(addr: BlockAddr, payload: &[u8]) -> Result<Self> {
        let mut cursor = check_header(addr, payload, KIND_ROOT, 1 + 8 + 9 + 2)?;
        let param_id = cursor.get_u64_le();
        let has_last = cursor.get_u8() == 1;
        let last = cursor.get_u64_le();
        let n = cursor.get_u16_le() as usize;

        let mut levels = Vec::with_capacity(n);
        for _ in 0..n {
            if cursor.is_empty() {
                return Err(RidgeError::corruption(addr, "root truncated"));
            }
            if cursor.get_u8() == 1 {
                if cursor.len() < CHILD_REF_SIZE {
                    return Err(RidgeError::corruption(addr, "root truncated"));
                }
                levels.push(Some(ChildRef::get_from(&mut cursor)));
            } else {
                levels.push(None);
            }
        }
        let tail = RootTail::get_from(addr, &mut cursor)?;

        Ok(Self {
            param_id,
            last_timestamp: has_last.then_some(last),
            levels,
            tail,
        })
    }
}

fn check_header<'a>(addr: BlockAddr, payload: &'a [u8], kind: u8, min_len: usize) -> Result<&'a [u8]> {
    if payload.len() < min_len {
        return Err(RidgeError::corruption(addr, "node payload too short"));
    }
    if payload[0] != kind {
        return Err(RidgeError::corruption(
            addr,
            format!("expected node kind {}, found {}", kind, payload[0]),
        ));
    }
    Ok(&payload[1..])
}
