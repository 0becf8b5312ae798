//! The byte mover behind fills, copies and reductions.
//!
//! Reductions operate on 8 byte little endian signed integers with wrapping arithmetic, so every
//! operator is associative and commutative and any fold order yields the same bytes.

use crate::error::{InstanceError, InstanceResult};
use crate::layout::{CopySrcDstField, FieldId};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

const LANE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionOpKind {
    Sum,
    Prod,
    Min,
    Max,
}

impl ReductionOpKind {
    pub fn identity(&self) -> i64 {
        match self {
            ReductionOpKind::Sum => 0,
            ReductionOpKind::Prod => 1,
            ReductionOpKind::Min => i64::MAX,
            ReductionOpKind::Max => i64::MIN,
        }
    }

    pub fn fold(&self, lhs: i64, rhs: i64) -> i64 {
        match self {
            ReductionOpKind::Sum => lhs.wrapping_add(rhs),
            ReductionOpKind::Prod => lhs.wrapping_mul(rhs),
            ReductionOpKind::Min => lhs.min(rhs),
            ReductionOpKind::Max => lhs.max(rhs),
        }
    }

    /// Folds `src` into `dst` lane by lane
    pub fn fold_bytes(&self, dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        for (d, s) in dst.chunks_exact_mut(LANE).zip(src.chunks_exact(LANE)) {
            let mut lhs = [0u8; LANE];
            lhs.copy_from_slice(d);
            let mut rhs = [0u8; LANE];
            rhs.copy_from_slice(s);
            let folded = self.fold(i64::from_le_bytes(lhs), i64::from_le_bytes(rhs));
            d.copy_from_slice(&folded.to_le_bytes());
        }
    }
}

/// Dense per-field contents of `volume` elements, detached from any instance so it can travel
/// between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBuffer {
    fields: Vec<FieldId>,
    volume: usize,
    data: Vec<ByteBuf>,
}

impl FieldBuffer {
    pub fn new(volume: usize) -> FieldBuffer {
        FieldBuffer {
            fields: Vec::new(),
            volume,
            data: Vec::new(),
        }
    }

    /// Adds a field whose every element is `value`
    pub fn with_uniform_field(mut self, fid: FieldId, value: &[u8]) -> FieldBuffer {
        let mut bytes = Vec::with_capacity(value.len() * self.volume);
        for _ in 0..self.volume {
            bytes.extend_from_slice(value);
        }
        self.push_field(fid, bytes);
        self
    }

    pub fn push_field(&mut self, fid: FieldId, bytes: Vec<u8>) {
        self.fields.push(fid);
        self.data.push(ByteBuf::from(bytes));
    }

    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn field(&self, fid: FieldId) -> Option<&[u8]> {
        self.fields
            .iter()
            .position(|f| *f == fid)
            .map(|pos| self.data[pos].as_slice())
    }

    /// Field contents reinterpreted as reduction lanes
    pub fn field_as_i64(&self, fid: FieldId) -> Option<Vec<i64>> {
        self.field(fid).map(|bytes| {
            bytes
                .chunks_exact(LANE)
                .map(|c| {
                    let mut lane = [0u8; LANE];
                    lane.copy_from_slice(c);
                    i64::from_le_bytes(lane)
                })
                .collect()
        })
    }

    /// Folds `other` into this buffer; both must hold the same fields in the same order
    pub fn fold_from(&mut self, other: &FieldBuffer, redop: ReductionOpKind) -> InstanceResult<()> {
        if self.fields != other.fields || self.volume != other.volume {
            return Err(InstanceError::Transport(format!(
                "mismatched reduction buffers {:?}x{} and {:?}x{}",
                self.fields, self.volume, other.fields, other.volume
            )));
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            if dst.len() != src.len() {
                return Err(InstanceError::Transport(
                    "mismatched reduction field sizes".to_owned(),
                ));
            }
            redop.fold_bytes(dst.as_mut_slice(), src.as_slice());
        }
        Ok(())
    }
}

/// Writes `value` into every element of each field
pub(crate) fn fill(bytes: &mut [u8], fields: &[CopySrcDstField], volume: usize, value: &[u8]) {
    for field in fields {
        debug_assert_eq!(field.size, value.len());
        for elem in 0..volume {
            let start = field.offset + elem * field.stride;
            match field.redop {
                Some(redop) => redop.fold_bytes(&mut bytes[start..start + field.size], value),
                None => bytes[start..start + field.size].copy_from_slice(value),
            }
        }
    }
}

/// Packs the fields of an instance into a dense buffer
pub(crate) fn gather(bytes: &[u8], fields: &[CopySrcDstField], volume: usize) -> FieldBuffer {
    let mut buffer = FieldBuffer::new(volume);
    for field in fields {
        let mut dense = Vec::with_capacity(field.size * volume);
        for elem in 0..volume {
            let start = field.offset + elem * field.stride;
            dense.extend_from_slice(&bytes[start..start + field.size]);
        }
        buffer.push_field(field.fid, dense);
    }
    buffer
}

/// Unpacks a dense buffer into an instance, folding where the field descriptor carries a reduction
pub(crate) fn scatter(
    bytes: &mut [u8],
    fields: &[CopySrcDstField],
    volume: usize,
    buffer: &FieldBuffer,
) -> InstanceResult<()> {
    if buffer.volume() != volume {
        return Err(InstanceError::Transport(format!(
            "buffer of {} elements scattered into {} elements",
            buffer.volume(),
            volume
        )));
    }
    for field in fields {
        let dense = buffer
            .field(field.fid)
            .ok_or(InstanceError::UnknownField(field.fid))?;
        for elem in 0..volume {
            let start = field.offset + elem * field.stride;
            let src = &dense[elem * field.size..(elem + 1) * field.size];
            match field.redop {
                Some(redop) => redop.fold_bytes(&mut bytes[start..start + field.size], src),
                None => bytes[start..start + field.size].copy_from_slice(src),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(fid: FieldId, offset: usize, stride: usize) -> CopySrcDstField {
        CopySrcDstField {
            fid,
            offset,
            size: 8,
            stride,
            serdez: 0,
            redop: None,
        }
    }

    #[test]
    fn fill_gather_scatter_aos() {
        let fields = vec![desc(1, 0, 16), desc(2, 8, 16)];
        let mut bytes = vec![0u8; 48];
        fill(&mut bytes, &fields[..1], 3, &7i64.to_le_bytes());
        let buffer = gather(&bytes, &fields, 3);
        assert_eq!(buffer.field_as_i64(1), Some(vec![7, 7, 7]));
        assert_eq!(buffer.field_as_i64(2), Some(vec![0, 0, 0]));

        let mut summed = fields.clone();
        summed.iter_mut().for_each(|f| f.set_redop(ReductionOpKind::Sum));
        scatter(&mut bytes, &summed, 3, &buffer).expect("scatter");
        let buffer = gather(&bytes, &fields, 3);
        assert_eq!(buffer.field_as_i64(1), Some(vec![14, 14, 14]));
    }

    #[test]
    fn folds_are_order_independent() {
        let values = [3i64, -9, 12, 40];
        for redop in [
            ReductionOpKind::Sum,
            ReductionOpKind::Prod,
            ReductionOpKind::Min,
            ReductionOpKind::Max,
        ] {
            let forward = values.iter().fold(redop.identity(), |acc, v| redop.fold(acc, *v));
            let backward = values
                .iter()
                .rev()
                .fold(redop.identity(), |acc, v| redop.fold(acc, *v));
            assert_eq!(forward, backward);
        }
    }

    #[test]
    fn fold_buffers() {
        let mut a = FieldBuffer::new(2).with_uniform_field(4, &5i64.to_le_bytes());
        let b = FieldBuffer::new(2).with_uniform_field(4, &(-2i64).to_le_bytes());
        a.fold_from(&b, ReductionOpKind::Min).expect("fold");
        assert_eq!(a.field_as_i64(4), Some(vec![-2, -2]));
        let c = FieldBuffer::new(3).with_uniform_field(4, &1i64.to_le_bytes());
        assert!(a.fold_from(&c, ReductionOpKind::Sum).is_err());
    }
}
