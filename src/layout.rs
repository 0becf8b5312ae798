//! Field spaces, layout constraints and the shared layout descriptions derived from them.

use crate::copy::ReductionOpKind;
use crate::error::{InstanceError, InstanceResult};

use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type FieldId = u32;
pub type FieldSpaceId = u32;

/// Maximum number of fields in a field space, one bit of a [FieldMask] each
pub const MAX_FIELDS: usize = 64;

/// A set of field indices within one field space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldMask(u64);

impl FieldMask {
    pub fn new() -> FieldMask {
        FieldMask(0)
    }

    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> FieldMask {
        let mut mask = FieldMask::new();
        for idx in indices {
            mask.set(idx);
        }
        mask
    }

    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < MAX_FIELDS);
        self.0 |= 1 << idx;
    }

    pub fn unset(&mut self, idx: usize) {
        self.0 &= !(1 << idx);
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < MAX_FIELDS && (self.0 >> idx) & 1 == 1
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn pop_count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 | other.0)
    }

    pub fn intersection(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 & other.0)
    }

    pub fn difference(&self, other: &FieldMask) -> FieldMask {
        FieldMask(self.0 & !other.0)
    }

    /// true if every field of `other` is also in this mask
    pub fn contains(&self, other: &FieldMask) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_FIELDS).filter(move |idx| self.is_set(*idx))
    }
}

impl std::ops::BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: FieldMask) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub fid: FieldId,
    pub size: usize,
    /// custom serialization id, 0 when the field is plain bytes
    pub serdez: u32,
}

/// The fields available in a logical region, each with a fixed byte size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpace {
    id: FieldSpaceId,
    fields: Vec<FieldInfo>,
}

impl FieldSpace {
    pub fn new(id: FieldSpaceId, fields: Vec<(FieldId, usize)>) -> FieldSpace {
        assert!(fields.len() <= MAX_FIELDS, "too many fields in field space {}", id);
        FieldSpace {
            id,
            fields: fields
                .into_iter()
                .map(|(fid, size)| FieldInfo {
                    fid,
                    size,
                    serdez: 0,
                })
                .collect(),
        }
    }

    /// Marks `fid` as using custom serialization `serdez`
    pub fn with_serdez(mut self, fid: FieldId, serdez: u32) -> FieldSpace {
        if let Some(info) = self.fields.iter_mut().find(|f| f.fid == fid) {
            info.serdez = serdez;
        }
        self
    }

    pub fn id(&self) -> FieldSpaceId {
        self.id
    }

    pub fn field_index(&self, fid: FieldId) -> Option<usize> {
        self.fields.iter().position(|f| f.fid == fid)
    }

    pub fn field_info(&self, fid: FieldId) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.fid == fid)
    }

    pub fn fid_at(&self, idx: usize) -> Option<FieldId> {
        self.fields.get(idx).map(|f| f.fid)
    }

    pub fn mask_of(&self, fids: &[FieldId]) -> InstanceResult<FieldMask> {
        let mut mask = FieldMask::new();
        for fid in fids {
            match self.field_index(*fid) {
                Some(idx) => mask.set(idx),
                None => return Err(InstanceError::UnknownField(*fid)),
            }
        }
        Ok(mask)
    }

    pub fn fields_of(&self, mask: &FieldMask) -> Vec<FieldId> {
        mask.indices().filter_map(|idx| self.fid_at(idx)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    System,
    Registered,
    Framebuffer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldOrdering {
    /// each field stored contiguously
    #[default]
    Soa,
    /// all fields of one element stored together
    Aos,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecializedKind {
    #[default]
    Normal,
    /// a reduction instance folding with the given operator
    Reduction(ReductionOpKind),
    Virtual,
}

/// Which kind of constraint could not be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutConstraintKind {
    Field,
    Ordering,
    Alignment,
    Memory,
    Specialized,
    Dimension,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConstraintSet {
    pub fields: Vec<FieldId>,
    pub ordering: FieldOrdering,
    pub alignments: Vec<(FieldId, usize)>,
    pub memory_kind: Option<MemoryKind>,
    pub specialized: SpecializedKind,
}

impl LayoutConstraintSet {
    pub fn new(fields: Vec<FieldId>) -> LayoutConstraintSet {
        LayoutConstraintSet {
            fields,
            ordering: FieldOrdering::Soa,
            alignments: Vec::new(),
            memory_kind: None,
            specialized: SpecializedKind::Normal,
        }
    }

    pub fn with_ordering(mut self, ordering: FieldOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_alignment(mut self, fid: FieldId, alignment: usize) -> Self {
        self.alignments.push((fid, alignment));
        self
    }

    pub fn in_memory_kind(mut self, kind: MemoryKind) -> Self {
        self.memory_kind = Some(kind);
        self
    }

    pub fn with_reduction(mut self, redop: ReductionOpKind) -> Self {
        self.specialized = SpecializedKind::Reduction(redop);
        self
    }

    pub fn alignment_of(&self, fid: FieldId) -> usize {
        self.alignments
            .iter()
            .filter(|(f, _)| *f == fid)
            .map(|(_, a)| *a)
            .max()
            .unwrap_or(1)
    }
}

/// Where one field lives inside an instance, as consumed by the copy engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySrcDstField {
    pub fid: FieldId,
    pub offset: usize,
    pub size: usize,
    pub stride: usize,
    pub serdez: u32,
    pub redop: Option<ReductionOpKind>,
}

impl CopySrcDstField {
    /// Writes through this descriptor fold into the destination instead of overwriting it
    pub fn set_redop(&mut self, redop: ReductionOpKind) {
        self.redop = Some(redop);
    }

    pub fn clear_redop(&mut self) {
        self.redop = None;
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) / alignment * alignment
    }
}

/// Immutable description of how the fields of a layout are packed into bytes.
///
/// Descriptions are interned per runtime by [LayoutTable] and shared by every instance using them.
#[derive(Debug)]
pub struct LayoutDescription {
    layout_id: u64,
    field_space: FieldSpaceId,
    allocated_fields: FieldMask,
    constraints: LayoutConstraintSet,
    total_dims: u32,
    // allocation order
    field_infos: Vec<FieldInfo>,
    field_indices: Vec<usize>,
    comp_cache: Mutex<BTreeMap<u32, Vec<(FieldMask, Arc<Vec<usize>>)>>>,
}

impl LayoutDescription {
    fn new(
        layout_id: u64,
        field_space: &FieldSpace,
        constraints: LayoutConstraintSet,
        total_dims: u32,
    ) -> InstanceResult<LayoutDescription> {
        if total_dims != 1 {
            return Err(InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Dimension,
                field_index: None,
            });
        }
        let mut allocated_fields = FieldMask::new();
        let mut field_infos = Vec::with_capacity(constraints.fields.len());
        let mut field_indices = Vec::with_capacity(constraints.fields.len());
        for (i, fid) in constraints.fields.iter().enumerate() {
            let idx = match field_space.field_index(*fid) {
                Some(idx) if !allocated_fields.is_set(idx) => idx,
                _ => {
                    return Err(InstanceError::LayoutUnsatisfiable {
                        kind: LayoutConstraintKind::Field,
                        field_index: Some(i),
                    })
                }
            };
            allocated_fields.set(idx);
            field_indices.push(idx);
            // field_index(fid) succeeded above
            if let Some(info) = field_space.field_info(*fid) {
                field_infos.push(info.clone());
            }
        }
        for (fid, alignment) in constraints.alignments.iter() {
            if !alignment.is_power_of_two() {
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Alignment,
                    field_index: constraints.fields.iter().position(|f| f == fid),
                });
            }
        }
        if let SpecializedKind::Reduction(_) = constraints.specialized {
            if let Some(i) = field_infos
                .iter()
                .position(|info| info.size == 0 || info.size % 8 != 0)
            {
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Specialized,
                    field_index: Some(i),
                });
            }
        }
        Ok(LayoutDescription {
            layout_id,
            field_space: field_space.id(),
            allocated_fields,
            constraints,
            total_dims,
            field_infos,
            field_indices,
            comp_cache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn layout_id(&self) -> u64 {
        self.layout_id
    }

    pub fn field_space(&self) -> FieldSpaceId {
        self.field_space
    }

    pub fn allocated_fields(&self) -> FieldMask {
        self.allocated_fields
    }

    pub fn constraints(&self) -> &LayoutConstraintSet {
        &self.constraints
    }

    pub fn total_dims(&self) -> u32 {
        self.total_dims
    }

    pub fn redop(&self) -> Option<ReductionOpKind> {
        match self.constraints.specialized {
            SpecializedKind::Reduction(op) => Some(op),
            _ => None,
        }
    }

    /// (offset, stride) of every field in allocation order, and the total footprint in bytes
    pub fn field_offsets(&self, volume: usize) -> (Vec<(usize, usize)>, usize) {
        match self.constraints.ordering {
            FieldOrdering::Soa => {
                let mut cursor = 0;
                let offsets = self
                    .field_infos
                    .iter()
                    .map(|info| {
                        cursor = align_up(cursor, self.constraints.alignment_of(info.fid));
                        let offset = cursor;
                        cursor += info.size * volume;
                        (offset, info.size)
                    })
                    .collect();
                (offsets, cursor)
            }
            FieldOrdering::Aos => {
                let mut cursor = 0;
                let mut max_align = 1;
                let positions: Vec<usize> = self
                    .field_infos
                    .iter()
                    .map(|info| {
                        let align = self.constraints.alignment_of(info.fid);
                        max_align = max_align.max(align);
                        cursor = align_up(cursor, align);
                        let offset = cursor;
                        cursor += info.size;
                        offset
                    })
                    .collect();
                let element = align_up(cursor, max_align);
                (
                    positions.into_iter().map(|o| (o, element)).collect(),
                    element * volume,
                )
            }
        }
    }

    /// Bytes needed for an instance of this layout covering `volume` elements
    pub fn footprint(&self, volume: usize) -> usize {
        self.field_offsets(volume).1
    }

    // allocation positions of the fields in `mask`, ordered by field index
    fn positions_for(&self, mask: &FieldMask) -> Arc<Vec<usize>> {
        let popcount = mask.pop_count();
        let mut cache = self.comp_cache.lock();
        if let Some(entries) = cache.get(&popcount) {
            if let Some((_, positions)) = entries.iter().find(|(m, _)| m == mask) {
                return positions.clone();
            }
        }
        let positions: Arc<Vec<usize>> = Arc::new(
            self.field_indices
                .iter()
                .enumerate()
                .filter(|(_, idx)| mask.is_set(**idx))
                .sorted_by_key(|(_, idx)| **idx)
                .map(|(pos, _)| pos)
                .collect(),
        );
        cache
            .entry(popcount)
            .or_default()
            .push((*mask, positions.clone()));
        positions
    }

    /// Copy descriptors for the fields in `mask` (which must be allocated here), in field index order
    pub fn compute_copy_offsets(&self, mask: &FieldMask, volume: usize) -> Vec<CopySrcDstField> {
        debug_assert!(self.allocated_fields.contains(mask));
        let (offsets, _) = self.field_offsets(volume);
        let redop = self.redop();
        self.positions_for(mask)
            .iter()
            .map(|pos| {
                let info = &self.field_infos[*pos];
                let (offset, stride) = offsets[*pos];
                CopySrcDstField {
                    fid: info.fid,
                    offset,
                    size: info.size,
                    stride,
                    serdez: info.serdez,
                    redop,
                }
            })
            .collect()
    }

    /// Copy descriptors for an explicit field list, in the order given
    pub fn compute_copy_offsets_for_fields(
        &self,
        fids: &[FieldId],
        volume: usize,
    ) -> InstanceResult<Vec<CopySrcDstField>> {
        let (offsets, _) = self.field_offsets(volume);
        let redop = self.redop();
        fids.iter()
            .map(|fid| {
                let pos = self
                    .field_infos
                    .iter()
                    .position(|info| info.fid == *fid)
                    .ok_or(InstanceError::UnknownField(*fid))?;
                let info = &self.field_infos[pos];
                let (offset, stride) = offsets[pos];
                Ok(CopySrcDstField {
                    fid: info.fid,
                    offset,
                    size: info.size,
                    stride,
                    serdez: info.serdez,
                    redop,
                })
            })
            .collect()
    }

    pub fn cached_masks(&self) -> usize {
        self.comp_cache.lock().values().map(|v| v.len()).sum()
    }

    pub fn match_layout(&self, constraints: &LayoutConstraintSet, total_dims: u32) -> bool {
        self.total_dims == total_dims && self.constraints == *constraints
    }

    pub fn match_layout_description(&self, other: &LayoutDescription) -> bool {
        self.field_space == other.field_space
            && self.allocated_fields == other.allocated_fields
            && self.match_layout(&other.constraints, other.total_dims)
    }

    /// Checks that an instance with this layout can serve a request for `constraints`
    pub fn entails(&self, constraints: &LayoutConstraintSet) -> Result<(), (LayoutConstraintKind, Option<usize>)> {
        if let Some(i) = constraints.fields.iter().position(|fid| !self.has_field(*fid)) {
            return Err((LayoutConstraintKind::Field, Some(i)));
        }
        if constraints.fields.len() > 1 && constraints.ordering != self.constraints.ordering {
            return Err((LayoutConstraintKind::Ordering, None));
        }
        if constraints.specialized != self.constraints.specialized {
            return Err((LayoutConstraintKind::Specialized, None));
        }
        for (fid, alignment) in constraints.alignments.iter() {
            if self.constraints.alignment_of(*fid) % alignment != 0 {
                return Err((
                    LayoutConstraintKind::Alignment,
                    constraints.fields.iter().position(|f| f == fid),
                ));
            }
        }
        Ok(())
    }

    pub fn has_field(&self, fid: FieldId) -> bool {
        self.field_infos.iter().any(|info| info.fid == fid)
    }

    pub fn has_fields(&self, fids: &[FieldId]) -> bool {
        fids.iter().all(|fid| self.has_field(*fid))
    }

    /// Drops from `fids` every field this layout already holds
    pub fn remove_space_fields(&self, fids: &mut Vec<FieldId>) {
        fids.retain(|fid| !self.has_field(*fid));
    }

    pub fn get_fields(&self) -> Vec<FieldId> {
        self.field_infos.iter().map(|info| info.fid).collect()
    }

    pub fn find_field_info(&self, fid: FieldId) -> Option<&FieldInfo> {
        self.field_infos.iter().find(|info| info.fid == fid)
    }

    /// Bytes per element across all fields
    pub fn get_total_field_size(&self) -> usize {
        self.field_infos.iter().map(|info| info.size).sum()
    }

    /// Fields whose contents need custom destruction when the instance is deleted
    pub fn compute_destroyed_fields(&self) -> Vec<(FieldId, u32)> {
        self.field_infos
            .iter()
            .filter(|info| info.serdez != 0)
            .map(|info| (info.fid, info.serdez))
            .collect()
    }
}

/// Deduplicates layout descriptions so structurally identical requests share one description
#[derive(Debug, Default)]
pub struct LayoutTable {
    next_id: AtomicU64,
    layouts: Mutex<HashMap<(FieldSpaceId, FieldMask), Vec<Arc<LayoutDescription>>>>,
}

impl LayoutTable {
    pub fn new() -> LayoutTable {
        LayoutTable::default()
    }

    pub fn find_or_create(
        &self,
        field_space: &FieldSpace,
        constraints: &LayoutConstraintSet,
        total_dims: u32,
    ) -> InstanceResult<Arc<LayoutDescription>> {
        let mask = match field_space.mask_of(&constraints.fields) {
            Ok(mask) => mask,
            Err(_) => {
                let field_index = constraints
                    .fields
                    .iter()
                    .position(|fid| field_space.field_index(*fid).is_none());
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Field,
                    field_index,
                });
            }
        };
        let mut layouts = self.layouts.lock();
        let candidates = layouts.entry((field_space.id(), mask)).or_default();
        if let Some(existing) = candidates
            .iter()
            .find(|layout| layout.match_layout(constraints, total_dims))
        {
            return Ok(existing.clone());
        }
        let layout = Arc::new(LayoutDescription::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            field_space,
            constraints.clone(),
            total_dims,
        )?);
        tracing::trace!(layout_id = layout.layout_id, ?mask, "new layout description");
        candidates.push(layout.clone());
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.layouts.lock().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_space() -> FieldSpace {
        FieldSpace::new(1, vec![(10, 8), (11, 4), (12, 8)]).with_serdez(12, 3)
    }

    #[test]
    fn soa_offsets() {
        let table = LayoutTable::new();
        let layout = table
            .find_or_create(&field_space(), &LayoutConstraintSet::new(vec![10, 11]), 1)
            .expect("layout");
        let (offsets, footprint) = layout.field_offsets(4);
        assert_eq!(offsets, vec![(0, 8), (32, 4)]);
        assert_eq!(footprint, 48);
    }

    #[test]
    fn aos_offsets_with_alignment() {
        let table = LayoutTable::new();
        let constraints = LayoutConstraintSet::new(vec![11, 10])
            .with_ordering(FieldOrdering::Aos)
            .with_alignment(10, 8);
        let layout = table
            .find_or_create(&field_space(), &constraints, 1)
            .expect("layout");
        let (offsets, footprint) = layout.field_offsets(3);
        assert_eq!(offsets, vec![(0, 16), (8, 16)]);
        assert_eq!(footprint, 48);
    }

    #[test]
    fn identical_requests_share_description() {
        let table = LayoutTable::new();
        let fs = field_space();
        let constraints = LayoutConstraintSet::new(vec![10, 12]);
        let a = table.find_or_create(&fs, &constraints, 1).expect("layout");
        let b = table.find_or_create(&fs, &constraints, 1).expect("layout");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Arc::strong_count(&a), 3);
        assert_eq!(table.len(), 1);
        let c = table
            .find_or_create(&fs, &constraints.clone().with_ordering(FieldOrdering::Aos), 1)
            .expect("layout");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn copy_offsets_are_cached_by_mask() {
        let table = LayoutTable::new();
        let fs = field_space();
        let layout = table
            .find_or_create(&fs, &LayoutConstraintSet::new(vec![12, 10, 11]), 1)
            .expect("layout");
        let mask = fs.mask_of(&[10, 12]).expect("mask");
        let first = layout.compute_copy_offsets(&mask, 2);
        let second = layout.compute_copy_offsets(&mask, 2);
        assert_eq!(first, second);
        assert_eq!(layout.cached_masks(), 1);
        // field index order, not allocation order
        assert_eq!(vec![10, 12], first.iter().map(|f| f.fid).collect::<Vec<_>>());
        assert_eq!(first[1].offset, 0);
        assert_eq!(first[0].offset, 16);
    }

    #[test]
    fn unknown_field_reports_index() {
        let table = LayoutTable::new();
        let err = table
            .find_or_create(&field_space(), &LayoutConstraintSet::new(vec![10, 99]), 1)
            .expect_err("unknown field");
        assert_eq!(
            err,
            InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Field,
                field_index: Some(1)
            }
        );
    }

    #[test]
    fn reduction_requires_word_sized_fields() {
        let table = LayoutTable::new();
        let constraints =
            LayoutConstraintSet::new(vec![10, 11]).with_reduction(ReductionOpKind::Sum);
        let err = table
            .find_or_create(&field_space(), &constraints, 1)
            .expect_err("4 byte field");
        assert_eq!(
            err,
            InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Specialized,
                field_index: Some(1)
            }
        );
    }

    #[test]
    fn field_queries() {
        let table = LayoutTable::new();
        let layout = table
            .find_or_create(&field_space(), &LayoutConstraintSet::new(vec![10, 12]), 1)
            .expect("layout");
        assert!(layout.has_fields(&[10, 12]));
        assert!(!layout.has_field(11));
        let mut wanted = vec![10, 11, 12];
        layout.remove_space_fields(&mut wanted);
        assert_eq!(wanted, vec![11]);
        assert_eq!(layout.get_total_field_size(), 16);
        assert_eq!(layout.compute_destroyed_fields(), vec![(12, 3)]);
        assert_eq!(layout.find_field_info(10).map(|f| f.size), Some(8));
        assert!(layout.entails(&LayoutConstraintSet::new(vec![12])).is_ok());
        assert_eq!(
            layout.entails(&LayoutConstraintSet::new(vec![11])),
            Err((LayoutConstraintKind::Field, Some(0)))
        );
    }
}
