use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// An error that occurs when tree arithmetic names a node outside of the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotMemberError {
    pub node: usize,
    pub mapping_size: usize,
}

type MappingResult<T> = Result<T, NotMemberError>;

impl std::fmt::Display for NotMemberError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid Id => node:{} is not a member of a mapping over {} nodes",
            self.node, self.mapping_size
        )
    }
}

impl std::error::Error for NotMemberError {}

/// An immutable sorted set of nodes plus a radix, used to derive broadcast and reduction trees
/// over an arbitrary subset of nodes.
///
/// Trees are rooted at any member `origin`: members are re-indexed so that `origin` has offset 0 and
/// the node at offset `o` has children at offsets `o * radix + 1 ..= o * radix + radix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveMapping {
    unique_sorted_spaces: Vec<usize>,
    radix: usize,
}

impl CollectiveMapping {
    /// # Panics
    ///
    /// if `spaces` is empty or `radix` is less than 2
    pub fn new(spaces: impl IntoIterator<Item = usize>, radix: usize) -> CollectiveMapping {
        let unique_sorted_spaces: Vec<usize> = spaces.into_iter().sorted().dedup().collect();
        assert!(
            !unique_sorted_spaces.is_empty(),
            "collective mapping needs at least one node"
        );
        assert!(radix >= 2, "collective mapping radix must be at least 2");
        CollectiveMapping {
            unique_sorted_spaces,
            radix,
        }
    }

    /// Builds a mapping from a shard-to-node table; shards sharing a node collapse into one member
    pub fn from_shard_mapping(shard_to_node: &[usize], radix: usize) -> CollectiveMapping {
        CollectiveMapping::new(shard_to_node.iter().copied(), radix)
    }

    pub fn size(&self) -> usize {
        self.unique_sorted_spaces.len()
    }

    pub fn radix(&self) -> usize {
        self.radix
    }

    pub fn get_origin(&self) -> usize {
        self.unique_sorted_spaces[0]
    }

    pub fn spaces(&self) -> &[usize] {
        &self.unique_sorted_spaces
    }

    pub fn contains(&self, space: usize) -> bool {
        self.unique_sorted_spaces.binary_search(&space).is_ok()
    }

    /// true if every member of `other` is a member of this mapping
    pub fn contains_mapping(&self, other: &CollectiveMapping) -> bool {
        other.unique_sorted_spaces.iter().all(|s| self.contains(*s))
    }

    pub fn find_index(&self, space: usize) -> Option<usize> {
        self.unique_sorted_spaces.binary_search(&space).ok()
    }

    fn index_of(&self, space: usize) -> MappingResult<usize> {
        self.find_index(space).ok_or(NotMemberError {
            node: space,
            mapping_size: self.size(),
        })
    }

    fn convert_to_offset(&self, index: usize, origin_index: usize) -> usize {
        (index + self.size() - origin_index) % self.size()
    }

    fn convert_to_index(&self, offset: usize, origin_index: usize) -> usize {
        (offset + origin_index) % self.size()
    }

    /// The node `local` receives from when broadcasting out of `origin`. The origin is its own parent.
    pub fn get_parent(&self, origin: usize, local: usize) -> MappingResult<usize> {
        let origin_index = self.index_of(origin)?;
        let offset = self.convert_to_offset(self.index_of(local)?, origin_index);
        if offset == 0 {
            return Ok(origin);
        }
        let parent_offset = (offset - 1) / self.radix;
        Ok(self.unique_sorted_spaces[self.convert_to_index(parent_offset, origin_index)])
    }

    pub fn get_children(
        &self,
        origin: usize,
        local: usize,
        children: &mut Vec<usize>,
    ) -> MappingResult<()> {
        let origin_index = self.index_of(origin)?;
        let offset = self.convert_to_offset(self.index_of(local)?, origin_index);
        let start = offset * self.radix + 1;
        for child_offset in start..(start + self.radix).min(self.size()) {
            children.push(self.unique_sorted_spaces[self.convert_to_index(child_offset, origin_index)]);
        }
        Ok(())
    }

    pub fn count_children(&self, origin: usize, local: usize) -> MappingResult<usize> {
        let origin_index = self.index_of(origin)?;
        let offset = self.convert_to_offset(self.index_of(local)?, origin_index);
        let start = offset * self.radix + 1;
        Ok((start + self.radix).min(self.size()).saturating_sub(start))
    }

    /// The member numerically closest to `start`, ties broken toward the lower id
    pub fn find_nearest(&self, start: usize) -> usize {
        match self.unique_sorted_spaces.binary_search(&start) {
            Ok(_) => start,
            Err(idx) => {
                if idx == 0 {
                    self.unique_sorted_spaces[0]
                } else if idx == self.size() {
                    self.unique_sorted_spaces[idx - 1]
                } else {
                    let below = self.unique_sorted_spaces[idx - 1];
                    let above = self.unique_sorted_spaces[idx];
                    if start - below <= above - start {
                        below
                    } else {
                        above
                    }
                }
            }
        }
    }

    /// A copy of this mapping that also contains `space`
    pub fn clone_with(&self, space: usize) -> CollectiveMapping {
        CollectiveMapping::new(
            self.unique_sorted_spaces.iter().copied().chain(std::iter::once(space)),
            self.radix,
        )
    }
}

impl std::ops::Index<usize> for CollectiveMapping {
    type Output = usize;

    fn index(&self, idx: usize) -> &usize {
        &self.unique_sorted_spaces[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceil_log(size: usize, radix: usize) -> usize {
        let mut steps = 0;
        let mut reach = 1;
        while reach < size {
            reach *= radix;
            steps += 1;
        }
        steps
    }

    #[test]
    fn single_node() {
        let mapping = CollectiveMapping::new(vec![5], 2);
        assert_eq!(mapping.size(), 1);
        assert_eq!(mapping.get_origin(), 5);
        let mut children = vec![];
        mapping.get_children(5, 5, &mut children).expect("member");
        assert!(children.is_empty());
        assert_eq!(mapping.get_parent(5, 5), Ok(5));
    }

    #[test]
    fn sorted_and_deduped() {
        let mapping = CollectiveMapping::from_shard_mapping(&[7, 3, 3, 9, 7], 2);
        assert_eq!(mapping.spaces(), &[3, 7, 9]);
        assert_eq!(mapping[1], 7);
        assert_eq!(mapping.find_index(9), Some(2));
        assert_eq!(mapping.find_index(4), None);
    }

    #[test]
    fn tree_from_origin() {
        let mapping = CollectiveMapping::new(0..7, 2);
        let mut children = vec![];
        mapping.get_children(0, 0, &mut children).expect("member");
        assert_eq!(children, vec![1, 2]);
        children.clear();
        mapping.get_children(0, 2, &mut children).expect("member");
        assert_eq!(children, vec![5, 6]);
        assert_eq!(mapping.get_parent(0, 6), Ok(2));
        // rooted at 3 the offsets rotate
        children.clear();
        mapping.get_children(3, 3, &mut children).expect("member");
        assert_eq!(children, vec![4, 5]);
        assert_eq!(mapping.get_parent(3, 0), Ok(4));
        assert_eq!(mapping.count_children(3, 4), Ok(2));
        assert_eq!(mapping.count_children(3, 0), Ok(0));
    }

    #[test]
    fn non_member_fails() {
        let mapping = CollectiveMapping::new(vec![0, 2, 4], 2);
        assert_eq!(
            mapping.get_parent(0, 3),
            Err(NotMemberError {
                node: 3,
                mapping_size: 3
            })
        );
        let mut children = vec![];
        assert!(mapping.get_children(1, 0, &mut children).is_err());
    }

    #[test]
    fn nearest_breaks_ties_low() {
        let mapping = CollectiveMapping::new(vec![2, 6, 10], 2);
        assert_eq!(mapping.find_nearest(4), 2);
        assert_eq!(mapping.find_nearest(5), 6);
        assert_eq!(mapping.find_nearest(0), 2);
        assert_eq!(mapping.find_nearest(42), 10);
        assert_eq!(mapping.find_nearest(6), 6);
    }

    #[test]
    fn clone_with_adds_member() {
        let mapping = CollectiveMapping::new(vec![1, 5], 3);
        let bigger = mapping.clone_with(3);
        assert_eq!(bigger.spaces(), &[1, 3, 5]);
        assert!(bigger.contains_mapping(&mapping));
        assert!(!mapping.contains_mapping(&bigger));
        assert_eq!(bigger.radix(), 3);
    }

    macro_rules! tree_property_test {
        ($size:expr, $radix:expr) => {
            paste::paste! {
                #[test]
                fn [<parent_child_consistency_ $size _ $radix>]() {
                    let mapping = CollectiveMapping::new((0..$size).map(|n| n * 3 + 1), $radix);
                    for origin in mapping.spaces().to_vec() {
                        for member in mapping.spaces().to_vec() {
                            let mut node = member;
                            let mut steps = 0;
                            while node != origin {
                                node = mapping.get_parent(origin, node).expect("member");
                                steps += 1;
                                assert!(steps <= ceil_log($size, $radix));
                            }
                            if member != origin {
                                let parent = mapping.get_parent(origin, member).expect("member");
                                let mut children = vec![];
                                mapping.get_children(origin, parent, &mut children).expect("member");
                                assert!(children.contains(&member));
                            }
                            let mut children = vec![];
                            mapping.get_children(origin, member, &mut children).expect("member");
                            assert_eq!(children.len(), mapping.count_children(origin, member).expect("member"));
                            for child in children {
                                assert_eq!(mapping.get_parent(origin, child), Ok(member));
                            }
                        }
                    }
                }
            }
        };
    }

    tree_property_test!(1, 2);
    tree_property_test!(2, 2);
    tree_property_test!(5, 2);
    tree_property_test!(9, 3);
    tree_property_test!(16, 4);
    tree_property_test!(17, 4);
}
