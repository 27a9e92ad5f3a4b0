use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Offset array must have {expected} entries (particles + 1), found {found}")]
    OffsetLength { expected: usize, found: usize },

    #[error("Offsets must be non-decreasing (offset {index} is smaller than its predecessor)")]
    NonMonotonicOffsets { index: usize },

    #[error("Last offset ({last}) does not match the neighbor count ({count})")]
    OffsetCountMismatch { last: usize, count: usize },

    #[error("Neighbor index {index} is out of range for {particles} particles")]
    NeighborOutOfRange { index: usize, particles: usize },

    #[error("Bond ({0}, {1}) references a particle outside the set")]
    BondOutOfRange(usize, usize),

    #[error("Pair ({0}, {1}) appears in both the 1-2 and 1-3 lists")]
    OverlappingPair(usize, usize),

    #[error("1-2 list covers {one_two} particles but 1-3 list covers {one_three}")]
    ParticleCountMismatch { one_two: usize, one_three: usize },

    #[error("Topology covers {topology} particles but the particle set has {particles}")]
    ParticleSetMismatch { topology: usize, particles: usize },
}

/// Scale factors applied to induced-dipole interactions between bonded sites.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExclusionScale {
    pub p12: f64,
    pub p13: f64,
}

impl ExclusionScale {
    /// No scaling: every pair interacts with full strength.
    pub const NONE: Self = Self { p12: 1.0, p13: 1.0 };

    pub fn new(p12: f64, p13: f64) -> Self {
        Self { p12, p13 }
    }
}

impl Default for ExclusionScale {
    fn default() -> Self {
        Self::NONE
    }
}

/// Per-particle neighbor lists in compressed-row form.
///
/// Neighbors of particle `i` are `neighbors[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborList {
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
}

impl NeighborList {
    /// Validates and wraps a flattened neighbor list.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] if the offset array has the wrong length, is not
    /// monotonic, disagrees with the neighbor count, or if a neighbor index is not
    /// a valid particle index.
    pub fn new(
        particle_count: usize,
        offsets: Vec<usize>,
        neighbors: Vec<usize>,
    ) -> Result<Self, TopologyError> {
        if offsets.len() != particle_count + 1 {
            return Err(TopologyError::OffsetLength {
                expected: particle_count + 1,
                found: offsets.len(),
            });
        }
        if let Some(index) = offsets.windows(2).position(|w| w[1] < w[0]) {
            return Err(TopologyError::NonMonotonicOffsets { index: index + 1 });
        }
        let last = offsets[particle_count];
        if last != neighbors.len() {
            return Err(TopologyError::OffsetCountMismatch {
                last,
                count: neighbors.len(),
            });
        }
        if let Some(&index) = neighbors.iter().find(|&&j| j >= particle_count) {
            return Err(TopologyError::NeighborOutOfRange {
                index,
                particles: particle_count,
            });
        }
        Ok(Self { offsets, neighbors })
    }

    pub fn empty(particle_count: usize) -> Self {
        Self {
            offsets: vec![0; particle_count + 1],
            neighbors: Vec::new(),
        }
    }

    fn from_rows(rows: &[BTreeSet<usize>]) -> Self {
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut neighbors = Vec::new();
        offsets.push(0);
        for row in rows {
            neighbors.extend(row.iter().copied());
            offsets.push(neighbors.len());
        }
        Self { offsets, neighbors }
    }

    #[inline]
    pub fn particle_count(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.neighbors[self.offsets[i]..self.offsets[i + 1]]
    }

    #[inline]
    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.neighbors(i).contains(&j)
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn flat_neighbors(&self) -> &[usize] {
        &self.neighbors
    }
}

/// 1-2 and 1-3 connectivity of a body's particles.
///
/// Used only to scale the Thole-damped induced-dipole interactions of bonded
/// sites; permanent multipoles are excluded by polar group instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionTopology {
    one_two: NeighborList,
    one_three: NeighborList,
}

impl ExclusionTopology {
    pub fn new(one_two: NeighborList, one_three: NeighborList) -> Result<Self, TopologyError> {
        if one_two.particle_count() != one_three.particle_count() {
            return Err(TopologyError::ParticleCountMismatch {
                one_two: one_two.particle_count(),
                one_three: one_three.particle_count(),
            });
        }
        for i in 0..one_two.particle_count() {
            if let Some(&j) = one_two.neighbors(i).iter().find(|&&j| one_three.contains(i, j)) {
                return Err(TopologyError::OverlappingPair(i, j));
            }
        }
        Ok(Self { one_two, one_three })
    }

    /// A topology with no bonded pairs.
    pub fn empty(particle_count: usize) -> Self {
        Self {
            one_two: NeighborList::empty(particle_count),
            one_three: NeighborList::empty(particle_count),
        }
    }

    /// Derives both neighbor lists from an undirected bond list.
    ///
    /// Two particles are 1-3 neighbors when they share a bonded partner and are
    /// not themselves bonded.
    pub fn from_bonds(particle_count: usize, bonds: &[(usize, usize)]) -> Result<Self, TopologyError> {
        let mut one_two = vec![BTreeSet::new(); particle_count];
        for &(a, b) in bonds {
            if a >= particle_count || b >= particle_count {
                return Err(TopologyError::BondOutOfRange(a, b));
            }
            if a != b {
                one_two[a].insert(b);
                one_two[b].insert(a);
            }
        }

        let mut one_three = vec![BTreeSet::new(); particle_count];
        for partners in &one_two {
            for &a in partners {
                for &b in partners {
                    if a != b && !one_two[a].contains(&b) {
                        one_three[a].insert(b);
                    }
                }
            }
        }

        Ok(Self {
            one_two: NeighborList::from_rows(&one_two),
            one_three: NeighborList::from_rows(&one_three),
        })
    }

    #[inline]
    pub fn particle_count(&self) -> usize {
        self.one_two.particle_count()
    }

    pub fn one_two(&self) -> &NeighborList {
        &self.one_two
    }

    pub fn one_three(&self) -> &NeighborList {
        &self.one_three
    }

    /// Scale applied to the interaction of `i` with the induced dipole of `j`.
    ///
    /// 1-3 membership takes precedence over 1-2.
    #[inline]
    pub fn pair_scale(&self, i: usize, j: usize, scale: ExclusionScale) -> f64 {
        if self.one_three.contains(i, j) {
            scale.p13
        } else if self.one_two.contains(i, j) {
            scale.p12
        } else {
            1.0
        }
    }
}
