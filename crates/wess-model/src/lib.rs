//! The entity definitions and invariants shared by the archive (`wess-archive`),
//! the dispatch fabric (`wess-dispatch`), and the work-manager facade
//! (`wess-workmanager`): a `Segment` of trajectory, the columnar `IterationTables`
//! an iteration is stored and transmitted as, and the run-level `SummaryRow`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("segment {seg_id}: parent_ids must be non-empty")]
    EmptyParents { seg_id: u32 },
    #[error("segment {seg_id}: p_parent_id {p_parent_id} is not in parent_ids")]
    PrimaryParentNotInSet { seg_id: u32, p_parent_id: u32 },
    #[error("segment {seg_id}: pcoord has ndim {got_ndim}, expected {expected_ndim}")]
    PcoordNdimMismatch {
        seg_id: u32,
        got_ndim: usize,
        expected_ndim: usize,
    },
    #[error("segment {seg_id}: parent {parent_id} out of range [0, {n_particles_prev})")]
    ParentOutOfRange {
        seg_id: u32,
        parent_id: u32,
        n_particles_prev: u32,
    },
    #[error("segment {seg_id}: parents_offset {got} does not match cumulative parent count {expected}")]
    OffsetMismatch {
        seg_id: u32,
        got: u32,
        expected: u32,
    },
    #[error("auxiliary field '{name}': shape/dtype mismatch within iteration {n_iter}")]
    AuxShapeMismatch { name: String, n_iter: u32 },
    #[error("segment {seg_id} not present in iteration {n_iter}")]
    UnknownSegment { n_iter: u32, seg_id: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Prepared,
    Running,
    Complete,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EndpointType {
    Unset,
    Continued,
    Recycled,
    Merged,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PcoordDtype {
    F32,
    F64,
}

/// The progress-coordinate time series for one segment: `pcoord_len` rows of
/// `pcoord_ndim` columns, row-major. `filled_rows` tracks how many leading rows
/// are meaningful — an incoming unfilled segment carries only row 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pcoord {
    pub pcoord_len: usize,
    pub pcoord_ndim: usize,
    pub values: Vec<f64>,
    pub filled_rows: usize,
}

impl Pcoord {
    pub fn new_unfilled(pcoord_len: usize, pcoord_ndim: usize, row0: &[f64]) -> Self {
        assert_eq!(row0.len(), pcoord_ndim, "row0 must have pcoord_ndim columns");
        let mut values = vec![0.0; pcoord_len * pcoord_ndim];
        values[0..pcoord_ndim].copy_from_slice(row0);
        Pcoord {
            pcoord_len,
            pcoord_ndim,
            values,
            filled_rows: 1,
        }
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.pcoord_ndim..(i + 1) * self.pcoord_ndim]
    }

    pub fn is_fully_propagated(&self) -> bool {
        self.filled_rows >= self.pcoord_len
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AuxDtype {
    F64,
    I64,
    U8,
}

/// A fixed-shape auxiliary array for a single segment. `shape` is the per-segment
/// field shape (the archive prepends the particle dimension when storing the
/// whole iteration).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxArray {
    pub dtype: AuxDtype,
    pub shape: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl AuxArray {
    fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    fn dtype_matches(&self, other: &AuxArray) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }
}

/// One unit of weighted-ensemble trajectory, detached from the archive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub seg_id: u32,
    pub n_iter: u32,
    pub weight: f64,
    pub parent_ids: BTreeSet<u32>,
    pub p_parent_id: u32,
    pub status: SegmentStatus,
    pub endpoint_type: EndpointType,
    pub pcoord: Pcoord,
    pub cputime: f64,
    pub walltime: f64,
    pub data: BTreeMap<String, AuxArray>,
}

impl Segment {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.parent_ids.is_empty() {
            return Err(ModelError::EmptyParents {
                seg_id: self.seg_id,
            });
        }
        if !self.parent_ids.contains(&self.p_parent_id) {
            return Err(ModelError::PrimaryParentNotInSet {
                seg_id: self.seg_id,
                p_parent_id: self.p_parent_id,
            });
        }
        Ok(())
    }

    /// The parents of this segment in on-disk slice order: primary parent first,
    /// then the rest in ascending order.
    pub fn ordered_parents(&self) -> Vec<u32> {
        let mut rest: Vec<u32> = self
            .parent_ids
            .iter()
            .copied()
            .filter(|id| *id != self.p_parent_id)
            .collect();
        rest.sort_unstable();
        let mut out = Vec::with_capacity(self.parent_ids.len());
        out.push(self.p_parent_id);
        out.extend(rest);
        out
    }
}

/// One row of the dense, prefix-summed `seg_index` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegIndexEntry {
    pub weight: f64,
    pub cputime: f64,
    pub walltime: f64,
    pub parents_offset: u32,
    pub n_parents: u32,
    pub status: SegmentStatus,
    pub endpoint_type: EndpointType,
    /// How many leading rows of this segment's `pcoord` are meaningful.
    /// Tracked explicitly rather than inferred from zero/non-zero values, since
    /// a legitimately-zero coordinate row would otherwise look unfilled.
    pub filled_rows: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxTable {
    pub dtype: AuxDtype,
    /// Per-segment field shape (excludes the leading particle dimension).
    pub field_shape: Vec<usize>,
    /// n_particles concatenated element blocks, each `field_shape` long.
    pub bytes: Vec<u8>,
}

/// The columnar, on-disk-shaped representation of a single iteration: what the
/// archive actually stores, and what `GetSegments`/`UpdateSegments` stitch to
/// and from `Segment` records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationTables {
    pub n_iter: u32,
    pub seg_index: Vec<SegIndexEntry>,
    /// Flat, concatenated parent ids; see `SegIndexEntry::parents_offset`.
    pub parents: Vec<u32>,
    pub pcoord_ndim: usize,
    pub pcoord_len: usize,
    /// n_particles * pcoord_len * pcoord_ndim, row-major.
    pub pcoord: Vec<f64>,
    pub n_bins: usize,
    /// n_particles * pcoord_len.
    pub bin_assignments: Vec<u32>,
    /// pcoord_len * n_bins.
    pub bin_populations: Vec<f64>,
    /// n_bins * n_bins.
    pub bin_ntrans: Vec<u64>,
    /// n_bins * n_bins.
    pub bin_fluxes: Vec<f64>,
    /// n_bins * n_bins.
    pub bin_rates: Vec<f64>,
    pub recycling: Vec<(u32, f64)>,
    pub aux: BTreeMap<String, AuxTable>,
}

impl IterationTables {
    pub fn n_particles(&self) -> usize {
        self.seg_index.len()
    }

    /// Builds the columnar tables for a freshly-prepared iteration from its
    /// segment list, assigning dense seg_ids in input order. Mirrors
    /// `Archive::PrepareIteration` (spec.md §4.1).
    pub fn from_segments(
        n_iter: u32,
        segments: &[Segment],
        pcoord_ndim: usize,
        pcoord_len: usize,
    ) -> Result<IterationTables, ModelError> {
        let mut seg_index = Vec::with_capacity(segments.len());
        let mut parents = Vec::new();
        let mut pcoord = vec![0.0; segments.len() * pcoord_len * pcoord_ndim];

        for (seg_id, seg) in segments.iter().enumerate() {
            seg.validate()?;
            if seg.pcoord.pcoord_ndim != pcoord_ndim {
                return Err(ModelError::PcoordNdimMismatch {
                    seg_id: seg_id as u32,
                    got_ndim: seg.pcoord.pcoord_ndim,
                    expected_ndim: pcoord_ndim,
                });
            }
            let ordered = seg.ordered_parents();
            let offset = parents.len() as u32;
            parents.extend(ordered.iter().copied());

            let row0 = seg.pcoord.row(0);
            let base = seg_id * pcoord_len * pcoord_ndim;
            pcoord[base..base + pcoord_ndim].copy_from_slice(row0);

            seg_index.push(SegIndexEntry {
                weight: seg.weight,
                cputime: seg.cputime,
                walltime: seg.walltime,
                parents_offset: offset,
                n_parents: ordered.len() as u32,
                status: seg.status,
                endpoint_type: seg.endpoint_type,
                filled_rows: seg.pcoord.filled_rows as u32,
            });
        }

        Ok(IterationTables {
            n_iter,
            seg_index,
            parents,
            pcoord_ndim,
            pcoord_len,
            pcoord,
            n_bins: 0,
            bin_assignments: Vec::new(),
            bin_populations: Vec::new(),
            bin_ntrans: Vec::new(),
            bin_fluxes: Vec::new(),
            bin_rates: Vec::new(),
            recycling: Vec::new(),
            aux: BTreeMap::new(),
        })
    }

    /// Validates the invariants of spec.md §3: prefix-sum offsets, primary
    /// parent in first slot position, and (when `prev_n_particles` is known)
    /// in-range parent ids.
    pub fn validate(&self, prev_n_particles: Option<u32>) -> Result<(), ModelError> {
        let mut expected_offset = 0u32;
        for (seg_id, entry) in self.seg_index.iter().enumerate() {
            if entry.parents_offset != expected_offset {
                return Err(ModelError::OffsetMismatch {
                    seg_id: seg_id as u32,
                    got: entry.parents_offset,
                    expected: expected_offset,
                });
            }
            if let Some(prev) = prev_n_particles {
                let slice =
                    &self.parents[entry.parents_offset as usize
                        ..(entry.parents_offset + entry.n_parents) as usize];
                for &parent_id in slice {
                    if parent_id >= prev {
                        return Err(ModelError::ParentOutOfRange {
                            seg_id: seg_id as u32,
                            parent_id,
                            n_particles_prev: prev,
                        });
                    }
                }
            }
            expected_offset += entry.n_parents;
        }
        if expected_offset as usize != self.parents.len() {
            return Err(ModelError::OffsetMismatch {
                seg_id: self.seg_index.len() as u32,
                got: self.parents.len() as u32,
                expected: expected_offset,
            });
        }
        Ok(())
    }

    fn parents_of(&self, seg_id: u32) -> &[u32] {
        let entry = &self.seg_index[seg_id as usize];
        &self.parents[entry.parents_offset as usize
            ..(entry.parents_offset + entry.n_parents) as usize]
    }

    fn segment_at(&self, seg_id: u32) -> Segment {
        let entry = &self.seg_index[seg_id as usize];
        let ordered = self.parents_of(seg_id);
        let parent_ids: BTreeSet<u32> = ordered.iter().copied().collect();
        let p_parent_id = ordered[0];

        let base = seg_id as usize * self.pcoord_len * self.pcoord_ndim;
        let values = self.pcoord[base..base + self.pcoord_len * self.pcoord_ndim].to_vec();
        let filled_rows = entry.filled_rows as usize;

        let mut data = BTreeMap::new();
        for (name, table) in &self.aux {
            let elem_len: usize = table.field_shape.iter().product();
            let dtype_bytes = match table.dtype {
                AuxDtype::F64 => 8,
                AuxDtype::I64 => 8,
                AuxDtype::U8 => 1,
            };
            let stride = elem_len * dtype_bytes;
            let start = seg_id as usize * stride;
            data.insert(
                name.clone(),
                AuxArray {
                    dtype: table.dtype,
                    shape: table.field_shape.clone(),
                    bytes: table.bytes[start..start + stride].to_vec(),
                },
            );
        }

        Segment {
            seg_id,
            n_iter: self.n_iter,
            weight: entry.weight,
            parent_ids,
            p_parent_id,
            status: entry.status,
            endpoint_type: entry.endpoint_type,
            pcoord: Pcoord {
                pcoord_len: self.pcoord_len,
                pcoord_ndim: self.pcoord_ndim,
                values,
                filled_rows,
            },
            cputime: entry.cputime,
            walltime: entry.walltime,
            data,
        }
    }

    /// `GetSegments`: every segment of this iteration, reconstructed.
    pub fn to_segments(&self) -> Vec<Segment> {
        (0..self.seg_index.len() as u32)
            .map(|id| self.segment_at(id))
            .collect()
    }

    /// `GetSegmentsByID`: a subset, in the order requested.
    pub fn to_segments_by_id(&self, ids: &[u32]) -> Result<Vec<Segment>, ModelError> {
        ids.iter()
            .map(|&id| {
                if (id as usize) < self.seg_index.len() {
                    Ok(self.segment_at(id))
                } else {
                    Err(ModelError::UnknownSegment {
                        n_iter: self.n_iter,
                        seg_id: id,
                    })
                }
            })
            .collect()
    }

    /// `UpdateSegments`: overwrite weight/cputime/walltime/status/endpoint_type,
    /// full pcoord, and aux fields, by seg_id. Never touches seg_id or lineage.
    pub fn apply_updates(&mut self, updates: &[Segment]) -> Result<(), ModelError> {
        for seg in updates {
            if seg.seg_id as usize >= self.seg_index.len() {
                return Err(ModelError::UnknownSegment {
                    n_iter: self.n_iter,
                    seg_id: seg.seg_id,
                });
            }
            if seg.pcoord.pcoord_ndim != self.pcoord_ndim || seg.pcoord.pcoord_len != self.pcoord_len
            {
                return Err(ModelError::PcoordNdimMismatch {
                    seg_id: seg.seg_id,
                    got_ndim: seg.pcoord.pcoord_ndim,
                    expected_ndim: self.pcoord_ndim,
                });
            }

            let entry = &mut self.seg_index[seg.seg_id as usize];
            entry.weight = seg.weight;
            entry.cputime = seg.cputime;
            entry.walltime = seg.walltime;
            entry.status = seg.status;
            entry.endpoint_type = seg.endpoint_type;
            entry.filled_rows = seg.pcoord.filled_rows as u32;

            let base = seg.seg_id as usize * self.pcoord_len * self.pcoord_ndim;
            self.pcoord[base..base + self.pcoord_len * self.pcoord_ndim]
                .copy_from_slice(&seg.pcoord.values);

            for (name, array) in &seg.data {
                self.write_aux_one(name, seg.seg_id, array)?;
            }
        }
        Ok(())
    }

    fn write_aux_one(&mut self, name: &str, seg_id: u32, array: &AuxArray) -> Result<(), ModelError> {
        let n_particles = self.n_particles();
        let dtype_bytes = match array.dtype {
            AuxDtype::F64 => 8,
            AuxDtype::I64 => 8,
            AuxDtype::U8 => 1,
        };
        let elem_len: usize = array.shape.iter().product();
        let stride = elem_len * dtype_bytes;

        let table = self.aux.entry(name.to_string()).or_insert_with(|| AuxTable {
            dtype: array.dtype,
            field_shape: array.shape.clone(),
            bytes: vec![0u8; n_particles * stride],
        });

        let existing = AuxArray {
            dtype: table.dtype,
            shape: table.field_shape.clone(),
            bytes: Vec::new(),
        };
        if !existing.dtype_matches(array) {
            return Err(ModelError::AuxShapeMismatch {
                name: name.to_string(),
                n_iter: self.n_iter,
            });
        }
        if array.element_count() != elem_len {
            return Err(ModelError::AuxShapeMismatch {
                name: name.to_string(),
                n_iter: self.n_iter,
            });
        }

        let start = seg_id as usize * stride;
        table.bytes[start..start + stride].copy_from_slice(&array.bytes);
        Ok(())
    }

    /// `GetChildren`: segments of the *next* iteration whose primary parent is
    /// `parent_seg_id`. `self` must be the tables for that next iteration.
    pub fn children_of_primary(&self, parent_seg_id: u32) -> Vec<Segment> {
        (0..self.seg_index.len() as u32)
            .filter(|&id| self.parents_of(id)[0] == parent_seg_id)
            .map(|id| self.segment_at(id))
            .collect()
    }
}

/// One row of the resizable run summary table, densely indexed by `n_iter - 1`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum IterationStatus {
    Incomplete,
    Complete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub n_iter: u32,
    pub n_particles: u32,
    pub norm: f64,
    pub target_flux: f64,
    pub target_hits: u64,
    pub min_bin_prob: f64,
    pub max_bin_prob: f64,
    pub bin_dynamic_range: f64,
    pub min_seg_prob: f64,
    pub max_seg_prob: f64,
    pub seg_dynamic_range: f64,
    pub cputime: f64,
    pub walltime: f64,
    pub status: IterationStatus,
}

impl SummaryRow {
    pub fn incomplete(n_iter: u32, segments: &[Segment]) -> SummaryRow {
        let norm: f64 = segments.iter().map(|s| s.weight).sum();
        let min_seg_prob = segments
            .iter()
            .map(|s| s.weight)
            .fold(f64::INFINITY, f64::min);
        let max_seg_prob = segments
            .iter()
            .map(|s| s.weight)
            .fold(f64::NEG_INFINITY, f64::max);
        SummaryRow {
            n_iter,
            n_particles: segments.len() as u32,
            norm,
            target_flux: 0.0,
            target_hits: 0,
            min_bin_prob: 0.0,
            max_bin_prob: 0.0,
            bin_dynamic_range: 0.0,
            min_seg_prob: if min_seg_prob.is_finite() { min_seg_prob } else { 0.0 },
            max_seg_prob: if max_seg_prob.is_finite() { max_seg_prob } else { 0.0 },
            seg_dynamic_range: if min_seg_prob > 0.0 {
                max_seg_prob / min_seg_prob
            } else {
                0.0
            },
            cputime: 0.0,
            walltime: 0.0,
            status: IterationStatus::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests;
