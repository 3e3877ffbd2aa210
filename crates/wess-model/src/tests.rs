use std::collections::BTreeSet;

use super::*;

fn seg(seg_id: u32, parents: &[u32], p_parent: u32, weight: f64) -> Segment {
    Segment {
        seg_id,
        n_iter: 2,
        weight,
        parent_ids: parents.iter().copied().collect::<BTreeSet<u32>>(),
        p_parent_id: p_parent,
        status: SegmentStatus::Complete,
        endpoint_type: EndpointType::Continued,
        pcoord: Pcoord::new_unfilled(5, 2, &[0.0, 1.0]),
        cputime: 1.0,
        walltime: 1.0,
        data: Default::default(),
    }
}

#[test]
fn rejects_empty_parents() {
    let mut s = seg(0, &[0], 0, 1.0);
    s.parent_ids.clear();
    assert_eq!(
        s.validate(),
        Err(ModelError::EmptyParents { seg_id: 0 })
    );
}

#[test]
fn rejects_primary_parent_not_in_set() {
    let s = seg(0, &[1, 2], 3, 1.0);
    assert_eq!(
        s.validate(),
        Err(ModelError::PrimaryParentNotInSet {
            seg_id: 0,
            p_parent_id: 3
        })
    );
}

#[test]
fn ordered_parents_puts_primary_first_then_sorted_rest() {
    let s = seg(5, &[9, 2, 2, 4], 4, 1.0);
    assert_eq!(s.ordered_parents(), vec![4, 2, 9]);
}

#[test]
fn from_segments_builds_dense_prefix_sum() {
    let segs = vec![
        seg(0, &[0], 0, 0.5),
        seg(1, &[0, 1], 1, 0.25),
        seg(2, &[2], 2, 0.25),
    ];
    let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
    assert_eq!(tables.n_particles(), 3);
    assert_eq!(tables.parents, vec![0, 1, 0, 2]);
    assert_eq!(tables.seg_index[0].parents_offset, 0);
    assert_eq!(tables.seg_index[0].n_parents, 1);
    assert_eq!(tables.seg_index[1].parents_offset, 1);
    assert_eq!(tables.seg_index[1].n_parents, 2);
    assert_eq!(tables.seg_index[2].parents_offset, 3);
    assert_eq!(tables.seg_index[2].n_parents, 1);
    tables.validate(Some(3)).unwrap();
}

#[test]
fn validate_catches_out_of_range_parent() {
    let segs = vec![seg(0, &[7], 7, 1.0)];
    let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
    let err = tables.validate(Some(3)).unwrap_err();
    assert_eq!(
        err,
        ModelError::ParentOutOfRange {
            seg_id: 0,
            parent_id: 7,
            n_particles_prev: 3
        }
    );
}

#[test]
fn to_segments_round_trips_lineage_and_weight() {
    let segs = vec![
        seg(0, &[0], 0, 0.6),
        seg(1, &[0, 2], 0, 0.4),
    ];
    let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
    let back = tables.to_segments();
    assert_eq!(back.len(), 2);
    assert_eq!(back[0].p_parent_id, 0);
    assert_eq!(back[1].parent_ids, BTreeSet::from([0, 2]));
    assert_eq!(back[1].p_parent_id, 0);
    assert!((back[0].weight - 0.6).abs() < 1e-12);
}

#[test]
fn to_segments_by_id_reports_unknown_segment() {
    let segs = vec![seg(0, &[0], 0, 1.0)];
    let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
    let err = tables.to_segments_by_id(&[0, 9]).unwrap_err();
    assert_eq!(
        err,
        ModelError::UnknownSegment {
            n_iter: 2,
            seg_id: 9
        }
    );
}

#[test]
fn apply_updates_overwrites_scalars_and_pcoord_without_touching_lineage() {
    let segs = vec![seg(0, &[0], 0, 1.0), seg(1, &[0], 0, 0.0)];
    let mut tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();

    let mut updated = tables.segment_at(0);
    updated.weight = 0.42;
    updated.status = SegmentStatus::Failed;
    updated.pcoord = Pcoord {
        pcoord_len: 5,
        pcoord_ndim: 2,
        values: vec![9.0; 10],
        filled_rows: 5,
    };

    tables.apply_updates(&[updated]).unwrap();
    let after = tables.segment_at(0);
    assert!((after.weight - 0.42).abs() < 1e-12);
    assert_eq!(after.status, SegmentStatus::Failed);
    assert_eq!(after.pcoord.values, vec![9.0; 10]);
    assert_eq!(after.p_parent_id, 0);
}

#[test]
fn apply_updates_rejects_unknown_seg_id() {
    let segs = vec![seg(0, &[0], 0, 1.0)];
    let mut tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
    let mut bogus = tables.segment_at(0);
    bogus.seg_id = 5;
    let err = tables.apply_updates(&[bogus]).unwrap_err();
    assert_eq!(
        err,
        ModelError::UnknownSegment {
            n_iter: 2,
            seg_id: 5
        }
    );
}

#[test]
fn children_of_primary_filters_on_first_parent_slot_only() {
    // iteration 3 segments: seg 0's primary parent is prev-seg 1; seg 1's
    // primary parent is prev-seg 0, but it also lists prev-seg 1 as a
    // secondary (merge) parent, which must NOT make it a child of 1.
    let segs = vec![
        seg(0, &[1], 1, 0.5),
        seg(1, &[0, 1], 0, 0.5),
    ];
    let tables = IterationTables::from_segments(3, &segs, 2, 5).unwrap();
    let children_of_1 = tables.children_of_primary(1);
    assert_eq!(children_of_1.len(), 1);
    assert_eq!(children_of_1[0].seg_id, 0);
}

#[test]
fn aux_array_first_write_pins_shape_and_dtype() {
    let segs = vec![seg(0, &[0], 0, 1.0), seg(1, &[0], 0, 1.0)];
    let mut tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();

    let mut first = tables.segment_at(0);
    first.data.insert(
        "rmsd".to_string(),
        AuxArray {
            dtype: AuxDtype::F64,
            shape: vec![3],
            bytes: vec![0u8; 24],
        },
    );
    tables.apply_updates(&[first]).unwrap();

    let mut mismatched = tables.segment_at(1);
    mismatched.data.insert(
        "rmsd".to_string(),
        AuxArray {
            dtype: AuxDtype::F64,
            shape: vec![4],
            bytes: vec![0u8; 32],
        },
    );
    let err = tables.apply_updates(&[mismatched]).unwrap_err();
    assert_eq!(
        err,
        ModelError::AuxShapeMismatch {
            name: "rmsd".to_string(),
            n_iter: 2
        }
    );
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// A segment list where every primary parent (and every extra merge
    /// parent) is a valid id in `0..prev_n`.
    fn segments_strategy(prev_n: u32) -> impl Strategy<Value = Vec<Segment>> {
        let prev_n = prev_n.max(1);
        proptest::collection::vec(
            (0..prev_n, proptest::collection::btree_set(0..prev_n, 0..4usize)),
            1..12,
        )
        .prop_map(move |rows| {
            rows.into_iter()
                .enumerate()
                .map(|(seg_id, (p_parent, mut extras))| {
                    extras.insert(p_parent);
                    seg(seg_id as u32, &extras.into_iter().collect::<Vec<_>>(), p_parent, 1.0)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn lineage_round_trips_through_tables(
            segs in (1u32..8).prop_flat_map(segments_strategy),
        ) {
            let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
            let prev_n = segs
                .iter()
                .flat_map(|s| s.parent_ids.iter().copied())
                .max()
                .unwrap_or(0)
                + 1;
            tables.validate(Some(prev_n)).unwrap();

            let back = tables.to_segments();
            prop_assert_eq!(back.len(), segs.len());
            for (original, round_tripped) in segs.iter().zip(back.iter()) {
                prop_assert_eq!(&original.parent_ids, &round_tripped.parent_ids);
                prop_assert_eq!(original.p_parent_id, round_tripped.p_parent_id);
            }
        }

        #[test]
        fn prefix_sum_offsets_match_cumulative_parent_counts(
            segs in (1u32..8).prop_flat_map(segments_strategy),
        ) {
            let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
            let mut expected = 0u32;
            for entry in &tables.seg_index {
                prop_assert_eq!(entry.parents_offset, expected);
                expected += entry.n_parents;
            }
            prop_assert_eq!(expected as usize, tables.parents.len());
        }

        #[test]
        fn seg_ids_are_dense_and_in_input_order(
            segs in (1u32..8).prop_flat_map(segments_strategy),
        ) {
            let tables = IterationTables::from_segments(2, &segs, 2, 5).unwrap();
            let back = tables.to_segments();
            for (i, s) in back.iter().enumerate() {
                prop_assert_eq!(s.seg_id, i as u32);
            }
        }
    }
}

#[test]
fn summary_row_incomplete_computes_norm_and_dynamic_range() {
    let segs = vec![seg(0, &[0], 0, 0.75), seg(1, &[0], 0, 0.25)];
    let row = SummaryRow::incomplete(4, &segs);
    assert_eq!(row.n_iter, 4);
    assert_eq!(row.n_particles, 2);
    assert!((row.norm - 1.0).abs() < 1e-12);
    assert!((row.seg_dynamic_range - 3.0).abs() < 1e-12);
    assert_eq!(row.status, IterationStatus::Incomplete);
}
