use std::collections::BTreeSet;

use wess_model::{EndpointType, Pcoord, SegmentStatus};

use super::*;

fn seg(seg_id: u32, n_iter: u32, parents: &[u32], p_parent: u32, weight: f64) -> Segment {
    Segment {
        seg_id,
        n_iter,
        weight,
        parent_ids: parents.iter().copied().collect::<BTreeSet<u32>>(),
        p_parent_id: p_parent,
        status: SegmentStatus::Complete,
        endpoint_type: EndpointType::Continued,
        pcoord: Pcoord::new_unfilled(3, 2, &[0.0, 0.0]),
        cputime: 0.1,
        walltime: 0.1,
        data: Default::default(),
    }
}

fn open_test_archive() -> (tempfile::TempDir, Archive) {
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::open(dir.path()).unwrap();
    archive.prepare(2, 3, 0).unwrap();
    (dir, archive)
}

#[test]
fn prepare_and_current_iteration_round_trip() {
    let (_dir, archive) = open_test_archive();
    assert_eq!(archive.current_iteration().unwrap(), 1);
    archive.set_current_iteration(5).unwrap();
    assert_eq!(archive.current_iteration().unwrap(), 5);
}

#[test]
fn prepare_iteration_then_get_segments_round_trips() {
    let (_dir, archive) = open_test_archive();
    let segs = vec![seg(0, 1, &[0], 0, 1.0)];
    archive.prepare_iteration(1, &segs).unwrap();

    let back = archive.get_segments(1).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].p_parent_id, 0);

    let summary = archive.get_iter_summary(1).unwrap();
    assert_eq!(summary.n_particles, 1);
    assert_eq!(summary.status, wess_model::IterationStatus::Incomplete);
}

#[test]
fn prepare_iteration_validates_parent_range_against_previous_iteration() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();

    let bad = vec![seg(0, 2, &[4], 4, 1.0)];
    let err = archive.prepare_iteration(2, &bad).unwrap_err();
    assert!(matches!(err, Error::Model(_)));
}

#[test]
fn get_segments_by_id_unknown_id_errors() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    let err = archive.get_segments_by_id(1, &[0, 42]).unwrap_err();
    assert!(matches!(err, Error::Model(_)));
}

#[test]
fn get_segments_missing_iteration_is_not_found() {
    let (_dir, archive) = open_test_archive();
    let err = archive.get_segments(7).unwrap_err();
    assert!(matches!(err, Error::NotFound { n_iter: 7 }));
}

#[test]
fn update_segments_is_idempotent() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();

    let mut updated = archive.get_segments(1).unwrap().remove(0);
    updated.weight = 0.9;
    archive.update_segments(1, &[updated.clone()]).unwrap();
    archive.update_segments(1, &[updated]).unwrap();

    let after = archive.get_segments(1).unwrap();
    assert!((after[0].weight - 0.9).abs() < 1e-12);
}

#[test]
fn get_children_filters_on_primary_parent() {
    let (_dir, archive) = open_test_archive();
    archive
        .prepare_iteration(1, &[seg(0, 1, &[0], 0, 0.5), seg(1, 1, &[0], 0, 0.5)])
        .unwrap();
    archive
        .prepare_iteration(
            2,
            &[
                seg(0, 2, &[0], 0, 0.5),
                seg(1, 2, &[1], 1, 0.25),
                seg(2, 2, &[1], 1, 0.25),
            ],
        )
        .unwrap();
    archive.set_current_iteration(2).unwrap();

    let children = archive.get_children(1, 1).unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|s| s.p_parent_id == 1));
}

#[test]
fn get_children_of_the_current_iteration_is_empty() {
    let (_dir, archive) = open_test_archive();
    archive
        .prepare_iteration(1, &[seg(0, 1, &[0], 0, 0.5), seg(1, 1, &[0], 0, 0.5)])
        .unwrap();
    // current_iteration is still 1 (the default after `prepare`); it has no
    // children on disk yet.
    assert_eq!(archive.get_children(1, 0).unwrap(), Vec::new());
}

#[test]
fn write_bin_data_rejects_mismatched_assignment_length() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    let err = archive
        .write_bin_data(1, 4, vec![0, 1], vec![0.0; 4], vec![0; 16], vec![0.0; 16], vec![0.0; 16])
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));
}

#[test]
fn write_bin_data_then_read_back() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    archive
        .write_bin_data(1, 2, vec![0, 1, 0], vec![0.5, 0.5], vec![1, 0, 0, 1], vec![0.1, 0.0, 0.0, 0.1], vec![0.01, 0.0, 0.0, 0.01])
        .unwrap();
    let tables = archive.read_tables(1).unwrap();
    assert_eq!(tables.n_bins, 2);
    assert_eq!(tables.bin_assignments, vec![0, 1, 0]);
}

#[test]
fn write_recycling_data_round_trips() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    archive.write_recycling_data(1, vec![(0, 0.3)]).unwrap();
    let tables = archive.read_tables(1).unwrap();
    assert_eq!(tables.recycling, vec![(0, 0.3)]);
}

#[test]
fn del_iter_summary_then_get_is_not_found() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    archive.del_iter_summary(1).unwrap();
    let err = archive.get_iter_summary(1).unwrap_err();
    assert!(matches!(err, Error::NotFound { n_iter: 1 }));
}

#[test]
fn del_iter_summary_on_missing_row_is_a_noop() {
    let (_dir, archive) = open_test_archive();
    archive.del_iter_summary(99).unwrap();
}

#[test]
fn del_iter_summary_truncates_table_to_min_iter_minus_one() {
    let (_dir, archive) = open_test_archive();
    for n in 1..=5u32 {
        archive.prepare_iteration(n, &[seg(0, n, &[0], 0, 1.0)]).unwrap();
    }
    archive.del_iter_summary(3).unwrap();

    assert_eq!(archive.summary_iterations().unwrap(), vec![1, 2]);
    assert!(archive.get_iter_summary(3).is_err());
    assert!(archive.get_iter_summary(4).is_err());
    assert!(archive.get_iter_summary(5).is_err());
    // the iteration groups themselves are untouched, just unreachable via summary
    assert!(archive.get_segments(3).is_ok());
}

#[test]
fn summary_iterations_lists_ascending() {
    let (_dir, archive) = open_test_archive();
    archive.prepare_iteration(1, &[seg(0, 1, &[0], 0, 1.0)]).unwrap();
    archive.prepare_iteration(2, &[seg(0, 2, &[0], 0, 1.0)]).unwrap();
    assert_eq!(archive.summary_iterations().unwrap(), vec![1, 2]);
}
