//! The iteration-indexed persistent store (spec.md §4.1): a single LMDB
//! environment holding one database per logical table, keyed by a fixed-width
//! big-endian iteration number so that every write for an iteration lands as
//! one `put` against one key, never incrementally. Grounded on the
//! environment-setup and batch-write discipline of `sharded_lmdb`.

use std::path::Path;

use lmdb::{Cursor, Database, Environment, EnvironmentFlags, Transaction, WriteFlags};
use thiserror::Error;
use wess_model::{IterationTables, ModelError, Segment, SummaryRow};

#[derive(Debug, Error)]
pub enum Error {
    #[error("archive configuration error: {0}")]
    Config(String),
    #[error("schema violation: {detail}")]
    SchemaViolation { detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(#[from] lmdb::Error),
    #[error("no data for iteration {n_iter}")]
    NotFound { n_iter: u32 },
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to encode record: {0}")]
    Encode(#[from] bincode::Error),
}

fn iter_key(n_iter: u32) -> [u8; 4] {
    n_iter.to_be_bytes()
}

const META_PCOORD_NDIM: &[u8] = b"pcoord_ndim";
const META_PCOORD_LEN: &[u8] = b"pcoord_len";
const META_N_BINS: &[u8] = b"n_bins";
const META_CURRENT_ITERATION: &[u8] = b"current_iteration";
const META_FORMAT_VERSION: &[u8] = b"file_format_version";

/// Bumped whenever the on-disk table layout changes; written once by
/// `Archive::prepare` and never read back by this crate (mirrors
/// `wemd_file_format_version` in the original archive).
const FILE_FORMAT_VERSION: u32 = 3;

/// The open handle on a run's archive. Cheaply `Clone`-able: LMDB environments
/// are internally reference-counted and safe to share across threads.
#[derive(Clone)]
pub struct Archive {
    env: std::sync::Arc<Environment>,
    meta: Database,
    iterations: Database,
    summary: Database,
}

impl Archive {
    /// Opens (creating if absent) the archive rooted at `path`. Mirrors
    /// `sharded_lmdb`'s `NO_SYNC | NO_TLS` environment flags: durability is
    /// the caller's problem (checkpointing, replication), not this store's.
    pub fn open(path: &Path) -> Result<Archive, Error> {
        std::fs::create_dir_all(path)?;
        let env = Environment::new()
            .set_max_dbs(3)
            .set_map_size(16 * 1024 * 1024 * 1024)
            .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
            .open(path)?;

        let meta = env.create_db(Some("meta"), lmdb::DatabaseFlags::empty())?;
        let iterations = env.create_db(Some("iterations"), lmdb::DatabaseFlags::empty())?;
        let summary = env.create_db(Some("summary"), lmdb::DatabaseFlags::empty())?;

        log::debug!("opened archive at {}", path.display());
        Ok(Archive {
            env: std::sync::Arc::new(env),
            meta,
            iterations,
            summary,
        })
    }

    /// Drops this handle. LMDB environments close on their final `Drop`; this
    /// exists so callers have an explicit, symmetric `Close` to call, as
    /// spec.md §4.1 names one.
    pub fn close(self) {
        log::debug!("closing archive");
    }

    /// Initializes a fresh archive: records the fixed per-run shape
    /// (`pcoord_ndim`, `pcoord_len`, `n_bins`), writes the format-version
    /// attribute, and sets `current_iteration` to 1 (spec.md §4.1).
    pub fn prepare(&self, pcoord_ndim: usize, pcoord_len: usize, n_bins: usize) -> Result<(), Error> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(
            self.meta,
            &META_PCOORD_NDIM,
            &(pcoord_ndim as u64).to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.put(
            self.meta,
            &META_PCOORD_LEN,
            &(pcoord_len as u64).to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.put(
            self.meta,
            &META_N_BINS,
            &(n_bins as u64).to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.put(
            self.meta,
            &META_FORMAT_VERSION,
            &FILE_FORMAT_VERSION.to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.put(
            self.meta,
            &META_CURRENT_ITERATION,
            &1u32.to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.commit()?;
        log::debug!(
            "prepared archive: pcoord_ndim={pcoord_ndim} pcoord_len={pcoord_len} n_bins={n_bins}"
        );
        Ok(())
    }

    fn meta_u64(&self, key: &[u8]) -> Result<u64, Error> {
        let txn = self.env.begin_ro_txn()?;
        let bytes = txn.get(self.meta, &key)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn pcoord_shape(&self) -> Result<(usize, usize), Error> {
        Ok((
            self.meta_u64(META_PCOORD_NDIM)? as usize,
            self.meta_u64(META_PCOORD_LEN)? as usize,
        ))
    }

    pub fn current_iteration(&self) -> Result<u32, Error> {
        let txn = self.env.begin_ro_txn()?;
        let bytes = txn.get(self.meta, &META_CURRENT_ITERATION)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn set_current_iteration(&self, n_iter: u32) -> Result<(), Error> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(
            self.meta,
            &META_CURRENT_ITERATION,
            &n_iter.to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn read_tables(&self, n_iter: u32) -> Result<IterationTables, Error> {
        let txn = self.env.begin_ro_txn()?;
        let key = iter_key(n_iter);
        let bytes = txn
            .get(self.iterations, &key)
            .map_err(|_| Error::NotFound { n_iter })?;
        Ok(bincode::deserialize(bytes)?)
    }

    fn write_tables(&self, tables: &IterationTables) -> Result<(), Error> {
        let key = iter_key(tables.n_iter);
        let bytes = bincode::serialize(tables)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.iterations, &key, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    /// `PrepareIteration`: materializes a fresh iteration's columnar tables
    /// from its segment list and seeds an incomplete summary row, all in one
    /// write per database.
    pub fn prepare_iteration(&self, n_iter: u32, segments: &[Segment]) -> Result<(), Error> {
        let (pcoord_ndim, pcoord_len) = self.pcoord_shape()?;
        let tables = IterationTables::from_segments(n_iter, segments, pcoord_ndim, pcoord_len)?;

        let prev_n_particles = if n_iter > 1 {
            Some(self.read_tables(n_iter - 1)?.n_particles() as u32)
        } else {
            None
        };
        tables.validate(prev_n_particles)?;

        self.write_tables(&tables)?;
        self.update_iter_summary(SummaryRow::incomplete(n_iter, segments))?;
        log::debug!(
            "prepared iteration {n_iter}: {} segments",
            tables.n_particles()
        );
        Ok(())
    }

    /// `UpdateSegments`: read-modify-write the iteration's tables with the
    /// given partial or full segment updates.
    pub fn update_segments(&self, n_iter: u32, updates: &[Segment]) -> Result<(), Error> {
        let mut tables = self.read_tables(n_iter)?;
        tables.apply_updates(updates)?;
        self.write_tables(&tables)?;
        log::trace!("updated {} segments of iteration {n_iter}", updates.len());
        Ok(())
    }

    /// `GetSegments`: every segment of `n_iter`.
    pub fn get_segments(&self, n_iter: u32) -> Result<Vec<Segment>, Error> {
        Ok(self.read_tables(n_iter)?.to_segments())
    }

    /// `GetSegmentsByID`: a subset of `n_iter`'s segments, in request order.
    pub fn get_segments_by_id(&self, n_iter: u32, ids: &[u32]) -> Result<Vec<Segment>, Error> {
        Ok(self.read_tables(n_iter)?.to_segments_by_id(ids)?)
    }

    /// `GetChildren`: segments of `n_iter + 1` whose primary parent is
    /// `parent_seg_id` in iteration `n_iter`. Returns the empty set when
    /// `n_iter` is the current iteration, since it has no children yet
    /// (spec.md §4.1).
    pub fn get_children(&self, n_iter: u32, parent_seg_id: u32) -> Result<Vec<Segment>, Error> {
        if n_iter >= self.current_iteration()? {
            return Ok(Vec::new());
        }
        let next = self.read_tables(n_iter + 1)?;
        Ok(next.children_of_primary(parent_seg_id))
    }

    /// `WriteBinData`: overwrites the binning tables for `n_iter` in one write.
    #[allow(clippy::too_many_arguments)]
    pub fn write_bin_data(
        &self,
        n_iter: u32,
        n_bins: usize,
        bin_assignments: Vec<u32>,
        bin_populations: Vec<f64>,
        bin_ntrans: Vec<u64>,
        bin_fluxes: Vec<f64>,
        bin_rates: Vec<f64>,
    ) -> Result<(), Error> {
        let mut tables = self.read_tables(n_iter)?;
        let expected_assignments = tables.n_particles() * tables.pcoord_len;
        if bin_assignments.len() != expected_assignments {
            return Err(Error::SchemaViolation {
                detail: format!(
                    "bin_assignments length {} != n_particles*pcoord_len {}",
                    bin_assignments.len(),
                    expected_assignments
                ),
            });
        }
        tables.n_bins = n_bins;
        tables.bin_assignments = bin_assignments;
        tables.bin_populations = bin_populations;
        tables.bin_ntrans = bin_ntrans;
        tables.bin_fluxes = bin_fluxes;
        tables.bin_rates = bin_rates;
        self.write_tables(&tables)?;
        log::debug!("wrote bin data for iteration {n_iter}: n_bins={n_bins}");
        Ok(())
    }

    /// `WriteRecyclingData`: overwrites the recycling list for `n_iter`.
    pub fn write_recycling_data(&self, n_iter: u32, recycling: Vec<(u32, f64)>) -> Result<(), Error> {
        let mut tables = self.read_tables(n_iter)?;
        tables.recycling = recycling;
        self.write_tables(&tables)?;
        Ok(())
    }

    pub fn update_iter_summary(&self, row: SummaryRow) -> Result<(), Error> {
        let key = iter_key(row.n_iter);
        let bytes = bincode::serialize(&row)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.summary, &key, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_iter_summary(&self, n_iter: u32) -> Result<SummaryRow, Error> {
        let txn = self.env.begin_ro_txn()?;
        let bytes = txn
            .get(self.summary, &iter_key(n_iter))
            .map_err(|_| Error::NotFound { n_iter })?;
        Ok(bincode::deserialize(bytes)?)
    }

    /// Truncates the summary table to length `min_iter - 1`: every summary row
    /// for an iteration `>= min_iter` is removed (spec.md §3 invariant 6). The
    /// iteration groups themselves are left on disk, just no longer reachable
    /// via the summary.
    pub fn del_iter_summary(&self, min_iter: u32) -> Result<(), Error> {
        let mut txn = self.env.begin_rw_txn()?;
        for n_iter in self.summary_iterations_in(&txn)? {
            if n_iter < min_iter {
                continue;
            }
            match txn.del(self.summary, &iter_key(n_iter), None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        txn.commit()?;
        log::trace!("truncated summary table to length {}", min_iter.saturating_sub(1));
        Ok(())
    }

    fn summary_iterations_in(
        &self,
        txn: &lmdb::RwTransaction,
    ) -> Result<Vec<u32>, Error> {
        let mut cursor = txn.open_ro_cursor(self.summary)?;
        let mut out = Vec::new();
        for item in cursor.iter_start() {
            let (key, _) = item?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(key);
            out.push(u32::from_be_bytes(buf));
        }
        Ok(out)
    }

    /// All iteration numbers for which a summary row exists, ascending.
    pub fn summary_iterations(&self) -> Result<Vec<u32>, Error> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.summary)?;
        let mut out = Vec::new();
        for item in cursor.iter_start() {
            let (key, _) = item?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(key);
            out.push(u32::from_be_bytes(buf));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
