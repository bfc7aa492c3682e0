//! Row-band dispatch over a store's nexus slots.

use std::ops::Range;
use std::thread;

use crate::error::{CacheError, Result};
use crate::nexus::Nexus;
use crate::store::CacheStore;

/// Split the store's rows into contiguous bands and run `f` on each band from
/// its own scoped thread, worker `i` using nexus slot `i`.
///
/// At most `min(workers, nexus_count, rows)` threads run. Bands are disjoint,
/// so `f` may write any pixel of its band. Returns the first error by worker
/// order once every worker has finished; a panicking worker is propagated.
///
/// # Example
///
/// ```
/// use pixel_cache::{for_each_row_band, CacheMode, CacheStore, PixelMorphology, Region};
///
/// let mut store = CacheStore::acquire(4);
/// store.open(PixelMorphology::new(8, 8, 1), CacheMode::ReadWrite).unwrap();
///
/// for_each_row_band(&store, 4, |nexus, rows| {
///     for y in rows {
///         nexus.queue_authentic(Region::row(0, y as i64, 8))?.fill(y as u16);
///         nexus.sync()?;
///     }
///     Ok(())
/// })
/// .unwrap();
/// ```
pub fn for_each_row_band<F>(store: &CacheStore, workers: usize, f: F) -> Result<()>
where
    F: Fn(&mut Nexus<'_>, Range<u64>) -> Result<()> + Sync,
{
    let rows = store.morphology().rows;
    let workers = (workers.max(1).min(store.nexus_count()) as u64).min(rows.max(1));
    let band = rows.div_ceil(workers);

    if workers == 1 {
        let mut nexus = store.nexus(0)?;
        return f(&mut nexus, 0..rows);
    }

    let f = &f;
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers as usize);
        for index in 0..workers {
            let start = (index * band).min(rows);
            let end = (start + band).min(rows);
            let spawned = thread::Builder::new()
                .name(format!("pixel-band-{}", index))
                .spawn_scoped(scope, move || -> Result<()> {
                    let mut nexus = store.nexus(index as usize)?;
                    f(&mut nexus, start..end)
                })
                .map_err(|err| CacheError::AllocationFailed(format!("worker thread: {}", err)));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Already-running workers are joined when the scope ends.
                    log::warn!("{}: {}", store.id(), err);
                    return Err(err);
                }
            }
        }

        let mut result = Ok(());
        for handle in handles {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CacheContext};
    use crate::geometry::Region;
    use crate::morphology::{CacheMode, PixelMorphology};
    use std::sync::Mutex;

    fn open(config: &CacheConfig, threads: usize, columns: u64, rows: u64) -> CacheStore {
        let mut store = CacheStore::acquire_in(CacheContext::from_config(config), threads);
        store
            .open(PixelMorphology::new(columns, rows, 1), CacheMode::ReadWrite)
            .unwrap();
        store
    }

    #[test]
    fn test_bands_cover_all_rows() {
        let store = open(&CacheConfig::default(), 3, 2, 10);
        let seen = Mutex::new(Vec::new());
        for_each_row_band(&store, 8, |nexus, rows| {
            seen.lock().unwrap().push((nexus.index(), rows));
            Ok(())
        })
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_by_key(|(index, _)| *index);
        assert_eq!(seen, vec![(0, 0..4), (1, 4..8), (2, 8..10)]);
    }

    #[test]
    fn test_parallel_writes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_temporary_path(dir.path())
            .with_memory_mb(0)
            .with_map_mb(0);
        let store = open(&config, 4, 5, 9);
        for_each_row_band(&store, 4, |nexus, rows| {
            for y in rows {
                nexus.queue_authentic(Region::row(0, y as i64, 5))?.fill(y as u16 + 1);
                nexus.sync()?;
            }
            Ok(())
        })
        .unwrap();

        for y in 0..9 {
            assert_eq!(
                store.read_authentic(Region::row(0, y, 5)).unwrap(),
                vec![y as u16 + 1; 5]
            );
        }
    }

    #[test]
    fn test_first_error_wins() {
        let store = open(&CacheConfig::default(), 2, 1, 4);
        let err = for_each_row_band(&store, 2, |nexus, rows| {
            // Worker 1 binds outside the image.
            nexus.get_authentic(Region::row(nexus.index() as i64, rows.start as i64, 1))?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::PixelsAreNotAuthentic(_)));
    }

    #[test]
    fn test_single_band_runs_inline() {
        let store = open(&CacheConfig::default(), 1, 3, 3);
        let name = Mutex::new(None);
        for_each_row_band(&store, 4, |_, rows| {
            assert_eq!(rows, 0..3);
            *name.lock().unwrap() = thread::current().name().map(str::to_string);
            Ok(())
        })
        .unwrap();
        assert_ne!(name.into_inner().unwrap().as_deref(), Some("pixel-band-0"));
    }
}
