//! Legacy flatfs bundle accumulation.
//!
//! Earlier deployments kept raw blocks in flatfs mounts
//! (`<mount>/<shard>/<base32-multibase>.data`). This gatherer walks every
//! configured mount in parallel, selecting not-yet-done blocks in lexical
//! order against a shared byte budget. The walks share the running total
//! behind a mutex and an atomic stop flag, so whichever walk crosses the
//! budget first stops the others at their next file.
//!
//! Selected blocks are marked `doing` immediately; the sector packer decides
//! which of them actually end up in the next sector.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use cid::Cid;

use crate::db::{ProgressStore, ProgressStoreError};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
}

/// A block picked out of a flatfs mount.
#[derive(Debug, Clone)]
pub struct SelectedBlock {
    pub path: PathBuf,
    pub cid: String,
}

/// Walks all `mounts` in parallel and gathers up to `budget` bytes of fresh
/// blocks. Returns the selection together with the byte total that was
/// accumulated; a total below the budget means the mounts ran dry.
pub fn gather(
    mounts: &[PathBuf],
    budget: u64,
    db: &ProgressStore,
) -> Result<(Vec<SelectedBlock>, u64), BundleError> {
    let selected = Mutex::new(Vec::new());
    let accumulated = Mutex::new(0u64);
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for mount in mounts {
            let selected = &selected;
            let accumulated = &accumulated;
            let stop = &stop;
            scope.spawn(move || {
                if let Err(err) = walk_mount(mount, budget, db, selected, accumulated, stop) {
                    // A broken mount only costs its own blocks.
                    tracing::error!(%err, mount = %mount.display(), "skipping mount");
                }
            });
        }
    });

    let total = *accumulated.lock().expect("bundle budget lock poisoned");
    Ok((
        selected.into_inner().expect("bundle selection lock poisoned"),
        total,
    ))
}

fn walk_mount(
    mount: &Path,
    budget: u64,
    db: &ProgressStore,
    selected: &Mutex<Vec<SelectedBlock>>,
    accumulated: &Mutex<u64>,
    stop: &AtomicBool,
) -> Result<(), BundleError> {
    let shards = sorted_entries(mount)?;
    tracing::info!(mount = %mount.display(), shards = shards.len(), "searching mount");

    for shard in shards {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let shard_name = shard.file_name().to_string_lossy().into_owned();
        if !shard.file_type()?.is_dir() || shard_name.contains("temp") {
            continue;
        }
        let shard_dir = mount.join(&shard_name);

        for file in sorted_entries(&shard_dir)? {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            if file.file_type()?.is_dir() {
                continue;
            }
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".data") else {
                tracing::warn!(file = %name, "skipping non-block file");
                continue;
            };
            // Flatfs shards a block under the next-to-last two characters of
            // its name; anything else landed here by accident.
            if stem.len() < 3 || stem[stem.len() - 3..stem.len() - 1] != shard_name {
                tracing::warn!(file = %name, shard = %shard_name, "skipping missharded file");
                continue;
            }
            // Flatfs strips the multibase prefix; `B` restores base32-upper.
            let Ok(cid) = Cid::try_from(format!("B{stem}").as_str()) else {
                tracing::warn!(file = %name, "skipping undecodable block name");
                continue;
            };
            let size = file.metadata()?.len();
            if size == 0 {
                tracing::warn!(file = %name, "skipping empty block");
                continue;
            }
            let cid = cid.to_string();
            if db.is_done(&cid)? {
                continue;
            }

            let (fresh, exceeded) = {
                let mut total = accumulated.lock().expect("bundle budget lock poisoned");
                let fresh = *total < budget;
                *total += size;
                (fresh, *total > budget)
            };
            if fresh {
                selected
                    .lock()
                    .expect("bundle selection lock poisoned")
                    .push(SelectedBlock {
                        path: shard_dir.join(&name),
                        cid: cid.clone(),
                    });
                db.mark_doing(&cid)?;
            }
            if exceeded {
                tracing::info!("bundle budget reached");
                stop.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>, std::io::Error> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::gather;
    use crate::db::ProgressStore;
    use crate::testing::flatfs_block as write_block;

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn gathers_fresh_blocks_and_marks_doing() {
        let mount = tempfile::tempdir().unwrap();
        let (_db_dir, db) = store();
        let a = write_block(mount.path(), b"a", &[1u8; 100]);
        let b = write_block(mount.path(), b"b", &[2u8; 100]);

        let (blocks, total) =
            gather(&[mount.path().to_path_buf()], 1 << 30, &db).unwrap();

        assert_eq!(total, 200);
        let mut cids: Vec<_> = blocks.iter().map(|b| b.cid.clone()).collect();
        cids.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(cids, expected);
        assert_eq!(db.progress(&a).unwrap().as_deref(), Some(crate::db::DOING));
    }

    #[test]
    fn done_blocks_are_skipped() {
        let mount = tempfile::tempdir().unwrap();
        let (_db_dir, db) = store();
        let done = write_block(mount.path(), b"done", &[1u8; 50]);
        let fresh = write_block(mount.path(), b"fresh", &[2u8; 50]);
        db.mark_done(&done).unwrap();

        let (blocks, total) =
            gather(&[mount.path().to_path_buf()], 1 << 30, &db).unwrap();

        assert_eq!(total, 50);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].cid, fresh);
    }

    #[test]
    fn budget_stops_the_walk() {
        let mount = tempfile::tempdir().unwrap();
        let (_db_dir, db) = store();
        for index in 0u8..8 {
            write_block(mount.path(), &[index], &[index; 100]);
        }

        let (blocks, total) = gather(&[mount.path().to_path_buf()], 250, &db).unwrap();

        // The walk stops as soon as the total crosses the budget.
        assert!(total > 250);
        assert!(blocks.len() < 8);
    }

    #[test]
    fn foreign_files_are_ignored() {
        let mount = tempfile::tempdir().unwrap();
        let (_db_dir, db) = store();
        std::fs::create_dir_all(mount.path().join("temp-scratch")).unwrap();
        let shard = mount.path().join("AB");
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(shard.join("notes.txt"), b"not a block").unwrap();
        std::fs::write(shard.join("XYZQAB2.data"), b"bad name").unwrap();

        let (blocks, total) = gather(&[mount.path().to_path_buf()], 1 << 30, &db).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn missing_mount_is_not_fatal() {
        let (_db_dir, db) = store();
        let missing = PathBuf::from("/nonexistent/lambda-mount");
        let (blocks, total) = gather(&[missing], 1 << 30, &db).unwrap();
        assert!(blocks.is_empty());
        assert_eq!(total, 0);
    }
}
