//! The Builder agent: turns loose content-addressed blocks into published,
//! provable sectors.
//!
//! One step per tick. The step first drops blocks the coordinator's size
//! filter rejects, then packs a single sector, either by walking the sealed
//! directory tree (block paths become forest routes) or, when flatfs mounts
//! are configured, from a legacy bundle gather, and finally publishes it,
//! records the sector-to-roots mapping on the coordinator and flips the
//! consumed blocks to done in one batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cid::Cid;
use contractext::{Coordinator, RpcError};
use lambda_sector::{Sector, SectorError, SECTOR_LEN};
use primitives_pdp::{PdpError, PrivateParams};

use crate::bundle::{self, BundleError, SelectedBlock};
use crate::content::{ContentClient, ContentError};
use crate::db::{ProgressStore, ProgressStoreError};

/// Attempts at flipping consumed blocks to done after a publish.
const COMMIT_RETRIES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Sector(#[from] SectorError),

    #[error(transparent)]
    Pdp(#[from] PdpError),

    #[error(transparent)]
    Progress(#[from] ProgressStoreError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// A sealed sector waiting to be published, together with the bookkeeping of
/// what went into it.
struct Packed {
    sector: Sector,
    consumed: Vec<String>,
    roots: Vec<String>,
}

pub struct Builder<C, N> {
    seal_path: PathBuf,
    mounts: Vec<PathBuf>,
    bundle_budget: u64,
    db: Arc<ProgressStore>,
    coordinator: Arc<C>,
    content: Arc<N>,
}

impl<C, N> Builder<C, N>
where
    C: Coordinator + 'static,
    N: ContentClient + 'static,
{
    pub fn new(
        seal_path: PathBuf,
        mounts: Vec<PathBuf>,
        bundle_budget: u64,
        db: Arc<ProgressStore>,
        coordinator: Arc<C>,
        content: Arc<N>,
    ) -> Self {
        Self {
            seal_path,
            mounts,
            bundle_budget,
            db,
            coordinator,
            content,
        }
    }

    /// Runs one building step: filter, pack at most one sector, publish.
    #[tracing::instrument(skip_all)]
    pub async fn step(&self) -> Result<(), BuilderError> {
        self.filter_pass().await?;

        let secret = self.coordinator.address().as_bytes().to_vec();
        let packed = if self.mounts.is_empty() {
            let seal_path = self.seal_path.clone();
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || assemble_from_tree(&seal_path, &db, &secret))
                .await??
        } else {
            let (blocks, total) = {
                let mounts = self.mounts.clone();
                let budget = self.bundle_budget;
                let db = self.db.clone();
                tokio::task::spawn_blocking(move || bundle::gather(&mounts, budget, &db)).await??
            };
            if total < self.bundle_budget {
                tracing::info!(total, budget = self.bundle_budget, "insufficient material");
                return Ok(());
            }
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || pack_blocks(&blocks, &db, &secret)).await??
        };

        match packed {
            Some(packed) => self.publish(packed).await,
            None => {
                tracing::info!("insufficient blocks for a sector");
                Ok(())
            }
        }
    }

    /// Drops top-level entries the coordinator refuses to pay for: their
    /// recursive size must sit inside the admission band of the size the
    /// filter contract expects for that cid.
    async fn filter_pass(&self) -> Result<(), BuilderError> {
        for entry in sorted_entries(&self.seal_path)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let size = recursive_size(&path)?;
            if self.coordinator.can_store(&name, size).await? {
                continue;
            }
            tracing::info!(cid = %name, size, "rejected by the size filter");
            self.db.mark_done(&name)?;
            let removed = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(err) = removed {
                tracing::warn!(%err, path = %path.display(), "failed to remove rejected entry");
            }
        }
        Ok(())
    }

    async fn publish(&self, packed: Packed) -> Result<(), BuilderError> {
        let bytes = packed.sector.to_bytes()?;
        let sid = match self.content.publish(bytes).await {
            Ok(sid) => sid,
            // The sector is discarded; its blocks stay `doing` and the next
            // tick packs them into a fresh one.
            Err(err) => {
                tracing::error!(%err, "failed to publish sector, discarding it");
                return Ok(());
            }
        };
        if let Err(err) = self
            .coordinator
            .record_sector(&sid, packed.roots.clone())
            .await
        {
            tracing::error!(%err, %sid, "failed to record sector on the coordinator");
            return Ok(());
        }

        let mut committed = false;
        for _ in 0..COMMIT_RETRIES {
            if self.db.commit_done(&packed.consumed).is_ok() {
                committed = true;
                break;
            }
        }
        if !committed {
            tracing::error!(%sid, "failed to commit packing progress");
        }
        tracing::info!(%sid, blocks = packed.consumed.len(), "sector build completed");
        Ok(())
    }
}

/// Walks the sealed directory, feeding every fresh, fitting, cid-named block
/// into a new sector. Returns the sealed sector, or `None` when the walk ran
/// out of blocks first.
fn assemble_from_tree(
    seal_path: &Path,
    db: &ProgressStore,
    secret: &[u8],
) -> Result<Option<Packed>, BuilderError> {
    let sp = PrivateParams::generate(secret)?;
    let pp = sp.derive_public(primitives_pdp::rand_elliptic_point(&mut rand::thread_rng()));
    let mut packed = Packed {
        sector: Sector::new(sp, pp),
        consumed: Vec::new(),
        roots: Vec::new(),
    };

    let mut route = Vec::new();
    let sealed = visit_dir(seal_path, &mut route, db, &mut packed)?;
    Ok(sealed.then_some(packed))
}

fn visit_dir(
    dir: &Path,
    route: &mut Vec<String>,
    db: &ProgressStore,
    packed: &mut Packed,
) -> Result<bool, BuilderError> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if !is_cid(&name) {
            tracing::warn!(path = %path.display(), "pruning non-cid entry");
            continue;
        }
        if db.is_done(&name)? {
            continue;
        }

        if entry.file_type()?.is_dir() {
            route.push(name);
            let sealed = visit_dir(&path, route, db, packed)?;
            route.pop();
            if sealed {
                return Ok(true);
            }
            continue;
        }

        let size = entry.metadata()?.len();
        if size as usize > SECTOR_LEN {
            tracing::info!(block = %name, size, "skipping block larger than a sector");
            continue;
        }
        let data = std::fs::read(&path)?;
        route.push(name.clone());
        let stepped = packed.sector.step(route, &data);
        let root = route[0].clone();
        route.pop();

        match stepped {
            Err(SectorError::NotEnoughFreeSize) => {
                tracing::info!(block = %name, "skipping block temporarily, sector nearly full");
            }
            Err(err) => return Err(err.into()),
            Ok(finished) => {
                db.mark_doing(&name)?;
                packed.consumed.push(name);
                if !packed.roots.contains(&root) {
                    packed.roots.push(root);
                }
                if finished {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Packs blocks gathered from flatfs mounts; each enters the forest as its
/// own root since flatfs keeps no directory structure.
fn pack_blocks(
    blocks: &[SelectedBlock],
    db: &ProgressStore,
    secret: &[u8],
) -> Result<Option<Packed>, BuilderError> {
    let sp = PrivateParams::generate(secret)?;
    let pp = sp.derive_public(primitives_pdp::rand_elliptic_point(&mut rand::thread_rng()));
    let mut packed = Packed {
        sector: Sector::new(sp, pp),
        consumed: Vec::new(),
        roots: Vec::new(),
    };

    for block in blocks {
        let data = std::fs::read(&block.path)?;
        if data.len() > SECTOR_LEN {
            tracing::info!(block = %block.cid, "skipping block larger than a sector");
            continue;
        }
        let route = [block.cid.clone()];
        match packed.sector.step(&route, &data) {
            Err(SectorError::NotEnoughFreeSize) => {
                tracing::info!(block = %block.cid, "skipping block temporarily, sector nearly full");
            }
            Err(err) => return Err(err.into()),
            Ok(finished) => {
                packed.consumed.push(block.cid.clone());
                packed.roots.push(block.cid.clone());
                if finished {
                    return Ok(Some(packed));
                }
            }
        }
    }
    Ok(None)
}

/// A name counts as a block identifier only if it round-trips through cid
/// parsing unchanged.
fn is_cid(name: &str) -> bool {
    Cid::try_from(name)
        .map(|cid| cid.to_string() == name)
        .unwrap_or(false)
}

fn recursive_size(path: &Path) -> Result<u64, std::io::Error> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        size += recursive_size(&entry?.path())?;
    }
    Ok(size)
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>, std::io::Error> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}
