//! The sector container: a fixed 32 MiB segment buffer packing many
//! content-addressed blocks, plus everything a verifier needs: per-segment
//! possession tags, a segment merkle root and the directory forest recording
//! where each block landed.
//!
//! A sector moves through `Fresh -> Filling -> Sealed`; publishing the sealed
//! bytes to the content network is the caller's job. Filling appends blocks
//! with [`Sector::step`]; once the remaining free space cannot hold another
//! whole segment the sector seals itself: the buffer is already zero beyond
//! the last write, the trailing zero count is recorded as padding, all
//! [`SEG_COUNT`] segments are tagged and the merkle root is computed.

pub mod forest;
mod select;
mod wire;

use primitives_commitment::{Commitment, MerkleTree};
use primitives_pdp::{PrivateParams, PublicParams};
use quick_protobuf::{deserialize_from_slice, serialize_into_vec};

pub use crate::forest::{Entry, EntryKind, Forest};
pub use crate::select::proof_segment;

/// Total sector payload in bytes.
pub const SECTOR_LEN: usize = 1 << 25;
/// Number of equal segments a sector is split into for tagging and proving.
pub const SEG_COUNT: usize = 64;
/// Bytes per segment.
pub const SEG_LEN: usize = SECTOR_LEN / SEG_COUNT;

/// Version magic prefixing every marshalled sector.
const SECTOR_MAGIC: &[u8] = b"v1";

#[derive(Debug, thiserror::Error)]
pub enum SectorError {
    #[error("sector hasn't enough free size")]
    NotEnoughFreeSize,

    #[error("length of data exceeds the sector length")]
    DataTooLarge,

    #[error("expected a block with a path route")]
    EmptyPathRoute,

    #[error("expected a sector with a format version header")]
    InvalidSectorHeader,

    #[error("sector is already sealed")]
    AlreadySealed,

    #[error("sector is not sealed yet")]
    NotSealed,

    #[error("sector was decoded without private parameters")]
    MissingPrivateParams,

    #[error("padding {0} exceeds the sector length")]
    InvalidPadding(u32),

    #[error("expected {SECTOR_LEN} segment bytes, got {0}")]
    InvalidSegmentsLength(usize),

    #[error("expected {SEG_COUNT} segment tags, got {0}")]
    InvalidTagCount(usize),

    #[error(transparent)]
    Commitment(#[from] primitives_commitment::CommitmentError),

    #[error(transparent)]
    Pdp(#[from] primitives_pdp::PdpError),

    #[error(transparent)]
    Wire(#[from] quick_protobuf::Error),
}

pub struct Sector {
    /// Present only on the builder side; decoded sectors cannot tag.
    sp: Option<PrivateParams>,
    pp: PublicParams,
    next_write: usize,
    sealed: bool,
    tags: Vec<String>,
    segments: Vec<u8>,
    padding: u32,
    forest: Forest,
    merkle_root: Option<Commitment>,
}

impl Sector {
    /// A fresh, empty sector bound to the given parameter pair.
    pub fn new(sp: PrivateParams, pp: PublicParams) -> Self {
        Self {
            sp: Some(sp),
            pp,
            next_write: 0,
            sealed: false,
            tags: Vec::with_capacity(SEG_COUNT),
            segments: vec![0; SECTOR_LEN],
            padding: SECTOR_LEN as u32,
            forest: Forest::default(),
            merkle_root: None,
        }
    }

    /// Bytes written so far.
    pub fn data_len(&self) -> usize {
        self.next_write
    }

    /// Trailing zero bytes after the last written block.
    pub fn padding(&self) -> u32 {
        self.padding
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn public_params(&self) -> &PublicParams {
        &self.pp
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Marshalled per-segment tags; populated once sealed.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The segment merkle root; populated once sealed.
    pub fn merkle_root(&self) -> Option<&Commitment> {
        self.merkle_root.as_ref()
    }

    /// Segment `index`'s bytes. Callers must keep `index < SEG_COUNT`.
    pub fn segment(&self, index: usize) -> &[u8] {
        &self.segments[index * SEG_LEN..(index + 1) * SEG_LEN]
    }

    /// Appends a block found at `path` and advances the fill state.
    ///
    /// Returns `Ok(false)` while the sector can still take another segment's
    /// worth of data, `Ok(true)` once this step filled the sector enough to
    /// seal it (the tags and merkle root are computed before returning). A
    /// block that does not fit fails with
    /// [`NotEnoughFreeSize`](SectorError::NotEnoughFreeSize) and leaves the
    /// sector untouched, so the caller can keep walking for smaller blocks.
    pub fn step(&mut self, path: &[String], data: &[u8]) -> Result<bool, SectorError> {
        if self.sealed {
            return Err(SectorError::AlreadySealed);
        }
        if path.is_empty() {
            return Err(SectorError::EmptyPathRoute);
        }
        let offset = self.write(data)?;
        self.forest.insert(path, offset as u32, data.len() as u32);

        if SECTOR_LEN - self.next_write >= SEG_LEN {
            return Ok(false);
        }
        self.seal()?;
        Ok(true)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SectorError> {
        if data.len() > SECTOR_LEN {
            return Err(SectorError::DataTooLarge);
        }
        if SECTOR_LEN - self.next_write < data.len() {
            return Err(SectorError::NotEnoughFreeSize);
        }
        let offset = self.next_write;
        self.segments[offset..offset + data.len()].copy_from_slice(data);
        self.next_write += data.len();
        self.padding = (SECTOR_LEN - self.next_write) as u32;
        Ok(offset)
    }

    fn seal(&mut self) -> Result<(), SectorError> {
        let sp = self.sp.as_ref().ok_or(SectorError::MissingPrivateParams)?;

        self.tags.clear();
        for index in 0..SEG_COUNT {
            let segment = &self.segments[index * SEG_LEN..(index + 1) * SEG_LEN];
            let tag = primitives_pdp::gen_tag(sp, &self.pp, index as i64, segment);
            self.tags.push(tag.marshal());
        }

        let leaves: Vec<&[u8]> = (0..SEG_COUNT).map(|index| self.segment(index)).collect();
        self.merkle_root = Some(MerkleTree::build(&leaves)?.root());
        self.sealed = true;
        Ok(())
    }

    /// Serializes a sealed sector: the `"v1"` magic followed by the
    /// length-delimited record described in [`wire`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, SectorError> {
        let root = self.merkle_root.ok_or(SectorError::NotSealed)?;
        let pp = self.pp.marshal();
        let record = wire::RecordRef {
            tags: &self.tags,
            segments: &self.segments,
            root: root.as_slice(),
            padding: self.padding,
            forest: &self.forest,
            pp: &pp,
        };
        let mut bytes = SECTOR_MAGIC.to_vec();
        bytes.extend(serialize_into_vec(&record)?);
        Ok(bytes)
    }

    /// Decodes a published sector, validating the segment-buffer length, the
    /// tag count and the merkle-root length so downstream proving can index
    /// freely.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SectorError> {
        if data.len() <= SECTOR_MAGIC.len() || &data[..SECTOR_MAGIC.len()] != SECTOR_MAGIC {
            return Err(SectorError::InvalidSectorHeader);
        }
        let record: wire::Record = deserialize_from_slice(&data[SECTOR_MAGIC.len()..])?;

        if record.segments.len() != SECTOR_LEN {
            return Err(SectorError::InvalidSegmentsLength(record.segments.len()));
        }
        if record.tags.len() != SEG_COUNT {
            return Err(SectorError::InvalidTagCount(record.tags.len()));
        }
        if record.padding as usize > SECTOR_LEN {
            return Err(SectorError::InvalidPadding(record.padding));
        }
        let root = Commitment::from_bytes(&record.root)?;
        let pp = PublicParams::parse(&record.pp)?;

        Ok(Self {
            sp: None,
            pp,
            next_write: SECTOR_LEN - record.padding as usize,
            sealed: true,
            tags: record.tags,
            segments: record.segments,
            padding: record.padding,
            forest: record.forest,
            merkle_root: Some(root),
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    const MIB: usize = 1 << 20;

    fn params() -> (PrivateParams, PublicParams) {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let sp = PrivateParams::generate(&secret).unwrap();
        let pp = sp.derive_public(primitives_pdp::rand_elliptic_point(&mut rand::thread_rng()));
        (sp, pp)
    }

    fn fresh_sector() -> Sector {
        let (sp, pp) = params();
        Sector::new(sp, pp)
    }

    fn block(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn path(components: &[&str]) -> Vec<String> {
        components.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn pack_until_sealed() {
        let mut sector = fresh_sector();
        let steps: Vec<(Vec<String>, usize)> = vec![
            (path(&["A"]), 4 * MIB),
            (path(&["A", "B", "b1"]), 4 * MIB),
            (path(&["A", "B", "b2"]), 4 * MIB),
            (path(&["A", "B", "b3"]), 4 * MIB),
            (path(&["A", "B", "b4"]), 4 * MIB),
            (path(&["A", "C", "c1"]), 4 * MIB),
            (path(&["A2", "bb2", "cc1"]), 4 * MIB),
            (path(&["A", "C", "c2"]), 4 * MIB - 23),
        ];

        let mut finished = false;
        for (route, len) in &steps {
            finished = sector.step(route, &block(*len)).unwrap();
        }

        assert!(finished);
        assert!(sector.is_sealed());
        assert_eq!(sector.padding(), 23);
        assert_eq!(sector.tags().len(), SEG_COUNT);
        assert!(sector.merkle_root().is_some());

        assert!(sector.forest().root("A").is_some());
        assert!(sector.forest().root("A2").is_some());
        let c2 = sector.forest().root("A").unwrap().find("c2").unwrap();
        assert_eq!(c2.len as usize, 4 * MIB - 23);
    }

    #[test]
    fn insufficient_fill_never_seals() {
        let mut sector = fresh_sector();
        for index in 0..16 {
            let route = path(&["R", &format!("blk{index}")]);
            assert!(!sector.step(&route, &block(MIB)).unwrap());
        }
        assert_eq!(sector.data_len(), 16 * MIB);
        assert!(!sector.is_sealed());
        assert!(sector.merkle_root().is_none());
    }

    #[test]
    fn unfit_block_leaves_sector_unchanged() {
        let mut sector = fresh_sector();
        assert!(!sector.step(&path(&["A"]), &block(30 * MIB)).unwrap());

        let result = sector.step(&path(&["B"]), &block(4 * MIB));
        assert!(matches!(result, Err(SectorError::NotEnoughFreeSize)));
        assert_eq!(sector.data_len(), 30 * MIB);
        assert_eq!(sector.forest().trees.len(), 1);
    }

    #[test]
    fn oversize_block_rejected() {
        let mut sector = fresh_sector();
        let result = sector.step(&path(&["A"]), &block(SECTOR_LEN + 1));
        assert!(matches!(result, Err(SectorError::DataTooLarge)));
        assert_eq!(sector.data_len(), 0);
    }

    #[test]
    fn empty_path_rejected() {
        let mut sector = fresh_sector();
        let result = sector.step(&[], &block(MIB));
        assert!(matches!(result, Err(SectorError::EmptyPathRoute)));
    }

    #[test]
    fn boundary_padding_one() {
        let mut sector = fresh_sector();
        assert!(sector.step(&path(&["A"]), &block(SECTOR_LEN - 1)).unwrap());
        assert_eq!(sector.padding(), 1);
    }

    #[test]
    fn boundary_padding_zero() {
        let mut sector = fresh_sector();
        assert!(sector.step(&path(&["A"]), &block(SECTOR_LEN)).unwrap());
        assert_eq!(sector.padding(), 0);
    }

    #[test]
    fn step_after_seal_rejected() {
        let mut sector = fresh_sector();
        assert!(sector.step(&path(&["A"]), &block(SECTOR_LEN)).unwrap());
        let result = sector.step(&path(&["B"]), &[]);
        assert!(matches!(result, Err(SectorError::AlreadySealed)));
    }

    #[test]
    fn marshal_roundtrip() {
        let mut sector = fresh_sector();
        assert!(!sector.step(&path(&["A", "B", "b1"]), &block(16 * MIB)).unwrap());
        assert!(sector
            .step(&path(&["A", "C", "c1"]), &block(16 * MIB - 17))
            .unwrap());

        let bytes = sector.to_bytes().unwrap();
        let decoded = Sector::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.tags(), sector.tags());
        assert_eq!(decoded.padding(), 17);
        assert_eq!(decoded.merkle_root(), sector.merkle_root());
        assert_eq!(decoded.forest(), sector.forest());
        assert_eq!(
            decoded.public_params().marshal(),
            sector.public_params().marshal()
        );
        for index in 0..SEG_COUNT {
            assert_eq!(decoded.segment(index), sector.segment(index));
        }
        assert_eq!(decoded.data_len(), sector.data_len());
    }

    #[test]
    fn unsealed_sector_does_not_marshal() {
        let mut sector = fresh_sector();
        sector.step(&path(&["A"]), &block(MIB)).unwrap();
        assert!(matches!(sector.to_bytes(), Err(SectorError::NotSealed)));
    }

    #[test]
    fn invalid_header_rejected() {
        for bytes in [&b""[..], &b"v"[..], &b"v1"[..]] {
            assert!(matches!(
                Sector::from_bytes(bytes),
                Err(SectorError::InvalidSectorHeader)
            ));
        }
        assert!(matches!(
            Sector::from_bytes(b"xx-not-a-sector"),
            Err(SectorError::InvalidSectorHeader)
        ));
    }

    #[test]
    fn decoded_sector_supports_proving() {
        let mut sector = fresh_sector();
        assert!(sector.step(&path(&["A"]), &block(SECTOR_LEN)).unwrap());
        let decoded = Sector::from_bytes(&sector.to_bytes().unwrap()).unwrap();

        let index = 13usize;
        let tag = primitives_pdp::Tag::parse(&decoded.tags()[index]).unwrap();
        let chal = primitives_pdp::gen_chal_with_seed(index as i64, "round-seed");
        let proof = primitives_pdp::prove(
            decoded.public_params(),
            &chal,
            &tag,
            decoded.segment(index),
        );
        assert!(primitives_pdp::verify(decoded.public_params(), &chal, &proof));
    }
}
