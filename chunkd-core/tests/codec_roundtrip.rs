use chunkd_core::codec::{self, merge, split, ChunkHealth};
use chunkd_core::layout::ChunkDir;
use chunkd_core::manifest::ChunkDescriptor;
use chunkd_core::Error;
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn store_chunks(root: &Path, name: &str, data: &[u8], chunk_size: usize) -> Vec<ChunkDescriptor> {
    let dir = ChunkDir::new(root, name).unwrap();
    split(data, chunk_size)
        .unwrap()
        .into_iter()
        .map(|c| {
            let p = dir.write_chunk(c.index, &c.data).unwrap();
            c.descriptor(p)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn merge_of_split_is_identity(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        chunk_size in 1usize..700,
    ) {
        let td = tempfile::tempdir().unwrap();
        let descs = store_chunks(td.path(), "prop.bin", &data, chunk_size);
        prop_assert_eq!(descs.len(), data.len().div_ceil(chunk_size));
        let mut out = Vec::<u8>::new();
        let n = merge(&descs, &mut out).unwrap();
        prop_assert_eq!(n as usize, data.len());
        prop_assert_eq!(out, data);
    }
}

#[test]
fn sizes_follow_nominal_chunk_size() {
    let data = random_bytes(10_000, 1);
    let chunks = split(&data[..], 4096).unwrap();
    let sizes: Vec<u64> = chunks.iter().map(|c| c.size()).collect();
    assert_eq!(sizes, vec![4096, 4096, 1808]);
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(c.index, i);
        assert_eq!(c.checksum, codec::checksum(&data[i * 4096..i * 4096 + c.data.len()]));
    }
}

#[test]
fn single_flipped_byte_fails_merge() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(3 * 1024 + 100, 2);
    let descs = store_chunks(td.path(), "f.bin", &data, 1024);

    let mut f = OpenOptions::new().read(true).write(true).open(&descs[1].path).unwrap();
    f.seek(SeekFrom::Start(17)).unwrap();
    f.write_all(&[data[1024 + 17] ^ 0xFF]).unwrap();
    drop(f);

    let mut out = Vec::<u8>::new();
    let err = merge(&descs, &mut out).expect_err("corruption must fail the merge");
    match err {
        Error::ChecksumMismatch { index, ref expected, .. } => {
            assert_eq!(index, 1);
            assert_eq!(expected, &descs[1].checksum);
        }
        other => panic!("unexpected error: {other}"),
    }
    // chunk 0 was already emitted, the bad chunk never was
    assert_eq!(out, &data[..1024]);
    assert_eq!(codec::verify_chunk(&descs[1]), ChunkHealth::Corrupt {
        actual: codec::checksum(&fs::read(&descs[1].path).unwrap()),
    });
}

#[test]
fn truncated_chunk_is_size_mismatch() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(2048, 3);
    let descs = store_chunks(td.path(), "t.bin", &data, 1024);
    let f = OpenOptions::new().write(true).open(&descs[0].path).unwrap();
    f.set_len(1000).unwrap();
    drop(f);

    let err = merge(&descs, &mut Vec::<u8>::new()).unwrap_err();
    assert!(
        matches!(err, Error::ChunkSizeMismatch { index: 0, expected: 1024, actual: 1000, .. }),
        "got {err}"
    );
    assert_eq!(codec::verify_chunk(&descs[0]), ChunkHealth::Truncated { found: 1000 });
}

#[test]
fn missing_chunk_fails_merge() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(2048, 4);
    let descs = store_chunks(td.path(), "m.bin", &data, 1024);
    fs::remove_file(&descs[1].path).unwrap();

    let err = merge(&descs, &mut Vec::<u8>::new()).unwrap_err();
    assert!(matches!(err, Error::ChunkMissing { index: 1, .. }), "got {err}");
    assert!(err.is_integrity());
    assert_eq!(codec::verify_chunk(&descs[1]), ChunkHealth::Missing);
    assert!(codec::verify_chunk(&descs[0]).is_intact());
}

#[test]
fn merge_of_nothing_is_empty() {
    let mut out = Vec::<u8>::new();
    assert_eq!(merge(&[], &mut out).unwrap(), 0);
    assert!(out.is_empty());
}
