use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use strata::{CacheMode, Image, ImageError, OpenOptions};
use tempfile::tempdir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_file(path: &Path, data: &[u8]) -> PathBuf {
    let mut file = File::create(path).unwrap();
    file.write_all(data).unwrap();
    path.to_path_buf()
}

#[test]
fn test_open_single_raw_image() {
    let dir = tempdir().unwrap();
    let data = pattern(10_000);
    let path = write_file(&dir.path().join("evidence.raw"), &data);

    let image = Image::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(image.size(), 10_000);
    assert_eq!(image.sector_size(), 512);
    assert_eq!(image.segment_paths(), &[path]);
    assert!(image.describe().contains("raw image"));

    let mut buf = vec![0u8; 1000];
    assert_eq!(image.read(5000, &mut buf).unwrap(), 1000);
    assert_eq!(buf, data[5000..6000]);
    image.close();
}

#[test]
fn test_split_discovery_and_boundary_reads() {
    let dir = tempdir().unwrap();
    let data = pattern(300_000);
    write_file(&dir.path().join("img.001"), &data[..100_000]);
    write_file(&dir.path().join("img.002"), &data[100_000..200_000]);
    write_file(&dir.path().join("img.003"), &data[200_000..]);
    // a stray later segment after a gap must not be picked up
    write_file(&dir.path().join("img.005"), b"junk");

    let image = Image::open(dir.path().join("img.001"), OpenOptions::default()).unwrap();
    assert_eq!(image.size(), 300_000);
    assert_eq!(image.segment_paths().len(), 3);

    // spans the first and second segment
    let mut buf = vec![0u8; 20];
    assert_eq!(image.read(99_990, &mut buf).unwrap(), 20);
    assert_eq!(buf, data[99_990..100_010]);

    // spans all three segments
    let mut buf = vec![0u8; 150_000];
    assert_eq!(image.read(80_000, &mut buf).unwrap(), 150_000);
    assert_eq!(buf, data[80_000..230_000]);
}

#[test]
fn test_read_at_last_byte_returns_one() {
    let dir = tempdir().unwrap();
    let data = pattern(12_345);
    let path = write_file(&dir.path().join("disk.raw"), &data);
    let image = Image::open(&path, OpenOptions::default()).unwrap();

    let mut buf = vec![0u8; 100];
    assert_eq!(image.read(12_344, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], data[12_344]);
}

#[test]
fn test_open_segments_uses_explicit_order() {
    let dir = tempdir().unwrap();
    let a = write_file(&dir.path().join("part_b"), b"bbbb");
    let b = write_file(&dir.path().join("part_a"), b"aaaa");

    let image = Image::open_segments(&[a, b], OpenOptions::default()).unwrap();
    let mut buf = vec![0u8; 8];
    assert_eq!(image.read(0, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"bbbbaaaa");
}

#[test]
fn test_direct_mode_matches_cached() {
    let dir = tempdir().unwrap();
    let data = pattern(200_000);
    let path = write_file(&dir.path().join("disk.raw"), &data);

    let cached = Image::open(&path, OpenOptions::default()).unwrap();
    let direct = Image::open(
        &path,
        OpenOptions {
            cache: CacheMode::Direct,
            ..OpenOptions::default()
        },
    )
    .unwrap();

    for &(offset, len) in &[(0u64, 512usize), (511, 2), (65_000, 70_000), (199_999, 64)] {
        let mut a = vec![0u8; len];
        let mut b = vec![0u8; len];
        let na = cached.read(offset, &mut a).unwrap();
        let nb = direct.read(offset, &mut b).unwrap();
        assert_eq!(na, nb);
        assert_eq!(a[..na], b[..nb]);
    }
}

#[test]
fn test_concurrent_reads_are_consistent() {
    use rayon::prelude::*;

    let dir = tempdir().unwrap();
    let data = pattern(500_000);
    let path = write_file(&dir.path().join("disk.raw"), &data);
    let image = Image::open(
        &path,
        OpenOptions {
            cache: CacheMode::Chunked { capacity: 4 },
            ..OpenOptions::default()
        },
    )
    .unwrap();

    (0..200u64).into_par_iter().for_each(|i| {
        let offset = (i * 2481) % 499_000;
        let mut buf = vec![0u8; 1000];
        let n = image.read(offset, &mut buf).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(buf, data[offset as usize..offset as usize + 1000]);
    });
}

#[test]
fn test_open_missing_file_errors() {
    let dir = tempdir().unwrap();
    assert!(Image::open(dir.path().join("nope.raw"), OpenOptions::default()).is_err());
}

#[test]
fn test_sector_size_hint_is_validated() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir.path().join("disk.raw"), &pattern(4096));
    let err = Image::open(
        &path,
        OpenOptions {
            sector_size: Some(100),
            ..OpenOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::Argument(_)));

    let image = Image::open(
        &path,
        OpenOptions {
            sector_size: Some(4096),
            ..OpenOptions::default()
        },
    )
    .unwrap();
    assert_eq!(image.sector_size(), 4096);
}

// ---- EWF fixtures -------------------------------------------------------

const EWF_SIG: [u8; 8] = [0x45, 0x56, 0x46, 0x09, 0x0d, 0x0a, 0xff, 0x00];
const SECTOR: u32 = 512;
const SECTORS_PER_CHUNK: u32 = 64;
const CHUNK: usize = (SECTOR * SECTORS_PER_CHUNK) as usize; // 32 KiB

fn zlib(data: &[u8]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn descriptor(kind: &str, next: u64, size: u64) -> Vec<u8> {
    let mut raw = vec![0u8; 76];
    raw[..kind.len()].copy_from_slice(kind.as_bytes());
    raw[16..24].copy_from_slice(&next.to_le_bytes());
    raw[24..32].copy_from_slice(&size.to_le_bytes());
    raw
}

struct SegmentLayout<'a> {
    number: u16,
    /// (chunk count, sectors per chunk, bytes per sector, total sectors)
    volume: Option<(u32, u32, u32, u32)>,
    /// (raw chunk bytes, store compressed?)
    chunks: Vec<(&'a [u8], bool)>,
    last: bool,
}

fn build_segment(layout: &SegmentLayout) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&EWF_SIG);
    out.push(1);
    out.extend_from_slice(&layout.number.to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);

    if let Some((chunk_count, spc, bps, sectors)) = layout.volume {
        let mut data = vec![0u8; 20];
        data[4..8].copy_from_slice(&chunk_count.to_le_bytes());
        data[8..12].copy_from_slice(&spc.to_le_bytes());
        data[12..16].copy_from_slice(&bps.to_le_bytes());
        data[16..20].copy_from_slice(&sectors.to_le_bytes());
        let here = out.len() as u64;
        out.extend(descriptor("volume", here + 76 + 20, 76 + 20));
        out.extend(data);
    }

    let stored: Vec<Vec<u8>> = layout
        .chunks
        .iter()
        .map(|(raw, compressed)| {
            if *compressed {
                zlib(raw)
            } else {
                raw.to_vec()
            }
        })
        .collect();
    let payload: u64 = stored.iter().map(|s| s.len() as u64).sum();
    let here = out.len() as u64;
    out.extend(descriptor("sectors", here + 76 + payload, 76 + payload));
    let mut offsets = Vec::new();
    for chunk in &stored {
        offsets.push(out.len() as u32);
        out.extend_from_slice(chunk);
    }

    let table_len = (24 + 4 * offsets.len()) as u64;
    let here = out.len() as u64;
    out.extend(descriptor("table", here + 76 + table_len, 76 + table_len));
    let mut head = vec![0u8; 24];
    head[..4].copy_from_slice(&(offsets.len() as u32).to_le_bytes());
    // base offset stays zero: entries carry absolute offsets
    out.extend(head);
    for (offset, (_, compressed)) in offsets.iter().zip(&layout.chunks) {
        let mut entry = *offset;
        if *compressed {
            entry |= 0x8000_0000;
        }
        out.extend_from_slice(&entry.to_le_bytes());
    }

    let here = out.len() as u64;
    if layout.last {
        out.extend(descriptor("done", here, 76));
    } else {
        out.extend(descriptor("next", here, 76));
    }
    out
}

#[test]
fn test_ewf_single_segment_roundtrip() {
    let dir = tempdir().unwrap();
    let data = pattern(CHUNK * 3);
    let segment = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((3, SECTORS_PER_CHUNK, SECTOR, 3 * SECTORS_PER_CHUNK)),
        chunks: vec![
            (&data[..CHUNK], true),
            (&data[CHUNK..2 * CHUNK], false),
            (&data[2 * CHUNK..], true),
        ],
        last: true,
    });
    let path = write_file(&dir.path().join("case.E01"), &segment);

    let image = Image::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(image.size(), data.len() as u64);
    assert_eq!(image.sector_size(), SECTOR);
    assert!(image.describe().contains("ewf"));

    // one read spanning the compressed/uncompressed chunk boundary
    let mut buf = vec![0u8; 40_000];
    assert_eq!(image.read(20_000, &mut buf).unwrap(), 40_000);
    assert_eq!(buf, data[20_000..60_000]);

    // byte-for-byte check of the whole image
    let mut whole = vec![0u8; data.len()];
    assert_eq!(image.read(0, &mut whole).unwrap(), data.len());
    assert_eq!(whole, data);
}

#[test]
fn test_ewf_partial_tail_chunk() {
    let dir = tempdir().unwrap();
    // 150 sectors: the third chunk is only partially occupied
    let total = 150 * SECTOR as usize;
    let data = pattern(total);
    let tail = &data[2 * CHUNK..];
    let segment = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((3, SECTORS_PER_CHUNK, SECTOR, 150)),
        chunks: vec![
            (&data[..CHUNK], true),
            (&data[CHUNK..2 * CHUNK], true),
            (tail, false),
        ],
        last: true,
    });
    let path = write_file(&dir.path().join("case.E01"), &segment);

    let image = Image::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(image.size(), total as u64);

    let mut buf = vec![0u8; 100];
    assert_eq!(image.read(total as u64 - 1, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], data[total - 1]);

    let mut whole = vec![0u8; total];
    assert_eq!(image.read(0, &mut whole).unwrap(), total);
    assert_eq!(whole, data);
}

#[test]
fn test_ewf_multi_segment_discovery() {
    let dir = tempdir().unwrap();
    let data = pattern(CHUNK * 4);
    let first = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((4, SECTORS_PER_CHUNK, SECTOR, 4 * SECTORS_PER_CHUNK)),
        chunks: vec![(&data[..CHUNK], true), (&data[CHUNK..2 * CHUNK], true)],
        last: false,
    });
    let second = build_segment(&SegmentLayout {
        number: 2,
        volume: None,
        chunks: vec![
            (&data[2 * CHUNK..3 * CHUNK], false),
            (&data[3 * CHUNK..], true),
        ],
        last: true,
    });
    let path = write_file(&dir.path().join("case.E01"), &first);
    write_file(&dir.path().join("case.E02"), &second);

    let image = Image::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(image.segment_paths().len(), 2);
    assert_eq!(image.size(), data.len() as u64);

    // read spanning the segment boundary
    let mut buf = vec![0u8; 20_000];
    let offset = 2 * CHUNK as u64 - 10_000;
    assert_eq!(image.read(offset, &mut buf).unwrap(), 20_000);
    assert_eq!(buf, data[offset as usize..offset as usize + 20_000]);
}

#[test]
fn test_ewf_bad_signature_errors() {
    let dir = tempdir().unwrap();
    let data = pattern(CHUNK);
    let mut segment = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((1, SECTORS_PER_CHUNK, SECTOR, SECTORS_PER_CHUNK)),
        chunks: vec![(&data, true)],
        last: true,
    });
    // valid signature but corrupt header fields
    segment[8] = 9;
    let path = write_file(&dir.path().join("case.E01"), &segment);
    let err = Image::open(&path, OpenOptions::default()).unwrap_err();
    assert!(matches!(err, ImageError::DriverIo(_)));
    assert!(err.to_string().contains("E01"));
}

#[test]
fn test_ewf_truncated_image_errors() {
    let dir = tempdir().unwrap();
    let data = pattern(CHUNK);
    let segment = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((1, SECTORS_PER_CHUNK, SECTOR, SECTORS_PER_CHUNK)),
        chunks: vec![(&data, true)],
        last: true,
    });
    // cut the file inside the chunk table
    let path = write_file(&dir.path().join("case.E01"), &segment[..segment.len() - 100]);
    assert!(Image::open(&path, OpenOptions::default()).is_err());
}

#[test]
fn test_ewf_geometry_mismatch_errors() {
    let dir = tempdir().unwrap();
    let data = pattern(CHUNK);
    // geometry claims two chunks, table carries one
    let segment = build_segment(&SegmentLayout {
        number: 1,
        volume: Some((2, SECTORS_PER_CHUNK, SECTOR, 2 * SECTORS_PER_CHUNK)),
        chunks: vec![(&data, true)],
        last: true,
    });
    let path = write_file(&dir.path().join("case.E01"), &segment);
    let err = Image::open(&path, OpenOptions::default()).unwrap_err();
    assert!(err.to_string().contains("chunks"));
}
