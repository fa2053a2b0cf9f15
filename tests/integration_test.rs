use proptest::prelude::*;
use sfv6::assets::{pack, unpack, AssetsError, PackOptions, UnpackOptions};
use sfv6::header::{ContainerHeader, HeaderError, HEADER_SIZE};
use sfv6::manifest::Manifest;
use sfv6::reader::Endian;
use sfv6::recovery::{recover, ObjectRecord, RecordLayout, RecordTail, ScanConfig};
use std::fs;
use std::path::Path;
use tempfile::{tempdir, NamedTempFile};

// ── Synthetic container builder ──────────────────────────────────────────────

struct Obj {
    path_id: i64,
    payload: Vec<u8>,
}

fn le_string(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(s.as_bytes());
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

fn node(out: &mut Vec<u8>, ty: &str, name: &str, children: i32) {
    for s in [ty, name] {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    for v in [-1i32, 0, 0, 1, 0, children] {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Little-endian type trees: one class whose only field is `m_Name`.
fn type_trees() -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&1i32.to_le_bytes());
    node(&mut out, "NamedObject", "Base", 1);
    node(&mut out, "string", "m_Name", 0);
    out
}

/// Header, payloads packed 4-aligned from the data base, then metadata
/// (type trees, object table, an empty trailing list).
fn build(objs: &[Obj], layout: RecordLayout, tamper: impl Fn(&mut [ObjectRecord])) -> Vec<u8> {
    let mut data = Vec::new();
    let mut records = Vec::new();
    for o in objs {
        while data.len() % 4 != 0 {
            data.push(0);
        }
        records.push(ObjectRecord {
            path_id:    o.path_id,
            offset:     data.len() as u32,
            size:       o.payload.len() as u32,
            type_index: 0,
            tail:       RecordTail::None,
        });
        data.extend_from_slice(&o.payload);
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }
    tamper(&mut records);

    let mut meta = type_trees();
    meta.extend_from_slice(&(records.len() as i32).to_le_bytes());
    for rec in &records {
        let mut slot = vec![0u8; layout.width()];
        layout.encode(rec, Endian::Little, &mut slot).unwrap();
        meta.extend_from_slice(&slot);
    }
    meta.extend_from_slice(&0i32.to_le_bytes());

    let file_size = (HEADER_SIZE + data.len() + meta.len()) as u32;
    let mut out = ContainerHeader::new(meta.len() as u32, file_size).to_bytes().to_vec();
    out.extend_from_slice(&data);
    out.extend_from_slice(&meta);
    out
}

fn named(path_id: i64, name: &str, extra: &[u8]) -> Obj {
    let mut payload = le_string(name);
    payload.extend_from_slice(extra);
    Obj { path_id, payload }
}

/// pathIds 100..=102 at offsets 0, 8, 20 with sizes 8, 11, 16.
fn three_objects() -> Vec<Obj> {
    vec![
        named(100, "Rock", &[]),
        named(101, "Tree", &[1, 2, 3]),
        named(102, "Lamp post", &[]),
    ]
}

fn write_container(bytes: &[u8]) -> NamedTempFile {
    let f = NamedTempFile::new().unwrap();
    fs::write(f.path(), bytes).unwrap();
    f
}

fn manifest_of(dir: &Path) -> Manifest {
    Manifest::from_bytes(&fs::read(dir.join("manifest.json")).unwrap()).unwrap()
}

// ── Recovery ─────────────────────────────────────────────────────────────────

#[test]
fn recovers_exact_layout() {
    let mut meta = vec![0xEEu8; 11];
    meta.extend_from_slice(&3i32.to_le_bytes());
    for (pid, off, size) in [(100i32, 0u32, 8u32), (101, 8, 8), (102, 16, 4)] {
        meta.extend_from_slice(&pid.to_le_bytes());
        meta.extend_from_slice(&off.to_le_bytes());
        meta.extend_from_slice(&size.to_le_bytes());
        meta.extend_from_slice(&0i32.to_le_bytes());
    }

    let t = recover(&meta, Endian::Little, 0, 20, &ScanConfig::default()).unwrap();
    assert_eq!(t.table_offset, 11);
    assert_eq!(t.layout.width(), 16);
    assert_eq!(t.count, 3);
    let got: Vec<_> = t.entries.iter().map(|r| (r.path_id, r.offset, r.size)).collect();
    assert_eq!(got, vec![(100, 0, 8), (101, 8, 8), (102, 16, 4)]);
}

#[test]
fn unpack_names_objects_and_writes_manifest() {
    let src = write_container(&build(&three_objects(), RecordLayout::Compact, |_| {}));
    let dir = tempdir().unwrap();

    let s = unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    assert_eq!(s.objects, 3);
    assert_eq!(s.named, 3);
    assert_eq!(s.layout, "compact");

    let objects = dir.path().join("objects");
    assert!(objects.join("00000__pid-100__typ-0__Rock.bin").is_file());
    assert!(objects.join("00002__pid-102__typ-0__Lamp_post.bin").is_file());
    assert_eq!(fs::read(objects.join("00001__pid-101__typ-0__Tree.bin")).unwrap().len(), 11);

    let m = manifest_of(dir.path());
    assert_eq!(m.count, 3);
    assert_eq!(m.data_base, 20);
    assert_eq!(m.entries[2].offset, 20);
    assert_eq!(m.entries[2].name.as_deref(), Some("Lamp post"));
    assert_eq!(fs::read(dir.path().join("metadata.bin")).unwrap().len(), m.meta_size as usize);
}

#[test]
fn unpack_without_names() {
    let src = write_container(&build(&three_objects(), RecordLayout::Compact, |_| {}));
    let dir = tempdir().unwrap();
    let opts = UnpackOptions { extract_names: false, ..UnpackOptions::default() };
    let s = unpack(src.path(), dir.path(), &opts).unwrap();
    assert_eq!(s.named, 0);
    assert!(dir.path().join("objects/00000__pid-100__typ-0.bin").is_file());
}

#[test]
fn out_of_bounds_entry_writes_nothing() {
    let objs: Vec<_> = (0..20).map(|i| Obj { path_id: 100 + i, payload: vec![i as u8; 24] }).collect();
    let bytes = build(&objs, RecordLayout::Compact, |recs| recs[19].offset = 1000);
    let src = write_container(&bytes);
    let dir = tempdir().unwrap();

    let err = unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap_err();
    assert!(matches!(err, AssetsError::DataRangeOutOfBounds { index: 19, path_id: 119, .. }));
    assert!(!dir.path().join("objects").exists());
    assert!(!dir.path().join("manifest.json").exists());
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn roundtrip_is_byte_identical() {
    let original = build(&three_objects(), RecordLayout::Compact, |_| {});
    let src = write_container(&original);
    let d1 = tempdir().unwrap();
    unpack(src.path(), d1.path(), &UnpackOptions::default()).unwrap();

    let rebuilt = NamedTempFile::new().unwrap();
    let s = pack(d1.path(), rebuilt.path(), &PackOptions::default()).unwrap();
    assert!(!s.relocated);
    assert_eq!(s.from_source, 0);
    assert_eq!(fs::read(rebuilt.path()).unwrap(), original);

    let d2 = tempdir().unwrap();
    unpack(rebuilt.path(), d2.path(), &UnpackOptions::default()).unwrap();
    assert_eq!(
        fs::read(d1.path().join("manifest.json")).unwrap(),
        fs::read(d2.path().join("manifest.json")).unwrap()
    );
}

#[test]
fn substituted_payload_shifts_later_objects() {
    let src = write_container(&build(&three_objects(), RecordLayout::Compact, |_| {}));
    let d1 = tempdir().unwrap();
    unpack(src.path(), d1.path(), &UnpackOptions::default()).unwrap();
    let before = manifest_of(d1.path());

    let replaced = d1.path().join("objects").join(&before.entries[1].file);
    fs::write(&replaced, [9u8, 9, 9, 9, 9]).unwrap();

    let rebuilt = NamedTempFile::new().unwrap();
    pack(d1.path(), rebuilt.path(), &PackOptions::default()).unwrap();
    let d2 = tempdir().unwrap();
    unpack(rebuilt.path(), d2.path(), &UnpackOptions::default()).unwrap();
    let after = manifest_of(d2.path());

    assert_eq!((after.entries[0].path_id, after.entries[0].offset, after.entries[0].size), (100, 0, 8));
    assert_eq!((after.entries[1].path_id, after.entries[1].size), (101, 5));
    let delta = 8 - 12; // 11 -> 5 bytes, each rounded up to 4
    assert_eq!(after.entries[2].path_id, 102);
    assert_eq!(after.entries[2].offset as i64, before.entries[2].offset as i64 + delta);
    assert_eq!(after.entries[2].size, 16);
}

#[test]
fn header_prefixed_metadata_packs_identically() {
    let original = build(&three_objects(), RecordLayout::Compact, |_| {});
    let src = write_container(&original);
    let dir = tempdir().unwrap();
    unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();

    let meta_path = dir.path().join("metadata.bin");
    let mut prefixed = original[..HEADER_SIZE].to_vec();
    prefixed.extend_from_slice(&fs::read(&meta_path).unwrap());
    fs::write(&meta_path, prefixed).unwrap();

    let rebuilt = NamedTempFile::new().unwrap();
    pack(dir.path(), rebuilt.path(), &PackOptions::default()).unwrap();
    assert_eq!(fs::read(rebuilt.path()).unwrap(), original);
}

#[test]
fn truncated_metadata_is_rejected() {
    let src = write_container(&build(&three_objects(), RecordLayout::Compact, |_| {}));
    let dir = tempdir().unwrap();
    unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    let meta_path = dir.path().join("metadata.bin");
    let meta = fs::read(&meta_path).unwrap();
    fs::write(&meta_path, &meta[..meta.len() - 1]).unwrap();

    let out = NamedTempFile::new().unwrap();
    let err = pack(dir.path(), out.path(), &PackOptions::default()).unwrap_err();
    assert!(matches!(err, AssetsError::MetadataSizeMismatch { .. }));
}

#[test]
fn missing_payload_falls_back_to_source() {
    let original = build(&three_objects(), RecordLayout::Compact, |_| {});
    let src = write_container(&original);
    let dir = tempdir().unwrap();
    unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    let m = manifest_of(dir.path());
    fs::remove_file(dir.path().join("objects").join(&m.entries[1].file)).unwrap();

    let out = NamedTempFile::new().unwrap();
    let err = pack(dir.path(), out.path(), &PackOptions::default()).unwrap_err();
    assert!(matches!(err, AssetsError::ManifestMismatch { expected: 3, found: 2, .. }));

    let opts = PackOptions { source: Some(src.path().to_owned()), ..PackOptions::default() };
    let s = pack(dir.path(), out.path(), &opts).unwrap();
    assert_eq!(s.from_source, 1);
    assert_eq!(fs::read(out.path()).unwrap(), original);
}

#[test]
fn long_path_ids_roundtrip() {
    let objs = vec![
        named(-7_545_636_390_849_209_228, "Rock", &[]),
        named(5, "Tree", &[1, 2, 3]),
        named(1 << 40, "Lamp post", &[]),
    ];
    let original = build(&objs, RecordLayout::LongPathId, |_| {});
    let src = write_container(&original);
    let dir = tempdir().unwrap();
    let s = unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    assert_eq!(s.layout, "longPathId");

    let m = manifest_of(dir.path());
    assert_eq!(m.path_id_width, 8);
    assert_eq!(m.entries[0].path_id, -7_545_636_390_849_209_228);
    assert_eq!(m.entries[2].path_id, 1 << 40);

    let out = NamedTempFile::new().unwrap();
    pack(dir.path(), out.path(), &PackOptions::default()).unwrap();
    assert_eq!(fs::read(out.path()).unwrap(), original);
}

#[test]
fn repeated_unpack_replaces_old_object_files() {
    let original = build(&three_objects(), RecordLayout::Compact, |_| {});
    let src = write_container(&original);
    let dir = tempdir().unwrap();
    unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    let opts = UnpackOptions { extract_names: false, ..UnpackOptions::default() };
    unpack(src.path(), dir.path(), &opts).unwrap();

    let files = fs::read_dir(dir.path().join("objects")).unwrap().count();
    assert_eq!(files, 3);
    assert!(!dir.path().join("objects/00000__pid-100__typ-0__Rock.bin").exists());

    let out = NamedTempFile::new().unwrap();
    pack(dir.path(), out.path(), &PackOptions::default()).unwrap();
    assert_eq!(fs::read(out.path()).unwrap(), original);
}

#[test]
fn unrelated_source_is_rejected() {
    let src = write_container(&build(&three_objects(), RecordLayout::Compact, |_| {}));
    let dir = tempdir().unwrap();
    unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
    let m = manifest_of(dir.path());
    fs::remove_file(dir.path().join("objects").join(&m.entries[0].file)).unwrap();

    let mut objs = three_objects();
    objs[2] = named(102, "Lamp", &[]);
    let other = write_container(&build(&objs, RecordLayout::Compact, |_| {}));

    let out = NamedTempFile::new().unwrap();
    let opts = PackOptions { source: Some(other.path().to_owned()), ..PackOptions::default() };
    let err = pack(dir.path(), out.path(), &opts).unwrap_err();
    assert!(matches!(err, AssetsError::ManifestMismatch { expected: 3, found: 2, .. }));
}

#[test]
fn record_tails_survive_roundtrip() {
    let cases = [
        (RecordLayout::Packed, RecordTail::Packed { class_id: 1, flags: 7 }),
        (RecordLayout::Wide, RecordTail::Wide { class_id: 1, flags: -1 }),
    ];
    for (layout, tail) in cases {
        let original = build(&three_objects(), layout, |recs| {
            for r in recs.iter_mut() {
                r.tail = tail;
            }
        });
        let src = write_container(&original);
        let dir = tempdir().unwrap();
        let s = unpack(src.path(), dir.path(), &UnpackOptions::default()).unwrap();
        assert_eq!(s.layout, layout.name());
        assert_eq!(s.named, 3);

        let m = manifest_of(dir.path());
        assert!(m.entries.iter().all(|e| e.tail == tail));

        let out = NamedTempFile::new().unwrap();
        pack(dir.path(), out.path(), &PackOptions::default()).unwrap();
        assert_eq!(fs::read(out.path()).unwrap(), original);
    }
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn header_bounds_hold_whenever_parse_succeeds(
        meta_size   in 0u32..256,
        file_size   in 0u32..256,
        data_offset in prop_oneof![Just(0u32), 0u32..256],
        len         in 0usize..300,
    ) {
        let mut hdr = ContainerHeader::new(meta_size, file_size);
        hdr.data_offset = data_offset;
        let mut buf = vec![0u8; len];
        let n = len.min(HEADER_SIZE);
        buf[..n].copy_from_slice(&hdr.to_bytes()[..n]);

        match ContainerHeader::parse(&buf) {
            Ok(h) => {
                prop_assert!(h.meta_size <= h.file_size);
                prop_assert!(h.file_size as usize <= len);
                prop_assert!(h.data_base() >= HEADER_SIZE as u64);
                prop_assert!(h.data_base() <= h.meta_start());
            }
            Err(HeaderError::Truncated(_)) => prop_assert!(len < HEADER_SIZE),
            Err(e) => {
                prop_assert!(matches!(e, HeaderError::CorruptHeader { .. }), "expected CorruptHeader, got {:?}", e);
                prop_assert!(len >= HEADER_SIZE);
            }
        }
        if len >= HEADER_SIZE && meta_size > file_size {
            let is_corrupt = matches!(ContainerHeader::parse(&buf), Err(HeaderError::CorruptHeader { .. }));
            prop_assert!(is_corrupt);
        }
    }

    #[test]
    fn recovered_tables_meet_threshold(
        meta     in proptest::collection::vec(any::<u8>(), 0..400),
        data_len in 0u64..2048,
    ) {
        let cfg = ScanConfig::default();
        if let Ok(t) = recover(&meta, Endian::Little, 0, data_len, &cfg) {
            prop_assert!(t.valid_ratio >= cfg.accept_ratio);
            let valid = t.entries.iter().filter(|r| r.is_plausible(data_len)).count();
            prop_assert!(valid as f64 >= cfg.accept_ratio * t.count as f64);
        }
    }
}
