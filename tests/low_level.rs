//! End-to-end tests of the file engine: framing, block round trips,
//! storage classes, and in-place updates.

use std::rc::Rc;

use asdf::block::checksum;
use asdf::{
    ArrayStorage, AsdfError, AsdfFile, BlockKey, BlockSource, Compression, ExtensionList, Hook,
    HookKind, InputStream, Mapping, MemoryIo, Mode, NdArray, OpenOptions, Pad, Value,
    WriteOptions,
};
use tempfile::tempdir;

const BLOCK_MAGIC: [u8; 4] = [0xd3, 0x42, 0x4c, 0x4b];

fn rw() -> OpenOptions {
    OpenOptions {
        mode: Mode::ReadWrite,
        ..OpenOptions::default()
    }
}

fn padded() -> WriteOptions {
    WriteOptions {
        pad_blocks: Pad::Default,
        ..WriteOptions::default()
    }
}

fn arange(n: i64, factor: i64) -> NdArray {
    NdArray::from_vec_i64(&(0..n).map(|i| i * factor).collect::<Vec<_>>())
}

/// `science_data`, a contiguous subset view, a strided view, and an
/// unrelated small array.
fn small_tree() -> Mapping {
    let x = NdArray::from_vec_f64(&(0..10).map(|i| i as f64).collect::<Vec<_>>());
    let mut tree = Mapping::new();
    tree.insert("science_data", x.clone());
    tree.insert("subset", x.slice(3, 7));
    tree.insert("skipping", x.step_by(2));
    tree.insert(
        "not_shared",
        NdArray::from_vec_u8(&(1..=10).rev().collect::<Vec<_>>()),
    );
    tree
}

fn update_tree() -> Mapping {
    let mut tree = Mapping::new();
    tree.insert(
        "arrays",
        vec![
            Value::Array(arange(64, 1)),
            Value::Array(arange(64, 2)),
            Value::Array(arange(64, 3)),
        ],
    );
    tree
}

fn tree_array(ff: &AsdfFile, index: usize) -> NdArray {
    ff.tree()
        .get("arrays")
        .and_then(Value::as_seq)
        .and_then(|s| s.get(index))
        .and_then(Value::as_array)
        .expect("array in tree")
        .clone()
}

fn internal_offset(ff: &AsdfFile, source: usize) -> u64 {
    ff.blocks()
        .get(BlockKey::Index(source))
        .expect("block by source index")
        .offset()
        .expect("block has an offset")
}

// ── Header handling ──────────────────────────────────────────────────────────

#[test]
fn not_an_asdf_file() {
    for content in [
        b"What? This ain't no ASDF file".to_vec(),
        b"SIMPLE".to_vec(),
        b"SIMPLE\n".to_vec(),
    ] {
        let err = AsdfFile::open_bytes(content, OpenOptions::default());
        assert!(matches!(err, Err(AsdfError::NotAsdf)));
    }
}

#[test]
fn garbage_after_header() {
    let err = AsdfFile::open_bytes(b"#ASDF 0.1.0\nFOO".to_vec(), OpenOptions::default());
    assert!(matches!(err, Err(AsdfError::GarbageAfterHeader)));
}

#[test]
fn empty_file_has_empty_tree() {
    let ff = AsdfFile::open_bytes(b"#ASDF 0.1.0\n".to_vec(), OpenOptions::default()).unwrap();
    assert!(ff.tree().is_empty());
    assert_eq!(ff.blocks().len(), 0);
}

#[test]
fn yaml_without_end_marker_is_rejected() {
    let content = b"#ASDF 0.1.0
%YAML 1.1
%TAG ! tag:stsci.edu:asdf/0.1.0/
--- !core/asdf
foo: bar...baz
baz: 42
    "
    .to_vec();
    assert!(AsdfFile::open_bytes(content.clone(), OpenOptions::default()).is_err());

    let stream = InputStream::new(Box::new(std::io::Cursor::new(content)), None);
    assert!(AsdfFile::open_stream(Box::new(stream), OpenOptions::default()).is_err());
}

#[test]
fn yaml_end_marker_without_final_newline() {
    let content = b"#ASDF 0.1.0
%YAML 1.1
%TAG ! tag:stsci.edu:asdf/0.1.0/
--- !core/asdf
foo: bar
baz: 42
..."
    .to_vec();
    let ff = AsdfFile::open_bytes(content.clone(), OpenOptions::default()).unwrap();
    assert_eq!(ff.tree().len(), 2);
    assert_eq!(ff.tree().get("baz").and_then(Value::as_i64), Some(42));

    let stream = InputStream::new(Box::new(std::io::Cursor::new(content)), None);
    let ff = AsdfFile::open_stream(Box::new(stream), OpenOptions::default()).unwrap();
    assert_eq!(ff.tree().len(), 2);
}

#[test]
fn yaml_without_blocks_ignores_trailing_garbage() {
    let content = b"#ASDF 0.1.0
%YAML 1.1
%TAG ! tag:stsci.edu:asdf/0.1.0/
--- !core/asdf
foo: bar
...
XXXXXXXX
    "
    .to_vec();
    let ff = AsdfFile::open_bytes(content.clone(), OpenOptions::default()).unwrap();
    assert_eq!(ff.blocks().len(), 0);
    assert_eq!(ff.tree().get("foo").and_then(Value::as_str), Some("bar"));

    let stream = InputStream::new(Box::new(std::io::Cursor::new(content)), None);
    let ff = AsdfFile::open_stream(Box::new(stream), OpenOptions::default()).unwrap();
    assert_eq!(ff.blocks().len(), 0);
}

// ── Block framing ────────────────────────────────────────────────────────────

#[test]
fn mismatched_magic_after_block_is_rejected() {
    let mut content = b"#ASDF 0.1.0\n".to_vec();
    content.extend_from_slice(&BLOCK_MAGIC);
    content.extend_from_slice(&48u16.to_be_bytes());
    let mut header = [0u8; 48];
    header[8..16].copy_from_slice(&1u64.to_be_bytes()); // allocated
    header[16..24].copy_from_slice(&1u64.to_be_bytes()); // used
    header[24..32].copy_from_slice(&1u64.to_be_bytes()); // data
    content.extend_from_slice(&header);
    content.extend_from_slice(b"FOOBAR");

    let err = AsdfFile::open_bytes(content, OpenOptions::default());
    assert!(matches!(err, Err(AsdfError::BadMagic { .. })));
}

#[test]
fn block_header_below_minimum_is_rejected() {
    let mut content = b"#ASDF 0.1.0\n".to_vec();
    content.extend_from_slice(&BLOCK_MAGIC);
    content.extend_from_slice(&[0x00, 0x10]);
    content.extend_from_slice(&[0u8; 64]);

    let err = AsdfFile::open_bytes(content, OpenOptions::default());
    assert!(matches!(err, Err(AsdfError::HeaderTooSmall { .. })));
}

#[test]
fn block_magic_straddling_buffer_boundary() {
    let mut content = b"#ASDF 0.1.0
%YAML 1.1
%TAG ! tag:stsci.edu:asdf/0.1.0/
--- !core/asdf
foo: bar
...
"
    .to_vec();
    // Put the magic one byte before a scan-buffer boundary.
    content.resize(4096 - 2, 0);
    content.extend_from_slice(&BLOCK_MAGIC);
    content.extend_from_slice(&[0x00, 0x30]);
    content.extend_from_slice(&[0u8; 50]);

    let ff = AsdfFile::open_bytes(content.clone(), OpenOptions::default()).unwrap();
    assert_eq!(ff.blocks().len(), 1);

    let stream = InputStream::new(Box::new(std::io::Cursor::new(content)), None);
    let ff = AsdfFile::open_stream(Box::new(stream), OpenOptions::default()).unwrap();
    assert_eq!(ff.blocks().len(), 1);
}

#[test]
fn block_lookup_by_index_uri_and_array() {
    let mem = MemoryIo::new();
    let mut ff = AsdfFile::from_tree(small_tree()).unwrap();
    ff.write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();

    let ff = AsdfFile::open_bytes(mem.contents(), OpenOptions::default()).unwrap();
    assert!(ff.blocks().get(BlockKey::Index(0)).is_ok());
    assert!(matches!(
        ff.blocks().get(BlockKey::Index(2)),
        Err(AsdfError::NotFound(_))
    ));
    assert!(matches!(
        ff.blocks().get(BlockKey::Uri("http://127.0.0.1/")),
        Err(AsdfError::NotFound(_))
    ));

    let science = ff.tree().get("science_data").and_then(Value::as_array).unwrap();
    let block = ff.blocks().get(BlockKey::Array(science)).unwrap();
    assert_eq!(block.storage(), ArrayStorage::Internal);
    let index = ff.blocks().index_of(science.handle()).unwrap();
    assert_eq!(
        ff.blocks().get_source(index).unwrap(),
        BlockSource::Internal(0)
    );
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn views_share_one_block() {
    let mem = MemoryIo::new();
    let mut ff = AsdfFile::from_tree(small_tree()).unwrap();
    ff.write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();

    let ff = AsdfFile::open_bytes(mem.contents(), OpenOptions::default()).unwrap();
    // science_data, subset, and skipping alias one buffer.
    assert_eq!(ff.blocks().internal_count(), 2);

    let science = ff.tree().get("science_data").and_then(Value::as_array).unwrap();
    let subset = ff.tree().get("subset").and_then(Value::as_array).unwrap();
    let skipping = ff.tree().get("skipping").and_then(Value::as_array).unwrap();
    assert_eq!(science.identity(), subset.identity());
    assert_eq!(
        science.to_vec_f64().unwrap(),
        (0..10).map(|i| i as f64).collect::<Vec<_>>()
    );
    assert_eq!(subset.to_vec_f64().unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    assert_eq!(
        skipping.to_vec_f64().unwrap(),
        vec![0.0, 2.0, 4.0, 6.0, 8.0]
    );

    let not_shared = ff.tree().get("not_shared").and_then(Value::as_array).unwrap();
    assert_eq!(
        not_shared.to_vec_i64().unwrap(),
        (1..=10).rev().collect::<Vec<_>>()
    );
}

#[test]
fn inline_storage_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let small = arange(5, 1);
    let mut tree = Mapping::new();
    tree.insert("small", small.clone());
    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.set_array_storage(&small, ArrayStorage::Inline).unwrap();
    ff.write_to_path(&path, &WriteOptions::default()).unwrap();

    // No binary region at all.
    let raw = std::fs::read(&path).unwrap();
    assert!(!raw.windows(4).any(|w| w == BLOCK_MAGIC));

    let mut ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let back = ff.tree().get("small").and_then(Value::as_array).unwrap().clone();
    assert_eq!(back.to_vec_i64().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(ff.get_array_storage(&back), ArrayStorage::Inline);
}

#[test]
fn resolve_and_inline_produces_pure_yaml() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("data", arange(16, 5));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    ff.resolve_and_inline().unwrap();
    let mem = MemoryIo::new();
    ff.write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();

    let raw = mem.contents();
    assert!(!raw.windows(4).any(|w| w == BLOCK_MAGIC));

    let ff = AsdfFile::open_bytes(raw, OpenOptions::default()).unwrap();
    let back = ff.tree().get("data").and_then(Value::as_array).unwrap();
    assert_eq!(
        back.to_vec_i64().unwrap(),
        (0..16).map(|i| i * 5).collect::<Vec<_>>()
    );
}

#[test]
fn auto_inline_applies_to_small_unshared_arrays() {
    let mem = MemoryIo::new();
    let mut tree = Mapping::new();
    tree.insert("tiny", arange(3, 1));
    tree.insert("big", arange(64, 1));
    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.write_to_stream(
        &mut mem.handle(),
        &WriteOptions {
            auto_inline: Some(10),
            ..WriteOptions::default()
        },
    )
    .unwrap();

    let mut ff = AsdfFile::open_bytes(mem.contents(), OpenOptions::default()).unwrap();
    let tiny = ff.tree().get("tiny").and_then(Value::as_array).unwrap().clone();
    let big = ff.tree().get("big").and_then(Value::as_array).unwrap().clone();
    assert_eq!(ff.get_array_storage(&tiny), ArrayStorage::Inline);
    assert_eq!(ff.get_array_storage(&big), ArrayStorage::Internal);
    assert_eq!(tiny.to_vec_i64().unwrap(), vec![0, 1, 2]);
}

#[test]
fn compressed_blocks_round_trip() {
    let mem = MemoryIo::new();
    let zlib_arr = arange(512, 1);
    let bzp2_arr = arange(512, 3);
    let mut tree = Mapping::new();
    tree.insert("zlib", zlib_arr.clone());
    tree.insert("bzp2", bzp2_arr.clone());

    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.set_array_compression(&zlib_arr, Some(Compression::Zlib));
    ff.set_array_compression(&bzp2_arr, Some(Compression::Bzp2));
    ff.write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_bytes(mem.contents(), OpenOptions::default()).unwrap();
    let z = ff.tree().get("zlib").and_then(Value::as_array).unwrap().clone();
    let b = ff.tree().get("bzp2").and_then(Value::as_array).unwrap().clone();
    assert_eq!(ff.get_array_compression(&z), Some(Compression::Zlib));
    assert_eq!(ff.get_array_compression(&b), Some(Compression::Bzp2));
    assert_eq!(z.to_vec_i64().unwrap(), (0..512).collect::<Vec<_>>());
    assert_eq!(
        b.to_vec_i64().unwrap(),
        (0..512).map(|i| i * 3).collect::<Vec<_>>()
    );

    // Compressed payloads are verified against their digests too.
    AsdfFile::open_bytes(
        mem.contents(),
        OpenOptions {
            validate_checksums: true,
            ..OpenOptions::default()
        },
    )
    .unwrap();
}

#[test]
fn write_to_does_not_rebind_the_source(){
    let dir = tempdir().unwrap();
    let first = dir.path().join("test.asdf");
    let second = dir.path().join("test2.asdf");

    let data: Vec<f64> = (0..64).map(|i| i as f64 / 3.0).collect();
    let mut tree = Mapping::new();
    tree.insert("my_array", NdArray::from_vec_f64(&data));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&first, &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_path(&first, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap().clone();
    assert_eq!(arr.to_vec_f64().unwrap(), data);
    ff.write_to_path(&second, &WriteOptions::default()).unwrap();
    // The copy must not disturb reads from the original.
    assert_eq!(arr.to_vec_f64().unwrap(), data);
    ff.close();

    let ff = AsdfFile::open_path(&second, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_f64().unwrap(), data);
}

#[test]
fn storage_setting_is_idempotent() {
    let arr = arange(16, 1);
    let mut tree = Mapping::new();
    tree.insert("a", arr.clone());
    let mut ff = AsdfFile::from_tree(tree).unwrap();

    assert_eq!(ff.get_array_storage(&arr), ArrayStorage::Internal);
    ff.set_array_storage(&arr, ArrayStorage::External).unwrap();
    assert_eq!(ff.get_array_storage(&arr), ArrayStorage::External);
    ff.set_array_storage(&arr, ArrayStorage::External).unwrap();
    assert_eq!(ff.get_array_storage(&arr), ArrayStorage::External);
    ff.set_array_storage(&arr, ArrayStorage::Internal).unwrap();
    assert_eq!(ff.get_array_storage(&arr), ArrayStorage::Internal);
}

#[test]
fn unknown_storage_class_name_is_rejected() {
    assert!(matches!(
        ArrayStorage::from_name("foo"),
        Err(AsdfError::UnknownStorageClass(_))
    ));
    assert_eq!(
        ArrayStorage::from_name("external").unwrap(),
        ArrayStorage::External
    );
}

// ── External storage ─────────────────────────────────────────────────────────

#[test]
fn external_blocks_write_sibling_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let data: Vec<f64> = (0..64).map(|i| (i * 7 % 13) as f64).collect();
    let my_array = NdArray::from_vec_f64(&data);
    let mut tree = Mapping::new();
    tree.insert("my_array", my_array.clone());

    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.set_array_storage(&my_array, ArrayStorage::External).unwrap();
    assert_eq!(ff.get_array_storage(&my_array), ArrayStorage::External);
    ff.write_to_path(&path, &WriteOptions::default()).unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"test0000.asdf".to_string()), "{names:?}");

    // The sibling holds the data; the host file reads it back through
    // the external cache.
    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_f64().unwrap(), data);
    assert_eq!(ff.external_cache().borrow().len(), 1);
}

#[test]
fn external_storage_without_base_uri_fails() {
    let my_array = NdArray::from_vec_f64(&[1.0, 2.0, 3.0]);
    let mut tree = Mapping::new();
    tree.insert("my_array", my_array.clone());

    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.set_array_storage(&my_array, ArrayStorage::External).unwrap();

    let mem = MemoryIo::new();
    let err = ff.write_to_stream(&mut mem.handle(), &WriteOptions::default());
    assert!(matches!(err, Err(AsdfError::NoBaseUri)));
}

// ── In-place updates ─────────────────────────────────────────────────────────

#[test]
fn update_delete_first_array_reuses_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");
    AsdfFile::from_tree(update_tree())
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    ff.tree_mut()
        .get_mut("arrays")
        .and_then(Value::as_seq_mut)
        .unwrap()
        .remove(0);
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), original_size);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(
        tree_array(&ff, 0).to_vec_i64().unwrap(),
        (0..64).map(|i| i * 2).collect::<Vec<_>>()
    );
    assert_eq!(
        tree_array(&ff, 1).to_vec_i64().unwrap(),
        (0..64).map(|i| i * 3).collect::<Vec<_>>()
    );
}

#[test]
fn update_delete_middle_array_keeps_file_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");
    AsdfFile::from_tree(update_tree())
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let kept_offset = internal_offset(&ff, 0);
    ff.tree_mut()
        .get_mut("arrays")
        .and_then(Value::as_seq_mut)
        .unwrap()
        .remove(1);
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), original_size);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(internal_offset(&ff, 0), kept_offset);
    assert_eq!(
        tree_array(&ff, 0).to_vec_i64().unwrap(),
        (0..64).collect::<Vec<_>>()
    );
    assert_eq!(
        tree_array(&ff, 1).to_vec_i64().unwrap(),
        (0..64).map(|i| i * 3).collect::<Vec<_>>()
    );
}

#[test]
fn update_delete_last_array_keeps_file_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");
    AsdfFile::from_tree(update_tree())
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    ff.tree_mut()
        .get_mut("arrays")
        .and_then(Value::as_seq_mut)
        .unwrap()
        .remove(2);
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    // The removed array's block keeps occupying its extent; the block
    // stream must stay contiguous for the sequential reader.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), original_size);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(
        tree_array(&ff, 0).to_vec_i64().unwrap(),
        (0..64).collect::<Vec<_>>()
    );
    assert_eq!(
        tree_array(&ff, 1).to_vec_i64().unwrap(),
        (0..64).map(|i| i * 2).collect::<Vec<_>>()
    );
}

#[test]
fn update_tree_growth_within_padding_keeps_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");
    AsdfFile::from_tree(update_tree())
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let first_offset = internal_offset(&ff, 0);
    ff.tree_mut()
        .insert("extra", vec![Value::Int(0), Value::Int(0)]);
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), original_size);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(internal_offset(&ff, 0), first_offset);
    for (i, factor) in [1i64, 2, 3].iter().enumerate() {
        assert_eq!(
            tree_array(&ff, i).to_vec_i64().unwrap(),
            (0..64).map(|v| v * factor).collect::<Vec<_>>()
        );
    }
}

#[test]
fn update_forced_growth_appends_the_new_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");
    AsdfFile::from_tree(update_tree())
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();
    let original_size = std::fs::metadata(&path).unwrap().len();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let first_offset = internal_offset(&ff, 0);
    let second_offset = internal_offset(&ff, 1);
    ff.tree_mut()
        .get_mut("arrays")
        .and_then(Value::as_seq_mut)
        .unwrap()[2] = Value::Array(arange(2048, 1));
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    assert!(std::fs::metadata(&path).unwrap().len() >= original_size);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(internal_offset(&ff, 0), first_offset);
    assert_eq!(internal_offset(&ff, 1), second_offset);
    assert_eq!(
        tree_array(&ff, 2).to_vec_i64().unwrap(),
        (0..2048).collect::<Vec<_>>()
    );
}

#[test]
fn update_large_tree_growth_falls_back_to_serial() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = update_tree();
    let inline_arr = arange(3, 1);
    tree.get_mut("arrays")
        .and_then(Value::as_seq_mut)
        .unwrap()
        .push(Value::Array(inline_arr.clone()));
    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.set_array_storage(&inline_arr, ArrayStorage::Inline).unwrap();
    ff.write_to_path(&path, &padded()).unwrap();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let orig_offset = internal_offset(&ff, 0);
    let huge: Vec<Value> = std::iter::repeat(Value::Int(0)).take(6000).collect();
    ff.tree_mut().insert("extra", huge);
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    let mut ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    // The grown header pushed every block outward.
    assert!(internal_offset(&ff, 0) >= orig_offset);
    let inline_back = tree_array(&ff, 3);
    assert_eq!(ff.get_array_storage(&inline_back), ArrayStorage::Inline);
    assert_eq!(
        tree_array(&ff, 0).to_vec_i64().unwrap(),
        (0..64).collect::<Vec<_>>()
    );
    assert_eq!(
        tree_array(&ff, 1).to_vec_i64().unwrap(),
        (0..64).map(|v| v * 2).collect::<Vec<_>>()
    );
}

#[test]
fn update_replace_all_arrays() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("my_array", NdArray::from_vec_f64(&vec![1.0; 64 * 64]));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    ff.tree_mut()
        .insert("my_array", NdArray::from_vec_f64(&vec![2.0; 64 * 64]));
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_f64().unwrap(), vec![2.0; 64 * 64]);
}

#[test]
fn update_after_in_memory_mutation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("my_array", NdArray::from_vec_f64(&vec![1.0; 64]));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &padded())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap().clone();
    for i in 0..64 {
        arr.set_f64(&[i], 2.0).unwrap();
    }
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_f64().unwrap(), vec![2.0; 64]);
}

#[test]
fn update_errors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("my_array", arange(16, 1));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    // Read-only handle.
    let mut ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert!(matches!(
        ff.update(&WriteOptions::default()),
        Err(AsdfError::NotWritable)
    ));

    // No associated stream at all.
    let mut detached = AsdfFile::new();
    assert!(matches!(
        detached.update(&WriteOptions::default()),
        Err(AsdfError::NotOpen)
    ));

    // Writable in-memory stream is fine.
    let mem = MemoryIo::new();
    let mut tree = Mapping::new();
    tree.insert("my_array", arange(16, 1));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();
    let mut ff = AsdfFile::open_stream(Box::new(mem.handle()), rw()).unwrap();
    ff.update(&WriteOptions::default()).unwrap();
}

#[test]
fn update_all_external_degrades_to_full_rewrite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("a", arange(32, 1));
    tree.insert("b", arange(32, 2));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    ff.update(&WriteOptions {
        all_array_storage: Some(ArrayStorage::External),
        ..WriteOptions::default()
    })
    .unwrap();
    drop(ff);

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"test0000.asdf".to_string()));
    assert!(names.contains(&"test0001.asdf".to_string()));

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    assert_eq!(ff.blocks().internal_count(), 0);
    let a = ff.tree().get("a").and_then(Value::as_array).unwrap();
    assert_eq!(a.to_vec_i64().unwrap(), (0..32).collect::<Vec<_>>());
}

// ── Checksums ────────────────────────────────────────────────────────────────

#[test]
fn checksums_are_written_and_verified() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let data: Vec<i64> = (0..64).collect();
    let mut tree = Mapping::new();
    tree.insert("my_array", NdArray::from_vec_i64(&data));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let ff = AsdfFile::open_path(
        &path,
        OpenOptions {
            validate_checksums: true,
            ..OpenOptions::default()
        },
    )
    .unwrap();
    let raw: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(ff.blocks().block(0).unwrap().checksum(), checksum(&raw));
    drop(ff);

    // Flip one payload byte on disk; verification must now fail.
    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    bytes[len - 1] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();
    let err = AsdfFile::open_path(
        &path,
        OpenOptions {
            validate_checksums: true,
            ..OpenOptions::default()
        },
    );
    assert!(matches!(err, Err(AsdfError::ChecksumMismatch { .. })));
}

#[test]
fn update_recomputes_checksum_after_mutation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let data: Vec<i64> = (0..64).collect();
    let mut tree = Mapping::new();
    tree.insert("my_array", NdArray::from_vec_i64(&data));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, rw()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap().clone();
    arr.set_i64(&[63], 0).unwrap();
    ff.update(&WriteOptions::default()).unwrap();
    drop(ff);

    let mut mutated = data.clone();
    mutated[63] = 0;
    let raw: Vec<u8> = mutated.iter().flat_map(|v| v.to_le_bytes()).collect();

    let ff = AsdfFile::open_path(
        &path,
        OpenOptions {
            validate_checksums: true,
            ..OpenOptions::default()
        },
    )
    .unwrap();
    assert_eq!(ff.blocks().block(0).unwrap().checksum(), checksum(&raw));
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_i64().unwrap(), mutated);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn lazy_array_after_close_is_invalid() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut tree = Mapping::new();
    tree.insert("my_array", arange(64, 1));
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let mut ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap().clone();
    ff.close();

    assert!(matches!(arr.to_vec_i64(), Err(AsdfError::NotOpen)));
}

#[test]
fn copy_detaches_tree_and_blocks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.asdf");

    let mut inner = Mapping::new();
    inner.insert("bar", "baz");
    let mut tree = Mapping::new();
    tree.insert("my_array", arange(16, 1));
    tree.insert("foo", inner);
    AsdfFile::from_tree(tree)
        .unwrap()
        .write_to_path(&path, &WriteOptions::default())
        .unwrap();

    let ff = AsdfFile::open_path(&path, OpenOptions::default()).unwrap();
    let ff2 = ff.copy().unwrap();

    let arr2 = ff2.tree().get("my_array").and_then(Value::as_array).unwrap();
    arr2.set_i64(&[0], 99).unwrap();
    let arr = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(arr.to_vec_i64().unwrap()[0], 0);
    assert_eq!(arr2.to_vec_i64().unwrap()[0], 99);

    assert!(!ff2.is_open());
    assert_eq!(ff2.blocks().len(), 1);
    assert_eq!(
        ff2.tree().get("foo").and_then(|v| v.get("bar")).and_then(Value::as_str),
        Some("baz")
    );
}

#[test]
fn adopting_a_tree_shares_arrays_but_not_blocks() {
    let my_array = NdArray::from_vec_f64(&[1.0, 2.0, 3.0]);
    let mut tree = Mapping::new();
    tree.insert("my_array", my_array.clone());
    let ff = AsdfFile::from_tree(tree).unwrap();
    let ff2 = AsdfFile::from_file(&ff).unwrap();

    let a1 = ff.tree().get("my_array").and_then(Value::as_array).unwrap();
    let a2 = ff2.tree().get("my_array").and_then(Value::as_array).unwrap();
    assert_eq!(a1.identity(), a2.identity());
    // Same buffer, but each engine tracks it in its own block set.
    assert!(ff.blocks().index_of(a1.handle()).is_some());
    assert!(ff2.blocks().index_of(a2.handle()).is_some());
}

// ── References ───────────────────────────────────────────────────────────────

#[test]
fn references_resolve_across_files_and_into_self() {
    let dir = tempdir().unwrap();
    let ext_path = dir.path().join("ext.asdf");

    let mut ext_tree = Mapping::new();
    ext_tree.insert(
        "data",
        vec![Value::Int(10), Value::Int(20), Value::Int(30)],
    );
    AsdfFile::from_tree(ext_tree)
        .unwrap()
        .write_to_path(&ext_path, &WriteOptions::default())
        .unwrap();

    let ext_uri = format!("file://{}", ext_path.display());
    let mut link = Mapping::new();
    link.insert("$ref", format!("{ext_uri}#data/1"));
    let mut me = Mapping::new();
    me.insert("$ref", "#numbers/0");
    let mut tree = Mapping::new();
    tree.insert("numbers", vec![Value::Int(7)]);
    tree.insert("remote", link);
    tree.insert("local", me);

    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.find_references();
    assert!(matches!(ff.tree().get("remote"), Some(Value::Ref(_))));

    ff.resolve_references().unwrap();
    assert_eq!(ff.tree().get("remote").and_then(Value::as_i64), Some(20));
    assert_eq!(ff.tree().get("local").and_then(Value::as_i64), Some(7));
}

#[test]
fn reference_cycles_terminate() {
    let mut cycle = Mapping::new();
    cycle.insert("$ref", "#loop");
    let mut tree = Mapping::new();
    tree.insert("loop", cycle);

    let mut ff = AsdfFile::from_tree(tree).unwrap();
    ff.find_references();
    ff.resolve_references().unwrap();
    // The cyclic node is left as an unresolved reference.
    assert!(matches!(ff.tree().get("loop"), Some(Value::Ref(_))));
}

// ── Hooks ────────────────────────────────────────────────────────────────────

#[test]
fn pre_write_hook_sees_every_array() {
    use std::cell::Cell;

    let count = Rc::new(Cell::new(0usize));
    let seen = Rc::clone(&count);
    let mut extensions = ExtensionList::builtin();
    extensions.add_hook(
        "core/ndarray",
        HookKind::PreWrite,
        Hook::Observe(Rc::new(move |_| seen.set(seen.get() + 1))),
    );

    let mut ff = AsdfFile::with_extensions(Rc::new(extensions));
    let mut tree = Mapping::new();
    tree.insert("a", arange(4, 1));
    tree.insert("b", arange(4, 2));
    ff.set_tree(tree).unwrap();

    let mem = MemoryIo::new();
    ff.write_to_stream(&mut mem.handle(), &WriteOptions::default())
        .unwrap();
    assert_eq!(count.get(), 2);
}
