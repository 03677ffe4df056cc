mod common;

use std::fs;
use std::path::Path;
use treesnap_core::{apply, generate, ApplyOptions, ScanOptions};

fn write_manifest(path: &Path, body: &str) {
    fs::write(path, format!("#mtree v2.0\n{}", body)).unwrap();
}

#[test]
fn round_trip_through_reference_store() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    common::sample_tree(&src);
    let before = common::snapshot(&src);
    let store = td.path().join("store");
    let manifest = td.path().join("src.mtree.gz");
    generate(&src, &manifest, &ScanOptions { reference_store: Some(store.clone()), ..ScanOptions::default() })
        .unwrap();

    let dest = td.path().join("dest");
    let opts = ApplyOptions { reference_store: Some(store), ..ApplyOptions::default() };
    let summary = apply(&manifest, &dest, &opts).unwrap();
    assert_eq!(summary.hard_links, 1);
    assert_eq!(summary.symlinks, 3);
    assert_eq!(summary.linked_from_store + summary.copied_from_store, 5);

    common::assert_same_tree(&before, &common::snapshot(&dest));
}

#[test]
fn applying_onto_the_minimized_tree_restores_it() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    common::sample_tree(&src);
    let before = common::snapshot(&src);
    let store = td.path().join("store");
    let manifest = td.path().join("src.mtree.gz");
    let scan = ScanOptions { reference_store: Some(store.clone()), minimize: true, ..ScanOptions::default() };
    generate(&src, &manifest, &scan).unwrap();
    assert!(!src.join("usr/lib/libfoo.so").exists());

    let opts = ApplyOptions { reference_store: Some(store), ..ApplyOptions::default() };
    let summary = apply(&manifest, &src, &opts).unwrap();
    // Non-empty files never left; the anchor is the one empty file kept.
    assert_eq!(summary.kept_in_place, 6);

    common::assert_same_tree(&before, &common::snapshot(&src));
}

#[test]
fn missing_store_content_is_an_error() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    common::sample_tree(&src);
    let manifest = td.path().join("m.gz");
    generate(&src, &manifest, &ScanOptions::default()).unwrap();

    let empty_store = td.path().join("store");
    fs::create_dir(&empty_store).unwrap();
    let opts = ApplyOptions { reference_store: Some(empty_store), ..ApplyOptions::default() };
    let err = apply(&manifest, &td.path().join("d1"), &opts).expect_err("store is empty");
    let msg = format!("{:#}", err);
    assert!(msg.contains("missing from reference store"), "{}", msg);
    assert!(msg.contains("line "), "{}", msg);

    let err = apply(&manifest, &td.path().join("d2"), &ApplyOptions::default()).expect_err("no store");
    assert!(format!("{:#}", err).contains("no reference store given"));
}

#[test]
fn optional_entries_without_content_are_skipped() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    write_manifest(
        &manifest,
        &format!(
            ". type=dir mode=755\n./opt type=file mode=644 size=3 sha256={} optional\n./empty type=file mode=600\n",
            "0".repeat(64)
        ),
    );
    let dest = td.path().join("dest");
    let summary = apply(&manifest, &dest, &ApplyOptions::default()).unwrap();
    assert_eq!(summary.skipped_optional, 1);
    assert!(!dest.join("opt").exists());
    assert_eq!(fs::metadata(dest.join("empty")).unwrap().len(), 0);
}

#[test]
fn hard_link_comments_can_be_ignored() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    common::sample_tree(&src);
    let store = td.path().join("store");
    let manifest = td.path().join("m.gz");
    generate(&src, &manifest, &ScanOptions { reference_store: Some(store.clone()), ..ScanOptions::default() })
        .unwrap();

    let dest = td.path().join("dest");
    let opts = ApplyOptions { reference_store: Some(store), hard_links: false };
    let summary = apply(&manifest, &dest, &opts).unwrap();
    assert_eq!(summary.hard_links, 0);
    assert!(dest.join("usr/bin/tool").exists());
    assert!(!dest.join("usr/bin/tool-alias").exists());
}

#[test]
fn bad_line_is_reported_with_its_number() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    write_manifest(&manifest, ". type=dir\n./a type=dir\n./b type=block\n./c type=dir\n");
    let dest = td.path().join("dest");
    let err = apply(&manifest, &dest, &ApplyOptions::default()).expect_err("type=block");
    let msg = format!("{:#}", err);
    assert!(msg.contains("line 4"), "{}", msg);
    assert!(msg.contains("unsupported type=block"), "{}", msg);
    // Entries before the bad line were applied, nothing after it.
    assert!(dest.join("a").is_dir());
    assert!(!dest.join("c").exists());
}

#[test]
fn not_a_manifest() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    fs::write(&manifest, "hello\n").unwrap();
    let err = apply(&manifest, &td.path().join("dest"), &ApplyOptions::default()).expect_err("no header");
    assert!(format!("{:#}", err).contains("not an mtree manifest"));
}

#[test]
fn file_in_the_way_of_a_symlink() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    write_manifest(&manifest, ". type=dir\n./l type=link link=/etc/passwd\n");
    let dest = td.path().join("dest");
    fs::create_dir(&dest).unwrap();
    fs::write(dest.join("l"), b"x").unwrap();
    let err = apply(&manifest, &dest, &ApplyOptions::default()).expect_err("file in the way");
    assert!(format!("{:#}", err).contains("exists and is not a symlink"));
}

#[test]
fn symlink_targets_are_not_validated() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    write_manifest(
        &manifest,
        ". type=dir\n./abs type=link link=/no/such/file\n./rel type=link link=../../outside\n./sp type=link link=a\\040b\n",
    );
    let dest = td.path().join("dest");
    apply(&manifest, &dest, &ApplyOptions::default()).unwrap();
    assert_eq!(fs::read_link(dest.join("abs")).unwrap(), Path::new("/no/such/file"));
    assert_eq!(fs::read_link(dest.join("rel")).unwrap(), Path::new("../../outside"));
    assert_eq!(fs::read_link(dest.join("sp")).unwrap(), Path::new("a b"));
}

#[test]
fn applying_shared_content_leaves_the_scanned_tree_alone() {
    use std::os::unix::fs::MetadataExt;

    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    common::write_file(&src.join("f"), b"hello", 0o644, (1_700_000_000, 5));
    let store = td.path().join("store");
    generate(&src, &td.path().join("src.gz"), &ScanOptions { reference_store: Some(store.clone()), ..ScanOptions::default() })
        .unwrap();

    // Same content, different metadata.
    let other = td.path().join("other");
    write_manifest(
        &other,
        ". type=dir\n./g type=file mode=600 size=5 time=1.000000000 \
         sha256=2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\n",
    );
    let dest = td.path().join("dest");
    let summary = apply(&other, &dest, &ApplyOptions { reference_store: Some(store), ..ApplyOptions::default() })
        .unwrap();
    assert_eq!(summary.linked_from_store, 1);
    assert_eq!(fs::metadata(dest.join("g")).unwrap().mode() & 0o7777, 0o600);

    let md = fs::metadata(src.join("f")).unwrap();
    assert_eq!(md.mode() & 0o7777, 0o644);
    assert_eq!((md.mtime(), md.mtime_nsec()), (1_700_000_000, 5));
}

#[test]
fn content_without_size_is_not_applied_as_an_empty_file() {
    let td = tempfile::tempdir().unwrap();
    let manifest = td.path().join("m");
    write_manifest(
        &manifest,
        ". type=dir\n./g type=file mode=644 \
         sha256=2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\n",
    );
    let dest = td.path().join("dest");
    let err = apply(&manifest, &dest, &ApplyOptions::default()).expect_err("no size=");
    let msg = format!("{:#}", err);
    assert!(msg.contains("line 3"), "{}", msg);
    assert!(!dest.join("g").exists());
}
