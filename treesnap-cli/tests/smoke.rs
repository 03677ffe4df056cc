use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::process::Command;

fn write_random(path: &std::path::Path, bytes: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    std::fs::write(path, data).unwrap();
}

fn treesnap() -> Command {
    Command::cargo_bin("treesnap").unwrap()
}

#[test]
fn generate_minimize_apply_verify() {
    let td = assert_fs::TempDir::new().unwrap();
    let runtime = td.child("runtime");
    runtime.child("usr/lib").create_dir_all().unwrap();
    runtime.child("etc").create_dir_all().unwrap();
    write_random(runtime.child("usr/lib/libbig.so").path(), 256 * 1024, 1);
    write_random(runtime.child("usr/lib/libsmall.so").path(), 100, 2);
    runtime.child("etc/empty.conf").touch().unwrap();
    std::os::unix::fs::symlink("libbig.so", runtime.child("usr/lib/libbig.so.1").path()).unwrap();

    treesnap()
        .current_dir(td.path())
        .args(["generate", "runtime", "--output", "runtime.mtree.gz", "--reference-store", "store", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"files\": 4"))
        .stdout(predicate::str::contains("\"objects_added\": 2"));

    treesnap()
        .current_dir(td.path())
        .args(["verify", "runtime.mtree.gz", "runtime"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    treesnap()
        .current_dir(td.path())
        .args(["apply", "runtime.mtree.gz", "copy", "store"])
        .assert()
        .success();
    treesnap()
        .current_dir(td.path())
        .args(["verify", "runtime.mtree.gz", "copy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    treesnap().current_dir(td.path()).args(["minimize", "runtime"]).assert().success();
    runtime.child("usr/lib/libbig.so.1").assert(predicate::path::missing());
    runtime.child("etc/empty.conf").assert(predicate::path::missing());
    runtime.child("etc").assert(predicate::path::missing());
    runtime.child("usr/lib/libbig.so").assert(predicate::path::is_file());

    treesnap()
        .current_dir(td.path())
        .args(["apply", "runtime.mtree.gz", "runtime", "store"])
        .assert()
        .success();
    treesnap()
        .current_dir(td.path())
        .args(["verify", "runtime.mtree.gz", "runtime"])
        .assert()
        .success();
}

#[test]
fn verify_fails_on_mismatch() {
    let td = assert_fs::TempDir::new().unwrap();
    let root = td.child("root");
    root.create_dir_all().unwrap();
    root.child("a").write_str("alpha").unwrap();

    treesnap()
        .current_dir(td.path())
        .args(["generate", "root", "-o", "m.gz"])
        .assert()
        .success();
    root.child("b").write_str("beta").unwrap();
    treesnap()
        .current_dir(td.path())
        .args(["verify", "m.gz", "root"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("./b: not in manifest"))
        .stderr(predicate::str::contains("mismatches"));
}

#[test]
fn apply_without_store_fails() {
    let td = assert_fs::TempDir::new().unwrap();
    let root = td.child("root");
    root.create_dir_all().unwrap();
    root.child("data").write_str("payload").unwrap();
    treesnap()
        .current_dir(td.path())
        .args(["generate", "root", "-o", "m.gz"])
        .assert()
        .success();

    treesnap()
        .current_dir(td.path())
        .args(["apply", "m.gz", "dest"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no reference store given"));
}

#[test]
fn corrupt_manifest_names_the_line() {
    let td = assert_fs::TempDir::new().unwrap();
    td.child("m").write_str("#mtree v2.0\n. type=dir\n./x type=door\n").unwrap();
    treesnap()
        .current_dir(td.path())
        .args(["apply", "m", "dest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 3"))
        .stderr(predicate::str::contains("unsupported type=door"));
}

#[test]
fn cheap_copy_with_usrmerge() {
    let td = assert_fs::TempDir::new().unwrap();
    let src = td.child("src");
    src.child("bin").create_dir_all().unwrap();
    src.child("usr/bin").create_dir_all().unwrap();
    src.child("bin/less").write_str("less").unwrap();
    std::os::unix::fs::symlink("/bin/less", src.child("usr/bin/less").path()).unwrap();

    treesnap()
        .current_dir(td.path())
        .args(["cheap-copy", "--usrmerge", "src", "dest"])
        .assert()
        .success()
        .stderr(predicate::str::contains("hard_linked: 1"))
        .stderr(predicate::str::contains("redundant_symlinks: 1"))
        .stderr(predicate::str::contains("CopySummary").not());
    let bin = std::fs::read_link(td.child("dest/bin").path()).unwrap();
    assert_eq!(bin, std::path::Path::new("usr/bin"));
    td.child("dest/usr/bin/less").assert("less");

    // Second copy into the now non-empty destination is refused.
    treesnap()
        .current_dir(td.path())
        .args(["cheap-copy", "src", "dest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not empty"));

    treesnap()
        .current_dir(td.path())
        .args(["cheap-copy", "--copy", "src", "copied"])
        .assert()
        .success()
        .stderr(predicate::str::contains("copied: 1"))
        .stderr(predicate::str::contains("hard_linked: 0"));
}
