use dirpatch::{
    ApplyOptions, CancelToken, DiffOperation, EntryKind, Error, PatchDocument,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Dir,
    File { content: Vec<u8>, executable: bool },
    Link(PathBuf),
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(root).unwrap();
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Node)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Node)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");
        let meta = fs::symlink_metadata(&path).unwrap();

        if meta.file_type().is_symlink() {
            entries.push((rel, Node::Link(fs::read_link(&path).unwrap())));
        } else if meta.is_dir() {
            entries.push((rel, Node::Dir));
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((
                rel,
                Node::File {
                    content,
                    executable: is_executable(&meta),
                },
            ));
        }
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&src_path).unwrap();
        if meta.file_type().is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(&src_path).unwrap(), &dst_path).unwrap();
        } else if meta.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            fs::copy(&src_path, &dst_path).unwrap();
        }
    }
}

fn read_patch(path: &Path) -> PatchDocument {
    dirpatch::codec::decode(&fs::read(path).unwrap()).unwrap()
}

struct Fixture {
    _temp: tempfile::TempDir,
    old: PathBuf,
    new: PathBuf,
    target: PathBuf,
    patch: PathBuf,
}

impl Fixture {
    fn new(old_files: &[(&str, &[u8])], new_files: &[(&str, &[u8])]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let old = temp.path().join("old");
        let new = temp.path().join("new");
        let target = temp.path().join("target");
        let patch = temp.path().join("test.patch");
        create_dir_tree(&old, old_files);
        create_dir_tree(&new, new_files);
        Self {
            _temp: temp,
            old,
            new,
            target,
            patch,
        }
    }

    fn create(&self) -> dirpatch::PatchSummary {
        dirpatch::create_patch(&self.old, &self.new, &self.patch, 3).unwrap()
    }

    fn stage_target(&self) {
        copy_dir_recursive(&self.old, &self.target);
    }
}

#[test]
fn test_end_to_end_full_patch_cycle() {
    let mut modified_bin = vec![0xAA; 4096];
    modified_bin.extend_from_slice(&[0xBB; 4096]);

    let fx = Fixture::new(
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &[0xAA; 8192]),
            ("data/old_file.txt", b"This file will be deleted"),
            ("obsolete/remove_me.txt", b"Going away"),
            ("obsolete/deep/nested.txt", b"Also going away"),
            ("docs/guide.md", b"# Guide\nUnchanged text that moves."),
            ("docs/keep.md", b"stays"),
            ("tools/run.sh", b"#!/bin/sh\necho hi\n"),
        ],
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            ("config/settings.json", b"{\"version\": 2, \"debug\": true, \"newField\": 42}"),
            ("data/records.bin", &modified_bin),
            ("data/new_file.txt", b"Brand new file in version 2"),
            ("extras/bonus.dat", &[0xFF; 1024]),
            ("extras/bonus_copy.dat", &[0xFF; 1024]),
            ("docs/keep.md", b"stays"),
            ("manual/guide.md", b"# Guide\nUnchanged text that moves."),
            ("tools/run.sh", b"#!/bin/sh\necho hi\n"),
        ],
    );
    make_executable(&fx.new.join("tools/run.sh"));
    fx.stage_target();

    let summary = fx.create();
    assert!(fx.patch.exists(), "Patch file should have been created");
    assert_eq!(summary.patch_size, fs::metadata(&fx.patch).unwrap().len());
    assert_eq!(summary.operations.files_moved, 1);
    assert_eq!(summary.operations.files_modified, 3);
    assert_eq!(summary.operations.files_added, 3);
    assert_eq!(summary.operations.directories_added, 2);
    // bonus.dat and bonus_copy.dat share one payload
    assert_eq!(summary.payload_count, 5);

    let report = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(!report.already_applied);
    assert_eq!(report.applied, summary.operations);
    assert!(report.mismatched_paths.is_empty());

    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
    assert!(!fx.target.join("obsolete").exists());
    assert!(!fx.target.join("docs/guide.md").exists());
}

#[test]
fn test_empty_to_full() {
    let fx = Fixture::new(
        &[],
        &[
            ("file1.txt", b"Content of file 1"),
            ("sub/file2.txt", b"Content of file 2"),
            ("sub/empty.txt", b""),
        ],
    );
    fs::create_dir_all(&fx.target).unwrap();
    fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_full_to_empty() {
    let fx = Fixture::new(
        &[("a/b/c.txt", b"c"), ("a/d.txt", b"d"), ("top.txt", b"t")],
        &[],
    );
    fx.stage_target();
    fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(collect_dir_tree(&fx.target).is_empty());
}

#[test]
fn test_no_changes() {
    let files: &[(&str, &[u8])] = &[("a.txt", b"Same content"), ("sub/b.txt", b"Also same")];
    let fx = Fixture::new(files, files);
    fx.stage_target();

    let summary = fx.create();
    assert_eq!(summary.operations.total(), 0);
    assert_eq!(summary.payload_count, 0);

    let report = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(report.total_applied(), 0);
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_reapply_is_noop() {
    let fx = Fixture::new(
        &[("a.txt", b"one"), ("gone/x.txt", b"x"), ("mv_src", b"moving")],
        &[("a.txt", b"two"), ("new/y.txt", b"y"), ("mv_dst", b"moving")],
    );
    fx.stage_target();
    let summary = fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    let after_first = collect_dir_tree(&fx.target);

    // verified re-apply recognises the new tree
    let again = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(again.already_applied);
    assert_eq!(again.total_applied(), 0);

    // unverified re-apply replays every operation as a no-op
    let replay = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    assert_eq!(replay.total_applied(), 0);
    assert_eq!(replay.skipped, summary.operations.total());

    assert_eq!(after_first, collect_dir_tree(&fx.target));
}

#[test]
fn test_patch_is_deterministic() {
    let fx = Fixture::new(
        &[("a", b"1"), ("b", b"1"), ("c/d", b"2"), ("e", b"old")],
        &[("x", b"1"), ("y", b"1"), ("c/d", b"3"), ("z/w", b"2"), ("e", b"new")],
    );
    fx.create();
    let second = fx.patch.with_extension("again");
    dirpatch::create_patch(&fx.old, &fx.new, &second, 3).unwrap();
    assert_eq!(fs::read(&fx.patch).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn test_single_rename_is_one_move() {
    let fx = Fixture::new(&[("x.txt", b"content")], &[("y.txt", b"content")]);
    fx.stage_target();
    fx.create();

    let doc = read_patch(&fx.patch);
    assert_eq!(
        doc.operations,
        vec![DiffOperation::MoveFile {
            from_path: "x.txt".into(),
            to_path: "y.txt".into(),
            mode_bits: dirpatch::ModeBits::Plain,
        }]
    );
    assert!(doc.payload_table.is_empty());

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_add_into_existing_empty_directory() {
    let fx = Fixture::new(&[("a.txt", b"hi")], &[("a.txt", b"hi"), ("b/c.txt", b"new")]);
    fs::create_dir_all(fx.old.join("b")).unwrap();
    fx.create();

    let doc = read_patch(&fx.patch);
    assert_eq!(doc.operations.len(), 1);
    assert!(matches!(&doc.operations[0], DiffOperation::AddFile { path, .. } if path == "b/c.txt"));
}

#[test]
fn test_duplicate_content_stored_once() {
    let blob: Vec<u8> = (0..64 * 1024).map(|i| (i * 7919 % 251) as u8).collect();
    let fx = Fixture::new(&[], &[("one.bin", &blob), ("two.bin", &blob)]);
    fx.create();

    let doc = read_patch(&fx.patch);
    assert_eq!(doc.payload_table.len(), 1);
    let refs: Vec<_> = doc.operations.iter().filter_map(|op| op.payload_ref()).collect();
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0], refs[1]);

    // a single-file patch of the same content is about the same size
    let single = Fixture::new(&[], &[("one.bin", &blob)]);
    let single_summary = single.create();
    let size = fs::metadata(&fx.patch).unwrap().len();
    assert!(size < single_summary.patch_size + 64, "{size} vs {}", single_summary.patch_size);
}

#[test]
fn test_precondition_blocks_changed_target() {
    let fx = Fixture::new(
        &[("keep.txt", b"original"), ("a.txt", b"a")],
        &[("keep.txt", b"original"), ("a.txt", b"a"), ("added.txt", b"new")],
    );
    fx.stage_target();
    fx.create();

    fs::write(fx.target.join("keep.txt"), b"edited by someone else").unwrap();
    let before = collect_dir_tree(&fx.target);

    let err = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap_err();
    assert!(matches!(err, Error::Precondition { .. }), "got {err}");
    assert_eq!(before, collect_dir_tree(&fx.target));
    assert!(!fx.target.join("added.txt").exists());
}

#[test]
fn test_precondition_lists_touched_paths() {
    let fx = Fixture::new(&[("m.txt", b"v1")], &[("m.txt", b"v2")]);
    fx.stage_target();
    fx.create();

    fs::write(fx.target.join("m.txt"), b"local edit").unwrap();
    match dirpatch::apply_patch(&fx.target, &fx.patch, true) {
        Err(Error::Precondition { differing, .. }) => assert_eq!(differing, vec!["m.txt"]),
        other => panic!("expected precondition error, got {other:?}"),
    }
}

#[test]
fn test_subtree_delete_order() {
    let fx = Fixture::new(
        &[
            ("tree/a.txt", b"a"),
            ("tree/sub/b.txt", b"b"),
            ("tree/sub/deeper/c.txt", b"c"),
            ("other.txt", b"o"),
        ],
        &[("other.txt", b"o")],
    );
    fx.stage_target();
    fx.create();

    let doc = read_patch(&fx.patch);
    let deletes: Vec<(&str, EntryKind)> = doc
        .operations
        .iter()
        .filter_map(|op| match op {
            DiffOperation::DeletePath { path, kind } => Some((path.as_str(), *kind)),
            _ => None,
        })
        .collect();
    assert_eq!(deletes.len(), 6);
    assert_eq!(deletes.last(), Some(&("tree", EntryKind::Directory)));
    for (i, (path, kind)) in deletes.iter().enumerate() {
        if *kind == EntryKind::Directory {
            let prefix = format!("{path}/");
            assert!(
                deletes[i + 1..].iter().all(|(p, _)| !p.starts_with(&prefix)),
                "{path} deleted before its contents"
            );
        }
    }

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(!fx.target.join("tree").exists());
}

#[test]
fn test_kind_changes_round_trip() {
    let fx = Fixture::new(
        &[("p", b"file becomes dir"), ("q/inner.txt", b"dir becomes file")],
        &[("p/child.txt", b"child"), ("q", b"now a file")],
    );
    fx.stage_target();
    fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_move_into_new_directory_with_mode_change() {
    let fx = Fixture::new(&[("tool", b"#!/bin/sh\n")], &[("bin/tool", b"#!/bin/sh\n")]);
    make_executable(&fx.new.join("bin/tool"));
    fx.stage_target();
    let summary = fx.create();
    assert_eq!(summary.operations.files_moved, 1);
    assert_eq!(summary.operations.directories_added, 1);

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[cfg(unix)]
#[test]
fn test_chmod_only_round_trip() {
    let fx = Fixture::new(&[("run.sh", b"#!/bin/sh\n")], &[("run.sh", b"#!/bin/sh\n")]);
    make_executable(&fx.new.join("run.sh"));
    fx.stage_target();
    let summary = fx.create();
    assert_eq!(summary.operations.chmod_only, 1);
    assert_eq!(summary.payload_count, 0);

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[cfg(unix)]
#[test]
fn test_symlinks_round_trip() {
    use std::os::unix::fs::symlink;

    let fx = Fixture::new(&[("real.txt", b"r"), ("dir/x", b"x")], &[("real.txt", b"r"), ("dir/x", b"x")]);
    symlink("real.txt", fx.old.join("retarget")).unwrap();
    symlink("dir/x", fx.old.join("removed_link")).unwrap();
    symlink("dir/x", fx.new.join("retarget")).unwrap();
    symlink("dir", fx.new.join("dir_alias")).unwrap();
    fx.stage_target();

    let summary = fx.create();
    assert_eq!(summary.operations.symlinks_added, 2);
    assert_eq!(summary.operations.paths_deleted, 2);

    dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_failed_operation_reports_progress_and_resumes() {
    let fx = Fixture::new(
        &[("a.txt", b"a")],
        &[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")],
    );
    fx.stage_target();
    fx.create();

    // a non-empty directory where c.txt must go makes that write fail
    fs::create_dir_all(fx.target.join("c.txt/blocker")).unwrap();
    let err = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap_err();
    match &err {
        Error::Apply {
            failed, applied, path, ..
        } => {
            assert_eq!(*failed, 1);
            assert_eq!(*applied, 1);
            assert!(path.ends_with("c.txt"), "{}", path.display());
        }
        other => panic!("expected apply error, got {other:?}"),
    }
    assert_eq!(err.last_applied_index(), Some(0));
    assert_eq!(fs::read(fx.target.join("b.txt")).unwrap(), b"b");

    fs::remove_dir_all(fx.target.join("c.txt")).unwrap();
    let report = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied.files_added, 1);
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_verification_failure_leaves_changes_in_place() {
    let fx = Fixture::new(&[("a.txt", b"a")], &[("a.txt", b"a"), ("b.txt", b"b")]);
    fx.stage_target();
    fx.create();

    // same operations, but a new-tree digest the result cannot match
    let doc = read_patch(&fx.patch);
    let payloads: Vec<Vec<u8>> = (0..doc.payload_table.len())
        .map(|i| doc.payload(dirpatch::PayloadRef(i as u32)).unwrap())
        .collect();
    let tampered = dirpatch::codec::encode(
        &doc.operations,
        &payloads,
        doc.old_tree_digest,
        dirpatch::hash::hash_bytes(b"not the new tree"),
        3,
    )
    .unwrap();
    let tampered = dirpatch::codec::decode(&tampered).unwrap();

    let err = dirpatch::apply(&fx.target, &tampered, &ApplyOptions::default()).unwrap_err();
    match err {
        Error::Verification { report, .. } => {
            assert_eq!(report.applied.files_added, 1);
            assert!(report.mismatched_paths.is_empty());
        }
        other => panic!("expected verification error, got {other:?}"),
    }
    assert_eq!(fs::read(fx.target.join("b.txt")).unwrap(), b"b");
}

#[test]
fn test_cancelled_apply_touches_nothing() {
    let fx = Fixture::new(&[("a.txt", b"a")], &[("b.txt", b"b")]);
    fx.stage_target();
    fx.create();

    let cancel = CancelToken::new();
    cancel.cancel();
    let options = ApplyOptions {
        verify: true,
        cancel,
    };
    let err = dirpatch::apply_patch_with(&fx.target, &fx.patch, &options).unwrap_err();
    assert!(matches!(err, Error::Cancelled { completed: 0 }));
    assert_eq!(collect_dir_tree(&fx.old), collect_dir_tree(&fx.target));
}

#[test]
fn test_corrupt_patch_file_rejected() {
    let fx = Fixture::new(&[], &[("data.bin", &[0x42; 2048])]);
    fs::create_dir_all(&fx.target).unwrap();
    dirpatch::create_patch(&fx.old, &fx.new, &fx.patch, -1).unwrap();

    let mut bytes = fs::read(&fx.patch).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&fx.patch, &bytes).unwrap();

    let err = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap_err();
    assert!(matches!(err, Error::CorruptPatch { payload: 0, .. }), "got {err}");
    assert!(collect_dir_tree(&fx.target).is_empty());

    fs::write(&fx.patch, b"").unwrap();
    assert!(matches!(
        dirpatch::apply_patch(&fx.target, &fx.patch, true),
        Err(Error::Format(_))
    ));
}

#[test]
fn test_invalid_level_rejected_before_writing() {
    let fx = Fixture::new(&[("a", b"a")], &[("a", b"b")]);
    let err = dirpatch::create_patch(&fx.old, &fx.new, &fx.patch, 40).unwrap_err();
    assert!(matches!(err, Error::InvalidCompressionLevel(40)));
    assert!(!fx.patch.exists());
}

#[test]
fn test_cli_create_and_apply() {
    let fx = Fixture::new(
        &[("readme.txt", b"v1"), ("old.txt", b"bye")],
        &[("readme.txt", b"v2"), ("sub/new.txt", b"hello")],
    );
    fx.stage_target();
    let exe = env!("CARGO_BIN_EXE_dirpatch");

    let output = Command::new(exe)
        .args(["create", "--old"])
        .arg(&fx.old)
        .arg("--new")
        .arg(&fx.new)
        .arg("--output")
        .arg(&fx.patch)
        .args(["--level", "-1", "--json"])
        .output()
        .expect("Failed to run dirpatch create");
    assert!(
        output.status.success(),
        "dirpatch create failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["operations"]["files_added"], 1);
    assert_eq!(summary["operations"]["paths_deleted"], 1);

    let output = Command::new(exe)
        .args(["apply", "--target"])
        .arg(&fx.target)
        .arg("--patch")
        .arg(&fx.patch)
        .output()
        .expect("Failed to run dirpatch apply");
    assert!(
        output.status.success(),
        "dirpatch apply failed:\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Patch applied successfully!"));
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));

    // a second verified apply is refused with a non-zero exit once the target drifts
    fs::write(fx.target.join("readme.txt"), b"drift").unwrap();
    let output = Command::new(exe)
        .args(["apply", "--target"])
        .arg(&fx.target)
        .arg("--patch")
        .arg(&fx.patch)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_unverified_reapply_across_kind_changes() {
    let fx = Fixture::new(
        &[("p", b"file becomes dir"), ("q/inner.txt", b"dir becomes file")],
        &[("p/child.txt", b"child"), ("q", b"now a file")],
    );
    fx.stage_target();
    let summary = fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    let replay = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    assert_eq!(replay.total_applied(), 0);
    assert_eq!(replay.skipped, summary.operations.total());
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[test]
fn test_resume_after_kind_change_half_applied() {
    let fx = Fixture::new(&[("p", b"file")], &[("p/a.txt", b"a"), ("p/b.txt", b"b")]);
    fx.stage_target();
    fx.create();

    // as if a previous run stopped after p became a directory, with
    // something blocking p/b.txt this time
    fs::remove_file(fx.target.join("p")).unwrap();
    fs::create_dir_all(fx.target.join("p/b.txt/blocker")).unwrap();
    let err = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap_err();
    match err {
        Error::Apply { failed, .. } => assert_eq!(failed, 3),
        other => panic!("expected apply error, got {other:?}"),
    }

    fs::remove_dir_all(fx.target.join("p/b.txt")).unwrap();
    dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));
}

#[cfg(unix)]
#[test]
fn test_unverified_reapply_keeps_retargeted_symlink() {
    use std::os::unix::fs::symlink;

    let fx = Fixture::new(&[("a", b"a"), ("b", b"b")], &[("a", b"a"), ("b", b"b")]);
    symlink("a", fx.old.join("link")).unwrap();
    symlink("b", fx.new.join("link")).unwrap();
    fx.stage_target();
    fx.create();

    dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    let replay = dirpatch::apply_patch(&fx.target, &fx.patch, false).unwrap();
    assert_eq!(replay.total_applied(), 0);
    assert_eq!(replay.skipped, 2);
    assert_eq!(fs::read_link(fx.target.join("link")).unwrap(), PathBuf::from("b"));
}

#[cfg(unix)]
#[test]
fn test_symlink_cannot_redirect_writes_outside_target() {
    let temp = tempfile::tempdir().unwrap();
    let target = temp.path().join("target");
    let outside = temp.path().join("outside");
    fs::create_dir_all(&target).unwrap();
    fs::create_dir_all(&outside).unwrap();

    let ops = vec![
        DiffOperation::AddSymlink {
            path: "s".into(),
            target: outside.to_str().unwrap().into(),
        },
        DiffOperation::AddFile {
            path: "s/planted".into(),
            mode_bits: dirpatch::ModeBits::Plain,
            payload_ref: dirpatch::PayloadRef(0),
        },
    ];
    let bytes = dirpatch::codec::encode(
        &ops,
        &[b"payload".to_vec()],
        dirpatch::Digest::ZERO,
        dirpatch::Digest::ZERO,
        3,
    )
    .unwrap();
    let doc = dirpatch::codec::decode(&bytes).unwrap();
    let options = ApplyOptions {
        verify: false,
        ..Default::default()
    };

    let err = dirpatch::apply(&target, &doc, &options).unwrap_err();
    assert!(matches!(err, Error::OutsideTarget { .. }), "got {err}");
    assert!(!outside.join("planted").exists());
}

#[cfg(unix)]
#[test]
fn test_follow_symlinks_patch_verifies_on_copy() {
    use std::os::unix::fs::symlink;

    let fx = Fixture::new(
        &[("real/f.txt", b"f")],
        &[("real/f.txt", b"f"), ("extra.txt", b"extra")],
    );
    symlink("real", fx.old.join("alias")).unwrap();
    symlink("real", fx.new.join("alias")).unwrap();
    fx.stage_target();

    let options = dirpatch::CreateOptions {
        follow_symlinks: true,
        ..Default::default()
    };
    dirpatch::create_patch_with(&fx.old, &fx.new, &fx.patch, &options).unwrap();

    let report = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(!report.already_applied);
    assert_eq!(report.applied.files_added, 1);
    assert_eq!(collect_dir_tree(&fx.new), collect_dir_tree(&fx.target));

    let again = dirpatch::apply_patch(&fx.target, &fx.patch, true).unwrap();
    assert!(again.already_applied);
}

#[test]
fn test_cancelled_create_writes_nothing() {
    let fx = Fixture::new(&[("a.txt", b"a")], &[("a.txt", b"b"), ("c.txt", b"c")]);
    let options = dirpatch::CreateOptions::default();
    options.cancel.cancel();

    let err = dirpatch::create_patch_with(&fx.old, &fx.new, &fx.patch, &options).unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }), "got {err}");
    assert!(!fx.patch.exists());
}

#[cfg(unix)]
#[test]
fn test_create_reports_symlink_loop() {
    let fx = Fixture::new(&[("d/f.txt", b"f")], &[("d/f.txt", b"f")]);
    std::os::unix::fs::symlink("..", fx.new.join("d/up")).unwrap();
    let options = dirpatch::CreateOptions {
        follow_symlinks: true,
        ..Default::default()
    };

    let err = dirpatch::create_patch_with(&fx.old, &fx.new, &fx.patch, &options).unwrap_err();
    assert!(matches!(err, Error::SymlinkLoop { .. }), "got {err}");
    assert!(!fx.patch.exists());
}

#[cfg(unix)]
#[test]
fn test_backslash_file_name_is_refused() {
    let fx = Fixture::new(&[], &[]);
    fs::write(fx.new.join("a\\b"), b"x").unwrap();

    match dirpatch::create_patch(&fx.old, &fx.new, &fx.patch, 3) {
        Err(Error::UnsupportedPath { path, .. }) => assert!(path.ends_with("a\\b")),
        other => panic!("expected unsupported path, got {other:?}"),
    }
}
