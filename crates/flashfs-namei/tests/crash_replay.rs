//! Orphan handoff across a simulated power cut: every inode left in the
//! checkpointed orphan registry is reclaimed at the next mount.

mod common;

use common::{assert_link_counts, Fixture};
use flashfs_namei::{Credentials, InodeId, RenameFlags};

fn creds() -> Credentials {
    Credentials::root()
}

#[test]
fn test_unlinked_open_file_reclaimed_after_crash() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let file = fx.ns.create(&root, "open", 0o644, creds()).unwrap();
    let ino = file.ino();
    fx.ns.unlink(&root, "open").unwrap();
    assert!(fx.ns.backend().pages.exists(ino).unwrap());
    fx.ns.checkpoint().unwrap();

    let ns = fx.remount();
    assert!(!ns.backend().pages.exists(ino).unwrap());
    assert!(ns.backend().orphans.snapshot().is_empty());
    let root = ns.root().unwrap();
    assert!(ns.lookup(&root, "open").unwrap().is_none());
    assert_link_counts(&ns);
}

#[test]
fn test_unlinked_inodes_reclaimed_without_checkpoint() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let file = fx.ns.create(&root, "open", 0o644, creds()).unwrap();
    let dir = fx.ns.mkdir(&root, "gone", 0o755, creds()).unwrap();
    let tmp = fx.ns.tmpfile(&root, 0o600, creds()).unwrap();
    let kept = fx.ns.create(&root, "kept", 0o644, creds()).unwrap();
    fx.ns.unlink(&root, "open").unwrap();
    fx.ns.rmdir(&root, "gone").unwrap();
    let dead = [file.ino(), dir.ino(), tmp.ino()];
    for ino in dead {
        assert_eq!(fx.ns.backend().pages.get_inode(ino).unwrap().nlink, 0);
    }
    let kept_ino = kept.ino();

    let ns = fx.remount();
    for ino in dead {
        assert!(!ns.backend().pages.exists(ino).unwrap());
        assert!(ns.backend().entries.list(ino).unwrap().is_empty());
    }
    let root = ns.root().unwrap();
    assert_eq!(ns.lookup(&root, "kept").unwrap().unwrap().ino(), kept_ino);
    assert!(ns.backend().orphans.snapshot().is_empty());
    assert_link_counts(&ns);

    // The reclaimed identifiers are handed out again.
    let fresh = ns.create(&root, "fresh", 0o644, creds()).unwrap();
    assert!(dead.contains(&fresh.ino()));
}

#[test]
fn test_tmpfile_reclaimed_after_crash() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let tmp = fx.ns.tmpfile(&root, 0o600, creds()).unwrap();
    let ino = tmp.ino();
    fx.ns.checkpoint().unwrap();

    let ns = fx.remount();
    assert!(!ns.backend().pages.exists(ino).unwrap());
}

#[test]
fn test_replaced_target_reclaimed_after_crash() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let a = fx.ns.create(&root, "a", 0o644, creds()).unwrap();
    let b = fx.ns.create(&root, "b", 0o644, creds()).unwrap();
    fx.ns.rename(&root, "a", &root, "b", RenameFlags::NONE).unwrap();
    let (a_ino, b_ino) = (a.ino(), b.ino());
    fx.ns.checkpoint().unwrap();

    let ns = fx.remount();
    let root = ns.root().unwrap();
    assert_eq!(ns.lookup(&root, "b").unwrap().unwrap().ino(), a_ino);
    assert!(!ns.backend().pages.exists(b_ino).unwrap());
    assert_link_counts(&ns);
}

#[test]
fn test_orphan_linked_after_checkpoint_survives() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let tmp = fx.ns.tmpfile(&root, 0o600, creds()).unwrap();
    fx.ns.checkpoint().unwrap();
    fx.ns.link(&tmp, &root, "kept").unwrap();
    let ino = tmp.ino();

    let ns = fx.remount();
    let root = ns.root().unwrap();
    assert_eq!(ns.lookup(&root, "kept").unwrap().unwrap().ino(), ino);
    assert!(ns.backend().orphans.snapshot().is_empty());
}

#[test]
fn test_allocator_resumes_past_persisted_inodes() {
    let fx = Fixture::new();
    let root = fx.ns.root().unwrap();
    let mut last = InodeId::new(0);
    for i in 0..5 {
        last = fx.ns.create(&root, &format!("f{}", i), 0o644, creds()).unwrap().ino();
    }
    fx.ns.checkpoint().unwrap();

    let ns = fx.remount();
    let root = ns.root().unwrap();
    let fresh = ns.create(&root, "fresh", 0o644, creds()).unwrap();
    assert!(fresh.ino() > last);
    assert_link_counts(&ns);
}
