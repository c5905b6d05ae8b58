use super::*;
use disk::DiskManager;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use record::{Column, Schema};
use tempfile::tempdir;
use types::{TypeId, Value};

fn int_codec() -> KeyCodec {
    KeyCodec::new(Arc::new(Schema::new(vec![Column::new(
        "id",
        TypeId::Int,
        0,
        false,
        true,
    )])))
}

fn pool(dir: &tempfile::TempDir, frames: usize) -> Arc<BufferPool> {
    let disk = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
    let bp = Arc::new(BufferPool::new(frames, disk));
    // logical page 1 is reserved for index roots; allocate up to it
    let catalog_meta = bp.new_page().unwrap();
    assert_eq!(catalog_meta.page_id(), common::CATALOG_META_PAGE_ID);
    drop(catalog_meta);
    let roots = bp.new_page().unwrap();
    assert_eq!(roots.page_id(), INDEX_ROOTS_PAGE_ID);
    IndexRootsPage::format(roots.write().data_mut());
    drop(roots);
    bp
}

fn tree(bp: &Arc<BufferPool>, leaf_max: usize, internal_max: usize) -> BPlusTree {
    BPlusTree::new(
        IndexId(0),
        bp.clone(),
        int_codec(),
        Some(leaf_max),
        Some(internal_max),
    )
}

fn key(v: i32) -> Row {
    Row::new(vec![Value::Int(v)])
}

fn rid_for(v: i32) -> RowId {
    RowId::new(PageId(100 + v / 50), v as u32 % 50)
}

fn collect_keys(tree: &BPlusTree) -> Vec<i32> {
    tree.iter()
        .map(|(row, _)| match row.values[0] {
            Value::Int(v) => v,
            _ => panic!("int keys expected"),
        })
        .collect()
}

#[test]
fn empty_tree_behaviour() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let tree = tree(&bp, 4, 4);

    assert!(tree.is_empty());
    assert_eq!(tree.height(), 0);
    assert_eq!(tree.get_value(&key(1)), None);
    assert_eq!(tree.iter().count(), 0);
}

#[test]
fn unordered_inserts_scan_in_order() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let mut tree = tree(&bp, 4, 4);

    for v in [5, 2, 8, 1, 9, 3, 7, 4, 6] {
        assert!(tree.insert(&key(v), rid_for(v)));
    }
    assert_eq!(collect_keys(&tree), (1..=9).collect::<Vec<_>>());

    for v in 1..=9 {
        assert_eq!(tree.get_value(&key(v)), Some(rid_for(v)));
    }
    assert_eq!(tree.get_value(&key(10)), None);
    assert!(bp.check_all_unpinned());
}

#[test]
fn duplicate_insert_is_rejected_and_keeps_first_mapping() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let mut tree = tree(&bp, 4, 4);

    assert!(tree.insert(&key(7), rid_for(7)));
    assert!(!tree.insert(&key(7), RowId::new(PageId(999), 0)));
    assert_eq!(tree.get_value(&key(7)), Some(rid_for(7)));
}

#[test]
fn split_and_merge_round_trip() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 64);
    let mut tree = tree(&bp, 4, 4);

    for v in 1..=1000 {
        assert!(tree.insert(&key(v), rid_for(v)));
    }
    assert!(tree.height() > 1);
    assert_eq!(collect_keys(&tree), (1..=1000).collect::<Vec<_>>());

    for v in 1..=999 {
        tree.remove(&key(v));
    }
    assert_eq!(collect_keys(&tree), vec![1000]);
    assert_eq!(tree.get_value(&key(1000)), Some(rid_for(1000)));
    assert_eq!(tree.height(), 1);
    assert!(bp.check_all_unpinned());
}

#[test]
fn remove_everything_clears_the_tree() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let mut tree = tree(&bp, 4, 4);

    for v in 0..50 {
        tree.insert(&key(v), rid_for(v));
    }
    for v in 0..50 {
        tree.remove(&key(v));
    }
    assert!(tree.is_empty());
    assert_eq!(tree.height(), 0);

    // an emptied tree accepts fresh inserts
    assert!(tree.insert(&key(3), rid_for(3)));
    assert_eq!(collect_keys(&tree), vec![3]);
}

#[test]
fn removing_absent_keys_is_a_no_op() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let mut tree = tree(&bp, 4, 4);

    for v in [1, 3, 5] {
        tree.insert(&key(v), rid_for(v));
    }
    tree.remove(&key(2));
    tree.remove(&key(99));
    assert_eq!(collect_keys(&tree), vec![1, 3, 5]);
}

#[test]
fn reverse_and_interleaved_workload() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 64);
    let mut tree = tree(&bp, 4, 5);

    for v in (0..300).rev() {
        tree.insert(&key(v), rid_for(v));
    }
    for v in (0..300).step_by(2) {
        tree.remove(&key(v));
    }
    let expected: Vec<i32> = (0..300).filter(|v| v % 2 == 1).collect();
    assert_eq!(collect_keys(&tree), expected);

    for v in (0..300).step_by(2) {
        assert!(tree.insert(&key(v), rid_for(v)));
    }
    assert_eq!(collect_keys(&tree), (0..300).collect::<Vec<_>>());
}

#[test]
fn occupancy_holds_in_every_node() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 64);
    let mut tree = tree(&bp, 4, 4);

    for v in 0..500 {
        tree.insert(&key(v), rid_for(v));
    }
    for v in 100..400 {
        tree.remove(&key(v));
    }
    check_node(&bp, tree.root_page_id(), true);
}

#[test]
fn occupancy_holds_with_page_filling_fan_out() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 64);
    let mut tree = BPlusTree::new(IndexId(0), bp.clone(), int_codec(), None, None);

    for v in 0..1200 {
        assert!(tree.insert(&key(v), rid_for(v)));
    }
    assert!(tree.height() > 1);
    for v in (0..1200).step_by(3) {
        tree.remove(&key(v));
    }
    check_node(&bp, tree.root_page_id(), true);
    assert_eq!(collect_keys(&tree).len(), 800);
}

fn check_node(bp: &Arc<BufferPool>, pid: PageId, is_root: bool) {
    let guard = bp.fetch_page(pid).unwrap();
    let page = guard.read();
    let node = NodeRef::new(page.data());
    if !is_root {
        // every non-root node keeps at least ⌈max/2⌉ pairs
        assert!(
            node.size() >= (node.max_size() + 1) / 2,
            "node {pid} under-occupied: {} < {}",
            node.size(),
            (node.max_size() + 1) / 2
        );
    }
    assert!(node.size() < node.max_size());
    if !node.is_leaf() {
        let children: Vec<PageId> = (0..node.size()).map(|i| node.child_at(i)).collect();
        drop(page);
        drop(guard);
        for child in children {
            check_node(bp, child, false);
        }
    }
}

#[test]
fn iter_from_seeks_to_lower_bound() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let mut tree = tree(&bp, 4, 4);

    for v in (0..100).step_by(5) {
        tree.insert(&key(v), rid_for(v));
    }
    let from_exact: Vec<i32> = tree
        .iter_from(&key(50))
        .map(|(row, _)| match row.values[0] {
            Value::Int(v) => v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(from_exact, (50..100).step_by(5).collect::<Vec<_>>());

    let from_between: Vec<i32> = tree
        .iter_from(&key(51))
        .map(|(row, _)| match row.values[0] {
            Value::Int(v) => v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(from_between, (55..100).step_by(5).collect::<Vec<_>>());

    assert_eq!(tree.iter_from(&key(1000)).count(), 0);
}

#[test]
fn root_id_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    {
        let disk = Arc::new(DiskManager::new(&path).unwrap());
        let bp = Arc::new(BufferPool::new(32, disk));
        bp.new_page().unwrap();
        let roots = bp.new_page().unwrap();
        IndexRootsPage::format(roots.write().data_mut());
        drop(roots);

        let mut tree = BPlusTree::new(IndexId(3), bp.clone(), int_codec(), Some(4), Some(4));
        for v in 0..100 {
            tree.insert(&key(v), rid_for(v));
        }
        bp.flush_all_pages();
        bp.disk().close();
    }

    let disk = Arc::new(DiskManager::new(&path).unwrap());
    let bp = Arc::new(BufferPool::new(32, disk));
    let tree = BPlusTree::new(IndexId(3), bp, int_codec(), Some(4), Some(4));
    assert!(!tree.is_empty());
    assert_eq!(collect_keys(&tree), (0..100).collect::<Vec<_>>());
}

#[test]
fn destroy_releases_every_page() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 64);
    let mut tree = tree(&bp, 4, 4);

    for v in 0..200 {
        tree.insert(&key(v), rid_for(v));
    }
    let root = tree.root_page_id();
    tree.destroy();
    assert!(tree.is_empty());
    assert!(bp.disk().is_page_free(root));

    let roots_guard = bp.fetch_page(INDEX_ROOTS_PAGE_ID).unwrap();
    assert_eq!(IndexRootsPage::get(roots_guard.read().data(), 0), None);
}

#[test]
fn char_keys_order_lexicographically() {
    let dir = tempdir().unwrap();
    let bp = pool(&dir, 32);
    let codec = KeyCodec::new(Arc::new(Schema::new(vec![Column::with_length(
        "name",
        TypeId::Char,
        16,
        0,
        false,
        true,
    )])));
    let mut tree = BPlusTree::new(IndexId(0), bp, codec, Some(4), Some(4));

    for name in ["pear", "apple", "quince", "banana", "fig", "cherry"] {
        assert!(tree.insert(&Row::new(vec![Value::Char(name.into())]), RowId::new(PageId(1), 0)));
    }
    let names: Vec<String> = tree
        .iter()
        .map(|(row, _)| match &row.values[0] {
            Value::Char(s) => s.clone(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        names,
        vec!["apple", "banana", "cherry", "fig", "pear", "quince"]
    );
}

mod roots_page {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn insert_get_update_delete() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        IndexRootsPage::format(&mut data);

        assert!(IndexRootsPage::insert(&mut data, 1, PageId(10)));
        assert!(IndexRootsPage::insert(&mut data, 2, PageId(20)));
        assert!(!IndexRootsPage::insert(&mut data, 1, PageId(30)));

        assert_eq!(IndexRootsPage::get(&data, 1), Some(PageId(10)));
        assert!(IndexRootsPage::update(&mut data, 1, PageId(15)));
        assert_eq!(IndexRootsPage::get(&data, 1), Some(PageId(15)));

        assert!(IndexRootsPage::delete(&mut data, 1));
        assert_eq!(IndexRootsPage::get(&data, 1), None);
        assert_eq!(IndexRootsPage::get(&data, 2), Some(PageId(20)));
        assert!(!IndexRootsPage::delete(&mut data, 1));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // the live key set always matches the iterator output, in order
    #[test]
    fn key_set_matches_inserted_set(ops in prop::collection::vec((any::<bool>(), 0i32..120), 1..200)) {
        let dir = tempdir().unwrap();
        let bp = pool(&dir, 64);
        let mut tree = tree(&bp, 4, 4);
        let mut live = std::collections::BTreeSet::new();

        for (insert, v) in ops {
            if insert {
                prop_assert_eq!(tree.insert(&key(v), rid_for(v)), live.insert(v));
            } else {
                tree.remove(&key(v));
                live.remove(&v);
            }
        }
        prop_assert_eq!(collect_keys(&tree), live.iter().copied().collect::<Vec<_>>());
        for v in &live {
            prop_assert_eq!(tree.get_value(&key(*v)), Some(rid_for(*v)));
        }
    }
}
