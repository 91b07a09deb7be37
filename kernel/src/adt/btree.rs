//! B+tree.
//!
//! Balanced 3-4-5 tree (order 5): keys at every level, values only in
//! leaves, leaves linked in key order. The kernel uses it for every
//! ordered dictionary with pointer- or id-sized values: address-space
//! regions, the thread and task registries, IPC maps.
//!
//! Nodes are allocated from a dedicated slab cache, so insertion and
//! removal may sleep. Trees are serialized externally: callers hold
//! their own lock around every operation on a given tree.
//!
//! Insertion into a full node first tries to rotate a key into the
//! left, then the right sibling, and only splits when both are full;
//! the median is copied up from a leaf but moved up from an index node.
//! Deletion below the fill factor borrows from a sibling when it can
//! and merges with one when it cannot.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::adt::list::{Link, List};
use crate::container_of;
use crate::mm::frame::FrameFlags;
use crate::mm::slab::{self, SlabCache, SlabFlags};

/// B+tree order: maximum number of subtrees per node.
pub const BTREE_M: usize = 5;
/// Maximum keys per node.
pub const BTREE_MAX_KEYS: usize = BTREE_M - 1;
/// Minimum keys in a non-root node.
const FILL_FACTOR: usize = (BTREE_M - 1) / 2;

pub type BtreeKey = u64;

/// Word-sized value; kernel clients store object pointers or ids.
pub type BtreeValue = usize;

pub struct BtreeNode {
    /// Number of keys in use.
    keys: usize,
    /// One extra slot: a node may transiently hold BTREE_MAX_KEYS + 1
    /// keys during a split or an insert-by-rotation.
    key: [BtreeKey; BTREE_MAX_KEYS + 1],
    value: [BtreeValue; BTREE_MAX_KEYS + 1],
    subtree: [*mut BtreeNode; BTREE_M + 1],
    parent: *mut BtreeNode,
    /// Leaf-chain membership (leaves only).
    leaf_link: Link,
    /// Distance from the leaf level.
    depth: usize,
}

impl BtreeNode {
    pub fn key_count(&self) -> usize {
        self.keys
    }

    pub fn key_at(&self, i: usize) -> BtreeKey {
        assert!(i < self.keys);
        self.key[i]
    }

    pub fn value_at(&self, i: usize) -> BtreeValue {
        assert!(i < self.keys);
        self.value[i]
    }
}

pub struct Btree {
    root: *mut BtreeNode,
    leaf_list: List,
}

// SAFETY: every operation on a tree is serialized by an external lock
// held by the owning subsystem; the raw pointers never leave that
// critical section.
unsafe impl Send for Btree {}
// SAFETY: same as Send.
unsafe impl Sync for Btree {}

/// Cache of B+tree nodes, shared by all trees.
static NODE_CACHE: AtomicPtr<SlabCache> = AtomicPtr::new(ptr::null_mut());

fn node_cache() -> &'static SlabCache {
    let cache = NODE_CACHE.load(Ordering::Acquire);
    assert!(!cache.is_null(), "B+tree used before btree::init()");
    // SAFETY: published once at init and never freed.
    unsafe { &*cache }
}

/// Create the shared node cache. Runs once after the slab bootstrap.
pub fn init() {
    let cache = slab_cache_create_nodes();
    NODE_CACHE.store(
        cache as *const SlabCache as *mut SlabCache,
        Ordering::Release,
    );
}

fn slab_cache_create_nodes() -> &'static SlabCache {
    slab::slab_cache_create(
        "btree_node",
        core::mem::size_of::<BtreeNode>(),
        0,
        None,
        None,
        SlabFlags::MAGDEFERRED,
    )
}

fn node_alloc() -> *mut BtreeNode {
    slab::slab_alloc(node_cache(), FrameFlags::empty())
        .expect("out of memory allocating a B+tree node")
        .as_ptr() as *mut BtreeNode
}

fn node_free(node: *mut BtreeNode) {
    // SAFETY: `node` came from the node cache.
    slab::slab_free(node_cache(), unsafe {
        NonNull::new_unchecked(node as *mut u8)
    });
}

fn node_initialize(node: *mut BtreeNode) {
    // SAFETY: the caller owns the fresh node storage exclusively.
    unsafe {
        node.write(BtreeNode {
            keys: 0,
            key: [0; BTREE_MAX_KEYS + 1],
            value: [0; BTREE_MAX_KEYS + 1],
            subtree: [ptr::null_mut(); BTREE_M + 1],
            parent: ptr::null_mut(),
            leaf_link: Link::new(),
            depth: 0,
        });
    }
}

// The node-shape predicates mirror how the tree tells nodes apart: a
// node is a leaf iff its leftmost subtree pointer is null.
unsafe fn is_root(node: *mut BtreeNode) -> bool {
    // SAFETY: caller passes a live node.
    unsafe { (*node).parent.is_null() }
}

unsafe fn is_leaf(node: *mut BtreeNode) -> bool {
    // SAFETY: caller passes a live node.
    unsafe { (*node).subtree[0].is_null() }
}

unsafe fn is_index(node: *mut BtreeNode) -> bool {
    // SAFETY: caller passes a live node.
    !unsafe { is_leaf(node) }
}

/// Insert key, value and its *right* subtree into a node, keeping keys
/// ordered. The extra array slot allows one key beyond the maximum,
/// which splitting and insert-by-rotation rely on.
unsafe fn node_insert_key_and_rsubtree(
    node: *mut BtreeNode,
    key: BtreeKey,
    value: BtreeValue,
    rsubtree: *mut BtreeNode,
) {
    // SAFETY: caller passes a live node with room in the extra slot.
    unsafe {
        let n = &mut *node;
        let mut i = 0;
        while i < n.keys {
            if key < n.key[i] {
                for j in (i..n.keys).rev() {
                    n.key[j + 1] = n.key[j];
                    n.value[j + 1] = n.value[j];
                    n.subtree[j + 2] = n.subtree[j + 1];
                }
                break;
            }
            i += 1;
        }

        n.key[i] = key;
        n.value[i] = value;
        n.subtree[i + 1] = rsubtree;
        n.keys += 1;
    }
}

/// Insert key, value and its *left* subtree into a node.
unsafe fn node_insert_key_and_lsubtree(
    node: *mut BtreeNode,
    key: BtreeKey,
    value: BtreeValue,
    lsubtree: *mut BtreeNode,
) {
    // SAFETY: caller passes a live node with room in the extra slot.
    unsafe {
        let n = &mut *node;
        let mut i = 0;
        while i < n.keys {
            if key < n.key[i] {
                for j in (i..n.keys).rev() {
                    n.key[j + 1] = n.key[j];
                    n.value[j + 1] = n.value[j];
                    n.subtree[j + 2] = n.subtree[j + 1];
                }
                n.subtree[i + 1] = n.subtree[i];
                break;
            }
            i += 1;
        }

        n.key[i] = key;
        n.value[i] = value;
        n.subtree[i] = lsubtree;
        n.keys += 1;
    }
}

/// Remove a key along with its *left* subtree pointer, closing gaps.
unsafe fn node_remove_key_and_lsubtree(node: *mut BtreeNode, key: BtreeKey) {
    // SAFETY: caller passes a live node.
    unsafe {
        let n = &mut *node;
        for i in 0..n.keys {
            if key == n.key[i] {
                for j in (i + 1)..n.keys {
                    n.key[j - 1] = n.key[j];
                    n.value[j - 1] = n.value[j];
                    n.subtree[j - 1] = n.subtree[j];
                }
                n.subtree[n.keys - 1] = n.subtree[n.keys];
                n.keys -= 1;
                return;
            }
        }
        panic!("node does not contain key {}", key);
    }
}

/// Remove a key along with its *right* subtree pointer, closing gaps.
unsafe fn node_remove_key_and_rsubtree(node: *mut BtreeNode, key: BtreeKey) {
    // SAFETY: caller passes a live node.
    unsafe {
        let n = &mut *node;
        for i in 0..n.keys {
            if key == n.key[i] {
                for j in (i + 1)..n.keys {
                    n.key[j - 1] = n.key[j];
                    n.value[j - 1] = n.value[j];
                    n.subtree[j] = n.subtree[j + 1];
                }
                n.keys -= 1;
                return;
            }
        }
        panic!("node does not contain key {}", key);
    }
}

/// Index of the key whose left (`right == false`) or right
/// (`right == true`) subtree is `subtree`. `None` when `subtree` is the
/// leftmost child and a right-relative index is requested.
unsafe fn find_key_by_subtree(
    node: *mut BtreeNode,
    subtree: *mut BtreeNode,
    right: bool,
) -> Option<usize> {
    // SAFETY: caller passes live nodes.
    unsafe {
        let n = &*node;
        for i in 0..=n.keys {
            if n.subtree[i] == subtree {
                if right && i == 0 {
                    return None;
                }
                return Some(i - right as usize);
            }
        }
    }
    panic!("node does not contain the given subtree");
}

/// Rotate the biggest key of `lnode` through the parent into `rnode`.
unsafe fn rotate_from_left(lnode: *mut BtreeNode, rnode: *mut BtreeNode, idx: usize) {
    // SAFETY: caller passes live siblings with a common live parent.
    unsafe {
        let key = (*lnode).key[(*lnode).keys - 1];

        if is_leaf(lnode) {
            let value = (*lnode).value[(*lnode).keys - 1];
            node_remove_key_and_rsubtree(lnode, key);
            node_insert_key_and_lsubtree(rnode, key, value, ptr::null_mut());
            (*(*lnode).parent).key[idx] = key;
        } else {
            let rsubtree = (*lnode).subtree[(*lnode).keys];
            node_remove_key_and_rsubtree(lnode, key);
            node_insert_key_and_lsubtree(
                rnode,
                (*(*lnode).parent).key[idx],
                0,
                rsubtree,
            );
            (*(*lnode).parent).key[idx] = key;

            (*rsubtree).parent = rnode;
        }
    }
}

/// Rotate the smallest key of `rnode` through the parent into `lnode`.
unsafe fn rotate_from_right(lnode: *mut BtreeNode, rnode: *mut BtreeNode, idx: usize) {
    // SAFETY: caller passes live siblings with a common live parent.
    unsafe {
        let key = (*rnode).key[0];

        if is_leaf(rnode) {
            let value = (*rnode).value[0];
            node_remove_key_and_lsubtree(rnode, key);
            node_insert_key_and_rsubtree(lnode, key, value, ptr::null_mut());
            (*(*rnode).parent).key[idx] = (*rnode).key[0];
        } else {
            let lsubtree = (*rnode).subtree[0];
            node_remove_key_and_lsubtree(rnode, key);
            node_insert_key_and_rsubtree(
                lnode,
                (*(*rnode).parent).key[idx],
                0,
                lsubtree,
            );
            (*(*rnode).parent).key[idx] = key;

            (*lsubtree).parent = lnode;
        }
    }
}

/// Insert into `node` by moving its smallest key into a left sibling
/// with free space, if one exists.
unsafe fn try_insert_by_rotation_to_left(
    node: *mut BtreeNode,
    inskey: BtreeKey,
    insvalue: BtreeValue,
    rsubtree: *mut BtreeNode,
) -> bool {
    // SAFETY: caller passes a live node.
    unsafe {
        if is_root(node) {
            return false;
        }

        let Some(idx) = find_key_by_subtree((*node).parent, node, true) else {
            return false;
        };

        let lnode = (*(*node).parent).subtree[idx];
        if (*lnode).keys < BTREE_MAX_KEYS {
            node_insert_key_and_rsubtree(node, inskey, insvalue, rsubtree);
            rotate_from_right(lnode, node, idx);
            return true;
        }
    }

    false
}

/// Insert into `node` by moving its biggest key into a right sibling
/// with free space, if one exists.
unsafe fn try_insert_by_rotation_to_right(
    node: *mut BtreeNode,
    inskey: BtreeKey,
    insvalue: BtreeValue,
    rsubtree: *mut BtreeNode,
) -> bool {
    // SAFETY: caller passes a live node.
    unsafe {
        if is_root(node) {
            return false;
        }

        let idx = find_key_by_subtree((*node).parent, node, false)
            .expect("left-relative index is always defined");
        if idx == (*(*node).parent).keys {
            return false;
        }

        let rnode = (*(*node).parent).subtree[idx + 1];
        if (*rnode).keys < BTREE_MAX_KEYS {
            node_insert_key_and_rsubtree(node, inskey, insvalue, rsubtree);
            rotate_from_left(node, rnode, idx);
            return true;
        }
    }

    false
}

/// Split a full node while inserting, returning the new right sibling
/// and writing the median key to `median`. A leaf split copies the
/// median into the new node; an index split moves it up only.
unsafe fn node_split(
    node: *mut BtreeNode,
    key: BtreeKey,
    value: BtreeValue,
    rsubtree: *mut BtreeNode,
    median: &mut BtreeKey,
) -> *mut BtreeNode {
    // SAFETY: caller passes a live, full node.
    unsafe {
        debug_assert_eq!((*node).keys, BTREE_MAX_KEYS);

        // Use the extra slot to hold the overflowing key.
        node_insert_key_and_rsubtree(node, key, value, rsubtree);

        let median_idx = (*node).keys / 2;
        *median = (*node).key[median_idx];

        let rnode = node_alloc();
        node_initialize(rnode);
        (*rnode).parent = (*node).parent;
        (*rnode).depth = (*node).depth;

        // Copy the upper half; an index node does not copy the median.
        let mut i = median_idx + is_index(node) as usize;
        let mut j = 0;
        while i < (*node).keys {
            (*rnode).key[j] = (*node).key[i];
            (*rnode).value[j] = (*node).value[i];
            (*rnode).subtree[j] = (*node).subtree[i];
            if !(*rnode).subtree[j].is_null() {
                (*(*rnode).subtree[j]).parent = rnode;
            }
            i += 1;
            j += 1;
        }
        (*rnode).subtree[j] = (*node).subtree[i];
        if !(*rnode).subtree[j].is_null() {
            (*(*rnode).subtree[j]).parent = rnode;
        }

        (*rnode).keys = j;
        (*node).keys /= 2;

        rnode
    }
}

/// Merge `node` with one of its siblings; both are below the fill
/// factor. Returns the right-hand node of the pair (the one to free).
unsafe fn node_combine(node: *mut BtreeNode) -> *mut BtreeNode {
    // SAFETY: caller passes a live non-root node.
    unsafe {
        debug_assert!(!is_root(node));

        let parent = (*node).parent;
        let mut node = node;
        let idx = match find_key_by_subtree(parent, node, false) {
            Some(idx) if idx == (*parent).keys => {
                // Rightmost subtree: combine with the left sibling.
                let idx = idx - 1;
                let rnode = node;
                node = (*parent).subtree[idx];
                // Continue with roles swapped.
                return combine_pair(node, rnode, idx);
            }
            Some(idx) => idx,
            None => unreachable!("left-relative index is always defined"),
        };

        let rnode = (*parent).subtree[idx + 1];
        combine_pair(node, rnode, idx)
    }
}

unsafe fn combine_pair(
    node: *mut BtreeNode,
    rnode: *mut BtreeNode,
    idx: usize,
) -> *mut BtreeNode {
    // SAFETY: caller passes live siblings; `idx` names the separator
    // between them in the common parent.
    unsafe {
        // An index node absorbs the parent's separator between the two.
        if is_index(node) {
            (*node).key[(*node).keys] = (*(*node).parent).key[idx];
            (*node).keys += 1;
        }

        let base = (*node).keys;
        for i in 0..(*rnode).keys {
            (*node).key[base + i] = (*rnode).key[i];
            (*node).value[base + i] = (*rnode).value[i];
            if is_index(node) {
                (*node).subtree[base + i] = (*rnode).subtree[i];
                (*(*rnode).subtree[i]).parent = node;
            }
        }
        if is_index(node) {
            let i = (*rnode).keys;
            (*node).subtree[base + i] = (*rnode).subtree[i];
            (*(*rnode).subtree[i]).parent = node;
        }

        (*node).keys += (*rnode).keys;
        rnode
    }
}

impl Btree {
    /// An inert tree; [`Btree::create`] makes it usable. Split so the
    /// value can be placed in its final storage first — the leaf chain
    /// is address-sensitive once created.
    pub const fn empty() -> Self {
        Self {
            root: ptr::null_mut(),
            leaf_list: List::new(),
        }
    }

    /// Allocate the root leaf. The tree must not move afterwards.
    pub fn create(&mut self) {
        assert!(self.root.is_null(), "tree created twice");

        let root = node_alloc();
        node_initialize(root);
        self.root = root;
        // SAFETY: fresh root is unlinked; the tree is externally
        // serialized.
        unsafe { self.leaf_list.append(&mut (*root).leaf_link) };
    }

    /// Free every node. The tree reverts to the inert state.
    pub fn destroy(&mut self) {
        if self.root.is_null() {
            return;
        }
        // SAFETY: root is live; subtree links form a tree.
        unsafe { destroy_subtree(self.root) };
        self.root = ptr::null_mut();
        self.leaf_list = List::new();
    }

    /// Number of keys stored.
    pub fn count(&mut self) -> usize {
        let mut count = 0;
        for link in self.leaf_list.iter() {
            // SAFETY: leaf-chain members are live leaves.
            count += unsafe { (*container_of!(link, BtreeNode, leaf_link)).keys };
        }
        count
    }

    /// Look up `key`. Always returns the visited leaf so callers can
    /// reuse it as a hint for a subsequent insert or removal.
    pub fn search(&self, key: BtreeKey) -> (Option<BtreeValue>, NonNull<BtreeNode>) {
        assert!(!self.root.is_null(), "searching a tree before create()");

        let mut cur = self.root;
        loop {
            // SAFETY: descent follows live subtree links.
            unsafe {
                if is_leaf(cur) {
                    let n = &*cur;
                    let found = (0..n.keys).find(|&i| n.key[i] == key).map(|i| n.value[i]);
                    return (found, NonNull::new_unchecked(cur));
                }

                // Descend into the last child whose separator is <= key.
                let n = &*cur;
                let mut child = n.keys;
                for i in 0..n.keys {
                    if key < n.key[i] {
                        child = i;
                        break;
                    }
                }
                cur = n.subtree[child];
            }
        }
    }

    /// Insert a key-value pair. `leaf_hint`, if given, must be the leaf
    /// returned by a previous [`Btree::search`] for this key. Inserting
    /// a key that is already present is a kernel bug and panics.
    pub fn insert(
        &mut self,
        key: BtreeKey,
        value: BtreeValue,
        leaf_hint: Option<NonNull<BtreeNode>>,
    ) {
        let leaf = match leaf_hint {
            Some(leaf) => leaf.as_ptr(),
            None => {
                let (found, leaf) = self.search(key);
                if found.is_some() {
                    panic!("B+tree already contains key {}", key);
                }
                leaf.as_ptr()
            }
        };

        // SAFETY: `leaf` is a live leaf of this tree.
        unsafe { self.insert_recursive(key, value, ptr::null_mut(), leaf) };
    }

    /// Recursive insertion step: room in the node, else rotation to a
    /// sibling, else split and carry the median to the parent.
    unsafe fn insert_recursive(
        &mut self,
        key: BtreeKey,
        value: BtreeValue,
        rsubtree: *mut BtreeNode,
        node: *mut BtreeNode,
    ) {
        // SAFETY: caller passes a live node of this tree.
        unsafe {
            if (*node).keys < BTREE_MAX_KEYS {
                node_insert_key_and_rsubtree(node, key, value, rsubtree);
                return;
            }
            if try_insert_by_rotation_to_left(node, key, value, rsubtree) {
                return;
            }
            if try_insert_by_rotation_to_right(node, key, value, rsubtree) {
                return;
            }

            // The node and both siblings (if any) are full: split.
            let mut median = 0;
            let rnode = node_split(node, key, value, rsubtree, &mut median);

            if is_leaf(node) {
                Link::insert_after(&mut (*rnode).leaf_link, &mut (*node).leaf_link);
            }

            if is_root(node) {
                let root = node_alloc();
                node_initialize(root);
                (*node).parent = root;
                (*rnode).parent = root;

                (*root).subtree[0] = node;
                (*root).depth = (*node).depth + 1;
                self.root = root;
            }

            self.insert_recursive(median, 0, rnode, (*node).parent);
        }
    }

    /// Remove a key. `leaf_hint`, if given, must be the leaf returned
    /// by a previous [`Btree::search`] for this key. Removing an absent
    /// key is a kernel bug and panics.
    pub fn remove(&mut self, key: BtreeKey, leaf_hint: Option<NonNull<BtreeNode>>) {
        let leaf = match leaf_hint {
            Some(leaf) => leaf.as_ptr(),
            None => {
                let (found, leaf) = self.search(key);
                if found.is_none() {
                    panic!("B+tree does not contain key {}", key);
                }
                leaf.as_ptr()
            }
        };

        // SAFETY: `leaf` is a live leaf of this tree.
        unsafe { self.remove_recursive(key, leaf) };
    }

    /// Recursive removal step.
    unsafe fn remove_recursive(&mut self, key: BtreeKey, node: *mut BtreeNode) {
        // SAFETY: caller passes a live node of this tree.
        unsafe {
            if is_root(node) {
                if (*node).keys == 1 && !(*node).subtree[0].is_null() {
                    // The root is down to one separator whose subtrees
                    // were just combined: the remaining child takes
                    // over and the tree shrinks by one level.
                    self.root = (*node).subtree[0];
                    (*self.root).parent = ptr::null_mut();
                    node_free(node);
                } else {
                    node_remove_key_and_rsubtree(node, key);
                }
                return;
            }

            if (*node).keys <= FILL_FACTOR {
                // Try to borrow a key from a sibling first.
                if !try_rotation_from_left(node) {
                    let _ = try_rotation_from_right(node);
                }
            }

            if (*node).keys > FILL_FACTOR {
                node_remove_key_and_rsubtree(node, key);

                // The removed key may serve as a separator upstairs;
                // replace it with the new smallest key in the subtree.
                let parent = &mut *(*node).parent;
                for i in 0..parent.keys {
                    if parent.key[i] == key {
                        parent.key[i] = (*node).key[0];
                    }
                }
            } else {
                // Neither sibling can spare a key: combine. The left
                // node of the pair survives, the right one is freed,
                // and the parent recursively loses their separator.
                let parent = (*node).parent;
                node_remove_key_and_rsubtree(node, key);
                let rnode = node_combine(node);

                if is_leaf(rnode) {
                    Link::remove(&mut (*rnode).leaf_link);
                }

                let idx = find_key_by_subtree(parent, rnode, true)
                    .expect("combined sibling is never the leftmost subtree");
                let sep = (*parent).key[idx];
                node_free(rnode);
                self.remove_recursive(sep, parent);
            }
        }
    }

    /// The leaf preceding `node` in the chain.
    pub fn leaf_left_neighbor(&mut self, node: NonNull<BtreeNode>) -> Option<NonNull<BtreeNode>> {
        // SAFETY: `node` is a live leaf of this tree.
        unsafe {
            debug_assert!(is_leaf(node.as_ptr()));
            let prev = (*node.as_ptr()).leaf_link.prev_ptr();
            if prev == self.leaf_list.sentinel() {
                None
            } else {
                Some(NonNull::new_unchecked(container_of!(
                    prev,
                    BtreeNode,
                    leaf_link
                )))
            }
        }
    }

    /// The leaf following `node` in the chain.
    pub fn leaf_right_neighbor(&mut self, node: NonNull<BtreeNode>) -> Option<NonNull<BtreeNode>> {
        // SAFETY: `node` is a live leaf of this tree.
        unsafe {
            debug_assert!(is_leaf(node.as_ptr()));
            let next = (*node.as_ptr()).leaf_link.next_ptr();
            if next == self.leaf_list.sentinel() {
                None
            } else {
                Some(NonNull::new_unchecked(container_of!(
                    next,
                    BtreeNode,
                    leaf_link
                )))
            }
        }
    }

    /// First leaf of the chain (smallest keys).
    pub fn leaf_first(&mut self) -> Option<NonNull<BtreeNode>> {
        let link = self.leaf_list.first()?;
        // SAFETY: leaf-chain members are live leaves.
        Some(unsafe { NonNull::new_unchecked(container_of!(link, BtreeNode, leaf_link)) })
    }
}

/// Borrow a key from the left sibling if it has one to spare.
unsafe fn try_rotation_from_left(rnode: *mut BtreeNode) -> bool {
    // SAFETY: caller passes a live node.
    unsafe {
        if is_root(rnode) {
            return false;
        }

        let Some(idx) = find_key_by_subtree((*rnode).parent, rnode, true) else {
            return false;
        };

        let lnode = (*(*rnode).parent).subtree[idx];
        if (*lnode).keys > FILL_FACTOR {
            rotate_from_left(lnode, rnode, idx);
            return true;
        }
    }

    false
}

/// Borrow a key from the right sibling if it has one to spare.
unsafe fn try_rotation_from_right(lnode: *mut BtreeNode) -> bool {
    // SAFETY: caller passes a live node.
    unsafe {
        if is_root(lnode) {
            return false;
        }

        let idx = find_key_by_subtree((*lnode).parent, lnode, false)
            .expect("left-relative index is always defined");
        if idx == (*(*lnode).parent).keys {
            return false;
        }

        let rnode = (*(*lnode).parent).subtree[idx + 1];
        if (*rnode).keys > FILL_FACTOR {
            rotate_from_right(lnode, rnode, idx);
            return true;
        }
    }

    false
}

unsafe fn destroy_subtree(root: *mut BtreeNode) {
    // SAFETY: caller passes a live subtree root.
    unsafe {
        if (*root).keys > 0 {
            for i in 0..=(*root).keys {
                if !(*root).subtree[i].is_null() {
                    destroy_subtree((*root).subtree[i]);
                }
            }
        }
        node_free(root);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;
    use std::boxed::Box;
    use std::vec::Vec;

    /// Trees are address-sensitive; keep them on the heap and pinned.
    fn new_tree() -> Box<Btree> {
        let mut t = Box::new(Btree::empty());
        t.create();
        t
    }

    /// Walk the whole tree checking the structural invariants: equal
    /// leaf depth, fill factors, separator/subtree-minimum agreement
    /// and a sorted leaf chain.
    fn check_invariants(t: &mut Btree) {
        fn walk(node: *mut BtreeNode, level: usize, leaf_level: &mut Option<usize>) -> BtreeKey {
            // SAFETY: test-owned tree, externally serialized.
            unsafe {
                let n = &*node;
                assert!(n.keys <= BTREE_MAX_KEYS, "node over maximum keys");
                if !is_root(node) {
                    assert!(n.keys >= FILL_FACTOR, "non-root node below fill factor");
                }
                for i in 1..n.keys {
                    assert!(n.key[i - 1] < n.key[i], "keys out of order in a node");
                }

                if is_leaf(node) {
                    match leaf_level {
                        Some(depth) => assert_eq!(*depth, level, "leaves at unequal depth"),
                        None => *leaf_level = Some(level),
                    }
                    return n.key[0];
                }

                let mut minimum = 0;
                for i in 0..=n.keys {
                    assert_eq!((*n.subtree[i]).parent, node, "broken parent link");
                    let submin = walk(n.subtree[i], level + 1, leaf_level);
                    if i == 0 {
                        minimum = submin;
                    } else {
                        assert_eq!(
                            n.key[i - 1],
                            submin,
                            "separator does not match subtree minimum"
                        );
                    }
                }
                minimum
            }
        }

        if unsafe { (*t.root).keys } == 0 {
            return;
        }
        let mut leaf_level = None;
        walk(t.root, 0, &mut leaf_level);

        // Leaf chain yields strictly ascending keys.
        let mut last: Option<BtreeKey> = None;
        let mut leaf = t.leaf_first();
        while let Some(node) = leaf {
            // SAFETY: live leaf of the test tree.
            unsafe {
                let n = node.as_ref();
                for i in 0..n.keys {
                    if let Some(prev) = last {
                        assert!(prev < n.key[i], "leaf chain out of order");
                    }
                    last = Some(n.key[i]);
                }
            }
            leaf = t.leaf_right_neighbor(node);
        }
    }

    fn keys_of(node: NonNull<BtreeNode>) -> Vec<BtreeKey> {
        // SAFETY: live node of a test tree.
        unsafe {
            let n = node.as_ref();
            (0..n.keys).map(|i| n.key[i]).collect()
        }
    }

    #[test]
    fn grows_by_splitting_the_root_leaf() {
        let _serial = test_support::init();
        let mut t = new_tree();

        for key in 1..=4 {
            t.insert(key, key as usize * 10, None);
        }
        // Four keys fill the root leaf.
        // SAFETY: live root.
        unsafe {
            assert_eq!((*t.root).keys, BTREE_MAX_KEYS);
            assert!(is_leaf(t.root));
        }

        // The fifth key splits it: the median is copied up into a new
        // index root and the leaves are chained in order.
        t.insert(5, 50, None);
        // SAFETY: live root.
        unsafe {
            assert_eq!((*t.root).keys, 1);
            assert_eq!((*t.root).key[0], 3);
            assert!(is_index(t.root));
        }
        let first = t.leaf_first().expect("leaf chain is non-empty");
        assert_eq!(keys_of(first), [1, 2]);
        let second = t.leaf_right_neighbor(first).expect("two leaves exist");
        assert_eq!(keys_of(second), [3, 4, 5]);
        assert!(t.leaf_right_neighbor(second).is_none());
        assert_eq!(t.leaf_left_neighbor(second), Some(first));

        t.insert(6, 60, None);
        assert_eq!(keys_of(second), [3, 4, 5, 6]);
        assert_eq!(t.count(), 6);
        for key in 1..=6 {
            assert_eq!(t.search(key).0, Some(key as usize * 10));
        }
        check_invariants(&mut t);

        t.destroy();
    }

    #[test]
    fn removal_borrows_from_the_right_sibling() {
        let _serial = test_support::init();
        let mut t = new_tree();

        for key in 1..=6 {
            t.insert(key, 0, None);
        }
        // State: root [3], leaves {1,2} and {3,4,5,6}.

        // {1,2} is at the fill factor: removing 1 first borrows 3 from
        // the rich right sibling, lifting the separator to 4.
        t.remove(1, None);
        let first = t.leaf_first().expect("leaf chain is non-empty");
        assert_eq!(keys_of(first), [2, 3]);
        // SAFETY: live root.
        unsafe { assert_eq!((*t.root).key[0], 4) };
        check_invariants(&mut t);

        // Same again: borrow 4, separator becomes 5.
        t.remove(2, None);
        let first = t.leaf_first().expect("leaf chain is non-empty");
        assert_eq!(keys_of(first), [3, 4]);
        let second = t.leaf_right_neighbor(first).expect("two leaves exist");
        assert_eq!(keys_of(second), [5, 6]);
        // SAFETY: live root.
        unsafe {
            assert_eq!((*t.root).keys, 1);
            assert_eq!((*t.root).key[0], 5);
        }
        check_invariants(&mut t);

        // One more removal leaves too few keys for two leaves: the
        // siblings combine and the root collapses back into a leaf.
        t.remove(3, None);
        // SAFETY: live root.
        unsafe { assert!(is_leaf(t.root)) };
        let first = t.leaf_first().expect("leaf chain is non-empty");
        assert_eq!(keys_of(first), [4, 5, 6]);
        check_invariants(&mut t);

        t.destroy();
    }

    #[test]
    fn search_reports_the_landing_leaf_on_misses() {
        let _serial = test_support::init();
        let mut t = new_tree();

        for key in (0..40).map(|i| i * 2) {
            t.insert(key, key as usize, None);
        }

        let (found, leaf) = t.search(21);
        assert_eq!(found, None);
        // The reported leaf is exactly where 21 would live; using it as
        // a hint must produce a valid insert.
        t.insert(21, 21, Some(leaf));
        assert_eq!(t.search(21).0, Some(21));
        check_invariants(&mut t);

        t.destroy();
    }

    #[test]
    fn insert_remove_round_trip_restores_the_tree() {
        let _serial = test_support::init();
        let mut t = new_tree();

        for key in [10, 20, 30, 40] {
            t.insert(key, key as usize, None);
        }

        t.insert(25, 25, None);
        t.remove(25, None);

        assert_eq!(t.count(), 4);
        for key in [10, 20, 30, 40] {
            assert_eq!(t.search(key).0, Some(key as usize));
        }
        check_invariants(&mut t);

        t.destroy();
    }

    #[test]
    fn survives_a_large_shuffled_workload() {
        let _serial = test_support::init();
        let mut t = new_tree();

        // Deterministic pseudo-shuffle of 0..400.
        let keys: Vec<BtreeKey> = (0..400u64).map(|i| (i * 173) % 400).collect();

        for &key in &keys {
            t.insert(key, key as usize + 1, None);
        }
        assert_eq!(t.count(), 400);
        check_invariants(&mut t);

        for &key in &keys {
            assert_eq!(t.search(key).0, Some(key as usize + 1));
        }

        // Remove the odd keys; the evens must survive intact.
        for &key in keys.iter().filter(|k| *k % 2 == 1) {
            t.remove(key, None);
        }
        assert_eq!(t.count(), 200);
        check_invariants(&mut t);

        for key in (0..400).step_by(2) {
            assert_eq!(t.search(key).0, Some(key as usize + 1));
        }
        for key in (1..400).step_by(2) {
            assert_eq!(t.search(key).0, None);
        }

        for key in (0..400).step_by(2) {
            t.remove(key, None);
        }
        assert_eq!(t.count(), 0);
        check_invariants(&mut t);

        t.destroy();
    }

    #[test]
    #[should_panic(expected = "already contains key")]
    fn duplicate_insert_is_a_bug() {
        let _serial = test_support::init();
        let mut t = new_tree();
        t.insert(7, 1, None);
        t.insert(7, 2, None);
    }

    #[test]
    #[should_panic(expected = "does not contain key")]
    fn absent_removal_is_a_bug() {
        let _serial = test_support::init();
        let mut t = new_tree();
        t.insert(7, 1, None);
        t.remove(8, None);
    }
}
