//! VFS node registry
//!
//! Only the node/handle contract lives in the kernel: a tree of named
//! nodes, each optionally backed by a `NodeOps` object. Nodes without a
//! backing object are directories. Real filesystems are external
//! collaborators; the boot files (`/init`, `/boot/modules/*`) are exposed
//! as memory-backed files so early userland and the module loader have
//! something to read.

pub mod handle;

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

pub use handle::{NodeOps, Stat};

use crate::boot::BootFile;
use crate::error::Errno;

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique inode number.
pub fn alloc_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

/// One name in the tree.
pub struct VfsNode {
    pub name: String,
    /// Backing object; `None` marks a directory.
    pub ops: Option<Arc<dyn NodeOps>>,
    parent: Mutex<Weak<VfsNode>>,
    children: Mutex<BTreeMap<String, Arc<VfsNode>>>,
}

impl core::fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfsNode").field("name", &self.name).finish()
    }
}

impl VfsNode {
    fn new(name: &str, ops: Option<Arc<dyn NodeOps>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ops,
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.ops.is_none()
    }

    pub fn parent(&self) -> Option<Arc<VfsNode>> {
        self.parent.lock().upgrade()
    }

    pub fn lookup_child(&self, name: &str) -> Option<Arc<VfsNode>> {
        self.children.lock().get(name).cloned()
    }

    /// Child names in order; used by `readdir`.
    pub fn child_names(&self) -> Vec<String> {
        self.children.lock().keys().cloned().collect()
    }

    /// All children; used by the module loader's directory sweep.
    pub fn children(&self) -> Vec<Arc<VfsNode>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn stat(&self) -> Stat {
        match &self.ops {
            Some(ops) => ops.stat(),
            None => Stat {
                st_mode: handle::S_IFDIR | 0o755,
                st_nlink: 1,
                ..Default::default()
            },
        }
    }
}

static ROOT: Once<Arc<VfsNode>> = Once::new();

/// The root directory.
pub fn root() -> Arc<VfsNode> {
    ROOT.get().expect("vfs not initialized").clone()
}

/// Build the initial tree from the boot files.
pub fn init(files: &[BootFile]) {
    let root = ROOT.call_once(|| VfsNode::new("", None)).clone();

    // `/dev` always exists so device registration has a home.
    let _ = create_dir(&root, "dev");

    for file in files {
        match publish_boot_file(&root, file) {
            Ok(node) => log::debug!("vfs: boot file \"{}\" ({} bytes)", file.path, node.stat().st_size),
            Err(err) => log::warn!("vfs: cannot publish \"{}\": {}", file.path, err),
        }
    }
}

fn publish_boot_file(root: &Arc<VfsNode>, file: &BootFile) -> Result<Arc<VfsNode>, Errno> {
    let path = file.path.trim_start_matches('/');
    let mut dir = root.clone();
    let mut parts = path.split('/').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            let ops: Arc<dyn NodeOps> =
                Arc::new(handle::MemoryFile::new(file.data, alloc_inode()));
            return create_node(&dir, part, Some(ops));
        }
        dir = match dir.lookup_child(part) {
            Some(existing) => existing,
            None => create_dir(&dir, part)?,
        };
    }
    Err(Errno::EINVAL)
}

/// Create a directory under `parent`.
pub fn create_dir(parent: &Arc<VfsNode>, name: &str) -> Result<Arc<VfsNode>, Errno> {
    create_node(parent, name, None)
}

/// Create a node under `parent`. Fails with EEXIST/ENOTDIR as usual.
pub fn create_node(
    parent: &Arc<VfsNode>,
    name: &str,
    ops: Option<Arc<dyn NodeOps>>,
) -> Result<Arc<VfsNode>, Errno> {
    if !parent.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if name.is_empty() || name.contains('/') {
        return Err(Errno::EINVAL);
    }
    let mut children = parent.children.lock();
    if children.contains_key(name) {
        return Err(Errno::EEXIST);
    }
    let node = VfsNode::new(name, ops);
    *node.parent.lock() = Arc::downgrade(parent);
    children.insert(name.to_string(), node.clone());
    Ok(node)
}

/// Unlink `name` from `parent`. Directories must be empty.
pub fn remove_node(parent: &Arc<VfsNode>, name: &str) -> Result<(), Errno> {
    let mut children = parent.children.lock();
    let node = children.get(name).ok_or(Errno::ENOENT)?;
    if node.is_dir() && !node.children.lock().is_empty() {
        return Err(Errno::ENOTEMPTY);
    }
    children.remove(name);
    Ok(())
}

/// Resolve `path` starting from `start` (ignored for absolute paths).
pub fn lookup(start: &Arc<VfsNode>, path: &str) -> Result<Arc<VfsNode>, Errno> {
    let mut node = if path.starts_with('/') {
        root()
    } else {
        start.clone()
    };
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if let Some(parent) = node.parent() {
                    node = parent;
                }
            }
            name => {
                if !node.is_dir() {
                    return Err(Errno::ENOTDIR);
                }
                node = node.lookup_child(name).ok_or(Errno::ENOENT)?;
            }
        }
    }
    Ok(node)
}

/// Absolute path of `node`, rebuilt through the parent links.
pub fn path_of(node: &Arc<VfsNode>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cur = node.clone();
    while let Some(parent) = cur.parent() {
        parts.push(cur.name.clone());
        cur = parent;
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut path = String::new();
    for part in parts.iter().rev() {
        path.push('/');
        path.push_str(part);
    }
    path
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fresh_tree() -> Arc<VfsNode> {
        // Tests share the global root; namespace each test's nodes.
        init(&[]);
        root()
    }

    #[test]
    fn lookup_walks_directories() {
        let root = fresh_tree();
        let bin = create_dir(&root, "bin-lookup").unwrap();
        let ops: Arc<dyn NodeOps> = Arc::new(handle::MemoryFile::new(b"#!", alloc_inode()));
        create_node(&bin, "sh", Some(ops)).unwrap();

        let node = lookup(&root, "/bin-lookup/sh").expect("path resolves");
        assert_eq!(node.name, "sh");
        assert!(!node.is_dir());
        assert!(matches!(
            lookup(&root, "/bin-lookup/missing"),
            Err(Errno::ENOENT)
        ));
    }

    #[test]
    fn relative_paths_and_dotdot() {
        let root = fresh_tree();
        let a = create_dir(&root, "rel-a").unwrap();
        let b = create_dir(&a, "b").unwrap();

        let resolved = lookup(&b, "../b").expect("dotdot resolves");
        assert_eq!(resolved.name, "b");
        assert_eq!(path_of(&resolved), "/rel-a/b");
    }

    #[test]
    fn duplicate_create_fails() {
        let root = fresh_tree();
        create_dir(&root, "dup-dir").unwrap();
        assert!(matches!(create_dir(&root, "dup-dir"), Err(Errno::EEXIST)));
    }

    #[test]
    fn remove_refuses_populated_directory() {
        let root = fresh_tree();
        let d = create_dir(&root, "rm-dir").unwrap();
        create_dir(&d, "inner").unwrap();
        assert_eq!(remove_node(&root, "rm-dir"), Err(Errno::ENOTEMPTY));
        remove_node(&d, "inner").unwrap();
        remove_node(&root, "rm-dir").unwrap();
        assert!(matches!(lookup(&root, "/rm-dir"), Err(Errno::ENOENT)));
    }

    #[test]
    fn boot_files_appear_in_tree() {
        init(&[crate::boot::BootFile {
            data: b"\x7fELF-ish",
            path: "/boot/modules/demo.ko",
        }]);
        let node = lookup(&root(), "/boot/modules/demo.ko").expect("published");
        let mut buf = [0u8; 4];
        let ops = node.ops.as_ref().expect("file ops");
        assert_eq!(ops.read(0, &mut buf), Ok(4));
        assert_eq!(&buf, b"\x7fELF");
    }
}
