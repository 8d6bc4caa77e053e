//! Memory-mapped, page-oriented keyed trunk: a B+tree-like index with
//! shadow paging.
//!
//! Every write transaction copies the touched node path to fresh pages and
//! commits by writing the meta into the alternate of two slots (highest valid
//! sequence wins at open), so a crash at any point leaves the previous
//! committed tree intact. Pages retired by a transaction re-enter the free
//! chain only after the commit that retired them is durable, which keeps the
//! fallback meta's tree readable.
//!
//! No multi-version history is retained; `get_history` is unsupported.

mod pages;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use acorn_core::{import_wins, AcornError, AcornResult, NutShell, Trunk, TrunkCaps};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use pages::{
    Meta, Node, ValRef, INLINE_MAX, MAX_KEY_LEN, OVERFLOW_CAP, PAGE_FREE, PAGE_OVERFLOW,
    PAGE_SIZE,
};

/// File growth quantum, in pages.
const GROWTH_PAGES: u64 = 64;

pub struct PagedKeyedTrunk {
    inner: RwLock<PagedInner>,
    path: PathBuf,
}

impl PagedKeyedTrunk {
    pub fn open(path: impl Into<PathBuf>) -> AcornResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(GROWTH_PAGES * PAGE_SIZE as u64)?;
        }
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let meta = if fresh {
            let meta = Meta::initial();
            let offset = meta.slot() as usize * PAGE_SIZE;
            mmap[offset..offset + 52].copy_from_slice(&meta.encode());
            mmap.flush()?;
            meta
        } else {
            // Two meta slots; newest valid sequence wins. A torn meta write
            // leaves the other slot intact.
            let slot_a = Meta::decode(&mmap[0..PAGE_SIZE]);
            let slot_b = Meta::decode(&mmap[PAGE_SIZE..2 * PAGE_SIZE]);
            match (slot_a, slot_b) {
                (Some(a), Some(b)) => {
                    if a.sequence >= b.sequence {
                        a
                    } else {
                        b
                    }
                }
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => {
                    return Err(AcornError::Storage(format!(
                        "both meta slots of {} are corrupt",
                        path.display()
                    )))
                }
            }
        };

        tracing::debug!(
            path = %path.display(),
            sequence = meta.sequence,
            entries = meta.entry_count,
            "opened paged trunk"
        );

        Ok(PagedKeyedTrunk {
            inner: RwLock::new(PagedInner {
                file,
                mmap,
                meta,
                work: meta,
                pending_free: Vec::new(),
                free_ready: Vec::new(),
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.read().meta.entry_count
    }

    pub fn committed_sequence(&self) -> u64 {
        self.inner.read().meta.sequence
    }
}

impl Trunk for PagedKeyedTrunk {
    fn save(&self, shell: NutShell) -> AcornResult<()> {
        if shell.id.len() > MAX_KEY_LEN {
            return Err(AcornError::InvalidInput(format!(
                "id longer than {MAX_KEY_LEN} bytes"
            )));
        }
        let mut inner = self.inner.write();
        inner.begin();
        let result = save_in_txn(&mut inner, &shell);
        match result {
            Ok(()) => inner.commit(),
            Err(err) => {
                inner.abort();
                Err(err)
            }
        }
    }

    fn load(&self, id: &str) -> AcornResult<Option<NutShell>> {
        let inner = self.inner.read();
        match inner.find(id.as_bytes())? {
            Some(val) => {
                let bytes = inner.read_value(&val)?;
                NutShell::from_bytes(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    fn delete(&self, id: &str) -> AcornResult<()> {
        let mut inner = self.inner.write();
        if inner.find(id.as_bytes())?.is_none() {
            return Ok(());
        }
        inner.begin();
        let result = inner.remove(id.as_bytes());
        match result {
            Ok(()) => inner.commit(),
            Err(err) => {
                inner.abort();
                Err(err)
            }
        }
    }

    fn load_all(&self) -> AcornResult<Vec<NutShell>> {
        Ok(self
            .inner
            .read()
            .scan()?
            .into_iter()
            .filter(|shell| !shell.deleted)
            .collect())
    }

    fn export_changes(&self) -> AcornResult<Vec<NutShell>> {
        self.inner.read().scan()
    }

    fn import(&self, shells: Vec<NutShell>) -> AcornResult<()> {
        for shell in shells {
            let wins = import_wins(self.load(&shell.id)?.as_ref(), &shell);
            if wins {
                self.save(shell)?;
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> TrunkCaps {
        TrunkCaps {
            history: false,
            durable: true,
            async_io: false,
            sync_export: true,
        }
    }

    fn flush(&self) -> AcornResult<()> {
        self.inner.read().mmap.flush()?;
        Ok(())
    }
}

fn save_in_txn(inner: &mut PagedInner, shell: &NutShell) -> AcornResult<()> {
    let bytes = shell.to_bytes();
    let val = if bytes.len() <= INLINE_MAX {
        ValRef::Inline(bytes)
    } else {
        let (first_page, total_len) = inner.write_overflow(&bytes)?;
        ValRef::Overflow {
            total_len,
            first_page,
        }
    };
    let replaced = inner.insert(shell.id.as_bytes().to_vec(), val)?;
    if !replaced {
        inner.work.entry_count += 1;
    }
    Ok(())
}

struct PagedInner {
    file: File,
    mmap: MmapMut,
    /// Last committed state.
    meta: Meta,
    /// Working copy inside a transaction.
    work: Meta,
    /// Pages retired by the in-flight transaction.
    pending_free: Vec<u64>,
    /// Pages retired by the previous (durable) commit; linked into the free
    /// chain when the next transaction begins.
    free_ready: Vec<u64>,
}

/// Result of rewriting one level of the tree: the replacement page, plus
/// `(separator, page)` siblings when the node had to split. Splits are
/// size-aware and may be more than two ways, so a page never overflows no
/// matter how entry sizes are skewed.
struct CowResult {
    first: u64,
    rest: Vec<(Vec<u8>, u64)>,
}

impl PagedInner {
    fn page(&self, id: u64) -> &[u8] {
        let start = id as usize * PAGE_SIZE;
        &self.mmap[start..start + PAGE_SIZE]
    }

    fn page_mut(&mut self, id: u64) -> &mut [u8] {
        let start = id as usize * PAGE_SIZE;
        &mut self.mmap[start..start + PAGE_SIZE]
    }

    fn begin(&mut self) {
        self.work = self.meta;
        // Pages retired by the previous durable commit join the free chain
        // now; only metas older than the fallback window reference them.
        for id in std::mem::take(&mut self.free_ready) {
            let head = self.work.free_head;
            let page = self.page_mut(id);
            page[0] = PAGE_FREE;
            page[1..9].copy_from_slice(&head.to_le_bytes());
            self.work.free_head = id;
        }
    }

    fn commit(&mut self) -> AcornResult<()> {
        // Data pages must be durable before the meta that references them.
        self.mmap.flush()?;
        self.work.sequence = self.meta.sequence + 1;
        let offset = self.work.slot() as usize * PAGE_SIZE;
        let encoded = self.work.encode();
        self.mmap[offset..offset + encoded.len()].copy_from_slice(&encoded);
        self.mmap.flush_range(offset, PAGE_SIZE)?;
        self.meta = self.work;
        self.free_ready = std::mem::take(&mut self.pending_free);
        Ok(())
    }

    /// All transaction writes went to fresh pages, so dropping the working
    /// meta is a complete rollback. Chain links already written for
    /// `free_ready` pages are lost (they leak) but harm nothing.
    fn abort(&mut self) {
        self.pending_free.clear();
        self.work = self.meta;
    }

    fn alloc(&mut self) -> AcornResult<u64> {
        if self.work.free_head != 0 {
            let id = self.work.free_head;
            let page = self.page(id);
            if page[0] != PAGE_FREE {
                return Err(AcornError::Storage("free chain is corrupt".into()));
            }
            let next = u64::from_le_bytes(page[1..9].try_into().expect("8 bytes"));
            self.work.free_head = next;
            return Ok(id);
        }
        let id = self.work.next_page_id;
        self.work.next_page_id += 1;
        self.ensure_capacity(id + 1)?;
        Ok(id)
    }

    fn ensure_capacity(&mut self, pages: u64) -> AcornResult<()> {
        let needed = pages * PAGE_SIZE as u64;
        if (self.mmap.len() as u64) >= needed {
            return Ok(());
        }
        let new_pages = pages.div_ceil(GROWTH_PAGES) * GROWTH_PAGES;
        self.mmap.flush()?;
        self.file.set_len(new_pages * PAGE_SIZE as u64)?;
        self.mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }

    fn write_node(&mut self, id: u64, node: &Node) -> AcornResult<()> {
        self.ensure_capacity(id + 1)?;
        node.encode_into(self.page_mut(id));
        Ok(())
    }

    fn find(&self, key: &[u8]) -> AcornResult<Option<ValRef>> {
        let mut page_id = self.meta.root_page;
        if page_id == 0 {
            return Ok(None);
        }
        loop {
            match Node::decode(self.page(page_id))? {
                Node::Internal {
                    children,
                    separators,
                } => {
                    let idx = separators.partition_point(|sep| sep.as_slice() <= key);
                    page_id = children[idx];
                }
                Node::Leaf(entries) => {
                    return Ok(entries
                        .into_iter()
                        .find(|(k, _)| k.as_slice() == key)
                        .map(|(_, val)| val));
                }
            }
        }
    }

    fn read_value(&self, val: &ValRef) -> AcornResult<Vec<u8>> {
        match val {
            ValRef::Inline(bytes) => Ok(bytes.clone()),
            ValRef::Overflow {
                total_len,
                first_page,
            } => {
                let mut out = Vec::with_capacity(*total_len as usize);
                let mut page_id = *first_page;
                while page_id != 0 {
                    let page = self.page(page_id);
                    if page[0] != PAGE_OVERFLOW {
                        return Err(AcornError::Storage("overflow chain is corrupt".into()));
                    }
                    let next = u64::from_le_bytes(page[1..9].try_into().expect("8 bytes"));
                    let len =
                        u32::from_le_bytes(page[9..13].try_into().expect("4 bytes")) as usize;
                    out.extend_from_slice(&page[13..13 + len]);
                    page_id = next;
                }
                if out.len() as u64 != *total_len {
                    return Err(AcornError::Storage(
                        "overflow chain length mismatch".into(),
                    ));
                }
                Ok(out)
            }
        }
    }

    fn write_overflow(&mut self, bytes: &[u8]) -> AcornResult<(u64, u64)> {
        let chunk_count = bytes.len().div_ceil(OVERFLOW_CAP);
        let mut ids = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            ids.push(self.alloc()?);
        }
        for (i, chunk) in bytes.chunks(OVERFLOW_CAP).enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(0);
            let page = self.page_mut(ids[i]);
            page.fill(0);
            page[0] = PAGE_OVERFLOW;
            page[1..9].copy_from_slice(&next.to_le_bytes());
            page[9..13].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            page[13..13 + chunk.len()].copy_from_slice(chunk);
        }
        Ok((ids[0], bytes.len() as u64))
    }

    fn free_overflow(&mut self, first_page: u64) -> AcornResult<()> {
        let mut page_id = first_page;
        while page_id != 0 {
            let page = self.page(page_id);
            if page[0] != PAGE_OVERFLOW {
                return Err(AcornError::Storage("overflow chain is corrupt".into()));
            }
            let next = u64::from_le_bytes(page[1..9].try_into().expect("8 bytes"));
            self.pending_free.push(page_id);
            page_id = next;
        }
        Ok(())
    }

    /// Copy-on-write insert. Returns true when an existing key was replaced.
    fn insert(&mut self, key: Vec<u8>, val: ValRef) -> AcornResult<bool> {
        if self.work.root_page == 0 {
            let page = self.alloc()?;
            self.write_node(page, &Node::Leaf(vec![(key, val)]))?;
            self.work.root_page = page;
            return Ok(false);
        }

        // Descend to the leaf, remembering each internal node and the child
        // slot taken.
        let mut path: Vec<(u64, Vec<u64>, Vec<Vec<u8>>, usize)> = Vec::new();
        let mut page_id = self.work.root_page;
        let (mut entries, leaf_page) = loop {
            match Node::decode(self.page(page_id))? {
                Node::Internal {
                    children,
                    separators,
                } => {
                    let idx = separators.partition_point(|sep| sep.as_slice() <= key.as_slice());
                    let next = children[idx];
                    path.push((page_id, children, separators, idx));
                    page_id = next;
                }
                Node::Leaf(entries) => break (entries, page_id),
            }
        };

        let replaced = match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key.as_slice())) {
            Ok(i) => {
                let old = std::mem::replace(&mut entries[i].1, val);
                if let ValRef::Overflow { first_page, .. } = old {
                    self.free_overflow(first_page)?;
                }
                true
            }
            Err(i) => {
                entries.insert(i, (key, val));
                false
            }
        };

        self.pending_free.push(leaf_page);
        let mut outcome = self.write_leaf_level(entries)?;

        // Rewrite the path bottom-up, splicing in any new siblings.
        for (old_page, mut children, mut separators, idx) in path.into_iter().rev() {
            self.pending_free.push(old_page);
            children[idx] = outcome.first;
            for (offset, (sep, page)) in outcome.rest.into_iter().enumerate() {
                separators.insert(idx + offset, sep);
                children.insert(idx + 1 + offset, page);
            }
            outcome = self.write_internal_level(children, separators)?;
        }

        self.work.root_page = if outcome.rest.is_empty() {
            outcome.first
        } else {
            let mut children = vec![outcome.first];
            let mut separators = Vec::with_capacity(outcome.rest.len());
            for (sep, page) in outcome.rest {
                separators.push(sep);
                children.push(page);
            }
            let page = self.alloc()?;
            self.write_node(
                page,
                &Node::Internal {
                    children,
                    separators,
                },
            )?;
            page
        };
        Ok(replaced)
    }

    /// Write a leaf's entries, packing into as many pages as their sizes
    /// require. Any single entry fits a page on its own (inline and key caps
    /// guarantee it), so packing always succeeds.
    fn write_leaf_level(&mut self, entries: Vec<(Vec<u8>, ValRef)>) -> AcornResult<CowResult> {
        let whole = Node::Leaf(entries);
        if whole.fits() {
            let page = self.alloc()?;
            self.write_node(page, &whole)?;
            return Ok(CowResult {
                first: page,
                rest: Vec::new(),
            });
        }
        let Node::Leaf(entries) = whole else {
            unreachable!("constructed a leaf above");
        };

        let mut groups: Vec<Vec<(Vec<u8>, ValRef)>> = vec![Vec::new()];
        let mut acc = 3usize;
        for entry in entries {
            let len = Self::leaf_entry_len(&entry);
            let current = groups.last_mut().expect("at least one group");
            if acc + len > PAGE_SIZE && !current.is_empty() {
                groups.push(vec![entry]);
                acc = 3 + len;
            } else {
                current.push(entry);
                acc += len;
            }
        }

        let mut first = None;
        let mut rest = Vec::new();
        for group in groups {
            let separator = group[0].0.clone();
            let page = self.alloc()?;
            self.write_node(page, &Node::Leaf(group))?;
            match first {
                None => first = Some(page),
                Some(_) => rest.push((separator, page)),
            }
        }
        Ok(CowResult {
            first: first.expect("split produced at least one leaf"),
            rest,
        })
    }

    /// Write one internal level, partitioning children when the node
    /// overflows. Separators between partitions are promoted to the caller.
    fn write_internal_level(
        &mut self,
        children: Vec<u64>,
        separators: Vec<Vec<u8>>,
    ) -> AcornResult<CowResult> {
        let whole = Node::Internal {
            children,
            separators,
        };
        if whole.fits() {
            let page = self.alloc()?;
            self.write_node(page, &whole)?;
            return Ok(CowResult {
                first: page,
                rest: Vec::new(),
            });
        }
        let Node::Internal {
            children,
            separators,
        } = whole
        else {
            unreachable!("constructed an internal node above");
        };

        // (promoted separator before the group, the group itself)
        let mut groups: Vec<(Option<Vec<u8>>, Vec<u64>, Vec<Vec<u8>>)> = Vec::new();
        let mut child_iter = children.into_iter();
        let mut group_children = vec![child_iter.next().expect("internal has a child")];
        let mut group_seps: Vec<Vec<u8>> = Vec::new();
        let mut promote: Option<Vec<u8>> = None;
        let mut acc = 3 + 8usize;
        for (sep, child) in separators.into_iter().zip(child_iter) {
            let len = 2 + sep.len() + 8;
            if acc + len > PAGE_SIZE {
                groups.push((
                    promote.take(),
                    std::mem::take(&mut group_children),
                    std::mem::take(&mut group_seps),
                ));
                promote = Some(sep);
                group_children.push(child);
                acc = 3 + 8;
            } else {
                group_seps.push(sep);
                group_children.push(child);
                acc += len;
            }
        }
        groups.push((promote.take(), group_children, group_seps));

        let mut first = None;
        let mut rest = Vec::new();
        for (promoted, children, separators) in groups {
            let page = self.alloc()?;
            self.write_node(
                page,
                &Node::Internal {
                    children,
                    separators,
                },
            )?;
            match (first, promoted) {
                (None, _) => first = Some(page),
                (Some(_), Some(sep)) => rest.push((sep, page)),
                (Some(_), None) => {
                    return Err(AcornError::Storage(
                        "internal split lost a separator".into(),
                    ))
                }
            }
        }
        Ok(CowResult {
            first: first.expect("split produced at least one node"),
            rest,
        })
    }

    /// Copy-on-write removal. Leaves may go empty; they are not merged.
    fn remove(&mut self, key: &[u8]) -> AcornResult<()> {
        let mut path: Vec<(u64, Vec<u64>, Vec<Vec<u8>>, usize)> = Vec::new();
        let mut page_id = self.work.root_page;
        let (mut entries, leaf_page) = loop {
            match Node::decode(self.page(page_id))? {
                Node::Internal {
                    children,
                    separators,
                } => {
                    let idx = separators.partition_point(|sep| sep.as_slice() <= key);
                    let next = children[idx];
                    path.push((page_id, children, separators, idx));
                    page_id = next;
                }
                Node::Leaf(entries) => break (entries, page_id),
            }
        };

        let Ok(i) = entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) else {
            return Ok(());
        };
        let (_, old_val) = entries.remove(i);
        if let ValRef::Overflow { first_page, .. } = old_val {
            self.free_overflow(first_page)?;
        }

        self.pending_free.push(leaf_page);
        let page = self.alloc()?;
        self.write_node(page, &Node::Leaf(entries))?;
        let mut child = page;
        for (old_page, mut children, separators, idx) in path.into_iter().rev() {
            self.pending_free.push(old_page);
            children[idx] = child;
            let node = Node::Internal {
                children,
                separators,
            };
            let page = self.alloc()?;
            self.write_node(page, &node)?;
            child = page;
        }
        self.work.root_page = child;
        self.work.entry_count = self.work.entry_count.saturating_sub(1);
        Ok(())
    }

    fn leaf_entry_len(entry: &(Vec<u8>, ValRef)) -> usize {
        2 + entry.0.len()
            + 1
            + match &entry.1 {
                ValRef::Inline(bytes) => 4 + bytes.len(),
                ValRef::Overflow { .. } => 16,
            }
    }

    fn scan(&self) -> AcornResult<Vec<NutShell>> {
        let mut out = Vec::new();
        if self.meta.root_page == 0 {
            return Ok(out);
        }
        let mut stack = vec![self.meta.root_page];
        while let Some(page_id) = stack.pop() {
            match Node::decode(self.page(page_id))? {
                Node::Internal { children, .. } => stack.extend(children),
                Node::Leaf(entries) => {
                    for (_, val) in &entries {
                        let bytes = self.read_value(val)?;
                        out.push(NutShell::from_bytes(&bytes)?);
                    }
                }
            }
        }
        Ok(out)
    }
}
