use std::cell::RefCell;
use std::rc::Rc;

/// Identifier of a registered cleanup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Transaction lifecycle events reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactEvent {
    /// About to commit.
    PreCommit,
    /// Committed.
    Commit,
    /// Aborted.
    Abort,
    /// About to prepare for two-phase commit.
    PrePrepare,
    /// Prepared for two-phase commit.
    Prepare,
}

impl XactEvent {
    /// True for the events that end the transaction and drain the registry.
    pub fn drains(self) -> bool {
        matches!(self, XactEvent::Commit | XactEvent::Abort | XactEvent::Prepare)
    }
}

type Destructor = Box<dyn FnOnce()>;

#[derive(Default)]
struct RegistryInner {
    entries: Vec<(ResourceId, Destructor)>,
    next_id: u64,
}

/// Global cleanup registry.
///
/// Destructors run in reverse registration order. Each entry is removed
/// from the registry *before* its destructor runs, so a destructor may
/// safely unregister other entries (or re-register) without observing
/// itself.
///
/// # Example
///
/// ```rust
/// use pllua::tracker::CleanupRegistry;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let registry = CleanupRegistry::new();
/// let order = Rc::new(RefCell::new(Vec::new()));
/// for i in 0..3 {
///     let order = Rc::clone(&order);
///     registry.register(move || order.borrow_mut().push(i));
/// }
/// assert_eq!(registry.drain(), 3);
/// assert_eq!(*order.borrow(), vec![2, 1, 0]);
/// ```
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl CleanupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a destructor.
    pub fn register(&self, destructor: impl FnOnce() + 'static) -> ResourceId {
        let mut inner = self.inner.borrow_mut();
        let id = ResourceId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, Box::new(destructor)));
        id
    }

    /// Removes an entry without running its destructor. Returns false when
    /// the entry was not registered (already drained or removed).
    pub fn unregister(&self, id: ResourceId) -> bool {
        // the destructor is dropped after the borrow ends
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let pos = inner.entries.iter().rposition(|(entry, _)| *entry == id);
            pos.map(|pos| inner.entries.remove(pos))
        };
        removed.is_some()
    }

    /// True while `id` is registered.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.inner.borrow().entries.iter().any(|(entry, _)| *entry == id)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Runs every destructor, most recent first, including any registered
    /// by destructors during the drain. Returns how many ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let entry = self.inner.borrow_mut().entries.pop();
            match entry {
                Some((_, destructor)) => {
                    destructor();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry").field("entries", &self.len()).finish()
    }
}
