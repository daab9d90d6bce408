use crate::types::RowDescriptor;
use crate::{Error, Result};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Identifier of an invocation frame. Generation-checked: an id whose
/// frame has been popped never matches a later frame in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

/// Identifier of a descriptor handle slot. Generation-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

/// How a frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameExit {
    /// The protected body returned normally.
    Normal,
    /// The protected body raised; descriptors created in it are released.
    Aborted,
}

/// Observable state of a handle, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStatus {
    /// Live references.
    pub refs: usize,
    /// Zero references while still attached to a live frame.
    pub reclaimable: bool,
    /// Attached to a frame.
    pub attached: bool,
    /// The descriptor is still present (not force-released).
    pub has_descriptor: bool,
}

struct HandleState {
    descriptor: Option<Rc<RowDescriptor>>,
    refs: usize,
    frame: Option<FrameId>,
    reclaimable: bool,
}

struct HandleSlot {
    generation: u32,
    state: Option<HandleState>,
}

struct Frame {
    handles: Vec<HandleId>,
    parent: Option<FrameId>,
}

struct FrameSlot {
    generation: u32,
    frame: Option<Frame>,
}

#[derive(Default)]
struct ArenaInner {
    handles: Vec<HandleSlot>,
    free_handles: Vec<u32>,
    frames: Vec<FrameSlot>,
    free_frames: Vec<u32>,
    current: Option<FrameId>,
    live_descriptors: usize,
}

impl ArenaInner {
    fn handle_mut(&mut self, id: HandleId) -> Option<&mut HandleState> {
        self.handles
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_mut())
    }

    fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.frame.as_mut())
    }

    fn frame_alive(&self, id: FrameId) -> bool {
        self.frames
            .get(id.index as usize)
            .map_or(false, |slot| slot.generation == id.generation && slot.frame.is_some())
    }

    fn free_handle(&mut self, id: HandleId) {
        if let Some(slot) = self.handles.get_mut(id.index as usize) {
            if slot.generation != id.generation {
                return;
            }
            if let Some(state) = slot.state.take() {
                if state.descriptor.is_some() {
                    self.live_descriptors -= 1;
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free_handles.push(id.index);
            }
        }
    }

    fn release_descriptor(&mut self, id: HandleId) {
        if let Some(state) = self.handle_mut(id) {
            let had = state.descriptor.take().is_some();
            state.frame = None;
            if had {
                self.live_descriptors -= 1;
            }
        }
    }
}

/// Arena of reference-counted descriptor handles and the stack of
/// invocation frames they are weakly attached to.
///
/// A handle is freed as soon as its last reference goes away, unless it is
/// still attached to an active frame; then it is marked reclaimable and
/// freed when that frame pops. A frame that pops after an error
/// force-releases the descriptors of every handle still referenced, and
/// later reads through those handles observe `None`.
#[derive(Clone, Default)]
pub struct DescriptorArena {
    inner: Rc<RefCell<ArenaInner>>,
}

impl DescriptorArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame on top of the current one and makes it current.
    pub fn push_frame(&self) -> FrameId {
        let mut inner = self.inner.borrow_mut();
        let parent = inner.current;
        let frame = Frame { handles: Vec::new(), parent };
        let id = match inner.free_frames.pop() {
            Some(index) => {
                let slot = &mut inner.frames[index as usize];
                slot.frame = Some(frame);
                FrameId { index, generation: slot.generation }
            }
            None => {
                inner.frames.push(FrameSlot { generation: 0, frame: Some(frame) });
                FrameId { index: (inner.frames.len() - 1) as u32, generation: 0 }
            }
        };
        inner.current = Some(id);
        id
    }

    /// Pops the current frame. Frames must be popped in LIFO order.
    ///
    /// On [`FrameExit::Normal`] reclaimable handles are freed and live ones
    /// move to the enclosing frame (or become detached at top level). On
    /// [`FrameExit::Aborted`] reclaimable handles are freed and live ones
    /// lose their descriptor.
    pub fn pop_frame(&self, id: FrameId, exit: FrameExit) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.current != Some(id) {
            return Err(Error::protocol("invocation frame popped out of order"));
        }
        let slot = &mut inner.frames[id.index as usize];
        let frame = slot.frame.take().ok_or_else(|| Error::internal("current frame vanished"))?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free_frames.push(id.index);
        inner.current = frame.parent;

        let parent = frame.parent.filter(|p| inner.frame_alive(*p));
        let mut released = 0;
        for handle in frame.handles {
            let reclaimable = match inner.handle_mut(handle) {
                Some(state) => state.reclaimable,
                None => continue,
            };
            if reclaimable {
                inner.free_handle(handle);
                continue;
            }
            match exit {
                FrameExit::Normal => {
                    if let Some(state) = inner.handle_mut(handle) {
                        state.frame = parent;
                    }
                    if let Some(p) = parent {
                        if let Some(parent_frame) = inner.frame_mut(p) {
                            parent_frame.handles.push(handle);
                        }
                    }
                }
                FrameExit::Aborted => {
                    inner.release_descriptor(handle);
                    released += 1;
                }
            }
        }
        if released > 0 {
            log::debug!("aborted frame force-released {} row descriptor(s)", released);
        }
        Ok(())
    }

    /// The active frame, if any.
    pub fn current_frame(&self) -> Option<FrameId> {
        self.inner.borrow().current
    }

    /// Allocates a handle with one reference, attached to the current frame.
    pub fn allocate(&self, descriptor: Rc<RowDescriptor>) -> DescriptorHandle {
        let mut inner = self.inner.borrow_mut();
        let frame = inner.current;
        let state = HandleState { descriptor: Some(descriptor), refs: 1, frame, reclaimable: false };
        let id = match inner.free_handles.pop() {
            Some(index) => {
                let slot = &mut inner.handles[index as usize];
                slot.state = Some(state);
                HandleId { index, generation: slot.generation }
            }
            None => {
                inner.handles.push(HandleSlot { generation: 0, state: Some(state) });
                HandleId { index: (inner.handles.len() - 1) as u32, generation: 0 }
            }
        };
        inner.live_descriptors += 1;
        if let Some(frame) = frame {
            if let Some(frame) = inner.frame_mut(frame) {
                frame.handles.push(id);
            }
        }
        DescriptorHandle { arena: Rc::downgrade(&self.inner), id }
    }

    /// Number of allocated handle slots.
    pub fn live_handles(&self) -> usize {
        self.inner.borrow().handles.iter().filter(|s| s.state.is_some()).count()
    }

    /// Number of handles still holding their descriptor.
    pub fn live_descriptors(&self) -> usize {
        self.inner.borrow().live_descriptors
    }

    /// State of a handle, or `None` once freed.
    pub fn status(&self, id: HandleId) -> Option<HandleStatus> {
        let inner = self.inner.borrow();
        let slot = inner.handles.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.state.as_ref().map(|s| HandleStatus {
            refs: s.refs,
            reclaimable: s.reclaimable,
            attached: s.frame.is_some(),
            has_descriptor: s.descriptor.is_some(),
        })
    }
}

fn retain(inner: &RefCell<ArenaInner>, id: HandleId) {
    let mut inner = inner.borrow_mut();
    if let Some(state) = inner.handle_mut(id) {
        state.refs += 1;
        state.reclaimable = false;
    }
}

fn release(inner: &RefCell<ArenaInner>, id: HandleId) {
    let mut inner = inner.borrow_mut();
    let (refs, frame) = match inner.handle_mut(id) {
        Some(state) => {
            state.refs = state.refs.saturating_sub(1);
            (state.refs, state.frame)
        }
        None => return,
    };
    if refs > 0 {
        return;
    }
    match frame {
        Some(frame) if inner.frame_alive(frame) => {
            if let Some(state) = inner.handle_mut(id) {
                state.reclaimable = true;
            }
        }
        _ => inner.free_handle(id),
    }
}

/// Counted reference to a row descriptor. Cloning retains, dropping
/// releases.
pub struct DescriptorHandle {
    arena: Weak<RefCell<ArenaInner>>,
    id: HandleId,
}

impl DescriptorHandle {
    /// The descriptor, or `None` after a force-release (or once the arena
    /// itself is gone).
    pub fn descriptor(&self) -> Option<Rc<RowDescriptor>> {
        let arena = self.arena.upgrade()?;
        let mut inner = arena.borrow_mut();
        inner.handle_mut(self.id).and_then(|s| s.descriptor.clone())
    }

    /// Slot identifier of this handle.
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl Clone for DescriptorHandle {
    fn clone(&self) -> Self {
        if let Some(arena) = self.arena.upgrade() {
            retain(&arena, self.id);
        }
        Self { arena: Weak::clone(&self.arena), id: self.id }
    }
}

impl Drop for DescriptorHandle {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            release(&arena, self.id);
        }
    }
}

impl std::fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHandle").field("id", &self.id).finish()
    }
}
