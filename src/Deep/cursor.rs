// Walks a message's manifest in replay order: roots in registration order, each root's
// descriptors in insertion order, and the element layout of every non-null indirection
// right after its payload (pre-order, element by element).

use std::sync::Arc;

use super::Manifest::{ElementLayout, RecordLayout, TransportDescriptor};

/// One indirection reached by the cursor.
pub(crate) struct IndirectionOp {
    /// Replay position of the descriptor.
    pub ordinal: usize,
    /// Record holding the pointer field.
    pub record: *mut u8,
    /// Address of the pointer field inside `record`.
    pub slot: *mut u8,
    pub descriptor: TransportDescriptor,
    /// Layout of `record`, used when elements share it.
    pub holder: Arc<RecordLayout>,
    /// `(root, field)` for root-level descriptors.
    pub root_field: Option<(usize, usize)>,
    /// Transmitted element count, filled in by the transfer.
    pub count: usize,
    /// Sender: the live target. Receiver: unused until the payload lands.
    pub target: *mut u8,
}

pub(crate) enum Op {
    /// Consecutive root-level inline descriptors `start..end` of `root`.
    InlineRun {
        root: usize,
        start: usize,
        end: usize,
        ordinal: usize,
    },
    Indirection(IndirectionOp),
}

struct Frame {
    layout: Arc<RecordLayout>,
    base: *mut u8,
    elements: usize,
    element: usize,
    index: usize,
    root: Option<usize>,
}

pub(crate) struct ManifestCursor {
    roots: Vec<(Arc<RecordLayout>, *mut u8)>,
    next_root: usize,
    stack: Vec<Frame>,
    ordinal: usize,
}

impl ManifestCursor {
    pub fn new(roots: Vec<(Arc<RecordLayout>, *mut u8)>) -> Self {
        Self {
            roots,
            next_root: 0,
            stack: Vec::new(),
            ordinal: 0,
        }
    }

    /// Descriptors handed out so far.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn next_op(&mut self) -> Option<Op> {
        loop {
            if self.stack.is_empty() {
                let (layout, base) = self.roots.get(self.next_root)?.clone();
                self.stack.push(Frame {
                    layout,
                    base,
                    elements: 1,
                    element: 0,
                    index: 0,
                    root: Some(self.next_root),
                });
                self.next_root += 1;
            }
            let frame = self.stack.last_mut()?;

            let fields = frame.layout.fields();
            if frame.index >= fields.len() {
                frame.element += 1;
                frame.index = 0;
                if frame.element >= frame.elements {
                    self.stack.pop();
                }
                continue;
            }

            let descriptor = &fields[frame.index];
            if descriptor.is_inline() {
                let Some(root) = frame.root else {
                    // Nested inline bytes already arrived with the enclosing payload.
                    frame.index += 1;
                    continue;
                };
                let start = frame.index;
                let end = start + fields[start..].iter().take_while(|d| d.is_inline()).count();
                frame.index = end;
                let ordinal = self.ordinal;
                self.ordinal += end - start;
                return Some(Op::InlineRun {
                    root,
                    start,
                    end,
                    ordinal,
                });
            }

            // Safety: element < elements and every frame base covers elements * size bytes.
            let record = unsafe { frame.base.add(frame.element * frame.layout.size()) };
            let op = IndirectionOp {
                ordinal: self.ordinal,
                record,
                slot: unsafe { record.add(descriptor.offset) },
                descriptor: descriptor.clone(),
                holder: Arc::clone(&frame.layout),
                root_field: frame.root.map(|root| (root, frame.index)),
                count: 0,
                target: std::ptr::null_mut(),
            };
            frame.index += 1;
            self.ordinal += 1;
            return Some(Op::Indirection(op));
        }
    }

    /// Queue the element layout of a completed indirection whose target holds `count` elements.
    pub fn descend(&mut self, op: &IndirectionOp, target: *mut u8, count: usize) {
        let layout = match &op.descriptor.element_layout {
            ElementLayout::Flat => return,
            ElementLayout::Layout(layout) => Arc::clone(layout),
            ElementLayout::SelfLayout => Arc::clone(&op.holder),
        };
        if target.is_null() || count == 0 || !layout.fields().iter().any(|d| d.is_indirection()) {
            return;
        }
        self.stack.push(Frame {
            layout,
            base: target,
            elements: count,
            element: 0,
            index: 0,
            root: None,
        });
    }
}
