//! Open-upvalue list management
//!
//! Each coroutine chains its open upvalues from a head pointer in strictly
//! descending stack-slot order, at most one node per slot. Closing copies
//! the stack value into the node and unlinks it; closures holding the node
//! keep seeing the captured value.

use crate::heap::{write_barrier, Heap, HeapRef, Upvalue, UpvaluePtr};
use crate::value::TValue;
use crate::vm::CoroutineRuntimeContext;

fn open_slot(heap: &Heap, r: HeapRef) -> usize {
    match heap.upvalue(r).map(|u| u.ptr) {
        Some(UpvaluePtr::Open(slot)) => slot,
        _ => unreachable!("open-upvalue list node is closed or missing"),
    }
}

/// Return the open upvalue aliasing `dst_slot`, creating and linking one in
/// sorted position if none exists. Inserting a new head fires the write
/// barrier on the coroutine; inserting mid-list fires it on the successor
/// whose `prev` link was rewritten.
pub(crate) fn find_or_create(
    rc: &mut CoroutineRuntimeContext,
    heap: &mut Heap,
    dst_slot: usize,
    is_immutable: bool,
) -> HeapRef {
    let head = rc.upvalue_list;
    if head.is_none() || open_slot(heap, head.expect("checked above")) < dst_slot {
        // Empty list, or the new node becomes the head.
        let node = heap.alloc_upvalue(Upvalue {
            ptr: UpvaluePtr::Open(dst_slot),
            is_immutable,
            prev: head,
        });
        rc.upvalue_list = Some(node);
        write_barrier(rc.cell_state);
        return node;
    }

    // Invariant: after the loop, the node is inserted between `cur` and its
    // `prev`.
    let mut cur = head.expect("checked above");
    let mut cur_slot = open_slot(heap, cur);
    let prev;
    loop {
        debug_assert!(dst_slot <= cur_slot);
        if cur_slot == dst_slot {
            // Found an existing open upvalue for that slot.
            return cur;
        }
        let next = heap
            .upvalue(cur)
            .expect("list node is an upvalue cell")
            .prev;
        match next {
            None => {
                // `cur` is the last node.
                prev = None;
                break;
            }
            Some(p) => {
                let prev_slot = open_slot(heap, p);
                debug_assert!(prev_slot < cur_slot);
                if prev_slot < dst_slot {
                    prev = Some(p);
                    break;
                }
                cur = p;
                cur_slot = prev_slot;
            }
        }
    }

    let node = heap.alloc_upvalue(Upvalue {
        ptr: UpvaluePtr::Open(dst_slot),
        is_immutable,
        prev,
    });
    heap.upvalue_mut(cur)
        .expect("list node is an upvalue cell")
        .prev = Some(node);
    heap.barrier(cur);
    node
}

/// Close every open upvalue at or above `base_slot`: copy the stack value
/// inline, mark closed, unlink. Callers must not close into an empty stack.
pub(crate) fn close_upvalues(rc: &mut CoroutineRuntimeContext, heap: &mut Heap, base_slot: usize) {
    let mut cur = rc.upvalue_list;
    while let Some(r) = cur {
        let slot = open_slot(heap, r);
        if slot < base_slot {
            break;
        }
        let value = rc.stack[slot];
        let node = heap.upvalue_mut(r).expect("list node is an upvalue cell");
        cur = node.prev;
        node.ptr = UpvaluePtr::Closed(value);
        node.prev = None;
    }
    rc.upvalue_list = cur;
    if cur.is_some() {
        write_barrier(rc.cell_state);
    }
}

/// Read through an upvalue handle.
pub(crate) fn upvalue_load(rc: &CoroutineRuntimeContext, heap: &Heap, r: HeapRef) -> TValue {
    match heap.upvalue(r).map(|u| u.ptr) {
        Some(UpvaluePtr::Open(slot)) => rc.stack[slot],
        Some(UpvaluePtr::Closed(v)) => v,
        None => unreachable!("function upvalue handle is not an upvalue cell"),
    }
}

/// Write through an upvalue handle.
pub(crate) fn upvalue_store(
    rc: &mut CoroutineRuntimeContext,
    heap: &mut Heap,
    r: HeapRef,
    value: TValue,
) {
    match heap.upvalue(r).map(|u| u.ptr) {
        Some(UpvaluePtr::Open(slot)) => rc.stack[slot] = value,
        Some(UpvaluePtr::Closed(_)) => {
            heap.upvalue_mut(r)
                .expect("checked above")
                .ptr = UpvaluePtr::Closed(value);
            heap.barrier(r);
        }
        None => unreachable!("function upvalue handle is not an upvalue cell"),
    }
}
