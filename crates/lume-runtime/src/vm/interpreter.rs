//! Instruction dispatch and the call/return/tail-call protocol
//!
//! Dispatch is a trampoline: one outer loop owns the `(frame base, bytecode
//! offset)` state, and calls, tail calls and returns mutate that state
//! instead of growing the native stack. Tail calls additionally slide the
//! assembled frame down over the caller's region, so unbounded self tail
//! calls run in O(1) stack slots.

use std::rc::Rc;

use crate::bytecode::{
    decode_opcode, instruction_size, read_i16, read_i32, read_u16, read_u32, read_u64, read_u8,
    CodeBlock, CodeBlockId, Opcode, UcbId,
};
use crate::heap::{ExecutableCode, FunctionObject, HeapRef};
use crate::stdlib;
use crate::table::TableKey;
use crate::value::{RuntimeError, TValue};

use super::frame::{self, FrameHeader, ReturnTarget, FRAME_HEADER_SLOTS};
use super::upvalues;
use super::Vm;

/// Returns always leave at least this many values (nil-filled), so callers
/// expecting up to this many can copy without counting.
pub(crate) const MIN_NIL_FILL_RETURN_VALUES: u32 = 3;

/// Where the trampoline goes after a return path resolves.
enum Flow {
    /// The top-level frame returned; values surface to the host.
    Done(Vec<TValue>),
    /// Resume a bytecode frame.
    Resume { base: usize, offset: usize },
}

/// Where the trampoline goes after a call transfers.
enum Transfer {
    /// A bytecode callee was entered.
    Enter { base: usize },
    /// A native callee ran to completion and its return path resolved.
    Finished(Flow),
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CallKind {
    Normal,
    Tail,
}

fn truncated(at: usize) -> RuntimeError {
    RuntimeError::bytecode(format!("truncated instruction at offset {at}"))
}

fn rd_u8(cb: &CodeBlock, at: usize) -> Result<u8, RuntimeError> {
    read_u8(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn rd_u16(cb: &CodeBlock, at: usize) -> Result<u16, RuntimeError> {
    read_u16(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn rd_i16(cb: &CodeBlock, at: usize) -> Result<i16, RuntimeError> {
    read_i16(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn rd_u32(cb: &CodeBlock, at: usize) -> Result<u32, RuntimeError> {
    read_u32(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn rd_i32(cb: &CodeBlock, at: usize) -> Result<i32, RuntimeError> {
    read_i32(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn rd_u64(cb: &CodeBlock, at: usize) -> Result<u64, RuntimeError> {
    read_u64(&cb.bytecode, at).ok_or_else(|| truncated(at))
}

fn local_index(base: usize, slot: i32) -> Result<usize, RuntimeError> {
    if slot < 0 {
        return Err(RuntimeError::bytecode(format!(
            "expected a frame-local slot, got constant ordinal {slot}"
        )));
    }
    Ok(base + slot as usize)
}

/// Branch offsets are byte deltas from the branching instruction's start.
fn branch_target(offset: usize, delta: i32) -> Result<usize, RuntimeError> {
    let target = offset as i64 + delta as i64;
    if target < 0 {
        return Err(RuntimeError::bytecode(
            "branch target before start of function",
        ));
    }
    Ok(target as usize)
}

/// Modulo with `a - floor(a/b)*b` semantics: fmod, sign-corrected when the
/// truncated and floored quotients differ.
fn floored_fmod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

impl Vm {
    fn current_code_block(&self) -> Result<Rc<CodeBlock>, RuntimeError> {
        let id = self
            .rc
            .code_block
            .ok_or_else(|| RuntimeError::bytecode("no code block to execute"))?;
        self.code_blocks
            .get(id.index())
            .cloned()
            .ok_or_else(|| RuntimeError::bytecode("stale code block id"))
    }

    fn stack_get(&self, at: usize) -> Result<TValue, RuntimeError> {
        self.rc
            .stack
            .get(at)
            .copied()
            .ok_or_else(|| RuntimeError::bytecode("stack slot out of range"))
    }

    fn stack_set(&mut self, at: usize, v: TValue) -> Result<(), RuntimeError> {
        match self.rc.stack.get_mut(at) {
            Some(slot) => {
                *slot = v;
                Ok(())
            }
            None => Err(RuntimeError::bytecode("stack slot out of range")),
        }
    }

    fn local_get(&self, base: usize, slot: i32) -> Result<TValue, RuntimeError> {
        self.stack_get(local_index(base, slot)?)
    }

    fn local_set(&mut self, base: usize, slot: i32, v: TValue) -> Result<(), RuntimeError> {
        self.stack_set(local_index(base, slot)?, v)
    }

    /// Resolve a slot-or-constant operand.
    fn slot_get(&self, cb: &CodeBlock, base: usize, slot: i32) -> Result<TValue, RuntimeError> {
        if slot >= 0 {
            self.stack_get(base + slot as usize)
        } else {
            cb.constant_value(slot)
        }
    }

    /// Absolute stack index `rel` slots from `base` (negative reaches into
    /// the varargs region below the frame header).
    fn rel_index(&self, base: usize, rel: i32) -> Result<usize, RuntimeError> {
        let at = base as i64 + rel as i64;
        if at < 0 || at as usize >= self.rc.stack.len() {
            return Err(RuntimeError::bytecode("frame-relative slot out of range"));
        }
        Ok(at as usize)
    }

    fn frame_function(&self, base: usize) -> Result<&FunctionObject, RuntimeError> {
        let func = frame::read_header(&self.rc.stack, base).func;
        if !func.is_pointer() {
            return Err(RuntimeError::bytecode(
                "frame header does not hold a function",
            ));
        }
        self.heap
            .function(func.as_pointer())
            .ok_or_else(|| RuntimeError::bytecode("frame header does not hold a function"))
    }

    fn table_of(&self, tv: TValue) -> Result<HeapRef, RuntimeError> {
        if tv.is_pointer() {
            let r = tv.as_pointer();
            if self.heap.table(r).is_some() {
                return Ok(r);
            }
        }
        Err(RuntimeError::type_error(format!(
            "attempt to index a {} value",
            self.type_name(tv)
        )))
    }

    fn name_constant(&self, cb: &CodeBlock, ord: i32) -> Result<HeapRef, RuntimeError> {
        let tv = cb.constant_value(ord)?;
        if tv.is_pointer() && self.heap.str_value(tv.as_pointer()).is_some() {
            return Ok(tv.as_pointer());
        }
        Err(RuntimeError::bytecode("name constant is not a string"))
    }

    fn arith(&self, op: Opcode, lhs: TValue, rhs: TValue) -> Result<TValue, RuntimeError> {
        if lhs.is_double() && rhs.is_double() {
            let a = lhs.as_double();
            let b = rhs.as_double();
            let result = match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                Opcode::Mod => floored_fmod(a, b),
                _ => unreachable!("not an arithmetic opcode"),
            };
            return Ok(TValue::create_double(result));
        }
        let offending = if lhs.is_double() { rhs } else { lhs };
        Err(RuntimeError::type_error(format!(
            "attempt to perform arithmetic on a {} value",
            self.type_name(offending)
        )))
    }

    /// The dispatch loop. `start_base` is the frame base of an
    /// already-assembled frame whose code block is current.
    pub(crate) fn run(&mut self, start_base: usize) -> Result<Vec<TValue>, RuntimeError> {
        let mut base = start_base;
        let mut offset = 0usize;
        let mut cb = self.current_code_block()?;

        loop {
            let byte = rd_u8(&cb, offset)?;
            let op = decode_opcode(byte).ok_or_else(|| {
                RuntimeError::bytecode(format!("invalid opcode byte {byte:#04x} at {offset}"))
            })?;
            let size = instruction_size(op);

            match op {
                // ── Locals and constants ────────────────────────────────────
                Opcode::Move => {
                    let src = rd_i32(&cb, offset + 1)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let v = self.slot_get(&cb, base, src)?;
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::Constant => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let v = TValue::from_raw(rd_u64(&cb, offset + 5)?);
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::FillNil => {
                    let first = rd_i32(&cb, offset + 1)?;
                    let count = rd_u32(&cb, offset + 5)? as usize;
                    let begin = local_index(base, first)?;
                    if begin + count > self.rc.stack.len() {
                        return Err(RuntimeError::bytecode("nil fill out of range"));
                    }
                    self.rc.stack[begin..begin + count].fill(TValue::nil());
                    offset += size;
                }

                // ── Upvalues ────────────────────────────────────────────────
                Opcode::UpvalueGet => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let index = rd_u16(&cb, offset + 5)? as usize;
                    let uv = *self
                        .frame_function(base)?
                        .upvalues
                        .get(index)
                        .ok_or_else(|| RuntimeError::bytecode("upvalue ordinal out of range"))?;
                    let v = upvalues::upvalue_load(&self.rc, &self.heap, uv);
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::UpvaluePut => {
                    let src = rd_i32(&cb, offset + 1)?;
                    let index = rd_u16(&cb, offset + 5)? as usize;
                    let v = self.slot_get(&cb, base, src)?;
                    let uv = *self
                        .frame_function(base)?
                        .upvalues
                        .get(index)
                        .ok_or_else(|| RuntimeError::bytecode("upvalue ordinal out of range"))?;
                    upvalues::upvalue_store(&mut self.rc, &mut self.heap, uv, v);
                    offset += size;
                }
                Opcode::UpvalueClose => {
                    let first = rd_i32(&cb, offset + 1)?;
                    let delta = rd_i32(&cb, offset + 5)?;
                    let at = local_index(base, first)?;
                    upvalues::close_upvalues(&mut self.rc, &mut self.heap, at);
                    offset = branch_target(offset, delta)?;
                }

                // ── Globals ─────────────────────────────────────────────────
                Opcode::GlobalGet => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let name = self.name_constant(&cb, rd_i32(&cb, offset + 5)?)?;
                    let v = self
                        .heap
                        .table(self.rc.global_object)
                        .ok_or_else(|| RuntimeError::bytecode("global object is not a table"))?
                        .get_str(name);
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::GlobalPut => {
                    let src = rd_i32(&cb, offset + 1)?;
                    let name = self.name_constant(&cb, rd_i32(&cb, offset + 5)?)?;
                    let v = self.local_get(base, src)?;
                    let global = self.rc.global_object;
                    self.heap
                        .table_mut(global)
                        .ok_or_else(|| RuntimeError::bytecode("global object is not a table"))?
                        .put_str(name, v);
                    self.heap.barrier(global);
                    offset += size;
                }

                // ── Table access ────────────────────────────────────────────
                Opcode::TableGetById => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let name = self.name_constant(&cb, rd_i32(&cb, offset + 9)?)?;
                    let table = self.table_of(tv_base)?;
                    let v = self.heap.table(table).expect("checked by table_of").get_str(name);
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::TablePutById => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let src = rd_i32(&cb, offset + 5)?;
                    let name = self.name_constant(&cb, rd_i32(&cb, offset + 9)?)?;
                    let table = self.table_of(tv_base)?;
                    let v = self.local_get(base, src)?;
                    self.heap
                        .table_mut(table)
                        .expect("checked by table_of")
                        .put_str(name, v);
                    self.heap.barrier(table);
                    offset += size;
                }
                Opcode::TableGetByVal => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let index = self.local_get(base, rd_i32(&cb, offset + 9)?)?;
                    let table = self.table_of(tv_base)?;
                    let v = {
                        let t = self.heap.table(table).expect("checked by table_of");
                        if index.is_int32() {
                            t.get_int(index.as_int32() as i64)
                        } else if index.is_double() {
                            t.get_double(index.as_double())
                        } else {
                            match TableKey::for_get(&self.heap, index) {
                                Some(key) => t.get(&key),
                                None => TValue::nil(),
                            }
                        }
                    };
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::TablePutByVal => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let src = rd_i32(&cb, offset + 5)?;
                    let index = self.local_get(base, rd_i32(&cb, offset + 9)?)?;
                    let table = self.table_of(tv_base)?;
                    let v = self.local_get(base, src)?;
                    if index.is_int32() {
                        self.heap
                            .table_mut(table)
                            .expect("checked by table_of")
                            .put_int(index.as_int32() as i64, v);
                    } else if index.is_double() {
                        self.heap
                            .table_mut(table)
                            .expect("checked by table_of")
                            .put_double(index.as_double(), v)?;
                    } else {
                        let key = TableKey::for_put(&self.heap, index)?;
                        self.heap
                            .table_mut(table)
                            .expect("checked by table_of")
                            .put(key, v);
                    }
                    self.heap.barrier(table);
                    offset += size;
                }
                Opcode::TableGetByIntegerVal => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let index = rd_i16(&cb, offset + 9)?;
                    let table = self.table_of(tv_base)?;
                    let v = self
                        .heap
                        .table(table)
                        .expect("checked by table_of")
                        .get_int(index as i64);
                    self.local_set(base, dst, v)?;
                    offset += size;
                }
                Opcode::TablePutByIntegerVal => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let src = rd_i32(&cb, offset + 5)?;
                    let index = rd_i16(&cb, offset + 9)?;
                    let table = self.table_of(tv_base)?;
                    let v = self.local_get(base, src)?;
                    self.heap
                        .table_mut(table)
                        .expect("checked by table_of")
                        .put_int(index as i64, v);
                    self.heap.barrier(table);
                    offset += size;
                }
                Opcode::TableVariadicPutSeq => {
                    let tv_base = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let start = rd_i32(&cb, offset + 5)? as i64;
                    let table = self.table_of(tv_base)?;
                    let count = self.rc.num_variadic_rets as usize;
                    if count > 0 {
                        let src = self.rel_index(base, self.rc.variadic_ret_slot_begin)?;
                        if src + count > self.rc.stack.len() {
                            return Err(RuntimeError::bytecode("variadic slice out of range"));
                        }
                        for i in 0..count {
                            let v = self.rc.stack[src + i];
                            self.heap
                                .table_mut(table)
                                .expect("checked by table_of")
                                .put_int(start + i as i64, v);
                        }
                        self.heap.barrier(table);
                    }
                    offset += size;
                }

                // ── Table construction ──────────────────────────────────────
                Opcode::TableNew => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let stepping = rd_u8(&cb, offset + 5)?;
                    let hint = rd_u16(&cb, offset + 6)?;
                    let t = crate::table::TableObject::new(stepping as usize, hint as usize);
                    let r = self.heap.alloc_table(t);
                    self.local_set(base, dst, TValue::create_pointer(r))?;
                    offset += size;
                }
                Opcode::TableDup => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let tpl_tv = cb.constant_value(rd_i32(&cb, offset + 5)?)?;
                    let tpl = self.table_of(tpl_tv).map_err(|_| {
                        RuntimeError::bytecode("table template constant is not a table")
                    })?;
                    let cloned = self.heap.table(tpl).expect("checked above").shallow_clone();
                    let r = self.heap.alloc_table(cloned);
                    self.local_set(base, dst, TValue::create_pointer(r))?;
                    offset += size;
                }

                // ── Calls ───────────────────────────────────────────────────
                Opcode::Call => {
                    let pass_vr = rd_u8(&cb, offset + 2)? != 0;
                    let num_params = rd_u32(&cb, offset + 3)? as usize;
                    let func_slot = rd_i32(&cb, offset + 11)?;
                    frame::set_caller_bytecode_offset(&mut self.rc.stack, base, offset as u32);
                    match self.begin_call(base, func_slot, num_params, pass_vr, CallKind::Normal)? {
                        Transfer::Enter { base: b } => {
                            base = b;
                            offset = 0;
                            cb = self.current_code_block()?;
                        }
                        Transfer::Finished(Flow::Done(values)) => return Ok(values),
                        Transfer::Finished(Flow::Resume { base: b, offset: o }) => {
                            base = b;
                            offset = o;
                            cb = self.current_code_block()?;
                        }
                    }
                }
                Opcode::TailCall => {
                    let pass_vr = rd_u8(&cb, offset + 1)? != 0;
                    let num_params = rd_u32(&cb, offset + 2)? as usize;
                    let func_slot = rd_i32(&cb, offset + 6)?;
                    frame::set_caller_bytecode_offset(&mut self.rc.stack, base, offset as u32);
                    match self.begin_call(base, func_slot, num_params, pass_vr, CallKind::Tail)? {
                        Transfer::Enter { base: b } => {
                            base = b;
                            offset = 0;
                            cb = self.current_code_block()?;
                        }
                        Transfer::Finished(Flow::Done(values)) => return Ok(values),
                        Transfer::Finished(Flow::Resume { base: b, offset: o }) => {
                            base = b;
                            offset = o;
                            cb = self.current_code_block()?;
                        }
                    }
                }
                Opcode::Return => {
                    let is_variadic = rd_u8(&cb, offset + 1)? != 0;
                    let num = rd_u16(&cb, offset + 2)? as u32;
                    let slot_begin = rd_i32(&cb, offset + 4)?;
                    match self.do_return(base, is_variadic, num, slot_begin)? {
                        Flow::Done(values) => return Ok(values),
                        Flow::Resume { base: b, offset: o } => {
                            base = b;
                            offset = o;
                            cb = self.current_code_block()?;
                        }
                    }
                }

                // ── Variadic plumbing ───────────────────────────────────────
                Opcode::VariadicArgsToVariadicRet => {
                    let num_varargs =
                        frame::read_header(&self.rc.stack, base).num_variadic_arguments;
                    self.rc.variadic_ret_slot_begin =
                        -((num_varargs as i64 + FRAME_HEADER_SLOTS as i64) as i32);
                    self.rc.num_variadic_rets = num_varargs;
                    offset += size;
                }
                Opcode::PutVariadicArgs => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let wanted = rd_u32(&cb, offset + 5)? as usize;
                    let num_varargs =
                        frame::read_header(&self.rc.stack, base).num_variadic_arguments as usize;
                    let dst_at = local_index(base, dst)?;
                    if dst_at + wanted > self.rc.stack.len() {
                        return Err(RuntimeError::bytecode("variadic copy out of range"));
                    }
                    let va_begin = base - FRAME_HEADER_SLOTS - num_varargs;
                    let take = num_varargs.min(wanted);
                    self.rc.stack.copy_within(va_begin..va_begin + take, dst_at);
                    self.rc.stack[dst_at + take..dst_at + wanted].fill(TValue::nil());
                    offset += size;
                }

                // ── Closures ────────────────────────────────────────────────
                Opcode::NewClosure => {
                    let src = rd_i32(&cb, offset + 1)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let ucb_id = cb.constant_code(src)?;
                    let cb_id = self.code_block_for(ucb_id, self.rc.global_object)?;
                    let func = self.create_closure(ucb_id, cb_id, base)?;
                    self.local_set(base, dst, TValue::create_pointer(func))?;
                    offset += size;
                }

                // ── Arithmetic ──────────────────────────────────────────────
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let lhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 1)?)?;
                    let rhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 5)?)?;
                    let dst = rd_i32(&cb, offset + 9)?;
                    let v = self.arith(op, lhs, rhs)?;
                    self.local_set(base, dst, v)?;
                    offset += size;
                }

                // ── Unary ───────────────────────────────────────────────────
                Opcode::UnaryMinus => {
                    let src = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    if !src.is_double() {
                        return Err(RuntimeError::type_error(format!(
                            "attempt to perform arithmetic on a {} value",
                            self.type_name(src)
                        )));
                    }
                    self.local_set(base, dst, TValue::create_double(-src.as_double()))?;
                    offset += size;
                }
                Opcode::IsFalsy => {
                    let src = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    self.local_set(base, dst, TValue::create_boolean(!src.is_truthy()))?;
                    offset += size;
                }
                Opcode::Len => {
                    let src = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let dst = rd_i32(&cb, offset + 5)?;
                    let len = if src.is_pointer() {
                        let r = src.as_pointer();
                        if let Some(s) = self.heap.str_value(r) {
                            s.len() as f64
                        } else if let Some(t) = self.heap.table(r) {
                            t.border() as f64
                        } else {
                            return Err(RuntimeError::type_error(format!(
                                "attempt to get length of a {} value",
                                self.type_name(src)
                            )));
                        }
                    } else {
                        return Err(RuntimeError::type_error(format!(
                            "attempt to get length of a {} value",
                            self.type_name(src)
                        )));
                    };
                    self.local_set(base, dst, TValue::create_double(len))?;
                    offset += size;
                }

                // ── Comparisons and branches ────────────────────────────────
                //
                // IsNlt is not IsLe with swapped operands: when either side
                // is NaN, `!(a < b)` holds while `b <= a` does not.
                Opcode::IsEq | Opcode::IsNeq => {
                    let lhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 1)?)?;
                    let rhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 5)?)?;
                    let delta = rd_i32(&cb, offset + 9)?;
                    let equal = if lhs.is_double() && rhs.is_double() {
                        lhs.as_double() == rhs.as_double()
                    } else {
                        lhs.to_raw() == rhs.to_raw()
                    };
                    let jump = if op == Opcode::IsEq { equal } else { !equal };
                    offset = if jump {
                        branch_target(offset, delta)?
                    } else {
                        offset + size
                    };
                }
                Opcode::IsLt | Opcode::IsNlt | Opcode::IsLe | Opcode::IsNle => {
                    let lhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 1)?)?;
                    let rhs = self.slot_get(&cb, base, rd_i32(&cb, offset + 5)?)?;
                    let delta = rd_i32(&cb, offset + 9)?;
                    if !(lhs.is_double() && rhs.is_double()) {
                        let offending = if lhs.is_double() { rhs } else { lhs };
                        return Err(RuntimeError::type_error(format!(
                            "attempt to compare a {} value",
                            self.type_name(offending)
                        )));
                    }
                    let a = lhs.as_double();
                    let b = rhs.as_double();
                    let jump = match op {
                        Opcode::IsLt => a < b,
                        Opcode::IsNlt => !(a < b),
                        Opcode::IsLe => a <= b,
                        Opcode::IsNle => !(a <= b),
                        _ => unreachable!(),
                    };
                    offset = if jump {
                        branch_target(offset, delta)?
                    } else {
                        offset + size
                    };
                }

                // ── Conditional moves and jumps ─────────────────────────────
                Opcode::CopyAndBranchIfTruthy | Opcode::CopyAndBranchIfFalsy => {
                    let dst = rd_i32(&cb, offset + 1)?;
                    let src = self.local_get(base, rd_i32(&cb, offset + 5)?)?;
                    let delta = rd_i32(&cb, offset + 9)?;
                    self.local_set(base, dst, src)?;
                    let jump = if op == Opcode::CopyAndBranchIfTruthy {
                        src.is_truthy()
                    } else {
                        !src.is_truthy()
                    };
                    offset = if jump {
                        branch_target(offset, delta)?
                    } else {
                        offset + size
                    };
                }
                Opcode::BranchIfTruthy | Opcode::BranchIfFalsy => {
                    let src = self.local_get(base, rd_i32(&cb, offset + 1)?)?;
                    let delta = rd_i32(&cb, offset + 5)?;
                    let jump = if op == Opcode::BranchIfTruthy {
                        src.is_truthy()
                    } else {
                        !src.is_truthy()
                    };
                    offset = if jump {
                        branch_target(offset, delta)?
                    } else {
                        offset + size
                    };
                }
                Opcode::Jump => {
                    let delta = rd_i32(&cb, offset + 1)?;
                    offset = branch_target(offset, delta)?;
                }

                // ── Numeric for-loop ────────────────────────────────────────
                Opcode::ForLoopInit => {
                    let first = rd_i32(&cb, offset + 1)?;
                    let delta = rd_i32(&cb, offset + 5)?;
                    let at = local_index(base, first)?;
                    if at + 4 > self.rc.stack.len() {
                        return Err(RuntimeError::bytecode("for-loop slots out of range"));
                    }
                    let mut vals = [0.0f64; 3];
                    for (i, val) in vals.iter_mut().enumerate() {
                        let tv = self.rc.stack[at + i];
                        if tv.is_double() {
                            *val = tv.as_double();
                        } else if tv.is_pointer() {
                            let parsed = self
                                .heap
                                .str_value(tv.as_pointer())
                                .and_then(stdlib::parse_number);
                            match parsed {
                                Some(d) => {
                                    *val = d;
                                    self.rc.stack[at + i] = TValue::create_double(d);
                                }
                                None => return Err(for_loop_bound_error(i)),
                            }
                        } else {
                            return Err(for_loop_bound_error(i));
                        }
                    }
                    let (start, limit, step) = (vals[0], vals[1], vals[2]);
                    let satisfied = (step > 0.0 && start <= limit) || (step <= 0.0 && start >= limit);
                    if satisfied {
                        self.rc.stack[at + 3] = TValue::create_double(start);
                        offset += size;
                    } else {
                        offset = branch_target(offset, delta)?;
                    }
                }
                Opcode::ForLoopStep => {
                    let first = rd_i32(&cb, offset + 1)?;
                    let delta = rd_i32(&cb, offset + 5)?;
                    let at = local_index(base, first)?;
                    if at + 4 > self.rc.stack.len() {
                        return Err(RuntimeError::bytecode("for-loop slots out of range"));
                    }
                    for i in 0..3 {
                        if !self.rc.stack[at + i].is_double() {
                            return Err(for_loop_bound_error(i));
                        }
                    }
                    let mut start = self.rc.stack[at].as_double();
                    let limit = self.rc.stack[at + 1].as_double();
                    let step = self.rc.stack[at + 2].as_double();
                    start += step;
                    let satisfied = (step > 0.0 && start <= limit) || (step <= 0.0 && start >= limit);
                    if satisfied {
                        let v = TValue::create_double(start);
                        self.rc.stack[at] = v;
                        self.rc.stack[at + 3] = v;
                        offset = branch_target(offset, delta)?;
                    } else {
                        offset += size;
                    }
                }
            }
        }
    }

    /// Shared body of Call and TailCall. The caller has already recorded
    /// its bytecode offset.
    fn begin_call(
        &mut self,
        base: usize,
        func_slot: i32,
        num_params: usize,
        pass_variadic_ret: bool,
        kind: CallKind,
    ) -> Result<Transfer, RuntimeError> {
        let begin = local_index(base, func_slot)?;
        let func_tv = self.stack_get(begin)?;
        let (executable, num_fixed, has_varargs) = self.callee_info(func_tv)?;

        let stack_len = self.rc.stack.len();
        let mut arg_end = begin + FRAME_HEADER_SLOTS + num_params;

        // Append the captured variadic-return slice at the argument-region
        // end. The single unconditional write is safe: that slot is scratch.
        if pass_variadic_ret {
            let count = self.rc.num_variadic_rets as usize;
            let src = self.rel_index(base, self.rc.variadic_ret_slot_begin)?;
            if arg_end + count.max(1) > stack_len || src + count > stack_len {
                return Err(RuntimeError::StackOverflow);
            }
            self.rc.stack[arg_end] = self.rc.stack[src];
            if count > 1 {
                self.rc.stack.copy_within(src..src + count, arg_end);
            }
            arg_end += count;
        }

        // Pad with nil up to the callee's fixed-argument count.
        let arg_needed = begin + FRAME_HEADER_SLOTS + num_fixed;
        if arg_end.max(arg_needed) > stack_len {
            return Err(RuntimeError::StackOverflow);
        }
        while arg_end < arg_needed {
            self.rc.stack[arg_end] = TValue::nil();
            arg_end += 1;
        }

        // A variadic callee with excess arguments gets its header placed
        // after the excess, so the variadic tail sits right below it.
        let need_relocate = has_varargs && arg_end > arg_needed;
        let new_base;
        match kind {
            CallKind::Normal => {
                if need_relocate {
                    let header_start = arg_end;
                    new_base = header_start + FRAME_HEADER_SLOTS;
                    if new_base + num_fixed > stack_len {
                        return Err(RuntimeError::StackOverflow);
                    }
                    self.rc
                        .stack
                        .copy_within(begin + FRAME_HEADER_SLOTS..arg_needed, new_base);
                    frame::write_header(
                        &mut self.rc.stack,
                        header_start,
                        &FrameHeader {
                            func: func_tv,
                            caller_base: base,
                            ret: ReturnTarget::Resume,
                            caller_bytecode_offset: 0,
                            num_variadic_arguments: (arg_end - arg_needed) as u32,
                        },
                    );
                } else {
                    new_base = begin + FRAME_HEADER_SLOTS;
                    // The function value already sits in the header's first
                    // slot; fill in the rest around it.
                    frame::write_header_fields(
                        &mut self.rc.stack,
                        begin,
                        &FrameHeader {
                            func: func_tv,
                            caller_base: base,
                            ret: ReturnTarget::Resume,
                            caller_bytecode_offset: 0,
                            num_variadic_arguments: 0,
                        },
                    );
                }
            }
            CallKind::Tail => {
                // The dying frame's header is inherited; read it before the
                // slide tramples it.
                let inherited = frame::read_header(&self.rc.stack, base);
                let dest = base
                    - FRAME_HEADER_SLOTS
                    - inherited.num_variadic_arguments as usize;
                if need_relocate {
                    let header_start = arg_end;
                    let num_varargs = (arg_end - arg_needed) as u32;
                    if header_start + FRAME_HEADER_SLOTS + num_fixed > stack_len {
                        return Err(RuntimeError::StackOverflow);
                    }
                    frame::write_header(
                        &mut self.rc.stack,
                        header_start,
                        &FrameHeader {
                            func: func_tv,
                            caller_base: inherited.caller_base,
                            ret: inherited.ret,
                            caller_bytecode_offset: inherited.caller_bytecode_offset,
                            num_variadic_arguments: num_varargs,
                        },
                    );
                    self.rc.stack.copy_within(
                        begin + FRAME_HEADER_SLOTS..arg_needed,
                        header_start + FRAME_HEADER_SLOTS,
                    );
                    // Slide the assembled frame (varargs + header + fixed
                    // args) down over the dying frame's region.
                    let slide_len = arg_end - begin;
                    self.rc
                        .stack
                        .copy_within(arg_needed..arg_needed + slide_len, dest);
                    new_base = dest + num_varargs as usize + FRAME_HEADER_SLOTS;
                } else {
                    frame::write_header_fields(
                        &mut self.rc.stack,
                        begin,
                        &FrameHeader {
                            func: func_tv,
                            caller_base: inherited.caller_base,
                            ret: inherited.ret,
                            caller_bytecode_offset: inherited.caller_bytecode_offset,
                            num_variadic_arguments: 0,
                        },
                    );
                    let slide_len = arg_needed - begin;
                    self.rc.stack.copy_within(begin..begin + slide_len, dest);
                    new_base = dest + FRAME_HEADER_SLOTS;
                }
            }
        }

        match executable {
            ExecutableCode::Code(id) => {
                let frame_slots = self.code_blocks[id.index()].stack_frame_num_slots as usize;
                if new_base + frame_slots > self.rc.stack.len() {
                    return Err(RuntimeError::StackOverflow);
                }
                self.rc.code_block = Some(id);
                Ok(Transfer::Enter { base: new_base })
            }
            ExecutableCode::Native(func) => {
                let ret = func(self, new_base)?;
                let flow = self.finish_return(new_base, ret.slot_begin, ret.count)?;
                Ok(Transfer::Finished(flow))
            }
        }
    }

    fn callee_info(
        &self,
        func_tv: TValue,
    ) -> Result<(ExecutableCode, usize, bool), RuntimeError> {
        let not_callable = || {
            RuntimeError::type_error(format!(
                "attempt to call a {} value",
                self.type_name(func_tv)
            ))
        };
        if !func_tv.is_pointer() {
            return Err(not_callable());
        }
        let func = self.heap.function(func_tv.as_pointer()).ok_or_else(not_callable)?;
        match func.executable {
            ExecutableCode::Code(id) => {
                let cb = self
                    .code_blocks
                    .get(id.index())
                    .ok_or_else(|| RuntimeError::bytecode("stale code block id"))?;
                Ok((
                    func.executable,
                    cb.num_fixed_arguments as usize,
                    cb.has_variadic_arguments,
                ))
            }
            // Natives take every argument variadically, like the original
            // C-function registration path.
            ExecutableCode::Native(_) => Ok((func.executable, 0, true)),
        }
    }

    /// The Return instruction: assemble the padded return slice, then hand
    /// control back along the frame's return target.
    fn do_return(
        &mut self,
        base: usize,
        is_variadic: bool,
        num: u32,
        slot_begin: i32,
    ) -> Result<Flow, RuntimeError> {
        let ret_begin = local_index(base, slot_begin)?;
        let mut num_rets = num;

        if is_variadic {
            debug_assert!(self.rc.num_variadic_rets != u32::MAX);
            let count = self.rc.num_variadic_rets as usize;
            let src = self.rel_index(base, self.rc.variadic_ret_slot_begin)?;
            let dst = ret_begin + num as usize;
            if src + count > self.rc.stack.len() || dst + count > self.rc.stack.len() {
                return Err(RuntimeError::StackOverflow);
            }
            self.rc.stack.copy_within(src..src + count, dst);
            num_rets += count as u32;
        }
        // Consumed or not, the slice is dead after a return.
        #[cfg(debug_assertions)]
        {
            self.rc.num_variadic_rets = u32::MAX;
        }

        let pad_end = ret_begin + num_rets.max(MIN_NIL_FILL_RETURN_VALUES) as usize;
        if pad_end > self.rc.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        for i in num_rets..MIN_NIL_FILL_RETURN_VALUES {
            self.rc.stack[ret_begin + i as usize] = TValue::nil();
        }

        self.finish_return(base, ret_begin, num_rets)
    }

    /// Route a completed frame's return slice to its target.
    fn finish_return(
        &mut self,
        returning_base: usize,
        ret_begin: usize,
        num_rets: u32,
    ) -> Result<Flow, RuntimeError> {
        let header = frame::read_header(&self.rc.stack, returning_base);
        match header.ret {
            ReturnTarget::Script => {
                let end = ret_begin + num_rets as usize;
                if end > self.rc.stack.len() {
                    return Err(RuntimeError::StackOverflow);
                }
                Ok(Flow::Done(self.rc.stack[ret_begin..end].to_vec()))
            }
            ReturnTarget::Resume => self.on_return(header.caller_base, ret_begin, num_rets),
        }
    }

    /// Resume the caller after a return: re-decode its call instruction,
    /// either capture the returns as the variadic slice or copy the fixed
    /// count into place, and continue after the call.
    fn on_return(
        &mut self,
        caller_base: usize,
        ret_begin: usize,
        num_rets: u32,
    ) -> Result<Flow, RuntimeError> {
        let caller_header = frame::read_header(&self.rc.stack, caller_base);
        if !caller_header.func.is_pointer() {
            return Err(RuntimeError::bytecode("caller frame header is corrupt"));
        }
        let caller_func = self
            .heap
            .function(caller_header.func.as_pointer())
            .ok_or_else(|| RuntimeError::bytecode("caller frame header is corrupt"))?;
        let cb_id = match caller_func.executable {
            ExecutableCode::Code(id) => id,
            ExecutableCode::Native(_) => {
                return Err(RuntimeError::bytecode("caller is not a bytecode function"))
            }
        };
        let caller_cb = Rc::clone(&self.code_blocks[cb_id.index()]);
        let call_off = caller_header.caller_bytecode_offset as usize;
        let op = decode_opcode(rd_u8(&caller_cb, call_off)?);
        if op != Some(Opcode::Call) {
            return Err(RuntimeError::bytecode(
                "return target is not a call instruction",
            ));
        }
        let keep_variadic = rd_u8(&caller_cb, call_off + 1)? != 0;
        let num_fixed_rets = rd_u32(&caller_cb, call_off + 7)? as usize;
        let func_slot = rd_i32(&caller_cb, call_off + 11)?;

        if keep_variadic {
            self.rc.num_variadic_rets = num_rets;
            self.rc.variadic_ret_slot_begin = (ret_begin as i64 - caller_base as i64) as i32;
        } else {
            let dst = local_index(caller_base, func_slot)?;
            if dst + num_fixed_rets > self.rc.stack.len() {
                return Err(RuntimeError::StackOverflow);
            }
            let have = (num_rets as usize).min(num_fixed_rets);
            self.rc.stack.copy_within(ret_begin..ret_begin + have, dst);
            self.rc.stack[dst + have..dst + num_fixed_rets].fill(TValue::nil());
        }

        self.rc.code_block = Some(cb_id);
        Ok(Flow::Resume {
            base: caller_base,
            offset: call_off + instruction_size(Opcode::Call),
        })
    }

    fn create_closure(
        &mut self,
        ucb_id: UcbId,
        cb_id: CodeBlockId,
        base: usize,
    ) -> Result<HeapRef, RuntimeError> {
        let linked = &self.code_blocks[cb_id.index()];
        debug_assert_eq!(linked.owner, ucb_id);
        debug_assert_eq!(linked.global_object, self.rc.global_object);
        debug_assert_eq!(
            linked.num_upvalues as usize,
            self.ucbs[ucb_id.index()].upvalue_info.len()
        );
        let parent_upvalues: Vec<HeapRef> = self.frame_function(base)?.upvalues.to_vec();
        let metas = self.ucbs[ucb_id.index()].upvalue_info.clone();
        let mut resolved = Vec::with_capacity(metas.len());
        for meta in metas {
            let uv = if meta.is_parent_local {
                upvalues::find_or_create(
                    &mut self.rc,
                    &mut self.heap,
                    base + meta.slot as usize,
                    meta.is_immutable,
                )
            } else {
                *parent_upvalues.get(meta.slot as usize).ok_or_else(|| {
                    RuntimeError::bytecode("captured upvalue ordinal out of range")
                })?
            };
            resolved.push(uv);
        }
        let func = self.heap.alloc_function(FunctionObject {
            executable: ExecutableCode::Code(cb_id),
            upvalues: resolved.into_boxed_slice(),
        });
        self.heap.barrier(func);
        Ok(func)
    }
}

fn for_loop_bound_error(index: usize) -> RuntimeError {
    let what = match index {
        0 => "initial value",
        1 => "limit",
        _ => "step",
    };
    RuntimeError::name_error(format!("'for' {what} must be a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floored_fmod_sign_correction() {
        assert_eq!(floored_fmod(5.0, 3.0), 2.0);
        assert_eq!(floored_fmod(-5.0, 3.0), 1.0);
        assert_eq!(floored_fmod(5.0, -3.0), -1.0);
        assert_eq!(floored_fmod(-5.0, -3.0), -2.0);
        assert!(floored_fmod(5.0, 0.0).is_nan());
    }

    #[test]
    fn test_branch_target_rejects_negative() {
        assert!(branch_target(4, -8).is_err());
        assert_eq!(branch_target(4, -4).unwrap(), 0);
        assert_eq!(branch_target(0, 13).unwrap(), 13);
    }
}
