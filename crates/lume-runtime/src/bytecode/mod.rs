//! Code blocks and bytecode construction
//!
//! An [`UnlinkedCodeBlock`] is the front-end's output for one function,
//! independent of any global environment. Linking it against a global object
//! produces a [`CodeBlock`] that owns its own copy of the bytecode and
//! constant table (so per-environment opcode specialization can never mutate
//! shared state). The pairing is cached on the unlinked block: the first
//! global linked is the default, further globals go to an overflow map.

mod disasm;
mod opcode;

pub use disasm::disassemble;
pub use opcode::{decode_opcode, has_branch_offset, instruction_size, Opcode};

use std::collections::HashMap;

use crate::heap::HeapRef;
use crate::value::{RuntimeError, TValue};

/// TValue slots a stack frame header occupies. Part of the calling
/// convention: a call stages the callee at `func_slot` and its arguments at
/// `func_slot + FRAME_HEADER_SLOTS + i`, leaving the gap for the header.
pub const FRAME_HEADER_SLOTS: usize = 4;

/// Handle to an unlinked code block registered with the VM.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct UcbId(pub(crate) u32);

impl UcbId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a linked code block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CodeBlockId(pub(crate) u32);

impl CodeBlockId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Constant-table entry: a plain value, or the unlinked code block a
/// `NewClosure` will link. The two interpretations are explicitly tagged;
/// the bytecode always knows which one it expects.
#[derive(Copy, Clone, Debug)]
pub enum ConstantEntry {
    Value(TValue),
    Code(UcbId),
}

/// How a closure resolves one captured variable.
#[derive(Copy, Clone, Debug)]
pub struct UpvalueMetadata {
    /// True: `slot` is a slot ordinal in the parent's frame. False: `slot`
    /// is an upvalue ordinal of the enclosing function.
    pub is_parent_local: bool,
    /// Advisory; set only for by-value captures of a parent local.
    pub is_immutable: bool,
    pub slot: u32,
}

/// Compiler output for a single function, independent of any global object.
pub struct UnlinkedCodeBlock {
    pub(crate) bytecode: Vec<u8>,
    pub(crate) constants: Vec<ConstantEntry>,
    pub(crate) upvalue_info: Vec<UpvalueMetadata>,
    pub(crate) parent: Option<UcbId>,
    pub(crate) stack_frame_num_slots: u32,
    pub(crate) num_fixed_arguments: u32,
    pub(crate) has_variadic_arguments: bool,
    /// First global object this block was linked against, and the block.
    pub(crate) default_pairing: Option<(HeapRef, CodeBlockId)>,
    /// Lazily-allocated overflow for further globals.
    pub(crate) rare_pairings: Option<HashMap<HeapRef, CodeBlockId>>,
}

impl UnlinkedCodeBlock {
    /// Enclosing function, as recorded by the front-end.
    pub fn parent(&self) -> Option<UcbId> {
        self.parent
    }
}

/// A bytecode function bound to one global object.
pub struct CodeBlock {
    pub(crate) bytecode: Box<[u8]>,
    pub(crate) constants: Box<[ConstantEntry]>,
    pub(crate) global_object: HeapRef,
    pub(crate) stack_frame_num_slots: u32,
    pub(crate) num_upvalues: u32,
    pub(crate) num_fixed_arguments: u32,
    pub(crate) has_variadic_arguments: bool,
    pub(crate) owner: UcbId,
}

impl CodeBlock {
    pub(crate) fn link(ucb: &UnlinkedCodeBlock, owner: UcbId, global_object: HeapRef) -> CodeBlock {
        CodeBlock {
            bytecode: ucb.bytecode.clone().into_boxed_slice(),
            constants: ucb.constants.clone().into_boxed_slice(),
            global_object,
            stack_frame_num_slots: ucb.stack_frame_num_slots,
            num_upvalues: ucb.upvalue_info.len() as u32,
            num_fixed_arguments: ucb.num_fixed_arguments,
            has_variadic_arguments: ucb.has_variadic_arguments,
            owner,
        }
    }

    /// Constant at a negative, end-relative ordinal (`-len <= ord < 0`).
    pub(crate) fn constant(&self, ord: i32) -> Result<ConstantEntry, RuntimeError> {
        let len = self.constants.len() as i64;
        let ord = ord as i64;
        if ord < -len || ord >= 0 {
            return Err(RuntimeError::bytecode(format!(
                "constant ordinal {ord} out of range (table has {len} entries)"
            )));
        }
        Ok(self.constants[(len + ord) as usize])
    }

    pub(crate) fn constant_value(&self, ord: i32) -> Result<TValue, RuntimeError> {
        match self.constant(ord)? {
            ConstantEntry::Value(v) => Ok(v),
            ConstantEntry::Code(_) => Err(RuntimeError::bytecode(format!(
                "constant ordinal {ord} holds a code block where a value was expected"
            ))),
        }
    }

    pub(crate) fn constant_code(&self, ord: i32) -> Result<UcbId, RuntimeError> {
        match self.constant(ord)? {
            ConstantEntry::Code(id) => Ok(id),
            ConstantEntry::Value(_) => Err(RuntimeError::bytecode(format!(
                "constant ordinal {ord} holds a value where a code block was expected"
            ))),
        }
    }
}

// ── Instruction-stream readers ───────────────────────────────────────────────
// All multi-byte operands are little-endian. Readers return None past the end
// of the stream; the interpreter surfaces that as a malformed-bytecode error.

pub(crate) fn read_u8(code: &[u8], at: usize) -> Option<u8> {
    code.get(at).copied()
}

pub(crate) fn read_u16(code: &[u8], at: usize) -> Option<u16> {
    let bytes = code.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_i16(code: &[u8], at: usize) -> Option<i16> {
    Some(read_u16(code, at)? as i16)
}

pub(crate) fn read_u32(code: &[u8], at: usize) -> Option<u32> {
    let bytes = code.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_i32(code: &[u8], at: usize) -> Option<i32> {
    Some(read_u32(code, at)? as i32)
}

pub(crate) fn read_u64(code: &[u8], at: usize) -> Option<u64> {
    let bytes = code.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Index returned by [`BytecodeBuilder::add_constant`]. The on-wire ordinal
/// is end-relative and only known once the table is complete, so operands
/// referencing constants are patched at [`BytecodeBuilder::build`] time.
#[derive(Copy, Clone, Debug)]
pub struct ConstId(u32);

/// An operand that may name a frame-local slot or a constant.
#[derive(Copy, Clone, Debug)]
pub enum Slot {
    Local(u32),
    Const(ConstId),
}

/// Emits the packed instruction stream for one function.
///
/// Calling convention reminder for `emit_call`/`emit_tail_call`: the callee
/// function value sits at `func_slot` and the arguments at
/// `func_slot + FRAME_HEADER_SLOTS + i`; the gap is where the callee's frame
/// header is written.
pub struct BytecodeBuilder {
    code: Vec<u8>,
    constants: Vec<ConstantEntry>,
    upvalue_info: Vec<UpvalueMetadata>,
    parent: Option<UcbId>,
    num_fixed_arguments: u32,
    has_variadic_arguments: bool,
    stack_frame_num_slots: u32,
    const_patches: Vec<(usize, u32)>,
}

impl BytecodeBuilder {
    pub fn new(
        num_fixed_arguments: u32,
        has_variadic_arguments: bool,
        stack_frame_num_slots: u32,
    ) -> BytecodeBuilder {
        BytecodeBuilder {
            code: Vec::new(),
            constants: Vec::new(),
            upvalue_info: Vec::new(),
            parent: None,
            num_fixed_arguments,
            has_variadic_arguments,
            stack_frame_num_slots,
            const_patches: Vec::new(),
        }
    }

    pub fn add_constant(&mut self, entry: ConstantEntry) -> ConstId {
        self.constants.push(entry);
        ConstId((self.constants.len() - 1) as u32)
    }

    pub fn add_upvalue(&mut self, meta: UpvalueMetadata) -> u16 {
        self.upvalue_info.push(meta);
        (self.upvalue_info.len() - 1) as u16
    }

    pub fn set_parent(&mut self, parent: UcbId) {
        self.parent = Some(parent);
    }

    /// Current instruction offset; the target for backward branches.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    fn op(&mut self, opcode: Opcode) -> usize {
        let at = self.code.len();
        self.code.push(opcode as u8);
        at
    }

    fn put_u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i16(&mut self, v: i16) {
        self.put_u16(v as u16);
    }

    fn put_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    fn put_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn put_local(&mut self, ord: u32) {
        self.put_i32(ord as i32);
    }

    fn put_slot(&mut self, slot: Slot) {
        match slot {
            Slot::Local(ord) => self.put_i32(ord as i32),
            Slot::Const(c) => self.put_const(c),
        }
    }

    fn put_const(&mut self, c: ConstId) {
        self.const_patches.push((self.code.len(), c.0));
        self.put_i32(0);
    }

    // Locals and constants

    pub fn emit_move(&mut self, src: Slot, dst: u32) {
        self.op(Opcode::Move);
        self.put_slot(src);
        self.put_local(dst);
    }

    pub fn emit_constant(&mut self, dst: u32, value: TValue) {
        self.op(Opcode::Constant);
        self.put_local(dst);
        self.put_u64(value.to_raw());
    }

    pub fn emit_fill_nil(&mut self, first_slot: u32, count: u32) {
        self.op(Opcode::FillNil);
        self.put_local(first_slot);
        self.put_u32(count);
    }

    // Upvalues

    pub fn emit_upvalue_get(&mut self, dst: u32, index: u16) {
        self.op(Opcode::UpvalueGet);
        self.put_local(dst);
        self.put_u16(index);
    }

    pub fn emit_upvalue_put(&mut self, src: Slot, index: u16) {
        self.op(Opcode::UpvaluePut);
        self.put_slot(src);
        self.put_u16(index);
    }

    pub fn emit_upvalue_close(&mut self, base: u32) -> usize {
        let at = self.op(Opcode::UpvalueClose);
        self.put_local(base);
        self.put_i32(0);
        at
    }

    // Globals

    pub fn emit_global_get(&mut self, dst: u32, name: ConstId) {
        self.op(Opcode::GlobalGet);
        self.put_local(dst);
        self.put_const(name);
    }

    pub fn emit_global_put(&mut self, src: u32, name: ConstId) {
        self.op(Opcode::GlobalPut);
        self.put_local(src);
        self.put_const(name);
    }

    // Tables

    pub fn emit_table_get_by_id(&mut self, base: u32, dst: u32, name: ConstId) {
        self.op(Opcode::TableGetById);
        self.put_local(base);
        self.put_local(dst);
        self.put_const(name);
    }

    pub fn emit_table_put_by_id(&mut self, base: u32, src: u32, name: ConstId) {
        self.op(Opcode::TablePutById);
        self.put_local(base);
        self.put_local(src);
        self.put_const(name);
    }

    pub fn emit_table_get_by_val(&mut self, base: u32, dst: u32, index: u32) {
        self.op(Opcode::TableGetByVal);
        self.put_local(base);
        self.put_local(dst);
        self.put_local(index);
    }

    pub fn emit_table_put_by_val(&mut self, base: u32, src: u32, index: u32) {
        self.op(Opcode::TablePutByVal);
        self.put_local(base);
        self.put_local(src);
        self.put_local(index);
    }

    pub fn emit_table_get_by_integer_val(&mut self, base: u32, dst: u32, index: i16) {
        self.op(Opcode::TableGetByIntegerVal);
        self.put_local(base);
        self.put_local(dst);
        self.put_i16(index);
    }

    pub fn emit_table_put_by_integer_val(&mut self, base: u32, src: u32, index: i16) {
        self.op(Opcode::TablePutByIntegerVal);
        self.put_local(base);
        self.put_local(src);
        self.put_i16(index);
    }

    pub fn emit_table_variadic_put_seq(&mut self, base: u32, start_index: i32) {
        self.op(Opcode::TableVariadicPutSeq);
        self.put_local(base);
        self.put_i32(start_index);
    }

    pub fn emit_table_new(&mut self, dst: u32, inline_capacity_stepping: u8, array_hint: u16) {
        self.op(Opcode::TableNew);
        self.put_local(dst);
        self.put_u8(inline_capacity_stepping);
        self.put_u16(array_hint);
    }

    pub fn emit_table_dup(&mut self, dst: u32, template: ConstId) {
        self.op(Opcode::TableDup);
        self.put_local(dst);
        self.put_const(template);
    }

    // Calls

    pub fn emit_call(
        &mut self,
        keep_variadic_ret: bool,
        pass_variadic_ret_as_param: bool,
        num_fixed_params: u32,
        num_fixed_rets: u32,
        func_slot: u32,
    ) {
        self.op(Opcode::Call);
        self.put_u8(keep_variadic_ret as u8);
        self.put_u8(pass_variadic_ret_as_param as u8);
        self.put_u32(num_fixed_params);
        self.put_u32(num_fixed_rets);
        self.put_local(func_slot);
    }

    pub fn emit_tail_call(
        &mut self,
        pass_variadic_ret_as_param: bool,
        num_fixed_params: u32,
        func_slot: u32,
    ) {
        self.op(Opcode::TailCall);
        self.put_u8(pass_variadic_ret_as_param as u8);
        self.put_u32(num_fixed_params);
        self.put_local(func_slot);
    }

    pub fn emit_return(&mut self, is_variadic_ret: bool, num_return_values: u16, slot_begin: u32) {
        self.op(Opcode::Return);
        self.put_u8(is_variadic_ret as u8);
        self.put_u16(num_return_values);
        self.put_local(slot_begin);
    }

    // Variadic plumbing

    pub fn emit_variadic_args_to_variadic_ret(&mut self) {
        self.op(Opcode::VariadicArgsToVariadicRet);
    }

    pub fn emit_put_variadic_args(&mut self, dst: u32, count: u32) {
        self.op(Opcode::PutVariadicArgs);
        self.put_local(dst);
        self.put_u32(count);
    }

    // Closures

    pub fn emit_new_closure(&mut self, code: ConstId, dst: u32) {
        self.op(Opcode::NewClosure);
        self.put_const(code);
        self.put_local(dst);
    }

    // Arithmetic and unary

    pub fn emit_arith(&mut self, opcode: Opcode, lhs: Slot, rhs: Slot, result: u32) {
        debug_assert!(matches!(
            opcode,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
        ));
        self.op(opcode);
        self.put_slot(lhs);
        self.put_slot(rhs);
        self.put_local(result);
    }

    pub fn emit_unary_minus(&mut self, src: u32, dst: u32) {
        self.op(Opcode::UnaryMinus);
        self.put_local(src);
        self.put_local(dst);
    }

    pub fn emit_is_falsy(&mut self, src: u32, dst: u32) {
        self.op(Opcode::IsFalsy);
        self.put_local(src);
        self.put_local(dst);
    }

    pub fn emit_len(&mut self, src: u32, dst: u32) {
        self.op(Opcode::Len);
        self.put_local(src);
        self.put_local(dst);
    }

    // Compare-and-branch; returns the instruction start for patching.

    pub fn emit_compare_branch(&mut self, opcode: Opcode, lhs: Slot, rhs: Slot) -> usize {
        debug_assert!(matches!(
            opcode,
            Opcode::IsEq
                | Opcode::IsNeq
                | Opcode::IsLt
                | Opcode::IsNlt
                | Opcode::IsLe
                | Opcode::IsNle
        ));
        let at = self.op(opcode);
        self.put_slot(lhs);
        self.put_slot(rhs);
        self.put_i32(0);
        at
    }

    pub fn emit_copy_and_branch_if_truthy(&mut self, dst: u32, src: u32) -> usize {
        let at = self.op(Opcode::CopyAndBranchIfTruthy);
        self.put_local(dst);
        self.put_local(src);
        self.put_i32(0);
        at
    }

    pub fn emit_copy_and_branch_if_falsy(&mut self, dst: u32, src: u32) -> usize {
        let at = self.op(Opcode::CopyAndBranchIfFalsy);
        self.put_local(dst);
        self.put_local(src);
        self.put_i32(0);
        at
    }

    pub fn emit_branch_if_truthy(&mut self, src: u32) -> usize {
        let at = self.op(Opcode::BranchIfTruthy);
        self.put_local(src);
        self.put_i32(0);
        at
    }

    pub fn emit_branch_if_falsy(&mut self, src: u32) -> usize {
        let at = self.op(Opcode::BranchIfFalsy);
        self.put_local(src);
        self.put_i32(0);
        at
    }

    pub fn emit_jump(&mut self) -> usize {
        let at = self.op(Opcode::Jump);
        self.put_i32(0);
        at
    }

    pub fn emit_for_loop_init(&mut self, base: u32) -> usize {
        let at = self.op(Opcode::ForLoopInit);
        self.put_local(base);
        self.put_i32(0);
        at
    }

    pub fn emit_for_loop_step(&mut self, base: u32) -> usize {
        let at = self.op(Opcode::ForLoopStep);
        self.put_local(base);
        self.put_i32(0);
        at
    }

    /// Point the branch instruction at `at` to the absolute offset `target`.
    /// Branch offsets are byte deltas from the branching instruction's own
    /// start.
    pub fn patch_branch(&mut self, at: usize, target: usize) {
        let delta = target as i64 - at as i64;
        self.set_branch_offset(at, delta as i32);
    }

    /// Point the branch instruction at `at` to the current offset.
    pub fn patch_branch_to_here(&mut self, at: usize) {
        let target = self.here();
        self.patch_branch(at, target);
    }

    /// Write a raw byte delta into the trailing offset field of the branch
    /// instruction at `at`. Used by the module loader, whose front-end has
    /// already computed deltas.
    pub fn set_branch_offset(&mut self, at: usize, delta: i32) {
        let opcode = decode_opcode(self.code[at]).expect("patch target is not an instruction");
        assert!(has_branch_offset(opcode), "instruction has no branch offset");
        let field = at + instruction_size(opcode) - 4;
        self.code[field..field + 4].copy_from_slice(&delta.to_le_bytes());
    }

    /// Finish the function: resolve end-relative constant ordinals and
    /// produce the unlinked code block.
    pub fn build(mut self) -> UnlinkedCodeBlock {
        let len = self.constants.len() as i64;
        for (pos, index) in std::mem::take(&mut self.const_patches) {
            let ord = (index as i64 - len) as i32;
            self.code[pos..pos + 4].copy_from_slice(&ord.to_le_bytes());
        }
        UnlinkedCodeBlock {
            bytecode: self.code,
            constants: self.constants,
            upvalue_info: self.upvalue_info,
            parent: self.parent,
            stack_frame_num_slots: self.stack_frame_num_slots,
            num_fixed_arguments: self.num_fixed_arguments,
            has_variadic_arguments: self.has_variadic_arguments,
            default_pairing: None,
            rare_pairings: None,
        }
    }
}
