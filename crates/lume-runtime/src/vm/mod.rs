//! Virtual machine: engine state, coroutine context, linking, launch
//!
//! [`Vm`] owns the user heap, the registered unlinked code blocks, the
//! arena of linked code blocks, and the root coroutine. Execution itself
//! lives in `interpreter.rs`; the stack-frame layout in `frame.rs`.

pub(crate) mod frame;
mod interpreter;
pub(crate) mod upvalues;

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{CodeBlock, CodeBlockId, UcbId, UnlinkedCodeBlock};
use crate::heap::{ExecutableCode, FunctionObject, GcCellState, Heap, HeapRef, NativeFunction};
use crate::module_loader::ScriptModule;
use crate::stdlib::{self, OutputWriter};
use crate::table::{TableKey, TableObject};
use crate::value::{RuntimeError, TValue};
use frame::{FrameHeader, ReturnTarget, FRAME_HEADER_SLOTS};

/// Stack slots allocated per coroutine.
pub(crate) const DEFAULT_STACK_SLOTS: usize = 10000;

/// Per-coroutine interpreter state.
pub struct CoroutineRuntimeContext {
    pub(crate) stack: Vec<TValue>,
    /// Code block of the currently executing function. Advisory: only valid
    /// while running bytecode functions.
    pub(crate) code_block: Option<CodeBlockId>,
    pub(crate) global_object: HeapRef,
    /// Most recent variadic-return slice: `num_variadic_rets` values
    /// starting `variadic_ret_slot_begin` slots from the current frame base
    /// (negative reaches into the varargs region below the header).
    pub(crate) num_variadic_rets: u32,
    pub(crate) variadic_ret_slot_begin: i32,
    /// Head of the open-upvalue list, highest stack slot first.
    pub(crate) upvalue_list: Option<HeapRef>,
    pub(crate) cell_state: GcCellState,
}

impl CoroutineRuntimeContext {
    pub(crate) fn new(global_object: HeapRef) -> CoroutineRuntimeContext {
        CoroutineRuntimeContext {
            stack: vec![TValue::nil(); DEFAULT_STACK_SLOTS],
            code_block: None,
            global_object,
            num_variadic_rets: 0,
            variadic_ret_slot_begin: 0,
            upvalue_list: None,
            cell_state: GcCellState::White,
        }
    }
}

/// The engine: heap, code-block arenas, and the root coroutine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) ucbs: Vec<UnlinkedCodeBlock>,
    pub(crate) code_blocks: Vec<Rc<CodeBlock>>,
    pub(crate) rc: CoroutineRuntimeContext,
    pub(crate) output: OutputWriter,
}

impl Vm {
    /// Create a VM with a bootstrapped root global object (`print`, `math`).
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let global = stdlib::create_global_object(&mut heap);
        Vm {
            heap,
            ucbs: Vec::new(),
            code_blocks: Vec::new(),
            rc: CoroutineRuntimeContext::new(global),
            output: stdlib::stdout_writer(),
        }
    }

    /// Redirect `print` output (tests capture it this way).
    pub fn set_output_writer(&mut self, writer: OutputWriter) {
        self.output = writer;
    }

    pub fn global_object(&self) -> HeapRef {
        self.rc.global_object
    }

    /// Build a fresh, fully bootstrapped global object, distinct from the
    /// root one.
    pub fn create_global_object(&mut self) -> HeapRef {
        stdlib::create_global_object(&mut self.heap)
    }

    pub fn intern_string(&mut self, s: &str) -> HeapRef {
        self.heap.intern(s)
    }

    /// Allocate an empty table cell (useful for template constants).
    pub fn create_table(&mut self) -> HeapRef {
        self.heap.alloc_table(TableObject::new(0, 0))
    }

    /// Wrap a host function into a callable function object.
    pub fn create_native_function(&mut self, func: NativeFunction) -> HeapRef {
        self.heap.alloc_function(FunctionObject {
            executable: ExecutableCode::Native(func),
            upvalues: Box::default(),
        })
    }

    pub fn add_unlinked_code_block(&mut self, ucb: UnlinkedCodeBlock) -> UcbId {
        let id = UcbId(self.ucbs.len() as u32);
        self.ucbs.push(ucb);
        id
    }

    pub(crate) fn ucb_count(&self) -> usize {
        self.ucbs.len()
    }

    /// Code block for `(ucb, global_object)`, linking one on first request.
    /// The first global linked becomes the block's default pairing; later
    /// globals go to the overflow map.
    pub fn code_block_for(
        &mut self,
        ucb: UcbId,
        global_object: HeapRef,
    ) -> Result<CodeBlockId, RuntimeError> {
        {
            let u = self
                .ucbs
                .get(ucb.index())
                .ok_or_else(|| RuntimeError::bytecode("unknown unlinked code block"))?;
            if let Some((g, cb)) = u.default_pairing {
                if g == global_object {
                    return Ok(cb);
                }
                if let Some(map) = &u.rare_pairings {
                    if let Some(&cb) = map.get(&global_object) {
                        return Ok(cb);
                    }
                }
            }
        }
        let linked = CodeBlock::link(&self.ucbs[ucb.index()], ucb, global_object);
        let id = CodeBlockId(self.code_blocks.len() as u32);
        self.code_blocks.push(Rc::new(linked));
        let u = &mut self.ucbs[ucb.index()];
        if u.default_pairing.is_none() {
            u.default_pairing = Some((global_object, id));
        } else {
            u.rare_pairings
                .get_or_insert_with(HashMap::new)
                .insert(global_object, id);
        }
        Ok(id)
    }

    /// Run a module's entry function on the root coroutine and surface its
    /// return values. Errors unwind the coroutine.
    pub fn launch_script(&mut self, module: &ScriptModule) -> Result<Vec<TValue>, RuntimeError> {
        let entry = module.entry;
        {
            let ucb = self
                .ucbs
                .get(entry.index())
                .ok_or_else(|| RuntimeError::bytecode("module entry code block is unknown"))?;
            if ucb.num_fixed_arguments != 0 {
                return Err(RuntimeError::bytecode(
                    "module entry function must take no fixed arguments",
                ));
            }
            if !ucb.upvalue_info.is_empty() {
                return Err(RuntimeError::bytecode(
                    "module entry function must not capture upvalues",
                ));
            }
        }
        let cb_id = self.code_block_for(entry, self.rc.global_object)?;
        let func = self.heap.alloc_function(FunctionObject {
            executable: ExecutableCode::Code(cb_id),
            upvalues: Box::default(),
        });

        self.rc.code_block = Some(cb_id);
        self.rc.num_variadic_rets = 0;
        self.rc.variadic_ret_slot_begin = 0;
        frame::write_header(
            &mut self.rc.stack,
            0,
            &FrameHeader {
                func: TValue::create_pointer(func),
                caller_base: 0,
                ret: ReturnTarget::Script,
                caller_bytecode_offset: 0,
                num_variadic_arguments: 0,
            },
        );
        self.run(FRAME_HEADER_SLOTS)
    }

    // ── Host inspection helpers ──────────────────────────────────────────────

    /// Kind of a value, as the language names it.
    pub fn type_name(&self, v: TValue) -> &'static str {
        if v.is_nil() {
            "nil"
        } else if v.is_boolean() {
            "boolean"
        } else if v.is_double() || v.is_int32() {
            "number"
        } else if v.is_pointer() {
            self.heap.kind_name(v.as_pointer())
        } else {
            "invalid"
        }
    }

    /// Contents of a string value, if `v` is one.
    pub fn string_value(&self, v: TValue) -> Option<&str> {
        if !v.is_pointer() {
            return None;
        }
        self.heap.str_value(v.as_pointer())
    }

    /// Read a key from a table value.
    pub fn table_get(&self, table: TValue, key: TValue) -> Option<TValue> {
        let t = self.heap.table(table.as_pointer_checked()?)?;
        Some(match TableKey::for_get(&self.heap, key) {
            Some(k) => t.get(&k),
            None => TValue::nil(),
        })
    }

    /// Write a key into a table value.
    pub fn table_set(
        &mut self,
        table: TValue,
        key: TValue,
        value: TValue,
    ) -> Result<(), RuntimeError> {
        let r = table
            .as_pointer_checked()
            .filter(|r| self.heap.table(*r).is_some())
            .ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "attempt to index a {} value",
                    self.type_name(table)
                ))
            })?;
        let key = TableKey::for_put(&self.heap, key)?;
        self.heap
            .table_mut(r)
            .expect("checked above")
            .put(key, value);
        self.heap.barrier(r);
        Ok(())
    }

    /// Read a name from the root global object.
    pub fn read_global(&mut self, name: &str) -> TValue {
        let name_ref = self.heap.intern(name);
        self.heap
            .table(self.rc.global_object)
            .map(|t| t.get_str(name_ref))
            .unwrap_or_else(TValue::nil)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
