//! Script modules and the front-end's JSON delivery format
//!
//! The compiler is an external collaborator; it hands over a module as JSON:
//! an array of function records carrying frame/argument info, upvalue
//! descriptors, a typed constant table, and instructions as
//! `["Mnemonic", operands...]` arrays. Negative slot operands are
//! end-relative constant ordinals; branch operands are byte deltas the
//! front-end has already computed.

use serde::Deserialize;
use thiserror::Error;

use crate::bytecode::{
    BytecodeBuilder, ConstId, ConstantEntry, Opcode, Slot, UcbId, UnlinkedCodeBlock,
    UpvalueMetadata,
};
use crate::table::TableObject;
use crate::value::TValue;
use crate::vm::Vm;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid module JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid module: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ModuleError {
    ModuleError::Invalid(msg.into())
}

/// A loaded source file: its function bodies plus the entry function.
#[derive(Debug)]
pub struct ScriptModule {
    pub name: String,
    pub unlinked_code_blocks: Vec<UcbId>,
    pub entry: UcbId,
}

impl ScriptModule {
    pub fn new(
        name: impl Into<String>,
        unlinked_code_blocks: Vec<UcbId>,
        entry: UcbId,
    ) -> ScriptModule {
        ScriptModule {
            name: name.into(),
            unlinked_code_blocks,
            entry,
        }
    }

    /// Parse a JSON module description, registering its functions with the
    /// VM. The entry defaults to the last function (the toplevel chunk).
    pub fn parse_from_json(vm: &mut Vm, content: &str) -> Result<ScriptModule, ModuleError> {
        let desc: ModuleDesc = serde_json::from_str(content)?;
        if desc.functions.is_empty() {
            return Err(invalid("module has no functions"));
        }
        let first = vm.ucb_count() as u32;
        let ids: Vec<UcbId> = (0..desc.functions.len())
            .map(|i| UcbId(first + i as u32))
            .collect();
        for function in &desc.functions {
            let ucb = assemble_function(vm, function, &ids)?;
            vm.add_unlinked_code_block(ucb);
        }
        let entry_index = desc.entry.unwrap_or(desc.functions.len() - 1);
        let entry = *ids
            .get(entry_index)
            .ok_or_else(|| invalid(format!("entry ordinal {entry_index} out of range")))?;
        Ok(ScriptModule {
            name: desc.name.unwrap_or_else(|| "<module>".to_string()),
            unlinked_code_blocks: ids,
            entry,
        })
    }
}

#[derive(Deserialize)]
struct ModuleDesc {
    #[serde(default)]
    name: Option<String>,
    functions: Vec<FunctionDesc>,
    #[serde(default)]
    entry: Option<usize>,
}

#[derive(Deserialize)]
struct FunctionDesc {
    #[serde(default)]
    num_fixed_arguments: u32,
    #[serde(default)]
    has_variadic_arguments: bool,
    stack_frame_num_slots: u32,
    #[serde(default)]
    parent: Option<usize>,
    #[serde(default)]
    upvalues: Vec<UpvalueDesc>,
    #[serde(default)]
    constants: Vec<ConstantDesc>,
    #[serde(default)]
    bytecode: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct UpvalueDesc {
    parent_local: bool,
    #[serde(default)]
    immutable: bool,
    slot: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
enum ConstantDesc {
    Double(f64),
    Int(i32),
    Boolean(bool),
    Nil,
    String(String),
    /// Ordinal of another function in this module.
    Function(usize),
    /// Template table for `TableDup` (dense array contents only).
    Table { array: Vec<ConstantDesc> },
}

fn assemble_function(
    vm: &mut Vm,
    desc: &FunctionDesc,
    ids: &[UcbId],
) -> Result<UnlinkedCodeBlock, ModuleError> {
    let mut b = BytecodeBuilder::new(
        desc.num_fixed_arguments,
        desc.has_variadic_arguments,
        desc.stack_frame_num_slots,
    );
    if let Some(parent) = desc.parent {
        b.set_parent(
            *ids.get(parent)
                .ok_or_else(|| invalid(format!("parent ordinal {parent} out of range")))?,
        );
    }
    for upvalue in &desc.upvalues {
        b.add_upvalue(UpvalueMetadata {
            is_parent_local: upvalue.parent_local,
            is_immutable: upvalue.immutable,
            slot: upvalue.slot,
        });
    }
    let mut consts = Vec::with_capacity(desc.constants.len());
    for constant in &desc.constants {
        consts.push(b.add_constant(constant_entry(vm, constant, ids)?));
    }
    for (index, parts) in desc.bytecode.iter().enumerate() {
        assemble_instruction(vm, &mut b, parts, &consts, index)?;
    }
    Ok(b.build())
}

fn constant_entry(
    vm: &mut Vm,
    desc: &ConstantDesc,
    ids: &[UcbId],
) -> Result<ConstantEntry, ModuleError> {
    Ok(match desc {
        ConstantDesc::Function(ordinal) => ConstantEntry::Code(
            *ids.get(*ordinal)
                .ok_or_else(|| invalid(format!("function ordinal {ordinal} out of range")))?,
        ),
        ConstantDesc::Table { array } => {
            let mut table = TableObject::new(0, array.len());
            for (i, element) in array.iter().enumerate() {
                table.put_int(i as i64 + 1, constant_value(vm, element)?);
            }
            ConstantEntry::Value(TValue::create_pointer(vm.heap.alloc_table(table)))
        }
        simple => ConstantEntry::Value(constant_value(vm, simple)?),
    })
}

fn constant_value(vm: &mut Vm, desc: &ConstantDesc) -> Result<TValue, ModuleError> {
    Ok(match desc {
        ConstantDesc::Double(d) => TValue::create_double(*d),
        ConstantDesc::Int(i) => TValue::create_int32(*i),
        ConstantDesc::Boolean(b) => TValue::create_boolean(*b),
        ConstantDesc::Nil => TValue::nil(),
        ConstantDesc::String(s) => TValue::create_pointer(vm.intern_string(s)),
        ConstantDesc::Function(_) | ConstantDesc::Table { .. } => {
            return Err(invalid("aggregate constant not allowed in this position"))
        }
    })
}

fn assemble_instruction(
    vm: &mut Vm,
    b: &mut BytecodeBuilder,
    parts: &[serde_json::Value],
    consts: &[ConstId],
    index: usize,
) -> Result<(), ModuleError> {
    let name = parts
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid(format!("instruction {index} must start with a mnemonic")))?;
    let op = Opcode::from_mnemonic(name)
        .ok_or_else(|| invalid(format!("unknown mnemonic '{name}' in instruction {index}")))?;

    let int = |i: usize| -> Result<i64, ModuleError> {
        parts
            .get(i + 1)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| invalid(format!("operand {i} of '{name}' must be an integer")))
    };
    let local = |i: usize| -> Result<u32, ModuleError> {
        u32::try_from(int(i)?)
            .map_err(|_| invalid(format!("operand {i} of '{name}' must be a frame-local slot")))
    };
    let u16_op = |i: usize| -> Result<u16, ModuleError> {
        u16::try_from(int(i)?)
            .map_err(|_| invalid(format!("operand {i} of '{name}' out of u16 range")))
    };
    let i16_op = |i: usize| -> Result<i16, ModuleError> {
        i16::try_from(int(i)?)
            .map_err(|_| invalid(format!("operand {i} of '{name}' out of i16 range")))
    };
    let u8_op = |i: usize| -> Result<u8, ModuleError> {
        u8::try_from(int(i)?)
            .map_err(|_| invalid(format!("operand {i} of '{name}' out of u8 range")))
    };
    let i32_op = |i: usize| -> Result<i32, ModuleError> {
        i32::try_from(int(i)?)
            .map_err(|_| invalid(format!("operand {i} of '{name}' out of i32 range")))
    };
    let flag = |i: usize| -> Result<bool, ModuleError> {
        let v = parts
            .get(i + 1)
            .ok_or_else(|| invalid(format!("operand {i} of '{name}' missing")))?;
        v.as_bool()
            .or_else(|| v.as_i64().map(|n| n != 0))
            .ok_or_else(|| invalid(format!("operand {i} of '{name}' must be a flag")))
    };
    let cid = |i: usize| -> Result<ConstId, ModuleError> {
        let v = int(i)?;
        let at = consts.len() as i64 + v;
        if v >= 0 || at < 0 {
            return Err(invalid(format!(
                "operand {i} of '{name}' must be a constant ordinal"
            )));
        }
        Ok(consts[at as usize])
    };
    let slot = |i: usize| -> Result<Slot, ModuleError> {
        let v = int(i)?;
        if v >= 0 {
            Ok(Slot::Local(v as u32))
        } else {
            Ok(Slot::Const(cid(i)?))
        }
    };

    match op {
        Opcode::Move => b.emit_move(slot(0)?, local(1)?),
        Opcode::Constant => {
            let dst = local(0)?;
            let raw = parts
                .get(2)
                .cloned()
                .ok_or_else(|| invalid(format!("'{name}' needs a constant operand")))?;
            let desc: ConstantDesc = serde_json::from_value(raw)?;
            let value = constant_value(vm, &desc)?;
            b.emit_constant(dst, value);
        }
        Opcode::FillNil => b.emit_fill_nil(local(0)?, local(1)?),
        Opcode::UpvalueGet => b.emit_upvalue_get(local(0)?, u16_op(1)?),
        Opcode::UpvaluePut => b.emit_upvalue_put(slot(0)?, u16_op(1)?),
        Opcode::UpvalueClose => {
            let at = b.emit_upvalue_close(local(0)?);
            b.set_branch_offset(at, i32_op(1)?);
        }
        Opcode::GlobalGet => b.emit_global_get(local(0)?, cid(1)?),
        Opcode::GlobalPut => b.emit_global_put(local(0)?, cid(1)?),
        Opcode::TableGetById => b.emit_table_get_by_id(local(0)?, local(1)?, cid(2)?),
        Opcode::TablePutById => b.emit_table_put_by_id(local(0)?, local(1)?, cid(2)?),
        Opcode::TableGetByVal => b.emit_table_get_by_val(local(0)?, local(1)?, local(2)?),
        Opcode::TablePutByVal => b.emit_table_put_by_val(local(0)?, local(1)?, local(2)?),
        Opcode::TableGetByIntegerVal => {
            b.emit_table_get_by_integer_val(local(0)?, local(1)?, i16_op(2)?)
        }
        Opcode::TablePutByIntegerVal => {
            b.emit_table_put_by_integer_val(local(0)?, local(1)?, i16_op(2)?)
        }
        Opcode::TableVariadicPutSeq => b.emit_table_variadic_put_seq(local(0)?, i32_op(1)?),
        Opcode::TableNew => b.emit_table_new(local(0)?, u8_op(1)?, u16_op(2)?),
        Opcode::TableDup => b.emit_table_dup(local(0)?, cid(1)?),
        Opcode::Call => b.emit_call(flag(0)?, flag(1)?, local(2)?, local(3)?, local(4)?),
        Opcode::TailCall => b.emit_tail_call(flag(0)?, local(1)?, local(2)?),
        Opcode::Return => b.emit_return(flag(0)?, u16_op(1)?, local(2)?),
        Opcode::VariadicArgsToVariadicRet => b.emit_variadic_args_to_variadic_ret(),
        Opcode::PutVariadicArgs => b.emit_put_variadic_args(local(0)?, local(1)?),
        Opcode::NewClosure => b.emit_new_closure(cid(0)?, local(1)?),
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            b.emit_arith(op, slot(0)?, slot(1)?, local(2)?)
        }
        Opcode::UnaryMinus => b.emit_unary_minus(local(0)?, local(1)?),
        Opcode::IsFalsy => b.emit_is_falsy(local(0)?, local(1)?),
        Opcode::Len => b.emit_len(local(0)?, local(1)?),
        Opcode::IsEq
        | Opcode::IsNeq
        | Opcode::IsLt
        | Opcode::IsNlt
        | Opcode::IsLe
        | Opcode::IsNle => {
            let at = b.emit_compare_branch(op, slot(0)?, slot(1)?);
            b.set_branch_offset(at, i32_op(2)?);
        }
        Opcode::CopyAndBranchIfTruthy => {
            let at = b.emit_copy_and_branch_if_truthy(local(0)?, local(1)?);
            b.set_branch_offset(at, i32_op(2)?);
        }
        Opcode::CopyAndBranchIfFalsy => {
            let at = b.emit_copy_and_branch_if_falsy(local(0)?, local(1)?);
            b.set_branch_offset(at, i32_op(2)?);
        }
        Opcode::BranchIfTruthy => {
            let at = b.emit_branch_if_truthy(local(0)?);
            b.set_branch_offset(at, i32_op(1)?);
        }
        Opcode::BranchIfFalsy => {
            let at = b.emit_branch_if_falsy(local(0)?);
            b.set_branch_offset(at, i32_op(1)?);
        }
        Opcode::Jump => {
            let at = b.emit_jump();
            b.set_branch_offset(at, i32_op(0)?);
        }
        Opcode::ForLoopInit => {
            let at = b.emit_for_loop_init(local(0)?);
            b.set_branch_offset(at, i32_op(1)?);
        }
        Opcode::ForLoopStep => {
            let at = b.emit_for_loop_step(local(0)?);
            b.set_branch_offset(at, i32_op(1)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_minimal_module() {
        let mut vm = Vm::new();
        let module = ScriptModule::parse_from_json(
            &mut vm,
            r#"{
                "name": "answer",
                "functions": [{
                    "stack_frame_num_slots": 4,
                    "bytecode": [
                        ["Constant", 0, {"double": 42.0}],
                        ["Return", 0, 1, 0]
                    ]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(module.name, "answer");
        let values = vm.launch_script(&module).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], TValue::create_double(42.0));
    }

    #[test]
    fn test_unknown_mnemonic_is_rejected() {
        let mut vm = Vm::new();
        let err = ScriptModule::parse_from_json(
            &mut vm,
            r#"{"functions": [{"stack_frame_num_slots": 4, "bytecode": [["Frobnicate"]]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::Invalid(_)));
    }

    #[test]
    fn test_constant_ordinal_validation() {
        let mut vm = Vm::new();
        let err = ScriptModule::parse_from_json(
            &mut vm,
            r#"{"functions": [{
                "stack_frame_num_slots": 4,
                "bytecode": [["GlobalGet", 0, -1]]
            }]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::Invalid(_)));
    }

    #[test]
    fn test_empty_module_is_rejected() {
        let mut vm = Vm::new();
        let err = ScriptModule::parse_from_json(&mut vm, r#"{"functions": []}"#).unwrap_err();
        assert!(matches!(err, ModuleError::Invalid(_)));
    }
}
