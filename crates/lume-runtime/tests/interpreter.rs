//! End-to-end interpreter tests over hand-assembled bytecode
//!
//! The front-end is out of scope, so these tests stage programs the way it
//! would: building unlinked code blocks with `BytecodeBuilder` (or loading a
//! JSON module) and launching them on a fresh VM.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use rstest::rstest;

use lume_runtime::{
    BytecodeBuilder, ConstantEntry, ModuleError, NativeRet, Opcode, OutputWriter, RuntimeError,
    ScriptModule, Slot, TValue, UcbId, Vm, FRAME_HEADER_SLOTS,
};

fn launch(vm: &mut Vm, entry: UcbId) -> Result<Vec<TValue>, RuntimeError> {
    let module = ScriptModule::new("<test>", vec![entry], entry);
    vm.launch_script(&module)
}

fn capture_output(vm: &mut Vm) -> Rc<RefCell<Vec<u8>>> {
    let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let writer: OutputWriter = buffer.clone();
    vm.set_output_writer(writer);
    buffer
}

fn d(x: f64) -> TValue {
    TValue::create_double(x)
}

/// First argument slot for a call staged at `func_slot`.
fn arg(func_slot: u32, i: u32) -> u32 {
    func_slot + FRAME_HEADER_SLOTS as u32 + i
}

// ============================================================================
// Returns and calls
// ============================================================================

#[test]
fn test_return_constant() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 4);
    b.emit_constant(0, d(42.0));
    b.emit_return(false, 1, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(42.0)]);
}

#[test]
fn test_call_with_fixed_args() {
    let mut vm = Vm::new();

    // add(a, b) = a + b
    let mut f = BytecodeBuilder::new(2, false, 8);
    f.emit_arith(Opcode::Add, Slot::Local(0), Slot::Local(1), 0);
    f.emit_return(false, 1, 0);
    let add = vm.add_unlinked_code_block(f.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c_add = m.add_constant(ConstantEntry::Code(add));
    m.emit_new_closure(c_add, 0);
    m.emit_constant(arg(0, 0), d(5.0));
    m.emit_constant(arg(0, 1), d(3.0));
    m.emit_call(false, false, 2, 1, 0);
    m.emit_return(false, 1, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap(), vec![d(8.0)]);
}

#[test]
fn test_missing_args_are_nil_padded() {
    let mut vm = Vm::new();

    // f(a, b) = returns b (which the caller never supplied)
    let mut f = BytecodeBuilder::new(2, false, 8);
    f.emit_return(false, 1, 1);
    let callee = vm.add_unlinked_code_block(f.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c = m.add_constant(ConstantEntry::Code(callee));
    m.emit_new_closure(c, 0);
    m.emit_constant(arg(0, 0), d(1.0));
    m.emit_call(false, false, 1, 1, 0);
    m.emit_return(false, 1, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap(), vec![TValue::nil()]);
}

#[test]
fn test_return_nil_padding_observed_by_caller() {
    let mut vm = Vm::new();

    let mut f = BytecodeBuilder::new(0, false, 4);
    f.emit_constant(0, d(7.0));
    f.emit_return(false, 1, 0);
    let callee = vm.add_unlinked_code_block(f.build());

    // Caller asks for three values from a one-value return.
    let mut m = BytecodeBuilder::new(0, false, 16);
    let c = m.add_constant(ConstantEntry::Code(callee));
    m.emit_new_closure(c, 0);
    m.emit_call(false, false, 0, 3, 0);
    m.emit_return(false, 3, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(
        launch(&mut vm, main).unwrap(),
        vec![d(7.0), TValue::nil(), TValue::nil()]
    );
}

#[test]
fn test_call_non_function_is_type_error() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 16);
    b.emit_constant(0, d(42.0));
    b.emit_call(false, false, 0, 0, 0);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());

    match launch(&mut vm, ucb).unwrap_err() {
        RuntimeError::TypeError { msg } => assert!(msg.contains("attempt to call a number")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[test]
fn test_recursive_fib() {
    let mut vm = Vm::new();
    let fib_name = vm.intern_string("fib");

    let mut f = BytecodeBuilder::new(1, false, 16);
    let c_name = f.add_constant(ConstantEntry::Value(TValue::create_pointer(fib_name)));
    let two = f.add_constant(ConstantEntry::Value(d(2.0)));
    let one = f.add_constant(ConstantEntry::Value(d(1.0)));
    // if n < 2 return n
    let else_branch = f.emit_compare_branch(Opcode::IsNlt, Slot::Local(0), Slot::Const(two));
    f.emit_return(false, 1, 0);
    f.patch_branch_to_here(else_branch);
    // fib(n - 1)
    f.emit_global_get(1, c_name);
    f.emit_arith(Opcode::Sub, Slot::Local(0), Slot::Const(one), arg(1, 0));
    f.emit_call(false, false, 1, 1, 1);
    // fib(n - 2)
    f.emit_global_get(2, c_name);
    f.emit_arith(Opcode::Sub, Slot::Local(0), Slot::Const(two), arg(2, 0));
    f.emit_call(false, false, 1, 1, 2);
    f.emit_arith(Opcode::Add, Slot::Local(1), Slot::Local(2), 0);
    f.emit_return(false, 1, 0);
    let fib = vm.add_unlinked_code_block(f.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c_fib = m.add_constant(ConstantEntry::Code(fib));
    let c_name = m.add_constant(ConstantEntry::Value(TValue::create_pointer(fib_name)));
    m.emit_new_closure(c_fib, 0);
    m.emit_global_put(0, c_name);
    m.emit_constant(arg(0, 0), d(10.0));
    m.emit_call(false, false, 1, 1, 0);
    m.emit_return(false, 1, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap(), vec![d(55.0)]);
}

// ============================================================================
// Tail calls
// ============================================================================

#[test]
fn test_self_tail_call_runs_in_constant_stack() {
    let mut vm = Vm::new();
    let name = vm.intern_string("count");

    // count(n, a) = if n == 0 then a else count(n - 1, a + 1)
    let mut f = BytecodeBuilder::new(2, false, 16);
    let c_name = f.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    let zero = f.add_constant(ConstantEntry::Value(d(0.0)));
    let one = f.add_constant(ConstantEntry::Value(d(1.0)));
    let done = f.emit_compare_branch(Opcode::IsEq, Slot::Local(0), Slot::Const(zero));
    f.emit_global_get(2, c_name);
    f.emit_arith(Opcode::Sub, Slot::Local(0), Slot::Const(one), arg(2, 0));
    f.emit_arith(Opcode::Add, Slot::Local(1), Slot::Const(one), arg(2, 1));
    f.emit_tail_call(false, 2, 2);
    f.patch_branch_to_here(done);
    f.emit_return(false, 1, 1);
    let count = vm.add_unlinked_code_block(f.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c_count = m.add_constant(ConstantEntry::Code(count));
    let c_name = m.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    m.emit_new_closure(c_count, 0);
    m.emit_global_put(0, c_name);
    m.emit_constant(arg(0, 0), d(1_000_000.0));
    m.emit_constant(arg(0, 1), d(0.0));
    m.emit_call(false, false, 2, 1, 0);
    m.emit_return(false, 1, 0);
    let main = vm.add_unlinked_code_block(m.build());

    // A million self tail calls fit in the fixed stack only if each one
    // reuses the caller's frame region.
    assert_eq!(launch(&mut vm, main).unwrap(), vec![d(1_000_000.0)]);
}

#[test]
fn test_runaway_non_tail_recursion_overflows() {
    let mut vm = Vm::new();
    let name = vm.intern_string("loop");

    let mut f = BytecodeBuilder::new(0, false, 8);
    let c_name = f.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    f.emit_global_get(0, c_name);
    f.emit_call(false, false, 0, 0, 0);
    f.emit_return(false, 0, 0);
    let looper = vm.add_unlinked_code_block(f.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c_loop = m.add_constant(ConstantEntry::Code(looper));
    let c_name = m.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    m.emit_new_closure(c_loop, 0);
    m.emit_global_put(0, c_name);
    m.emit_call(false, false, 0, 0, 0);
    m.emit_return(false, 0, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap_err(), RuntimeError::StackOverflow);
}

// ============================================================================
// Variadic arguments and returns
// ============================================================================

#[test]
fn test_variadic_roundtrip() {
    let mut vm = Vm::new();

    // g(...) = return ...
    let mut g = BytecodeBuilder::new(0, true, 8);
    g.emit_variadic_args_to_variadic_ret();
    g.emit_return(true, 0, 0);
    let forward = vm.add_unlinked_code_block(g.build());

    let mut m = BytecodeBuilder::new(0, true, 16);
    let c_g = m.add_constant(ConstantEntry::Code(forward));
    m.emit_new_closure(c_g, 0);
    m.emit_constant(arg(0, 0), d(10.0));
    m.emit_constant(arg(0, 1), d(20.0));
    m.emit_constant(arg(0, 2), d(30.0));
    m.emit_call(true, false, 3, 0, 0);
    m.emit_return(true, 0, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(
        launch(&mut vm, main).unwrap(),
        vec![d(10.0), d(20.0), d(30.0)]
    );
}

#[test]
fn test_put_variadic_args_pads_with_nil() {
    let mut vm = Vm::new();

    // g(...) copies four varargs into locals and returns them.
    let mut g = BytecodeBuilder::new(0, true, 8);
    g.emit_put_variadic_args(0, 4);
    g.emit_return(false, 4, 0);
    let take4 = vm.add_unlinked_code_block(g.build());

    let mut m = BytecodeBuilder::new(0, false, 16);
    let c_g = m.add_constant(ConstantEntry::Code(take4));
    m.emit_new_closure(c_g, 0);
    m.emit_constant(arg(0, 0), d(10.0));
    m.emit_constant(arg(0, 1), d(20.0));
    m.emit_constant(arg(0, 2), d(30.0));
    m.emit_call(false, false, 3, 4, 0);
    m.emit_return(false, 4, 0);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(
        launch(&mut vm, main).unwrap(),
        vec![d(10.0), d(20.0), d(30.0), TValue::nil()]
    );
}

#[test]
fn test_variadic_rets_forwarded_as_params() {
    let mut vm = Vm::new();

    // g(...) = return ...
    let mut g = BytecodeBuilder::new(0, true, 8);
    g.emit_variadic_args_to_variadic_ret();
    g.emit_return(true, 0, 0);
    let forward = vm.add_unlinked_code_block(g.build());

    // sum3(a, b, c) = a + b + c
    let mut s = BytecodeBuilder::new(3, false, 8);
    s.emit_arith(Opcode::Add, Slot::Local(0), Slot::Local(1), 0);
    s.emit_arith(Opcode::Add, Slot::Local(0), Slot::Local(2), 0);
    s.emit_return(false, 1, 0);
    let sum3 = vm.add_unlinked_code_block(s.build());

    // sum3(g(10, 20, 30))
    let mut m = BytecodeBuilder::new(0, false, 24);
    let c_g = m.add_constant(ConstantEntry::Code(forward));
    let c_sum = m.add_constant(ConstantEntry::Code(sum3));
    m.emit_new_closure(c_g, 0);
    m.emit_constant(arg(0, 0), d(10.0));
    m.emit_constant(arg(0, 1), d(20.0));
    m.emit_constant(arg(0, 2), d(30.0));
    m.emit_call(true, false, 3, 0, 0);
    m.emit_new_closure(c_sum, 1);
    m.emit_call(false, true, 0, 1, 1);
    m.emit_return(false, 1, 1);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap(), vec![d(60.0)]);
}

// ============================================================================
// Comparisons: NaN asymmetry
// ============================================================================

fn run_compare(op: Opcode, lhs: f64, rhs: f64) -> bool {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(lhs));
    b.emit_constant(1, d(rhs));
    let taken = b.emit_compare_branch(op, Slot::Local(0), Slot::Local(1));
    b.emit_constant(2, TValue::create_boolean(false));
    b.emit_return(false, 1, 2);
    b.patch_branch_to_here(taken);
    b.emit_constant(2, TValue::create_boolean(true));
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(&mut vm, ucb).unwrap()[0] == TValue::create_boolean(true)
}

#[test]
fn test_nan_comparison_asymmetry() {
    // IsNlt(NaN, 1) branches, IsLe(1, NaN) does not: !(x < y) is not y <= x
    // under NaN.
    assert!(run_compare(Opcode::IsNlt, f64::NAN, 1.0));
    assert!(!run_compare(Opcode::IsLe, 1.0, f64::NAN));
    assert!(run_compare(Opcode::IsNle, f64::NAN, 1.0));
    assert!(!run_compare(Opcode::IsLt, f64::NAN, 1.0));
    // NaN is not equal to itself under the double path.
    assert!(!run_compare(Opcode::IsEq, f64::NAN, f64::NAN));
    assert!(run_compare(Opcode::IsNeq, f64::NAN, f64::NAN));
}

#[test]
fn test_eq_mixed_representations_fall_back_to_identity() {
    let mut vm = Vm::new();
    // int32 2 and double 2.0 are distinct representations, so the identity
    // fallback reports them unequal.
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::create_int32(2));
    b.emit_constant(1, d(2.0));
    let taken = b.emit_compare_branch(Opcode::IsEq, Slot::Local(0), Slot::Local(1));
    b.emit_constant(2, TValue::create_boolean(false));
    b.emit_return(false, 1, 2);
    b.patch_branch_to_here(taken);
    b.emit_constant(2, TValue::create_boolean(true));
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(
        launch(&mut vm, ucb).unwrap(),
        vec![TValue::create_boolean(false)]
    );
}

#[test]
fn test_eq_interned_strings_alias() {
    let mut vm = Vm::new();
    let a = vm.intern_string("same");
    let b_ref = vm.intern_string("same");
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::create_pointer(a));
    b.emit_constant(1, TValue::create_pointer(b_ref));
    let taken = b.emit_compare_branch(Opcode::IsEq, Slot::Local(0), Slot::Local(1));
    b.emit_constant(2, TValue::create_boolean(false));
    b.emit_return(false, 1, 2);
    b.patch_branch_to_here(taken);
    b.emit_constant(2, TValue::create_boolean(true));
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(
        launch(&mut vm, ucb).unwrap(),
        vec![TValue::create_boolean(true)]
    );
}

#[test]
fn test_compare_non_number_is_type_error() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::nil());
    b.emit_constant(1, d(1.0));
    b.emit_compare_branch(Opcode::IsLt, Slot::Local(0), Slot::Local(1));
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    match launch(&mut vm, ucb).unwrap_err() {
        RuntimeError::TypeError { msg } => assert!(msg.contains("attempt to compare")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

#[rstest]
#[case(Opcode::Add, 7.0, 2.0, 9.0)]
#[case(Opcode::Sub, 7.0, 2.0, 5.0)]
#[case(Opcode::Mul, 7.0, 2.0, 14.0)]
#[case(Opcode::Div, 7.0, 2.0, 3.5)]
#[case(Opcode::Mod, 7.0, 2.0, 1.0)]
#[case(Opcode::Mod, -5.0, 3.0, 1.0)]
#[case(Opcode::Mod, 5.0, -3.0, -1.0)]
fn test_arithmetic(#[case] op: Opcode, #[case] lhs: f64, #[case] rhs: f64, #[case] expected: f64) {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(lhs));
    b.emit_constant(1, d(rhs));
    b.emit_arith(op, Slot::Local(0), Slot::Local(1), 2);
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(expected)]);
}

#[test]
fn test_division_by_zero_is_ieee_not_an_error() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(1.0));
    b.emit_constant(1, d(0.0));
    b.emit_arith(Opcode::Div, Slot::Local(0), Slot::Local(1), 2);
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(f64::INFINITY)]);
}

#[test]
fn test_arithmetic_on_string_is_type_error() {
    let mut vm = Vm::new();
    let s = vm.intern_string("oops");
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::create_pointer(s));
    b.emit_constant(1, d(1.0));
    b.emit_arith(Opcode::Add, Slot::Local(0), Slot::Local(1), 2);
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    match launch(&mut vm, ucb).unwrap_err() {
        RuntimeError::TypeError { msg } => {
            assert!(msg.contains("attempt to perform arithmetic on a string"))
        }
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[test]
fn test_unary_minus_and_is_falsy() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(2.5));
    b.emit_unary_minus(0, 1);
    b.emit_constant(2, TValue::nil());
    b.emit_is_falsy(2, 2);
    b.emit_constant(3, d(0.0));
    b.emit_is_falsy(3, 3);
    b.emit_return(false, 3, 1);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(
        launch(&mut vm, ucb).unwrap(),
        vec![
            d(-2.5),
            TValue::create_boolean(true),
            TValue::create_boolean(false)
        ]
    );
}

// ============================================================================
// Numeric for-loops
// ============================================================================

fn run_counted_loop(vm: &mut Vm, start: TValue, limit: TValue, step: TValue) -> Vec<TValue> {
    // s = 0; for i = start, limit, step do s = s + i end; return s
    let mut b = BytecodeBuilder::new(0, false, 16);
    b.emit_constant(0, d(0.0));
    b.emit_constant(1, start);
    b.emit_constant(2, limit);
    b.emit_constant(3, step);
    let init = b.emit_for_loop_init(1);
    let body = b.here();
    b.emit_arith(Opcode::Add, Slot::Local(0), Slot::Local(4), 0);
    let step_at = b.emit_for_loop_step(1);
    b.patch_branch(step_at, body);
    b.patch_branch_to_here(init);
    b.emit_return(false, 1, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(vm, ucb).unwrap()
}

#[rstest]
#[case(1.0, 10.0, 1.0, 55.0)]
#[case(10.0, 1.0, -1.0, 55.0)]
#[case(1.0, 10.0, 0.5, 104.5)]
#[case(5.0, 1.0, 1.0, 0.0)]
#[case(3.0, 3.0, 1.0, 3.0)]
fn test_for_loop_iteration(
    #[case] start: f64,
    #[case] limit: f64,
    #[case] step: f64,
    #[case] expected: f64,
) {
    let mut vm = Vm::new();
    let result = run_counted_loop(&mut vm, d(start), d(limit), d(step));
    assert_eq!(result, vec![d(expected)]);
}

#[test]
fn test_for_loop_coerces_string_bound() {
    let mut vm = Vm::new();
    let five = vm.intern_string("5");
    let result = run_counted_loop(&mut vm, d(1.0), TValue::create_pointer(five), d(1.0));
    assert_eq!(result, vec![d(15.0)]);
}

#[test]
fn test_for_loop_bad_bound_is_name_error() {
    let mut vm = Vm::new();
    let bogus = vm.intern_string("not a number");
    let err = {
        let mut b = BytecodeBuilder::new(0, false, 16);
        b.emit_constant(0, d(1.0));
        b.emit_constant(1, TValue::create_pointer(bogus));
        b.emit_constant(2, d(1.0));
        let init = b.emit_for_loop_init(0);
        b.patch_branch_to_here(init);
        b.emit_return(false, 0, 0);
        let ucb = vm.add_unlinked_code_block(b.build());
        launch(&mut vm, ucb).unwrap_err()
    };
    match err {
        RuntimeError::NameError { msg } => assert!(msg.contains("'for' limit")),
        other => panic!("expected NameError, got {other:?}"),
    }
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn test_copy_and_branch_copies_unconditionally() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::create_boolean(false));
    let taken = b.emit_copy_and_branch_if_falsy(1, 0);
    b.emit_return(false, 0, 0);
    b.patch_branch_to_here(taken);
    // The copy happened even though we branched.
    b.emit_return(false, 1, 1);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(
        launch(&mut vm, ucb).unwrap(),
        vec![TValue::create_boolean(false)]
    );
}

#[test]
fn test_unconditional_jump_and_fill_nil() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(1.0));
    b.emit_constant(1, d(2.0));
    let over = b.emit_jump();
    b.emit_constant(0, d(99.0));
    b.patch_branch_to_here(over);
    b.emit_fill_nil(1, 1);
    b.emit_return(false, 2, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(1.0), TValue::nil()]);
}

// ============================================================================
// Tables
// ============================================================================

#[test]
fn test_table_put_get_by_id() {
    let mut vm = Vm::new();
    let key = vm.intern_string("x");
    let mut b = BytecodeBuilder::new(0, false, 8);
    let c_key = b.add_constant(ConstantEntry::Value(TValue::create_pointer(key)));
    b.emit_table_new(0, 0, 0);
    b.emit_constant(1, d(5.0));
    b.emit_table_put_by_id(0, 1, c_key);
    b.emit_table_get_by_id(0, 2, c_key);
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(5.0)]);
}

#[test]
fn test_table_integer_and_dynamic_access() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_table_new(0, 0, 4);
    b.emit_constant(1, d(10.0));
    b.emit_table_put_by_integer_val(0, 1, 1);
    // t[2.0] through the dynamic path aliases t[2].
    b.emit_constant(1, d(20.0));
    b.emit_constant(2, d(2.0));
    b.emit_table_put_by_val(0, 1, 2);
    b.emit_table_get_by_integer_val(0, 3, 2);
    b.emit_len(0, 4);
    b.emit_return(false, 2, 3);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(20.0), d(2.0)]);
}

#[test]
fn test_indexing_non_table_is_type_error() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, d(1.0));
    b.emit_table_get_by_integer_val(0, 1, 1);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    match launch(&mut vm, ucb).unwrap_err() {
        RuntimeError::TypeError { msg } => assert!(msg.contains("attempt to index a number")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[test]
fn test_table_dup_clones_template_shallowly() {
    let mut vm = Vm::new();
    let template = vm.create_table();
    let template_tv = TValue::create_pointer(template);
    vm.table_set(template_tv, TValue::create_int32(1), d(99.0))
        .unwrap();

    let mut b = BytecodeBuilder::new(0, false, 8);
    let c_tpl = b.add_constant(ConstantEntry::Value(template_tv));
    b.emit_table_dup(0, c_tpl);
    b.emit_constant(1, d(55.0));
    b.emit_table_put_by_integer_val(0, 1, 1);
    b.emit_table_get_by_integer_val(0, 2, 1);
    b.emit_return(false, 1, 2);
    let ucb = vm.add_unlinked_code_block(b.build());

    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(55.0)]);
    // The template itself was not mutated through the clone.
    assert_eq!(
        vm.table_get(template_tv, TValue::create_int32(1)),
        Some(d(99.0))
    );
}

#[test]
fn test_table_variadic_put_seq() {
    let mut vm = Vm::new();

    let mut g = BytecodeBuilder::new(0, true, 8);
    g.emit_variadic_args_to_variadic_ret();
    g.emit_return(true, 0, 0);
    let forward = vm.add_unlinked_code_block(g.build());

    // t = {}; t[1..] = g(10, 20, 30); return t[2], #t
    let mut m = BytecodeBuilder::new(0, false, 24);
    let c_g = m.add_constant(ConstantEntry::Code(forward));
    m.emit_table_new(0, 0, 4);
    m.emit_new_closure(c_g, 1);
    m.emit_constant(arg(1, 0), d(10.0));
    m.emit_constant(arg(1, 1), d(20.0));
    m.emit_constant(arg(1, 2), d(30.0));
    m.emit_call(true, false, 3, 0, 1);
    m.emit_table_variadic_put_seq(0, 1);
    m.emit_table_get_by_integer_val(0, 1, 2);
    m.emit_len(0, 2);
    m.emit_return(false, 2, 1);
    let main = vm.add_unlinked_code_block(m.build());

    assert_eq!(launch(&mut vm, main).unwrap(), vec![d(20.0), d(3.0)]);
}

#[test]
fn test_length_of_string() {
    let mut vm = Vm::new();
    let s = vm.intern_string("hello");
    let mut b = BytecodeBuilder::new(0, false, 8);
    b.emit_constant(0, TValue::create_pointer(s));
    b.emit_len(0, 1);
    b.emit_return(false, 1, 1);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![d(5.0)]);
}

// ============================================================================
// Globals
// ============================================================================

#[test]
fn test_global_put_visible_to_host() {
    let mut vm = Vm::new();
    let name = vm.intern_string("answer");
    let mut b = BytecodeBuilder::new(0, false, 8);
    let c_name = b.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    b.emit_constant(0, d(3.5));
    b.emit_global_put(0, c_name);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(&mut vm, ucb).unwrap();
    assert_eq!(vm.read_global("answer"), d(3.5));
}

#[test]
fn test_missing_global_reads_nil() {
    let mut vm = Vm::new();
    let name = vm.intern_string("no_such_global");
    let mut b = BytecodeBuilder::new(0, false, 8);
    let c_name = b.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    b.emit_global_get(0, c_name);
    b.emit_return(false, 1, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    assert_eq!(launch(&mut vm, ucb).unwrap(), vec![TValue::nil()]);
}

// ============================================================================
// Per-global-object code block specialization
// ============================================================================

#[test]
fn test_code_block_per_global_object() {
    let mut vm = Vm::new();
    let mut b = BytecodeBuilder::new(0, false, 4);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());

    let g1 = vm.global_object();
    let g2 = vm.create_global_object();
    let cb1 = vm.code_block_for(ucb, g1).unwrap();
    let cb2 = vm.code_block_for(ucb, g2).unwrap();
    assert_ne!(cb1, cb2);
    // Re-linking is a cache hit for both pairings.
    assert_eq!(vm.code_block_for(ucb, g1).unwrap(), cb1);
    assert_eq!(vm.code_block_for(ucb, g2).unwrap(), cb2);
}

// ============================================================================
// Builtins and JSON modules
// ============================================================================

#[test]
fn test_print_sqrt_module() {
    let mut vm = Vm::new();
    let buffer = capture_output(&mut vm);
    let module = ScriptModule::parse_from_json(
        &mut vm,
        r#"{
            "name": "e1",
            "functions": [{
                "stack_frame_num_slots": 10,
                "constants": [
                    {"string": "print"},
                    {"string": "math"},
                    {"string": "sqrt"}
                ],
                "bytecode": [
                    ["GlobalGet", 0, -3],
                    ["GlobalGet", 1, -2],
                    ["TableGetById", 1, 1, -1],
                    ["Constant", 5, {"double": 16.0}],
                    ["Call", 0, 0, 1, 1, 1],
                    ["Move", 1, 4],
                    ["Call", 0, 0, 1, 0, 0],
                    ["Return", 0, 0, 0]
                ]
            }]
        }"#,
    )
    .unwrap();
    vm.launch_script(&module).unwrap();
    assert_eq!(String::from_utf8(buffer.borrow().clone()).unwrap(), "4\n");
}

#[test]
fn test_print_formatting() {
    let mut vm = Vm::new();
    let buffer = capture_output(&mut vm);
    let print_name = vm.intern_string("print");
    let hi = vm.intern_string("hi");

    let mut b = BytecodeBuilder::new(0, false, 16);
    let c_print = b.add_constant(ConstantEntry::Value(TValue::create_pointer(print_name)));
    b.emit_global_get(0, c_print);
    b.emit_constant(arg(0, 0), TValue::nil());
    b.emit_constant(arg(0, 1), TValue::create_boolean(true));
    b.emit_constant(arg(0, 2), d(1.5));
    b.emit_constant(arg(0, 3), TValue::create_int32(7));
    b.emit_constant(arg(0, 4), TValue::create_pointer(hi));
    b.emit_call(false, false, 5, 0, 0);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(&mut vm, ucb).unwrap();

    assert_eq!(
        String::from_utf8(buffer.borrow().clone()).unwrap(),
        "nil\ttrue\t1.5\t7\thi\n"
    );
}

#[test]
fn test_print_heap_objects_show_kind_and_address() {
    let mut vm = Vm::new();
    let buffer = capture_output(&mut vm);
    let print_name = vm.intern_string("print");

    let mut b = BytecodeBuilder::new(0, false, 16);
    let c_print = b.add_constant(ConstantEntry::Value(TValue::create_pointer(print_name)));
    b.emit_global_get(0, c_print);
    b.emit_table_new(arg(0, 0), 0, 0);
    b.emit_call(false, false, 1, 0, 0);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(&mut vm, ucb).unwrap();

    let output = String::from_utf8(buffer.borrow().clone()).unwrap();
    assert!(output.starts_with("table: 0x"), "got: {output}");
}

#[test]
fn test_sqrt_type_error() {
    let mut vm = Vm::new();
    let err = {
        let print_module = r#"{
            "functions": [{
                "stack_frame_num_slots": 10,
                "constants": [{"string": "math"}, {"string": "sqrt"}],
                "bytecode": [
                    ["GlobalGet", 0, -2],
                    ["TableGetById", 0, 0, -1],
                    ["Constant", 4, {"string": "sixteen"}],
                    ["Call", 0, 0, 1, 1, 0],
                    ["Return", 0, 0, 0]
                ]
            }]
        }"#;
        let module = ScriptModule::parse_from_json(&mut vm, print_module).unwrap();
        vm.launch_script(&module).unwrap_err()
    };
    match err {
        RuntimeError::TypeError { msg } => assert!(msg.contains("number expected")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[test]
fn test_module_with_closure_function_constant() {
    let mut vm = Vm::new();
    let module = ScriptModule::parse_from_json(
        &mut vm,
        r#"{
            "functions": [
                {
                    "num_fixed_arguments": 1,
                    "stack_frame_num_slots": 8,
                    "parent": 1,
                    "bytecode": [
                        ["Add", 0, 0, 0],
                        ["Return", 0, 1, 0]
                    ]
                },
                {
                    "stack_frame_num_slots": 16,
                    "constants": [{"function": 0}],
                    "bytecode": [
                        ["NewClosure", -1, 0],
                        ["Constant", 4, {"double": 21.0}],
                        ["Call", 0, 0, 1, 1, 0],
                        ["Return", 0, 1, 0]
                    ]
                }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(vm.launch_script(&module).unwrap(), vec![d(42.0)]);
}

#[test]
fn test_host_registered_native_function() {
    fn mark(vm: &mut Vm, base: usize) -> Result<NativeRet, RuntimeError> {
        let global = TValue::create_pointer(vm.global_object());
        let key = TValue::create_pointer(vm.intern_string("mark"));
        vm.table_set(global, key, TValue::create_double(42.0))?;
        Ok(NativeRet {
            slot_begin: base,
            count: 0,
        })
    }

    let mut vm = Vm::new();
    let func = vm.create_native_function(mark);
    let name = vm.intern_string("mark_fn");
    let global = TValue::create_pointer(vm.global_object());
    vm.table_set(
        global,
        TValue::create_pointer(name),
        TValue::create_pointer(func),
    )
    .unwrap();

    let mut b = BytecodeBuilder::new(0, false, 8);
    let c_name = b.add_constant(ConstantEntry::Value(TValue::create_pointer(name)));
    b.emit_global_get(0, c_name);
    b.emit_call(false, false, 0, 0, 0);
    b.emit_return(false, 0, 0);
    let ucb = vm.add_unlinked_code_block(b.build());
    launch(&mut vm, ucb).unwrap();

    assert_eq!(vm.read_global("mark"), d(42.0));
}

#[test]
fn test_module_bad_entry_rejected() {
    let mut vm = Vm::new();
    let err = ScriptModule::parse_from_json(
        &mut vm,
        r#"{"entry": 5, "functions": [{"stack_frame_num_slots": 4, "bytecode": [["Return", 0, 0, 0]]}]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, ModuleError::Invalid(_)));
}
