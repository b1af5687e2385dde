//! Built-in globals and host output plumbing
//!
//! The bootstrapped global object carries `print` and a `math` table with
//! `sqrt`. Both are native functions that receive their arguments as the
//! frame's variadic arguments and return through the ordinary return path.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::heap::{ExecutableCode, FunctionObject, Heap, HeapRef, NativeFunction, NativeRet};
use crate::table::TableObject;
use crate::value::{RuntimeError, TValue};
use crate::vm::frame::{read_header, FRAME_HEADER_SLOTS};
use crate::vm::Vm;

/// Destination for `print`. Defaults to stdout; tests inject a buffer.
pub type OutputWriter = Rc<RefCell<dyn Write>>;

pub fn stdout_writer() -> OutputWriter {
    Rc::new(RefCell::new(io::stdout()))
}

/// Build a global object populated with the built-in library.
pub(crate) fn create_global_object(heap: &mut Heap) -> HeapRef {
    let global = heap.alloc_table(TableObject::new(32, 0));

    let insert_native = |heap: &mut Heap, table: HeapRef, name: &str, func: NativeFunction| {
        let name_ref = heap.intern(name);
        let func_ref = heap.alloc_function(FunctionObject {
            executable: ExecutableCode::Native(func),
            upvalues: Box::default(),
        });
        heap.table_mut(table)
            .expect("builtin container is a table")
            .put_str(name_ref, TValue::create_pointer(func_ref));
        heap.barrier(table);
    };

    insert_native(heap, global, "print", builtin_print);

    let math = heap.alloc_table(TableObject::new(32, 0));
    insert_native(heap, math, "sqrt", math_sqrt);
    let math_name = heap.intern("math");
    heap.table_mut(global)
        .expect("global object is a table")
        .put_str(math_name, TValue::create_pointer(math));
    heap.barrier(global);

    global
}

/// `print(...)`: arguments tab-separated, newline-terminated. Write errors
/// are ignored, like unchecked stream output in a host `print`.
fn builtin_print(vm: &mut Vm, base: usize) -> Result<NativeRet, RuntimeError> {
    let num_args = read_header(&vm.rc.stack, base).num_variadic_arguments as usize;
    let args_begin = base - FRAME_HEADER_SLOTS - num_args;

    let mut line = String::new();
    for i in 0..num_args {
        if i > 0 {
            line.push('\t');
        }
        format_value(&mut line, vm, vm.rc.stack[args_begin + i]);
    }
    line.push('\n');

    let writer = Rc::clone(&vm.output);
    let _ = writer.borrow_mut().write_all(line.as_bytes());
    Ok(NativeRet {
        slot_begin: base,
        count: 0,
    })
}

/// `math.sqrt(x)`: double input required; result replaces the argument slot.
fn math_sqrt(vm: &mut Vm, base: usize) -> Result<NativeRet, RuntimeError> {
    let num_args = read_header(&vm.rc.stack, base).num_variadic_arguments as usize;
    if num_args < 1 {
        return Err(RuntimeError::type_error(
            "bad argument #1 to 'sqrt' (number expected, got no value)",
        ));
    }
    let slot = base - FRAME_HEADER_SLOTS - num_args;
    let v = vm.rc.stack[slot];
    if !v.is_double() {
        return Err(RuntimeError::type_error(format!(
            "bad argument #1 to 'sqrt' (number expected, got {})",
            vm.type_name(v)
        )));
    }
    vm.rc.stack[slot] = TValue::create_double(v.as_double().sqrt());
    Ok(NativeRet {
        slot_begin: slot,
        count: 1,
    })
}

/// Type-directed value formatting for `print`: integer-valued numbers print
/// without a fraction, other doubles with the default number-to-string
/// rules, strings verbatim, heap objects as `kind: 0x<address>`.
fn format_value(out: &mut String, vm: &Vm, v: TValue) {
    use std::fmt::Write as _;
    if v.is_int32() {
        let _ = write!(out, "{}", v.as_int32());
    } else if v.is_double() {
        let d = v.as_double();
        if d.is_finite() && d >= -9.2e18 && d <= 9.2e18 && (d as i64) as f64 == d {
            let _ = write!(out, "{}", d as i64);
        } else {
            out.push_str(&format_number(d));
        }
    } else if v.is_nil() {
        out.push_str("nil");
    } else if v.is_boolean() {
        out.push_str(if v.as_boolean() { "true" } else { "false" });
    } else {
        let r = v.as_pointer();
        if let Some(s) = vm.heap.str_value(r) {
            out.push_str(s);
        } else {
            let _ = write!(out, "{}: 0x{:012x}", vm.heap.kind_name(r), r.ordinal());
        }
    }
}

/// Default number-to-string conversion (the host language's `%.14g`):
/// fourteen significant digits, trailing zeros trimmed, scientific notation
/// outside the `[1e-4, 1e14)` magnitude window.
pub(crate) fn format_number(d: f64) -> String {
    if d.is_nan() {
        return "nan".to_string();
    }
    if d.is_infinite() {
        return if d < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if d == 0.0 {
        return if d.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.13e}", d);
    let e_pos = sci.find('e').expect("scientific format has an exponent");
    let exp: i32 = sci[e_pos + 1..].parse().expect("float exponent is an integer");

    if (-4..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let mut s = format!("{:.*}", decimals, d);
        if s.contains('.') {
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        s
    } else {
        let mut mantissa = sci[..e_pos].to_string();
        if mantissa.contains('.') {
            while mantissa.ends_with('0') {
                mantissa.pop();
            }
            if mantissa.ends_with('.') {
                mantissa.pop();
            }
        }
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

/// Numeric string scan matching the host language's `tonumber`: optional
/// surrounding whitespace and sign, hex integers with an `0x` prefix,
/// otherwise ordinary decimal/exponent notation.
pub(crate) fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if t.is_empty() {
        return None;
    }
    let (sign, digits) = match t.as_bytes()[0] {
        b'+' => (1.0, &t[1..]),
        b'-' => (-1.0, &t[1..]),
        _ => (1.0, t),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        let v = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(sign * v);
    }
    digits.parse::<f64>().ok().map(|v| sign * v)
}
