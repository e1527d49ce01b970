use super::garbagecollector::NoRoots;
use super::*;
use OpCode as O;

fn function(
    machine: &mut Machine,
    name: Option<&str>,
    arity: u8,
    upvalue_count: usize,
    code: &[u8],
    literals: Vec<Value>,
) -> ObjRef {
    // the literals are the only thing keeping earlier functions alive
    let name = name.map(|n| machine.heap.intern(n, &literals));
    let mut chunk = Chunk::default();
    for byte in code {
        chunk.write(*byte, 1).unwrap();
    }
    chunk.literals = literals;
    machine.heap.alloc(
        Object::Function(FuncProto {
            arity,
            upvalue_count,
            name,
            chunk,
        }),
        &NoRoots,
    )
}

fn run_script(machine: &mut Machine, script: ObjRef) -> Result<String, Error> {
    let mut out = Vec::new();
    machine.run_function(script, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

/// fn counter() { var n = 0; return fn() { n = n + 1; return n; }; }
fn counter_script(machine: &mut Machine) -> ObjRef {
    let inc = function(
        machine,
        Some("inc"),
        0,
        1,
        &[
            O::GetUpvalue as u8,
            0,
            O::Literal as u8,
            0,
            O::Add as u8,
            O::SetUpvalue as u8,
            0,
            O::Return as u8,
        ],
        vec![Value::Number(1.0)],
    );
    let counter = function(
        machine,
        Some("counter"),
        0,
        0,
        &[
            O::Literal as u8,
            0,
            O::Closure as u8,
            1,
            1,
            1,
            O::Return as u8,
        ],
        vec![Value::Number(0.0), Value::Function(inc)],
    );
    #[rustfmt::skip]
    let code = [
        O::Closure as u8, 0,
        O::GetLocal as u8, 1, O::Call as u8, 0,
        O::GetLocal as u8, 2, O::Call as u8, 0, O::Print as u8, O::Pop as u8,
        O::GetLocal as u8, 2, O::Call as u8, 0, O::Print as u8, O::Pop as u8,
        O::GetLocal as u8, 1, O::Call as u8, 0,
        O::GetLocal as u8, 3, O::Call as u8, 0, O::Print as u8, O::Pop as u8,
        O::GetLocal as u8, 2, O::Call as u8, 0, O::Print as u8, O::Pop as u8,
        O::PopN as u8, 3,
        O::Nil as u8,
        O::Return as u8,
    ];
    function(machine, None, 0, 0, &code, vec![Value::Function(counter)])
}

#[test]
fn closures_own_their_closed_upvalue() {
    let mut machine = Machine::default();
    let script = counter_script(&mut machine);
    let out = run_script(&mut machine, script).unwrap();
    assert_eq!(out, "1\n2\n1\n3\n");
    assert_eq!(machine.stack_len(), 0);
}

#[test]
fn closures_survive_stress_collection() {
    let mut machine = Machine::new(Config {
        gc: GcConfig {
            stress: true,
            ..Default::default()
        },
        ..Default::default()
    });
    let script = counter_script(&mut machine);
    // the script function is only reachable through this root until it runs
    machine.push(Value::Function(script));
    machine.collect_garbage();
    machine.pop();
    let out = run_script(&mut machine, script).unwrap();
    assert_eq!(out, "1\n2\n1\n3\n");
    assert!(machine.heap.stats().collections > 0);
}

/// Two closures created in the same frame alias one variable while it is open,
/// and the survivor sees the last write after the frame returns.
#[test]
fn sibling_closures_share_one_upvalue() {
    let mut machine = Machine::default();
    let setter = function(
        &mut machine,
        Some("set"),
        1,
        1,
        &[
            O::GetLocal as u8,
            1,
            O::SetUpvalue as u8,
            0,
            O::Return as u8,
        ],
        vec![],
    );
    let getter = function(
        &mut machine,
        Some("get"),
        0,
        1,
        &[O::GetUpvalue as u8, 0, O::Return as u8],
        vec![],
    );
    #[rustfmt::skip]
    let pair_code = [
        O::Literal as u8, 0,
        O::Closure as u8, 1, 1, 1,
        O::Closure as u8, 2, 1, 1,
        O::GetLocal as u8, 2, O::Literal as u8, 3, O::Call as u8, 1, O::Pop as u8,
        O::GetLocal as u8, 1, O::Print as u8, O::Pop as u8,
        O::GetLocal as u8, 3,
        O::Return as u8,
    ];
    let pair = function(
        &mut machine,
        Some("pair"),
        0,
        0,
        &pair_code,
        vec![
            Value::Number(10.0),
            Value::Function(setter),
            Value::Function(getter),
            Value::Number(42.0),
        ],
    );
    #[rustfmt::skip]
    let code = [
        O::Closure as u8, 0,
        O::Call as u8, 0,
        O::Call as u8, 0,
        O::Echo as u8,
        O::Pop as u8,
        O::Nil as u8,
        O::Return as u8,
    ];
    let script = function(&mut machine, None, 0, 0, &code, vec![Value::Function(pair)]);
    let out = run_script(&mut machine, script).unwrap();
    assert_eq!(out, "42\n42\n");
}

#[test]
fn capture_reuses_and_close_switches_state() {
    let mut machine = Machine::default();
    for n in 0..4 {
        machine.push(Value::Number(n as f64));
    }
    let a = machine.capture_upvalue(3);
    let b = machine.capture_upvalue(1);
    let c = machine.capture_upvalue(2);
    assert_eq!(machine.capture_upvalue(3), a);
    assert_eq!(machine.open_upvalues, vec![a, c, b]);

    machine.close_upvalues(2);
    assert_eq!(machine.open_upvalues, vec![b]);
    assert_eq!(
        machine.heap.upvalue(a),
        UpvalueState::Closed(Value::Number(3.0))
    );
    assert_eq!(
        machine.heap.upvalue(c),
        UpvalueState::Closed(Value::Number(2.0))
    );
    assert_eq!(machine.heap.upvalue(b), UpvalueState::Open(1));
}

#[test]
fn stack_overflow_unwinds_every_frame() {
    let mut machine = Machine::new(Config {
        max_frames: 16,
        ..Default::default()
    });
    let recurse = function(
        &mut machine,
        Some("recurse"),
        0,
        0,
        &[O::GetLocal as u8, 0, O::Call as u8, 0, O::Return as u8],
        vec![],
    );
    let script = function(
        &mut machine,
        None,
        0,
        0,
        &[O::Closure as u8, 0, O::Call as u8, 0, O::Return as u8],
        vec![Value::Function(recurse)],
    );
    let err = run_script(&mut machine, script).unwrap_err();
    assert_eq!(err.kind, ErrorKind::StackOverflow);
    assert_eq!(err.trace.len(), 16);
    assert_eq!(err.trace[0].function, "recurse");
    assert_eq!(err.trace[15].function, "<script>");
    assert_eq!(machine.stack_len(), 0);
    assert!(machine.open_upvalues.is_empty());
}

#[test]
fn invalid_add_reports_line() {
    let mut machine = Machine::default();
    let script = function(
        &mut machine,
        None,
        0,
        0,
        &[
            O::True as u8,
            O::Literal as u8,
            0,
            O::Add as u8,
            O::Return as u8,
        ],
        vec![Value::Number(1.0)],
    );
    let err = run_script(&mut machine, script).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidAddOperands);
    assert_eq!(
        err.trace,
        vec![TraceFrame {
            function: "<script>".to_string(),
            line: 1
        }]
    );
}

#[test]
fn global_definition_is_checked() {
    let mut machine = Machine::default();
    let name = machine.heap.intern("g", &NoRoots);
    #[rustfmt::skip]
    let code = [
        O::Literal as u8, 1, O::DefineGlobalConst as u8, 0,
        O::GetGlobal as u8, 0, O::Print as u8, O::Pop as u8,
        O::Literal as u8, 1, O::SetGlobal as u8, 0,
        O::Return as u8,
    ];
    let script = function(
        &mut machine,
        None,
        0,
        0,
        &code,
        vec![Value::String(name), Value::Number(7.0)],
    );
    let err = run_script(&mut machine, script).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AssignToConstant("g".to_string()));
    assert_eq!(machine.get_global("g"), Some(Value::Number(7.0)));
}

#[test]
fn iterator_direction_is_fixed_on_first_compare() {
    let mut machine = Machine::default();
    // x, end, dir
    machine.push(Value::Number(5.0));
    machine.push(Value::Number(2.0));
    machine.push(Value::Number(0.0));
    assert_eq!(machine.compare_iterator(0, false), Ok(-1.0));
    assert_eq!(machine.peek(0), Value::Number(-1.0));
    machine.stack[0] = Value::Number(2.0);
    assert_eq!(machine.compare_iterator(0, false), Ok(0.0));
    assert_eq!(machine.compare_iterator(0, true), Ok(-1.0));

    machine.stack[0] = Value::Number(3.0);
    machine.stack[1] = Value::Number(3.0);
    machine.stack[2] = Value::Number(0.0);
    assert_eq!(machine.compare_iterator(0, false), Ok(0.0));
    assert_eq!(machine.compare_iterator(0, true), Ok(1.0));

    machine.stack[1] = Value::Nil;
    assert_eq!(
        machine.compare_iterator(0, true),
        Err(ErrorKind::RangeBoundsNotNumbers)
    );
}
