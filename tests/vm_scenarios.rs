//! 虚拟机端到端场景

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use regvm::runtime::task::{TaskField, TaskState};
use regvm::{FunctionBuilder, Instruction, OpCode, RegisterValue, RegisterVm, ResultType, VmError};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn division_by_zero_prints_zero() {
    let out = Captured::default();
    let mut vm = RegisterVm::new().with_output(out.clone());

    let mut b = FunctionBuilder::new("main");
    b.load_const(0, 10i64, ResultType::I64);
    b.load_const(1, 0i64, ResultType::I64);
    b.binary(OpCode::Div, 2, 0, 1, ResultType::I64);
    b.op(OpCode::PrintInt, 0, 2, 0);

    vm.execute_function(&b.build()).unwrap();
    assert_eq!(out.text(), "0\n");
}

#[test]
fn three_tasks_one_wired_channel() {
    let mut vm = RegisterVm::new().with_output(io::sink());

    let mut b = FunctionBuilder::new("main");
    b.load_const(0, 3i64, ResultType::I64);
    b.op(OpCode::TaskContextAlloc, 1, 0, 0);
    b.load_const(2, 1i64, ResultType::I64);
    b.binary(OpCode::Add, 3, 1, 2, ResultType::I64);
    b.binary(OpCode::Add, 4, 3, 2, ResultType::I64);
    for ctx in [1, 3, 4] {
        b.op(OpCode::TaskContextInit, 5, ctx, 0);
    }
    b.load_const(6, 4i64, ResultType::I64);
    b.op(OpCode::ChannelAlloc, 7, 6, 0);
    b.emit(Instruction::new(OpCode::TaskSetField, 8, 1, 7).imm(TaskField::OUTPUT_CHANNEL));
    b.op(OpCode::SchedulerRun, 9, 0, 0);
    vm.execute_function(&b.build()).unwrap();

    assert_eq!(vm.register(9), Some(&RegisterValue::Int(3)));

    let channel_handle = vm.register(7).and_then(RegisterValue::as_int).unwrap();
    let channel = vm.scheduler().channel(channel_handle).unwrap();
    assert_eq!(channel.len(), 1);

    let ctx0 = vm.scheduler().task(0).unwrap();
    assert_eq!(channel.try_receive(), Some(RegisterValue::Int(ctx0.counter)));
    assert_eq!(ctx0.counter, 1);
    for handle in 0..3 {
        assert_eq!(
            vm.scheduler().task(handle).unwrap().state(),
            TaskState::Completed
        );
    }
}

#[test]
fn recursive_fibonacci_through_call() {
    let mut vm = RegisterVm::new().with_output(io::sink());

    // fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
    let mut fib = FunctionBuilder::new("fib").params(1);
    fib.load_const(1, 2i64, ResultType::I64);
    fib.op(OpCode::CmpLT, 2, 0, 1);
    let recurse = fib.jump(OpCode::JumpIfFalse, 2);
    fib.op(OpCode::Return, 0, 0, 0);
    fib.patch(recurse);
    fib.load_const(3, 1i64, ResultType::I64);
    fib.binary(OpCode::Sub, 4, 0, 3, ResultType::I64);
    fib.call(5, 0, 4, 1);
    fib.binary(OpCode::Sub, 6, 0, 1, ResultType::I64);
    fib.call(7, 0, 6, 1);
    fib.binary(OpCode::Add, 8, 5, 7, ResultType::I64);
    fib.op(OpCode::Return, 8, 0, 0);
    let index = vm.register_function(fib.build()).unwrap();

    let mut main = FunctionBuilder::new("main");
    main.load_const(0, 15i64, ResultType::I64);
    main.call(1, index, 0, 1);
    vm.execute_function(&main.build()).unwrap();

    assert_eq!(vm.register(1), Some(&RegisterValue::Int(610)));
}

#[test]
fn malformed_jump_is_reported_not_executed() {
    let mut vm = RegisterVm::new().with_output(io::sink());
    let mut b = FunctionBuilder::new("bad");
    b.emit(Instruction::new(OpCode::Jump, 0, 0, 0).imm(42));

    let err = vm.execute_function(&b.build()).unwrap_err();
    assert!(matches!(err, VmError::JumpOutOfRange { target: 42, .. }));
    assert!(err.to_string().contains("jumps to 42"));
}
