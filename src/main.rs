//! regvm 命令行
//!
//! 运行内置的演示程序：regvm [demo] [--workers N] [--limit N]

use std::env;
use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use regvm::config::{ENV_LOG, VERSION, VM_NAME};
use regvm::runtime::task::TaskField;
use regvm::{
    FunctionBuilder, Instruction, OpCode, RegisterVm, ResultType, RuntimeConfig, Scheduler,
    ThreadPool, VmConfig,
};

type DemoResult = Result<(), Box<dyn Error>>;

/// 命令行选项
#[derive(Debug)]
struct Options {
    demo: String,
    workers: usize,
    limit: Option<u64>,
}

fn print_help() {
    println!("{} {}", VM_NAME, VERSION);
    println!();
    println!("Usage: {} [demo] [--workers N] [--limit N]", VM_NAME);
    println!();
    println!("Demos:");
    println!("  arith          Arithmetic, division by zero and a counting loop");
    println!("  tasks          Cooperative tasks wired to a channel");
    println!("  parallel       Work queue drained by the thread pool");
    println!("  all            Run every demo (default)");
    println!();
    println!("Options:");
    println!("  --workers <N>  Worker threads for the parallel demo (default: ${})", regvm::config::ENV_WORKERS);
    println!("  --limit <N>    Abort after N instructions");
    println!();
    println!("Set {}=debug to see runtime logs.", ENV_LOG);
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("{} requires a value", flag))?;
    value
        .parse()
        .map_err(|_| format!("invalid value for {}: {}", flag, value))
}

fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options {
        demo: "all".to_string(),
        workers: RuntimeConfig::from_env().worker_threads(),
        limit: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "help" | "--help" | "-h" => return Ok(None),
            "version" | "--version" | "-v" => {
                println!("{} {}", VM_NAME, VERSION);
                process::exit(0);
            }
            "--workers" => {
                options.workers = parse_number("--workers", args.get(i + 1))?;
                i += 2;
            }
            "--limit" => {
                options.limit = Some(parse_number("--limit", args.get(i + 1))?);
                i += 2;
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option: {}", flag)),
            demo => {
                options.demo = demo.to_string();
                i += 1;
            }
        }
    }
    Ok(Some(options))
}

fn new_vm(options: &Options) -> RegisterVm {
    RegisterVm::with_config(VmConfig {
        instruction_limit: options.limit,
        ..VmConfig::default()
    })
}

// ============================================================================
// 演示程序
// ============================================================================

/// 算术：整数除零得 0、声明 f64 的加法、1..=100 求和
fn demo_arith(options: &Options) -> DemoResult {
    let mut b = FunctionBuilder::new("arith");
    b.load_const(0, 10i64, ResultType::I64);
    b.load_const(1, 0i64, ResultType::I64);
    b.binary(OpCode::Div, 2, 0, 1, ResultType::I64);
    b.op(OpCode::PrintInt, 0, 2, 0);

    b.load_const(3, 3i64, ResultType::I64);
    b.binary(OpCode::Add, 4, 0, 3, ResultType::F64);
    b.op(OpCode::PrintFloat, 0, 4, 0);

    // sum = 0; i = 1; while i <= 100 { sum += i; i += 1 }
    b.load_const(5, 0i64, ResultType::I64);
    b.load_const(6, 1i64, ResultType::I64);
    b.load_const(7, 100i64, ResultType::I64);
    b.load_const(8, 1i64, ResultType::I64);
    let top = b.here();
    b.op(OpCode::CmpLE, 9, 6, 7);
    let exit = b.jump(OpCode::JumpIfFalse, 9);
    b.binary(OpCode::Add, 5, 5, 6, ResultType::I64);
    b.binary(OpCode::Add, 6, 6, 8, ResultType::I64);
    b.jump_to(OpCode::Jump, 0, top);
    b.patch(exit);
    b.load_const(10, "sum(1..=100) = %s", ResultType::Ptr);
    b.op(OpCode::StrFormat, 11, 10, 5);
    b.op(OpCode::PrintString, 0, 11, 0);

    let mut vm = new_vm(options);
    vm.execute_function(&b.build())?;
    Ok(())
}

/// 协作式任务：三个上下文，第一个接到 Channel 上，单遍执行后读回计数器
fn demo_tasks(options: &Options) -> DemoResult {
    let mut b = FunctionBuilder::new("tasks");
    b.load_const(0, 3i64, ResultType::I64);
    b.op(OpCode::TaskContextAlloc, 1, 0, 0);
    b.load_const(2, 1i64, ResultType::I64);
    b.binary(OpCode::Add, 3, 1, 2, ResultType::I64);
    b.binary(OpCode::Add, 4, 3, 2, ResultType::I64);
    for ctx in [1, 3, 4] {
        b.op(OpCode::TaskContextInit, 5, ctx, 0);
    }
    b.load_const(6, 2i64, ResultType::I64);
    b.op(OpCode::ChannelAlloc, 7, 6, 0);
    b.emit(Instruction::new(OpCode::TaskSetField, 8, 1, 7).imm(TaskField::OUTPUT_CHANNEL));
    b.op(OpCode::SchedulerRun, 9, 0, 0);

    b.load_const(10, "executed %s tasks", ResultType::Ptr);
    b.op(OpCode::StrFormat, 11, 10, 9);
    b.op(OpCode::PrintString, 0, 11, 0);
    b.op(OpCode::ChannelPop, 12, 7, 0);
    b.load_const(13, "channel received %s", ResultType::Ptr);
    b.op(OpCode::StrFormat, 14, 13, 12);
    b.op(OpCode::PrintString, 0, 14, 0);

    let mut vm = new_vm(options);
    vm.execute_function(&b.build())?;
    Ok(())
}

/// 并行：把 1..=1000 推入工作队列，由线程池上的内核累加到原子槽 0
fn demo_parallel(options: &Options) -> DemoResult {
    let pool = Arc::new(ThreadPool::new(options.workers, Arc::new(Scheduler::new())));
    pool.start()?;

    let mut vm = new_vm(options);
    vm.attach_pool(Arc::clone(&pool));
    let atomics = Arc::clone(vm.atomics());
    vm.set_parallel_kernel(move |context| {
        atomics
            .entry(0)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(context, Ordering::SeqCst);
    });

    let mut b = FunctionBuilder::new("parallel");
    b.load_const(0, 0i64, ResultType::I64);
    b.op(OpCode::WorkQueueAlloc, 1, 0, 0);
    b.load_const(2, 1i64, ResultType::I64);
    b.load_const(3, 1000i64, ResultType::I64);
    b.load_const(4, 1i64, ResultType::I64);
    let top = b.here();
    b.op(OpCode::CmpLE, 5, 2, 3);
    let exit = b.jump(OpCode::JumpIfFalse, 5);
    b.op(OpCode::WorkQueuePush, 6, 1, 2);
    b.binary(OpCode::Add, 2, 2, 4, ResultType::I64);
    b.jump_to(OpCode::Jump, 0, top);
    b.patch(exit);
    b.load_const(7, options.workers as i64, ResultType::I64);
    b.op(OpCode::WorkerSignal, 8, 3, 7);
    b.load_const(9, 0i64, ResultType::I64);
    b.op(OpCode::ParallelWaitComplete, 10, 1, 9);
    b.emit(Instruction::new(OpCode::AtomicLoad, 11, 0, 0).imm(0));
    b.load_const(12, "parallel sum(1..=1000) = %s", ResultType::Ptr);
    b.op(OpCode::StrFormat, 13, 12, 11);
    b.op(OpCode::PrintString, 0, 13, 0);

    let result = vm.execute_function(&b.build());
    pool.stop();
    result?;

    let stats = pool.stats();
    tracing::info!(
        target: "regvm::cli",
        workers = stats.workers,
        executed = stats.executed,
        stolen = stats.stolen,
        "thread pool finished"
    );
    Ok(())
}

fn run(options: &Options) -> DemoResult {
    match options.demo.as_str() {
        "arith" => demo_arith(options),
        "tasks" => demo_tasks(options),
        "parallel" => demo_parallel(options),
        "all" => {
            demo_arith(options)?;
            demo_tasks(options)?;
            demo_parallel(options)
        }
        other => Err(format!("unknown demo: {}", other).into()),
    }
}

fn main() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_help();
            return;
        }
        Err(message) => {
            eprintln!("error: {}", message);
            print_help();
            process::exit(1);
        }
    };

    if let Err(error) = run(&options) {
        eprintln!("error: {}", error);
        process::exit(1);
    }
}
