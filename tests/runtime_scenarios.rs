//! 并发运行时端到端场景

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regvm::runtime::{ErrorHandlingStrategy, RuntimeConfig};
use regvm::{Channel, ConcurrencyRuntime, RegisterValue, Scheduler, ThreadPool};

#[test]
fn channel_round_trip_then_blocks_until_send() {
    let channel: Arc<Channel<(i64, &'static str)>> = Arc::new(Channel::bounded(2));
    channel.send((1, "a")).unwrap();
    channel.send((2, "b")).unwrap();
    assert_eq!(channel.receive(), Some((1, "a")));
    assert_eq!(channel.receive(), Some((2, "b")));

    let producer = Arc::clone(&channel);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer.send((3, "c")).unwrap();
    });

    // 空且未关闭：阻塞直到生产者发送
    assert_eq!(channel.receive(), Some((3, "c")));
    handle.join().unwrap();

    channel.close();
    assert_eq!(channel.receive(), None);
}

#[test]
fn thread_pool_stop_joins_after_draining() {
    let scheduler = Arc::new(Scheduler::new());
    let pool = ThreadPool::new(4, Arc::clone(&scheduler));
    pool.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let done = Arc::clone(&done);
        scheduler
            .submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    pool.stop();
    assert!(!pool.is_running());
    assert_eq!(done.load(Ordering::SeqCst), 500);
    assert!(scheduler.submit(|| {}).is_err());
    assert!(scheduler.get_next_task().is_none());
}

#[test]
fn runtime_spawn_and_named_channels() {
    let runtime = ConcurrencyRuntime::new(RuntimeConfig {
        num_workers: 2,
        idle_poll: Duration::from_millis(1),
        ..RuntimeConfig::default()
    })
    .unwrap();

    let results = runtime.channels().create("results");
    for i in 0..10 {
        let results = Arc::clone(&results);
        runtime
            .spawn(move || {
                results
                    .send(RegisterValue::Int(i))
                    .map_err(|_| "results closed".to_string())
            })
            .unwrap();
    }
    assert!(runtime.wait_for_active_blocks(Some(Duration::from_secs(5))));

    let mut sum = 0;
    while let Some(value) = results.try_receive() {
        sum += value.to_int();
    }
    assert_eq!(sum, 45);

    let blocking = runtime.spawn_blocking(|| 6 * 7).unwrap();
    assert_eq!(blocking.recv_timeout(Duration::from_secs(5)), Ok(42));

    let stats = runtime.stats();
    assert_eq!(stats.spawned, 10);
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.channels, 1);

    runtime.shutdown();
    assert!(results.is_closed());
}

#[test]
fn runtime_retry_strategy_records_final_failure() {
    let runtime = ConcurrencyRuntime::new(RuntimeConfig {
        num_workers: 1,
        idle_poll: Duration::from_millis(1),
        error_strategy: ErrorHandlingStrategy::Retry { max_attempts: 3 },
        ..RuntimeConfig::default()
    })
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    runtime
        .spawn(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Err("always".to_string())
        })
        .unwrap();
    assert!(runtime.wait_for_active_blocks(Some(Duration::from_secs(5))));

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failures = runtime.errors().errors();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert!(!runtime.is_shutdown_requested());
}

#[cfg(unix)]
#[test]
fn event_loop_dispatches_socket_readiness() {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use regvm::EventLoop;

    let (reader, mut writer) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();

    let event_loop = Arc::new(EventLoop::new().unwrap());
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_callback = Arc::clone(&fired);
    let stopper = Arc::clone(&event_loop);
    event_loop
        .register_event(reader.as_raw_fd(), move |_fd| {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
            stopper.stop();
        })
        .unwrap();

    let runner = Arc::clone(&event_loop);
    let handle = thread::spawn(move || runner.run());
    writer.write_all(b"ping").unwrap();

    handle.join().unwrap().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    event_loop.unregister_event(reader.as_raw_fd());
}
