// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand CLI - runs the runtime's end-to-end scenarios.

use std::env;
use std::os::unix::io::RawFd;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use strand_rt::thread::{current_name, current_tid};
use strand_rt::{Event, Fiber, IoManager, Scheduler, SchedulerConfig, Thread};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let verbose = take_flag(&mut args, &["-v", "--verbose"]);
    init_logging(verbose);

    let Some(command) = args.first() else {
        print_usage();
        return;
    };

    let result = match command.as_str() {
        "fibers" => cmd_fibers(),
        "threads" => cmd_threads(),
        "schedule" => cmd_schedule(),
        "pipe" => cmd_pipe(),
        "timer" => {
            let ms = match args.get(1).map(|s| s.parse::<u64>()) {
                None => 50,
                Some(Ok(ms)) => ms,
                Some(Err(_)) => {
                    eprintln!("Usage: strand timer [milliseconds]");
                    process::exit(1);
                }
            };
            cmd_timer(ms)
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("strand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(err) = result {
        error!(error = %err, "scenario failed");
        process::exit(1);
    }
}

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    let before = args.len();
    args.retain(|arg| !names.contains(&arg.as_str()));
    args.len() != before
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();
}

fn print_usage() {
    println!("Strand {} - stackful fibers on an N:M scheduler", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: strand [-v] <command> [args]");
    println!();
    println!("Commands:");
    println!("  fibers         Resume 20 fibers from the main thread");
    println!("  threads        Spawn named threads and report their tids");
    println!("  schedule       Run 20 callables on a single-thread scheduler");
    println!("  pipe           Wake a pipe READ callback from another thread");
    println!("  timer [ms]     Fire a one-shot timer (default 50 ms)");
    println!("  help           Show this help");
    println!("  version        Show version");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                      Log filter (default info, debug with -v)");
    println!("  STRAND_THREADS, STRAND_USE_CALLER, STRAND_STACK_SIZE, STRAND_NAME");
}

fn cmd_fibers() -> strand_rt::Result<()> {
    let fibers = (0..20)
        .map(|i| {
            Fiber::new(move || {
                info!(fiber = %Fiber::current().id(), index = i, "hello from fiber");
                Fiber::yield_current();
                info!(fiber = %Fiber::current().id(), index = i, "fiber resumed");
            })
        })
        .collect::<strand_rt::Result<Vec<_>>>()?;

    for fiber in &fibers {
        fiber.resume();
    }
    for fiber in &fibers {
        fiber.resume();
    }

    let done = fibers.iter().filter(|f| f.state() == strand_rt::FiberState::Term).count();
    info!(done, live = Fiber::total_fibers(), "all fibers resumed twice");
    Ok(())
}

fn cmd_threads() -> strand_rt::Result<()> {
    let mut threads = Vec::new();
    for i in 0..4 {
        threads.push(Thread::spawn(format!("thread_{}", i), move || {
            info!(tid = current_tid(), name = %current_name(), "thread running");
        })?);
    }
    for thread in &threads {
        info!(tid = thread.id(), name = thread.name(), "spawned");
    }
    for thread in threads {
        thread.join()?;
    }
    Ok(())
}

fn cmd_schedule() -> strand_rt::Result<()> {
    let config = SchedulerConfig::from_env();
    let scheduler = Scheduler::new(config)?;
    let ran = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let ran = ran.clone();
        scheduler.schedule(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            info!(task = i, tid = current_tid(), "task ran");
        });
    }
    scheduler.start()?;
    scheduler.stop();

    info!(ran = ran.load(Ordering::SeqCst), "scheduler drained");
    Ok(())
}

fn cmd_pipe() -> strand_rt::Result<()> {
    let io = IoManager::new(
        SchedulerConfig::from_env()
            .with_use_caller(false)
            .with_name("pipe"),
    )?;
    let (rd, wr) = pipe()?;
    let (tx, rx) = mpsc::channel();

    io.add_event(
        rd,
        Event::READ,
        Some(Box::new(move || {
            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            info!(fd = rd, bytes = n, "read callback fired");
            let _ = tx.send(n);
        })),
    )?;
    info!(fd = rd, pending = io.pending_events(), "registered READ");

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
    });

    let fired = rx.recv_timeout(Duration::from_secs(5));
    let _ = writer.join();
    info!(
        fired = fired.is_ok(),
        registered = ?io.registered_events(rd),
        pending = io.pending_events(),
        "pipe round trip"
    );

    io.stop();
    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
    Ok(())
}

fn cmd_timer(ms: u64) -> strand_rt::Result<()> {
    let io = IoManager::new(SchedulerConfig::from_env().with_name("timer"))?;
    let start = Instant::now();

    io.add_timer(
        ms,
        move || info!(elapsed_ms = start.elapsed().as_millis() as u64, "timer fired"),
        false,
    );

    // With `use_caller` this thread blocks in epoll here until the timer runs.
    io.stop();
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "timer scenario done");
    Ok(())
}

fn pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}
