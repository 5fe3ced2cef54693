//! Injecting synchronous work into the event-loop thread.
//!
//! Intercepted libc calls must block their caller until the operation is
//! done, but all RPC work runs on a single dedicated thread driving an async
//! runtime. The bridge between the two is a kernel pipe: a caller packages
//! its closure into a stack-allocated job descriptor, writes the
//! descriptor's address down the pipe as one pointer-sized word, and blocks
//! on the job's latch. The loop thread reads one word at a time, runs the
//! job's future to completion, publishes the result, and releases the latch.

use std::convert::Infallible;
use std::ffi::c_void;
use std::os::fd::OwnedFd;
use std::panic::AssertUnwindSafe;
use std::sync::{Condvar, Mutex};
use std::thread;

use anyhow::Context;
use futures::future::LocalBoxFuture;
use nix::errno::Errno;
use rustix::fs::OFlags;
use rustix::pipe::PipeFlags;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::connection::LoopState;

/// What a job hands back to its injecting caller. Anything richer than an
/// errno travels through the closure's own captures.
pub type JobResult = Result<(), Errno>;

type JobFn<'a> = Box<dyn FnOnce(LoopState) -> LocalBoxFuture<'a, JobResult> + Send + 'a>;

/// One injected unit of work. Lives on the injecting caller's stack; the
/// loop thread sees it only through the pointer word read from the pipe.
/// The caller is blocked on `done` for as long as the loop side can touch
/// it, which is what makes that pointer valid.
struct Job<'a> {
    /// Consumed (exactly once) by the loop thread to build the job's future.
    make_future: Mutex<Option<JobFn<'a>>>,
    done: JobLatch,
}

/// A one-shot latch carrying the job's result. Acquired held; the loop
/// thread releases it by publishing the result.
struct JobLatch {
    result: Mutex<Option<JobResult>>,
    cond: Condvar,
}

impl JobLatch {
    fn new() -> JobLatch {
        JobLatch {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn release(&self, result: JobResult) {
        *self.result.lock().unwrap() = Some(result);
        self.cond.notify_one();
    }

    fn wait(&self) -> JobResult {
        let mut guard = self.result.lock().unwrap();
        loop {
            match guard.take() {
                Some(result) => return result,
                None => guard = self.cond.wait(guard).unwrap(),
            }
        }
    }
}

/// Handle for injecting jobs into the event loop running on its dedicated
/// thread. The thread is spawned from within `new` and lives for the rest of
/// the process.
pub struct EventInjector {
    /// Write end of the injection pipe; exclusive per injected word.
    inject_fd: Mutex<OwnedFd>,
}

impl EventInjector {
    pub fn new() -> EventInjector {
        let (handle_fd, inject_fd) =
            rustix::pipe::pipe_with(PipeFlags::CLOEXEC).expect("creating the injection pipe");
        // The loop thread reads through the runtime's readiness machinery,
        // which wants a nonblocking fd.
        rustix::fs::fcntl_setfl(&handle_fd, OFlags::NONBLOCK)
            .expect("configuring the injection pipe");

        thread::Builder::new()
            .name("sandstorm-vfs-loop".into())
            .spawn(move || {
                let rv = std::panic::catch_unwind(AssertUnwindSafe(|| event_loop_main(handle_fd)));
                match rv {
                    Ok(Err(e)) => log::error!("event-loop thread failed: {e:#}"),
                    Err(_) => log::error!("event-loop thread panicked"),
                    Ok(Ok(never)) => match never {},
                }
                // Callers may already be blocked on their latches; nothing
                // can make progress once the loop is gone.
                std::process::abort();
            })
            .expect("spawning the event-loop thread");

        EventInjector {
            inject_fd: Mutex::new(inject_fd),
        }
    }

    /// Run `f`'s future on the loop thread and block until it completes.
    ///
    /// `f` receives the loop's connection state (by clone; the capabilities
    /// inside are loop-bound) and may capture references to the caller's
    /// stack: the caller does not return until the future has finished
    /// running, so such captures outlive every loop-side use.
    pub fn run_in_loop<'a, F>(&self, f: F) -> JobResult
    where
        F: FnOnce(LoopState) -> LocalBoxFuture<'a, JobResult> + Send + 'a,
    {
        let job = Job {
            make_future: Mutex::new(Some(Box::new(f) as JobFn<'a>)),
            done: JobLatch::new(),
        };
        let word = (&job as *const Job<'a> as usize).to_ne_bytes();
        {
            let inject_fd = self.inject_fd.lock().unwrap();
            let written = loop {
                match rustix::io::write(&*inject_fd, &word) {
                    Ok(n) => break n,
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(e) => panic!("writing to the injection pipe: {e}"),
                }
            };
            // Pointer-sized writes to a pipe are atomic; anything else is a
            // corrupt channel.
            assert_eq!(written, word.len(), "short write on the injection pipe");
        }
        job.done.wait()
    }
}

fn event_loop_main(handle_fd: OwnedFd) -> anyhow::Result<Infallible> {
    crate::loop_bound::register_loop_thread();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("building the event-loop runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let state = LoopState::connect().await?;
        let handle_fd = AsyncFd::with_interest(handle_fd, Interest::READABLE)
            .context("registering the injection pipe")?;
        log::debug!("event loop connected; accepting jobs");

        loop {
            let word = next_job_word(&handle_fd).await?;
            // SAFETY: the injecting caller keeps the job alive until its
            // latch is released below, and the job's future has fully run
            // by then. `Job` is interiorly mutable, so the caller's and our
            // shared references don't conflict.
            let job = unsafe { &*(word as *const c_void as *const Job<'static>) };
            let make_future = job
                .make_future
                .lock()
                .unwrap()
                .take()
                .expect("job descriptor injected twice");
            let result = make_future(state.clone()).await;
            job.done.release(result);
        }
    })
}

/// Reads the next job-descriptor address off the injection pipe.
async fn next_job_word(handle_fd: &AsyncFd<OwnedFd>) -> anyhow::Result<usize> {
    let mut word = [0u8; std::mem::size_of::<usize>()];
    loop {
        let mut guard = handle_fd.readable().await?;
        match guard.try_io(|fd| loop {
            match rustix::io::read(fd.get_ref(), &mut word) {
                Ok(n) => break Ok(n),
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => break Err(e.into()),
            }
        }) {
            Ok(Ok(n)) => {
                // Writers hold the pipe lock and write whole words, so a
                // short read means the channel is corrupt.
                anyhow::ensure!(n == word.len(), "short read on the injection pipe ({n} bytes)");
                return Ok(usize::from_ne_bytes(word));
            }
            Ok(Err(e)) => return Err(e).context("reading the injection pipe"),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_round_trip() {
        let latch = std::sync::Arc::new(JobLatch::new());

        let releaser = {
            let latch = latch.clone();
            thread::spawn(move || latch.release(Err(Errno::EIO)))
        };
        assert_eq!(latch.wait(), Err(Errno::EIO));
        releaser.join().unwrap();

        latch.release(Ok(()));
        assert_eq!(latch.wait(), Ok(()));
    }
}
