//! Per-test log capture.
//!
//! Tests run in parallel, so log output written straight to the console is an unreadable mix of
//! every test in flight.  Instead each test gets its own `tracing` dispatcher writing into a
//! buffer, which is printed in one piece when the test finishes, panics included.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The HTTP stack is noisy at debug level and rarely the
/// thing under test.
const DEFAULT_FILTER: &str = "hyper=info,reqwest=info,rustls=info,h2=warn,s3lite=debug,debug";

/// How long to wait for tasks still running on the test runtime after the test future completes
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared buffer that every thread of a test's runtime writes its log events to
#[derive(Clone, Default)]
struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Take everything logged so far.  Panics if non-UTF8 text was written.
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.bytes.lock().unwrap());

        String::from_utf8(bytes).unwrap()
    }
}

impl<'a> Write for &'a LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Run an async test with its own tokio runtime and its own log capture.
///
/// Use this in place of `#[tokio::test]`.  Every worker thread of the runtime is made to use the
/// test's dispatcher as its default, so events logged from spawned tasks are captured too, and
/// only this test's events end up in its output.
///
/// The captured log is printed to stdout after the test completes, where the test harness shows
/// it only for failing tests (unless run with `--nocapture`).
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let buffer = LogBuffer::default();
    let dispatch = Arc::new(make_dispatch(buffer.clone()));

    let outcome = tracing::dispatcher::with_default(&dispatch, || {
        let runtime = make_runtime(dispatch.clone())?;

        // Test futures aren't required to be unwind safe; the runtime is discarded after a panic
        // anyway
        Ok::<_, color_eyre::Report>(std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

            result
        })))
    })?;

    println!("Log events from this test: \n{}", buffer.drain());

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn make_dispatch(buffer: LogBuffer) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        // filters operate on targets, so they're worth seeing
        .with_target(true)
        // several tests run at once
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(buffer);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// A multi-threaded runtime whose threads all log to `dispatch`
fn make_runtime(dispatch: Arc<tracing::Dispatch>) -> Result<tokio::runtime::Runtime> {
    std::thread_local! {
        static DISPATCH_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            DISPATCH_GUARD.with(|cell| cell.replace(Some(guard)));
        })
        .on_thread_stop(|| {
            DISPATCH_GUARD.with(|cell| cell.replace(None));
        })
        .build()?;

    Ok(runtime)
}
