//! Diagnostics are emitted by the pattern's print rank.
//!
//! Installs a process-wide subscriber, so this file holds a single test.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use xferbench::{Comm, CommOptions, Library, LocalWorld};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn warmup_is_logged_by_the_print_rank() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    LocalWorld::run(2, |group| {
        let options = CommOptions {
            print_rank: 1,
            ..CommOptions::default()
        };
        let mut comm = Comm::<f32>::with_options(&group, Library::Mpi, options).unwrap();
        comm.add_lazy(16, 0, 1).unwrap();
        comm.measure(3, 2).unwrap();
    })
    .unwrap();

    let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    let warmups: Vec<&str> = text.lines().filter(|l| l.contains("startup_us")).collect();
    assert_eq!(warmups.len(), 3, "{text}");
    assert!(warmups.iter().all(|l| l.contains("rank-1")), "{text}");
}
