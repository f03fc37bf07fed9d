//! Point-to-point communication benchmarks across ranks.
//!
//! A [`Comm`] pattern is a set of directed transfers between ranks of a
//! [`ProcessGroup`], registered once against a transport [`Library`] and then
//! executed repeatedly with [`Comm::start`] / [`Comm::wait`] or timed with
//! [`Comm::measure`].
//!
//! ```no_run
//! use xferbench::{Comm, DeviceBuffer, Library, LocalWorld};
//!
//! LocalWorld::run(2, |group| {
//!     let src = DeviceBuffer::from_slice(group.device(), &[1.0f32; 1024]).unwrap();
//!     let dst = DeviceBuffer::<f32>::new(group.device(), 1024).unwrap();
//!     let mut comm = Comm::new(&group, Library::Mpi).unwrap();
//!     comm.add(src.view(), 0, dst.view(), 0, 1024, 0, 1).unwrap();
//!     comm.measure(5, 20).unwrap()
//! })
//! .unwrap();
//! ```

pub mod device;
pub mod error;
pub mod group;
pub mod measure;
pub mod pattern;
pub mod registry;
pub mod report;
pub mod transport;

pub use device::{BufferRef, DeviceBuffer, DevicePtr, DeviceRuntime, HostRuntime};
pub use error::{BenchError, Result};
pub use group::{ControlChannel, LocalWorld, ProcessGroup, Rank};
pub use measure::{measure_async, measure_concur, Measurement, Summary};
pub use pattern::{Comm, CommMatrix, CommOptions, Footprint};
pub use transport::Library;
