//! MPI control-channel tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use std::rc::Rc;

use xferbench::group::MpiChannel;
use xferbench::{Comm, DeviceBuffer, HostRuntime, Library, ProcessGroup};

#[test]
fn mpi_group_runs_patterns_and_finalizes() {
    let channel = MpiChannel::init().expect("MPI init failed");
    let mut group = ProcessGroup::new(Box::new(channel), Rc::new(HostRuntime::new()));
    let rank = group.rank();
    let size = group.size();

    let gathered = group.all_gather(&(rank as u64)).unwrap();
    assert_eq!(gathered, (0..size as u64).collect::<Vec<_>>());

    {
        let data: Vec<f64> = (0..64).map(|i| (rank * 1000 + i) as f64).collect();
        let src = DeviceBuffer::from_slice(group.device(), &data).unwrap();
        let dst = DeviceBuffer::<f64>::new(group.device(), 64).unwrap();
        let mut comm = Comm::new(&group, Library::Mpi).unwrap();
        for owner in 0..size {
            comm.add(src.view(), 0, dst.view(), 0, 64, owner, owner).unwrap();
        }
        let m = comm.measure(1, 3).unwrap();
        assert_eq!(m.bytes, size * 64 * 8);
        assert_eq!(dst.to_vec().unwrap(), data);
    }

    group.finalize().unwrap();
    group.finalize().unwrap();
}
