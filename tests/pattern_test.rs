//! Pattern registration, matrices and reports on an in-process world.

use xferbench::{BenchError, BufferRef, Comm, CommOptions, DeviceBuffer, Library, LocalWorld};

#[test]
fn pair_transfer_delivers_and_measures() {
    let results = LocalWorld::run(2, |group| {
        let data: Vec<f32> = (0..1024).map(|i| i as f32 * 0.5).collect();
        let src = DeviceBuffer::from_slice(group.device(), &data).unwrap();
        let dst = DeviceBuffer::<f32>::new(group.device(), 1024).unwrap();
        let (send, recv) = match group.rank() {
            0 => (src.view(), BufferRef::absent()),
            _ => (BufferRef::absent(), dst.view()),
        };

        let mut comm = Comm::new(&group, Library::Mpi).unwrap();
        comm.add(send, 0, recv, 0, 1024, 0, 1).unwrap();
        comm.start().unwrap();
        comm.wait().unwrap();
        let received = dst.to_vec().unwrap();

        let m = comm.measure(2, 5).unwrap();
        (received, m.bytes, m.iterations(), data)
    })
    .unwrap();

    let (received, bytes, iterations, data) = &results[1];
    assert_eq!(received, data);
    assert_eq!(*bytes, 4096);
    assert_eq!(*iterations, 5);
    assert_eq!(results[0].1, 4096);
}

#[test]
fn zero_count_edge_is_skipped() {
    let results = LocalWorld::run(2, |group| {
        let mut comm = Comm::<f32>::new(&group, Library::IpcPut).unwrap();
        comm.add(BufferRef::absent(), 0, BufferRef::absent(), 0, 0, 0, 1)
            .unwrap();
        (
            comm.send_count(),
            comm.recv_count(),
            comm.edge_counter(),
            comm.handle_exchanges(),
            comm.matrix().unwrap().pairs(),
        )
    })
    .unwrap();
    assert_eq!(results, vec![(0, 0, 0, 0, 0); 2]);
}

#[test]
fn edges_are_indexed_in_registration_order() {
    let results = LocalWorld::run(3, |group| {
        let mut comm = Comm::<u32>::new(&group, Library::Mpi).unwrap();
        comm.add_lazy(4, 0, 2).unwrap();
        comm.add_lazy(0, 0, 1).unwrap();
        comm.add_lazy(8, 0, 1).unwrap();
        comm.add_lazy(2, 1, 2).unwrap();
        let sends: Vec<_> = comm.sends().iter().map(|e| (e.peer, e.count)).collect();
        let recvs: Vec<_> = comm.recvs().iter().map(|e| (e.peer, e.count)).collect();
        (sends, recvs, comm.edge_counter())
    })
    .unwrap();

    assert_eq!(results[0], (vec![(2, 4), (1, 8)], vec![], 3));
    assert_eq!(results[1], (vec![(2, 2)], vec![(0, 8)], 3));
    assert_eq!(results[2], (vec![], vec![(0, 4), (1, 2)], 3));
}

#[test]
fn matrix_footprint_and_ledger_agree_with_edges() {
    let results = LocalWorld::run(3, |group| {
        let mut comm = Comm::<f64>::new(&group, Library::Null).unwrap();
        comm.add_lazy(10, 0, 1).unwrap();
        comm.add_lazy(5, 0, 1).unwrap();
        comm.add_lazy(7, 2, 0).unwrap();
        (
            comm.matrix().unwrap(),
            comm.footprint().unwrap(),
            comm.ledger().unwrap(),
        )
    })
    .unwrap();

    for (matrix, footprint, ledger) in results {
        assert_eq!(matrix.size(), 3);
        assert_eq!(matrix.get(0, 1), 15);
        assert_eq!(matrix.get(2, 0), 7);
        assert_eq!(matrix.get(1, 0), 0);
        assert_eq!(matrix.pairs(), 2);
        assert_eq!(footprint.send, 22);
        assert_eq!(footprint.recv, 22);
        let entries: Vec<_> = ledger.iter().map(|e| (e.pieces, e.count)).collect();
        assert_eq!(entries, vec![(3, 22), (2, 15), (1, 7)]);
    }
}

#[test]
fn report_is_written_by_the_print_rank_only() {
    let results = LocalWorld::run(2, |group| {
        let mut comm = Comm::<f32>::new(&group, Library::Mpi).unwrap();
        comm.add_lazy(1000, 0, 1).unwrap();
        let mut out = Vec::new();
        comm.report(&mut out).unwrap();
        (comm.bench_id(), String::from_utf8(out).unwrap())
    })
    .unwrap();

    let (id, text) = &results[0];
    assert!(text.contains(&format!(
        "Bench {id}: MPI communication matrix (receiver x sender): 1"
    )));
    let lines: Vec<&str> = text.lines().collect();
    let header = lines
        .iter()
        .position(|l| l.starts_with("Bench"))
        .unwrap();
    assert_eq!(lines[header + 1], ". .");
    assert_eq!(lines[header + 2], "1 .");
    assert!(text.contains("proc 0: 1 pieces count 1000 4.0000 KB"));
    assert!(text.contains("send footprint: 1000 4.0000 KB"));
    assert!(results[1].1.is_empty());
}

#[test]
fn report_can_come_from_another_rank() {
    let results = LocalWorld::run(2, |group| {
        let options = CommOptions {
            print_rank: 1,
            ..CommOptions::default()
        };
        let mut comm = Comm::<u8>::with_options(&group, Library::Null, options).unwrap();
        comm.add_lazy(3, 1, 0).unwrap();
        let mut out = Vec::new();
        comm.report(&mut out).unwrap();
        out.is_empty()
    })
    .unwrap();
    assert_eq!(results, vec![true, false]);
}

#[test]
fn edge_outside_the_group_is_rejected() {
    LocalWorld::run(2, |group| {
        let mut comm = Comm::<u8>::new(&group, Library::Mpi).unwrap();
        assert!(matches!(comm.add_lazy(4, 0, 2), Err(BenchError::Usage(_))));
        assert_eq!(comm.edge_counter(), 0);
    })
    .unwrap();
}

#[test]
fn owner_without_buffer_is_rejected_on_every_rank() {
    let results = LocalWorld::run(2, |group| {
        let dst = DeviceBuffer::<u8>::new(group.device(), 8).unwrap();
        let mut comm = Comm::<u8>::new(&group, Library::Mpi).unwrap();
        comm.add(BufferRef::absent(), 0, dst.view(), 0, 8, 0, 1)
            .is_err()
    })
    .unwrap();
    assert_eq!(results, vec![true, true]);
}
