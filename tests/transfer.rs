use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use hive_io::dispatcher::{DispatcherOptions, DispatcherType};
use hive_io::io::{
    self, fd_reader, fd_writer, shared_writer, ByteCount, SharedBuf, TransferMode,
};
use hive_io::manager::{self, new_manager, wait_all, Manager, ManagerOptions};
use hive_io::options::Options;
use hive_io::status::Code;
use hive_io::sys::fd::FdHandle;
use hive_io::sys::pipe;
use hive_io::task::Task;

fn background_manager() -> Manager {
    new_manager(&ManagerOptions {
        dispatcher: DispatcherOptions {
            kind: DispatcherType::Threaded,
            min_workers: Some(1),
            max_workers: Some(2),
        },
        ..Default::default()
    })
    .unwrap()
}

fn opts_with(m: &Manager) -> Options {
    let mut opts = Options::new();
    opts.get_mut::<io::Options>().manager = Some(m.clone());
    opts
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn source_file(content: &[u8]) -> File {
    let mut f = tempfile::tempfile().unwrap();
    f.write_all(content).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f
}

fn io_opts(m: &Manager, mode: TransferMode) -> io::Options {
    io::Options {
        manager: Some(m.clone()),
        pool: None,
        block_size: Some(4096),
        transfer_mode: mode,
    }
}

#[test]
fn fd_reader_reads_a_file() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(20_000);

    let r = fd_reader(
        FdHandle::from_file(source_file(&data)),
        io_opts(&m, TransferMode::SystemDefault),
    );
    let mut got = Vec::new();
    assert!(r.read_sync(&mut got, data.len(), data.len(), &opts).is_ok());
    assert_eq!(got, data);

    let mut rest = Vec::new();
    assert_eq!(r.read_sync(&mut rest, 1, 64, &opts).code(), Code::Eof);

    assert!(r.close_sync(&opts).is_ok());
    assert_eq!(r.close_sync(&opts).code(), Code::FailedPrecondition);
    m.shutdown().expect_ok();
}

#[test]
fn fd_writer_writes_a_file() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(10_000);

    let mut file = tempfile::tempfile().unwrap();
    let w = fd_writer(
        FdHandle::from_file(file.try_clone().unwrap()),
        io_opts(&m, TransferMode::SystemDefault),
    );

    let (status, n) = w.write_sync(&data, &opts);
    assert!(status.is_ok());
    assert_eq!(n, data.len());

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut got = Vec::new();
    file.read_to_end(&mut got).unwrap();
    assert_eq!(got, data);
    m.shutdown().expect_ok();
}

/// The fast paths and the portable loop must agree byte for byte.
#[test]
fn transfer_modes_agree() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(100_000);

    let mut outputs = Vec::new();
    for mode in [
        TransferMode::ReadWrite,
        TransferMode::Sendfile,
        TransferMode::Splice,
    ] {
        let r = fd_reader(FdHandle::from_file(source_file(&data)), io_opts(&m, mode));
        let mut dst = tempfile::tempfile().unwrap();
        let w = fd_writer(
            FdHandle::from_file(dst.try_clone().unwrap()),
            io_opts(&m, mode),
        );

        let (status, n) = r.write_to_sync(data.len(), &w, &opts);
        assert!(status.is_ok(), "mode {:?}: {}", mode, status);
        assert_eq!(n, data.len(), "mode {:?}", mode);

        dst.seek(SeekFrom::Start(0)).unwrap();
        let mut got = Vec::new();
        dst.read_to_end(&mut got).unwrap();
        outputs.push(got);
    }

    assert_eq!(outputs[0], data);
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);
    m.shutdown().expect_ok();
}

/// A writer with no descriptor forces the read-then-write loop even when
/// the reader asked for splice.
#[test]
fn write_to_memory_sink_downgrades() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(30_000);

    let r = fd_reader(
        FdHandle::from_file(source_file(&data)),
        io_opts(&m, TransferMode::Splice),
    );
    let sink = SharedBuf::new();
    let w = shared_writer(sink.clone());

    let (status, n) = r.write_to_sync(data.len(), &w, &opts);
    assert!(status.is_ok());
    assert_eq!(n, data.len());
    assert_eq!(sink.to_vec(), data);
    m.shutdown().expect_ok();
}

/// Nonblocking OS pipes exercise the EAGAIN suspend/resume path on both
/// the read and write sides.
#[test]
fn os_pipe_round_trip_with_rearming() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(256 * 1024);

    let (rfd, wfd) = pipe::make_pipe().unwrap();
    pipe::set_nonblocking(rfd).unwrap();
    pipe::set_nonblocking(wfd).unwrap();

    let r = fd_reader(
        FdHandle::wrap(rfd),
        io_opts(&m, TransferMode::SystemDefault),
    );
    let w = fd_writer(
        FdHandle::wrap(wfd),
        io_opts(&m, TransferMode::SystemDefault),
    );

    let wr = Task::new();
    let wn = ByteCount::new();
    w.write(&wr, &wn, &data, &opts);

    let rd = Task::new();
    let out = SharedBuf::new();
    r.read(&rd, &out, data.len(), data.len(), &opts);

    wait_all(&[m.clone()], &[Arc::clone(&wr), Arc::clone(&rd)]);
    assert!(wr.result().is_ok());
    assert_eq!(wn.get(), data.len());
    assert!(rd.result().is_ok());
    assert_eq!(out.to_vec(), data);

    m.shutdown().expect_ok();
}

/// Splicing out of a file into an OS pipe takes the true zero-copy path.
#[test]
fn splice_into_a_pipe() {
    let m = background_manager();
    let opts = opts_with(&m);
    // Half the default pipe capacity, so the transfer never has to park
    // on pipe-full (a regular-file source cannot be polled).
    let data = payload(32 * 1024);

    let (rfd, wfd) = pipe::make_pipe().unwrap();
    pipe::set_nonblocking(rfd).unwrap();
    pipe::set_nonblocking(wfd).unwrap();

    let src = fd_reader(
        FdHandle::from_file(source_file(&data)),
        io_opts(&m, TransferMode::Splice),
    );
    let pipe_w = fd_writer(FdHandle::wrap(wfd), io_opts(&m, TransferMode::Splice));
    let pipe_r = fd_reader(FdHandle::wrap(rfd), io_opts(&m, TransferMode::SystemDefault));

    let xfer = Task::new();
    let xn = ByteCount::new();
    src.write_to(&xfer, &xn, data.len(), &pipe_w, &opts);

    let rd = Task::new();
    let out = SharedBuf::new();
    pipe_r.read(&rd, &out, data.len(), data.len(), &opts);

    wait_all(&[m.clone()], &[Arc::clone(&xfer), Arc::clone(&rd)]);
    assert!(xfer.result().is_ok());
    assert_eq!(xn.get(), data.len());
    assert_eq!(out.to_vec(), data);

    m.shutdown().expect_ok();
}

#[test]
fn copy_n_from_file_to_memory() {
    let m = background_manager();
    let opts = opts_with(&m);
    let data = payload(50_000);

    let r = fd_reader(
        FdHandle::from_file(source_file(&data)),
        io_opts(&m, TransferMode::ReadWrite),
    );
    let sink = SharedBuf::new();
    let w = shared_writer(sink.clone());

    let task = Task::new();
    let copied = ByteCount::new();
    io::copy_n(&task, &copied, data.len(), &w, &r, &opts);
    manager::wait(&m, &task);

    assert!(task.result().is_ok());
    assert_eq!(copied.get(), data.len());
    assert_eq!(sink.to_vec(), data);
    m.shutdown().expect_ok();
}
