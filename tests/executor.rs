mod common;

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdStream;

use tokio_util::sync::CancellationToken;

use common::recv_with_fds;
use gatehouse::config::ExecutorConfig;
use gatehouse::executor::channel::{Op, Request, REQUEST_SIZE};
use gatehouse::Executor;

#[tokio::test]
async fn test_create_carries_process_cgroup() {
    let cgroup = tempfile::tempdir().unwrap();
    let mut config = ExecutorConfig {
        max_procs: 2,
        ..Default::default()
    };
    config.container.cgroup.process = Some(cgroup.path().to_path_buf());

    let (host, peer) = StdStream::pair().unwrap();
    host.set_nonblocking(true).unwrap();
    let host = tokio::net::UnixStream::from_std(host).unwrap();
    let executor = Executor::with_stream(host, &config).unwrap();

    let received = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; REQUEST_SIZE];
        let (n, fds) = recv_with_fds(peer.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, REQUEST_SIZE);
        (Request::decode(&buf).unwrap(), fds, peer)
    });

    let process = executor
        .new_process(&CancellationToken::new())
        .await
        .unwrap();
    let (request, fds, _peer) = received.await.unwrap();

    assert_eq!(request, Request::new(process.id(), Op::Create));
    assert_eq!(fds.len(), 3);
    let cgroup_dir = std::fs::read_link(format!("/proc/self/fd/{}", fds[2].as_raw_fd())).unwrap();
    assert_eq!(cgroup_dir, cgroup.path().canonicalize().unwrap());
}

#[tokio::test]
async fn test_create_without_cgroup_has_two_descriptors() {
    let (host, peer) = StdStream::pair().unwrap();
    host.set_nonblocking(true).unwrap();
    let host = tokio::net::UnixStream::from_std(host).unwrap();
    let config = ExecutorConfig {
        max_procs: 2,
        ..Default::default()
    };
    let executor = Executor::with_stream(host, &config).unwrap();

    let received = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; REQUEST_SIZE];
        let (_, fds) = recv_with_fds(peer.as_raw_fd(), &mut buf).unwrap();
        (fds, peer)
    });

    let _process = executor
        .new_process(&CancellationToken::new())
        .await
        .unwrap();
    let (fds, _peer) = received.await.unwrap();
    assert_eq!(fds.len(), 2);
}
