//! Argument boundaries, the socket state machine, contention, and close
//! semantics.

mod common;

use std::rc::Rc;

use bytes::Bytes;

use common::{establish_pair, sim_rig, Fiber};
use strandio::buffer::ReadBuffer;
use strandio::errno;
use strandio::error::SocketError;
use strandio::host::{CoroutineRef, HostValue, Resume};
use strandio::ops::{self, Op};
use strandio::socket::{Role, SocketState};

fn fresh_socket(rig: &common::SimRig) -> (strandio::socket::SocketRef, Rc<Fiber>, CoroutineRef) {
    let fiber = Fiber::new("main");
    let co: CoroutineRef = fiber.clone();
    let sock = ops::new_socket(&rig.rt, &co, false).unwrap();
    (sock, fiber, co)
}

#[test]
fn port_and_host_boundaries() {
    let rig = sim_rig();
    let (sock, _fiber, co) = fresh_socket(&rig);

    assert_eq!(
        ops::bind(&sock, -1, "127.0.0.1", false).unwrap_err(),
        SocketError::PortOutOfRange(-1)
    );
    assert_eq!(
        ops::bind(&sock, 65536, "127.0.0.1", false).unwrap_err(),
        SocketError::PortOutOfRange(65536)
    );
    assert!(matches!(
        ops::connect(&sock, &co, 80, "example.com").unwrap_err(),
        SocketError::HostNotIp(_)
    ));
    assert_eq!(sock.borrow().state(), SocketState::Uninit);
}

#[test]
fn negative_timeout_rejected() {
    let rig = sim_rig();
    let (sock, _fiber, _co) = fresh_socket(&rig);
    assert_eq!(
        ops::set_timeout(&sock, -1).unwrap_err(),
        SocketError::NegativeTimeout(-1)
    );
    ops::set_timeout(&sock, 0).unwrap();
    assert_eq!(sock.borrow().timeout_ms(), 0);
}

#[test]
fn read_requires_a_live_buffer() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);

    assert_eq!(
        ops::read(&pair.client, &pair.client_co).unwrap_err(),
        SocketError::NoReadBuffer
    );

    // A dropped buffer counts as unbound; the socket only holds a weak
    // link.
    {
        let buf = ReadBuffer::shared(4096);
        ops::set_read_buffer(&pair.client, &buf).unwrap();
    }
    assert_eq!(
        ops::read(&pair.client, &pair.client_co).unwrap_err(),
        SocketError::NoReadBuffer
    );
}

#[test]
fn keepalive_argument_contract() {
    let rig = sim_rig();
    let (sock, _fiber, _co) = fresh_socket(&rig);

    assert_eq!(
        ops::set_keepalive(&sock, true, None).unwrap_err(),
        SocketError::KeepaliveDelay
    );
    assert_eq!(
        ops::set_keepalive(&sock, true, Some(-5)).unwrap_err(),
        SocketError::KeepaliveDelay
    );
    assert_eq!(ops::set_keepalive(&sock, true, Some(30)).unwrap(), 0);
    assert_eq!(
        rig.sim.keepalive_setting(sock.borrow().stream_id()),
        Some((true, 30))
    );
    // Disabling needs no delay.
    assert_eq!(ops::set_keepalive(&sock, false, None).unwrap(), 0);
    assert_eq!(
        rig.sim.keepalive_setting(sock.borrow().stream_id()),
        Some((false, 0))
    );
}

#[test]
fn nodelay_reaches_the_reactor() {
    let rig = sim_rig();
    let (sock, _fiber, _co) = fresh_socket(&rig);
    assert_eq!(ops::set_nodelay(&sock, true).unwrap(), 0);
    assert_eq!(rig.sim.nodelay_flag(sock.borrow().stream_id()), Some(true));
}

#[test]
fn ip_classifier_shapes() {
    assert_eq!(ops::is_ip("1.2.3.4"), 4);
    assert_eq!(ops::is_ip("::1"), 6);
    assert_eq!(ops::is_ip("example.com"), 0);
}

#[test]
fn reuseport_bindings() {
    let rig = sim_rig();
    let (a, _fa, _ca) = fresh_socket(&rig);
    let (b, _fb, _cb) = fresh_socket(&rig);
    let (c, _fc, _cc) = fresh_socket(&rig);

    assert_eq!(ops::bind(&a, 9000, "0.0.0.0", true).unwrap(), 0);
    assert_eq!(ops::bind(&b, 9000, "0.0.0.0", true).unwrap(), 0);
    assert_eq!(
        ops::bind(&c, 9000, "0.0.0.0", false).unwrap(),
        errno::EADDRINUSE
    );
    assert_eq!(a.borrow().state(), SocketState::Bound);
    assert_eq!(c.borrow().state(), SocketState::Uninit);
}

#[test]
fn state_machine_transitions() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);

    assert_eq!(pair.listener.borrow().state(), SocketState::Listening);
    assert_eq!(pair.listener.borrow().role(), Role::ServerListening);
    assert_eq!(pair.client.borrow().state(), SocketState::Established);
    assert_eq!(pair.client.borrow().role(), Role::Client);

    let accepted = pair.server_sock.borrow().clone().unwrap();
    assert_eq!(accepted.borrow().state(), SocketState::Established);
    assert_eq!(accepted.borrow().role(), Role::ServerAccepted);

    let (record, code) = ops::remote_address(&pair.client).unwrap();
    assert_eq!(code, 0);
    let record = record.unwrap();
    assert_eq!(record.family, 4);
    assert!(ops::fd(&pair.client).unwrap() >= 0);
}

#[test]
fn refused_connect_restores_state() {
    let rig = sim_rig();
    let (sock, fiber, co) = fresh_socket(&rig);

    // No listener on that port.
    assert!(matches!(
        ops::connect(&sock, &co, 1, "127.0.0.1").unwrap(),
        Op::Yield
    ));
    assert_eq!(sock.borrow().state(), SocketState::Connecting);
    rig.sim.run();
    assert_eq!(
        fiber.last_resume(),
        Some(Resume::Int(i64::from(errno::ECONNREFUSED)))
    );
    assert_eq!(sock.borrow().state(), SocketState::Uninit);
    rig.assert_quiescent();
}

#[test]
fn shutdown_requires_established() {
    let rig = sim_rig();
    let (sock, _fiber, co) = fresh_socket(&rig);
    let outcome = ops::shutdown(&sock, &co).unwrap();
    match outcome {
        Op::Complete(Resume::Int(code)) => assert_eq!(code, i64::from(errno::ENOTCONN)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn one_operation_per_socket() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();
    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));

    // A second coroutine contending the same socket is turned away.
    let other = Fiber::new("contender");
    let other_co: CoroutineRef = other.clone();
    let busy = i64::from(errno::EBUSY);
    assert!(matches!(
        ops::read(&pair.client, &other_co).unwrap(),
        Op::Complete(Resume::Int(code)) if code == busy
    ));
    assert!(matches!(
        ops::connect(&pair.client, &other_co, 9000, "127.0.0.1").unwrap(),
        Op::Complete(Resume::Int(code)) if code == busy
    ));
    assert!(matches!(
        ops::write(&pair.client, &other_co, &HostValue::Bytes(Bytes::from_static(b"x"))).unwrap(),
        Op::Complete(Resume::Pair(0, code)) if code == busy
    ));
    assert!(matches!(
        ops::shutdown(&pair.client, &other_co).unwrap(),
        Op::Complete(Resume::Int(code)) if code == busy
    ));
    assert_eq!(other.resume_count(), 0);

    // The parked read still concludes normally.
    let stream = pair.client.borrow().stream_id();
    rig.sim.push_incoming(stream, b"ok");
    assert_eq!(pair.client_fiber.last_resume(), Some(Resume::Int(2)));
    rig.assert_quiescent();
}

#[test]
fn close_cancels_a_parked_read() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();
    ops::set_timeout(&pair.client, 1000).unwrap();
    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    assert_eq!(rig.rt.timers().outstanding(), 1);

    let closer = Fiber::new("closer");
    let closer_co: CoroutineRef = closer.clone();
    assert!(matches!(ops::close(&pair.client, &closer_co).unwrap(), Op::Yield));

    // The reader was concluded at once, with its deadline released.
    assert_eq!(
        pair.client_fiber.last_resume(),
        Some(Resume::Int(i64::from(errno::ECANCELED)))
    );
    assert_eq!(rig.rt.timers().outstanding(), 0);

    rig.sim.run();
    assert_eq!(closer.last_resume(), Some(Resume::Nil));
    assert_eq!(pair.client.borrow().state(), SocketState::Closed);
    rig.assert_quiescent();
}

#[test]
fn double_close_is_a_contract_violation() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);

    let closer = Fiber::new("closer");
    let closer_co: CoroutineRef = closer.clone();
    assert!(matches!(ops::close(&pair.client, &closer_co).unwrap(), Op::Yield));
    assert_eq!(
        ops::close(&pair.client, &closer_co).unwrap_err(),
        SocketError::AlreadyClosing
    );
    // Any new operation is rejected while the close is in flight.
    assert_eq!(
        ops::read(&pair.client, &closer_co).unwrap_err(),
        SocketError::AlreadyClosing
    );

    rig.sim.run();
    assert_eq!(closer.resume_count(), 1);
    assert_eq!(
        ops::close(&pair.client, &closer_co).unwrap_err(),
        SocketError::Closed
    );
    assert_eq!(
        ops::fd(&pair.client).unwrap_err(),
        SocketError::Closed
    );
}

#[test]
fn listen_rejects_non_callable_handlers() {
    let rig = sim_rig();
    let (sock, _fiber, _co) = fresh_socket(&rig);
    assert_eq!(ops::bind(&sock, 0, "127.0.0.1", false).unwrap(), 0);
    assert_eq!(
        ops::listen(&sock, HostValue::Bytes(Bytes::from_static(b"nope")), 16).unwrap_err(),
        SocketError::NotCallable
    );
    assert_eq!(
        ops::listen(
            &sock,
            HostValue::Callable(Rc::new(|_, _| ())),
            i64::from(i32::MAX) + 1
        )
        .unwrap(),
        errno::EINVAL
    );
}

#[test]
fn accept_failure_is_contained() {
    let rig = sim_rig();

    let owner = Fiber::new("listener-owner");
    let owner_co: CoroutineRef = owner.clone();
    let listener = ops::new_socket(&rig.rt, &owner_co, true).unwrap();
    assert_eq!(ops::bind(&listener, 0, "127.0.0.1", false).unwrap(), 0);
    let on_connect: strandio::host::HostFn = Rc::new(|_co, _resume| {
        panic!("accept handler must not run when the accept fails");
    });
    assert_eq!(
        ops::listen(&listener, HostValue::Callable(on_connect), 16).unwrap(),
        0
    );
    let (addr, _) = ops::local_address(&listener).unwrap();
    let port = i64::from(addr.unwrap().port);
    let anchors_before = rig.registry_live();

    rig.sim.fail_next_accept(errno::ECONNRESET);

    let client_fiber = Fiber::new("client");
    let client_co: CoroutineRef = client_fiber.clone();
    let client = ops::new_socket(&rig.rt, &client_co, false).unwrap();
    assert!(matches!(
        ops::connect(&client, &client_co, port, "127.0.0.1").unwrap(),
        Op::Yield
    ));
    rig.sim.run();

    // The listener kept running and nothing leaked: the spawned coroutine
    // was never resumed and its anchor was dropped.
    assert_eq!(rig.sched.spawned_count(), 1);
    assert_eq!(rig.sched.spawned.borrow()[0].resume_count(), 0);
    assert_eq!(rig.registry_live(), anchors_before);
    assert_eq!(client_fiber.last_resume(), Some(Resume::Int(0)));
    rig.assert_quiescent();
}

#[test]
fn half_close_drains_before_eof() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();

    // Peer data and half-close arrive before the script ever reads.
    rig.sim.push_incoming(stream, b"tail");
    rig.sim.deliver_eof(stream);

    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    rig.sim.run();
    assert_eq!(pair.client_fiber.last_resume(), Some(Resume::Int(4)));
    assert_eq!(buf.borrow().readable(), b"tail");

    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    rig.sim.run();
    assert_eq!(
        pair.client_fiber.last_resume(),
        Some(Resume::Int(i64::from(errno::EOF)))
    );
    rig.assert_quiescent();
}
