//! Deadline behavior: for every armed timer exactly one of the timeout and
//! completion paths resumes the coroutine, and whichever runs second only
//! releases resources.

mod common;

use std::net::IpAddr;
use std::rc::Rc;

use bytes::Bytes;

use common::{establish_pair, sim_rig, Fiber};
use strandio::buffer::ReadBuffer;
use strandio::errno;
use strandio::host::{CoroutineRef, HostValue, Resume};
use strandio::ops::{self, Op};
use strandio::reactor::sim::ConnectPolicy;

#[test]
fn connect_timeout_then_late_completion() {
    let rig = sim_rig();
    let blackhole: IpAddr = "10.255.255.1".parse().unwrap();
    rig.sim.set_connect_policy(blackhole, ConnectPolicy::Blackhole);

    let fiber = Fiber::new("connector");
    let co: CoroutineRef = fiber.clone();
    let sock = ops::new_socket(&rig.rt, &co, false).unwrap();
    ops::set_timeout(&sock, 50).unwrap();
    assert!(matches!(
        ops::connect(&sock, &co, 1, "10.255.255.1").unwrap(),
        Op::Yield
    ));
    let stream = sock.borrow().stream_id();

    assert_eq!(rig.rt.arena().in_use(), 1);
    assert_eq!(rig.rt.timers().outstanding(), 1);

    // One tick short of the deadline: still suspended.
    rig.sim.advance(49);
    assert_eq!(fiber.resume_count(), 0);

    rig.sim.advance(1);
    assert_eq!(fiber.resumes(), vec![Resume::Int(i64::from(errno::ETIMEDOUT))]);
    // The timer slot went back with the timeout; the request block waits
    // for the completion.
    assert_eq!(rig.rt.timers().outstanding(), 0);
    assert_eq!(rig.rt.arena().in_use(), 1);

    // Much later, the reactor finally reports the connect. No second
    // resume; the request block is freed exactly once.
    rig.sim.advance(500);
    rig.sim.complete_connect(stream, 0);
    assert_eq!(fiber.resume_count(), 1);
    assert_eq!(rig.rt.arena().in_use(), 0);
    rig.assert_quiescent();
}

#[test]
fn read_timeout_resumes_once_and_ignores_late_data() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();
    ops::set_timeout(&pair.client, 25).unwrap();
    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    assert_eq!(rig.rt.timers().outstanding(), 1);

    rig.sim.advance(25);
    assert_eq!(
        pair.client_fiber.last_resume(),
        Some(Resume::Int(i64::from(errno::ETIMEDOUT)))
    );
    let resumed = pair.client_fiber.resume_count();
    rig.assert_quiescent();

    // Data arriving after the deadline stays buffered; nothing resumes.
    rig.sim.push_incoming(stream, b"late");
    assert_eq!(pair.client_fiber.resume_count(), resumed);
    assert_eq!(buf.borrow().write_pos(), 0);
}

#[test]
fn write_timeout_leaves_request_for_completion() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();
    rig.sim.set_try_write_cap(stream, Some(0));
    rig.sim.set_manual_writes(stream, true);
    ops::set_timeout(&pair.client, 10).unwrap();

    let baseline = rig.registry_live();
    let data = HostValue::Bytes(Bytes::from_static(b"deadline"));
    assert!(matches!(
        ops::write(&pair.client, &pair.client_co, &data).unwrap(),
        Op::Yield
    ));
    assert_eq!(rig.rt.arena().in_use(), 1);
    assert_eq!(rig.registry_live(), baseline + 1, "payload not anchored");

    rig.sim.advance(10);
    assert_eq!(
        pair.client_fiber.last_resume(),
        Some(Resume::Pair(0, i64::from(errno::ETIMEDOUT)))
    );
    // Timeout path keeps the request and the payload anchor alive for the
    // completion to tear down.
    assert_eq!(rig.rt.arena().in_use(), 1);
    assert_eq!(rig.registry_live(), baseline + 1);
    assert_eq!(rig.rt.timers().outstanding(), 0);

    let resumed = pair.client_fiber.resume_count();
    rig.sim.complete_next_write(stream, 0);
    assert_eq!(pair.client_fiber.resume_count(), resumed, "double resume");
    assert_eq!(rig.rt.arena().in_use(), 0);
    assert_eq!(rig.registry_live(), baseline);
    rig.assert_quiescent();
}

#[test]
fn write_async_never_resumes() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();
    rig.sim.set_try_write_cap(stream, Some(0));
    rig.sim.set_manual_writes(stream, true);
    ops::set_timeout(&pair.client, 10).unwrap();

    let baseline = rig.registry_live();
    let resumed = pair.client_fiber.resume_count();
    let payload = HostValue::Bytes(Bytes::from_static(b"fire-and-forget"));
    let outcome = ops::write_async(&pair.client, &payload).unwrap();
    match outcome {
        Op::Complete(Resume::Pair(bytes, 0)) => assert_eq!(bytes, 15),
        other => panic!("unexpected write_async outcome: {other:?}"),
    }
    // The caller kept running; the op only left a request behind.
    assert_eq!(pair.client_fiber.resume_count(), resumed);
    assert_eq!(rig.rt.arena().in_use(), 1);
    assert_eq!(rig.rt.timers().outstanding(), 1);
    assert_eq!(rig.registry_live(), baseline + 1);

    // Deadline: anchor released, request freed, still nobody resumed.
    rig.sim.advance(10);
    assert_eq!(pair.client_fiber.resume_count(), resumed);
    assert_eq!(rig.rt.arena().in_use(), 0);
    assert_eq!(rig.registry_live(), baseline);
    rig.assert_quiescent();

    // The completion eventually delivered by the reactor finds a stale
    // request id and does nothing.
    rig.sim.complete_next_write(stream, 0);
    assert_eq!(pair.client_fiber.resume_count(), resumed);
    assert_eq!(rig.rt.arena().in_use(), 0);
}

#[test]
fn read_allocation_failure_reports_enomem() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();
    ops::set_timeout(&pair.client, 100).unwrap();
    rig.rt.pool().set_block_limit(Some(0));

    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    assert_eq!(rig.rt.timers().outstanding(), 1);

    rig.sim.push_incoming(stream, b"x");
    assert_eq!(
        pair.client_fiber.last_resume(),
        Some(Resume::Int(i64::from(errno::ENOMEM)))
    );
    assert_eq!(buf.borrow().capacity(), 0);
    rig.assert_quiescent();
}

#[test]
fn zero_byte_reads_are_ignored() {
    let rig = sim_rig();
    let pair = establish_pair(&rig);
    let stream = pair.client.borrow().stream_id();

    let buf = ReadBuffer::shared(4096);
    ops::set_read_buffer(&pair.client, &buf).unwrap();
    assert!(matches!(
        ops::read(&pair.client, &pair.client_co).unwrap(),
        Op::Yield
    ));
    let resumed = pair.client_fiber.resume_count();

    rig.sim.poke_read_zero(stream);
    assert_eq!(pair.client_fiber.resume_count(), resumed, "0 must not conclude a read");

    rig.sim.push_incoming(stream, b"hi");
    assert_eq!(pair.client_fiber.last_resume(), Some(Resume::Int(2)));
    assert_eq!(buf.borrow().readable(), b"hi");
    rig.assert_quiescent();
}

#[test]
fn connect_timer_allocation_failure_is_synchronous() {
    // Zero request slots: the launch fails after the timer was already
    // acquired, which must release the timer before returning.
    let rig = common::sim_rig_with(strandio::config::RuntimeOptions::new().with_request_slots(0));
    let fiber = Fiber::new("connector");
    let co: CoroutineRef = fiber.clone();
    let sock = ops::new_socket(&rig.rt, &co, false).unwrap();
    ops::set_timeout(&sock, 50).unwrap();

    let outcome = ops::connect(&sock, &co, 9000, "127.0.0.1").unwrap();
    match outcome {
        Op::Complete(Resume::Int(code)) => assert_eq!(code, i64::from(errno::ENOMEM)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fiber.resume_count(), 0);
    rig.assert_quiescent();
}

#[test]
fn accepted_socket_inherits_listener_timeout() {
    let rig = sim_rig();

    let owner = Fiber::new("listener-owner");
    let owner_co: CoroutineRef = owner.clone();
    let listener = ops::new_socket(&rig.rt, &owner_co, true).unwrap();
    assert_eq!(ops::bind(&listener, 0, "127.0.0.1", false).unwrap(), 0);
    ops::set_timeout(&listener, 750).unwrap();

    let server_sock: Rc<std::cell::RefCell<Option<strandio::socket::SocketRef>>> =
        Rc::new(std::cell::RefCell::new(None));
    let on_connect: strandio::host::HostFn = {
        let server_sock = Rc::clone(&server_sock);
        Rc::new(move |_co, resume| {
            if let Resume::Socket(sock) = resume {
                *server_sock.borrow_mut() = Some(sock);
            }
        })
    };
    assert_eq!(
        ops::listen(&listener, HostValue::Callable(on_connect), 8).unwrap(),
        0
    );
    let (addr, _) = ops::local_address(&listener).unwrap();
    let port = i64::from(addr.unwrap().port);

    let client_fiber = Fiber::new("client");
    let client_co: CoroutineRef = client_fiber.clone();
    let client = ops::new_socket(&rig.rt, &client_co, false).unwrap();
    assert!(matches!(
        ops::connect(&client, &client_co, port, "127.0.0.1").unwrap(),
        Op::Yield
    ));
    rig.sim.run();

    let accepted = server_sock.borrow().clone().expect("accepted socket");
    assert_eq!(accepted.borrow().timeout_ms(), 750);
}
