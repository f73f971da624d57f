//! End-to-end tests over a real TCP connection.

mod common;

use std::thread;
use std::time::Duration;

use common::{BASE, Client, start, start_oneshot, wait_until};
use xgdb::packet::{Frame, checksum, hex_encode};
use xgdb::{DetachPolicy, StubConfig};
use xgdb_engine::{Engine, Register, ThreadId};

const QUIET: Duration = Duration::from_millis(150);

#[test]
fn test_stop_status_on_attach() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send_raw(b"$?#3f");
    assert_eq!(client.recv(), "T05thread:1;");
}

#[test]
fn test_breakpoint_set_and_clear_are_idempotent() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,00100000,4"), "OK");
    assert_eq!(harness.sim.installed_breakpoints(), 1);
    assert_eq!(client.request("z0,00100000,4"), "OK");
    assert_eq!(client.request("z0,00100000,4"), "OK");
    assert_eq!(harness.sim.installed_breakpoints(), 0);
}

#[test]
fn test_memory_read_refused_while_running() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));
    assert_eq!(client.request("m00100000,10"), "E01");
    assert_eq!(client.request("g"), "E01");
}

#[test]
fn test_continue_replies_on_breakpoint_hit() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,101010,4"), "OK");

    client.send("c");
    assert_eq!(client.try_recv(QUIET), None);
    assert!(wait_until(|| !harness.sim.is_paused()));

    harness.sim.run_for(100);
    assert_eq!(client.recv(), "T05thread:2;");
    assert_eq!(client.request("p40"), "0000000000101010");
    assert_eq!(client.request("?"), "T05thread:2;");
}

#[test]
fn test_slow_client_still_gets_stop_reply() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,100008,4"), "OK");
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));
    harness.sim.run_for(100);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(client.recv(), "T05thread:1;");
}

#[test]
fn test_memory_and_registers_while_paused() {
    let harness = start_oneshot(common::sim());
    harness
        .sim
        .write_memory(BASE + 0x20, &[0x7c, 0x08, 0x02, 0xa6])
        .unwrap();
    let mut client = Client::connect(harness.addr);

    assert_eq!(client.request("m100020,4"), "7c0802a6");
    assert_eq!(client.request("m1ffff0,20"), "E03");

    assert_eq!(client.request("M100030,2:beef"), "OK");
    let mut buf = [0u8; 2];
    harness.sim.read_memory(BASE + 0x30, &mut buf).unwrap();
    assert_eq!(hex_encode(&buf), "beef");

    let pc = harness.sim.read_register(ThreadId(1), Register::Pc).unwrap();
    assert_eq!(client.request("p40"), format!("{pc:016x}"));
    let blob = client.request("g");
    assert_eq!(blob.len(), (68 * 8 + 3 * 4) * 2);
    assert_eq!(&blob[64 * 16..65 * 16], format!("{pc:016x}"));
}

#[test]
fn test_single_step() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("s"), "T05thread:1;");
    assert_eq!(client.request("p40"), "0000000000100004");

    assert_eq!(client.request("vCont;s:2"), "T05thread:2;");
    assert_eq!(client.request("qC"), "QC2");
    assert_eq!(client.request("p40"), "0000000000101004");
}

#[test]
fn test_interrupt_while_running() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));
    assert_eq!(client.try_recv(QUIET), None);

    client.send_raw(&[0x03]);
    assert_eq!(client.recv(), "T02thread:1;");
    assert!(harness.sim.is_paused());
}

#[test]
fn test_interrupt_while_stopped_is_ignored() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send_raw(&[0x03]);
    assert_eq!(client.try_recv(QUIET), None);
    assert_eq!(client.request("?"), "T05thread:1;");
}

#[test]
fn test_interrupt_racing_breakpoint_gets_one_reply() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,100008,4"), "OK");
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));
    harness.sim.run_for(100);

    // Ctrl-C sent before the breakpoint stop was read.
    client.send_raw(&[0x03]);
    assert_eq!(client.recv(), "T05thread:1;");
    assert_eq!(client.try_recv(QUIET), None);
    assert_eq!(client.request("qC"), "QC1");
}

#[test]
fn test_interrupt_inside_partial_packet() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));

    client.send_raw(b"$m1000");
    client.send_raw(&[0x03]);
    assert_eq!(client.recv(), "T02thread:1;");
    assert!(harness.sim.is_paused());

    let rest = format!("00,4#{:02x}", checksum(b"m100000,4"));
    client.send_raw(rest.as_bytes());
    assert_eq!(client.recv().len(), 8);
}

#[test]
fn test_target_description_pages() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    let supported = client.request("qSupported:multiprocess+;xmlRegisters=i386");
    assert!(supported.contains("qXfer:features:read+"));

    let mut document = String::new();
    loop {
        let page = client.request(&format!(
            "qXfer:features:read:target.xml:{:x},200",
            document.len()
        ));
        let (marker, chunk) = page.split_at(1);
        document.push_str(chunk);
        if marker == "l" {
            break;
        }
        assert_eq!(marker, "m");
    }
    assert_eq!(document, xgdb::target::target_xml());
    assert!(document.contains("powerpc:common64"));
}

#[test]
fn test_thread_list_and_libraries() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("qfThreadInfo"), "m1,2");
    assert_eq!(client.request("qsThreadInfo"), "l");
    assert_eq!(client.request("qAttached"), "1");
    assert_eq!(client.request("Hg2"), "OK");
    assert_eq!(client.request("p40"), "0000000000101000");
    let libraries = client.request("qXfer:libraries:read::0,800");
    assert!(libraries.starts_with("l<library-list>"));
    assert!(libraries.contains("default.xex"));
}

#[test]
fn test_unknown_and_corrupt_packets() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("qRcmd,7265736574"), "");
    assert_eq!(client.request("vMustReplyEmpty"), "");

    client.send_raw(b"$?#00");
    assert_eq!(client.next_frame(common::TIMEOUT), Some(Frame::Nack));
    assert_eq!(client.request("?"), "T05thread:1;");
}

#[test]
fn test_second_client_is_refused() {
    let harness = start_oneshot(common::sim());
    let mut first = Client::connect(harness.addr);
    assert_eq!(first.request("?"), "T05thread:1;");

    let mut second = Client::connect(harness.addr);
    assert!(second.is_closed());
    assert_eq!(first.request("qfThreadInfo"), "m1,2");
}

#[test]
fn test_guest_exit_reports_w00() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send("c");
    assert!(wait_until(|| !harness.sim.is_paused()));
    harness.sim.terminate();
    assert_eq!(client.recv(), "W00");
    assert!(client.is_closed());
    assert!(harness.server.join().unwrap().is_ok());
}

#[test]
fn test_detach_clears_breakpoints_and_resumes() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,100100,4"), "OK");
    assert_eq!(client.request("Z0,100200,4"), "OK");
    assert_eq!(client.request("D"), "OK");
    assert!(client.is_closed());
    assert!(harness.server.join().unwrap().is_ok());

    assert_eq!(harness.sim.installed_breakpoints(), 0);
    assert!(!harness.sim.has_listener());
    assert!(!harness.sim.is_paused());
}

#[test]
fn test_detach_can_keep_breakpoints() {
    let harness = start(
        common::sim(),
        StubConfig {
            reconnect: false,
            detach_policy: DetachPolicy::KeepBreakpoints,
            ..StubConfig::default()
        },
    );
    let mut client = Client::connect(harness.addr);
    assert_eq!(client.request("Z0,100100,4"), "OK");
    assert_eq!(client.request("D"), "OK");
    assert!(harness.server.join().unwrap().is_ok());
    assert_eq!(harness.sim.installed_breakpoints(), 1);
}

#[test]
fn test_kill_ends_session_without_ending_guest() {
    let harness = start_oneshot(common::sim());
    let mut client = Client::connect(harness.addr);
    client.send("k");
    assert!(client.is_closed());
    assert!(harness.server.join().unwrap().is_ok());
    assert!(!harness.sim.is_ended());
}

#[test]
fn test_reconnect_after_detach() {
    let harness = start(common::sim(), StubConfig::default());
    let mut first = Client::connect(harness.addr);
    assert_eq!(first.request("D"), "OK");
    assert!(first.is_closed());

    // Detaching resumed the guest; the next client sees it running.
    let mut second = Client::connect(harness.addr);
    assert_eq!(second.request("qfThreadInfo"), "E01");
    second.send_raw(&[0x03]);
    assert_eq!(second.recv(), "T02thread:1;");
    assert!(wait_until(|| harness.sim.has_listener()));
}
