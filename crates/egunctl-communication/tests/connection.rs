//! Connection and command layer against the simulated controller

use egunctl_communication::{
    CallMode, Connection, ConnectionConfig, Identity, InsulationResult, Response,
    SimulatedTransport, TargetVoltageSettings, Transport,
};
use egunctl_core::{DeviceEvent, EventKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reply_timeout: Duration::from_millis(100),
        beam_on_timeout: Duration::from_millis(200),
        retries: 2,
        voltage_convergence_timeout: Duration::from_secs(2),
        ..ConnectionConfig::default()
    }
    .without_delays()
}

fn connect(transport: &Arc<SimulatedTransport>) -> Connection {
    let transport: Arc<dyn Transport> = transport.clone();
    Connection::with_transport(transport, fast_config()).unwrap()
}

#[test]
fn test_set_voltage_wire_bytes() {
    let sim = Arc::new(SimulatedTransport::new());
    let conn = connect(&sim);

    let res = conn.commands().set_voltage(2, 1800, CallMode::NonBlocking).unwrap();
    assert_eq!(res, Response::Sent);
    assert_eq!(sim.writes(), vec![b"$$$psusetv21800\n".to_vec()]);
    assert_eq!(conn.commands().last_command(), Some(b"$$$psusetv21800\n".to_vec()));
}

#[test]
fn test_invalid_voltage_writes_nothing() {
    let sim = Arc::new(SimulatedTransport::new());
    let conn = connect(&sim);

    let err = conn
        .commands()
        .set_voltage(3, 4000, CallMode::NonBlocking)
        .unwrap_err();
    assert!(err.is_invalid_parameter());
    assert!(conn.commands().set_voltage(5, 100, CallMode::NonBlocking).is_err());
    assert!(conn.commands().set_voltage(1, -1, CallMode::NonBlocking).is_err());
    assert!(sim.writes().is_empty());
}

#[test]
fn test_blocking_identify() {
    let sim = Arc::new(SimulatedTransport::controller());
    let conn = connect(&sim);

    let id = conn.commands().identify(CallMode::Blocking).unwrap();
    assert_eq!(
        id,
        Response::Value(Identity {
            version: "20231112".to_string(),
            revision: "3".to_string(),
        })
    );
}

#[test]
fn test_blocking_set_voltage_converges() {
    let sim = Arc::new(SimulatedTransport::controller());
    let conn = connect(&sim);

    let res = conn.commands().set_voltage(1, 2018, CallMode::Blocking).unwrap();
    assert_eq!(res, Response::Value(2018));
    assert_eq!(
        sim.written_commands(),
        vec!["$$$psusetv12018\n".to_string(), "$$$psugetv1\n".to_string()]
    );
}

#[test]
fn test_observers_see_unsolicited_replies() {
    let sim = Arc::new(SimulatedTransport::new());
    let conn = connect(&sim);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    conn.subscribe(EventKind::Current, move |ev| s.lock().push(ev.clone()));

    sim.inject(b"junk$$$a2:0150\n$$$v1:5\n");
    thread::sleep(Duration::from_millis(200));

    assert_eq!(
        *seen.lock(),
        vec![DeviceEvent::Current {
            channel: 2,
            value: 15.0
        }]
    );
}

#[test]
fn test_no_response_retries_then_probes() {
    let sim = Arc::new(SimulatedTransport::new());
    let conn = connect(&sim);

    let res = conn.commands().get_voltage(3, CallMode::Blocking).unwrap();
    assert!(res.is_no_response());
    assert_eq!(
        sim.written_commands(),
        vec![
            "$$$psugetv3\n".to_string(),
            "$$$psugetv3\n".to_string(),
            "$$$psugetv3\n".to_string(),
            "$$$$$$$$$$$$id\n".to_string(),
        ]
    );
}

#[test]
fn test_insulation_failure_reported() {
    let sim = Arc::new(SimulatedTransport::with_responder(|cmd| match cmd {
        "insul" => vec!["insulfailed:F--F".to_string()],
        _ => Vec::new(),
    }));
    let conn = connect(&sim);

    let res = conn.commands().run_insulation_test(CallMode::Blocking).unwrap();
    assert_eq!(res, Response::Value(InsulationResult::Failed(vec![1, 4])));
}

#[test]
fn test_filament_off_waits_for_disabled() {
    // First answer still shows the old set point, the retransmission
    // reports the filament as disabled
    let mut calls = 0;
    let sim = Arc::new(SimulatedTransport::with_responder(move |cmd| {
        if cmd != "filoff" {
            return Vec::new();
        }
        calls += 1;
        if calls == 1 {
            vec!["filseta:120".to_string()]
        } else {
            vec!["filseta:disabled".to_string()]
        }
    }));
    let conn = connect(&sim);

    let res = conn.commands().filament_off(CallMode::Blocking).unwrap();
    assert_eq!(res, Response::Value(None));
    assert_eq!(sim.written_commands().len(), 2);
}

#[test]
fn test_status_snapshot() {
    let sim = Arc::new(SimulatedTransport::controller());
    let conn = connect(&sim);
    conn.commands()
        .set_voltage(3, 1808, CallMode::NonBlocking)
        .unwrap();

    let status = conn.commands().status().unwrap();
    assert_eq!(status.identity.map(|i| i.revision), Some("3".to_string()));
    assert_eq!(status.voltages, [Some(0), Some(0), Some(1808), Some(0)]);
    assert_eq!(status.currents, [Some(0.0); 4]);
    assert!(status.modes.is_some());
    assert_eq!(status.filament_current, Some(0.0));
}

#[test]
fn test_target_voltages_validated_before_write() {
    let sim = Arc::new(SimulatedTransport::new());
    let conn = connect(&sim);

    let targets = TargetVoltageSettings {
        cathode: Some(1800),
        focus: Some(5000),
        ..TargetVoltageSettings::default()
    };
    assert!(conn.commands().set_target_voltages(&targets).is_err());
    assert!(sim.writes().is_empty());

    let targets = TargetVoltageSettings {
        cathode: Some(1800),
        wehnelt_blank: Some(1500),
        ..TargetVoltageSettings::default()
    };
    conn.commands().set_target_voltages(&targets).unwrap();
    assert_eq!(
        sim.written_commands(),
        vec![
            "$$$setvtargetvk1800\n".to_string(),
            "$$$setvtargetvwblank1500\n".to_string()
        ]
    );
}

#[test]
fn test_transport_loss_wakes_blocked_caller() {
    let sim = Arc::new(SimulatedTransport::new());
    let transport: Arc<dyn Transport> = sim.clone();
    let conn = Connection::with_transport(
        transport,
        ConnectionConfig {
            reply_timeout: Duration::from_secs(30),
            ..ConnectionConfig::default()
        }
        .without_delays(),
    )
    .unwrap();

    let s = sim.clone();
    let unplug = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        s.disconnect();
    });

    let err = conn.commands().identify(CallMode::Blocking).unwrap_err();
    assert!(err.is_not_connected());
    unplug.join().unwrap();

    assert!(!conn.is_open());
    let err = conn.commands().identify(CallMode::NonBlocking).unwrap_err();
    assert!(err.is_not_connected());
}

#[test]
fn test_close_is_idempotent_and_powers_off() {
    let sim = Arc::new(SimulatedTransport::controller());
    let transport: Arc<dyn Transport> = sim.clone();
    let conn = Connection::with_transport(
        transport,
        ConnectionConfig {
            shutdown_on_close: true,
            ..fast_config()
        },
    )
    .unwrap();

    conn.close();
    conn.close();
    assert!(!conn.is_open());
    assert!(sim.is_closed());
    assert_eq!(sim.written_commands(), vec!["$$$off\n".to_string()]);
    assert!(conn.commands().get_modes(CallMode::NonBlocking).is_err());
}
