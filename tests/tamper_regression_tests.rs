// Tamper and Zeroization Regression Tests
//
// The fail-closed contract: once the device trips, every dispatch fails
// with TAMPER_FAULT for the rest of the process lifetime and no stale key
// material is ever served.

use serde_json::json;
use vhsm_pay::{
    DeviceState, HsmError, KeyAlgorithm, KeyStatus, KeyType, PaymentHsm, TamperMonitor,
    TamperReason,
};

fn provisioned_hsm() -> PaymentHsm {
    let hsm = PaymentHsm::new("HSM-TAMPER-01");
    hsm.provision_test_keys().expect("default key set");
    hsm
}

/// After zeroize-all, a handler call against a previously ACTIVE key fails
/// with the invalid-key class and never returns stale material
#[test]
fn test_zeroize_all_blocks_previously_active_keys() {
    let hsm = provisioned_hsm();

    // baseline: the key works
    hsm.execute(
        "B4",
        json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" }),
    )
    .unwrap();

    let wiped = hsm.keystore().zeroize_all();
    assert_eq!(wiped, 5);

    let error = hsm
        .execute(
            "B4",
            json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" }),
        )
        .unwrap_err();
    assert_eq!(error.code, "INVALID_KEY");

    // metadata survives as a tombstone, material does not
    let meta = hsm.key_metadata("ZPK-TEST").unwrap();
    assert_eq!(meta.status, KeyStatus::Destroyed);
    assert!(matches!(
        hsm.keystore().with_material("ZPK-TEST", |_, _| Ok(())),
        Err(HsmError::KeyNotActive { .. })
    ));
}

/// Once triggered, every subsequent dispatch fails with TamperFault
/// regardless of command code
#[test]
fn test_tamper_is_terminal_for_every_command() {
    let hsm = provisioned_hsm();
    hsm.trigger_tamper(TamperReason::ManualTrigger);

    assert_eq!(hsm.status().state, DeviceState::Tampered);
    assert_eq!(hsm.status().keys_loaded, 0);

    let payloads = [
        ("B4", json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" })),
        ("C0", json!({ "data": "x", "keyLabel": "ZAK-TEST", "algorithm": "ALG3" })),
        ("C2", json!({ "data": "x", "mac": "0000000000000000", "keyLabel": "ZAK-TEST", "algorithm": "ALG3" })),
        ("A6", json!({ "sourceKeyLabel": "ZPK-TEST", "destKeyLabel": "ZMK-TEST", "data": "0011223344556677" })),
        ("D4", json!({ "pan": "4111111111111111", "expiry": "2812", "serviceCode": "101", "keyLabel": "CVK-TEST" })),
        ("ZZ", json!({})),
    ];
    for (code, payload) in payloads {
        let error = hsm.execute(code, payload).unwrap_err();
        assert_eq!(error.code, "TAMPER_FAULT", "command {code} must fail closed");
    }
}

#[test]
fn test_second_trigger_does_not_rewrite_the_event() {
    let hsm = provisioned_hsm();
    hsm.trigger_tamper(TamperReason::ManualTrigger);
    hsm.trigger_tamper(TamperReason::IntegrityCheckFailed {
        detail: "late duplicate".to_string(),
    });

    // the audit trail records exactly one tamper transition
    let tamper_events = hsm
        .audit()
        .entries()
        .into_iter()
        .filter(|e| matches!(e.event, vhsm_pay::AuditEvent::TamperTriggered { .. }))
        .count();
    assert_eq!(tamper_events, 1);
}

struct TripOnThirdPoll {
    polls: std::sync::Mutex<u32>,
}

impl TamperMonitor for TripOnThirdPoll {
    fn name(&self) -> &'static str {
        "trip-on-third-poll"
    }

    fn check(&self) -> Option<TamperReason> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        if *polls >= 3 {
            Some(TamperReason::IntegrityCheckFailed {
                detail: "restart counter mismatch".to_string(),
            })
        } else {
            None
        }
    }
}

/// A pluggable monitor trips the device mid-stream; commands that already
/// passed the gate are unaffected, later ones fail closed
#[test]
fn test_monitor_trips_device_during_dispatch() {
    let hsm = provisioned_hsm();
    hsm.register_monitor(Box::new(TripOnThirdPoll {
        polls: std::sync::Mutex::new(0),
    }));

    let payload = json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" });
    assert!(hsm.execute("B4", payload.clone()).is_ok());
    assert!(hsm.execute("B4", payload.clone()).is_ok());

    let error = hsm.execute("B4", payload.clone()).unwrap_err();
    assert_eq!(error.code, "TAMPER_FAULT");
    assert_eq!(hsm.status().state, DeviceState::Tampered);

    // and it stays down
    let error = hsm.execute("B4", payload).unwrap_err();
    assert_eq!(error.code, "TAMPER_FAULT");
}

/// A fresh boot is a fresh device: a new instance starts OPERATIONAL even
/// though another instance in the same process is tampered
#[test]
fn test_instances_are_independent() {
    let tripped = provisioned_hsm();
    tripped.trigger_tamper(TamperReason::ManualTrigger);
    assert_eq!(tripped.status().state, DeviceState::Tampered);

    let fresh = PaymentHsm::new("HSM-TAMPER-02");
    fresh.provision_test_keys().unwrap();
    assert_eq!(fresh.status().state, DeviceState::Operational);
    assert!(fresh
        .execute(
            "B4",
            json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" })
        )
        .is_ok());
}

#[test]
fn test_destroyed_key_stays_destroyed_after_rotation_attempt() {
    let hsm = provisioned_hsm();
    hsm.destroy_key("ZPK-TEST").unwrap();

    assert!(matches!(
        hsm.rotate_key("ZPK-TEST"),
        Err(HsmError::KeyNotActive { .. })
    ));
    assert_eq!(
        hsm.key_metadata("ZPK-TEST").unwrap().status,
        KeyStatus::Destroyed
    );
}

#[test]
fn test_rotation_lifecycle_under_commands() {
    let hsm = provisioned_hsm();
    let new_key = hsm.rotate_key("ZPK-TEST").unwrap();
    assert_eq!(new_key.label, "ZPK-TEST-V2");
    assert_eq!(new_key.key_type, KeyType::Zpk);
    assert_eq!(new_key.algorithm, KeyAlgorithm::TripleDes2);

    // the suspended key refuses service, the successor works
    let error = hsm
        .execute(
            "B4",
            json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" }),
        )
        .unwrap_err();
    assert_eq!(error.code, "INVALID_KEY");

    assert!(hsm
        .execute(
            "B4",
            json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST-V2" })
        )
        .is_ok());
}
