use std::str::FromStr;
use worldsync_types::{Endpoint, Error, Quaternion, Transform, TransportKind, Vector3};

// ── TransportKind ─────────────────────────────────────────────────

#[test]
fn transport_kind_parses_known_names() {
    assert_eq!(TransportKind::from_str("tcp").unwrap(), TransportKind::Tcp);
    assert_eq!(TransportKind::from_str("TCP").unwrap(), TransportKind::Tcp);
    assert_eq!(
        TransportKind::from_str("websocket").unwrap(),
        TransportKind::WebSocket
    );
    assert_eq!(TransportKind::from_str(" ws ").unwrap(), TransportKind::WebSocket);
}

#[test]
fn transport_kind_rejects_unknown() {
    let err = TransportKind::from_str("carrier-pigeon").unwrap_err();
    assert!(matches!(err, Error::InvalidTransport(ref s) if s == "carrier-pigeon"));
}

#[test]
fn transport_kind_display_roundtrips() {
    for kind in [TransportKind::Tcp, TransportKind::WebSocket] {
        assert_eq!(TransportKind::from_str(&kind.to_string()).unwrap(), kind);
    }
}

// ── Endpoint ──────────────────────────────────────────────────────

#[test]
fn endpoint_matches_case_insensitive_host() {
    let ep = Endpoint::new("Broker.Example", 1883);
    assert!(ep.matches("broker.example", 1883));
    assert!(!ep.matches("broker.example", 8883));
    assert_eq!(ep.to_string(), "Broker.Example:1883");
}

// ── Transform ─────────────────────────────────────────────────────

#[test]
fn default_transform_is_identity_at_origin() {
    let t = Transform::default();
    assert_eq!(t.position, Vector3::ZERO);
    assert_eq!(t.rotation, Quaternion::IDENTITY);
    assert_eq!(t.scale, Vector3::ONE);
}

#[test]
fn session_space_shifts_position_only() {
    let offset = Vector3::new(100.0, 0.0, -50.0);
    let local = Transform::new(
        Vector3::new(1.0, 2.0, 3.0),
        Quaternion::new(0.0, 0.7071, 0.0, 0.7071),
        Vector3::new(2.0, 2.0, 2.0),
    );

    let shared = local.to_session_space(offset);
    assert_eq!(shared.position, Vector3::new(101.0, 2.0, -47.0));
    assert_eq!(shared.rotation, local.rotation);
    assert_eq!(shared.scale, local.scale);

    assert_eq!(shared.to_local_space(offset), local);
}

#[test]
fn peers_with_different_offsets_agree_on_session_position() {
    // A's origin sits 10 units east of B's.
    let a_offset = Vector3::new(10.0, 0.0, 0.0);
    let b_offset = Vector3::ZERO;

    let a_local = Transform::at(Vector3::new(5.0, 0.0, 0.0));
    let shared = a_local.to_session_space(a_offset);
    let b_local = shared.to_local_space(b_offset);

    assert_eq!(b_local.position, Vector3::new(15.0, 0.0, 0.0));
}

#[test]
fn vector_is_finite() {
    assert!(Vector3::new(1.0, 2.0, 3.0).is_finite());
    assert!(!Vector3::new(f32::NAN, 0.0, 0.0).is_finite());
}
