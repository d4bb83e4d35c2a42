/// Integration tests for IPC communication
/// These tests pin the JSON-line wire format shared by moniqued, moniquectl
/// and the layout editor
use common::{
    Command, DaemonEvent, DaemonStatus, MoniqueError, MonitorDescriptor, MonitorSnapshot, Profile,
    Response, SessionInfo, SessionStatus, Transform,
};

#[test]
fn test_command_wire_format() {
    let cmd = Command::ApplyProfile {
        name: "Office".to_string(),
    };
    let json = serde_json::to_string(&cmd).unwrap();
    assert_eq!(json, r#"{"ApplyProfile":{"name":"Office"}}"#);

    // Unit commands travel as bare strings
    assert_eq!(serde_json::to_string(&Command::Confirm).unwrap(), r#""Confirm""#);

    let deserialized: Command = serde_json::from_str(r#""Revert""#).unwrap();
    assert!(matches!(deserialized, Command::Revert));
}

#[test]
fn test_all_commands_roundtrip() {
    let commands = vec![
        Command::Ping,
        Command::Status,
        Command::ListOutputs,
        Command::ListProfiles,
        Command::Confirm,
        Command::Revert,
        Command::DeleteProfile {
            name: "Home".to_string(),
        },
        Command::Watch,
        Command::Kill,
    ];

    for cmd in commands {
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(format!("{:?}", back), format!("{:?}", cmd));
    }
}

#[test]
fn test_unknown_command_is_rejected() {
    assert!(serde_json::from_str::<Command>(r#""Reboot""#).is_err());
    assert!(serde_json::from_str::<Command>(r#"{"ApplyProfile":{}}"#).is_err());
}

#[test]
fn test_status_response() {
    let resp = Response::Status(DaemonStatus {
        version: "0.1.0".to_string(),
        uptime_secs: 42,
        backend: Some("sway".to_string()),
        active_profile: Some("Home".to_string()),
        session: Some(SessionInfo {
            profile: "Office".to_string(),
            status: SessionStatus::Confirming { remaining_ms: 7500 },
        }),
    });

    let json = serde_json::to_string(&resp).unwrap();
    match serde_json::from_str::<Response>(&json).unwrap() {
        Response::Status(status) => {
            assert_eq!(status.backend.as_deref(), Some("sway"));
            let session = status.session.unwrap();
            assert_eq!(session.profile, "Office");
            assert_eq!(session.status, SessionStatus::Confirming { remaining_ms: 7500 });
        }
        other => panic!("Wrong response type: {:?}", other),
    }
}

#[test]
fn test_event_stream_lines() {
    let mut laptop = MonitorDescriptor::new("eDP-1", "");
    laptop.transform = Transform::Rotate90;

    let events = vec![
        DaemonEvent::Session {
            profile: "Office".to_string(),
            status: SessionStatus::Applying,
        },
        DaemonEvent::Session {
            profile: "Office".to_string(),
            status: SessionStatus::Failed {
                reason: "output DP-9 not found".to_string(),
            },
        },
        DaemonEvent::Reverted {
            profile: "Office".to_string(),
        },
        DaemonEvent::Snapshot(MonitorSnapshot::new(vec![laptop])),
        DaemonEvent::NoMatch,
        DaemonEvent::Clamshell {
            output: "eDP-1".to_string(),
            enabled: false,
        },
    ];

    for event in events {
        // One event per line: no embedded newlines
        let json = serde_json::to_string(&Response::Event(event.clone())).unwrap();
        assert!(!json.contains('\n'));

        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Event(back) => assert_eq!(back, event),
            other => panic!("Wrong response type: {:?}", other),
        }
    }
}

#[test]
fn test_errors_cross_the_socket() {
    let errors = vec![
        MoniqueError::NoSession,
        MoniqueError::NotFound("profile 'Desk'".to_string()),
        MoniqueError::InvalidProfile("'Dark' would leave no monitor enabled".to_string()),
        MoniqueError::Backend("compositor rejected the configuration".to_string()),
    ];

    for error in errors {
        let json = serde_json::to_string(&Response::Error(error.clone())).unwrap();
        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Error(back) => assert_eq!(back, error),
            other => panic!("Wrong response type: {:?}", other),
        }
    }
}

#[test]
fn test_profile_document() {
    // What the layout editor writes to disk
    let json = r#"{
        "name": "Office",
        "monitors": [
            {
                "name": "DP-1",
                "identity": "Dell Inc. DELL U2720Q ABC123",
                "mode": { "width": 3840, "height": 2160, "refresh_mhz": 59997 },
                "x": 0,
                "y": 0,
                "scale": 1.5,
                "transform": "Normal",
                "primary": true
            },
            { "name": "eDP-1", "enabled": false }
        ],
        "workspace_rules": { "1": "DP-1" },
        "created_at": "2026-01-05T09:00:00Z",
        "updated_at": "2026-01-05T09:00:00Z"
    }"#;

    let profile: Profile = serde_json::from_str(json).unwrap();
    profile.validate().unwrap();

    assert_eq!(profile.monitors.len(), 2);
    assert_eq!(profile.monitors[0].identity_key(), "Dell Inc. DELL U2720Q ABC123");
    assert!(profile.monitors[0].primary);
    assert!(!profile.monitors[1].enabled);
    // Missing fields take their defaults
    assert_eq!(profile.monitors[1].scale, 1.0);
    assert_eq!(profile.monitors[1].identity_key(), "eDP-1");
    assert_eq!(profile.workspace_rules["1"], "DP-1");
    assert!(profile.last_applied.is_none());

    let summary = profile.summary();
    assert_eq!(summary.monitors, vec!["DP-1", "eDP-1"]);
}

#[test]
fn test_outputs_response_keeps_disabled_monitors() {
    let mut off = MonitorDescriptor::new("HDMI-A-1", "");
    off.enabled = false;
    let snapshot = MonitorSnapshot::new(vec![MonitorDescriptor::new("DP-1", ""), off]);

    let json = serde_json::to_string(&Response::Outputs(snapshot.clone())).unwrap();
    match serde_json::from_str::<Response>(&json).unwrap() {
        Response::Outputs(back) => {
            assert_eq!(back, snapshot);
            assert_eq!(back.enabled().count(), 1);
            assert_eq!(back.len(), 2);
        }
        other => panic!("Wrong response type: {:?}", other),
    }
}
