use std::sync::Arc;

use argus::{Config, Probe};
use argus_core::{
    codec,
    event::{Event, EventHeader, EventKind, MountRecord, Payload},
};
use kernel_filtering::{
    defaults::{OPEN_PATH_DISCARDERS, UNLINK_PATH_DISCARDERS},
    policy_table_name,
    test_utils::FakeTables,
    Approvers, FilterPolicy, FilterValue, PolicyFlags, PolicyMode, TableError,
};
use tokio::sync::mpsc;

fn buffer(kind: EventKind, payload: Payload) -> Vec<u8> {
    codec::encode(&Event {
        header: EventHeader {
            kind,
            timestamp: 1000,
            pid: 42,
            tid: 42,
            retval: 0,
        },
        payload,
    })
}

fn probe_with(
    config: Config,
    tables: Arc<FakeTables>,
) -> (Probe, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(64);
    (Probe::new(config, tables, Arc::new(tx)), rx)
}

#[test]
fn mount_open_umount_scenario() {
    let tables = Arc::new(FakeTables::default());
    let (probe, mut rx) = probe_with(Config::default(), tables);
    let dispatcher = probe.dispatcher();

    // mount id=3 at /data
    dispatcher.on_buffer(
        0,
        &buffer(
            EventKind::Mount,
            Payload::Mount(MountRecord {
                mount_id: 3,
                parent_mount_id: 0,
                device: 7,
                fs_type: "ext4".to_string(),
                mount_point: "/data".to_string(),
                root: "/".to_string(),
            }),
        ),
    );

    // an unrelated open on another CPU referencing a path under /data
    dispatcher.on_buffer(
        1,
        &buffer(
            EventKind::Open,
            Payload::Open {
                filename: "logs/app.log".to_string(),
                flags: 0o100,
                mode: 0o644,
                mount_id: 3,
            },
        ),
    );

    let mount_event = rx.try_recv().unwrap();
    assert_eq!(mount_event.header.kind, EventKind::Mount);
    let open_event = rx.try_recv().unwrap();
    let Payload::Open {
        filename, mount_id, ..
    } = &open_event.payload
    else {
        panic!("expected an open event, got {:?}", open_event.payload);
    };
    assert_eq!(
        probe.resolvers().mounts().resolve_path(*mount_id, filename),
        Some("/data/logs/app.log".to_string())
    );

    dispatcher.on_buffer(0, &buffer(EventKind::Umount, Payload::Umount { mount_id: 3 }));
    assert_eq!(probe.resolvers().mounts().lookup(3), None);

    assert_eq!(probe.stats().get(EventKind::Mount), 1);
    assert_eq!(probe.stats().get(EventKind::Open), 1);
    assert_eq!(probe.stats().get(EventKind::Umount), 1);
    assert_eq!(probe.stats().get_lost(), 0);
}

#[test]
fn init_writes_explicit_pass_policy_when_filtering_is_disabled() {
    let tables = Arc::new(FakeTables::with_tables(&["open_policy", "unlink_policy"]));
    let config = Config {
        enable_kernel_filters: false,
        ..Config::default()
    };
    let (probe, _rx) = probe_with(config, tables.clone());
    probe.init().unwrap();

    assert_eq!(tables.policy("open_policy"), Some(FilterPolicy::pass()));
    assert_eq!(tables.policy("unlink_policy"), Some(FilterPolicy::pass()));
    // event types without a policy table are skipped, not an error
    assert_eq!(tables.policy(&policy_table_name(EventKind::Mount)), None);
}

#[test]
fn init_leaves_tables_alone_when_filtering_is_enabled() {
    let tables = Arc::new(FakeTables::with_tables(&["open_policy"]));
    let (probe, _rx) = probe_with(Config::default(), tables.clone());
    probe.init().unwrap();
    assert_eq!(tables.policy("open_policy"), None);
}

#[test]
fn filter_policy_flows_into_the_kernel_table() {
    let tables = Arc::new(FakeTables::with_tables(&["open_policy"]));
    let (probe, _rx) = probe_with(Config::default(), tables.clone());

    probe
        .apply_filter_policy(
            EventKind::Open,
            "open_policy",
            PolicyMode::Deny,
            PolicyFlags::BASENAME,
        )
        .unwrap();
    assert_eq!(
        tables.policy("open_policy"),
        Some(FilterPolicy {
            mode: PolicyMode::Deny,
            flags: PolicyFlags::BASENAME,
        })
    );

    let err = probe
        .apply_filter_policy(
            EventKind::Rename,
            "rename_policy",
            PolicyMode::Accept,
            PolicyFlags::empty(),
        )
        .unwrap_err();
    assert!(matches!(err, TableError::TableNotFound(name) if name == "rename_policy"));
}

#[test]
fn discarders_reach_the_kernel_tables() {
    let tables = Arc::new(FakeTables::with_tables(&[
        OPEN_PATH_DISCARDERS,
        UNLINK_PATH_DISCARDERS,
    ]));
    let (probe, _rx) = probe_with(Config::default(), tables.clone());

    let event = Event {
        header: EventHeader {
            kind: EventKind::Open,
            timestamp: 0,
            pid: 1,
            tid: 1,
            retval: 0,
        },
        payload: Payload::Open {
            filename: "var/tmp/noise".to_string(),
            flags: 0,
            mode: 0,
            mount_id: 1,
        },
    };
    probe
        .notify_discarder(
            EventKind::Open,
            &event,
            "open.filename",
            FilterValue::Path("/var/tmp/noise".to_string()),
        )
        .unwrap();
    assert_eq!(
        tables.values(OPEN_PATH_DISCARDERS),
        vec![FilterValue::Path("/var/tmp/noise".to_string())]
    );
}

#[test]
fn disabled_discarders_are_a_no_op() {
    // no discarder tables exist: a real push would fail
    let tables = Arc::new(FakeTables::default());
    let config = Config {
        enable_discarders: false,
        ..Config::default()
    };
    let (probe, _rx) = probe_with(config, tables.clone());

    let event = Event {
        header: EventHeader {
            kind: EventKind::Open,
            timestamp: 0,
            pid: 1,
            tid: 1,
            retval: 0,
        },
        payload: Payload::Open {
            filename: "a".to_string(),
            flags: 0,
            mode: 0,
            mount_id: 1,
        },
    };
    probe
        .notify_discarder(
            EventKind::Open,
            &event,
            "open.filename",
            FilterValue::Path("/a".to_string()),
        )
        .unwrap();
    assert!(tables.values(OPEN_PATH_DISCARDERS).is_empty());
}

#[test]
fn approvers_for_an_unregistered_event_type_succeed_without_writes() {
    let tables = Arc::new(FakeTables::default());
    let (probe, _rx) = probe_with(Config::default(), tables);

    let mut approvers = Approvers::new();
    approvers.insert(
        "rename.filename",
        vec![FilterValue::Path("/etc".to_string())],
    );
    probe.apply_approvers(EventKind::Rename, &approvers).unwrap();
}

#[test]
fn stats_snapshot_shape() {
    let tables = Arc::new(FakeTables::default());
    let (probe, _rx) = probe_with(Config::default(), tables);
    probe.dispatcher().on_lost(0, 4);
    probe.dispatcher().on_buffer(
        0,
        &buffer(
            EventKind::Mkdir,
            Payload::Mkdir {
                dirname: "tmp/x".to_string(),
                mode: 0o755,
                mount_id: 1,
            },
        ),
    );

    let snapshot = serde_json::to_value(probe.get_stats()).unwrap();
    assert_eq!(snapshot["events"]["lost"], 4);
    assert_eq!(snapshot["events"]["syscalls"], serde_json::Value::Null);
    assert_eq!(snapshot["per_event_type"]["mkdir"], 1);
    assert_eq!(snapshot["per_event_type"]["open"], 0);
}

#[test]
fn decode_failures_do_not_count() {
    let tables = Arc::new(FakeTables::default());
    let (probe, mut rx) = probe_with(Config::default(), tables);

    let mut bad = buffer(EventKind::Umount, Payload::Umount { mount_id: 1 });
    bad[0..4].copy_from_slice(&200u32.to_le_bytes());
    probe.dispatcher().on_buffer(0, &bad);

    assert_eq!(probe.stats().get(EventKind::Umount), 0);
    assert!(rx.try_recv().is_err());
}
