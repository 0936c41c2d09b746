//! Property tests for tally runs over arbitrary view histories:
//!   - a full rebuild equals any split into incremental runs
//!   - counts never decrease across incremental runs
//!   - re-running with no new events leaves tallies unchanged

use popular_core::config::TallySettings;
use popular_core::db::host::{HostWriter, SqliteHost};
use popular_core::db::store::TallyStore;
use popular_core::host::IdentityRecord;
use popular_core::model::{TallyVector, TargetKind, TimeWindow, ViewEvent};
use popular_core::run::{RunOptions, TallyRun};
use proptest::prelude::*;
use std::collections::BTreeMap;

const BASE: i64 = 1_700_000_000;
const BLACKLISTED: &str = "10.0.0.9";

type State = BTreeMap<(TargetKind, i64), TallyVector>;

fn arb_event() -> impl Strategy<Value = (usize, i64, i64, i64, bool)> {
    (0_usize..3, 1_i64..4, 0_i64..7, 0_i64..20_000, proptest::bool::weighted(0.1))
}

fn arb_settings() -> impl Strategy<Value = TallySettings> {
    (prop_oneof![Just(0_i64), Just(600), Just(3600)], any::<bool>()).prop_map(
        |(debounce_interval, count_anonymous)| {
            let mut settings = TallySettings {
                windows: vec![TimeWindow::ALL_TIME, TimeWindow::YEAR],
                debounce_interval,
                count_anonymous,
                ..TallySettings::default()
            };
            settings.blacklist.insert(BLACKLISTED.parse().unwrap());
            settings
        },
    )
}

fn to_events(raw: &[(usize, i64, i64, i64, bool)]) -> Vec<ViewEvent> {
    let mut events: Vec<ViewEvent> = raw
        .iter()
        .map(|(kind, instance_id, user_id, offset, blacklisted)| ViewEvent {
            kind: TargetKind::ALL[*kind],
            instance_id: *instance_id,
            user_id: *user_id,
            course_id: 0,
            timestamp: BASE + offset,
            origin_ip: if *blacklisted { BLACKLISTED } else { "192.0.2.1" }.to_string(),
        })
        .collect();
    events.sort_by_key(|e| e.timestamp);
    events
}

/// Store with identities 1..=3 of every kind, users 1..=5 active and user 6
/// deleted.
fn seeded_store(events: &[ViewEvent]) -> TallyStore {
    let store = TallyStore::in_memory().unwrap();
    let writer = HostWriter::new(store.connection());
    for kind in TargetKind::ALL {
        for id in 1..=3 {
            writer
                .upsert_identity(
                    kind,
                    &IdentityRecord {
                        instance_id: id,
                        name: format!("{kind} {id}"),
                    },
                )
                .unwrap();
        }
    }
    for user in 1..=6 {
        writer.upsert_user(user, user == 6).unwrap();
    }
    for event in events {
        writer.insert_view(event).unwrap();
    }
    store
}

fn run(store: &TallyStore, settings: &TallySettings, now: i64, force_rebuild: bool) {
    let host = SqliteHost::new(store.connection());
    TallyRun::new(store, host.hosts(), settings)
        .execute(&RunOptions {
            now: Some(now),
            force_rebuild,
            ..RunOptions::default()
        })
        .unwrap();
}

fn state(store: &TallyStore) -> State {
    let mut out = State::new();
    for kind in TargetKind::ALL {
        for (id, vector) in store.read_kind_tallies(kind).unwrap() {
            out.insert((kind, id), vector);
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rebuild_equals_incremental_runs(
        raw in proptest::collection::vec(arb_event(), 0..40),
        mut cuts in proptest::collection::vec(0_i64..20_000, 1..5),
        settings in arb_settings(),
    ) {
        let events = to_events(&raw);
        cuts.sort_unstable();
        cuts.dedup();

        let incremental = seeded_store(&events);
        let mut previous = State::new();
        for cut in &cuts {
            run(&incremental, &settings, BASE + cut, false);
            let current = state(&incremental);
            for (key, before) in &previous {
                let after = current.get(key);
                prop_assert!(after.is_some(), "tally for {key:?} disappeared");
                for (window, count) in before.iter() {
                    prop_assert!(after.map_or(0, |v| v.count(window)) >= count);
                }
            }
            previous = current;
        }
        let end = BASE + 20_000;
        run(&incremental, &settings, end, false);

        let rebuilt = seeded_store(&events);
        run(&rebuilt, &settings, end, true);

        prop_assert_eq!(state(&incremental), state(&rebuilt));
    }

    #[test]
    fn rerun_without_new_events_is_a_no_op(
        raw in proptest::collection::vec(arb_event(), 0..30),
        settings in arb_settings(),
    ) {
        let events = to_events(&raw);
        let store = seeded_store(&events);
        let end = BASE + 20_000;

        run(&store, &settings, end, false);
        let first = state(&store);
        run(&store, &settings, end + 1, false);
        run(&store, &settings, end + 2, false);

        prop_assert_eq!(state(&store), first);
    }
}
