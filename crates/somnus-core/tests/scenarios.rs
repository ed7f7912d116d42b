//! End-to-end rest-cycle scenarios driven through the coordinator and the
//! in-memory host.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use somnus_core::config::SomnusConfig;
use somnus_core::coordinator::Coordinator;
use somnus_core::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionFactory,
};
use somnus_core::host::{HostEvent, NOTIFY_PERMISSION, WorldHost};
use somnus_core::memory::InMemoryHost;
use somnus_core::notification::{Announcement, Delivery};
use somnus_core::schedule::TimerScope;
use somnus_core::state::{SleepEvent, Transition, Verdict};
use somnus_types::{ExemptReason, NotificationKind, Participant, Partition};

const NIGHT: u64 = 13_000;
const MORNING: u64 = 24_000;

struct World {
    host: InMemoryHost,
    coordinator: Coordinator,
    partition: Partition,
    members: Vec<Participant>,
    now: DateTime<Utc>,
}

impl World {
    fn new(yaml: &str, members: usize) -> Self {
        let mut host = InMemoryHost::new();
        let partition = host.add_partition("world", NIGHT);
        let members = (0..members)
            .map(|i| host.add_participant(partition.id, &format!("p{i}")))
            .collect();
        let mut coordinator = Coordinator::new(SomnusConfig::parse(yaml).unwrap());
        let now = Utc::now();
        coordinator
            .handle(&mut host, HostEvent::PartitionLoaded(partition.clone()), now)
            .unwrap();
        Self {
            host,
            coordinator,
            partition,
            members,
            now,
        }
    }

    fn member(&self, i: usize) -> Participant {
        self.members.get(i).cloned().unwrap()
    }

    fn send(&mut self, event: HostEvent) {
        self.coordinator
            .handle(&mut self.host, event, self.now)
            .unwrap();
    }

    fn rest(&mut self, i: usize) {
        let participant = self.member(i);
        self.host.set_resting(participant.id, true);
        self.send(HostEvent::RestEntered {
            partition: self.partition.id,
            participant,
        });
    }

    fn wake(&mut self, i: usize) {
        let participant = self.member(i);
        self.host.set_resting(participant.id, false);
        self.send(HostEvent::RestExited {
            partition: self.partition.id,
            participant,
        });
    }

    fn register(&mut self, section: &str, factory: ExtensionFactory) {
        self.coordinator
            .register(&mut self.host, "tests", section, factory, self.now);
    }

    fn needed(&mut self) -> u32 {
        self.coordinator
            .status(&mut self.host, self.partition.id, false, self.now)
            .unwrap()
            .needed
    }

    fn is_forcing(&self) -> bool {
        self.coordinator
            .state(self.partition.id)
            .unwrap()
            .is_forcing()
    }
}

/// Records every event it observes.
struct Recorder {
    events: Arc<Mutex<Vec<SleepEvent>>>,
}

impl Extension for Recorder {
    fn observe(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn recorder(events: &Arc<Mutex<Vec<SleepEvent>>>) -> ExtensionFactory {
    let events = Arc::clone(events);
    Box::new(move |_setup| {
        Ok(Box::new(Recorder {
            events: Arc::clone(&events),
        }) as Box<dyn Extension>)
    })
}

fn forced_count(events: &Arc<Mutex<Vec<SleepEvent>>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SleepEvent::ForcedAdvance { .. }))
        .count()
}

#[test]
fn scenario_a_count_threshold_forces_once() {
    let yaml = "defaults:\n  force_count: 3\n  force_percent: -1\n  extensions:\n    recorder:\n      enabled: true\n";
    let mut w = World::new(yaml, 5);
    let events = Arc::new(Mutex::new(Vec::new()));
    w.register("recorder", recorder(&events));

    w.rest(0);
    assert_eq!(w.needed(), 2);
    w.rest(1);
    assert_eq!(w.needed(), 1);
    assert_eq!(forced_count(&events), 0);
    w.rest(2);
    assert!(w.is_forcing());
    assert_eq!(forced_count(&events), 1);

    // A fourth resting participant does not force again.
    w.rest(3);
    assert_eq!(forced_count(&events), 1);
    assert!(w.host.is_rest_ignored(w.member(4).id));

    let forced_announcements = w
        .host
        .outbox()
        .iter()
        .filter(|d| d.text.contains("advancing the night"))
        .count();
    assert_eq!(forced_announcements, 1);
}

#[test]
fn scenario_b_percent_threshold() {
    let mut w = World::new("defaults:\n  force_count: -1\n  force_percent: 50\n", 6);
    w.rest(0);
    w.rest(1);
    assert_eq!(w.needed(), 1);
    assert!(!w.is_forcing());
    w.rest(2);
    assert!(w.is_forcing());
}

#[test]
fn scenario_c_cooldown_delivers_once() {
    let yaml = r"
defaults:
  force_count: 5
  notifications:
    rest_entered:
      max_frequency: 10
";
    let mut w = World::new(yaml, 5);
    w.rest(0);
    w.wake(0);
    w.now += TimeDelta::seconds(5);
    w.rest(0);
    let entered = w
        .host
        .outbox()
        .iter()
        .filter(|d| d.text.starts_with("p0 is resting"))
        .count();
    assert_eq!(entered, 1);

    w.wake(0);
    w.now += TimeDelta::seconds(10);
    w.rest(0);
    let entered = w
        .host
        .outbox()
        .iter()
        .filter(|d| d.text.starts_with("p0 is resting"))
        .count();
    assert_eq!(entered, 2);
}

#[test]
fn scenario_d_never_observed_is_inactive() {
    let mut host = InMemoryHost::new();
    let partition = host.add_partition("world", NIGHT);
    let mut coordinator = Coordinator::new(
        SomnusConfig::parse("defaults:\n  inactivity_limit_seconds: 300\n").unwrap(),
    );
    let now = Utc::now();
    coordinator.load(&mut host, &partition, now).unwrap();

    // Appears in the host without a join event reaching the coordinator.
    host.add_participant(partition.id, "ghost");
    let report = coordinator
        .status(&mut host, partition.id, false, now)
        .unwrap();
    assert_eq!(report.possible, 0);

    let regular = host.add_participant(partition.id, "regular");
    coordinator
        .handle(
            &mut host,
            HostEvent::ParticipantJoined {
                partition: partition.id,
                participant: regular,
            },
            now,
        )
        .unwrap();
    let report = coordinator
        .status(&mut host, partition.id, false, now)
        .unwrap();
    assert_eq!(report.possible, 1);
}

struct Inert;

impl Extension for Inert {}

#[test]
fn scenario_e_faulty_construction_is_isolated() {
    let yaml = r"
defaults:
  extensions:
    first:
      enabled: true
    broken:
      enabled: true
    last:
      enabled: true
";
    let mut w = World::new(yaml, 2);
    w.register(
        "first",
        Box::new(|_setup| Ok(Box::new(Inert) as Box<dyn Extension>)),
    );
    w.register(
        "broken",
        Box::new(|_setup| {
            Err(ExtensionError::Unsupported {
                reason: "host too old".to_owned(),
            })
        }),
    );
    w.register(
        "last",
        Box::new(|_setup| Ok(Box::new(Inert) as Box<dyn Extension>)),
    );
    assert_eq!(
        w.coordinator.live_extensions(w.partition.id),
        vec!["first".to_owned(), "last".to_owned()]
    );

    // A second partition loaded afterwards gets the same treatment.
    let nether = w.host.add_partition("nether", NIGHT);
    w.send(HostEvent::PartitionLoaded(nether.clone()));
    assert_eq!(w.coordinator.live_extensions(nether.id).len(), 2);
}

#[test]
fn scenario_f_awaken_keeps_explicit_exemptions() {
    let yaml = r"
defaults:
  inactivity_limit_seconds: 300
  always_exempt: [p0]
";
    let mut w = World::new(yaml, 3);
    let always = w.member(0);
    let idle = w.member(1);
    w.now += TimeDelta::seconds(600);
    let fired = w.coordinator.tick(&mut w.host, w.now);
    assert_eq!(fired, 1);
    let state = w.coordinator.state(w.partition.id).unwrap();
    assert_eq!(state.exemption(idle.id), Some(ExemptReason::Inactivity));
    assert_eq!(state.exemption(always.id), Some(ExemptReason::AlwaysExempt));
    assert!(state.resting().is_empty());
    assert!(!state.is_forcing());

    // Resting and getting up with nobody else resting ends the cycle.
    w.rest(2);
    w.wake(2);
    assert!(w.host.is_rest_ignored(always.id));
    assert!(!w.host.is_rest_ignored(idle.id));
}

#[test]
fn join_then_leave_leaves_no_trace() {
    let yaml = "defaults:\n  notifications:\n    rest_entered:\n      max_frequency: 60\n";
    let mut w = World::new(yaml, 3);
    let newcomer = w.host.add_participant(w.partition.id, "newcomer");
    w.send(HostEvent::ParticipantJoined {
        partition: w.partition.id,
        participant: newcomer.clone(),
    });
    w.host.set_resting(newcomer.id, true);
    w.send(HostEvent::RestEntered {
        partition: w.partition.id,
        participant: newcomer.clone(),
    });
    assert!(w.coordinator.state(w.partition.id).unwrap().tracks(newcomer.id));

    w.host.disconnect(newcomer.id);
    w.send(HostEvent::ParticipantLeft {
        partition: w.partition.id,
        participant: newcomer.clone(),
    });
    assert!(!w.coordinator.state(w.partition.id).unwrap().tracks(newcomer.id));
}

#[test]
fn admin_exempt_twice_flips_once() {
    let mut w = World::new("", 2);
    let target = w.member(0).id;
    let before = w.host.flag_writes();
    let first = w
        .coordinator
        .exempt(&mut w.host, w.partition.id, target, true, w.now)
        .unwrap();
    let second = w
        .coordinator
        .exempt(&mut w.host, w.partition.id, target, true, w.now)
        .unwrap();
    assert!(first);
    assert!(!second);
    assert_eq!(w.host.flag_writes(), before.saturating_add(1));
}

#[test]
fn morning_wake_completes_the_cycle() {
    let yaml = "defaults:\n  force_count: 1\n  extensions:\n    recorder:\n      enabled: true\n";
    let mut w = World::new(yaml, 3);
    let events = Arc::new(Mutex::new(Vec::new()));
    w.register("recorder", recorder(&events));

    w.rest(0);
    assert!(w.is_forcing());
    assert!(w.host.native_skip_ready(w.partition.id));

    w.host.set_partition_time(w.partition.id, MORNING);
    w.wake(0);
    assert!(!w.is_forcing());
    assert!(!w.host.is_rest_ignored(w.member(1).id));

    let recorded = events.lock().unwrap();
    assert!(recorded.iter().any(|e| matches!(
        e,
        SleepEvent::RestCompleted { participation, .. }
            if participation.resting == 1 && participation.possible == 3
    )));
    assert!(recorded.contains(&SleepEvent::Awakened));
}

#[test]
fn awaken_clears_automatic_exemptions_in_default_partition() {
    let yaml = "global:\n  default_exempt_partition: lobby\ndefaults:\n  force_count: 1\n";
    let mut w = World::new(yaml, 1);
    let lobby = w.host.add_partition("lobby", NIGHT);
    let waiting = w.host.add_participant(lobby.id, "waiting");
    w.send(HostEvent::PartitionLoaded(lobby.clone()));
    assert_eq!(
        w.coordinator.state(lobby.id).unwrap().exemption(waiting.id),
        Some(ExemptReason::DefaultPartition)
    );

    w.rest(0);
    w.host.set_partition_time(w.partition.id, MORNING);
    w.wake(0);
    // The standing exemption of the waiting room survives the awaken.
    assert!(w.host.is_rest_ignored(waiting.id));
}

#[test]
fn moving_partitions_carries_no_exemption() {
    let yaml = "global:\n  default_exempt_partition: lobby\n";
    let mut w = World::new(yaml, 1);
    let lobby = w.host.add_partition("lobby", NIGHT);
    let traveller = w.host.add_participant(lobby.id, "traveller");
    w.send(HostEvent::PartitionLoaded(lobby.clone()));
    assert!(w.host.is_rest_ignored(traveller.id));

    w.host.move_participant(traveller.id, w.partition.id);
    w.send(HostEvent::ParticipantChangedPartition {
        from: lobby.id,
        to: w.partition.id,
        participant: traveller.clone(),
    });
    assert!(!w.host.is_rest_ignored(traveller.id));
    assert_eq!(
        w.coordinator.state(w.partition.id).unwrap().exemption(traveller.id),
        None
    );
}

/// Vetoes every forced advance.
struct Vetoer;

impl Extension for Vetoer {
    fn review(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        transition: &Transition,
    ) -> Result<Verdict, ExtensionError> {
        Ok(match transition {
            Transition::ForcedAdvance(_) => Verdict::Veto,
            Transition::Exempt { .. } => Verdict::Accept,
        })
    }
}

#[test]
fn vetoed_force_leaves_state_untouched() {
    let yaml = "defaults:\n  force_count: 1\n  extensions:\n    veto:\n      enabled: true\n";
    let mut w = World::new(yaml, 2);
    w.register(
        "veto",
        Box::new(|_setup| Ok(Box::new(Vetoer) as Box<dyn Extension>)),
    );
    w.rest(0);
    assert!(!w.is_forcing());
    assert!(!w.host.is_rest_ignored(w.member(1).id));

    let forcer = w.member(0);
    assert!(
        w.coordinator
            .force(&mut w.host, w.partition.id, Some(forcer), false, w.now)
            .is_ok()
    );
    assert!(!w.is_forcing());
}

/// Lowers `needed` to zero, then tries to raise it.
struct Rewriter {
    raise: bool,
}

impl Extension for Rewriter {
    fn filter(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        announcement: &mut Announcement,
    ) -> Result<Verdict, ExtensionError> {
        if announcement.kind == NotificationKind::RestEntered {
            announcement.needed = if self.raise { 99 } else { 0 };
        }
        Ok(Verdict::Accept)
    }
}

#[test]
fn filters_may_lower_but_not_raise_needed() {
    let yaml = r"
defaults:
  force_count: 4
  notifications:
    rest_entered:
      format: '{{ needed }}'
  extensions:
    display:
      enabled: true
";
    let mut w = World::new(yaml, 5);
    w.register(
        "display",
        Box::new(|setup| {
            let raise = setup
                .section
                .params
                .get("raise")
                .and_then(serde_yml::Value::as_bool)
                .unwrap_or(false);
            Ok(Box::new(Rewriter { raise }) as Box<dyn Extension>)
        }),
    );
    w.rest(0);
    assert_eq!(w.host.outbox().last().map(|d| d.text.as_str()), Some("0"));
    // The authoritative threshold is unchanged.
    assert_eq!(w.needed(), 3);

    w.coordinator.deregister(&mut w.host, "tests", w.now);
    w.register(
        "display",
        Box::new(|_setup| Ok(Box::new(Rewriter { raise: true }) as Box<dyn Extension>)),
    );
    w.rest(1);
    assert_eq!(w.host.outbox().last().map(|d| d.text.as_str()), Some("2"));
}

/// Arms a timer on load and fails to unload.
struct Stubborn;

impl Extension for Stubborn {
    fn load(&mut self, ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        ctx.timers
            .every(TimerScope::Partition, "pulse", TimeDelta::seconds(1));
        Ok(())
    }

    fn unload(&mut self, _ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        Err(ExtensionError::Failed {
            reason: "cannot let go".to_owned(),
        })
    }
}

#[test]
fn failed_teardown_still_removes_instance_and_timers() {
    let yaml = "defaults:\n  extensions:\n    stubborn:\n      enabled: true\n";
    let mut w = World::new(yaml, 1);
    w.register(
        "stubborn",
        Box::new(|_setup| Ok(Box::new(Stubborn) as Box<dyn Extension>)),
    );
    assert_eq!(w.coordinator.scheduler().len(), 1);

    let unloaded = w.coordinator.deregister(&mut w.host, "tests", w.now);
    assert_eq!(unloaded, 1);
    assert!(w.coordinator.live_extensions(w.partition.id).is_empty());
    assert!(w.coordinator.scheduler().is_empty());
}

#[test]
fn unload_and_reset_rebuild_state() {
    let yaml = "defaults:\n  extensions:\n    stubborn:\n      enabled: true\n";
    let mut w = World::new(yaml, 2);
    w.register(
        "stubborn",
        Box::new(|_setup| Ok(Box::new(Stubborn) as Box<dyn Extension>)),
    );
    w.rest(0);

    w.coordinator.reset(&mut w.host, w.now);
    let state = w.coordinator.state(w.partition.id).unwrap();
    assert!(state.is_resting(w.member(0).id));
    assert_eq!(state.resting().len(), 1);
    assert_eq!(w.coordinator.live_extensions(w.partition.id).len(), 1);
    assert_eq!(w.coordinator.scheduler().len(), 1);

    w.send(HostEvent::PartitionUnloaded(w.partition.id));
    assert!(!w.coordinator.is_loaded(w.partition.id));
    assert!(w.coordinator.scheduler().is_empty());

    w.coordinator.reset(&mut w.host, w.now);
    w.coordinator.shutdown(&mut w.host, w.now);
    assert!(w.coordinator.loaded().is_empty());
}

#[test]
fn status_broadcast_reaches_partition() {
    let mut w = World::new("defaults:\n  force_count: 2\n", 3);
    w.rest(0);
    let report = w
        .coordinator
        .status(&mut w.host, w.partition.id, true, w.now)
        .unwrap();
    assert_eq!((report.needed, report.resting, report.possible), (1, 1, 3));
    let last = w.host.outbox().last().unwrap();
    assert_eq!(last.target, Delivery::Partition(w.partition.id));
    assert!(last.text.contains("1/3"));
}

#[test]
fn reset_mid_night_keeps_counting_beds() {
    let mut w = World::new("defaults:\n  force_count: 3\n  force_percent: -1\n", 5);
    w.rest(0);
    w.rest(1);

    w.coordinator.reset(&mut w.host, w.now);
    assert_eq!(w.needed(), 1);
    assert_eq!(
        w.coordinator.state(w.partition.id).unwrap().resting().len(),
        2
    );

    w.rest(2);
    assert!(w.is_forcing());
}

#[test]
fn reload_after_beds_fill_advances_at_once() {
    let mut w = World::new("defaults:\n  force_count: 2\n  force_percent: -1\n", 4);
    for i in 0..2 {
        let p = w.member(i);
        w.host.set_resting(p.id, true);
    }
    w.coordinator.reset(&mut w.host, w.now);
    assert!(w.is_forcing());
    assert!(w.host.is_rest_ignored(w.member(3).id));
}

#[test]
fn resters_counted_on_reload_complete_their_night() {
    let mut w = World::new("defaults:\n  force_count: 3\n  force_percent: -1\n", 3);
    w.rest(0);
    w.coordinator.reset(&mut w.host, w.now);
    assert!(w.coordinator.state(w.partition.id).unwrap().is_resting(w.member(0).id));
    assert_eq!(w.needed(), 2);

    w.wake(0);
    assert!(w.coordinator.state(w.partition.id).unwrap().resting().is_empty());
    assert_eq!(w.needed(), 1);
}

#[test]
fn admin_exemption_can_complete_the_night() {
    let mut w = World::new("defaults:\n  force_count: -1\n  force_percent: 100\n", 3);
    w.rest(0);
    w.rest(1);
    assert!(!w.is_forcing());

    let third = w.member(2).id;
    assert!(
        w.coordinator
            .exempt(&mut w.host, w.partition.id, third, true, w.now)
            .unwrap()
    );
    assert!(w.is_forcing());
}

#[test]
fn requested_advance_is_published_to_staff() {
    let mut w = World::new("defaults:\n  force_count: 3\n  force_percent: -1\n", 3);
    w.rest(0);
    let forcer = w.member(0);
    w.coordinator
        .force(&mut w.host, w.partition.id, Some(forcer), false, w.now)
        .unwrap();
    assert!(w.is_forcing());
    let staff = Delivery::Permission(NOTIFY_PERMISSION.to_owned());
    let notice = w.host.outbox().iter().find(|d| d.target == staff).unwrap();
    assert!(notice.text.contains("p0"));
}
