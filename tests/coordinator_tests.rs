//! Scheduler-side recovery coordinator tests.
//!
//! These run the coordinator directly with synthetic `Instant`s, so every
//! timeout is deterministic.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

use fleet_rm::bus::envelope::PeerIdentity;
use fleet_rm::bus::transport::TransportError;
use fleet_rm::config::JobLimits;
use fleet_rm::error::FleetError;
use fleet_rm::job::{AppSpec, DaemonState, JobId, JobSpec, JobState, NodeState, ProcessName, ProcessState};
use fleet_rm::presence::{NodeInfo, Presence, Role};
use fleet_rm::protocol::{ProcUpdate, StateReport};
use fleet_rm::scheduler::coordinator::{Outbound, RecoveryCoordinator};
use fleet_rm::scheduler::mapper::LeastLoadedMapper;
use fleet_rm::status::ClusterStatus;

const D1: PeerIdentity = PeerIdentity::new(1, 2);
const D2: PeerIdentity = PeerIdentity::new(1, 3);
const D3: PeerIdentity = PeerIdentity::new(1, 4);

fn coordinator() -> RecoveryCoordinator {
    RecoveryCoordinator::new(Box::new(LeastLoadedMapper), 100, Duration::from_secs(5))
}

fn presence(node: &str, slots: u32) -> Presence {
    Presence {
        instance: Uuid::new_v4(),
        role: Role::Daemon,
        user: "ops".into(),
        node: NodeInfo::new(node, slots),
        contact: None,
    }
}

fn job(name: &str, procs: u32, max_restarts: i32) -> JobSpec {
    JobSpec::new(
        name,
        vec![AppSpec::new("worker", vec!["worker".into()], procs).with_restarts(max_restarts, 0)],
    )
}

fn ms(base: Instant, millis: u64) -> Instant {
    base + Duration::from_millis(millis)
}

/// Report every process `daemon` hosts for `job` as running.
fn report_running(c: &mut RecoveryCoordinator, daemon: PeerIdentity, job: JobId, now: Instant) -> Vec<Outbound> {
    let updates = c.state().jobs[&job]
        .ranks_on(daemon)
        .into_iter()
        .map(|rank| {
            let mut update = ProcUpdate::new(ProcessName::new(job, rank), ProcessState::Running);
            update.pid = Some(1000 + rank);
            update
        })
        .collect();
    c.on_state_report(&StateReport { daemon, updates }, now)
}

fn report(c: &mut RecoveryCoordinator, daemon: PeerIdentity, update: ProcUpdate, now: Instant) -> Vec<Outbound> {
    c.on_state_report(
        &StateReport {
            daemon,
            updates: vec![update],
        },
        now,
    )
}

fn launches(out: &[Outbound]) -> Vec<(u32, PeerIdentity)> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Launch(instr) => Some(instr.procs.iter().map(|p| (p.rank, p.daemon)).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// D1 hosts both ranks of a running job, D2 joins afterwards.
fn job_on_first_daemon(c: &mut RecoveryCoordinator, t0: Instant, max_restarts: i32) -> JobId {
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("solver", 2, max_restarts)).unwrap();
    let out = c.launch_pending(t0);
    assert_eq!(launches(&out), vec![(0, D1), (1, D1)]);
    report_running(c, D1, id, t0);
    c.register_daemon(D2, &presence("n2", 4), t0);
    id
}

#[test]
fn test_heartbeat_loss_remaps_to_survivor() {
    let mut c = coordinator();
    let t0 = Instant::now();
    let id = job_on_first_daemon(&mut c, t0, 0);

    assert!(c.on_heartbeat(D2, ms(t0, 200)));
    let out = c.check_heartbeats(ms(t0, 250));

    let notice = out
        .iter()
        .find_map(|o| match o {
            Outbound::FailureNotice(n) => Some(n),
            _ => None,
        })
        .expect("failure notice");
    assert_eq!(notice.daemon, Some(D1));
    assert_eq!(notice.procs, vec![ProcessName::new(id, 0), ProcessName::new(id, 1)]);
    assert_eq!(launches(&out), vec![(0, D2), (1, D2)]);

    let state = c.state();
    assert_eq!(state.daemons[&D1].state, DaemonState::Down);
    assert_eq!(state.nodes["n1"].state, NodeState::Down);
    assert_eq!(state.jobs[&id].state, JobState::Relaunching);

    report_running(&mut c, D2, id, ms(t0, 260));
    let status = ClusterStatus::from_state(c.state(), true);
    let view = status.job(id).unwrap();
    assert_eq!(view.state, JobState::Running);
    for proc in &view.procs {
        assert_eq!(proc.restarts, 1);
        assert_eq!(proc.daemon, Some(D2));
        assert_eq!(proc.node.as_deref(), Some("n2"));
        assert_eq!(proc.state, ProcessState::Running);
    }
}

#[test]
fn test_heartbeat_timeout_is_idempotent() {
    let mut c = coordinator();
    let t0 = Instant::now();
    job_on_first_daemon(&mut c, t0, 0);

    let first = c.on_heartbeat_timeout(D1, ms(t0, 300));
    assert_eq!(first.len(), 1);
    let snapshot = c.state().clone();

    assert!(c.on_heartbeat_timeout(D1, ms(t0, 300)).is_empty());
    assert_eq!(c.state(), &snapshot);
    assert_eq!(c.state().daemons[&D1].state, DaemonState::Recovering);

    // The sweep also ignores it from now on
    c.on_heartbeat(D2, ms(t0, 400));
    let out = c.check_heartbeats(ms(t0, 450));
    assert!(!out.iter().any(|o| matches!(o, Outbound::FailureNotice(_))));
}

#[test]
fn test_no_dual_hosting_after_recovery() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 0), t0);
    c.register_daemon(D2, &presence("n2", 0), t0);
    c.register_daemon(D3, &presence("n3", 0), t0);
    let a = c.submit(&job("a", 4, 0)).unwrap();
    let b = c.submit(&job("b", 3, 0)).unwrap();
    c.launch_pending(t0);
    for daemon in [D1, D2, D3] {
        report_running(&mut c, daemon, a, t0);
        report_running(&mut c, daemon, b, t0);
    }

    c.on_heartbeat(D2, ms(t0, 200));
    c.on_heartbeat(D3, ms(t0, 200));
    let out = c.check_heartbeats(ms(t0, 250));
    assert!(launches(&out).iter().all(|(_, d)| *d != D1));
    for daemon in [D2, D3] {
        report_running(&mut c, daemon, a, ms(t0, 260));
        report_running(&mut c, daemon, b, ms(t0, 260));
    }

    let state = c.state();
    let mut seen = BTreeSet::new();
    for job in state.jobs.values() {
        assert_eq!(job.state, JobState::Running);
        for proc in job.procs.values() {
            let host = proc.daemon.expect("every process has a host");
            assert_ne!(host, D1);
            assert!(seen.insert(proc.name));
        }
    }
    assert_eq!(seen.len(), 7);

    let hosted: Vec<ProcessName> = state.nodes.values().flat_map(|n| n.hosted.iter().copied()).collect();
    let unique: BTreeSet<ProcessName> = hosted.iter().copied().collect();
    assert_eq!(hosted.len(), unique.len());
    assert_eq!(unique, seen);
    assert!(state.nodes["n1"].hosted.is_empty());
}

#[test]
fn test_loss_without_survivors_marks_down() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("solo", 2, -1)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);

    let out = c.check_heartbeats(ms(t0, 250));
    assert!(launches(&out).is_empty());

    let state = c.state();
    assert_eq!(state.daemons[&D1].state, DaemonState::Down);
    assert!(state.jobs.is_empty());
    let finished = &state.finished[&id];
    assert_eq!(finished.state, JobState::Drained);
    assert!(finished.procs.values().all(|p| p.state == ProcessState::Down));
}

#[test]
fn test_recovery_disabled_job_goes_down_on_loss() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("fixed", 1, 5).with_recovery(false)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);
    c.register_daemon(D2, &presence("n2", 4), t0);

    let out = c.on_heartbeat_timeout(D1, ms(t0, 300));
    assert_eq!(out.len(), 1);
    assert_eq!(c.state().finished[&id].procs[&0].state, ProcessState::Down);
    assert_eq!(c.state().daemons[&D1].state, DaemonState::Down);
}

#[test]
fn test_restart_policy_is_charged_until_exhausted() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("retry", 1, 1)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);

    let mut exhausted = ProcUpdate::new(ProcessName::new(id, 0), ProcessState::Exhausted);
    exhausted.exit_code = Some(7);

    let out = report(&mut c, D1, exhausted.clone(), t0);
    assert_eq!(launches(&out), vec![(0, D1)]);
    let proc = &c.state().jobs[&id].procs[&0];
    assert_eq!(proc.charged_restarts, 1);
    assert_eq!(proc.restarts, 1);
    assert_eq!(proc.state, ProcessState::Launching);

    report_running(&mut c, D1, id, t0);
    let out = report(&mut c, D1, exhausted, t0);
    assert!(launches(&out).is_empty());

    let finished = &c.state().finished[&id];
    assert_eq!(finished.state, JobState::Drained);
    assert_eq!(finished.procs[&0].state, ProcessState::CannotRestart);
    assert_eq!(finished.procs[&0].exit_code, Some(7));
}

#[test]
fn test_unlimited_restarts_keep_relaunching() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("forever", 1, -1)).unwrap();
    c.launch_pending(t0);

    for round in 1..=5 {
        report_running(&mut c, D1, id, t0);
        let update = ProcUpdate::new(ProcessName::new(id, 0), ProcessState::Exhausted);
        let out = report(&mut c, D1, update, t0);
        assert_eq!(launches(&out).len(), 1, "round {}", round);
        assert_eq!(c.state().jobs[&id].procs[&0].charged_restarts, round);
    }
}

#[test]
fn test_late_launch_is_relaunched_uncharged() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("slow", 2, 0)).unwrap();
    c.launch_pending(t0);

    let update = ProcUpdate::new(ProcessName::new(id, 0), ProcessState::Running);
    report(&mut c, D1, update, ms(t0, 100));

    let later = ms(t0, 6_000);
    c.on_heartbeat(D1, later);
    let out = c.check_heartbeats(later);
    assert_eq!(launches(&out), vec![(1, D1)]);

    let job = &c.state().jobs[&id];
    assert_eq!(job.procs[&0].state, ProcessState::Running);
    assert_eq!(job.procs[&1].state, ProcessState::Launching);
    assert_eq!(job.procs[&1].restarts, 1);
    assert_eq!(job.procs[&1].charged_restarts, 0);
}

#[test]
fn test_unplaced_relaunch_waits_for_capacity() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 1), t0);
    c.register_daemon(D2, &presence("n2", 1), t0);
    let id = c.submit(&job("tight", 2, 0)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);
    report_running(&mut c, D2, id, t0);

    let out = c.on_heartbeat_timeout(D1, ms(t0, 300));
    let out_round = c.process_restart_candidates(ms(t0, 300));
    assert_eq!(out.len(), 1);
    assert!(launches(&out_round).is_empty());
    assert_eq!(c.state().jobs[&id].state, JobState::RestartCandidate);
    assert_eq!(c.state().jobs[&id].procs[&0].state, ProcessState::Restart);

    let out = c.register_daemon(D3, &presence("n3", 1), ms(t0, 400));
    assert_eq!(launches(&out), vec![(0, D3)]);
    assert_eq!(c.state().jobs[&id].state, JobState::Relaunching);
}

#[test]
fn test_pending_job_waits_for_room() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 1), t0);
    let id = c.submit(&job("wide", 2, 0)).unwrap();

    let out = c.launch_pending(t0);
    assert_eq!(launches(&out), vec![(0, D1)]);
    assert_eq!(c.state().jobs[&id].procs[&1].state, ProcessState::Pending);

    c.register_daemon(D2, &presence("n2", 1), t0);
    let out = c.launch_pending(t0);
    assert_eq!(launches(&out), vec![(1, D2)]);
}

#[test]
fn test_kill_removes_process_on_report() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("victim", 2, 3)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);

    let out = c.kill_job(id, Some(1)).unwrap();
    assert_eq!(out, vec![Outbound::Kill { job: id, rank: Some(1) }]);
    assert!(c.state().jobs[&id].procs.contains_key(&1));

    let mut killed = ProcUpdate::new(ProcessName::new(id, 1), ProcessState::Killed);
    killed.killed_by_command = true;
    let out = report(&mut c, D1, killed, t0);
    assert!(launches(&out).is_empty());
    assert!(!c.state().jobs[&id].procs.contains_key(&1));
    assert_eq!(c.state().jobs[&id].procs.len(), 1);
}

#[test]
fn test_update_for_settled_process_is_ignored() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("done", 2, 0)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);

    let mut done = ProcUpdate::new(ProcessName::new(id, 0), ProcessState::Terminated);
    done.exit_code = Some(0);
    report(&mut c, D1, done, t0);
    assert_eq!(c.state().jobs[&id].num_terminated, 1);

    let late = ProcUpdate::new(ProcessName::new(id, 0), ProcessState::Running);
    report(&mut c, D1, late, t0);
    let proc = &c.state().jobs[&id].procs[&0];
    assert_eq!(proc.state, ProcessState::Terminated);
    assert_eq!(c.state().jobs[&id].num_terminated, 1);
}

#[test]
fn test_same_instance_reannounce_keeps_daemon() {
    let mut c = coordinator();
    let t0 = Instant::now();
    let me = presence("n1", 4);
    c.register_daemon(D1, &me, t0);
    let id = c.submit(&job("steady", 1, 0)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);

    let mut again = me.clone();
    again.contact = Some("10.0.0.1:4000".into());
    let out = c.register_daemon(D1, &again, ms(t0, 50));
    assert!(out.is_empty());
    assert_eq!(c.state().daemons[&D1].contact.as_deref(), Some("10.0.0.1:4000"));
    assert_eq!(c.state().jobs[&id].procs[&0].restarts, 0);
}

#[test]
fn test_stray_heartbeat_repeats_failure_notice() {
    let mut c = coordinator();
    let t0 = Instant::now();
    let me = presence("n1", 4);
    c.register_daemon(D1, &me, t0);
    let id = c.submit(&job("stray", 1, 0)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);
    c.register_daemon(D2, &presence("n2", 4), t0);

    assert_eq!(c.on_heartbeat_timeout(D1, ms(t0, 300)).len(), 1);

    // The notice never arrived: the daemon keeps beating
    assert!(!c.on_heartbeat(D1, ms(t0, 350)));
    let out = c.on_stray_heartbeat(D1, ms(t0, 350));
    assert_eq!(out.len(), 1);
    let Outbound::FailureNotice(notice) = &out[0] else {
        panic!("expected a failure notice, got {:?}", out);
    };
    assert_eq!(notice.daemon, Some(D1));
    assert_eq!(notice.instance, Some(me.instance));

    // Not more than once per check period
    assert!(c.on_stray_heartbeat(D1, ms(t0, 400)).is_empty());
    assert_eq!(c.on_stray_heartbeat(D1, ms(t0, 560)).len(), 1);

    // Once it rejoins, its heartbeats are ordinary again
    c.register_daemon(D1, &me, ms(t0, 600));
    assert_eq!(c.state().daemons[&D1].state, DaemonState::Up);
    assert!(c.on_heartbeat(D1, ms(t0, 650)));
    assert!(c.on_stray_heartbeat(D1, ms(t0, 650)).is_empty());
}

#[test]
fn test_heartbeat_from_unknown_peer_is_not_answered() {
    let mut c = coordinator();
    assert!(c.on_stray_heartbeat(D3, Instant::now()).is_empty());
}

#[test]
fn test_launch_deadline_is_per_process() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 1), t0);
    let id = c.submit(&job("staggered", 2, 0)).unwrap();
    assert_eq!(launches(&c.launch_pending(t0)), vec![(0, D1)]);

    // Placing the second rank later must not extend the first one's deadline
    c.register_daemon(D2, &presence("n2", 1), ms(t0, 4_000));
    assert_eq!(launches(&c.launch_pending(ms(t0, 4_000))), vec![(1, D2)]);

    c.expire_launches(ms(t0, 5_100));
    let job = &c.state().jobs[&id];
    assert_eq!(job.procs[&0].state, ProcessState::Restart);
    assert_eq!(job.procs[&1].state, ProcessState::Launching);

    c.expire_launches(ms(t0, 9_100));
    assert_eq!(c.state().jobs[&id].procs[&1].state, ProcessState::Restart);
}

#[test]
fn test_local_restart_is_counted_on_the_daemon() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("flaky", 1, 0)).unwrap();
    c.launch_pending(t0);
    report_running(&mut c, D1, id, t0);
    let name = ProcessName::new(id, 0);

    let mut restarting = ProcUpdate::new(name, ProcessState::LocallyRestarting);
    restarting.local_restarts = 1;
    let mut running = ProcUpdate::new(name, ProcessState::Running);
    running.local_restarts = 1;
    running.pid = Some(4242);
    c.on_state_report(
        &StateReport {
            daemon: D1,
            updates: vec![restarting, running],
        },
        ms(t0, 10),
    );

    let job = &c.state().jobs[&id];
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.num_reported, 1);
    assert_eq!(job.procs[&0].local_restarts, 1);
    assert_eq!(job.procs[&0].pid, Some(4242));
    assert_eq!(c.state().daemons[&D1].usage.local_restarts, 1);
    assert_eq!(c.state().nodes["n1"].usage.local_restarts, 1);
}

#[test]
fn test_job_over_process_limit_is_rejected() {
    let mut c = coordinator().with_limits(JobLimits {
        max_procs_per_job: 10,
        ..JobLimits::default()
    });

    let err = c.submit(&job("too-big", 11, 0)).unwrap_err();
    assert!(matches!(err, FleetError::InvalidJob(_)));
    assert!(c.state().jobs.is_empty());

    let overflow = JobSpec::new(
        "overflow",
        vec![
            AppSpec::new("a", vec!["a".into()], u32::MAX),
            AppSpec::new("b", vec!["b".into()], 2),
        ],
    );
    assert!(matches!(c.submit(&overflow), Err(FleetError::InvalidJob(_))));

    // Rejections do not use up job ids
    assert_eq!(c.submit(&job("fits", 10, 0)).unwrap(), 1);
}

#[test]
fn test_large_job_launches_in_batches() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 1000), t0);
    c.register_daemon(D2, &presence("n2", 1000), t0);
    let id = c.submit(&job("wide", 1500, 0)).unwrap();

    let out = c.launch_pending(t0);
    assert_eq!(out.len(), 6);
    let ranks: BTreeSet<u32> = launches(&out).into_iter().map(|(rank, _)| rank).collect();
    assert_eq!(ranks, (0..1500).collect());
    for message in &out {
        let Outbound::Launch(instr) = message else {
            panic!("unexpected {:?}", message);
        };
        assert!(instr.procs.len() <= JobLimits::default().launch_batch);
    }

    report_running(&mut c, D1, id, t0);
    report_running(&mut c, D2, id, t0);
    let job = &c.state().jobs[&id];
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.num_reported, 1500);
}

#[test]
fn test_refused_launch_fails_its_processes() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.register_daemon(D1, &presence("n1", 4), t0);
    let id = c.submit(&job("unsendable", 2, 0)).unwrap();
    let out = c.launch_pending(t0);
    let Some(Outbound::Launch(instr)) = out.first() else {
        panic!("expected a launch, got {:?}", out);
    };

    let reason = FleetError::Transport(TransportError::TooLarge { size: 10, limit: 5 });
    c.on_launch_refused(instr, &reason);

    let job = &c.state().finished[&id];
    assert_eq!(job.state, JobState::Drained);
    assert!(job.procs.values().all(|p| p.state == ProcessState::FailedToStart));
    assert!(c.state().jobs.is_empty());
}

#[test]
fn test_finished_history_is_bounded() {
    let mut c = coordinator().with_limits(JobLimits {
        finished_retention: 2,
        ..JobLimits::default()
    });
    for n in 0..3 {
        let id = c.submit(&job(&format!("short-{}", n), 1, 0)).unwrap();
        c.kill_job(id, None).unwrap();
    }

    let kept: Vec<JobId> = c.state().finished.keys().copied().collect();
    assert_eq!(kept, vec![2, 3]);
}
