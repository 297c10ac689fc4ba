use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use pretty_assertions::{assert_eq, assert_ne};
use saltgraph::{
    Algorithm, BuildError, DateInterval, Descriptor, Fingerprint, Outcome, Requires, Runner,
    SaltedVersions, Settings, TargetSpec, Task, TaskGraph, TaskId, salted_target, salted_version,
};

fn fp(task: Descriptor) -> Fingerprint {
    salted_version(task.shared()).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 3, d).unwrap()
}

fn stream(date: NaiveDate, version: &'static str) -> Descriptor {
    Descriptor::new("Stream", version)
        .significant("date", date)
        .output(TargetSpec::new("stream/{date}-{salt}.tsv"))
}

/// Aggregate over the week of `date`, with one stream pinned to `bumped`.
fn aggregate(date: NaiveDate, bumped: Option<(NaiveDate, &'static str)>) -> Descriptor {
    let week = DateInterval::week_of(date).unwrap();
    let streams = week.dates().map(|d| match bumped {
        Some((b, version)) if b == d => Requires::task(stream(d, version)),
        _ => Requires::task(stream(d, "1.0")),
    });

    Descriptor::new("AggregateArtists", "1.2")
        .significant("date_interval", week)
        .insignificant("workers", 4)
        .requires(Requires::seq(streams))
        .output(TargetSpec::new("artist_streams_{date_interval}-{salt}.tsv"))
}

fn scratch() -> (tempfile::TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, Settings::default().root(root))
}

#[test]
fn deterministic_across_instances() {
    let a = aggregate(day(7), None);
    let b = aggregate(day(7), None);
    assert_eq!(fp(a.clone()), fp(b));
    assert_eq!(fp(a.clone()), fp(a));
}

#[test]
fn sensitive_to_version_and_significant_params_only() {
    let base = Descriptor::new("SVC", "1.0")
        .significant("c", 100.0)
        .significant("kernel", "rbf")
        .insignificant("n_jobs", 4);

    let bumped = Descriptor::new("SVC", "1.1")
        .significant("c", 100.0)
        .significant("kernel", "rbf")
        .insignificant("n_jobs", 4);

    let retuned = Descriptor::new("SVC", "1.0")
        .significant("c", 10.0)
        .significant("kernel", "rbf")
        .insignificant("n_jobs", 4);

    let more_jobs = Descriptor::new("SVC", "1.0")
        .significant("c", 100.0)
        .significant("kernel", "rbf")
        .insignificant("n_jobs", 32);

    assert_ne!(fp(base.clone()), fp(bumped));
    assert_ne!(fp(base.clone()), fp(retuned));
    assert_eq!(fp(base), fp(more_jobs));
}

#[test]
fn dependency_order_matters() {
    let a = || Requires::task(Descriptor::new("A", "1"));
    let b = || Requires::task(Descriptor::new("B", "1"));

    let ab = Descriptor::new("Top", "1").requires(Requires::seq([a(), b()]));
    let ba = Descriptor::new("Top", "1").requires(Requires::seq([b(), a()]));
    assert_ne!(fp(ab), fp(ba));

    let keyed_ab = Descriptor::new("Top", "1").requires(Requires::keyed([("a", a()), ("b", b())]));
    let keyed_ba = Descriptor::new("Top", "1").requires(Requires::keyed([("b", b()), ("a", a())]));
    assert_eq!(fp(keyed_ab), fp(keyed_ba));
}

#[test]
fn weekly_bump_only_touches_its_lineage() {
    let before = aggregate(day(7), None).shared();
    let after = aggregate(day(7), Some((day(6), "1.1"))).shared();

    let graph_before = TaskGraph::assemble([before]).unwrap();
    let graph_after = TaskGraph::assemble([after]).unwrap();
    let mut v_before = SaltedVersions::new(&graph_before, Algorithm::Sha256);
    let mut v_after = SaltedVersions::new(&graph_after, Algorithm::Sha256);

    // week of 2018-03-07 is 2018-W10, Monday the 5th through Sunday the 11th
    assert_eq!(graph_before.len(), 8);
    let agg = TaskId::new(r#"AggregateArtists,1.2,date_interval=2018-W10"#);

    assert_ne!(
        v_before.get_by_id(&agg).unwrap(),
        v_after.get_by_id(&agg).unwrap()
    );

    for d in 5..=11 {
        let id = TaskId::of(&stream(day(d), "1.0")).unwrap();
        if d == 6 {
            assert!(v_after.get_by_id(&id).unwrap().is_none());
            let bumped = TaskId::of(&stream(day(d), "1.1")).unwrap();
            assert_ne!(
                v_before.get_by_id(&id).unwrap(),
                v_after.get_by_id(&bumped).unwrap()
            );
        } else {
            assert_eq!(
                v_before.get_by_id(&id).unwrap(),
                v_after.get_by_id(&id).unwrap()
            );
        }
    }
}

#[test]
fn insignificant_parameter_keeps_target() {
    let (_dir, settings) = scratch();
    let four = aggregate(day(7), None).shared();
    let eight = aggregate(day(7), None).insignificant("workers", 8).shared();

    let four = salted_target(&four, &settings).unwrap().unwrap();
    let eight = salted_target(&eight, &settings).unwrap().unwrap();
    assert_eq!(four.path(), eight.path());
    assert!(four.path().as_str().contains("artist_streams_2018-W10-"));
}

#[test]
fn full_digest_kept_alongside_salt() {
    let (_dir, settings) = scratch();
    let task = aggregate(day(7), None).shared();
    let target = salted_target(&task, &settings).unwrap().unwrap();

    assert_eq!(target.salt().len(), 6);
    assert_eq!(target.fingerprint(), salted_version(task).unwrap());
    assert!(target.fingerprint().to_hex().starts_with(target.salt()));
    assert!(target.path().as_str().ends_with(&format!("-{}.tsv", target.salt())));
}

#[test]
fn algorithm_is_configurable() {
    let (_dir, settings) = scratch();
    let task = stream(day(5), "1.0").shared();

    let sha = salted_target(&task, &settings).unwrap().unwrap();
    let blake = salted_target(&task, &settings.clone().algorithm(Algorithm::Blake3))
        .unwrap()
        .unwrap();
    assert_ne!(sha.fingerprint(), blake.fingerprint());
}

fn counting(task: Descriptor, runs: &Arc<AtomicUsize>) -> Descriptor {
    let runs = runs.clone();
    task.work(move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        ctx.target()?
            .write_with(|file| file.write_all(ctx.id().as_str().as_bytes()))?;
        Ok(())
    })
}

#[test]
fn gate_skips_cached_and_reruns_changed_lineage() {
    let (_dir, settings) = scratch();
    let runs = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new(settings);

    let build = |bump: Option<&'static str>| {
        let week = DateInterval::week_of(day(7)).unwrap();
        let streams = week.dates().map(|d| {
            let version = match bump {
                Some(v) if d == day(6) => v,
                _ => "1.0",
            };
            Requires::task(counting(stream(d, version), &runs))
        });
        let agg = Descriptor::new("AggregateArtists", "1.2")
            .significant("date_interval", week)
            .requires(Requires::seq(streams))
            .output(TargetSpec::new("artist_streams_{date_interval}-{salt}.tsv"));
        runner.build([counting(agg, &runs).shared()]).unwrap()
    };

    build(None);
    assert_eq!(runs.load(Ordering::SeqCst), 8);

    let report = build(None);
    assert_eq!(runs.load(Ordering::SeqCst), 8);
    assert_eq!(report.cached().count(), 1);

    // one stream changes: it and the aggregate run, the other six are cached
    let report = build(Some("1.1"));
    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(report.executed().count(), 2);
    assert_eq!(report.cached().count(), 6);
}

#[test]
fn partitions_by_insignificant_parameter_all_run() {
    let (_dir, settings) = scratch();
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let days = (1..=7).map(|day| {
        Requires::task(counting(
            Descriptor::new("Stream", "1")
                .insignificant("day", day)
                .output(TargetSpec::new("stream/{day}-{salt}.tsv")),
            &runs,
        ))
    });
    let agg = Descriptor::new("Agg", "1")
        .requires(Requires::seq(days))
        .work(move |ctx| {
            for input in ctx.inputs().iter().flatten() {
                let name = input.path().file_name().unwrap_or_default();
                sink.lock().unwrap().push(name.to_string());
            }
            Ok(())
        });

    let report = Runner::new(settings).build([agg.shared()]).unwrap();
    assert_eq!(report.entries().len(), 8);
    assert_eq!(runs.load(Ordering::SeqCst), 7);

    let seen = seen.lock().unwrap();
    let distinct: HashSet<_> = seen.iter().collect();
    assert_eq!(seen.len(), 7);
    assert_eq!(distinct.len(), 7);
    assert!(seen[0].starts_with("1-"));
    assert!(seen[6].starts_with("7-"));
}

#[test]
fn shared_identity_keeps_each_lineage() {
    let (_dir, settings) = scratch();
    let runs = Arc::new(AtomicUsize::new(0));

    let mid = |dep: &'static str| {
        let upstream = Descriptor::new(dep, "1").output(TargetSpec::new("{kind}-{salt}"));
        let mid = Descriptor::new("Mid", "1")
            .requires(Requires::task(counting(upstream, &runs)))
            .output(TargetSpec::new("mid-{salt}"));
        counting(mid, &runs).shared()
    };

    let report = Runner::new(settings).build([mid("A"), mid("B")]).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 4);

    let mids: Vec<_> = report
        .entries()
        .iter()
        .filter(|entry| entry.id.as_str() == "Mid,1")
        .collect();
    assert_eq!(mids.len(), 2);
    assert_ne!(mids[0].fingerprint, mids[1].fingerprint);
    assert_ne!(mids[0].target, mids[1].target);
}

#[test]
fn failed_task_leaves_no_artifact() {
    let (_dir, settings) = scratch();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let flaky = Descriptor::new("Flaky", "1")
        .output(TargetSpec::new("flaky-{salt}.txt"))
        .work(move |ctx| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            ctx.target()?.write_with(|file| -> anyhow::Result<()> {
                file.write_all(b"half of it")?;
                anyhow::ensure!(attempt > 0, "interrupted");
                file.write_all(b" and the rest")?;
                Ok(())
            })
        });

    let runner = Runner::new(settings.clone());
    let target = salted_target(&flaky.clone().shared(), &settings)
        .unwrap()
        .unwrap();

    assert!(matches!(
        runner.build([flaky.clone().shared()]),
        Err(BuildError::Task(..))
    ));
    assert!(!target.exists());

    let report = runner.build([flaky.shared()]).unwrap();
    assert!(matches!(
        report.entries()[0].outcome,
        Outcome::Executed { .. }
    ));
    assert_eq!(target.read_to_string().unwrap(), "half of it and the rest");
}

#[test]
fn diamond_is_hashed_once() {
    struct Counted(Arc<AtomicUsize>);

    impl Task for Counted {
        fn kind(&self) -> &str {
            "Base"
        }

        fn code_version(&self) -> &str {
            "1"
        }

        fn params(&self) -> saltgraph::Params {
            self.0.fetch_add(1, Ordering::SeqCst);
            saltgraph::Params::new()
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let base: Arc<dyn Task> = Arc::new(Counted(calls.clone()));
    let top = Descriptor::new("Top", "1").requires(Requires::seq([
        Requires::task(Descriptor::new("L", "1").requires(Requires::shared(base.clone()))),
        Requires::task(Descriptor::new("R", "1").requires(Requires::shared(base))),
    ]));

    let graph = TaskGraph::assemble([top.shared()]).unwrap();
    let before = calls.load(Ordering::SeqCst);
    let versions = SaltedVersions::new(&graph, Algorithm::Sha256).all();

    assert_eq!(versions.len(), 4);
    // fingerprinting reads the identity captured at assembly
    assert_eq!(calls.load(Ordering::SeqCst), before);
}
