//! Parallel execution of a build plan.
//!
//! A fixed pool of worker threads takes package indices from a shared job
//! channel and reports each result on a completion channel. The
//! coordinating thread owns all bookkeeping: a package is dispatched only
//! once every dependency inside the plan has reported success, so a
//! dependency's database commit always happens-before its dependents start.

use crate::resolver::{BuildPlan, PlannedPackage};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Mutex};
use std::thread;
use tracing::{debug, warn};
use zeropkg_build::CancelFlag;

#[derive(Debug)]
pub struct ScheduleReport<E> {
    /// Packages whose task succeeded, in completion order.
    pub completed: Vec<String>,
    pub failed: Vec<(String, E)>,
    /// Packages not attempted because a dependency failed, with that
    /// dependency's name.
    pub skipped: Vec<(String, String)>,
    /// Packages never started because the run was cancelled.
    pub not_started: Vec<String>,
}

impl<E> ScheduleReport<E> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.not_started.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Done,
    Failed,
    Skipped(usize),
}

type Completion<E> = (usize, thread::Result<Result<(), E>>);

/// Run `task` for every package in `plan` on up to `workers` threads.
///
/// A failed task skips all of its transitive dependents; independent
/// packages keep going. Once `cancel` is raised nothing new is dispatched
/// and in-flight tasks are waited for. A panicking task is re-raised on
/// the calling thread after the pool has shut down.
pub fn run_plan<'a, F, E>(
    plan: &BuildPlan<'a>,
    workers: usize,
    cancel: &CancelFlag,
    task: F,
) -> ScheduleReport<E>
where
    F: Fn(&PlannedPackage<'a>) -> Result<(), E> + Sync,
    E: Send,
{
    let packages = plan.packages();
    let n = packages.len();
    let index: HashMap<&str, usize> = packages
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name(), i))
        .collect();

    let mut waiting_on = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, p) in packages.iter().enumerate() {
        for dep in &p.dependencies {
            if let Some(&d) = index.get(dep) {
                waiting_on[i] += 1;
                dependents[d].push(i);
            }
        }
    }
    // Lowest plan index first keeps dispatch order deterministic.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting_on[i] == 0).collect();
    let mut state = vec![State::Pending; n];
    let workers = workers.clamp(1, n.max(1));

    let (job_tx, job_rx) = mpsc::channel::<usize>();
    let job_rx = Mutex::new(job_rx);
    let (done_tx, done_rx) = mpsc::channel::<Completion<E>>();
    let task = &task;

    let mut report = ScheduleReport {
        completed: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        not_started: Vec::new(),
    };

    thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = &job_rx;
            let done_tx = done_tx.clone();
            s.spawn(move || loop {
                let next = match job_rx.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };
                let Ok(idx) = next else {
                    break;
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| task(&packages[idx])));
                if done_tx.send((idx, result)).is_err() {
                    break;
                }
            });
        }
        drop(done_tx);

        let mut in_flight = 0usize;
        loop {
            while in_flight < workers && !cancel.is_cancelled() {
                let Some(idx) = ready.pop_first() else {
                    break;
                };
                debug!("dispatching {}", packages[idx].name());
                state[idx] = State::Running;
                if job_tx.send(idx).is_err() {
                    break;
                }
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Ok((idx, result)) = done_rx.recv() else {
                break;
            };
            in_flight -= 1;
            match result {
                Ok(Ok(())) => {
                    state[idx] = State::Done;
                    report.completed.push(packages[idx].name().to_owned());
                    for &d in &dependents[idx] {
                        waiting_on[d] -= 1;
                        if waiting_on[d] == 0 && state[d] == State::Pending {
                            ready.insert(d);
                        }
                    }
                }
                Ok(Err(e)) => {
                    state[idx] = State::Failed;
                    report.failed.push((packages[idx].name().to_owned(), e));
                    let mut queue = dependents[idx].clone();
                    while let Some(d) = queue.pop() {
                        if state[d] == State::Pending {
                            state[d] = State::Skipped(idx);
                            ready.remove(&d);
                            queue.extend(dependents[d].iter().copied());
                        }
                    }
                }
                Err(payload) => {
                    drop(job_tx);
                    panic::resume_unwind(payload);
                }
            }
        }
        drop(job_tx);
    });

    for (i, st) in state.iter().enumerate() {
        match st {
            State::Skipped(cause) => {
                let name = packages[i].name().to_owned();
                warn!(
                    "{name}: skipped, dependency {} failed",
                    packages[*cause].name()
                );
                report
                    .skipped
                    .push((name, packages[*cause].name().to_owned()));
            }
            State::Pending => report.not_started.push(packages[i].name().to_owned()),
            State::Running | State::Done | State::Failed => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve, DependencyGraph, ResolveOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use zeropkg_schema::PortsTree;

    fn tree(recipes: &[(&str, &str)]) -> PortsTree {
        PortsTree::from_listing(recipes.iter().map(|(name, deps)| {
            (
                format!("{name}/recipe.toml"),
                format!("name = \"{name}\"\nversion = \"1\"\ndependencies = [{deps}]\n"),
            )
        }))
        .unwrap()
    }

    #[test]
    fn dependencies_finish_before_dependents_start() {
        let ports = tree(&[
            ("a", ""),
            ("b", "\"a\""),
            ("c", "\"a\""),
            ("d", "\"b\", \"c\""),
        ]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let plan = resolve(&["d"], &graph).unwrap();
        let finished = Mutex::new(Vec::new());

        let report = run_plan(&plan, 4, &CancelFlag::new(), |p| -> Result<(), String> {
            {
                let done = finished.lock().unwrap();
                for dep in &p.dependencies {
                    assert!(done.contains(&dep.to_string()), "{} before {dep}", p.name());
                }
            }
            thread::sleep(Duration::from_millis(20));
            finished.lock().unwrap().push(p.name().to_owned());
            Ok(())
        });
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 4);
        assert_eq!(report.completed.first().map(String::as_str), Some("a"));
        assert_eq!(report.completed.last().map(String::as_str), Some("d"));
    }

    #[test]
    fn independent_packages_run_in_parallel_up_to_the_limit() {
        let ports = tree(&[("a", ""), ("b", ""), ("c", ""), ("d", "")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let plan = resolve(&["a", "b", "c", "d"], &graph).unwrap();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let report = run_plan(&plan, 2, &CancelFlag::new(), |_| -> Result<(), String> {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(report.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn failure_skips_dependents_but_not_siblings() {
        let ports = tree(&[
            ("base", ""),
            ("broken", "\"base\""),
            ("app", "\"broken\""),
            ("tool", "\"app\""),
            ("other", "\"base\""),
        ]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let plan = resolve(&["tool", "other"], &graph).unwrap();

        let report = run_plan(&plan, 2, &CancelFlag::new(), |p| {
            if p.name() == "broken" {
                Err(format!("{} failed", p.name()))
            } else {
                Ok(())
            }
        });
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        let mut completed = report.completed.clone();
        completed.sort();
        assert_eq!(completed, vec!["base", "other"]);
        let mut skipped = report.skipped.clone();
        skipped.sort();
        assert_eq!(
            skipped,
            vec![
                ("app".to_owned(), "broken".to_owned()),
                ("tool".to_owned(), "broken".to_owned())
            ]
        );
        assert!(report.not_started.is_empty());
    }

    #[test]
    fn cancellation_stops_dispatch() {
        let ports = tree(&[("a", ""), ("b", ""), ("c", "")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let plan = resolve(&["a", "b", "c"], &graph).unwrap();
        let cancel = CancelFlag::new();

        let report = run_plan(&plan, 1, &cancel, |_| -> Result<(), String> {
            cancel.cancel();
            Ok(())
        });
        assert_eq!(report.completed, vec!["a"]);
        assert_eq!(report.not_started, vec!["b", "c"]);
        assert!(!report.is_success());
    }

    #[test]
    fn empty_plan_is_a_no_op() {
        let plan = BuildPlan::default();
        let report = run_plan(&plan, 4, &CancelFlag::new(), |_| -> Result<(), String> {
            unreachable!()
        });
        assert!(report.is_success());
        assert!(report.completed.is_empty());
    }
}
