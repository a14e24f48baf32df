//! Replay planner: builds the execution tree for a date range.
//!
//! Starting from the root job, the planner walks reverse dependency edges
//! (dependents) breadth-first, keeping only dependents whose namespace is
//! allowed, and enumerates each included job's scheduled instants inside
//! the range. Jobs reached over multiple paths collapse into one node with
//! the union of their runs; an edge back onto the current path is a cycle
//! and fails the plan.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use optimus_core::{
    enumerate_runs, notify, JobSpec, ProgressEvent, ProgressObserver, ProjectJobSpecStore,
    ProjectSpec,
};

use crate::models::ReplayError;
use crate::tree::{node_key, ExecutionTree, ExecutionTreeNode};

/// Planner output: the tree plus the dependents excluded by the namespace
/// allow-list, as full `project/job` names.
#[derive(Clone, Debug)]
pub struct ReplayPlan {
    pub tree: ExecutionTree,
    pub ignored: Vec<String>,
}

/// Wildcard namespace that disables downstream filtering.
pub const ALL_NAMESPACES: &str = "*";

pub struct ReplayPlanner {
    store: Arc<dyn ProjectJobSpecStore>,
}

impl ReplayPlanner {
    pub fn new(store: Arc<dyn ProjectJobSpecStore>) -> Self {
        Self { store }
    }

    /// Plans re-execution of `root_job` and its allowed dependents over the
    /// inclusive `[start, end]` range.
    pub async fn plan(
        &self,
        token: &CancellationToken,
        project: &ProjectSpec,
        root_job: &JobSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        allowed_namespaces: &BTreeSet<String>,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<ReplayPlan, ReplayError> {
        let root_key = node_key(&project.name, &root_job.name);
        let mut root = ExecutionTreeNode::new(&project.name, &root_job.name);
        root.runs = enumerate_runs(&root_job.schedule, start, end)?
            .into_iter()
            .collect();
        notify(
            observer,
            ProgressEvent::ReplayPlanNodeAdded {
                project: project.name.clone(),
                job: root_job.name.clone(),
                runs: root.runs.len(),
            },
        );
        let mut tree = ExecutionTree::new(root);
        let mut ignored: BTreeSet<String> = BTreeSet::new();

        // Queue entries carry the path from the root so a back edge onto an
        // ancestor is distinguishable from a diamond merge.
        let mut queue: VecDeque<(String, String, String, Vec<String>)> = VecDeque::new();
        queue.push_back((
            root_key.clone(),
            project.name.clone(),
            root_job.name.clone(),
            vec![root_key],
        ));

        while let Some((parent_key, parent_project, parent_job, path)) = queue.pop_front() {
            if token.is_cancelled() {
                return Err(ReplayError::Cancelled);
            }
            let dependents = self
                .store
                .get_dependents(&parent_project, &parent_job)
                .await
                .map_err(|e| ReplayError::Catalog(e.to_string()))?;

            for pair in dependents {
                let child_key = node_key(&pair.project.name, &pair.job.name);
                if path.iter().any(|ancestor| ancestor == &child_key) {
                    return Err(ReplayError::CycleDetected(child_key));
                }
                if !namespace_allowed(allowed_namespaces, &pair.namespace.name) {
                    debug!(job = %child_key, namespace = %pair.namespace.name, "dependent filtered out");
                    ignored.insert(child_key);
                    continue;
                }

                let runs: BTreeSet<DateTime<Utc>> =
                    enumerate_runs(&pair.job.schedule, start, end)?
                        .into_iter()
                        .collect();
                let already_visited = tree.contains(&child_key);
                let mut node = ExecutionTreeNode::new(&pair.project.name, &pair.job.name);
                node.runs = runs;
                let run_count = node.runs.len();
                tree.upsert(node);
                tree.add_dependent(&parent_key, &child_key);

                if already_visited {
                    continue;
                }
                notify(
                    observer,
                    ProgressEvent::ReplayPlanNodeAdded {
                        project: pair.project.name.clone(),
                        job: pair.job.name.clone(),
                        runs: run_count,
                    },
                );
                let mut child_path = path.clone();
                child_path.push(child_key.clone());
                queue.push_back((
                    child_key,
                    pair.project.name.clone(),
                    pair.job.name.clone(),
                    child_path,
                ));
            }
        }

        Ok(ReplayPlan {
            tree,
            ignored: ignored.into_iter().collect(),
        })
    }
}

fn namespace_allowed(allowed: &BTreeSet<String>, namespace: &str) -> bool {
    allowed.contains(ALL_NAMESPACES) || allowed.contains(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use optimus_core::{
        DependencyType, InMemoryProjectJobStore, JobBehavior, JobConfig, JobSchedule,
        JobSpecDependency, JobTask, NamespaceSpec, RecordingObserver, Window,
    };
    use std::collections::BTreeMap;

    fn job(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            owner: "owner@example.com".to_string(),
            description: String::new(),
            labels: BTreeMap::new(),
            schedule: JobSchedule {
                interval: "0 2 * * *".to_string(),
                start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end_date: None,
            },
            behavior: JobBehavior::default(),
            task: JobTask {
                unit: "bq2bq".to_string(),
                config: JobConfig::new(),
                window: Window::default(),
            },
            assets: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    fn job_depending_on(name: &str, upstreams: &[&str]) -> JobSpec {
        let mut spec = job(name);
        for upstream in upstreams {
            spec.dependencies.insert(
                upstream.to_string(),
                JobSpecDependency::declared(DependencyType::Intra),
            );
        }
        spec
    }

    fn run(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 2, 0, 0).unwrap()
    }

    fn range(from_day: u32, to_day: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, from_day, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, to_day, 23, 59, 59).unwrap(),
        )
    }

    fn seeded_store() -> Arc<InMemoryProjectJobStore> {
        let store = Arc::new(InMemoryProjectJobStore::new());
        store.add_project(ProjectSpec::new("p1")).unwrap();
        store
            .add_namespace(NamespaceSpec::new("ns1", "p1"))
            .unwrap();
        store
            .add_namespace(NamespaceSpec::new("ns2", "p1"))
            .unwrap();
        store
    }

    fn all() -> BTreeSet<String> {
        BTreeSet::from([ALL_NAMESPACES.to_string()])
    }

    fn only(namespace: &str) -> BTreeSet<String> {
        BTreeSet::from([namespace.to_string()])
    }

    #[tokio::test]
    async fn single_job_replay_enumerates_range_runs() {
        let store = seeded_store();
        store.add_job("p1", "ns1", job("a"), None).unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 3);

        let plan = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &only("ns1"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(plan.tree.len(), 1);
        assert!(plan.ignored.is_empty());
        let root = plan.tree.root().unwrap();
        assert_eq!(root.runs, [run(1), run(2), run(3)].into_iter().collect());
        assert!(root.dependents.is_empty());
    }

    #[tokio::test]
    async fn linear_downstream_chain_included() {
        let store = seeded_store();
        store.add_job("p1", "ns1", job("a"), None).unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
            .unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("c", &["b"]), None)
            .unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 2);

        let plan = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &only("ns1"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(plan.tree.len(), 3);
        assert_eq!(plan.tree.node("p1/a").unwrap().dependents, vec!["p1/b"]);
        assert_eq!(plan.tree.node("p1/b").unwrap().dependents, vec!["p1/c"]);
        for key in ["p1/a", "p1/b", "p1/c"] {
            assert_eq!(
                plan.tree.node(key).unwrap().runs,
                [run(1), run(2)].into_iter().collect()
            );
        }
    }

    #[tokio::test]
    async fn diamond_appears_once_with_union_of_runs() {
        let store = seeded_store();
        store.add_job("p1", "ns1", job("a"), None).unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
            .unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("c", &["a"]), None)
            .unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("d", &["b", "c"]), None)
            .unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 1);

        let plan = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &all(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(plan.tree.len(), 4);
        let d = plan.tree.node("p1/d").unwrap();
        assert_eq!(d.runs, [run(1)].into_iter().collect());
        assert_eq!(plan.tree.node("p1/b").unwrap().dependents, vec!["p1/d"]);
        assert_eq!(plan.tree.node("p1/c").unwrap().dependents, vec!["p1/d"]);
    }

    #[tokio::test]
    async fn namespace_filter_moves_dependents_to_ignored() {
        let store = seeded_store();
        store.add_job("p1", "ns1", job("a"), None).unwrap();
        store
            .add_job("p1", "ns2", job_depending_on("b", &["a"]), None)
            .unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 1);

        let plan = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &only("ns1"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(plan.tree.len(), 1);
        assert_eq!(plan.ignored, vec!["p1/b".to_string()]);

        let plan = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &all(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(plan.tree.len(), 2);
        assert!(plan.ignored.is_empty());
    }

    #[tokio::test]
    async fn cycle_in_dependents_fails_plan() {
        let store = seeded_store();
        // a -> b -> a
        store
            .add_job("p1", "ns1", job_depending_on("a", &["b"]), None)
            .unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
            .unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 1);

        let result = planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &all(),
                None,
            )
            .await;
        assert!(matches!(result, Err(ReplayError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn plan_emits_node_added_events() {
        let store = seeded_store();
        store.add_job("p1", "ns1", job("a"), None).unwrap();
        store
            .add_job("p1", "ns1", job_depending_on("b", &["a"]), None)
            .unwrap();
        let planner = ReplayPlanner::new(store.clone());
        let project = ProjectSpec::new("p1");
        let (start, end) = range(1, 2);
        let observer = RecordingObserver::new();

        planner
            .plan(
                &CancellationToken::new(),
                &project,
                &job("a"),
                start,
                end,
                &all(),
                Some(&observer),
            )
            .await
            .unwrap();

        let added: Vec<String> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::ReplayPlanNodeAdded { job, .. } => Some(job),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec!["a".to_string(), "b".to_string()]);
    }
}
