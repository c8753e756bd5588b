//! Validation of work items before they are bound to a cluster.

use std::collections::{BTreeMap, HashMap, HashSet};

use graph_core::{
    Diagnostic, DeviceName, Graph, Operation, Severity, TensorRef, WorkItem, diagnostic_code,
    is_plumbing_name,
};

/// Operation kind that closes a loop back into a `Merge`.
pub const NEXT_ITERATION: &str = "NextIteration";
/// Operation kind that accepts a loop back edge.
pub const MERGE: &str = "Merge";

/// What validation needs to know about the place a work item will run.
pub trait ExecutionTarget {
    /// Whether `device` is provisioned.
    fn has_device(&self, device: &DeviceName) -> bool;

    /// Whether an operation kind can be executed.
    fn supports_kind(&self, kind: &str) -> bool;
}

/// Result of a successful validation run.
#[derive(Debug, Clone)]
pub struct ValidatedItem {
    item: WorkItem,
    placements: BTreeMap<String, DeviceName>,
    fetches: Vec<TensorRef>,
    feeds: Vec<TensorRef>,
    warnings: Vec<Diagnostic>,
}

impl ValidatedItem {
    /// Access the validated work item.
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn graph(&self) -> &Graph {
        &self.item.graph
    }

    /// Resolved device of every operation, keyed by operation name.
    pub fn placements(&self) -> &BTreeMap<String, DeviceName> {
        &self.placements
    }

    pub fn placement(&self, op: &str) -> Option<&DeviceName> {
        self.placements.get(op)
    }

    /// Parsed fetch references, in the order the item lists them.
    pub fn fetches(&self) -> &[TensorRef] {
        &self.fetches
    }

    /// Parsed feed references, aligned with `item().feeds`.
    pub fn feeds(&self) -> &[TensorRef] {
        &self.feeds
    }

    /// Non-fatal diagnostics raised during validation.
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    /// Consume the validated wrapper and return the underlying work item.
    pub fn into_inner(self) -> WorkItem {
        self.item
    }
}

/// Validate a work item against an execution target and return diagnostics if
/// issues are discovered.
pub fn validate(
    item: &WorkItem,
    target: &dyn ExecutionTarget,
) -> Result<ValidatedItem, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    check_duplicate_names(&item.graph, &mut diagnostics);
    check_input_references(&item.graph, &mut diagnostics);
    check_cycles(&item.graph, &mut diagnostics);
    check_kernels(&item.graph, target, &mut diagnostics);
    let placements = check_placements(&item.graph, target, &mut diagnostics);
    let fetches = check_tensor_refs(&item.graph, &item.fetches, "GRAPH204", "fetch", &mut diagnostics);
    let feed_names: Vec<String> = item.feeds.iter().map(|feed| feed.name.clone()).collect();
    let feeds = check_tensor_refs(&item.graph, &feed_names, "GRAPH206", "feed", &mut diagnostics);
    check_op_names(&item.graph, &item.init_ops, "GRAPH207", "init op", &mut diagnostics);
    for runner in &item.queue_runners {
        let mut names = vec![runner.queue.clone()];
        names.extend(runner.enqueue_ops.iter().cloned());
        check_op_names(&item.graph, &names, "GRAPH208", "queue runner", &mut diagnostics);
    }
    if item.fetches.is_empty() && item.init_ops.is_empty() {
        diagnostics.push(diagnostic(
            "GRAPH211",
            format!("work item `{}` requests no fetches", item.id),
        ));
    }

    let (errors, warnings): (Vec<_>, Vec<_>) = diagnostics
        .into_iter()
        .partition(|diag| diag.code.default_severity == Severity::Error);
    if errors.is_empty() {
        Ok(ValidatedItem {
            item: item.clone(),
            placements,
            fetches,
            feeds,
            warnings,
        })
    } else {
        Err(errors)
    }
}

fn check_duplicate_names(graph: &Graph, diagnostics: &mut Vec<Diagnostic>) {
    let mut seen = HashSet::new();
    for op in graph.operations() {
        if !seen.insert(op.name()) {
            diagnostics.push(
                diagnostic("GRAPH205", format!("duplicate operation name `{}`", op.name()))
                    .with_location(op.name()),
            );
        }
    }
}

fn check_input_references(graph: &Graph, diagnostics: &mut Vec<Diagnostic>) {
    let names: HashSet<_> = graph.operations().iter().map(Operation::name).collect();
    for op in graph.operations() {
        for input in op.inputs() {
            if !names.contains(input.node()) {
                diagnostics.push(
                    diagnostic(
                        "GRAPH201",
                        format!("input `{input}` of `{}` references an undefined operation", op.name()),
                    )
                    .with_location(op.name()),
                );
            }
        }
    }
}

/// Edges that may close a cycle: a `NextIteration` feeding a `Merge`.
pub fn is_back_edge(source: &Operation, target: &Operation) -> bool {
    source.kind() == NEXT_ITERATION && target.kind() == MERGE
}

fn check_cycles(graph: &Graph, diagnostics: &mut Vec<Diagnostic>) {
    let ops: HashMap<&str, &Operation> = graph
        .operations()
        .iter()
        .map(|op| (op.name(), op))
        .collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for op in graph.operations() {
        for input in op.inputs() {
            let Some(source) = ops.get(input.node()) else {
                continue;
            };
            if is_back_edge(source, op) {
                continue;
            }
            adjacency.entry(source.name()).or_default().push(op.name());
        }
    }

    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();

    for op in graph.operations() {
        if dfs_cycle(op.name(), &adjacency, &mut visiting, &mut visited) {
            diagnostics.push(
                diagnostic(
                    "GRAPH200",
                    "cycle detected that is not closed by a NextIteration -> Merge edge",
                )
                .with_location(op.name()),
            );
            break;
        }
    }
}

fn dfs_cycle<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    visiting: &mut HashSet<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> bool {
    if visiting.contains(node) {
        return true;
    }
    if visited.contains(node) {
        return false;
    }

    visiting.insert(node);
    if let Some(neighbours) = adjacency.get(node) {
        for &next in neighbours {
            if dfs_cycle(next, adjacency, visiting, visited) {
                return true;
            }
        }
    }
    visiting.remove(node);
    visited.insert(node);
    false
}

fn check_kernels(graph: &Graph, target: &dyn ExecutionTarget, diagnostics: &mut Vec<Diagnostic>) {
    for op in graph.operations() {
        if !target.supports_kind(op.kind()) {
            diagnostics.push(
                diagnostic(
                    "GRAPH210",
                    format!("no kernel registered for `{}` (operation `{}`)", op.kind(), op.name()),
                )
                .with_location(op.name()),
            );
        }
    }
}

fn check_placements(
    graph: &Graph,
    target: &dyn ExecutionTarget,
    diagnostics: &mut Vec<Diagnostic>,
) -> BTreeMap<String, DeviceName> {
    let mut placements = BTreeMap::new();
    for op in graph.operations() {
        match DeviceName::parse(op.device()) {
            Ok(device) if target.has_device(&device) => {
                placements.insert(op.name().to_string(), device);
            }
            Ok(device) => diagnostics.push(
                diagnostic(
                    "GRAPH202",
                    format!("operation `{}` is placed on unknown device `{device}`", op.name()),
                )
                .with_location(op.name()),
            ),
            Err(err) => diagnostics.push(
                diagnostic("GRAPH203", format!("operation `{}`: {err}", op.name()))
                    .with_location(op.name()),
            ),
        }
    }
    placements
}

fn check_tensor_refs(
    graph: &Graph,
    names: &[String],
    unknown_code: &str,
    what: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<TensorRef> {
    let mut refs = Vec::with_capacity(names.len());
    for name in names {
        match TensorRef::parse(name) {
            Ok(tensor) => {
                if !is_plumbing_name(&tensor.node) && !graph.contains(&tensor.node) {
                    diagnostics.push(
                        diagnostic(
                            unknown_code,
                            format!("{what} `{name}` references an unknown operation"),
                        )
                        .with_location(name.as_str()),
                    );
                }
                refs.push(tensor);
            }
            Err(err) => diagnostics.push(
                diagnostic("GRAPH209", format!("{what} `{name}`: {err}"))
                    .with_location(name.as_str()),
            ),
        }
    }
    refs
}

fn check_op_names(
    graph: &Graph,
    names: &[String],
    code: &str,
    what: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for name in names {
        if !graph.contains(name) {
            diagnostics.push(
                diagnostic(code, format!("{what} `{name}` references an unknown operation"))
                    .with_location(name.as_str()),
            );
        }
    }
}

fn diagnostic(code: &str, message: impl Into<String>) -> Diagnostic {
    let entry =
        diagnostic_code(code).unwrap_or_else(|| panic!("unknown diagnostic code `{code}`"));
    Diagnostic::new(entry, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_core::prelude::*;
    use graph_core::{DeviceKind, QueueRunner};

    struct LocalTarget {
        devices: Vec<DeviceName>,
    }

    impl LocalTarget {
        fn cpus(count: u32) -> Self {
            Self {
                devices: (0..count)
                    .map(|index| DeviceName::local(DeviceKind::Cpu, index))
                    .collect(),
            }
        }
    }

    impl ExecutionTarget for LocalTarget {
        fn has_device(&self, device: &DeviceName) -> bool {
            self.devices.contains(device)
        }

        fn supports_kind(&self, kind: &str) -> bool {
            kind != "Unsupported"
        }
    }

    fn sample_item() -> WorkItem {
        let mut builder = GraphBuilder::new().default_device("/cpu:0");
        let x = builder
            .op("x", "Const")
            .attr("value", Tensor::scalar_f32(1.0))
            .finish()
            .expect("add x");
        builder
            .op("y", "Identity")
            .input(x.output(0))
            .device("/cpu:1")
            .finish()
            .expect("add y");
        WorkItem::new("sample", builder.build()).with_fetch("y")
    }

    fn codes(diagnostics: &[Diagnostic]) -> Vec<&'static str> {
        diagnostics.iter().map(|d| d.code.code).collect()
    }

    #[test]
    fn validate_accepts_well_formed_item() {
        let validated = validate(&sample_item(), &LocalTarget::cpus(2)).expect("valid item");
        assert_eq!(
            validated.placement("y"),
            Some(&DeviceName::local(DeviceKind::Cpu, 1))
        );
        assert_eq!(validated.fetches(), &[TensorRef::new("y", 0)]);
        assert!(validated.warnings().is_empty());
    }

    #[test]
    fn detect_unknown_device() {
        let diagnostics = validate(&sample_item(), &LocalTarget::cpus(1))
            .err()
            .expect("expected placement diagnostic");
        assert_eq!(codes(&diagnostics), vec!["GRAPH202"]);
        assert_eq!(diagnostics[0].location.as_deref(), Some("y"));
    }

    #[test]
    fn detect_dangling_inputs_and_unknown_references() {
        let mut builder = GraphBuilder::new();
        builder
            .op("y", "Identity")
            .input("missing:1")
            .finish()
            .expect("add y");
        let item = WorkItem::new("dangling", builder.build())
            .with_fetch("nope")
            .with_fetch("_retval_y_0")
            .with_init_op("init")
            .with_queue_runner(QueueRunner::new("q", Vec::<String>::new()));
        let diagnostics = validate(&item, &LocalTarget::cpus(1))
            .err()
            .expect("expected diagnostics");
        let codes = codes(&diagnostics);
        assert!(codes.contains(&"GRAPH201"));
        assert!(codes.contains(&"GRAPH204"));
        assert!(codes.contains(&"GRAPH207"));
        assert!(codes.contains(&"GRAPH208"));
        assert_eq!(codes.iter().filter(|code| **code == "GRAPH204").count(), 1);
    }

    #[test]
    fn loop_back_edges_are_not_cycles() {
        let mut builder = GraphBuilder::new();
        builder
            .op("enter", "Enter")
            .input("zero")
            .finish()
            .expect("enter");
        builder
            .op("zero", "Const")
            .attr("value", Tensor::scalar_i32(0))
            .finish()
            .expect("zero");
        builder
            .op("merge", "Merge")
            .input("enter")
            .input("next")
            .finish()
            .expect("merge");
        builder
            .op("next", "NextIteration")
            .input("merge")
            .finish()
            .expect("next");
        let item = WorkItem::new("loop", builder.build()).with_fetch("merge");
        assert!(validate(&item, &LocalTarget::cpus(1)).is_ok());
    }

    #[test]
    fn detect_cycles() {
        let mut builder = GraphBuilder::new();
        builder.op("a", "Identity").input("b").finish().expect("a");
        builder.op("b", "Identity").input("^a").finish().expect("b");
        let item = WorkItem::new("cycle", builder.build()).with_fetch("a");
        let diagnostics = validate(&item, &LocalTarget::cpus(1))
            .err()
            .expect("expected cycle diagnostic");
        assert!(codes(&diagnostics).contains(&"GRAPH200"));
    }

    #[test]
    fn detect_malformed_device_and_unsupported_kind() {
        let mut builder = GraphBuilder::new();
        builder
            .op("a", "Unsupported")
            .device("/device:TPU:0")
            .finish()
            .expect("a");
        let item = WorkItem::new("bad", builder.build()).with_fetch("a");
        let diagnostics = validate(&item, &LocalTarget::cpus(1))
            .err()
            .expect("expected diagnostics");
        let codes = codes(&diagnostics);
        assert!(codes.contains(&"GRAPH203"));
        assert!(codes.contains(&"GRAPH210"));
    }

    #[test]
    fn empty_item_only_warns() {
        let mut builder = GraphBuilder::new();
        builder.op("a", "NoOp").finish().expect("a");
        let validated =
            validate(&WorkItem::new("idle", builder.build()), &LocalTarget::cpus(1)).expect("ok");
        assert_eq!(codes(validated.warnings()), vec!["GRAPH211"]);
    }
}
