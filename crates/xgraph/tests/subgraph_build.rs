use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use xgraph::graph::{CompilerOutput, RuntimeArtifact, TUPLE_GET_ITEM};
use xgraph::partition::{Partitioner, TaggedPartitioner};
use xgraph::passes::{ConfigError, IdentityLayoutPass, LayoutPass};
use xgraph::{
    build, AttrValue, Attrs, BuildError, BuildOptions, Graph, GraphBuilder, GraphError, Layout,
    Node, Shapes, SubgraphBuildPass, TensorShape,
};

fn scenario() -> GraphBuilder {
    GraphBuilder::new("scenario")
        .node(Node::new("A", "Input", Shapes::tensor([1, 3, 8, 8])))
        .node(
            Node::new("B", "Convolution", Shapes::tensor([1, 4, 8, 8]))
                .with_bottoms(["A"])
                .in_partition("P1", "X"),
        )
        .node(
            Node::new("C", "Identity", Shapes::tensor([1, 4, 8, 8]))
                .with_bottoms(["B"])
                .as_output(),
        )
}

/// `x -> {p1 -> p2}` where both partition members feed nodes outside of it.
fn two_output_graph() -> Graph {
    GraphBuilder::new("two-outputs")
        .node(Node::new("x", "Input", Shapes::tensor([4])))
        .node(
            Node::new("p1", "ReLU", Shapes::tensor([4]))
                .with_bottoms(["x"])
                .in_partition("P", "dpu"),
        )
        .node(
            Node::new("p2", "Multiply", Shapes::tensor([4]))
                .with_bottoms(["p1", "p1"])
                .in_partition("P", "dpu"),
        )
        .node(Node::new("left", "Identity", Shapes::tensor([4])).with_bottoms(["p1"]))
        .node(Node::new("right", "Identity", Shapes::tensor([4])).with_bottoms(["p2"]))
        .node(
            Node::new("sum", "Add", Shapes::tensor([4]))
                .with_bottoms(["left", "right"])
                .as_output(),
        )
        .build()
        .expect("two-output graph")
}

fn strs(values: &[&str]) -> AttrValue {
    AttrValue::Strs(values.iter().map(|v| v.to_string()).collect())
}

#[test]
fn single_output_partition_becomes_collapsed_node_and_accessor() {
    let graph = scenario().build().expect("scenario graph");
    let out = build(graph, "X", "Custom", "NCHW", Attrs::new()).expect("build");

    assert_eq!(out.names(), ["A", "P1", "B", "C"]);
    out.validate().expect("rewritten graph is well formed");

    let collapsed = out.node("P1").unwrap();
    assert_eq!(collapsed.types, ["Custom"]);
    assert_eq!(collapsed.bottoms, ["A"]);
    assert_eq!(collapsed.tops, ["B"]);
    assert_eq!(
        collapsed.shapes,
        Shapes::Tuple(vec![TensorShape::new([1, 4, 8, 8])])
    );
    assert!(collapsed.subgraph.is_none());
    assert_eq!(collapsed.attr("input_names"), Some(&strs(&["A"])));
    assert_eq!(collapsed.attr("output_names"), Some(&strs(&["B"])));
    let input_layers = collapsed
        .attr("input_layers")
        .and_then(AttrValue::as_map)
        .expect("input layer snapshot");
    assert_eq!(input_layers["A"], strs(&["A"]));
    assert!(collapsed.attr("rt_in_map").is_none());

    let accessor = out.node("B").unwrap();
    assert_eq!(accessor.op_type(), TUPLE_GET_ITEM);
    assert_eq!(accessor.attr("index").and_then(AttrValue::as_int), Some(0));
    assert!(accessor.internal);
    assert_eq!(accessor.bottoms, ["P1"]);
    assert_eq!(accessor.tops, ["C"]);
    assert_eq!(accessor.shapes, Shapes::tensor([1, 4, 8, 8]));

    assert_eq!(out.node("A").unwrap().tops, ["P1"]);
    assert_eq!(out.node("C").unwrap().bottoms, ["B"]);
}

#[test]
fn reserved_attribute_is_rejected_before_any_work() {
    let graph = scenario().build().unwrap();
    let mut extra = Attrs::new();
    extra.insert("input_names".into(), strs(&["A"]));

    let err = build(graph, "X", "Custom", "NCHW", extra).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Config(ConfigError::ReservedAttribute { ref key }) if key == "input_names"
    ));
}

#[test]
fn runtime_map_keys_are_reserved_too() {
    let options = BuildOptions::new("X", "Custom").with_extra_attr("rt_out_map", "oops");
    assert_eq!(
        options.validate(),
        Err(ConfigError::ReservedAttribute {
            key: "rt_out_map".into()
        })
    );
}

#[test]
fn unsupported_layout_is_a_config_error() {
    let graph = scenario().build().unwrap();
    let err = build(graph, "X", "Custom", "NWHC", Attrs::new()).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Config(ConfigError::UnsupportedLayout { ref layout }) if layout == "NWHC"
    ));
    assert!(err.to_string().contains("NWHC"));
}

#[test]
fn build_is_idempotent_for_the_same_target() {
    let graph = two_output_graph();
    let once = build(graph, "dpu", "Custom", "NHWC", Attrs::new()).unwrap();
    let twice = build(once.clone(), "dpu", "Custom", "NHWC", Attrs::new()).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn partitions_of_other_targets_are_left_alone() {
    let graph = two_output_graph();
    let out = build(graph.clone(), "npu", "Custom", "NCHW", Attrs::new()).unwrap();
    assert_eq!(out, graph);
}

#[test]
fn multi_output_partition_gets_one_accessor_per_output() {
    let graph = two_output_graph();
    let before = graph.len();
    let (out, report) = SubgraphBuildPass::default()
        .build_with_report(graph, &BuildOptions::new("dpu", "Custom"))
        .unwrap();

    assert_eq!(report.collapsed, ["P"]);
    assert_eq!(report.consumed["P"], 2);
    assert_eq!(report.accessors, ["p1", "p2"]);
    assert_eq!(out.len(), before - 2 + 1 + 2);

    assert_eq!(out.names(), ["x", "P", "p1", "p2", "left", "right", "sum"]);
    let collapsed = out.node("P").unwrap();
    assert_eq!(collapsed.tops, ["p1", "p2"]);
    assert_eq!(collapsed.shapes.len(), 2);

    let second = out.node("p2").unwrap();
    assert_eq!(second.attr("index").and_then(AttrValue::as_int), Some(1));
    assert_eq!(second.tops, ["right"]);
    assert_eq!(out.node("left").unwrap().bottoms, ["p1"]);
    assert_eq!(out.node("x").unwrap().tops, ["P"]);
    out.validate().unwrap();
}

#[test]
fn output_marker_moves_to_the_accessor() {
    let graph = GraphBuilder::new("tail")
        .node(Node::new("x", "Input", Shapes::tensor([2])))
        .node(
            Node::new("y", "ReLU", Shapes::tensor([2]))
                .with_bottoms(["x"])
                .in_partition("P", "dpu")
                .as_output(),
        )
        .build()
        .unwrap();
    let out = build(graph, "dpu", "Custom", "NCHW", Attrs::new()).unwrap();
    assert_eq!(out.output_names(), ["y"]);
    assert!(out.node("y").unwrap().tops.is_empty());
}

#[test]
fn compiled_graph_binds_runtime_tensor_maps() {
    let mut compiled = CompilerOutput::new();
    compiled.insert(
        "P1",
        RuntimeArtifact {
            in_map: BTreeMap::from([("A".to_string(), "xinput0".to_string())]),
            out_map: BTreeMap::from([("B".to_string(), "xoutput0".to_string())]),
        },
    );
    let graph = scenario().compiler_output(compiled).build().unwrap();
    let out = build(graph, "X", "Custom", "NCHW", Attrs::new()).unwrap();

    let collapsed = out.node("P1").unwrap();
    let in_map = collapsed.attr("rt_in_map").and_then(AttrValue::as_map).unwrap();
    assert_eq!(in_map["A"].as_str(), Some("xinput0"));
    let out_map = collapsed.attr("rt_out_map").and_then(AttrValue::as_map).unwrap();
    assert_eq!(out_map["B"].as_str(), Some("xoutput0"));
    assert!(out.is_compiled());
}

#[test]
fn extra_attributes_are_copied_onto_collapsed_nodes() {
    let graph = scenario().build().unwrap();
    let mut extra = Attrs::new();
    extra.insert("platform".into(), AttrValue::from("DPUCZDX8G"));
    extra.insert("cpu_count".into(), AttrValue::from(4i64));
    let out = build(graph, "X", "Custom", "NCHW", extra).unwrap();
    let collapsed = out.node("P1").unwrap();
    assert_eq!(
        collapsed.attr("platform").and_then(AttrValue::as_str),
        Some("DPUCZDX8G")
    );
    assert_eq!(collapsed.attr("cpu_count").and_then(AttrValue::as_int), Some(4));
}

#[test]
fn non_convex_partition_surfaces_a_cycle() {
    // p and q share a partition but b sits between them.
    let graph = GraphBuilder::new("non-convex")
        .node(Node::new("a", "Input", Shapes::tensor([1])))
        .node(
            Node::new("p", "ReLU", Shapes::tensor([1]))
                .with_bottoms(["a"])
                .in_partition("P", "dpu"),
        )
        .node(Node::new("b", "Identity", Shapes::tensor([1])).with_bottoms(["p"]))
        .node(
            Node::new("q", "ReLU", Shapes::tensor([1]))
                .with_bottoms(["b"])
                .in_partition("P", "dpu"),
        )
        .node(
            Node::new("c", "Identity", Shapes::tensor([1]))
                .with_bottoms(["q"])
                .as_output(),
        )
        .build()
        .unwrap();

    let err = build(graph, "dpu", "Custom", "NCHW", Attrs::new()).unwrap_err();
    assert!(matches!(err, BuildError::Graph(GraphError::Cycle { .. })), "{err}");
}

#[test]
fn layout_pass_failure_is_reported_as_collaborator_error() {
    let layout: Arc<dyn LayoutPass> =
        Arc::new(|_: Graph, target: &str, layout: Layout| -> anyhow::Result<Graph> {
            bail!("cannot convert to {layout} for {target}")
        });
    let pass = SubgraphBuildPass::new(layout, Arc::new(TaggedPartitioner));
    let err = pass
        .build(scenario().build().unwrap(), &BuildOptions::new("X", "Custom"))
        .unwrap_err();
    match err {
        BuildError::Collaborator { stage, message } => {
            assert_eq!(stage, "layout pass");
            assert_eq!(message, "cannot convert to NCHW for X");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unreported_partition_is_an_integrity_error() {
    let partitioner: Arc<dyn Partitioner> =
        Arc::new(|_: &Graph| -> anyhow::Result<BTreeMap<String, xgraph::Partition>> {
            Ok(BTreeMap::new())
        });
    let pass = SubgraphBuildPass::new(Arc::new(IdentityLayoutPass), partitioner);
    let err = pass
        .build(scenario().build().unwrap(), &BuildOptions::new("X", "Custom"))
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Graph(GraphError::UnknownPartition { ref node, ref partition })
            if node == "B" && partition == "P1"
    ));
}

#[test]
fn partition_id_clashing_with_a_node_name_is_rejected() {
    let graph = GraphBuilder::new("clash")
        .node(Node::new("x", "Input", Shapes::tensor([2])))
        .node(Node::new("relu", "ReLU", Shapes::tensor([2])).with_bottoms(["x"]))
        .node(
            Node::new("sq", "Multiply", Shapes::tensor([2]))
                .with_bottoms(["relu", "relu"])
                .in_partition("relu", "dpu")
                .as_output(),
        )
        .build()
        .unwrap();

    let err = build(graph, "dpu", "Custom", "NCHW", Attrs::new()).unwrap_err();
    match err {
        BuildError::Graph(GraphError::InvalidPartition { partition, reason }) => {
            assert_eq!(partition, "relu");
            assert!(reason.contains("already the name of a node"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn options_load_from_json() {
    let options = BuildOptions::from_json_str(
        r#"{"target": "dpu", "collapsed_type": "XModel", "layout": "NHWC",
            "extra_attrs": {"platform": {"str": "zcu104"}}}"#,
    )
    .unwrap();
    assert_eq!(options.layout, Layout::Nhwc);
    assert_eq!(
        options.extra_attrs["platform"].as_str(),
        Some("zcu104")
    );

    let err = BuildOptions::from_json_str(r#"{"collapsed_type": "XModel"}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Malformed { .. }));
}
